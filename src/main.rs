//! Ultrasound MIL Self-Training CLI
//!
//! Inspects bag tables, prints selection schedules, and plans individual
//! rounds from aggregator score files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use tracing::info;

use ultrasound_mil::training::checkpoint::CheckpointManager;
use ultrasound_mil::training::driver::RoundPlan;
use ultrasound_mil::training::selection::{build_mask, MaskSummary};
use ultrasound_mil::utils::logging::{init_logging, LogConfig};
use ultrasound_mil::utils::{format_progress_bar, format_share};
use ultrasound_mil::{ConfidenceScores, Phase, RoundDriver, RoundState, SelfTrainingConfig};

/// Weakly-supervised multiple-instance self-training for ultrasound studies
#[derive(Parser, Debug)]
#[command(name = "ultrasound_mil")]
#[command(author = "Warre Snaet")]
#[command(version = "0.1.0")]
#[command(about = "Selection-mask and pseudo-label scheduling for MIL self-training", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, default_value = "false")]
    quiet: bool,

    /// Explicit log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load the bag table and show split statistics
    Inspect {
        /// Path to the TOML configuration
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },

    /// Print the selection ratio for every round
    Schedule {
        /// Path to the TOML configuration
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },

    /// Build the mask, instance view, and batches for one round
    Plan {
        /// Path to the TOML configuration
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// JSON score file: [{"bag_id": .., "scores": [..]}, ..]
        #[arg(short, long)]
        scores: PathBuf,

        /// Round to plan (0-based)
        #[arg(short, long)]
        round: usize,

        /// Write the plan as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the latest checkpoint
    Checkpoint {
        /// Checkpoint directory
        #[arg(short, long, default_value = "checkpoints")]
        dir: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = LogConfig::from_flags(cli.verbose, cli.quiet, cli.log_level.as_deref())?;
    init_logging(&log_config)?;

    match cli.command {
        Commands::Inspect { config } => cmd_inspect(&config)?,
        Commands::Schedule { config } => cmd_schedule(&config)?,
        Commands::Plan {
            config,
            scores,
            round,
            output,
        } => cmd_plan(&config, &scores, round, output.as_deref())?,
        Commands::Checkpoint { dir } => cmd_checkpoint(&dir)?,
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<SelfTrainingConfig> {
    SelfTrainingConfig::load(path).with_context(|| format!("Failed to load config file: {}", path.display()))
}

fn cmd_inspect(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let driver = RoundDriver::from_config(config).context("Failed to load bags")?;

    for (name, store) in [("Training", driver.train_store()), ("Validation", driver.validation_store())] {
        let stats = store.stats();
        println!("{}", format!("{} bags:", name).cyan().bold());
        println!("  Bags:      {}", stats.bags);
        println!("  Positive:  {}", format_share(stats.positive_bags, stats.bags));
        println!("  Negative:  {}", format_share(stats.negative_bags, stats.bags));
        println!("  Instances: {}", stats.instances);
        println!("  Weakly labeled: {}", format_share(stats.labeled_instances, stats.instances));
        println!();
    }

    Ok(())
}

fn cmd_schedule(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let schedule = &config.schedule;

    println!("{}", schedule.description().cyan().bold());
    for round in 0..schedule.total_rounds {
        let ratio = schedule.ratio(round);
        let phase = if schedule.in_warmup(round) {
            "warmup".yellow()
        } else {
            "steady".green()
        };
        println!("  {:>5} {:>7} {}", round, phase, format_progress_bar(ratio, 30));
    }

    Ok(())
}

#[derive(Serialize)]
struct PlanReport {
    ratio: f64,
    mask: MaskSummary,
    plan: RoundPlan,
}

fn cmd_plan(config_path: &Path, scores_path: &Path, round: usize, output: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let driver = RoundDriver::from_config(config).context("Failed to load bags")?;
    let schedule = &driver.config().schedule;

    let scores = ConfidenceScores::load_json(scores_path)
        .with_context(|| format!("Failed to read scores: {}", scores_path.display()))?;
    info!("Loaded scores for {} bags ({} instances)", scores.len(), scores.instance_count());

    // The mask a round trains with was built at the end of the previous round with ratio(round)
    let ratio = schedule.ratio(round);
    let mask = build_mask(&scores, ratio, driver.config().selection.score_kind);
    let summary = mask.summary();

    let mut state = RoundState::initial(schedule.warmup_rounds);
    state.round = round;
    if !schedule.in_warmup(round) {
        state.phase = Phase::SteadyState;
    }
    state.selection_mask = mask;

    let plan = driver.plan_round(&state)?;
    let view_stats = plan.train_view.stats();

    println!("{}", format!("Round {} ({})", round, plan.phase).cyan().bold());
    println!("  Selection ratio: {:.3}", ratio);
    println!("  {}", summary);
    println!("  Training examples: {}", view_stats.examples);
    println!("    ground truth:  {}", format_share(view_stats.ground_truth, view_stats.examples));
    println!("    selected:      {}", format_share(view_stats.selected, view_stats.examples));
    println!("    negative bag:  {}", format_share(view_stats.negative_bag, view_stats.examples));
    println!("    positive bag:  {}", format_share(view_stats.positive_bag, view_stats.examples));
    println!("  Validation examples: {}", plan.validation_view.len());
    println!("  Batches: {}", plan.batches.len());

    if let Some(path) = output {
        let report = PlanReport {
            ratio,
            mask: summary,
            plan,
        };
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write plan: {}", path.display()))?;
        println!("{} Plan written to {}", "✓".green(), path.display());
    }

    Ok(())
}

fn cmd_checkpoint(dir: &Path) -> Result<()> {
    let manager = CheckpointManager::new(dir);
    if !manager.has_latest() {
        println!("{} No checkpoint found in {}", "Note:".yellow(), dir.display());
        return Ok(());
    }

    let checkpoint = manager.load_latest()?;
    let state = &checkpoint.state;

    println!("{}", "Latest checkpoint:".cyan().bold());
    println!("  Written:   {}", checkpoint.timestamp);
    println!("  Next round: {}", state.round);
    println!("  Phase:     {}", state.phase);
    println!("  Best instance loss: {}", format_loss(state.best_instance_loss));
    println!("  Best bag loss:      {}", format_loss(state.best_bag_loss));
    println!("  Selection: {}", state.selection_mask.summary());
    println!("  Schedule:  {}", checkpoint.schedule.description());
    if let Some(note) = &checkpoint.note {
        println!("  Note:      {}", note);
    }

    let rounds = manager.list_checkpoints()?;
    println!("  Round files kept: {}", rounds.len());

    Ok(())
}

fn format_loss(loss: Option<f64>) -> String {
    loss.map_or_else(|| "-".to_string(), |l| format!("{:.4}", l))
}
