//! Logging Module
//!
//! `tracing` setup for the CLI plus the per-round progress logger used by the
//! round driver. Logs go to stderr so command output on stdout stays clean.

use std::time::Instant;

use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::training::Phase;
use crate::utils::error::{MilError, Result};

/// Logging configuration chosen from the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Level for this crate's own events
    pub level: Level,
    /// Show module paths and thread ids
    pub detailed: bool,
    /// Use `RUST_LOG` when it is set
    pub respect_env: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            detailed: false,
            respect_env: true,
        }
    }
}

impl LogConfig {
    /// Resolve `--verbose`, `--quiet` and `--log-level`
    ///
    /// An explicit level wins over both flags and over `RUST_LOG`.
    pub fn from_flags(verbose: bool, quiet: bool, level: Option<&str>) -> Result<Self> {
        if verbose && quiet {
            return Err(MilError::Config("--verbose and --quiet are mutually exclusive".to_string()));
        }

        let mut config = Self::default();
        if verbose {
            config.level = Level::DEBUG;
            config.detailed = true;
        } else if quiet {
            config.level = Level::ERROR;
        }

        if let Some(level) = level {
            config.level = level
                .parse()
                .map_err(|_| MilError::Config(format!("unknown log level '{}'", level)))?;
            config.respect_env = false;
        }
        Ok(config)
    }

    fn filter(&self) -> EnvFilter {
        let directive = format!("ultrasound_mil={}", self.level.as_str().to_ascii_lowercase());
        if self.respect_env {
            if let Ok(filter) = EnvFilter::try_from_default_env() {
                return filter;
            }
        }
        EnvFilter::new(directive)
    }
}

/// Install the global subscriber
pub fn init_logging(config: &LogConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(config.filter())
        .with_writer(std::io::stderr)
        .with_target(config.detailed)
        .with_thread_ids(config.detailed)
        .compact()
        .try_init()
        .map_err(|e| MilError::Config(format!("failed to initialize logging: {}", e)))
}

/// Round progress logger for the self-training loop
pub struct RoundLogger {
    /// Current round
    round: usize,
    /// Total rounds
    total_rounds: usize,
    /// Round start time
    round_start: Instant,
    /// Training start time
    training_start: Instant,
}

impl RoundLogger {
    /// Create a new round logger
    pub fn new(total_rounds: usize) -> Self {
        Self {
            round: 0,
            total_rounds,
            round_start: Instant::now(),
            training_start: Instant::now(),
        }
    }

    /// Log start of a round
    pub fn start_round(&mut self, round: usize, phase: Phase, ratio: f64) {
        self.round = round;
        self.round_start = Instant::now();

        tracing::info!(
            "Round {}/{} started | phase: {} | selection ratio: {:.3}",
            round + 1,
            self.total_rounds,
            phase,
            ratio
        );
    }

    /// Log the instance view that will be trained on this round
    pub fn log_view(&self, train_examples: usize, unconfident: usize, batches: usize) {
        tracing::info!(
            "Instance view: {} examples ({} unconfident-origin), {} batches",
            train_examples,
            unconfident,
            batches
        );
    }

    /// Log end of a round with both validation losses
    pub fn end_round(&self, instance_loss: f64, bag_loss: f64) {
        let round_time = self.round_start.elapsed();
        let total_time = self.training_start.elapsed();

        let rounds_remaining = self.total_rounds.saturating_sub(self.round + 1);
        let avg_round_time = total_time.as_secs_f64() / (self.round + 1) as f64;
        let eta_secs = rounds_remaining as f64 * avg_round_time;

        tracing::info!(
            "Round {}/{} completed in {} | instance val loss: {:.4} | bag val loss: {:.4} | ETA: {}",
            self.round + 1,
            self.total_rounds,
            super::format_duration(round_time.as_secs_f64()),
            instance_loss,
            bag_loss,
            super::format_duration(eta_secs)
        );
    }

    /// Log a new best validation loss for one sub-objective
    pub fn log_new_best(&self, objective: &str, loss: f64) {
        tracing::info!("New best {} validation loss: {:.4}", objective, loss);
    }

    /// Log the irreversible warmup exit
    pub fn log_warmup_finished(&self) {
        tracing::info!("Warmup phase finished after round {}", self.round + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_flags_resolve_level() {
        assert_eq!(LogConfig::from_flags(false, false, None).unwrap(), LogConfig::default());

        let verbose = LogConfig::from_flags(true, false, None).unwrap();
        assert_eq!(verbose.level, Level::DEBUG);
        assert!(verbose.detailed);

        assert_eq!(LogConfig::from_flags(false, true, None).unwrap().level, Level::ERROR);

        let explicit = LogConfig::from_flags(false, true, Some("warn")).unwrap();
        assert_eq!(explicit.level, Level::WARN);
        assert!(!explicit.respect_env);
    }

    #[test]
    fn test_bad_log_flags_are_config_errors() {
        assert!(LogConfig::from_flags(true, true, None).unwrap_err().is_config());
        assert!(LogConfig::from_flags(false, false, Some("loud")).unwrap_err().is_config());
    }

    #[test]
    fn test_round_logger_tracks_round() {
        let mut logger = RoundLogger::new(10);
        logger.start_round(3, Phase::Warmup, 0.0);
        assert_eq!(logger.round, 3);
    }
}
