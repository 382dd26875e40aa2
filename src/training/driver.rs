//! Round Driver
//!
//! Runs the self-training loop one round at a time:
//!
//! 1. Build the training instance view from the previous round's mask in
//!    the current phase (the validation view is always built as in warmup)
//! 2. Form batches: balanced during warmup if configured, shuffled otherwise
//! 3. Train the instance encoder, then the bag aggregator
//! 4. Build the next mask from the aggregator's fresh scores with `ratio(r + 1)`
//! 5. Advance the phase and checkpoint if either validation loss improved
//!
//! The driver never mutates a `RoundState` in place: every round takes the
//! previous state by reference and returns the next one.

use std::path::PathBuf;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{info, warn};

use super::checkpoint::{Checkpoint, CheckpointManager};
use super::config::SelfTrainingConfig;
use super::sampler::{sample_batches, shuffled_batches, IndexBatch};
use super::selection::{build_mask, ConfidenceScores, MaskSummary, SelectionMask};
use super::state::{Phase, RoundState};
use crate::dataset::bag::BagStore;
use crate::dataset::balance::oversample_minority;
use crate::dataset::instance_view::{build_instance_view, InstanceView};
use crate::dataset::loader::{load_bags, BagSplits};
use crate::utils::error::{MilError, Result};
use crate::utils::logging::RoundLogger;

/// Instance-level encoder trained on each round's instance view
pub trait InstanceEncoder {
    /// Train on `batches` of `train` and return the validation loss on `validation`
    fn train_round(&mut self, train: &InstanceView, batches: &[IndexBatch], validation: &InstanceView) -> Result<f64>;
}

/// Bag-level aggregator producing per-instance scores
pub trait BagAggregator {
    /// Train on the bag stores and score every instance of both
    fn train_round(&mut self, train: &BagStore, validation: &BagStore) -> Result<AggregationOutcome>;
}

/// Result of one aggregator pass
#[derive(Debug, Clone, Default)]
pub struct AggregationOutcome {
    pub validation_loss: f64,
    /// Per-instance scores for training and validation bags
    pub scores: ConfidenceScores,
}

/// Training inputs for one round, before any model is involved
#[derive(Debug, Clone, Serialize)]
pub struct RoundPlan {
    pub round: usize,
    pub phase: Phase,
    pub train_view: InstanceView,
    pub validation_view: InstanceView,
    pub batches: Vec<IndexBatch>,
}

/// Outcome of a completed round
#[derive(Debug, Clone)]
pub struct RoundReport {
    /// State to feed into the next round
    pub state: RoundState,
    /// Ratio used for the mask carried into the next round
    pub ratio: f64,
    pub train_examples: usize,
    pub unconfident_examples: usize,
    pub validation_examples: usize,
    pub batches: usize,
    pub instance_loss: f64,
    pub bag_loss: f64,
    pub instance_improved: bool,
    pub bag_improved: bool,
    pub mask: MaskSummary,
    /// Checkpoint written for this round, if any
    pub checkpoint: Option<PathBuf>,
}

impl RoundReport {
    /// Whether either validation loss improved
    pub fn improved(&self) -> bool {
        self.instance_improved || self.bag_improved
    }
}

/// Owns the bag stores and the schedule for a run
pub struct RoundDriver {
    config: SelfTrainingConfig,
    train: BagStore,
    validation: BagStore,
    checkpoints: CheckpointManager,
}

impl RoundDriver {
    /// Create a driver over already-loaded splits
    ///
    /// Oversamples the training split's minority class when configured.
    pub fn new(config: SelfTrainingConfig, splits: BagSplits) -> Result<Self> {
        config.validate()?;

        let splits = if config.data.oversample {
            BagSplits {
                train: oversample_minority(&splits.train, &splits.validation, config.seed)?,
                validation: splits.validation,
            }
        } else {
            splits
        };
        splits.ensure_disjoint()?;
        let BagSplits { train, validation } = splits;

        let keep = match config.checkpoint.keep_last_n {
            0 => None,
            n => Some(n),
        };
        let checkpoints = CheckpointManager::new(config.checkpoint.dir.clone()).keep_last_n(keep);

        info!(
            "Round driver ready: {} training bags, {} validation bags",
            train.len(),
            validation.len()
        );
        info!("{}", config.schedule.description());

        Ok(Self {
            config,
            train,
            validation,
            checkpoints,
        })
    }

    /// Load the bag table named in `config` and create a driver
    pub fn from_config(config: SelfTrainingConfig) -> Result<Self> {
        config.validate()?;
        let splits = load_bags(&config.data)?;
        Self::new(config, splits)
    }

    pub fn config(&self) -> &SelfTrainingConfig {
        &self.config
    }

    pub fn train_store(&self) -> &BagStore {
        &self.train
    }

    pub fn validation_store(&self) -> &BagStore {
        &self.validation
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Resume from `latest.json` if it exists, otherwise start at round zero
    pub fn resume_or_start(&self) -> Result<RoundState> {
        if !self.checkpoints.has_latest() {
            info!("No checkpoint in {:?}; starting from round 0", self.checkpoints.checkpoint_dir());
            return Ok(RoundState::initial(self.config.schedule.warmup_rounds));
        }

        let checkpoint = self.checkpoints.load_latest()?;
        if checkpoint.schedule != self.config.schedule {
            warn!(
                "Checkpoint schedule differs from configuration ({} vs {})",
                checkpoint.schedule.description(),
                self.config.schedule.description()
            );
        }

        info!(
            "Resuming at round {} ({}) from checkpoint written {}",
            checkpoint.state.round, checkpoint.state.phase, checkpoint.timestamp
        );
        Ok(checkpoint.state)
    }

    /// Build the views and batches for the round `state` is about to run
    pub fn plan_round(&self, state: &RoundState) -> Result<RoundPlan> {
        let train_view = build_instance_view(&self.train, &state.selection_mask, state.phase);
        let validation_view = build_instance_view(&self.validation, &state.selection_mask, Phase::Warmup);

        let batch_size = self.config.instance.batch_size;
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed.wrapping_add(state.round as u64));

        let batches = if state.phase.is_warmup() && self.config.instance.balanced_warmup {
            sample_batches(&train_view, batch_size, &mut rng)?
        } else {
            shuffled_batches(train_view.len(), batch_size, &mut rng)?
        };

        Ok(RoundPlan {
            round: state.round,
            phase: state.phase,
            train_view,
            validation_view,
            batches,
        })
    }

    /// Build the mask the next round will train with
    pub fn next_mask(&self, scores: &ConfidenceScores, next_round: usize) -> (SelectionMask, f64) {
        for (bag_id, _) in scores.iter() {
            if !self.train.contains(bag_id) && !self.validation.contains(bag_id) {
                warn!("Scores for bag {} which is not in the bag store", bag_id);
            }
        }
        let unscored = self.train.iter().filter(|b| scores.get(&b.id).is_none()).count();
        if unscored > 0 {
            warn!("{} training bags have no scores and stay unselected", unscored);
        }

        let ratio = self.config.schedule.ratio(next_round);
        (build_mask(scores, ratio, self.config.selection.score_kind), ratio)
    }

    /// Run one round starting from `state`
    pub fn run_round(
        &self,
        state: &RoundState,
        encoder: &mut dyn InstanceEncoder,
        aggregator: &mut dyn BagAggregator,
    ) -> Result<RoundReport> {
        let mut logger = RoundLogger::new(self.config.schedule.total_rounds);
        self.execute_round(state, encoder, aggregator, &mut logger)
    }

    fn execute_round(
        &self,
        state: &RoundState,
        encoder: &mut dyn InstanceEncoder,
        aggregator: &mut dyn BagAggregator,
        logger: &mut RoundLogger,
    ) -> Result<RoundReport> {
        let round = state.round;
        logger.start_round(round, state.phase, self.config.schedule.ratio(round));

        let plan = self.plan_round(state)?;
        let unconfident_examples = plan.train_view.unconfident_indices().len();
        logger.log_view(plan.train_view.len(), unconfident_examples, plan.batches.len());

        let instance_loss = encoder.train_round(&plan.train_view, &plan.batches, &plan.validation_view)?;
        let outcome = aggregator.train_round(&self.train, &self.validation)?;
        let bag_loss = outcome.validation_loss;

        let (mask, ratio) = self.next_mask(&outcome.scores, round + 1);
        let mask_summary = mask.summary();
        info!("Selection for round {}: {}", round + 2, mask_summary);

        let instance_improved = state.improves_instance(instance_loss);
        let bag_improved = state.improves_bag(bag_loss);
        let phase = state.phase.after_round(round, self.config.schedule.warmup_rounds);

        let next = RoundState {
            round: round + 1,
            phase,
            best_instance_loss: if instance_improved {
                Some(instance_loss)
            } else {
                state.best_instance_loss
            },
            best_bag_loss: if bag_improved { Some(bag_loss) } else { state.best_bag_loss },
            selection_mask: mask,
        };

        logger.end_round(instance_loss, bag_loss);
        if instance_improved {
            logger.log_new_best("instance", instance_loss);
        }
        if bag_improved {
            logger.log_new_best("bag", bag_loss);
        }
        if state.phase.is_warmup() && !phase.is_warmup() {
            logger.log_warmup_finished();
        }

        let checkpoint = if instance_improved || bag_improved {
            let note = format!("instance loss {:.4}, bag loss {:.4}", instance_loss, bag_loss);
            let checkpoint = Checkpoint::new(next.clone(), self.config.schedule.clone()).with_note(note);
            match self.checkpoints.save_checkpoint(&checkpoint) {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("Skipping checkpoint for round {}: {}", round + 1, e);
                    None
                }
            }
        } else {
            None
        };

        Ok(RoundReport {
            state: next,
            ratio,
            train_examples: plan.train_view.len(),
            unconfident_examples,
            validation_examples: plan.validation_view.len(),
            batches: plan.batches.len(),
            instance_loss,
            bag_loss,
            instance_improved,
            bag_improved,
            mask: mask_summary,
            checkpoint,
        })
    }

    /// Run rounds until `total_rounds`
    ///
    /// Configuration errors abort at once. Any other failure is retried once
    /// from the same state before the run is aborted.
    pub fn run(
        &self,
        state: RoundState,
        encoder: &mut dyn InstanceEncoder,
        aggregator: &mut dyn BagAggregator,
    ) -> Result<RoundState> {
        let total_rounds = self.config.schedule.total_rounds;
        let mut logger = RoundLogger::new(total_rounds);
        let mut state = state;

        while state.round < total_rounds {
            let report = match self.execute_round(&state, encoder, aggregator, &mut logger) {
                Ok(report) => report,
                Err(e) if e.is_config() => return Err(e),
                Err(e) => {
                    warn!("Round {} failed: {}; retrying once", state.round + 1, e);
                    self.execute_round(&state, encoder, aggregator, &mut logger)
                        .map_err(|e| MilError::Training(format!("round {} failed twice: {}", state.round + 1, e)))?
                }
            };
            state = report.state;
        }

        info!("Self-training finished after {} rounds", state.round);
        Ok(state)
    }
}
