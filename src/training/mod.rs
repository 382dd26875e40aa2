//! Training module for multiple-instance self-training
//!
//! This module provides:
//! - Selection ratio scheduling
//! - Selection mask construction from aggregator scores
//! - Balanced batch sampling for warmup
//! - Round state, checkpointing, and the round driver
//!
//! ## Self-Training Loop
//!
//! Each round:
//! 1. Train the instance encoder on the current instance view
//! 2. Train the bag aggregator and collect per-instance scores
//! 3. Trust the most confident fraction of instances as pseudo-labels
//! 4. Rebuild the instance view for the next round from that selection
//!
//! The trusted fraction grows from the initial to the final ratio once
//! warmup is over.

pub mod checkpoint;
pub mod config;
pub mod driver;
pub mod sampler;
pub mod scheduler;
pub mod selection;
pub mod state;

// Re-export main types for convenience
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use config::{CheckpointConfig, InstanceConfig, SelectionConfig, SelfTrainingConfig};
pub use driver::{AggregationOutcome, BagAggregator, InstanceEncoder, RoundDriver, RoundPlan, RoundReport};
pub use sampler::{sample_batches, shuffled_batches, BalancedBatchSampler, IndexBatch};
pub use scheduler::{ratio, RatioCurve, RatioScheduler};
pub use selection::{build_mask, ConfidenceScores, MaskSummary, ScoreKind, SelectionMask, SelectionStatus};
pub use state::{Phase, RoundState};
