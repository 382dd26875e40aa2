//! # Ultrasound MIL Self-Training
//!
//! A Rust library for weakly-supervised multiple-instance self-training on
//! ultrasound studies. Each patient study is a bag of images with a
//! study-level label; most images carry no label of their own.
//!
//! ## Features
//!
//! - **Ratio scheduling** of how many model pseudo-labels are trusted per round
//! - **Selection masks** picking the globally most confident instances
//! - **Instance views** that never inherit positive labels from positive bags
//! - **Balanced warmup batches** mixing unconfident and confident examples
//! - **Round driver** with checkpoint/resume, driving caller-supplied models
//!
//! ## Modules
//!
//! - `dataset`: Bag store, tabular loading, oversampling, instance views, Burn adapter
//! - `training`: Scheduler, selection, sampler, round state, checkpoints, driver
//! - `utils`: Logging, error handling, and helper functions
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ultrasound_mil::{RoundDriver, SelfTrainingConfig};
//!
//! let config = SelfTrainingConfig::load("config.toml".as_ref())?;
//! let driver = RoundDriver::from_config(config)?;
//! let state = driver.resume_or_start()?;
//! let final_state = driver.run(state, &mut encoder, &mut aggregator)?;
//! ```

pub mod dataset;
pub mod training;
pub mod utils;

// Re-export commonly used items for convenience
pub use dataset::{
    build_instance_view, Bag, BagId, BagSplits, BagStore, Instance, InstanceView, InstanceViewDataset, LabelOrigin,
};
pub use training::{
    build_mask, AggregationOutcome, BagAggregator, ConfidenceScores, InstanceEncoder, Phase, RatioScheduler,
    RoundDriver, RoundReport, RoundState, ScoreKind, SelectionMask, SelfTrainingConfig,
};
pub use utils::error::{MilError, Result};

/// Default seed for sampling and oversampling
pub const DEFAULT_SEED: u64 = 42;

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
