//! Dataset module for bag and instance handling
//!
//! This module provides functionality for:
//! - Holding patient studies (bags) and their images (instances)
//! - Loading bags from the tabular study export
//! - Oversampling the minority bag class
//! - Building each round's instance view and exposing it to Burn
//!
//! ## Label Asymmetry
//!
//! A negative study cannot contain a positive image, so negative bag labels
//! may be inherited by every image in the bag. A positive study only says
//! that *some* image is positive, so positive labels need direct evidence:
//! a weak label or a confident selection.

pub mod balance;
pub mod bag;
pub mod burn_dataset;
pub mod instance_view;
pub mod loader;

// Re-export main types for convenience
pub use bag::{Bag, BagId, BagStore, BagStoreStats, Instance};
pub use balance::oversample_minority;
pub use burn_dataset::{InstanceBatch, InstanceBatcher, InstanceItem, InstanceViewDataset};
pub use instance_view::{build_instance_view, InstanceExample, InstanceView, InstanceViewStats, LabelOrigin};
pub use loader::{load_bags, BagSplits, BagTableConfig};

