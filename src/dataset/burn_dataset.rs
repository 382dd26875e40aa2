//! Burn Dataset Integration for instance views
//!
//! Exposes an [`InstanceView`] through Burn's `Dataset` trait and batches
//! its labels into tensors. Images stay as paths: decoding them is the
//! encoder's job.

use std::path::PathBuf;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use super::bag::BagId;
use super::instance_view::InstanceView;
use crate::training::selection::ConfidenceScores;
use crate::utils::error::{MilError, Result};

/// A single instance item ready for Burn
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceItem {
    /// Image reference (not loaded)
    pub image: PathBuf,
    /// Training label for this round
    pub label: u8,
    /// Owning bag
    pub bag_id: BagId,
    /// Position within the bag
    pub instance_index: usize,
    /// Whether the label rests on direct evidence or safe inheritance
    pub confident: bool,
}

/// Burn dataset over one round's instance view
#[derive(Debug, Clone)]
pub struct InstanceViewDataset {
    items: Vec<InstanceItem>,
}

impl InstanceViewDataset {
    /// Snapshot the view's examples
    pub fn new(view: &InstanceView) -> Self {
        let items = view
            .iter()
            .map(|example| InstanceItem {
                image: example.image.clone(),
                label: example.label,
                bag_id: example.bag_id.clone(),
                instance_index: example.instance_index,
                confident: example.origin.is_confident(),
            })
            .collect();
        Self { items }
    }

    /// Items whose label came from a positive bag without direct evidence
    pub fn unconfident_count(&self) -> usize {
        self.items.iter().filter(|item| !item.confident).count()
    }
}

impl Dataset<InstanceItem> for InstanceViewDataset {
    fn get(&self, index: usize) -> Option<InstanceItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

impl From<&InstanceView> for InstanceViewDataset {
    fn from(view: &InstanceView) -> Self {
        Self::new(view)
    }
}

/// A batch of instance labels
#[derive(Clone, Debug)]
pub struct InstanceBatch<B: Backend> {
    /// Labels [batch_size]
    pub targets: Tensor<B, 1, Int>,
    /// 1.0 for confident-origin items, 0.0 otherwise [batch_size]
    pub confident: Tensor<B, 1>,
    /// Image references in batch order
    pub images: Vec<PathBuf>,
}

/// Batcher turning instance items into label tensors
#[derive(Clone, Debug, Default)]
pub struct InstanceBatcher;

impl<B: Backend> Batcher<B, InstanceItem, InstanceBatch<B>> for InstanceBatcher {
    fn batch(&self, items: Vec<InstanceItem>, device: &B::Device) -> InstanceBatch<B> {
        let batch_size = items.len();

        let targets: Vec<i64> = items.iter().map(|item| item.label as i64).collect();
        let confident: Vec<f32> = items
            .iter()
            .map(|item| if item.confident { 1.0 } else { 0.0 })
            .collect();
        let images = items.into_iter().map(|item| item.image).collect();

        InstanceBatch {
            targets: Tensor::<B, 1, Int>::from_data(TensorData::new(targets, [batch_size]), device),
            confident: Tensor::<B, 1>::from_floats(TensorData::new(confident, [batch_size]), device),
            images,
        }
    }
}

impl ConfidenceScores {
    /// Insert one bag's instance scores straight from an aggregator output tensor
    pub fn insert_tensor<B: Backend>(&mut self, bag_id: impl Into<BagId>, scores: Tensor<B, 1>) -> Result<()> {
        let bag_id = bag_id.into();
        let values: Vec<f32> = scores
            .into_data()
            .to_vec()
            .map_err(|e| MilError::Training(format!("scores for bag {}: {:?}", bag_id, e)))?;
        self.insert(bag_id, values);
        Ok(())
    }
}
