//! Instance View Builder
//!
//! Produces the ordered list of (image, label) examples the instance encoder
//! trains on this round.
//!
//! ## Inclusion policy
//!
//! Warmup: every instance is included. Its weak label is used when present,
//! otherwise the bag label is substituted.
//!
//! Steady state: an instance is included, in priority order, when
//! 1. it carries a weak label (always trusted)
//! 2. the selection mask selected it (its pseudo-label is used)
//! 3. its bag is negative (a negative study cannot contain a positive image)
//!
//! Anything else is left out. Positive labels are never inherited from a
//! positive bag in steady state: a positive study only says that *some* image
//! is positive.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::bag::{Bag, BagId, BagStore};
use crate::training::selection::{BagSelection, SelectionMask};
use crate::training::state::Phase;

/// Where an example's label came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelOrigin {
    /// The image's own weak label
    GroundTruth,
    /// Pseudo-label from the selection mask
    Selected,
    /// Negative label inherited from a negative bag
    NegativeBag,
    /// Bag label substituted from a positive bag without direct evidence (warmup only)
    PositiveBag,
}

impl LabelOrigin {
    /// Whether the label rests on direct evidence or safe inheritance
    pub fn is_confident(self) -> bool {
        !matches!(self, LabelOrigin::PositiveBag)
    }
}

/// One training example
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceExample {
    pub bag_id: BagId,
    /// Position of the image within its bag
    pub instance_index: usize,
    pub image: PathBuf,
    pub label: u8,
    pub origin: LabelOrigin,
}

/// Ordered training examples for one round
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceView {
    examples: Vec<InstanceExample>,
}

impl InstanceView {
    /// Wrap pre-built examples
    pub fn from_examples(examples: Vec<InstanceExample>) -> Self {
        Self { examples }
    }

    /// All examples in bag-then-instance order
    pub fn examples(&self) -> &[InstanceExample] {
        &self.examples
    }

    /// Example at `index`
    pub fn get(&self, index: usize) -> Option<&InstanceExample> {
        self.examples.get(index)
    }

    /// Number of examples
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Whether the view is empty
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Iterate examples
    pub fn iter(&self) -> impl Iterator<Item = &InstanceExample> {
        self.examples.iter()
    }

    /// Indices of confident-origin examples
    pub fn confident_indices(&self) -> Vec<usize> {
        self.indices_where(|e| e.origin.is_confident())
    }

    /// Indices of unconfident-origin examples
    pub fn unconfident_indices(&self) -> Vec<usize> {
        self.indices_where(|e| !e.origin.is_confident())
    }

    fn indices_where(&self, keep: impl Fn(&InstanceExample) -> bool) -> Vec<usize> {
        self.examples
            .iter()
            .enumerate()
            .filter(|(_, e)| keep(e))
            .map(|(i, _)| i)
            .collect()
    }

    /// Count examples by label origin
    pub fn stats(&self) -> InstanceViewStats {
        let mut stats = InstanceViewStats {
            examples: self.examples.len(),
            ..Default::default()
        };
        for example in &self.examples {
            match example.origin {
                LabelOrigin::GroundTruth => stats.ground_truth += 1,
                LabelOrigin::Selected => stats.selected += 1,
                LabelOrigin::NegativeBag => stats.negative_bag += 1,
                LabelOrigin::PositiveBag => stats.positive_bag += 1,
            }
            if example.label != 0 {
                stats.positive_labels += 1;
            }
        }
        stats
    }
}

/// Example counts per label origin
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceViewStats {
    pub examples: usize,
    pub ground_truth: usize,
    pub selected: usize,
    pub negative_bag: usize,
    pub positive_bag: usize,
    pub positive_labels: usize,
}

/// Build this round's instance view
///
/// Iterates bags in store order and instances in bag order, so the same
/// inputs always give the same view.
pub fn build_instance_view(store: &BagStore, mask: &SelectionMask, phase: Phase) -> InstanceView {
    let mut examples = Vec::with_capacity(store.instance_count());

    for bag in store.iter() {
        let selection = if phase.is_warmup() {
            None
        } else {
            aligned_selection(bag, mask)
        };

        for (index, instance) in bag.instances.iter().enumerate() {
            let labeled = match phase {
                Phase::Warmup => Some(warmup_label(bag, instance.label)),
                Phase::SteadyState => steady_state_label(bag, instance.label, selection, index),
            };

            if let Some((label, origin)) = labeled {
                examples.push(InstanceExample {
                    bag_id: bag.id.clone(),
                    instance_index: index,
                    image: instance.image.clone(),
                    label,
                    origin,
                });
            }
        }
    }

    let view = InstanceView { examples };
    debug!(
        "Built {} instance view: {} of {} instances",
        phase,
        view.len(),
        store.instance_count()
    );
    view
}

/// Mask entry for `bag`, or `None` if absent or misaligned
fn aligned_selection<'a>(bag: &Bag, mask: &'a SelectionMask) -> Option<&'a BagSelection> {
    let selection = mask.get(&bag.id)?;
    if selection.len() != bag.len() {
        warn!(
            "Selection for bag {} covers {} instances but the bag has {}; treating bag as unselected",
            bag.id,
            selection.len(),
            bag.len()
        );
        return None;
    }
    Some(selection)
}

fn warmup_label(bag: &Bag, weak_label: Option<u8>) -> (u8, LabelOrigin) {
    match weak_label {
        Some(label) => (label, LabelOrigin::GroundTruth),
        None if bag.is_negative() => (0, LabelOrigin::NegativeBag),
        None => (bag.label(), LabelOrigin::PositiveBag),
    }
}

fn steady_state_label(
    bag: &Bag,
    weak_label: Option<u8>,
    selection: Option<&BagSelection>,
    index: usize,
) -> Option<(u8, LabelOrigin)> {
    if let Some(label) = weak_label {
        return Some((label, LabelOrigin::GroundTruth));
    }

    if let Some(pseudo) = selection.and_then(|s| s.pseudo_label(index)) {
        return Some((pseudo, LabelOrigin::Selected));
    }

    if bag.is_negative() {
        return Some((0, LabelOrigin::NegativeBag));
    }

    None
}
