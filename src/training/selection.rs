//! Selection Mask Builder
//!
//! Turns the per-instance scores of the latest aggregator pass into this
//! round's selection: the globally most confident fraction of instances is
//! trusted and receives a pseudo-label, everything else stays unselected.
//!
//! ## Algorithm
//!
//! 1. Flatten every (bag, instance, score) triple in score insertion order
//! 2. Rank by distance from the neutral decision point, descending
//!    (stable sort, so ties keep flatten order)
//! 3. Keep the top `round(ratio * total_instances)`
//! 4. Selected instances become positive or negative by the sign of their score
//!
//! The mask is rebuilt from scratch every round and remembers nothing from
//! earlier rounds.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dataset::bag::BagId;
use crate::utils::error::{MilError, Result, ResultExt};

/// How aggregator scores should be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreKind {
    /// Raw logits, neutral at 0
    Logit,
    /// Sigmoid probabilities, neutral at 0.5
    #[default]
    Probability,
}

impl ScoreKind {
    /// Distance from the neutral decision point
    pub fn confidence(self, score: f32) -> f64 {
        match self {
            ScoreKind::Logit => (score as f64).abs(),
            ScoreKind::Probability => (score as f64 - 0.5).abs(),
        }
    }

    /// Whether the score favors the positive class
    pub fn is_positive(self, score: f32) -> bool {
        match self {
            ScoreKind::Logit => score > 0.0,
            ScoreKind::Probability => score >= 0.5,
        }
    }
}

/// Per-instance scores keyed by bag, in the order producers supplied them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfidenceScores {
    order: Vec<BagId>,
    scores: HashMap<BagId, Vec<f32>>,
}

/// One bag's scores as stored in a score file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub bag_id: BagId,
    pub scores: Vec<f32>,
}

impl ConfidenceScores {
    /// Create an empty score table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace, keeping its original position) one bag's scores
    pub fn insert(&mut self, bag_id: impl Into<BagId>, scores: Vec<f32>) {
        let bag_id = bag_id.into();
        if self.scores.insert(bag_id.clone(), scores).is_some() {
            debug!("Replacing scores for bag {}", bag_id);
        } else {
            self.order.push(bag_id);
        }
    }

    /// Pool another table into this one (e.g. validation into training scores)
    pub fn merge(&mut self, other: ConfidenceScores) {
        let ConfidenceScores { order, mut scores } = other;
        for bag_id in order {
            if let Some(values) = scores.remove(&bag_id) {
                self.insert(bag_id, values);
            }
        }
    }

    /// Scores for one bag
    pub fn get(&self, bag_id: &BagId) -> Option<&[f32]> {
        self.scores.get(bag_id).map(Vec::as_slice)
    }

    /// Iterate bags in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&BagId, &[f32])> {
        self.order
            .iter()
            .filter_map(move |id| self.scores.get(id).map(|s| (id, s.as_slice())))
    }

    /// Number of bags
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no bag has scores
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Total number of instance scores
    pub fn instance_count(&self) -> usize {
        self.scores.values().map(Vec::len).sum()
    }

    /// Build from score records
    pub fn from_records(records: Vec<ScoreRecord>) -> Self {
        let mut table = Self::new();
        for record in records {
            table.insert(record.bag_id, record.scores);
        }
        table
    }

    /// Records in insertion order
    pub fn to_records(&self) -> Vec<ScoreRecord> {
        self.iter()
            .map(|(bag_id, scores)| ScoreRecord {
                bag_id: bag_id.clone(),
                scores: scores.to_vec(),
            })
            .collect()
    }

    /// Load a JSON score file: `[{"bag_id": .., "scores": [..]}, ..]`
    pub fn load_json(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).with_context(|| format!("score file {}", path.display()))?;
        let records: Vec<ScoreRecord> = serde_json::from_str(&json)?;
        Ok(Self::from_records(records))
    }
}

/// Per-instance selection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStatus {
    #[default]
    NotSelected,
    SelectedNegative,
    SelectedPositive,
}

impl SelectionStatus {
    /// Whether the instance was selected this round
    pub fn is_selected(self) -> bool {
        !matches!(self, SelectionStatus::NotSelected)
    }

    /// Pseudo-label implied by the status
    pub fn pseudo_label(self) -> Option<u8> {
        match self {
            SelectionStatus::NotSelected => None,
            SelectionStatus::SelectedNegative => Some(0),
            SelectionStatus::SelectedPositive => Some(1),
        }
    }
}

/// Selection for one bag, aligned with the bag's instance order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BagSelection {
    pub bag_id: BagId,
    /// Status per instance
    pub statuses: Vec<SelectionStatus>,
    /// Raw score per instance, kept for diagnostics (`None` if non-finite)
    pub scores: Vec<Option<f32>>,
}

impl BagSelection {
    fn unselected(bag_id: BagId, scores: &[f32]) -> Self {
        Self {
            bag_id,
            statuses: vec![SelectionStatus::NotSelected; scores.len()],
            scores: scores
                .iter()
                .map(|&s| if s.is_finite() { Some(s) } else { None })
                .collect(),
        }
    }

    /// Number of instances covered
    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    /// Whether the bag has no instances
    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// Status of one instance (out of range reads as not selected)
    pub fn status(&self, index: usize) -> SelectionStatus {
        self.statuses.get(index).copied().unwrap_or_default()
    }

    /// Pseudo-label of one instance, if selected
    pub fn pseudo_label(&self, index: usize) -> Option<u8> {
        self.status(index).pseudo_label()
    }
}

/// Per-round selection decision for every scored bag
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<BagSelection>", into = "Vec<BagSelection>")]
pub struct SelectionMask {
    bags: BTreeMap<BagId, BagSelection>,
}

/// Rejects repeated bag ids and entries whose statuses and scores differ in length
impl TryFrom<Vec<BagSelection>> for SelectionMask {
    type Error = MilError;

    fn try_from(entries: Vec<BagSelection>) -> Result<Self> {
        let mut bags = BTreeMap::new();
        for entry in entries {
            if entry.statuses.len() != entry.scores.len() {
                return Err(MilError::InvalidInput(format!(
                    "mask entry for bag {} has {} statuses but {} scores",
                    entry.bag_id,
                    entry.statuses.len(),
                    entry.scores.len()
                )));
            }
            if bags.contains_key(&entry.bag_id) {
                return Err(MilError::InvalidInput(format!(
                    "bag {} appears twice in the mask",
                    entry.bag_id
                )));
            }
            bags.insert(entry.bag_id.clone(), entry);
        }
        Ok(Self { bags })
    }
}

impl From<SelectionMask> for Vec<BagSelection> {
    fn from(mask: SelectionMask) -> Self {
        mask.bags.into_values().collect()
    }
}

impl SelectionMask {
    /// Selection for one bag
    pub fn get(&self, bag_id: &BagId) -> Option<&BagSelection> {
        self.bags.get(bag_id)
    }

    /// Iterate entries ordered by bag id
    pub fn iter(&self) -> impl Iterator<Item = &BagSelection> {
        self.bags.values()
    }

    /// Number of bags with an entry
    pub fn len(&self) -> usize {
        self.bags.len()
    }

    /// Whether the mask has no entries
    pub fn is_empty(&self) -> bool {
        self.bags.is_empty()
    }

    /// Count selected instances by polarity
    pub fn summary(&self) -> MaskSummary {
        let mut summary = MaskSummary {
            bags: self.bags.len(),
            ..Default::default()
        };

        for entry in self.bags.values() {
            summary.instances += entry.len();
            for status in &entry.statuses {
                match status {
                    SelectionStatus::NotSelected => {}
                    SelectionStatus::SelectedNegative => summary.negative += 1,
                    SelectionStatus::SelectedPositive => summary.positive += 1,
                }
            }
        }

        summary.selected = summary.positive + summary.negative;
        summary
    }
}

/// Selection counts for logging and reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskSummary {
    pub bags: usize,
    pub instances: usize,
    pub selected: usize,
    pub positive: usize,
    pub negative: usize,
}

impl fmt::Display for MaskSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} instances selected ({} positive, {} negative) across {} bags",
            self.selected, self.instances, self.positive, self.negative, self.bags
        )
    }
}

struct Candidate<'a> {
    bag_id: &'a BagId,
    index: usize,
    score: f32,
    confidence: f64,
}

/// Number of instances to select for a ratio over `total` instances
pub fn selection_target(ratio: f64, total: usize) -> usize {
    let ratio = if ratio.is_finite() { ratio.clamp(0.0, 1.0) } else { 0.0 };
    (ratio * total as f64).round() as usize
}

/// Build this round's selection mask
///
/// `ratio` is a fraction of all scored instances across all bags. Every bag in
/// `scores` gets an entry whose length matches its score list; an empty table
/// yields an empty mask.
pub fn build_mask(scores: &ConfidenceScores, ratio: f64, kind: ScoreKind) -> SelectionMask {
    if !ratio.is_finite() {
        warn!("Non-finite selection ratio {}; selecting nothing", ratio);
    }

    let total = scores.instance_count();
    let mut candidates = Vec::with_capacity(total);
    let mut non_finite = 0usize;

    for (bag_id, bag_scores) in scores.iter() {
        for (index, &score) in bag_scores.iter().enumerate() {
            if !score.is_finite() {
                non_finite += 1;
                continue;
            }
            candidates.push(Candidate {
                bag_id,
                index,
                score,
                confidence: kind.confidence(score),
            });
        }
    }

    if non_finite > 0 {
        warn!("{} non-finite instance scores excluded from selection", non_finite);
    }

    // sort_by is stable: equal confidences keep flatten order
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let target = selection_target(ratio, total).min(candidates.len());

    let mut bags: BTreeMap<BagId, BagSelection> = scores
        .iter()
        .map(|(bag_id, bag_scores)| (bag_id.clone(), BagSelection::unselected(bag_id.clone(), bag_scores)))
        .collect();

    for candidate in candidates.iter().take(target) {
        if let Some(entry) = bags.get_mut(candidate.bag_id) {
            entry.statuses[candidate.index] = if kind.is_positive(candidate.score) {
                SelectionStatus::SelectedPositive
            } else {
                SelectionStatus::SelectedNegative
            };
        }
    }

    let mask = SelectionMask { bags };
    debug!("Built selection mask: {}", mask.summary());
    mask
}

/// Load a serialized mask (as written into checkpoints)
pub fn load_mask(path: &Path) -> Result<SelectionMask> {
    let json = std::fs::read_to_string(path)?;
    serde_json::from_str(&json).map_err(|e| MilError::Serialization(format!("selection mask: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(entries: &[(i64, &[f32])]) -> ConfidenceScores {
        let mut table = ConfidenceScores::new();
        for (id, values) in entries {
            table.insert(*id, values.to_vec());
        }
        table
    }

    #[test]
    fn test_empty_scores_give_empty_mask() {
        let mask = build_mask(&ConfidenceScores::new(), 0.5, ScoreKind::Probability);
        assert!(mask.is_empty());
        assert_eq!(mask.summary().selected, 0);
    }

    #[test]
    fn test_every_bag_gets_aligned_entry() {
        let table = scores(&[(1, &[0.9, 0.5, 0.1]), (2, &[]), (3, &[0.6])]);
        let mask = build_mask(&table, 0.0, ScoreKind::Probability);

        assert_eq!(mask.len(), 3);
        assert_eq!(mask.get(&BagId::Int(1)).unwrap().len(), 3);
        assert_eq!(mask.get(&BagId::Int(2)).unwrap().len(), 0);
        assert_eq!(mask.get(&BagId::Int(3)).unwrap().len(), 1);
        assert_eq!(mask.summary().selected, 0);
    }

    #[test]
    fn test_selects_most_confident_globally() {
        // probabilities: distances 0.45, 0.0, 0.4 | 0.05, 0.49
        let table = scores(&[(1, &[0.95, 0.5, 0.1]), (2, &[0.55, 0.01])]);
        let mask = build_mask(&table, 0.6, ScoreKind::Probability);

        // round(0.6 * 5) = 3
        let bag1 = mask.get(&BagId::Int(1)).unwrap();
        let bag2 = mask.get(&BagId::Int(2)).unwrap();
        assert_eq!(bag1.statuses, vec![
            SelectionStatus::SelectedPositive,
            SelectionStatus::NotSelected,
            SelectionStatus::SelectedNegative,
        ]);
        assert_eq!(bag2.statuses, vec![SelectionStatus::NotSelected, SelectionStatus::SelectedNegative]);
        assert_eq!(bag1.pseudo_label(0), Some(1));
        assert_eq!(bag1.pseudo_label(2), Some(0));
        assert_eq!(bag1.pseudo_label(1), None);

        let summary = mask.summary();
        assert_eq!(summary.selected, 3);
        assert_eq!(summary.positive + summary.negative, summary.selected);
    }

    #[test]
    fn test_logit_sign_decides_polarity() {
        let table = scores(&[(7, &[-3.0, 0.2, 2.5])]);
        let mask = build_mask(&table, 2.0 / 3.0, ScoreKind::Logit);
        let entry = mask.get(&BagId::Int(7)).unwrap();
        assert_eq!(entry.status(0), SelectionStatus::SelectedNegative);
        assert_eq!(entry.status(1), SelectionStatus::NotSelected);
        assert_eq!(entry.status(2), SelectionStatus::SelectedPositive);
    }

    #[test]
    fn test_ties_break_by_flatten_order() {
        let table = scores(&[(5, &[0.75, 0.25]), (4, &[0.75])]);
        // all three share confidence 0.25; take 2 -> first two in flatten order
        let mask = build_mask(&table, 0.5, ScoreKind::Probability);
        assert_eq!(mask.get(&BagId::Int(5)).unwrap().statuses, vec![
            SelectionStatus::SelectedPositive,
            SelectionStatus::SelectedNegative,
        ]);
        assert_eq!(mask.get(&BagId::Int(4)).unwrap().status(0), SelectionStatus::NotSelected);
    }

    #[test]
    fn test_selected_count_tracks_ratio() {
        let values: Vec<f32> = (0..37).map(|i| (i as f32) / 37.0).collect();
        let table = scores(&[(1, &values[..20]), (2, &values[20..])]);
        for step in 0..=20 {
            let ratio = step as f64 / 20.0;
            let selected = build_mask(&table, ratio, ScoreKind::Probability).summary().selected;
            let expected = (ratio * 37.0).round() as i64;
            assert!((selected as i64 - expected).abs() <= 1);
        }
    }

    #[test]
    fn test_non_finite_scores_never_selected() {
        let table = scores(&[(1, &[f32::NAN, 0.99, f32::INFINITY])]);
        let mask = build_mask(&table, 1.0, ScoreKind::Probability);
        let entry = mask.get(&BagId::Int(1)).unwrap();
        assert_eq!(entry.status(0), SelectionStatus::NotSelected);
        assert_eq!(entry.status(1), SelectionStatus::SelectedPositive);
        assert_eq!(entry.status(2), SelectionStatus::NotSelected);
        assert_eq!(entry.scores[0], None);
    }

    #[test]
    fn test_build_is_idempotent() {
        let table = scores(&[(3, &[0.2, 0.8, 0.7]), (1, &[0.3, 0.3]), (2, &[0.99])]);
        let a = serde_json::to_string(&build_mask(&table, 0.5, ScoreKind::Probability)).unwrap();
        let b = serde_json::to_string(&build_mask(&table, 0.5, ScoreKind::Probability)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_mixed_id_representations_share_one_entry() {
        let mut table = ConfidenceScores::new();
        table.insert(12i64, vec![0.1, 0.2]);
        table.insert(12.0f64, vec![0.9, 0.8]);
        table.insert("12", vec![0.7, 0.6]);
        assert_eq!(table.len(), 1);

        let mask = build_mask(&table, 0.0, ScoreKind::Probability);
        assert_eq!(mask.len(), 1);
        assert_eq!(mask.get(&BagId::Int(12)).unwrap().scores, vec![Some(0.7), Some(0.6)]);
    }

    #[test]
    fn test_merge_pools_train_and_validation() {
        let mut train = scores(&[(1, &[0.9])]);
        let val = scores(&[(2, &[0.1]), (1, &[0.2])]);
        train.merge(val);
        let order: Vec<_> = train.iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(order, vec![BagId::Int(1), BagId::Int(2)]);
        assert_eq!(train.get(&BagId::Int(1)), Some(&[0.2f32][..]));
    }

    #[test]
    fn test_load_score_file_and_mask() {
        let dir = tempfile::TempDir::new().unwrap();
        let scores_path = dir.path().join("scores.json");
        std::fs::write(&scores_path, r#"[{"bag_id": 3.0, "scores": [0.1, 0.8]}, {"bag_id": "a", "scores": [0.5]}]"#)
            .unwrap();

        let table = ConfidenceScores::load_json(&scores_path).unwrap();
        assert_eq!(table.get(&BagId::Int(3)), Some(&[0.1f32, 0.8][..]));
        assert_eq!(table.to_records()[1].bag_id, BagId::Text("a".into()));

        let mask_path = dir.path().join("mask.json");
        let mask = build_mask(&table, 1.0 / 3.0, ScoreKind::Probability);
        std::fs::write(&mask_path, serde_json::to_string(&mask).unwrap()).unwrap();
        assert_eq!(load_mask(&mask_path).unwrap(), mask);

        assert!(matches!(
            ConfidenceScores::load_json(&dir.path().join("missing.json")),
            Err(MilError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_mask_json_roundtrip() {
        let table = scores(&[(1, &[0.9, 0.4])]);
        let mask = build_mask(&table, 0.5, ScoreKind::Probability);
        let json = serde_json::to_string(&mask).unwrap();
        let back: SelectionMask = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mask);
    }

    #[test]
    fn test_malformed_mask_rejected() {
        let repeated = r#"[
            {"bag_id": 1, "statuses": ["not_selected"], "scores": [0.2]},
            {"bag_id": 1.0, "statuses": ["selected_positive"], "scores": [0.9]}
        ]"#;
        assert!(serde_json::from_str::<SelectionMask>(repeated).is_err());

        let misaligned = r#"[{"bag_id": 2, "statuses": ["not_selected", "not_selected"], "scores": [0.2]}]"#;
        assert!(serde_json::from_str::<SelectionMask>(misaligned).is_err());

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("mask.json");
        std::fs::write(&path, repeated).unwrap();
        assert!(matches!(load_mask(&path), Err(MilError::Serialization(_))));
    }
}
