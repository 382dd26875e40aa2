//! Bag Store: patient studies (bags) and their ultrasound images (instances)
//!
//! A bag carries one or more study-level labels derived from clinical
//! annotation. Its images may carry an optional per-image weak label.
//! The store is built once during data preparation and is read-only for
//! the rest of the run.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::utils::error::{MilError, Result};

/// Canonical bag identifier
///
/// Producers hand out identifiers as integers, floats (`12.0`), or strings
/// (`"12"`). All of them pass through [`BagId::from`] conversions that fold
/// integral values into `Int`, so a single study never fragments into
/// several map keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BagId {
    Int(i64),
    Text(String),
}

impl BagId {
    /// Normalize a raw textual identifier
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();

        // "007" stays textual: only the canonical spelling folds to Int
        if let Some(value) = canonical_int(trimmed) {
            return BagId::Int(value);
        }

        // "12.0" as written by dataframe exports
        if let Some((int_part, frac)) = trimmed.split_once('.') {
            if !frac.is_empty() && frac.chars().all(|c| c == '0') {
                if let Some(value) = canonical_int(int_part) {
                    return BagId::Int(value);
                }
            }
        }

        BagId::Text(trimmed.to_string())
    }

    /// Integer value, if this identifier is numeric
    pub fn as_int(&self) -> Option<i64> {
        match self {
            BagId::Int(v) => Some(*v),
            BagId::Text(_) => None,
        }
    }
}

fn canonical_int(text: &str) -> Option<i64> {
    text.parse::<i64>()
        .ok()
        .filter(|value| value.to_string() == text)
}

fn integral_f64(value: f64) -> Option<BagId> {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Some(BagId::Int(value as i64))
    } else {
        None
    }
}

impl fmt::Display for BagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BagId::Int(v) => write!(f, "{}", v),
            BagId::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for BagId {
    fn from(value: i64) -> Self {
        BagId::Int(value)
    }
}

impl From<i32> for BagId {
    fn from(value: i32) -> Self {
        BagId::Int(value as i64)
    }
}

impl From<u32> for BagId {
    fn from(value: u32) -> Self {
        BagId::Int(value as i64)
    }
}

impl From<u64> for BagId {
    fn from(value: u64) -> Self {
        match i64::try_from(value) {
            Ok(v) => BagId::Int(v),
            Err(_) => BagId::Text(value.to_string()),
        }
    }
}

impl From<usize> for BagId {
    fn from(value: usize) -> Self {
        BagId::from(value as u64)
    }
}

impl From<f64> for BagId {
    fn from(value: f64) -> Self {
        integral_f64(value).unwrap_or_else(|| BagId::Text(value.to_string()))
    }
}

impl From<f32> for BagId {
    fn from(value: f32) -> Self {
        BagId::from(value as f64)
    }
}

impl From<&str> for BagId {
    fn from(value: &str) -> Self {
        BagId::parse(value)
    }
}

impl From<String> for BagId {
    fn from(value: String) -> Self {
        BagId::parse(&value)
    }
}

impl Serialize for BagId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            BagId::Int(v) => serializer.serialize_i64(*v),
            BagId::Text(s) => serializer.serialize_str(s),
        }
    }
}

/// Any representation a producer may emit for a bag identifier
#[derive(Deserialize)]
#[serde(untagged)]
enum RawBagId {
    Int(i64),
    Float(f64),
    Text(String),
}

impl<'de> Deserialize<'de> for BagId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(match RawBagId::deserialize(deserializer)? {
            RawBagId::Int(v) => BagId::Int(v),
            RawBagId::Float(v) => BagId::from(v),
            RawBagId::Text(s) => BagId::parse(&s),
        })
    }
}

/// A single image within a bag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Reference to the image resource (resolved lazily, never opened here)
    pub image: PathBuf,
    /// Optional ground-truth weak label (absent is a valid state)
    pub label: Option<u8>,
}

impl Instance {
    /// Create an unlabeled instance
    pub fn unlabeled(image: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            label: None,
        }
    }

    /// Create an instance with a ground-truth weak label
    pub fn labeled(image: impl Into<PathBuf>, label: u8) -> Self {
        Self {
            image: image.into(),
            label: Some(label),
        }
    }
}

/// A patient study: ordered images sharing bag-level labels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bag {
    /// Canonical identifier
    pub id: BagId,
    /// Ordered instances
    pub instances: Vec<Instance>,
    /// Bag-level labels (one per condition, the first is the primary label)
    pub labels: Vec<u8>,
}

impl Bag {
    /// Create a new bag
    pub fn new(id: impl Into<BagId>, instances: Vec<Instance>, labels: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            instances,
            labels,
        }
    }

    /// Primary bag-level label (0 = negative)
    pub fn label(&self) -> u8 {
        self.labels.first().copied().unwrap_or(0)
    }

    /// Whether the primary label is the negative class
    pub fn is_negative(&self) -> bool {
        self.label() == 0
    }

    /// Number of instances
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether the bag has no instances
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Number of instances carrying a ground-truth weak label
    pub fn labeled_count(&self) -> usize {
        self.instances.iter().filter(|i| i.label.is_some()).count()
    }
}

/// Immutable, insertion-ordered mapping from bag id to bag
#[derive(Debug, Clone, Default)]
pub struct BagStore {
    bags: Vec<Bag>,
    index: HashMap<BagId, usize>,
}

impl BagStore {
    /// Build a store from bags, rejecting duplicate identifiers and empty label vectors
    pub fn from_bags(bags: Vec<Bag>) -> Result<Self> {
        let mut index = HashMap::with_capacity(bags.len());

        for (position, bag) in bags.iter().enumerate() {
            if bag.labels.is_empty() {
                return Err(MilError::Dataset(format!("bag {} has no bag-level label", bag.id)));
            }
            if index.insert(bag.id.clone(), position).is_some() {
                return Err(MilError::Dataset(format!("duplicate bag id {}", bag.id)));
            }
        }

        Ok(Self { bags, index })
    }

    /// Look up a bag by identifier
    pub fn get(&self, id: &BagId) -> Option<&Bag> {
        self.index.get(id).map(|&i| &self.bags[i])
    }

    /// Whether a bag exists
    pub fn contains(&self, id: &BagId) -> bool {
        self.index.contains_key(id)
    }

    /// Iterate bags in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Bag> {
        self.bags.iter()
    }

    /// All bags in insertion order
    pub fn bags(&self) -> &[Bag] {
        &self.bags
    }

    /// Number of bags
    pub fn len(&self) -> usize {
        self.bags.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.bags.is_empty()
    }

    /// Total number of instances across all bags
    pub fn instance_count(&self) -> usize {
        self.bags.iter().map(Bag::len).sum()
    }

    /// Statistics over the store
    pub fn stats(&self) -> BagStoreStats {
        let mut stats = BagStoreStats {
            bags: self.bags.len(),
            ..Default::default()
        };

        for bag in &self.bags {
            if bag.is_negative() {
                stats.negative_bags += 1;
            } else {
                stats.positive_bags += 1;
            }
            stats.instances += bag.len();
            stats.labeled_instances += bag.labeled_count();
        }

        stats
    }
}

/// Summary counts for a bag store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BagStoreStats {
    pub bags: usize,
    pub positive_bags: usize,
    pub negative_bags: usize,
    pub instances: usize,
    pub labeled_instances: usize,
}

impl fmt::Display for BagStoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Bags: {} ({} positive, {} negative)", self.bags, self.positive_bags, self.negative_bags)?;
        write!(
            f,
            "Instances: {} ({} with weak labels)",
            self.instances, self.labeled_instances
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bag_id_normalization() {
        assert_eq!(BagId::from(12i64), BagId::Int(12));
        assert_eq!(BagId::from(12.0f64), BagId::Int(12));
        assert_eq!(BagId::from(12u64), BagId::Int(12));
        assert_eq!(BagId::from("12"), BagId::Int(12));
        assert_eq!(BagId::from(" 12 "), BagId::Int(12));
        assert_eq!(BagId::from("12.0"), BagId::Int(12));
        assert_eq!(BagId::from("0"), BagId::Int(0));
        assert_eq!(BagId::from("007"), BagId::Text("007".into()));
        assert_eq!(BagId::from("ACC-19"), BagId::Text("ACC-19".into()));
        assert_eq!(BagId::from(1.5f64), BagId::Text("1.5".into()));
    }

    #[test]
    fn test_bag_id_serde_forms_collapse() {
        let from_int: BagId = serde_json::from_str("42").unwrap();
        let from_float: BagId = serde_json::from_str("42.0").unwrap();
        let from_text: BagId = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(from_int, BagId::Int(42));
        assert_eq!(from_float, from_int);
        assert_eq!(from_text, from_int);

        assert_eq!(serde_json::to_string(&BagId::Int(7)).unwrap(), "7");
        assert_eq!(serde_json::to_string(&BagId::Text("a".into())).unwrap(), "\"a\"");
    }

    #[test]
    fn test_store_rejects_duplicates_after_normalization() {
        let bags = vec![
            Bag::new(3i64, vec![Instance::unlabeled("a.png")], vec![0]),
            Bag::new("3", vec![Instance::unlabeled("b.png")], vec![1]),
        ];
        assert!(matches!(BagStore::from_bags(bags), Err(MilError::Dataset(_))));
    }

    #[test]
    fn test_store_rejects_missing_label() {
        let bags = vec![Bag::new(1i64, vec![Instance::unlabeled("a.png")], vec![])];
        assert!(BagStore::from_bags(bags).is_err());
    }

    #[test]
    fn test_store_lookup_and_order() {
        let bags = vec![
            Bag::new(9i64, vec![Instance::unlabeled("a.png")], vec![1]),
            Bag::new(2i64, vec![Instance::labeled("b.png", 0), Instance::unlabeled("c.png")], vec![0]),
        ];
        let store = BagStore::from_bags(bags).unwrap();

        let order: Vec<_> = store.iter().map(|b| b.id.clone()).collect();
        assert_eq!(order, vec![BagId::Int(9), BagId::Int(2)]);
        assert_eq!(store.get(&BagId::from(2.0f64)).unwrap().len(), 2);
        assert_eq!(store.instance_count(), 3);

        let stats = store.stats();
        assert_eq!(stats.positive_bags, 1);
        assert_eq!(stats.negative_bags, 1);
        assert_eq!(stats.labeled_instances, 1);
    }
}
