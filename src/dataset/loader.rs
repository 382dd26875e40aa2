//! Bag table loader
//!
//! Reads the study export (one row per bag) and the optional per-image label
//! table, and splits the result into training and validation bag stores.
//!
//! Expected bag table layout:
//! ```text
//! ID,Images,Has_Malignant,valid
//! 12,"['12_0.png', '12_1.png']",1,0
//! 13,"[""13_0.png""]",0,1
//! ```
//!
//! Image references are joined onto `image_root` but never opened here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use csv::StringRecord;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::bag::{Bag, BagId, BagStore, Instance};
use crate::utils::error::{MilError, Result};

/// Schema and filters for the bag table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BagTableConfig {
    /// CSV export with one row per bag
    pub bag_table: PathBuf,
    /// Directory image names are resolved against
    pub image_root: PathBuf,
    /// Column holding the bag identifier
    pub id_column: String,
    /// Column holding the image list
    pub images_column: String,
    /// Bag-level label columns; the first is the primary label
    pub label_columns: Vec<String>,
    /// Column flagging validation bags (1 = validation)
    pub split_column: Option<String>,
    /// Optional per-image label table
    pub instance_table: Option<PathBuf>,
    /// Image-name column of the per-image table
    pub instance_image_column: String,
    /// Weak-label column of the per-image table
    pub instance_label_column: String,
    /// Smallest bag kept
    pub min_bag_size: usize,
    /// Largest bag kept
    pub max_bag_size: usize,
    /// Oversample the minority class of the training split
    pub oversample: bool,
}

impl Default for BagTableConfig {
    fn default() -> Self {
        Self {
            bag_table: PathBuf::from("data/train.csv"),
            image_root: PathBuf::from("data/images"),
            id_column: "ID".to_string(),
            images_column: "Images".to_string(),
            label_columns: vec!["Has_Malignant".to_string()],
            split_column: None,
            instance_table: None,
            instance_image_column: "ImageName".to_string(),
            instance_label_column: "Malignant".to_string(),
            min_bag_size: 2,
            max_bag_size: 25,
            oversample: true,
        }
    }
}

/// Training and validation bags
#[derive(Debug, Clone, Default)]
pub struct BagSplits {
    pub train: BagStore,
    pub validation: BagStore,
}

impl BagSplits {
    /// Fail if any bag id is in both splits
    pub fn ensure_disjoint(&self) -> Result<()> {
        match self.validation.iter().find(|bag| self.train.contains(&bag.id)) {
            Some(bag) => Err(MilError::Dataset(format!(
                "bag {} appears in both training and validation splits",
                bag.id
            ))),
            None => Ok(()),
        }
    }
}

/// Parse a label cell
///
/// Blank, `nan` and `None` are absent. `True`/`False`, `1`/`0` and
/// `1.0`/`0.0` become 1/0. Anything else is rejected.
pub fn parse_flag(cell: &str) -> Result<Option<u8>> {
    let cell = cell.trim();
    match cell.to_ascii_lowercase().as_str() {
        "" | "nan" | "none" | "null" => Ok(None),
        "true" | "1" | "1.0" => Ok(Some(1)),
        "false" | "0" | "0.0" => Ok(Some(0)),
        _ => Err(MilError::Dataset(format!("unrecognized label value '{}'", cell))),
    }
}

/// Parse an image list cell
///
/// Accepts a JSON array (`["a.png", "b.png"]`) or a Python list literal
/// (`['a.png', 'b.png']`).
pub fn parse_image_list(cell: &str) -> Result<Vec<String>> {
    let cell = cell.trim();

    if let Ok(names) = serde_json::from_str::<Vec<String>>(cell) {
        return Ok(names);
    }

    let inner = cell
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(|| MilError::Dataset(format!("image list is not a list: {}", cell)))?;

    Ok(inner
        .split(',')
        .map(|item| item.trim().trim_matches(|c| c == '\'' || c == '"').trim())
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect())
}

fn column_index(headers: &StringRecord, name: &str, table: &Path) -> Result<usize> {
    headers
        .iter()
        .position(|h| h.trim() == name)
        .ok_or_else(|| MilError::Dataset(format!("column '{}' missing from {}", name, table.display())))
}

/// Load the per-image weak labels keyed by image name
pub fn load_instance_labels(path: &Path, image_column: &str, label_column: &str) -> Result<HashMap<String, u8>> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
    let headers = reader.headers()?.clone();
    let image_idx = column_index(&headers, image_column, path)?;
    let label_idx = column_index(&headers, label_column, path)?;

    let mut labels = HashMap::new();
    for record in reader.records() {
        let record = record?;
        let name = record.get(image_idx).unwrap_or("").trim();
        if name.is_empty() {
            continue;
        }
        if let Some(label) = parse_flag(record.get(label_idx).unwrap_or(""))? {
            labels.insert(name.to_string(), label);
        }
    }

    debug!("Loaded {} instance labels from {:?}", labels.len(), path);
    Ok(labels)
}

struct Columns {
    id: usize,
    images: usize,
    labels: Vec<usize>,
    split: Option<usize>,
}

/// Load training and validation bags as described by `config`
pub fn load_bags(config: &BagTableConfig) -> Result<BagSplits> {
    if config.label_columns.is_empty() {
        return Err(MilError::Config("at least one bag label column is required".to_string()));
    }

    info!("Loading bag table from {:?}", config.bag_table);

    let instance_labels = match &config.instance_table {
        Some(path) => load_instance_labels(path, &config.instance_image_column, &config.instance_label_column)?,
        None => HashMap::new(),
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(&config.bag_table)?;
    let headers = reader.headers()?.clone();
    let table = config.bag_table.as_path();

    let columns = Columns {
        id: column_index(&headers, &config.id_column, table)?,
        images: column_index(&headers, &config.images_column, table)?,
        labels: config
            .label_columns
            .iter()
            .map(|name| column_index(&headers, name, table))
            .collect::<Result<_>>()?,
        split: config
            .split_column
            .as_deref()
            .map(|name| column_index(&headers, name, table))
            .transpose()?,
    };

    let mut train = Vec::new();
    let mut validation = Vec::new();
    let mut dropped_size = 0usize;
    let mut dropped_label = 0usize;

    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let id = BagId::parse(record.get(columns.id).unwrap_or(""));

        let labels: Option<Vec<u8>> = columns
            .labels
            .iter()
            .map(|&idx| parse_flag(record.get(idx).unwrap_or("")))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .collect();
        let Some(labels) = labels else {
            debug!("Row {}: bag {} has a missing label, skipping", row, id);
            dropped_label += 1;
            continue;
        };

        let names = parse_image_list(record.get(columns.images).unwrap_or(""))?;
        if !(config.min_bag_size..=config.max_bag_size).contains(&names.len()) {
            debug!("Row {}: bag {} has {} images, skipping", row, id, names.len());
            dropped_size += 1;
            continue;
        }

        let instances = names
            .iter()
            .map(|name| Instance {
                image: config.image_root.join(name),
                label: instance_labels.get(name).copied(),
            })
            .collect();

        let is_validation = match columns.split {
            Some(idx) => parse_flag(record.get(idx).unwrap_or(""))? == Some(1),
            None => false,
        };

        let bag = Bag::new(id, instances, labels);
        if is_validation {
            validation.push(bag);
        } else {
            train.push(bag);
        }
    }

    if dropped_size > 0 {
        warn!(
            "Dropped {} bags outside the size range [{}, {}]",
            dropped_size, config.min_bag_size, config.max_bag_size
        );
    }
    if dropped_label > 0 {
        warn!("Dropped {} bags with missing bag labels", dropped_label);
    }

    let splits = BagSplits {
        train: BagStore::from_bags(train)?,
        validation: BagStore::from_bags(validation)?,
    };

    splits.ensure_disjoint()?;

    info!(
        "Loaded {} training and {} validation bags",
        splits.train.len(),
        splits.validation.len()
    );
    Ok(splits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_tables(dir: &TempDir, bags: &str, instances: Option<&str>) -> BagTableConfig {
        let bag_table = dir.path().join("bags.csv");
        fs::write(&bag_table, bags).unwrap();

        let instance_table = instances.map(|content| {
            let path = dir.path().join("instances.csv");
            fs::write(&path, content).unwrap();
            path
        });

        BagTableConfig {
            bag_table,
            image_root: dir.path().join("images"),
            instance_table,
            split_column: Some("valid".to_string()),
            min_bag_size: 1,
            max_bag_size: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("True").unwrap(), Some(1));
        assert_eq!(parse_flag(" 0.0 ").unwrap(), Some(0));
        assert_eq!(parse_flag("nan").unwrap(), None);
        assert_eq!(parse_flag("").unwrap(), None);
        assert!(parse_flag("maybe").is_err());
    }

    #[test]
    fn test_parse_image_list_forms() {
        assert_eq!(parse_image_list("['a.png', 'b.png']").unwrap(), vec!["a.png", "b.png"]);
        assert_eq!(parse_image_list(r#"["a.png","b.png"]"#).unwrap(), vec!["a.png", "b.png"]);
        assert!(parse_image_list("[]").unwrap().is_empty());
        assert!(parse_image_list("a.png").is_err());
    }

    #[test]
    fn test_load_splits_and_filters() {
        let dir = TempDir::new().unwrap();
        let bags = "\
ID,Images,Has_Malignant,valid
12,\"['12_0.png', '12_1.png']\",True,0
13,\"['13_0.png']\",0,1
14,\"['a.png', 'b.png', 'c.png', 'd.png']\",1,0
15,\"['15_0.png']\",,0
16.0,\"['16_0.png']\",False,0
";
        let instances = "\
ImageName,Malignant
12_0.png,1
12_1.png,nan
";
        let config = write_tables(&dir, bags, Some(instances));
        let splits = load_bags(&config).unwrap();

        assert_eq!(splits.train.len(), 2);
        assert_eq!(splits.validation.len(), 1);

        let bag = splits.train.get(&BagId::Int(12)).unwrap();
        assert_eq!(bag.label(), 1);
        assert_eq!(bag.instances[0].label, Some(1));
        assert_eq!(bag.instances[1].label, None);
        assert_eq!(bag.instances[0].image, dir.path().join("images").join("12_0.png"));

        assert!(splits.train.contains(&BagId::Int(16)));
        assert!(!splits.train.contains(&BagId::Int(14)));
        assert!(!splits.train.contains(&BagId::Int(15)));
        assert!(splits.validation.contains(&BagId::Int(13)));
    }

    #[test]
    fn test_missing_column_is_dataset_error() {
        let dir = TempDir::new().unwrap();
        let config = write_tables(&dir, "ID,Files,Has_Malignant\n1,\"['a.png']\",1\n", None);
        assert!(matches!(load_bags(&config), Err(MilError::Dataset(_))));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let dir = TempDir::new().unwrap();
        let bags = "ID,Images,Has_Malignant,valid\n7,\"['a.png']\",1,0\n7.0,\"['b.png']\",0,0\n";
        let config = write_tables(&dir, bags, None);
        assert!(matches!(load_bags(&config), Err(MilError::Dataset(_))));
    }

    #[test]
    fn test_without_split_column_everything_trains() {
        let dir = TempDir::new().unwrap();
        let mut config = write_tables(&dir, "ID,Images,Has_Malignant\nx1,\"['a.png']\",1\n", None);
        config.split_column = None;
        let splits = load_bags(&config).unwrap();
        assert_eq!(splits.train.len(), 1);
        assert!(splits.validation.is_empty());
        assert!(splits.train.contains(&BagId::Text("x1".into())));
    }
}
