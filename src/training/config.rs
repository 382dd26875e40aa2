//! Self-training configuration
//!
//! Loaded from TOML:
//! ```toml
//! seed = 42
//!
//! [schedule]
//! total_rounds = 500
//! warmup_rounds = 10
//! initial_ratio = 0.0
//! final_ratio = 0.25
//! curve = "linear"
//!
//! [selection]
//! score_kind = "probability"
//!
//! [instance]
//! batch_size = 32
//! balanced_warmup = true
//!
//! [data]
//! bag_table = "data/train.csv"
//! image_root = "data/images"
//! split_column = "valid"
//!
//! [checkpoint]
//! dir = "checkpoints"
//! keep_last_n = 3
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::scheduler::RatioScheduler;
use super::selection::ScoreKind;
use crate::dataset::loader::BagTableConfig;
use crate::utils::error::{MilError, Result};

/// Selection mask settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// How aggregator scores are read
    pub score_kind: ScoreKind,
}

/// Instance encoder batching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Examples per batch
    pub batch_size: usize,
    /// Mix unconfident-origin examples into every warmup batch
    pub balanced_warmup: bool,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            balanced_warmup: true,
        }
    }
}

/// Checkpoint directory and retention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub dir: PathBuf,
    /// Per-round files to keep, 0 keeps all (`latest.json` is always kept)
    pub keep_last_n: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("checkpoints"),
            keep_last_n: 3,
        }
    }
}

/// Complete configuration for a self-training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfTrainingConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub schedule: RatioScheduler,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub instance: InstanceConfig,
    #[serde(default)]
    pub data: BagTableConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

fn default_seed() -> u64 {
    crate::DEFAULT_SEED
}

impl Default for SelfTrainingConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            schedule: RatioScheduler::default(),
            selection: SelectionConfig::default(),
            instance: InstanceConfig::default(),
            data: BagTableConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl SelfTrainingConfig {
    /// Reject settings that would make a run fail or silently misbehave
    pub fn validate(&self) -> Result<()> {
        self.schedule.validate()?;

        if self.instance.batch_size == 0 {
            return Err(MilError::Config("instance.batch_size must be positive".to_string()));
        }

        if self.instance.balanced_warmup && self.instance.batch_size < 2 {
            return Err(MilError::Config(format!(
                "balanced warmup needs instance.batch_size >= 2, got {}",
                self.instance.batch_size
            )));
        }

        if self.data.min_bag_size > self.data.max_bag_size {
            return Err(MilError::Config(format!(
                "data.min_bag_size ({}) exceeds data.max_bag_size ({})",
                self.data.min_bag_size, self.data.max_bag_size
            )));
        }

        if self.schedule.total_rounds == 0 {
            return Err(MilError::Config("schedule.total_rounds must be positive".to_string()));
        }

        if self.data.label_columns.is_empty() {
            return Err(MilError::Config("data.label_columns must name at least one column".to_string()));
        }

        Ok(())
    }

    /// Load and validate a TOML config
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| MilError::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;

        let config: SelfTrainingConfig = toml::from_str(&content)?;
        config.validate()?;

        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Save as TOML
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::scheduler::RatioCurve;
    use tempfile::TempDir;

    #[test]
    fn test_default_is_valid() {
        SelfTrainingConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SelfTrainingConfig = toml::from_str(
            r#"
            seed = 7

            [schedule]
            total_rounds = 40
            warmup_rounds = 4
            initial_ratio = 0.0
            final_ratio = 0.5
            curve = "cosine"

            [selection]
            score_kind = "logit"
            "#,
        )
        .unwrap();

        assert_eq!(config.seed, 7);
        assert_eq!(config.schedule.curve, RatioCurve::Cosine);
        assert_eq!(config.selection.score_kind, ScoreKind::Logit);
        assert_eq!(config.instance, InstanceConfig::default());
        assert_eq!(config.data.id_column, "ID");
        config.validate().unwrap();
    }

    #[test]
    fn test_validation_rules() {
        let mut config = SelfTrainingConfig::default();
        config.schedule.warmup_rounds = config.schedule.total_rounds + 1;
        assert!(config.validate().unwrap_err().is_config());

        let mut config = SelfTrainingConfig::default();
        config.schedule.final_ratio = 1.5;
        assert!(config.validate().unwrap_err().is_config());

        let mut config = SelfTrainingConfig::default();
        config.instance.batch_size = 1;
        assert!(config.validate().is_err());
        config.instance.balanced_warmup = false;
        assert!(config.validate().is_ok());
        config.instance.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = SelfTrainingConfig::default();
        config.data.min_bag_size = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = SelfTrainingConfig::default();
        config.data.instance_table = Some(PathBuf::from("labels.csv"));
        config.checkpoint.keep_last_n = 0;
        config.data.split_column = Some("valid".to_string());
        config.save(&path).unwrap();

        assert_eq!(SelfTrainingConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[schedule\ntotal_rounds = ").unwrap();
        assert!(SelfTrainingConfig::load(&path).unwrap_err().is_config());
    }
}
