//! Round-state checkpointing.
//!
//! This module provides:
//! - Round state persistence as JSON
//! - Write-new-then-swap saves, so a failed write never clobbers the last good file
//! - Checkpoint management (latest pointer, per-round files, pruning)

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::scheduler::RatioScheduler;
use super::state::RoundState;
use crate::utils::error::{MilError, Result};

const LATEST_FILE: &str = "latest.json";

/// Checkpoint containing the round state and the schedule it was produced under
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub state: RoundState,
    /// Schedule fingerprint, compared on resume
    pub schedule: RatioScheduler,
    pub timestamp: String,
    pub note: Option<String>,
}

impl Checkpoint {
    /// Create a new checkpoint stamped with the current time
    pub fn new(state: RoundState, schedule: RatioScheduler) -> Self {
        use chrono::Utc;
        let timestamp = Utc::now().to_rfc3339();

        Self {
            state,
            schedule,
            timestamp,
            note: None,
        }
    }

    /// Attach a free-form note
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Save checkpoint to file
    ///
    /// The JSON is written to `<path>.tmp` and renamed over `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| MilError::Checkpoint(parent.to_path_buf(), e.to_string()))?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| MilError::Serialization(format!("Failed to serialize checkpoint: {}", e)))?;

        let tmp_path = tmp_path_for(path);
        fs::write(&tmp_path, json).map_err(|e| MilError::Checkpoint(tmp_path.clone(), e.to_string()))?;
        fs::rename(&tmp_path, path).map_err(|e| MilError::Checkpoint(path.to_path_buf(), e.to_string()))?;

        debug!("Checkpoint saved to {:?}", path);
        Ok(())
    }

    /// Load checkpoint from file
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|e| MilError::Checkpoint(path.to_path_buf(), e.to_string()))?;

        let checkpoint: Checkpoint = serde_json::from_str(&json)
            .map_err(|e| MilError::Checkpoint(path.to_path_buf(), format!("Failed to deserialize checkpoint: {}", e)))?;

        debug!("Checkpoint loaded from {:?}", path);
        Ok(checkpoint)
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Manager for the checkpoint directory
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    keep_last_n: Option<usize>,
}

impl CheckpointManager {
    /// Create a new checkpoint manager
    pub fn new(checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            keep_last_n: Some(3),
        }
    }

    /// Configure how many per-round checkpoints to keep
    pub fn keep_last_n(mut self, n: Option<usize>) -> Self {
        self.keep_last_n = n;
        self
    }

    /// Save `checkpoint` as `round_<n>.json` and as `latest.json`
    ///
    /// The round number is the index of the next round to run.
    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        let round_path = self.round_path(checkpoint.state.round);
        checkpoint.save(&round_path)?;
        checkpoint.save(&self.latest_path())?;

        info!("Checkpoint for round {} saved to {:?}", checkpoint.state.round, round_path);

        if let Some(keep_n) = self.keep_last_n {
            self.cleanup_old_checkpoints(keep_n);
        }

        Ok(round_path)
    }

    /// Whether a latest checkpoint exists
    pub fn has_latest(&self) -> bool {
        self.latest_path().is_file()
    }

    /// Load the latest checkpoint
    pub fn load_latest(&self) -> Result<Checkpoint> {
        Checkpoint::load(&self.latest_path())
    }

    /// Load a specific checkpoint by round
    pub fn load_round(&self, round: usize) -> Result<Checkpoint> {
        Checkpoint::load(&self.round_path(round))
    }

    /// List per-round checkpoints, oldest first
    pub fn list_checkpoints(&self) -> Result<Vec<PathBuf>> {
        if !self.checkpoint_dir.exists() {
            return Ok(Vec::new());
        }

        let mut checkpoints = Vec::new();
        for entry in fs::read_dir(&self.checkpoint_dir)? {
            let path = entry?.path();
            let round = path
                .file_name()
                .and_then(|s| s.to_str())
                .and_then(extract_round_from_filename);

            if let (true, Some(round)) = (path.is_file(), round) {
                checkpoints.push((round, path));
            }
        }

        // Numeric order: round_10 comes after round_9
        checkpoints.sort_by_key(|(round, _)| *round);
        Ok(checkpoints.into_iter().map(|(_, path)| path).collect())
    }

    /// Clean up old checkpoints, keeping only the last N
    ///
    /// Failures are logged and never undo a save. Returns how many files
    /// were removed.
    fn cleanup_old_checkpoints(&self, keep_n: usize) -> usize {
        let checkpoints = match self.list_checkpoints() {
            Ok(checkpoints) => checkpoints,
            Err(e) => {
                warn!("Failed to list checkpoints in {:?}: {}", self.checkpoint_dir, e);
                return 0;
            }
        };
        if checkpoints.len() <= keep_n {
            return 0;
        }

        let to_remove = checkpoints.len() - keep_n;
        let mut removed = 0;
        for checkpoint_path in checkpoints.iter().take(to_remove) {
            if let Err(e) = fs::remove_file(checkpoint_path) {
                warn!("Failed to remove old checkpoint {:?}: {}", checkpoint_path, e);
            } else {
                debug!("Removed old checkpoint: {:?}", checkpoint_path);
                removed += 1;
            }
        }

        removed
    }

    /// Get checkpoint directory path
    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    fn latest_path(&self) -> PathBuf {
        self.checkpoint_dir.join(LATEST_FILE)
    }

    fn round_path(&self, round: usize) -> PathBuf {
        self.checkpoint_dir.join(format!("round_{}.json", round))
    }
}

/// Extract the round number from a checkpoint filename (`round_12.json`)
pub fn extract_round_from_filename(filename: &str) -> Option<usize> {
    filename
        .strip_prefix("round_")
        .and_then(|s| s.strip_suffix(".json"))
        .and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::selection::{build_mask, ConfidenceScores, ScoreKind};
    use crate::training::state::Phase;
    use tempfile::TempDir;

    fn state(round: usize) -> RoundState {
        let mut scores = ConfidenceScores::new();
        scores.insert(1i64, vec![0.9, 0.2]);
        scores.insert("acc-7", vec![0.6]);

        let mut state = RoundState::initial(2);
        state.round = round;
        state.phase = Phase::SteadyState;
        state.best_instance_loss = Some(0.5);
        state.selection_mask = build_mask(&scores, 0.5, ScoreKind::Probability);
        state
    }

    #[test]
    fn test_checkpoint_save_load() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("ckpt.json");

        let original = Checkpoint::new(state(3), RatioScheduler::default()).with_note("test");
        original.save(&path)?;
        assert!(path.exists());
        assert!(!temp_dir.path().join("nested").join("ckpt.json.tmp").exists());

        let loaded = Checkpoint::load(&path)?;
        assert_eq!(loaded, original);
        assert_eq!(loaded.state.best_bag_loss, None);
        Ok(())
    }

    #[test]
    fn test_checkpoint_manager_prunes_numerically() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path()).keep_last_n(Some(2));

        for round in [1, 2, 9, 10, 11] {
            manager.save_checkpoint(&Checkpoint::new(state(round), RatioScheduler::default()))?;
        }

        let names: Vec<String> = manager
            .list_checkpoints()?
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["round_10.json", "round_11.json"]);

        assert_eq!(manager.load_latest()?.state.round, 11);
        assert_eq!(manager.load_round(10)?.state.round, 10);
        assert!(manager.load_round(2).is_err());
        Ok(())
    }

    #[test]
    fn test_pruning_failure_is_not_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let not_a_dir = temp_dir.path().join("ckpt");
        fs::write(&not_a_dir, "").unwrap();

        let manager = CheckpointManager::new(&not_a_dir).keep_last_n(Some(1));
        assert!(manager.list_checkpoints().is_err());
        assert_eq!(manager.cleanup_old_checkpoints(1), 0);
    }

    #[test]
    fn test_missing_latest() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path().join("none"));
        assert!(!manager.has_latest());
        assert!(matches!(manager.load_latest(), Err(MilError::Checkpoint(_, _))));
        assert!(manager.list_checkpoints().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_checkpoint_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("latest.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Checkpoint::load(&path), Err(MilError::Checkpoint(_, _))));
    }

    #[test]
    fn test_extract_round_from_filename() {
        assert_eq!(extract_round_from_filename("round_12.json"), Some(12));
        assert_eq!(extract_round_from_filename("latest.json"), None);
        assert_eq!(extract_round_from_filename("round_3.json.tmp"), None);
    }
}
