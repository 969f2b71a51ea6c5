// ============================================================
// Layer 6 - Checkpoint Manager
// ============================================================
// Persists and restores full training state using Burn's
// CompactRecorder for the parameter/optimizer records and JSON
// for the scalar counters.
//
// Files per saved epoch E (all fresh, never overwritten):
//   model_epoch_E.mpk.gz  - encoder + decoder parameters
//   optim_epoch_E.mpk.gz  - optimizer internal state
//   state_epoch_E.json    - {epoch, batch_step, seconds_trained}
//
// One mutable file points at the latest complete set:
//   manifest.json         - {run, last_epoch, file references}
// It is replaced via temp-file + rename only after every epoch
// file has landed, so a crash mid-save leaves the previous
// checkpoint fully intact.
//
// The hyperparameter record is written once at run creation:
//   run_config.json
// and compared field-for-field on every later launch.

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::{
    module::{AutodiffModule, Module},
    prelude::*,
    record::{CompactRecorder, Recorder},
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};

use crate::application::train_use_case::RunRecord;
use crate::domain::errors::PipelineError;
use crate::ml::optimizer::CaptionOptimizer;

// ─── TrainState ───────────────────────────────────────────────────────────────
/// The scalar counters of a run. `epoch` is the last completed epoch
/// (0 before any epoch finishes); the epoch in progress is always
/// `epoch + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainState {
    pub epoch: usize,
    /// Global metric-emission step counter, 1-based
    pub batch_step: usize,
    /// Cumulative wall-clock seconds spent training across resumes
    pub seconds_trained: f64,
}

impl TrainState {
    pub fn fresh() -> Self {
        Self { epoch: 0, batch_step: 1, seconds_trained: 0.0 }
    }
}

// ─── Manifest ─────────────────────────────────────────────────────────────────
/// Explicit pointer to the most recent complete checkpoint. Listing
/// the directory and guessing from filenames is deliberately not how
/// resumption works.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub run: String,
    pub last_epoch: usize,
    /// Recorder file stems; the recorder appends its own extension
    pub model_file: String,
    pub optim_file: String,
    pub state_file: String,
}

// ─── CheckpointManager ────────────────────────────────────────────────────────
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// Create a manager rooted at `dir`, creating the directory if
    /// needed.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).ok();
        Self { dir }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    // ── Hyperparameter record ─────────────────────────────────────────────────

    /// Load the persisted hyperparameter record, if this run has one.
    pub fn load_config(&self) -> Result<Option<RunRecord>> {
        let path = self.dir.join("run_config.json");
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read '{}'", path.display()))?;
        let config = serde_json::from_str(&json).map_err(|e| {
            PipelineError::CheckpointCorruption(format!(
                "run_config.json does not parse: {e}"
            ))
        })?;
        Ok(Some(config))
    }

    /// First launch writes the supplied record; every later launch must
    /// supply an identical one. A drifted field is surfaced, never
    /// silently overridden in either direction.
    pub fn ensure_config(&self, supplied: &RunRecord) -> Result<()> {
        match self.load_config()? {
            None => {
                let path = self.dir.join("run_config.json");
                std::fs::write(&path, serde_json::to_string_pretty(supplied)?)
                    .with_context(|| format!("cannot write '{}'", path.display()))?;
                tracing::info!("hyperparameter record created at '{}'", path.display());
                Ok(())
            }
            Some(saved) if saved == *supplied => Ok(()),
            Some(saved) => Err(PipelineError::ConfigMismatch(format!(
                "run '{}' was created with different hyperparameters; \
                 pass the stored settings or start a fresh checkpoint directory \
                 (stored: {saved:?})",
                saved.run_name
            ))
            .into()),
        }
    }

    // ── Manifest ──────────────────────────────────────────────────────────────

    /// The latest complete checkpoint, or None for a fresh run.
    pub fn manifest(&self) -> Result<Option<Manifest>> {
        let path = self.dir.join("manifest.json");
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read '{}'", path.display()))?;
        let manifest: Manifest = serde_json::from_str(&json).map_err(|e| {
            PipelineError::CheckpointCorruption(format!("manifest.json does not parse: {e}"))
        })?;
        // every referenced file must exist before we promise a resume
        let state_path = self.dir.join(&manifest.state_file);
        if !state_path.exists() {
            return Err(PipelineError::CheckpointCorruption(format!(
                "manifest references missing state file '{}'",
                state_path.display()
            ))
            .into());
        }
        Ok(Some(manifest))
    }

    fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        let target = self.dir.join("manifest.json");
        let temp = self.dir.join("manifest.json.tmp");
        std::fs::write(&temp, serde_json::to_string_pretty(manifest)?)
            .with_context(|| format!("cannot write '{}'", temp.display()))?;
        std::fs::rename(&temp, &target)
            .with_context(|| format!("cannot replace '{}'", target.display()))?;
        Ok(())
    }

    // ── Saving ────────────────────────────────────────────────────────────────

    /// Persist one epoch's full training state and repoint the
    /// manifest at it. A failed write here is fatal to the run.
    pub fn save_epoch<B, M>(
        &self,
        run: &str,
        model: &M,
        optim: &CaptionOptimizer<M, B>,
        state: &TrainState,
    ) -> Result<()>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        let model_file = format!("model_epoch_{}", state.epoch);
        let optim_file = format!("optim_epoch_{}", state.epoch);
        let state_file = format!("state_epoch_{}.json", state.epoch);

        CompactRecorder::new()
            .record(model.clone().into_record(), self.dir.join(&model_file))
            .with_context(|| format!("failed to save model checkpoint for epoch {}", state.epoch))?;
        optim
            .save(self.dir.join(&optim_file))
            .with_context(|| format!("failed to save optimizer state for epoch {}", state.epoch))?;
        std::fs::write(self.dir.join(&state_file), serde_json::to_string_pretty(state)?)
            .with_context(|| format!("failed to save train state for epoch {}", state.epoch))?;

        self.write_manifest(&Manifest {
            run: run.to_string(),
            last_epoch: state.epoch,
            model_file,
            optim_file,
            state_file,
        })?;

        tracing::debug!("checkpoint saved for epoch {}", state.epoch);
        Ok(())
    }

    // ── Loading ───────────────────────────────────────────────────────────────

    pub fn load_model<B, M>(&self, model: M, manifest: &Manifest, device: &B::Device) -> Result<M>
    where
        B: Backend,
        M: Module<B>,
    {
        let path = self.dir.join(&manifest.model_file);
        let record = CompactRecorder::new().load(path.clone(), device).map_err(|e| {
            PipelineError::CheckpointCorruption(format!(
                "model record '{}' unreadable: {e}",
                path.display()
            ))
        })?;
        Ok(model.load_record(record))
    }

    pub fn load_optimizer<B, M>(
        &self,
        optim: CaptionOptimizer<M, B>,
        manifest: &Manifest,
        device: &B::Device,
    ) -> Result<CaptionOptimizer<M, B>>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        let path = self.dir.join(&manifest.optim_file);
        optim.load(path.clone(), device).map_err(|e| {
            PipelineError::CheckpointCorruption(format!(
                "optimizer record '{}' unreadable: {e}",
                path.display()
            ))
            .into()
        })
    }

    pub fn load_state(&self, manifest: &Manifest) -> Result<TrainState> {
        let path = self.dir.join(&manifest.state_file);
        let json = std::fs::read_to_string(&path).map_err(|e| {
            PipelineError::CheckpointCorruption(format!(
                "state file '{}' unreadable: {e}",
                path.display()
            ))
        })?;
        let state: TrainState = serde_json::from_str(&json).map_err(|e| {
            PipelineError::CheckpointCorruption(format!(
                "state file '{}' does not parse: {e}",
                path.display()
            ))
        })?;
        Ok(state)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::images::TransformConfig;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("captioner_ckpt_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn config() -> RunRecord {
        RunRecord {
            run_name: "test-run".into(),
            lr: 1e-4,
            weight_decay: Some(1e-4),
            grad_clip: Some(5.0),
            adam: true,
            batch_size: 2,
            vocab_words: 3,
            embed_dim: 8,
            hidden_size: 12,
            num_layers: 1,
            rnn_dropout: 0.0,
            cnn_dropout: 0.0,
            encoder_base_width: 2,
            freeze_backbone: false,
            freeze_embeddings: false,
            vocab_file: "vocab.json".into(),
            train_index: "train.jsonl".into(),
            val_index: "val.jsonl".into(),
            backbone_file: None,
            embeddings_file: None,
            shuffle_seed: 42,
            transform_train: TransformConfig::train((16, 16)),
            transform_val: TransformConfig::eval((16, 16)),
        }
    }

    #[test]
    fn test_fresh_run_has_no_manifest() {
        let ckpt = CheckpointManager::new(temp_dir("fresh"));
        assert!(ckpt.manifest().unwrap().is_none());
    }

    #[test]
    fn test_config_written_once_then_matched() {
        let ckpt = CheckpointManager::new(temp_dir("config"));
        let cfg = config();
        ckpt.ensure_config(&cfg).unwrap();
        // identical settings resume cleanly
        ckpt.ensure_config(&cfg).unwrap();
        assert_eq!(ckpt.load_config().unwrap().unwrap(), cfg);
    }

    #[test]
    fn test_config_drift_is_surfaced() {
        let ckpt = CheckpointManager::new(temp_dir("drift"));
        ckpt.ensure_config(&config()).unwrap();
        let mut drifted = config();
        drifted.lr = 5e-3;
        let err = ckpt.ensure_config(&drifted).unwrap_err();
        assert!(err.to_string().contains("hyperparameter mismatch"));
    }

    #[test]
    fn test_corrupt_manifest_is_fatal() {
        let dir = temp_dir("corrupt");
        std::fs::write(dir.join("manifest.json"), "{not json").unwrap();
        let ckpt = CheckpointManager::new(dir);
        let err = ckpt.manifest().unwrap_err();
        assert!(err.to_string().contains("checkpoint corrupted"));
    }

    #[test]
    fn test_manifest_with_missing_files_is_fatal() {
        let dir = temp_dir("dangling");
        let manifest = Manifest {
            run: "r".into(),
            last_epoch: 3,
            model_file: "model_epoch_3".into(),
            optim_file: "optim_epoch_3".into(),
            state_file: "state_epoch_3.json".into(),
        };
        std::fs::write(
            dir.join("manifest.json"),
            serde_json::to_string(&manifest).unwrap(),
        )
        .unwrap();
        let ckpt = CheckpointManager::new(dir);
        assert!(ckpt.manifest().is_err());
    }

    #[test]
    fn test_state_round_trip_preserves_counters() {
        let dir = temp_dir("state");
        let state = TrainState { epoch: 4, batch_step: 17, seconds_trained: 321.5 };
        std::fs::write(
            dir.join("state_epoch_4.json"),
            serde_json::to_string(&state).unwrap(),
        )
        .unwrap();
        let manifest = Manifest {
            run: "r".into(),
            last_epoch: 4,
            model_file: "m".into(),
            optim_file: "o".into(),
            state_file: "state_epoch_4.json".into(),
        };
        let ckpt = CheckpointManager::new(dir);
        let loaded = ckpt.load_state(&manifest).unwrap();
        assert_eq!(loaded, state);
        // the epoch in progress after restore is E + 1
        assert_eq!(loaded.epoch + 1, 5);
    }
}
