// ============================================================
// Layer 2 - TrainUseCase
// ============================================================
// Orchestrates a training run end to end:
//
//   Step 1: Load the vocabulary            (Layer 6 - infra)
//   Step 2: Open the checkpoint directory,
//           write or verify the run record (Layer 6 - infra)
//   Step 3: Load train/val sample indexes  (Layer 4 - data)
//   Step 4: Build datasets                 (Layer 4 - data)
//   Step 5: Open the metrics stream        (Layer 6 - infra)
//   Step 6: Run the training loop          (Layer 5 - ml)

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::data::dataset::{CaptionDataset, IndexFile};
use crate::data::images::{ImageTransform, TransformConfig};
use crate::domain::errors::PipelineError;
use crate::domain::traits::SampleSource;
use crate::infra::checkpoint::CheckpointManager;
use crate::infra::metrics::MetricsLogger;
use crate::infra::vocab_store::Vocabulary;
use crate::ml::trainer::run_training;

// ─── RunRecord ────────────────────────────────────────────────────────────────
// The hyperparameter record: everything that must stay identical
// across resumes of one run. Captured once at run creation, persisted
// as run_config.json, and compared field-for-field on every later
// launch. Run-control knobs that may legitimately change between
// launches (total epochs, cadences, checkpoint directory) live in
// TrainConfig instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_name: String,

    pub lr: f64,
    pub weight_decay: Option<f32>,
    /// Elementwise gradient clamp threshold; None disables clamping
    pub grad_clip: Option<f32>,
    /// Adam (with the step-counter repair) when true, plain SGD when false
    pub adam: bool,
    pub batch_size: usize,

    /// Real word count V; the model id space adds the unknown
    /// sentinel and the two markers on top
    pub vocab_words: usize,
    pub embed_dim: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub rnn_dropout: f64,
    pub cnn_dropout: f64,
    pub encoder_base_width: usize,
    pub freeze_backbone: bool,
    pub freeze_embeddings: bool,

    pub vocab_file: String,
    pub train_index: String,
    pub val_index: String,
    pub backbone_file: Option<String>,
    pub embeddings_file: Option<String>,

    pub shuffle_seed: u64,
    pub transform_train: TransformConfig,
    pub transform_val: TransformConfig,
}

impl RunRecord {
    /// Full id space: unknown + words + start/end markers.
    pub fn model_vocab_size(&self) -> usize {
        self.vocab_words + 3
    }
}

// ─── TrainConfig ──────────────────────────────────────────────────────────────
/// Everything the train command needs: the persisted run record plus
/// the per-launch run controls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub record: RunRecord,
    pub epochs: usize,
    pub checkpoint_dir: String,
    /// Emit the batch-loss metric every this many batches
    pub log_every: usize,
    /// Save a checkpoint every this many epochs
    pub checkpoint_every: usize,
}

// ─── TrainUseCase ─────────────────────────────────────────────────────────────
pub struct TrainUseCase {
    config: TrainConfig,
}

impl TrainUseCase {
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    pub fn execute(&self) -> Result<()> {
        let cfg = &self.config;
        let record = &cfg.record;

        // ── Step 1: Vocabulary ────────────────────────────────────────────────
        let vocab = Vocabulary::load(&record.vocab_file)?;
        if vocab.len() != record.vocab_words + 1 {
            return Err(PipelineError::ConfigMismatch(format!(
                "vocabulary file holds {} words but the run record says {}",
                vocab.len() - 1,
                record.vocab_words
            ))
            .into());
        }
        tracing::info!(
            "vocabulary loaded: {} words, model id space {}",
            record.vocab_words,
            record.model_vocab_size()
        );

        // ── Step 2: Checkpoint directory + run record ─────────────────────────
        // First launch writes run_config.json; a relaunch must supply
        // identical hyperparameters or fail loudly.
        let ckpt = CheckpointManager::new(&cfg.checkpoint_dir);
        ckpt.ensure_config(record)?;

        // ── Step 3: Sample indexes ────────────────────────────────────────────
        let train_records = IndexFile::new(&record.train_index).load_all()?;
        let val_records = IndexFile::new(&record.val_index).load_all()?;

        // ── Step 4: Datasets with their transforms ────────────────────────────
        let train_dataset = CaptionDataset::new(
            train_records,
            ImageTransform::new(record.transform_train.clone()),
        );
        let val_dataset = CaptionDataset::new(
            val_records,
            ImageTransform::new(record.transform_val.clone()),
        );
        tracing::info!(
            "datasets ready: {} train, {} val",
            train_dataset.record_count(),
            val_dataset.record_count()
        );

        // ── Step 5: Metrics stream ────────────────────────────────────────────
        let metrics = MetricsLogger::new(&cfg.checkpoint_dir)?;

        // ── Step 6: Training loop ─────────────────────────────────────────────
        type TrainBackend = burn::backend::Autodiff<burn::backend::Wgpu>;
        let device = burn::backend::wgpu::WgpuDevice::default();
        tracing::info!("using WGPU device: {:?}", device);

        run_training::<TrainBackend>(
            record,
            cfg.epochs,
            cfg.log_every,
            cfg.checkpoint_every,
            train_dataset,
            val_dataset,
            &ckpt,
            &metrics,
            device,
        )
    }
}
