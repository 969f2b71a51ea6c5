// ============================================================
// Layer 2 - CaptionUseCase
// ============================================================
// Inference workflow: read the run record and the manifest from
// the checkpoint directory, rebuild the model it describes, load
// the latest weights, and run greedy decoding on one image.

use anyhow::{Context, Result};

use crate::data::images::ImageTransform;
use crate::domain::traits::CaptionGenerator;
use crate::infra::checkpoint::CheckpointManager;
use crate::infra::vocab_store::Vocabulary;
use crate::ml::generator::GreedyGenerator;
use crate::ml::model::CaptionModel;
use crate::ml::trainer::build_model;

type InferBackend = burn::backend::Wgpu;

pub struct CaptionUseCase {
    checkpoint_dir: String,
    max_len: usize,
}

impl CaptionUseCase {
    pub fn new(checkpoint_dir: impl Into<String>, max_len: usize) -> Self {
        Self { checkpoint_dir: checkpoint_dir.into(), max_len }
    }

    /// Caption the image at `image_path` with the latest checkpoint.
    pub fn execute(&self, image_path: &str) -> Result<String> {
        let ckpt = CheckpointManager::new(&self.checkpoint_dir);

        let record = ckpt
            .load_config()?
            .with_context(|| {
                format!(
                    "no run record under '{}'; run 'train' first",
                    self.checkpoint_dir
                )
            })?;
        let manifest = ckpt.manifest()?.with_context(|| {
            format!("no checkpoint under '{}'; run 'train' first", self.checkpoint_dir)
        })?;

        let vocab = Vocabulary::load(&record.vocab_file)?;

        let device = burn::backend::wgpu::WgpuDevice::default();
        let model: CaptionModel<InferBackend> = build_model(&record, &device)?;
        let model = ckpt.load_model(model, &manifest, &device)?;
        tracing::info!(
            "model restored from epoch {} of run '{}'",
            manifest.last_epoch,
            manifest.run
        );

        // inference always uses the deterministic eval transform
        let generator = GreedyGenerator::new(
            model,
            vocab,
            ImageTransform::new(record.transform_val.clone()),
            device,
            self.max_len,
        );
        generator.generate(image_path)
    }
}
