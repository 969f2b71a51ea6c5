// ============================================================
// Layer 5 - Training Loop
// ============================================================
// Full train + validation loop over the caption batches, with the
// gradient stabilization step, metric cadence, per-epoch
// checkpointing and manifest-driven resume.
//
// Backend split, as everywhere in this layer:
//   - training runs on an AutodiffBackend
//   - model.valid() drops to the inner backend for validation,
//     which also disables dropout

use std::time::Instant;

use anyhow::{Context, Result};
use burn::{
    data::dataloader::DataLoaderBuilder,
    module::AutodiffModule,
    optim::GradientsParams,
    prelude::*,
    tensor::backend::AutodiffBackend,
};

use crate::application::train_use_case::RunRecord;
use crate::data::batcher::CaptionBatcher;
use crate::data::dataset::CaptionDataset;
use crate::domain::errors::PipelineError;
use crate::infra::checkpoint::{CheckpointManager, TrainState};
use crate::infra::metrics::MetricsLogger;
use crate::infra::vocab_store::EmbeddingTable;
use crate::ml::decoder::CaptionDecoderConfig;
use crate::ml::encoder::ImageEncoderConfig;
use crate::ml::model::{CaptionModel, CaptionModelConfig};
use crate::ml::optimizer::CaptionOptimizer;

/// Build the model a run record describes: architecture, pretrained
/// backbone/embedding loads, freeze flags.
pub fn build_model<B: Backend>(record: &RunRecord, device: &B::Device) -> Result<CaptionModel<B>> {
    let model_config = CaptionModelConfig::new(
        ImageEncoderConfig::new(record.embed_dim)
            .with_dropout(record.cnn_dropout)
            .with_base_width(record.encoder_base_width),
        CaptionDecoderConfig::new(record.model_vocab_size(), record.embed_dim, record.hidden_size)
            .with_num_layers(record.num_layers)
            .with_dropout(record.rnn_dropout),
    );
    let mut model = model_config.init(device);

    if let Some(path) = &record.backbone_file {
        model.encoder = model.encoder.load_backbone(std::path::Path::new(path), device)?;
    }
    if record.freeze_backbone {
        model.encoder = model.encoder.freeze_backbone();
    }
    if let Some(path) = &record.embeddings_file {
        let table = EmbeddingTable::load(path)?.with_marker_rows();
        model.decoder = model.decoder.with_pretrained_embeddings(&table, device)?;
        tracing::info!("decoder embeddings initialized from '{path}'");
    }
    if record.freeze_embeddings {
        model.decoder = model.decoder.freeze_embeddings();
    }
    Ok(model)
}

fn build_optimizer<B, M>(record: &RunRecord) -> CaptionOptimizer<M, B>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    if record.adam {
        CaptionOptimizer::adam(record.weight_decay, record.grad_clip)
    } else {
        CaptionOptimizer::sgd(record.weight_decay, record.grad_clip)
    }
}

pub fn run_training<B: AutodiffBackend>(
    record: &RunRecord,
    epochs: usize,
    log_every: usize,
    checkpoint_every: usize,
    train_dataset: CaptionDataset,
    val_dataset: CaptionDataset,
    ckpt: &CheckpointManager,
    metrics: &MetricsLogger,
    device: B::Device,
) -> Result<()> {
    // ── Model + optimizer ─────────────────────────────────────────────────────
    let mut model: CaptionModel<B> = build_model(record, &device)?;
    let mut optim = build_optimizer(record);
    tracing::info!(
        "model ready: {} LSTM layer(s), hidden={}, embed={}, vocab={}",
        record.num_layers,
        record.hidden_size,
        record.embed_dim,
        record.model_vocab_size(),
    );

    // ── Resume from the manifest, when one exists ─────────────────────────────
    let mut state = TrainState::fresh();
    if let Some(manifest) = ckpt.manifest()? {
        model = ckpt.load_model(model, &manifest, &device)?;
        optim = ckpt.load_optimizer(optim, &manifest, &device)?;
        state = ckpt.load_state(&manifest)?;
        tracing::info!(
            "resumed run '{}' after epoch {} ({:.2} h trained so far)",
            manifest.run,
            state.epoch,
            state.seconds_trained / 3600.0
        );
    }
    let start_epoch = state.epoch + 1;
    if start_epoch > epochs {
        tracing::info!("run already trained for {} epoch(s); nothing to do", state.epoch);
        return Ok(());
    }

    // ── Data loaders ──────────────────────────────────────────────────────────
    let train_size = record.transform_train.resize;
    let val_size = record.transform_val.resize;
    let train_batcher = CaptionBatcher::<B>::new(
        device.clone(),
        (train_size.0 as usize, train_size.1 as usize),
    );
    let train_loader = DataLoaderBuilder::new(train_batcher)
        .batch_size(record.batch_size)
        .shuffle(record.shuffle_seed)
        .num_workers(1)
        .build(train_dataset);

    let val_batcher = CaptionBatcher::<B::InnerBackend>::new(
        device.clone(),
        (val_size.0 as usize, val_size.1 as usize),
    );
    let val_loader = DataLoaderBuilder::new(val_batcher)
        .batch_size(record.batch_size)
        .num_workers(1)
        .build(val_dataset);

    // ── Epoch loop ────────────────────────────────────────────────────────────
    for epoch in start_epoch..=epochs {
        let epoch_timer = Instant::now();

        tracing::info!("epoch {epoch} training...");
        let mut train_loss_sum = 0.0f64;
        let mut train_batches = 0usize;

        for (batch_idx, batch) in train_loader.iter().enumerate() {
            let batch_idx = batch_idx + 1;

            let loss = model.forward_loss(&batch)?;
            let loss_value: f64 = loss.clone().into_scalar().elem();
            if !loss_value.is_finite() {
                return Err(PipelineError::NonFiniteLoss {
                    loss: loss_value,
                    epoch,
                    batch: batch_idx,
                }
                .into());
            }
            train_loss_sum += loss_value;
            train_batches += 1;

            // Backward pass + stabilized optimizer update. The clamp
            // and the step-counter repair happen inside the optimizer,
            // between backward and the parameter update.
            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(record.lr, model, grads);

            if batch_idx % log_every == 0 {
                metrics.scalar("batch/training_loss", state.batch_step, loss_value)?;
                state.batch_step += 1;
                tracing::info!(
                    "epoch {epoch}, batch {batch_idx}, loss {loss_value:.4}, {:.2} min in",
                    epoch_timer.elapsed().as_secs_f64() / 60.0
                );
            }
        }
        let train_loss = if train_batches > 0 {
            train_loss_sum / train_batches as f64
        } else {
            f64::NAN
        };

        // ── Validation: gradients disabled, dropout off ───────────────────────
        tracing::info!("epoch {epoch} validating...");
        let model_valid = model.valid();
        let mut val_loss_sum = 0.0f64;
        let mut val_batches = 0usize;
        for batch in val_loader.iter() {
            let loss = model_valid.forward_loss(&batch)?;
            let loss_value: f64 = loss.into_scalar().elem();
            val_loss_sum += loss_value;
            val_batches += 1;
        }
        let val_loss = if val_batches > 0 {
            val_loss_sum / val_batches as f64
        } else {
            f64::NAN
        };

        state.epoch = epoch;
        state.seconds_trained += epoch_timer.elapsed().as_secs_f64();

        metrics.scalar("epoch/training_loss", epoch, train_loss)?;
        metrics.scalar("epoch/validation_loss", epoch, val_loss)?;
        println!(
            "epoch {:>3}/{} | train_loss={:.4} | val_loss={:.4} | {:.2} min this epoch | {:.2} h total",
            epoch,
            epochs,
            train_loss,
            val_loss,
            epoch_timer.elapsed().as_secs_f64() / 60.0,
            state.seconds_trained / 3600.0,
        );

        if epoch % checkpoint_every == 0 {
            ckpt.save_epoch(&record.run_name, &model, &optim, &state)
                .with_context(|| format!("checkpoint write failed at epoch {epoch}"))?;
        }
    }

    tracing::info!("training complete after epoch {}", state.epoch);
    Ok(())
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::CaptionSample;
    use crate::data::images::{ImageTransform, TransformConfig};

    type TestBackend = burn::backend::Autodiff<burn::backend::NdArray>;

    // vocab: unknown + 3 words (ids 1..=3), start=4, end=5
    const START: u32 = 4;
    const END: u32 = 5;

    fn record(dir: &std::path::Path) -> RunRecord {
        RunRecord {
            run_name: "test-run".into(),
            lr: 1e-3,
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
            vocab_file: dir.join("vocab.json").to_string_lossy().into_owned(),
            train_index: dir.join("train.jsonl").to_string_lossy().into_owned(),
            val_index: dir.join("val.jsonl").to_string_lossy().into_owned(),
            backbone_file: None,
            embeddings_file: None,
            shuffle_seed: 42,
            transform_train: TransformConfig {
                resize: (16, 16),
                mean: [0.5; 3],
                std: [0.5; 3],
                brightness_jitter: 0.0,
                random_flip: false,
            },
            transform_val: TransformConfig::eval((16, 16)),
        }
    }

    fn sample(tokens: Vec<u32>, fill: f32) -> CaptionSample {
        CaptionSample { pixels: vec![fill; 3 * 16 * 16], tokens }
    }

    fn datasets(record: &RunRecord) -> (CaptionDataset, CaptionDataset) {
        let train = CaptionDataset::from_samples(
            vec![
                sample(vec![START, 1, 2, END], 0.2),
                sample(vec![START, END], 0.7),
            ],
            ImageTransform::new(record.transform_train.clone()),
        );
        let val = CaptionDataset::from_samples(
            vec![sample(vec![START, 3, END], 0.4)],
            ImageTransform::new(record.transform_val.clone()),
        );
        (train, val)
    }

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("captioner_trainer_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_end_to_end_training_step() {
        // a 2-sample batch with true lengths [4, 2] runs one epoch
        // without raising and logs a loss at the configured cadence
        let dir = temp_dir("e2e");
        let record = record(&dir);
        let (train, val) = datasets(&record);
        let ckpt = CheckpointManager::new(&dir);
        let metrics = MetricsLogger::new(&dir).unwrap();

        run_training::<TestBackend>(
            &record,
            1, // epochs
            1, // log_every: every batch
            1, // checkpoint_every
            train,
            val,
            &ckpt,
            &metrics,
            Default::default(),
        )
        .unwrap();

        let manifest = ckpt.manifest().unwrap().expect("checkpoint written");
        assert_eq!(manifest.last_epoch, 1);
        assert_eq!(manifest.run, "test-run");

        let state = ckpt.load_state(&manifest).unwrap();
        assert_eq!(state.epoch, 1);
        // one train batch, cadence 1: the global step advanced exactly once
        assert_eq!(state.batch_step, 2);
        assert!(state.seconds_trained >= 0.0);

        let csv = std::fs::read_to_string(metrics.csv_path()).unwrap();
        assert!(csv.contains("batch/training_loss,1,"));
        assert!(csv.contains("epoch/training_loss,1,"));
        assert!(csv.contains("epoch/validation_loss,1,"));
        // loss is a finite non-negative scalar
        let loss: f64 = csv
            .lines()
            .find(|l| l.starts_with("batch/training_loss"))
            .and_then(|l| l.split(',').nth(2))
            .unwrap()
            .parse()
            .unwrap();
        assert!(loss >= 0.0);
    }

    #[test]
    fn test_step_counter_unchanged_off_cadence() {
        // cadence 50 with a single batch: no batch metric, no step bump
        let dir = temp_dir("cadence");
        let record = record(&dir);
        let (train, val) = datasets(&record);
        let ckpt = CheckpointManager::new(&dir);
        let metrics = MetricsLogger::new(&dir).unwrap();

        run_training::<TestBackend>(
            &record, 1, 50, 1, train, val, &ckpt, &metrics, Default::default(),
        )
        .unwrap();

        let manifest = ckpt.manifest().unwrap().unwrap();
        let state = ckpt.load_state(&manifest).unwrap();
        assert_eq!(state.batch_step, 1);
        let csv = std::fs::read_to_string(metrics.csv_path()).unwrap();
        assert!(!csv.contains("batch/training_loss"));
    }

    #[test]
    fn test_resume_starts_at_next_epoch() {
        let dir = temp_dir("resume");
        let record = record(&dir);
        let ckpt = CheckpointManager::new(&dir);
        let metrics = MetricsLogger::new(&dir).unwrap();

        let (train, val) = datasets(&record);
        run_training::<TestBackend>(
            &record, 1, 1, 1, train, val, &ckpt, &metrics, Default::default(),
        )
        .unwrap();
        let first = ckpt.load_state(&ckpt.manifest().unwrap().unwrap()).unwrap();

        // relaunch asking for two epochs: exactly one more runs
        let (train, val) = datasets(&record);
        run_training::<TestBackend>(
            &record, 2, 1, 1, train, val, &ckpt, &metrics, Default::default(),
        )
        .unwrap();
        let second = ckpt.load_state(&ckpt.manifest().unwrap().unwrap()).unwrap();

        assert_eq!(first.epoch, 1);
        assert_eq!(second.epoch, 2);
        assert!(second.seconds_trained >= first.seconds_trained);
        assert_eq!(second.batch_step, first.batch_step + 1);
    }

    #[test]
    fn test_restored_model_reproduces_forward_outputs() {
        use crate::data::batcher::CaptionBatcher;

        let dir = temp_dir("bitwise");
        let record = record(&dir);
        let ckpt = CheckpointManager::new(&dir);
        let metrics = MetricsLogger::new(&dir).unwrap();
        let (train, val) = datasets(&record);
        run_training::<TestBackend>(
            &record, 1, 1, 1, train, val, &ckpt, &metrics, Default::default(),
        )
        .unwrap();

        // restore into a freshly initialized model on the plain backend
        type Inner = burn::backend::NdArray;
        let device = Default::default();
        let manifest = ckpt.manifest().unwrap().unwrap();
        let restored: CaptionModel<Inner> = ckpt
            .load_model(build_model(&record, &device).unwrap(), &manifest, &device)
            .unwrap();
        let restored_again: CaptionModel<Inner> = ckpt
            .load_model(build_model(&record, &device).unwrap(), &manifest, &device)
            .unwrap();

        let batcher = CaptionBatcher::<Inner>::new(Default::default(), (16, 16));
        let batch = batcher
            .assemble(vec![sample(vec![START, 1, 2, END], 0.3)])
            .unwrap();

        let a: f64 = restored.forward_loss(&batch).unwrap().into_scalar().elem();
        let b: f64 = restored_again.forward_loss(&batch).unwrap().into_scalar().elem();
        // identical restored state must produce bit-identical outputs
        assert_eq!(a.to_bits(), b.to_bits());
    }
}
