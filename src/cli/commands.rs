// ============================================================
// Layer 1 - CLI Commands and Arguments
// ============================================================
// Three subcommands: `train` (run or resume a training run),
// `caption` (generate a caption for one image from the latest
// checkpoint) and `stats` (compute per-channel mean/std over an
// image directory for normalization constants).

use clap::{Args, Subcommand};

use crate::application::train_use_case::{RunRecord, TrainConfig};
use crate::data::images::TransformConfig;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train the captioning model on an image/caption index
    Train(TrainArgs),

    /// Caption an image using a trained checkpoint
    Caption(CaptionArgs),

    /// Compute per-channel image mean/std over a directory
    Stats(StatsArgs),
}

/// All arguments for the `train` command.
#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Name of this run; also recorded in the checkpoint manifest
    #[arg(long, default_value = "captioner-run")]
    pub run_name: String,

    /// Vocabulary file (JSON word list, unknown sentinel first)
    #[arg(long, default_value = "preprocessed/vocab.json")]
    pub vocab: String,

    /// Training sample index (JSON Lines of image path + token ids)
    #[arg(long, default_value = "preprocessed/captions.train.jsonl")]
    pub train_index: String,

    /// Validation sample index
    #[arg(long, default_value = "preprocessed/captions.val.jsonl")]
    pub val_index: String,

    /// Directory for checkpoints, the run record and metrics
    #[arg(long, default_value = "checkpoints")]
    pub checkpoint_dir: String,

    /// Pretrained backbone record to load into the encoder
    #[arg(long)]
    pub backbone: Option<String>,

    /// Pretrained embedding table (id-aligned rows of floats)
    #[arg(long)]
    pub embeddings: Option<String>,

    /// Number of full passes over the training data
    #[arg(long, default_value_t = 50)]
    pub epochs: usize,

    /// Samples per batch; the final batch of an epoch may be smaller
    #[arg(long, default_value_t = 128)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 1e-4)]
    pub lr: f64,

    #[arg(long, default_value_t = 1e-4)]
    pub weight_decay: f32,

    /// Elementwise gradient clamp threshold
    #[arg(long, default_value_t = 5.0)]
    pub grad_clip: f32,

    /// Disable gradient clamping entirely
    #[arg(long)]
    pub no_grad_clip: bool,

    /// Use plain SGD instead of the default Adam
    #[arg(long)]
    pub sgd: bool,

    /// Real word count V of the vocabulary file
    #[arg(long, default_value_t = 13000)]
    pub vocab_words: usize,

    /// Word/image embedding dimension
    #[arg(long, default_value_t = 512)]
    pub embed_dim: usize,

    /// LSTM hidden state size
    #[arg(long, default_value_t = 512)]
    pub hidden_size: usize,

    /// Number of stacked LSTM layers
    #[arg(long, default_value_t = 1)]
    pub num_layers: usize,

    /// Dropout on the decoder's recurrent outputs
    #[arg(long, default_value_t = 0.5)]
    pub rnn_dropout: f64,

    /// Dropout on the projected image embedding
    #[arg(long, default_value_t = 0.5)]
    pub cnn_dropout: f64,

    /// Channel width of the first encoder conv stage
    #[arg(long, default_value_t = 64)]
    pub encoder_base_width: usize,

    /// Fine-tune the backbone instead of freezing it
    #[arg(long)]
    pub finetune_backbone: bool,

    /// Freeze the decoder's embedding table
    #[arg(long)]
    pub freeze_embeddings: bool,

    /// Square resize target applied to every image
    #[arg(long, default_value_t = 224)]
    pub resize: u32,

    /// Emit the batch-loss metric every this many batches
    #[arg(long, default_value_t = 50)]
    pub log_every: usize,

    /// Save a checkpoint every this many epochs
    #[arg(long, default_value_t = 1)]
    pub checkpoint_every: usize,

    /// Seed for the training loader's shuffle
    #[arg(long, default_value_t = 42)]
    pub shuffle_seed: u64,
}

/// Convert CLI TrainArgs into the application-layer TrainConfig.
/// The application layer never sees clap types.
impl From<TrainArgs> for TrainConfig {
    fn from(a: TrainArgs) -> Self {
        let resize = (a.resize, a.resize);
        let record = RunRecord {
            run_name: a.run_name,
            lr: a.lr,
            weight_decay: Some(a.weight_decay),
            grad_clip: if a.no_grad_clip { None } else { Some(a.grad_clip) },
            adam: !a.sgd,
            batch_size: a.batch_size,
            vocab_words: a.vocab_words,
            embed_dim: a.embed_dim,
            hidden_size: a.hidden_size,
            num_layers: a.num_layers,
            rnn_dropout: a.rnn_dropout,
            cnn_dropout: a.cnn_dropout,
            encoder_base_width: a.encoder_base_width,
            freeze_backbone: !a.finetune_backbone,
            freeze_embeddings: a.freeze_embeddings,
            vocab_file: a.vocab,
            train_index: a.train_index,
            val_index: a.val_index,
            backbone_file: a.backbone,
            embeddings_file: a.embeddings,
            shuffle_seed: a.shuffle_seed,
            transform_train: TransformConfig::train(resize),
            transform_val: TransformConfig::eval(resize),
        };
        TrainConfig {
            record,
            epochs: a.epochs,
            checkpoint_dir: a.checkpoint_dir,
            log_every: a.log_every,
            checkpoint_every: a.checkpoint_every,
        }
    }
}

/// All arguments for the `caption` command
#[derive(Args, Debug)]
pub struct CaptionArgs {
    /// The image file to caption
    #[arg(long)]
    pub image: String,

    /// Directory where checkpoints were saved during training
    #[arg(long, default_value = "checkpoints")]
    pub checkpoint_dir: String,

    /// Maximum number of generated words before giving up on the
    /// end marker
    #[arg(long, default_value_t = 30)]
    pub max_len: usize,
}

/// All arguments for the `stats` command
#[derive(Args, Debug)]
pub struct StatsArgs {
    /// Directory of images to measure
    #[arg(long)]
    pub image_dir: String,

    /// Square resize target applied before measuring
    #[arg(long, default_value_t = 224)]
    pub resize: u32,
}
