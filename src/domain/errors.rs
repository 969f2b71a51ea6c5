// ============================================================
// Layer 3 - Error Taxonomy
// ============================================================
// Every recoverable failure in the pipeline maps to one of the
// variants below. Orchestration code wraps these in anyhow for
// context; nothing downstream is expected to retry.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The batch assembler received no samples, or samples that cannot
    /// form a rectangular batch.
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// A caption had fewer than two framed tokens, so its adjusted
    /// length (true length - 1) would leave nothing to score.
    #[error("invalid caption at row {row}: framed length {len} is below the minimum of 2")]
    InvalidCaption { row: usize, len: usize },

    /// A checkpoint file or the manifest is unreadable or missing
    /// required fields. Fatal: resuming from partial state would
    /// silently diverge from the on-disk training log.
    #[error("checkpoint corrupted: {0}")]
    CheckpointCorruption(String),

    /// The hyperparameters stored for this run differ from the freshly
    /// supplied set.
    #[error("hyperparameter mismatch: {0}")]
    ConfigMismatch(String),

    /// A required vocabulary or embedding file is absent at startup.
    #[error("required lookup file missing: {0}")]
    MissingLookup(String),

    /// The training loss came back NaN or infinite. The loop halts
    /// instead of continuing on a poisoned parameter state.
    #[error("non-finite training loss {loss} at epoch {epoch}, batch {batch}")]
    NonFiniteLoss { loss: f64, epoch: usize, batch: usize },
}
