// ============================================================
// Layer 3 - Core Traits (Abstractions)
// ============================================================
// The seams between layers. The application layer programs
// against these so a data source or decoding strategy can be
// swapped without touching the orchestration code.

use anyhow::Result;

use crate::domain::caption::CaptionRecord;

// ─── SampleSource ─────────────────────────────────────────────────────────────
/// Any component that can supply (image path, caption) records.
///
/// Implementations:
///   - IndexFile -> loads a JSON Lines sample index from disk
pub trait SampleSource {
    /// Load every record from this source.
    fn load_all(&self) -> Result<Vec<CaptionRecord>>;
}

// ─── CaptionGenerator ─────────────────────────────────────────────────────────
/// Any component that can produce a natural-language caption for an
/// image file.
///
/// Implementations:
///   - GreedyGenerator -> argmax decoding with the trained model
pub trait CaptionGenerator {
    /// Caption the image at `image_path`, returning the decoded words.
    fn generate(&self, image_path: &str) -> Result<String>;
}
