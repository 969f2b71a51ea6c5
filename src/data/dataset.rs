// ============================================================
// Layer 4 - Sample Index and Dataset
// ============================================================
// The sample index file is JSON Lines: one record per line with
// an image path and the framed caption token ids. The dataset
// wraps the loaded records and implements Burn's Dataset trait,
// decoding and preprocessing the image on access so only token
// ids stay resident.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::data::dataset::Dataset;
use serde::{Deserialize, Serialize};

use crate::data::images::ImageTransform;
use crate::domain::caption::{Caption, CaptionRecord};
use crate::domain::errors::PipelineError;
use crate::domain::traits::SampleSource;

// ─── IndexFile ────────────────────────────────────────────────────────────────
/// A persisted sample index. Relative image paths inside the file are
/// resolved against the index file's own directory.
pub struct IndexFile {
    path: PathBuf,
}

impl IndexFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SampleSource for IndexFile {
    fn load_all(&self) -> Result<Vec<CaptionRecord>> {
        let text = std::fs::read_to_string(&self.path).map_err(|_| {
            PipelineError::MissingLookup(format!("sample index '{}'", self.path.display()))
        })?;

        let base = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut records = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let mut record: CaptionRecord = serde_json::from_str(line).with_context(|| {
                format!("sample index '{}': bad record on line {}", self.path.display(), lineno + 1)
            })?;
            // enforce the framing invariant before anything downstream
            // sees the tokens
            Caption::new(record.tokens.clone()).map_err(|_| {
                anyhow::anyhow!(
                    "sample index '{}': caption on line {} has fewer than 2 tokens",
                    self.path.display(),
                    lineno + 1
                )
            })?;
            if !Path::new(&record.image).is_absolute() {
                record.image = base.join(&record.image).to_string_lossy().into_owned();
            }
            records.push(record);
        }
        tracing::info!("loaded {} records from '{}'", records.len(), self.path.display());
        Ok(records)
    }
}

// ─── CaptionSample ────────────────────────────────────────────────────────────
/// One preprocessed training sample: a normalized CHW pixel buffer
/// and the framed caption ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptionSample {
    pub pixels: Vec<f32>,
    pub tokens: Vec<u32>,
}

// ─── CaptionDataset ───────────────────────────────────────────────────────────
/// Burn dataset over caption records. Images are decoded lazily in
/// `get`, which is where the DataLoader's worker threads do their
/// prefetching. A preloaded variant exists for synthetic data.
pub struct CaptionDataset {
    records: Vec<CaptionRecord>,
    transform: ImageTransform,
    preloaded: Option<Vec<CaptionSample>>,
}

impl CaptionDataset {
    pub fn new(records: Vec<CaptionRecord>, transform: ImageTransform) -> Self {
        Self { records, transform, preloaded: None }
    }

    /// Build a dataset entirely from in-memory samples, bypassing
    /// image decoding.
    pub fn from_samples(samples: Vec<CaptionSample>, transform: ImageTransform) -> Self {
        let records = samples
            .iter()
            .map(|s| CaptionRecord::new("<memory>", s.tokens.clone()))
            .collect();
        Self { records, transform, preloaded: Some(samples) }
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

impl Dataset<CaptionSample> for CaptionDataset {
    fn get(&self, index: usize) -> Option<CaptionSample> {
        if let Some(samples) = &self.preloaded {
            return samples.get(index).cloned();
        }
        let record = self.records.get(index)?;
        match self.transform.load(&record.image) {
            Ok(pixels) => Some(CaptionSample { pixels, tokens: record.tokens.clone() }),
            Err(err) => {
                tracing::warn!("skipping sample {index}: {err:#}");
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}
