// ============================================================
// Layer 6 - Vocabulary and Embedding Store
// ============================================================
// Persistence for the two lookup files the pipeline consumes:
//
//   vocabulary  - JSON array of words; element 0 is the unknown
//                 sentinel "<unk>", words follow at ids 1..=V.
//                 The start/end markers are not stored; their ids
//                 sit directly above the word ids (V+1 and V+2).
//
//   embeddings  - whitespace-separated text, line i holding the
//                 embedding vector for token id i; (V+1) lines.
//                 A builder can also assemble an aligned table
//                 from a GloVe-style "word v1 .. vD" file.
//
// Both files are required at startup when configured; absence is
// fatal (MissingLookup), never a partial-training fallback.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use rand::Rng;

use crate::domain::caption::UNKNOWN_ID;
use crate::domain::errors::PipelineError;

/// The sentinel word mapped to id 0.
pub const UNKNOWN_TOKEN: &str = "<unk>";

// ─── Vocabulary ───────────────────────────────────────────────────────────────
/// Fixed token <-> id lookup. Out-of-vocabulary tokens map to id 0;
/// id 0 maps back to the `<unk>` sentinel, never to an original word.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    words: Vec<String>,
    index: HashMap<String, u32>,
}

impl Vocabulary {
    /// Build from a word list. `words` must start with the unknown
    /// sentinel; ids are assigned by position.
    pub fn new(words: Vec<String>) -> Result<Self, PipelineError> {
        if words.first().map(String::as_str) != Some(UNKNOWN_TOKEN) {
            return Err(PipelineError::MissingLookup(format!(
                "vocabulary must begin with the {UNKNOWN_TOKEN} sentinel"
            )));
        }
        let index = words
            .iter()
            .enumerate()
            .skip(1) // the sentinel is not a real word
            .map(|(i, w)| (w.clone(), i as u32))
            .collect();
        Ok(Self { words, index })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|_| {
            PipelineError::MissingLookup(format!("vocabulary file '{}'", path.display()))
        })?;
        let words: Vec<String> = serde_json::from_str(&json)
            .with_context(|| format!("vocabulary file '{}' is not a JSON word list", path.display()))?;
        Ok(Self::new(words)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, serde_json::to_string_pretty(&self.words)?)
            .with_context(|| format!("cannot write vocabulary to '{}'", path.display()))?;
        Ok(())
    }

    /// Token -> id; unknown words map to id 0.
    pub fn id_of(&self, token: &str) -> u32 {
        self.index.get(token).copied().unwrap_or(UNKNOWN_ID)
    }

    /// Id -> token; id 0 and out-of-range ids yield the sentinel.
    pub fn token_of(&self, id: u32) -> &str {
        self.words
            .get(id as usize)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_TOKEN)
    }

    /// Number of stored entries (sentinel + words), i.e. V + 1.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.len() <= 1
    }

    /// Id of the start-of-caption marker.
    pub fn start_id(&self) -> u32 {
        self.words.len() as u32
    }

    /// Id of the end-of-caption marker.
    pub fn end_id(&self) -> u32 {
        self.words.len() as u32 + 1
    }

    /// Total id space the decoder must cover: words + sentinel + markers.
    pub fn model_vocab_size(&self) -> usize {
        self.words.len() + 2
    }
}

// ─── EmbeddingTable ───────────────────────────────────────────────────────────
/// Pretrained embedding rows aligned to token ids. Row i belongs to
/// id i; the marker ids (start/end) are appended with small random
/// vectors since pretrained tables never carry them.
#[derive(Debug, Clone)]
pub struct EmbeddingTable {
    pub dim: usize,
    pub rows: Vec<Vec<f32>>,
}

impl EmbeddingTable {
    /// Load an id-aligned table: line i = the floats of row i.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|_| {
            PipelineError::MissingLookup(format!("embedding file '{}'", path.display()))
        })?;

        let mut rows: Vec<Vec<f32>> = Vec::new();
        let mut dim = 0usize;
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let row: Vec<f32> = line
                .split_whitespace()
                .map(str::parse)
                .collect::<Result<_, _>>()
                .with_context(|| {
                    format!("embedding file '{}': bad float on line {}", path.display(), lineno + 1)
                })?;
            if dim == 0 {
                dim = row.len();
            } else if row.len() != dim {
                anyhow::bail!(
                    "embedding file '{}': line {} has {} values, expected {}",
                    path.display(),
                    lineno + 1,
                    row.len(),
                    dim
                );
            }
            rows.push(row);
        }
        if rows.is_empty() {
            anyhow::bail!("embedding file '{}' is empty", path.display());
        }
        Ok(Self { dim, rows })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut out = String::new();
        for row in &self.rows {
            let line: Vec<String> = row.iter().map(|v| format!("{v}")).collect();
            out.push_str(&line.join(" "));
            out.push('\n');
        }
        std::fs::write(path.as_ref(), out)
            .with_context(|| format!("cannot write embeddings to '{}'", path.as_ref().display()))?;
        Ok(())
    }

    /// Assemble an id-aligned table from a GloVe-style text file
    /// ("word v1 .. vD" per line). Vocabulary words absent from the
    /// GloVe file, the unknown row, and later the marker rows, are
    /// filled with small random values.
    pub fn from_glove(path: impl AsRef<Path>, vocab: &Vocabulary, dim: usize) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|_| {
            PipelineError::MissingLookup(format!("GloVe file '{}'", path.display()))
        })?;

        let mut by_word: HashMap<&str, Vec<f32>> = HashMap::new();
        for line in text.lines() {
            let mut parts = line.split_whitespace();
            let Some(word) = parts.next() else { continue };
            let vector: Vec<f32> = parts.filter_map(|p| p.parse().ok()).collect();
            // rows of the wrong width are malformed entries, skip them
            if vector.len() == dim && !by_word.contains_key(word) {
                by_word.insert(word, vector);
            }
        }

        let mut rng = rand::thread_rng();
        let mut random_row = || -> Vec<f32> {
            (0..dim).map(|_| rng.gen::<f32>() * 0.01).collect()
        };

        let mut rows = Vec::with_capacity(vocab.len());
        rows.push(random_row()); // id 0, the unknown sentinel
        let mut missing = 0usize;
        for id in 1..vocab.len() as u32 {
            match by_word.get(vocab.token_of(id)) {
                Some(v) => rows.push(v.clone()),
                None => {
                    missing += 1;
                    rows.push(random_row());
                }
            }
        }
        tracing::info!(
            "embedding table assembled: {} rows, {} vocabulary words missing from GloVe",
            rows.len(),
            missing
        );
        Ok(Self { dim, rows })
    }

    /// Extend the table with freshly initialized rows for the start and
    /// end markers, returning a matrix covering the full model id space.
    pub fn with_marker_rows(mut self) -> Self {
        let mut rng = rand::thread_rng();
        for _ in 0..2 {
            let row: Vec<f32> = (0..self.dim).map(|_| rng.gen::<f32>() * 0.01).collect();
            self.rows.push(row);
        }
        self
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> Vocabulary {
        Vocabulary::new(vec![
            UNKNOWN_TOKEN.to_string(),
            "a".to_string(),
            "dog".to_string(),
            "runs".to_string(),
        ])
        .unwrap()
    }

    #[test]
    fn test_round_trip_in_vocabulary() {
        let v = vocab();
        for word in ["a", "dog", "runs"] {
            let id = v.id_of(word);
            assert_ne!(id, UNKNOWN_ID);
            assert_eq!(v.token_of(id), word);
            assert_eq!(v.id_of(v.token_of(id)), id);
        }
    }

    #[test]
    fn test_out_of_vocabulary_maps_to_unknown() {
        let v = vocab();
        assert_eq!(v.id_of("zebra"), UNKNOWN_ID);
        // id 0 decodes to the sentinel, never back to "zebra"
        assert_eq!(v.token_of(UNKNOWN_ID), UNKNOWN_TOKEN);
    }

    #[test]
    fn test_marker_ids_sit_above_word_ids() {
        let v = vocab();
        assert_eq!(v.len(), 4);
        assert_eq!(v.start_id(), 4);
        assert_eq!(v.end_id(), 5);
        assert_eq!(v.model_vocab_size(), 6);
    }

    #[test]
    fn test_vocabulary_must_start_with_sentinel() {
        assert!(Vocabulary::new(vec!["dog".to_string()]).is_err());
    }

    #[test]
    fn test_glove_alignment() {
        let dir = std::env::temp_dir().join("captioner_glove_test");
        std::fs::create_dir_all(&dir).unwrap();
        let glove = dir.join("glove.txt");
        std::fs::write(&glove, "dog 1.0 2.0\na 3.0 4.0\nbadrow 1.0\n").unwrap();

        let table = EmbeddingTable::from_glove(&glove, &vocab(), 2).unwrap();
        assert_eq!(table.rows.len(), 4);
        // id 1 = "a", id 2 = "dog" per the vocabulary ordering
        assert_eq!(table.rows[1], vec![3.0, 4.0]);
        assert_eq!(table.rows[2], vec![1.0, 2.0]);
        // "runs" is absent from GloVe: filled, not dropped
        assert_eq!(table.rows[3].len(), 2);

        let full = table.with_marker_rows();
        assert_eq!(full.rows.len(), 6);
    }

    #[test]
    fn test_aligned_file_round_trip() {
        let dir = std::env::temp_dir().join("captioner_embed_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("embeddings.txt");

        let table = EmbeddingTable { dim: 3, rows: vec![vec![0.0, 0.5, 1.0], vec![1.5, 2.0, 2.5]] };
        table.save(&path).unwrap();
        let loaded = EmbeddingTable::load(&path).unwrap();
        assert_eq!(loaded.dim, 3);
        assert_eq!(loaded.rows, table.rows);
    }
}
