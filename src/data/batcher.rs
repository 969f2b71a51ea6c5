// ============================================================
// Layer 4 - Caption Batcher
// ============================================================
// Implements Burn's Batcher trait to convert a Vec<CaptionSample>
// into tensors, with the length discipline the decoder depends on:
//
//   1. stack images along a new leading batch dimension
//   2. stable-sort samples by descending true caption length
//   3. right-pad captions with id 0 to the batch maximum
//   4. record each sorted row's true length
//
// The descending sort is a correctness precondition, not an
// optimization: the decoder advances only the first `active` rows
// at each timestep, and that prefix is only well-defined when rows
// are ordered longest-first. The sort must be stable so equal-length
// batches are reproducible.

use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
};

use crate::data::dataset::CaptionSample;
use crate::domain::errors::PipelineError;

/// Padding id used to fill caption rows past their true length.
/// The loss never reads padded positions (it uses explicit lengths),
/// so reusing the unknown id is safe.
pub const PAD_ID: u32 = 0;

// ─── CaptionBatch ─────────────────────────────────────────────────────────────
/// A batch of caption samples ready for the forward pass.
#[derive(Debug, Clone)]
pub struct CaptionBatch<B: Backend> {
    /// Stacked images - shape: [batch, 3, height, width]
    pub images: Tensor<B, 4>,

    /// Right-padded caption matrix, rows sorted by descending true
    /// length - shape: [batch, max_len]
    pub tokens: Tensor<B, 2, Int>,

    /// The same padded rows as plain ids, in tensor row order; the
    /// trainer packs the loss targets from these
    pub token_rows: Vec<Vec<u32>>,

    /// True (pre-decrement) token count per sorted row
    pub lengths: Vec<usize>,
}

impl<B: Backend> CaptionBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    pub fn max_len(&self) -> usize {
        self.lengths.first().copied().unwrap_or(0)
    }
}

// ─── CaptionBatcher ───────────────────────────────────────────────────────────
/// Holds the target device and the image shape so stacked tensors
/// land where the model lives.
#[derive(Clone, Debug)]
pub struct CaptionBatcher<B: Backend> {
    pub device: B::Device,
    /// (height, width) every sample's pixel buffer must match
    pub image_size: (usize, usize),
}

impl<B: Backend> CaptionBatcher<B> {
    pub fn new(device: B::Device, image_size: (usize, usize)) -> Self {
        Self { device, image_size }
    }

    /// Assemble a batch, surfacing malformed input as an error.
    /// The Batcher trait wrapper below unwraps this because the
    /// DataLoader never yields an empty or ragged item list.
    pub fn assemble(&self, items: Vec<CaptionSample>) -> Result<CaptionBatch<B>, PipelineError> {
        if items.is_empty() {
            return Err(PipelineError::InvalidBatch("no samples to assemble".into()));
        }
        let (height, width) = self.image_size;
        let pixels_each = 3 * height * width;
        for (i, item) in items.iter().enumerate() {
            if item.pixels.len() != pixels_each {
                return Err(PipelineError::InvalidBatch(format!(
                    "sample {i} holds {} pixels, expected {pixels_each}",
                    item.pixels.len()
                )));
            }
            if item.tokens.len() < 2 {
                return Err(PipelineError::InvalidCaption { row: i, len: item.tokens.len() });
            }
        }

        // Stable sort by descending true length; ties keep loader order
        // so a fixed seed reproduces the same batch exactly.
        let mut items = items;
        items.sort_by(|a, b| b.tokens.len().cmp(&a.tokens.len()));

        let batch_size = items.len();
        let max_len = items[0].tokens.len();

        // ── Images: one flat buffer, then [batch, 3, H, W] ────────────────────
        let mut image_flat = Vec::with_capacity(batch_size * pixels_each);
        for item in &items {
            image_flat.extend_from_slice(&item.pixels);
        }
        let images = Tensor::<B, 1>::from_floats(image_flat.as_slice(), &self.device)
            .reshape([batch_size, 3, height, width]);

        // ── Captions: right-pad into an N x L id matrix ───────────────────────
        let mut token_rows = Vec::with_capacity(batch_size);
        let mut lengths = Vec::with_capacity(batch_size);
        for item in &items {
            let mut row = item.tokens.clone();
            lengths.push(row.len());
            row.resize(max_len, PAD_ID);
            token_rows.push(row);
        }

        let token_flat: Vec<i32> = token_rows
            .iter()
            .flat_map(|row| row.iter().map(|&t| t as i32))
            .collect();
        let tokens = Tensor::<B, 1, Int>::from_ints(token_flat.as_slice(), &self.device)
            .reshape([batch_size, max_len]);

        Ok(CaptionBatch { images, tokens, token_rows, lengths })
    }
}

// ─── Burn Batcher Trait Implementation ────────────────────────────────────────
impl<B: Backend> Batcher<CaptionSample, CaptionBatch<B>> for CaptionBatcher<B> {
    fn batch(&self, items: Vec<CaptionSample>) -> CaptionBatch<B> {
        self.assemble(items).expect("data loader produced an unassemblable batch")
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    type TestBackend = burn::backend::NdArray;

    fn sample(tokens: Vec<u32>) -> CaptionSample {
        CaptionSample { pixels: vec![0.5; 12], tokens }
    }

    fn batcher() -> CaptionBatcher<TestBackend> {
        CaptionBatcher::new(Default::default(), (2, 2))
    }

    #[test]
    fn test_rows_sorted_descending() {
        let batch = batcher()
            .assemble(vec![
                sample(vec![9, 1, 10]),
                sample(vec![9, 1, 2, 3, 10]),
                sample(vec![9, 10]),
            ])
            .unwrap();
        assert_eq!(batch.lengths, vec![5, 3, 2]);
        for pair in batch.lengths.windows(2) {
            assert!(pair[0] >= pair[1]);
        }
    }

    #[test]
    fn test_sort_is_stable_on_ties() {
        // two length-3 captions keep their original order
        let batch = batcher()
            .assemble(vec![
                sample(vec![9, 1, 10]),
                sample(vec![9, 2, 10]),
                sample(vec![9, 1, 2, 10]),
            ])
            .unwrap();
        assert_eq!(batch.token_rows[0], vec![9, 1, 2, 10]);
        assert_eq!(batch.token_rows[1], vec![9, 1, 10, PAD_ID]);
        assert_eq!(batch.token_rows[2], vec![9, 2, 10, PAD_ID]);
    }

    #[test]
    fn test_padding_beyond_true_length() {
        let batch = batcher()
            .assemble(vec![sample(vec![9, 1, 2, 3, 10]), sample(vec![9, 10])])
            .unwrap();
        let max_len = batch.max_len();
        assert_eq!(batch.tokens.dims(), [2, max_len]);
        for (row, &len) in batch.token_rows.iter().zip(&batch.lengths) {
            assert_eq!(row.len(), max_len);
            for &t in &row[len..] {
                assert_eq!(t, PAD_ID);
            }
        }
    }

    #[test]
    fn test_single_sample_batch() {
        let batch = batcher().assemble(vec![sample(vec![9, 7, 10])]).unwrap();
        assert_eq!(batch.batch_size(), 1);
        assert_eq!(batch.max_len(), 3);
        assert_eq!(batch.images.dims(), [1, 3, 2, 2]);
    }

    #[test]
    fn test_empty_batch_is_an_error() {
        assert!(matches!(
            batcher().assemble(vec![]),
            Err(PipelineError::InvalidBatch(_))
        ));
    }

    #[test]
    fn test_wrong_pixel_count_is_an_error() {
        let bad = CaptionSample { pixels: vec![0.0; 5], tokens: vec![9, 10] };
        assert!(batcher().assemble(vec![bad]).is_err());
    }

    #[test]
    fn test_image_stack_shape_matches_rows() {
        let batch = batcher()
            .assemble(vec![sample(vec![9, 10]), sample(vec![9, 1, 10])])
            .unwrap();
        assert_eq!(batch.images.dims()[0], batch.tokens.dims()[0]);
        assert_eq!(batch.tokens.dims()[0], batch.lengths.len());
    }
}
