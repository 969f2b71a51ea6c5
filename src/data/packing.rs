// ============================================================
// Layer 4 - Ragged-to-Flat Packing
// ============================================================
// Converts a batch of variable-length rows into a single flat
// stream of only the valid (non-padding) elements, timestep-major:
// all rows active at step 0 first, then all rows active at step 1,
// and so on. Because rows arrive sorted by non-increasing length,
// the rows active at any step are exactly a prefix of the batch,
// so each step contributes a contiguous run.
//
// This is deliberately a pure function over plain slices, written
// with explicit index arithmetic, so the flattening the loss relies
// on can be tested without any tensor in sight.

use crate::domain::errors::PipelineError;

/// The flat stream plus the map back to (row, timestep) per element.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedTokens {
    /// Valid elements in timestep-major order
    pub values: Vec<u32>,
    /// `origins[k]` = (row, timestep) of `values[k]`
    pub origins: Vec<(usize, usize)>,
}

impl PackedTokens {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Number of rows whose length exceeds `step`. Rows must be sorted by
/// non-increasing length, so these form a prefix.
pub fn active_rows(lengths: &[usize], step: usize) -> usize {
    lengths.partition_point(|&len| len > step)
}

/// True lengths -> adjusted lengths (true - 1). The first input token
/// (the start marker) predicts the second, so one position per row
/// never contributes to the loss. A row that would end up empty means
/// the caption had fewer than 2 tokens.
pub fn adjusted_lengths(lengths: &[usize]) -> Result<Vec<usize>, PipelineError> {
    lengths
        .iter()
        .enumerate()
        .map(|(row, &len)| {
            if len < 2 {
                Err(PipelineError::InvalidCaption { row, len })
            } else {
                Ok(len - 1)
            }
        })
        .collect()
}

/// Flatten `rows` (each padded or exact, left-aligned) down to the
/// first `lengths[i]` elements of each row, packed by timestep.
///
/// Requirements, checked up front:
///   - at least one row
///   - lengths sorted non-increasing (the assembler guarantees this)
///   - every length >= 1 and within its row's storage
pub fn pack_by_timestep(rows: &[Vec<u32>], lengths: &[usize]) -> Result<PackedTokens, PipelineError> {
    if rows.is_empty() {
        return Err(PipelineError::InvalidBatch("cannot pack an empty batch".into()));
    }
    if rows.len() != lengths.len() {
        return Err(PipelineError::InvalidBatch(format!(
            "{} rows but {} lengths",
            rows.len(),
            lengths.len()
        )));
    }
    for (i, window) in lengths.windows(2).enumerate() {
        if window[1] > window[0] {
            return Err(PipelineError::InvalidBatch(format!(
                "lengths not sorted descending at rows {}..{}",
                i,
                i + 1
            )));
        }
    }
    for (i, (row, &len)) in rows.iter().zip(lengths).enumerate() {
        if len == 0 {
            return Err(PipelineError::InvalidCaption { row: i, len: 0 });
        }
        if len > row.len() {
            return Err(PipelineError::InvalidBatch(format!(
                "row {i} claims length {len} but holds {} elements",
                row.len()
            )));
        }
    }

    let total: usize = lengths.iter().sum();
    let mut values = Vec::with_capacity(total);
    let mut origins = Vec::with_capacity(total);

    let max_len = lengths[0];
    for step in 0..max_len {
        let active = active_rows(lengths, step);
        for (row, tokens) in rows.iter().enumerate().take(active) {
            values.push(tokens[step]);
            origins.push((row, step));
        }
    }

    Ok(PackedTokens { values, origins })
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_count_is_sum_of_lengths() {
        let rows = vec![
            vec![1, 2, 3, 4, 0],
            vec![5, 6, 0, 0, 0],
            vec![7, 0, 0, 0, 0],
        ];
        let packed = pack_by_timestep(&rows, &[4, 2, 1]).unwrap();
        assert_eq!(packed.len(), 7);
    }

    #[test]
    fn test_timestep_major_order() {
        // rows active at step 0: all three; step 1: first two; steps 2-3:
        // only the first
        let rows = vec![
            vec![1, 2, 3, 4],
            vec![5, 6, 0, 0],
            vec![7, 0, 0, 0],
        ];
        let packed = pack_by_timestep(&rows, &[4, 2, 1]).unwrap();
        assert_eq!(packed.values, vec![1, 5, 7, 2, 6, 3, 4]);
        assert_eq!(
            packed.origins,
            vec![(0, 0), (1, 0), (2, 0), (0, 1), (1, 1), (0, 2), (0, 3)]
        );
    }

    #[test]
    fn test_single_row() {
        let packed = pack_by_timestep(&[vec![9, 8, 7]], &[3]).unwrap();
        assert_eq!(packed.values, vec![9, 8, 7]);
    }

    #[test]
    fn test_empty_batch_rejected() {
        assert!(matches!(
            pack_by_timestep(&[], &[]),
            Err(PipelineError::InvalidBatch(_))
        ));
    }

    #[test]
    fn test_unsorted_lengths_rejected() {
        let rows = vec![vec![1, 2], vec![3, 4]];
        assert!(pack_by_timestep(&rows, &[1, 2]).is_err());
    }

    #[test]
    fn test_zero_length_rejected() {
        let rows = vec![vec![1, 2], vec![3, 4]];
        assert!(matches!(
            pack_by_timestep(&rows, &[2, 0]),
            Err(PipelineError::InvalidCaption { row: 1, .. })
        ));
    }

    #[test]
    fn test_adjusted_lengths() {
        assert_eq!(adjusted_lengths(&[5, 3, 2]).unwrap(), vec![4, 2, 1]);
        assert!(matches!(
            adjusted_lengths(&[5, 1]),
            Err(PipelineError::InvalidCaption { row: 1, len: 1 })
        ));
    }

    #[test]
    fn test_active_rows_prefix() {
        let lengths = [4, 2, 1];
        assert_eq!(active_rows(&lengths, 0), 3);
        assert_eq!(active_rows(&lengths, 1), 2);
        assert_eq!(active_rows(&lengths, 2), 1);
        assert_eq!(active_rows(&lengths, 3), 1);
        assert_eq!(active_rows(&lengths, 4), 0);
    }
}
