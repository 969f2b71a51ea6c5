// ============================================================
// Layer 3 - Caption Domain Types
// ============================================================
// A caption is an ordered sequence of token ids, always framed
// with the start marker at index 0 and the end marker at the
// last index when stored. Token id 0 is reserved for the
// unknown token; word ids run 1..=V; the start and end markers
// sit directly above the word ids (V+1 and V+2).

use serde::{Deserialize, Serialize};

use crate::domain::errors::PipelineError;

/// Reserved id for the unknown token.
pub const UNKNOWN_ID: u32 = 0;

/// A framed caption: `[start, w1..wk, end]`, length >= 2.
///
/// The invariant is enforced at construction; everything downstream
/// (batching, packing, the decoder contract) relies on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Caption(Vec<u32>);

impl Caption {
    /// Wrap a framed token sequence, rejecting captions shorter than
    /// the start+end frame itself.
    pub fn new(tokens: Vec<u32>) -> Result<Self, PipelineError> {
        if tokens.len() < 2 {
            return Err(PipelineError::InvalidCaption { row: 0, len: tokens.len() });
        }
        Ok(Self(tokens))
    }

    /// True (pre-decrement) token count, frame included.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        false // length >= 2 by construction
    }

    pub fn tokens(&self) -> &[u32] {
        &self.0
    }

    pub fn into_tokens(self) -> Vec<u32> {
        self.0
    }
}

/// One line of the sample index file: an image path and the framed
/// caption token ids describing that image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptionRecord {
    /// Path to the image file, relative to the index file's directory
    /// or absolute
    pub image: String,

    /// Framed caption token ids
    pub tokens: Vec<u32>,
}

impl CaptionRecord {
    pub fn new(image: impl Into<String>, tokens: Vec<u32>) -> Self {
        Self { image: image.into(), tokens }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimum_frame_accepted() {
        // start + end with no words between is the shortest legal caption
        let c = Caption::new(vec![11, 12]).unwrap();
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_too_short_rejected() {
        assert!(Caption::new(vec![11]).is_err());
        assert!(Caption::new(vec![]).is_err());
    }
}
