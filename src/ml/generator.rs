// ============================================================
// Layer 5 - Greedy Caption Generator
// ============================================================
// Inference: encode the image, prime the decoder with the image
// embedding, then feed the start marker and keep taking the argmax
// token until the end marker or the length cap. Runs on a plain
// (non-autodiff) backend, which also keeps dropout inactive.

use anyhow::Result;
use burn::prelude::*;

use crate::data::images::ImageTransform;
use crate::domain::traits::CaptionGenerator;
use crate::infra::vocab_store::Vocabulary;
use crate::ml::model::CaptionModel;

pub struct GreedyGenerator<B: Backend> {
    model: CaptionModel<B>,
    vocab: Vocabulary,
    transform: ImageTransform,
    device: B::Device,
    max_len: usize,
}

impl<B: Backend> GreedyGenerator<B> {
    pub fn new(
        model: CaptionModel<B>,
        vocab: Vocabulary,
        transform: ImageTransform,
        device: B::Device,
        max_len: usize,
    ) -> Self {
        Self { model, vocab, transform, device, max_len }
    }

    /// Decode word ids for one preprocessed image. The returned ids
    /// exclude both markers.
    pub fn decode(&self, pixels: &[f32]) -> Result<Vec<u32>> {
        let (h, w) = self.transform.config().resize;
        let images = Tensor::<B, 1>::from_floats(pixels, &self.device)
            .reshape([1, 3, h as usize, w as usize]);

        let features = self.model.encoder.forward(images);
        let mut states = self.model.decoder.prime(features);

        let end_id = i64::from(self.vocab.end_id());
        let mut token = i64::from(self.vocab.start_id());
        let mut ids = Vec::new();
        for _ in 0..self.max_len {
            let input = Tensor::<B, 1, Int>::from_ints([token as i32], &self.device)
                .reshape([1, 1]);
            let (logits, next_states) = self.model.decoder.step(input, states);
            states = next_states;

            let next: i64 = logits.argmax(1).into_scalar().elem();
            if next == end_id {
                break;
            }
            ids.push(next as u32);
            token = next;
        }
        Ok(ids)
    }
}

impl<B: Backend> CaptionGenerator for GreedyGenerator<B> {
    fn generate(&self, image_path: &str) -> Result<String> {
        let pixels = self.transform.load(image_path)?;
        let ids = self.decode(&pixels)?;
        let words: Vec<&str> = ids.iter().map(|&id| self.vocab.token_of(id)).collect();
        Ok(words.join(" "))
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::images::TransformConfig;
    use crate::infra::vocab_store::UNKNOWN_TOKEN;
    use crate::ml::decoder::CaptionDecoderConfig;
    use crate::ml::encoder::ImageEncoderConfig;
    use crate::ml::model::CaptionModelConfig;

    type TestBackend = burn::backend::NdArray;

    #[test]
    fn test_decode_respects_length_cap() {
        let device = Default::default();
        let vocab = Vocabulary::new(vec![
            UNKNOWN_TOKEN.to_string(),
            "a".to_string(),
            "dog".to_string(),
            "runs".to_string(),
        ])
        .unwrap();
        let model: CaptionModel<TestBackend> = CaptionModelConfig::new(
            ImageEncoderConfig::new(8).with_base_width(2).with_dropout(0.0),
            CaptionDecoderConfig::new(vocab.model_vocab_size(), 8, 12).with_dropout(0.0),
        )
        .init(&device);

        let generator = GreedyGenerator::new(
            model,
            vocab.clone(),
            ImageTransform::new(TransformConfig::eval((16, 16))),
            device,
            5,
        );

        let ids = generator.decode(&vec![0.3; 3 * 16 * 16]).unwrap();
        assert!(ids.len() <= 5);
        // the end marker never appears among the emitted ids
        assert!(ids.iter().all(|&id| id != vocab.end_id()));
    }
}
