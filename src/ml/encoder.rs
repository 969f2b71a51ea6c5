// ============================================================
// Layer 5 - Image Encoder
// ============================================================
// Convolutional backbone with the classifier head replaced by a
// linear projection into the caption embedding space. The backbone
// can be initialized from a pretrained record file and optionally
// frozen; the projection always trains. A LayerNorm and dropout
// sit on the projected embedding.

use std::path::Path;

use anyhow::Result;
use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, LayerNorm, LayerNormConfig,
        Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
    record::{CompactRecorder, Recorder},
};

use crate::domain::errors::PipelineError;

// ─── Backbone ─────────────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: BatchNorm<B, 2>,
    pub activation: Relu,
    pub pool: MaxPool2d,
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);
        let x = self.activation.forward(x);
        self.pool.forward(x)
    }
}

/// Four conv stages with doubling widths, then global average
/// pooling. Stands in for the pretrained classification backbone;
/// its weights are what a backbone record file carries.
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    pub blocks: Vec<ConvBlock<B>>,
    pub pool: AdaptiveAvgPool2d,
}

impl<B: Backend> Backbone<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = images;
        for block in &self.blocks {
            x = block.forward(x);
        }
        let x = self.pool.forward(x);
        x.flatten(1, 3)
    }
}

// ─── ImageEncoder ─────────────────────────────────────────────────────────────
#[derive(Module, Debug)]
pub struct ImageEncoder<B: Backend> {
    pub backbone: Backbone<B>,
    pub project: Linear<B>,
    pub norm: LayerNorm<B>,
    pub dropout: Dropout,
}

#[derive(Config, Debug)]
pub struct ImageEncoderConfig {
    /// Dimension of the image embedding handed to the decoder
    pub embed_dim: usize,

    #[config(default = 0.5)]
    pub dropout: f64,

    /// Channel width of the first conv stage; later stages double it.
    /// The backbone output is base_width * 8.
    #[config(default = 64)]
    pub base_width: usize,
}

impl ImageEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ImageEncoder<B> {
        let widths = [
            self.base_width,
            self.base_width * 2,
            self.base_width * 4,
            self.base_width * 8,
        ];
        let mut blocks = Vec::with_capacity(widths.len());
        let mut channels_in = 3;
        for width in widths {
            blocks.push(ConvBlock {
                conv: Conv2dConfig::new([channels_in, width], [3, 3])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device),
                norm: BatchNormConfig::new(width).init(device),
                activation: Relu::new(),
                pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            });
            channels_in = width;
        }

        ImageEncoder {
            backbone: Backbone {
                blocks,
                pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            },
            project: LinearConfig::new(self.base_width * 8, self.embed_dim).init(device),
            norm: LayerNormConfig::new(self.embed_dim).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }
}

impl<B: Backend> ImageEncoder<B> {
    /// images: [batch, 3, H, W] -> embeddings: [batch, embed_dim]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(images);
        let embedded = self.project.forward(features);
        self.dropout.forward(self.norm.forward(embedded))
    }

    /// Replace the backbone weights with a pretrained record.
    /// Absence of the file is fatal: training on a randomly
    /// initialized backbone when one was configured would silently
    /// produce a different run.
    pub fn load_backbone(mut self, path: &Path, device: &B::Device) -> Result<Self> {
        let record = CompactRecorder::new()
            .load(path.to_path_buf(), device)
            .map_err(|e| {
                PipelineError::MissingLookup(format!(
                    "backbone record '{}': {e}",
                    path.display()
                ))
            })?;
        self.backbone = self.backbone.load_record(record);
        tracing::info!("backbone weights loaded from '{}'", path.display());
        Ok(self)
    }

    /// Stop gradient flow through the backbone; the projection head
    /// keeps training.
    pub fn freeze_backbone(mut self) -> Self {
        self.backbone = self.backbone.no_grad();
        self
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    type TestBackend = burn::backend::NdArray;

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let encoder: ImageEncoder<TestBackend> = ImageEncoderConfig::new(16)
            .with_base_width(2)
            .with_dropout(0.0)
            .init(&device);

        let images = Tensor::zeros([3, 3, 32, 32], &device);
        let out = encoder.forward(images);
        assert_eq!(out.dims(), [3, 16]);
    }
}
