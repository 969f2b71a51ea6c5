// ============================================================
// Layer 5 - ML / Model Layer (Burn)
// ============================================================
// All Burn-framework model code lives here:
//
//   encoder.rs   - conv backbone + projection to the embedding
//                  space, pretrained load and freeze support
//
//   decoder.rs   - embedding + stacked LSTM + vocabulary head,
//                  with the packed teacher-forcing forward that
//                  only ever advances the active row prefix
//
//   model.rs     - encoder + decoder as one module and the
//                  packed cross-entropy loss
//
//   optimizer.rs - stabilized Adam (gradient clamp + step-counter
//                  repair) behind Burn's SimpleOptimizer seam,
//                  plus the Adam/SGD choice wrapper
//
//   trainer.rs   - epoch/batch loop, validation, metric cadence,
//                  checkpointing, manifest resume
//
//   generator.rs - greedy decoding for inference

/// Image encoder: conv backbone + embedding projection
pub mod encoder;

/// Caption decoder: embedding + LSTM stack + vocabulary head
pub mod decoder;

/// Combined captioning model and its loss
pub mod model;

/// Stabilized optimizers and the numerical-stabilization policy
pub mod optimizer;

/// Full training loop with validation and checkpointing
pub mod trainer;

/// Greedy caption generation from a checkpoint
pub mod generator;
