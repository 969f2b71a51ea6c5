// ============================================================
// Layer 6 - Infrastructure Layer
// ============================================================
// Cross-cutting persistence concerns:
//
//   vocab_store.rs - vocabulary and pretrained-embedding lookup
//                    files; the only source of token <-> id truth
//                    shared by training and inference.
//
//   checkpoint.rs  - per-epoch training-state snapshots (model,
//                    optimizer, counters) behind an explicit
//                    manifest, plus the write-once hyperparameter
//                    record compared on resume.
//
//   metrics.rs     - append-only named-scalar event stream (CSV).

/// Vocabulary and embedding-table persistence
pub mod vocab_store;

/// Checkpoint saving, loading and the resume manifest
pub mod checkpoint;

/// Training metrics event stream
pub mod metrics;
