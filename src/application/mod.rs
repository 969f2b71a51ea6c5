// ============================================================
// Layer 2 - Application / Use Cases
// ============================================================
// Workflow coordination only: these modules wire the data, ml
// and infra layers together for one goal each and hold no model
// math or file-format knowledge of their own.

// The training workflow
pub mod train_use_case;

// The inference/captioning workflow
pub mod caption_use_case;
