//! Attention kernel pipeline on wgpu.
//!
//! Three chained compute passes (tiled QK^T scores, numerically stable
//! in-place softmax, tiled probs x V aggregation) with key/value cache
//! append, grouped-query head mapping, additive attention bias, and ragged
//! per-batch sequence lengths. WGSL kernel sources are generated per
//! configuration and cached by source hash.

mod buffer;
mod device;
mod error;
mod kernel;
mod params;
mod pipeline;
mod probs;
mod softmax;
mod tensor;
mod transfer;
mod value;

pub use buffer::GpuBuffer;
pub use device::{GpuDevice, GpuError};
pub use error::AttentionError;
pub use kernel::KernelCache;
pub use params::{AttentionParameters, OutputPlan, RaggedLengths};
pub use pipeline::{apply_attention, AttentionOutput};
pub use tensor::{GpuTensor, GpuU32Tensor};
pub use transfer::transfer_bsd_to_bnsh;
