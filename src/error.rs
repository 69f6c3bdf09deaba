//! Error type for the attention pipeline.

use std::fmt;

use crate::device::GpuError;

/// Error returned by pipeline entry points.
///
/// Contract violations (wrong rank, mismatched dimensions, a missing tensor
/// that a flag implies) are detected before any kernel is dispatched and are
/// never retried.
#[derive(Debug)]
pub enum AttentionError {
    /// An input tensor's rank or dimensions violate the call contract.
    ShapeMismatch {
        what: &'static str,
        details: String,
    },
    /// GPU device acquisition or execution failure.
    Device(GpuError),
}

impl fmt::Display for AttentionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeMismatch { what, details } => {
                write!(f, "shape mismatch for {what}: {details}")
            }
            Self::Device(e) => write!(f, "GPU failure: {e}"),
        }
    }
}

impl std::error::Error for AttentionError {}

impl From<GpuError> for AttentionError {
    fn from(e: GpuError) -> Self {
        Self::Device(e)
    }
}
