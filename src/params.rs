//! Per-call attention configuration and derived dimensions.

use crate::device::GpuDevice;
use crate::error::AttentionError;
use crate::tensor::GpuU32Tensor;

/// Immutable per-call attention configuration.
///
/// All dimensions are element counts on the host; they are lowered to u32
/// uniform fields at dispatch time.
#[derive(Debug, Clone)]
pub struct AttentionParameters {
    pub batch_size: usize,
    pub num_heads: usize,
    /// Key/value head count; `num_heads / kv_num_heads` query heads share
    /// each kv head (grouped-query attention).
    pub kv_num_heads: usize,
    /// Query rows per batch element.
    pub sequence_length: usize,
    /// Rows in the current (new) key/value tensors.
    pub kv_sequence_length: usize,
    /// Rows in the past key/value cache tensors.
    pub past_sequence_length: usize,
    pub head_size: usize,
    pub v_head_size: usize,
    /// Score scaling factor; 0.0 selects the default `1/sqrt(head_size)`.
    pub scale: f32,
}

impl AttentionParameters {
    /// Number of query heads sharing each kv head.
    pub fn n_reps(&self) -> usize {
        self.num_heads / self.kv_num_heads
    }

    /// Output hidden width: `num_heads * v_head_size`.
    pub fn v_hidden_size(&self) -> usize {
        self.num_heads * self.v_head_size
    }

    /// Effective score scale.
    pub fn alpha(&self) -> f32 {
        if self.scale == 0.0 {
            1.0 / (self.head_size as f32).sqrt()
        } else {
            self.scale
        }
    }

    /// Check internal consistency. Called by the orchestrator before any
    /// tensor validation.
    pub fn validate(&self) -> Result<(), AttentionError> {
        if self.batch_size == 0
            || self.num_heads == 0
            || self.kv_num_heads == 0
            || self.sequence_length == 0
            || self.kv_sequence_length == 0
            || self.head_size == 0
            || self.v_head_size == 0
        {
            return Err(AttentionError::ShapeMismatch {
                what: "parameters",
                details: format!("all dimensions must be nonzero, got {self:?}"),
            });
        }
        if self.num_heads % self.kv_num_heads != 0 {
            return Err(AttentionError::ShapeMismatch {
                what: "parameters",
                details: format!(
                    "num_heads {} not divisible by kv_num_heads {}",
                    self.num_heads, self.kv_num_heads
                ),
            });
        }
        Ok(())
    }
}

/// Per-batch already-occupied cache lengths, for ragged sequences.
///
/// Supersedes the uniform `past_sequence_length` for cache offsets and
/// softmax masking. The lengths live on the GPU for kernel access; a host
/// copy is kept for validation.
pub struct RaggedLengths {
    pub(crate) lengths: GpuU32Tensor,
    pub(crate) host_lengths: Vec<u32>,
    /// Maximum total (cached + current) sequence length across the batch.
    pub max_total_length: usize,
}

impl RaggedLengths {
    /// Upload per-batch cached lengths, one entry per batch row.
    ///
    /// Each length must not exceed `max_total_length`.
    pub fn new(
        device: &GpuDevice,
        lengths: &[u32],
        max_total_length: usize,
    ) -> Result<Self, AttentionError> {
        for (b, &len) in lengths.iter().enumerate() {
            if len as usize > max_total_length {
                return Err(AttentionError::ShapeMismatch {
                    what: "ragged lengths",
                    details: format!(
                        "length {len} at batch {b} exceeds max total length {max_total_length}"
                    ),
                });
            }
        }
        Ok(Self {
            lengths: GpuU32Tensor::from_slice(device, lengths),
            host_lengths: lengths.to_vec(),
            max_total_length,
        })
    }

    /// Number of batch entries.
    pub fn batch_size(&self) -> usize {
        self.host_lengths.len()
    }
}

/// Derived output dimensions for one pipeline call.
///
/// `output_count` counts how many of {output, present_key, present_value}
/// the call will actually produce: present tensors are only produced when
/// the caller asks for them and supplies the matching past tensor (an empty
/// past tensor is how the first call of a sequence requests a cache).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputPlan {
    pub output_count: usize,
    /// Uniform past length; 0 when no cache is produced.
    pub past_sequence_length: usize,
    /// Rows in the score matrix and present caches.
    pub total_sequence_length: usize,
    pub feed_past_key: bool,
    pub feed_past_value: bool,
    pub has_present_key: bool,
    pub has_present_value: bool,
}

impl OutputPlan {
    pub fn resolve(
        params: &AttentionParameters,
        want_present: bool,
        has_past_key: bool,
        has_past_value: bool,
        ragged: Option<&RaggedLengths>,
    ) -> Self {
        let requested = if want_present { 3 } else { 1 };
        let output_count = requested.min(1 + has_past_key as usize + has_past_value as usize);

        let past_sequence_length = if output_count > 1 {
            params.past_sequence_length
        } else {
            0
        };
        let mut total_sequence_length = past_sequence_length + params.kv_sequence_length;
        if let Some(r) = ragged {
            total_sequence_length = total_sequence_length.max(r.max_total_length);
        }

        let has_present_key = output_count >= 2;
        let has_present_value = output_count >= 3;
        let feed_past = ragged.is_some() || past_sequence_length > 0;

        Self {
            output_count,
            past_sequence_length,
            total_sequence_length,
            feed_past_key: has_present_key && has_past_key && feed_past,
            feed_past_value: has_present_value && has_past_value && feed_past,
            has_present_key,
            has_present_value,
        }
    }
}
