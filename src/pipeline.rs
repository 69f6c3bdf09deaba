//! Pipeline orchestrator: validate, plan, and chain the three attention passes.

use tracing::debug;

use crate::device::GpuDevice;
use crate::error::AttentionError;
use crate::kernel::KernelCache;
use crate::params::{AttentionParameters, OutputPlan, RaggedLengths};
use crate::probs::compute_attention_probs;
use crate::softmax::compute_inplace_softmax;
use crate::tensor::GpuTensor;
use crate::value::compute_attention_value;

/// Result of one attention call.
///
/// `present_key`/`present_value` are populated only when the caller asked
/// for a cache and supplied the matching past tensor (an empty past tensor
/// is how the first call of a sequence requests one).
pub struct AttentionOutput {
    /// Attention output, `[batch, seq, num_heads * v_head_size]`.
    pub output: GpuTensor,
    /// Updated key cache, `[batch, kv_num_heads, total_seq, head_size]`.
    pub present_key: Option<GpuTensor>,
    /// Updated value cache, `[batch, kv_num_heads, total_seq, v_head_size]`.
    pub present_value: Option<GpuTensor>,
}

fn expect_shape(
    tensor: &GpuTensor,
    expected: &[usize],
    what: &'static str,
) -> Result<(), AttentionError> {
    if tensor.shape() != expected {
        return Err(AttentionError::ShapeMismatch {
            what,
            details: format!("expected {expected:?}, got {:?}", tensor.shape()),
        });
    }
    Ok(())
}

/// Run the attention pipeline: scores, softmax, value aggregation.
///
/// `q` is `[batch, num_heads, seq, head_size]`; `k`/`v` are
/// `[batch, kv_num_heads, kv_seq, head_size/v_head_size]`. `attention_bias`
/// is added to the scaled scores. `past_key`/`past_value` rows are fed in
/// ahead of the current rows and copied into the present caches. With
/// `ragged` lengths, per-batch cached lengths replace the uniform
/// `past_sequence_length` for cache offsets and softmax masking.
///
/// All shapes are checked against `params` before any dispatch.
#[allow(clippy::too_many_arguments)]
pub fn apply_attention(
    device: &GpuDevice,
    cache: &mut KernelCache,
    q: &GpuTensor,
    k: &GpuTensor,
    v: &GpuTensor,
    attention_bias: Option<&GpuTensor>,
    past_key: Option<&GpuTensor>,
    past_value: Option<&GpuTensor>,
    want_present: bool,
    params: &AttentionParameters,
    ragged: Option<&RaggedLengths>,
) -> Result<AttentionOutput, AttentionError> {
    params.validate()?;

    let b = params.batch_size;
    let h = params.num_heads;
    let kv_h = params.kv_num_heads;
    let s = params.sequence_length;
    let kv_s = params.kv_sequence_length;
    let d = params.head_size;
    let vd = params.v_head_size;

    expect_shape(q, &[b, h, s, d], "q")?;
    expect_shape(k, &[b, kv_h, kv_s, d], "k")?;
    expect_shape(v, &[b, kv_h, kv_s, vd], "v")?;
    if let Some(pk) = past_key {
        expect_shape(pk, &[b, kv_h, params.past_sequence_length, d], "past_key")?;
    }
    if let Some(pv) = past_value {
        expect_shape(
            pv,
            &[b, kv_h, params.past_sequence_length, vd],
            "past_value",
        )?;
    }
    if let Some(r) = ragged {
        if r.batch_size() != b {
            return Err(AttentionError::ShapeMismatch {
                what: "ragged lengths",
                details: format!("expected {b} entries, got {}", r.batch_size()),
            });
        }
    }

    let plan = OutputPlan::resolve(
        params,
        want_present,
        past_key.is_some(),
        past_value.is_some(),
        ragged,
    );
    let total = plan.total_sequence_length;

    if let Some(bias) = attention_bias {
        expect_shape(bias, &[b, h, s, total], "attention_bias")?;
    }

    debug!(
        "attention: batch {} heads {}/{} seq {} kv_seq {} past {} total {} outputs {}",
        b, h, kv_h, s, kv_s, plan.past_sequence_length, total, plan.output_count
    );

    let probs = GpuTensor::uninit(device, &[b, h, s, total]);
    let present_key = plan
        .has_present_key
        .then(|| GpuTensor::uninit(device, &[b, kv_h, total, d]));
    let present_value = plan
        .has_present_value
        .then(|| GpuTensor::uninit(device, &[b, kv_h, total, vd]));
    let output = GpuTensor::uninit(device, &[b, s, h * vd]);

    compute_attention_probs(
        device,
        cache,
        q,
        k,
        past_key,
        attention_bias,
        present_key.as_ref(),
        &probs,
        params,
        &plan,
        ragged,
    );
    compute_inplace_softmax(device, cache, &probs, params, &plan, ragged);
    compute_attention_value(
        device,
        cache,
        &probs,
        v,
        past_value,
        present_value.as_ref(),
        &output,
        params,
        &plan,
        ragged,
    );

    Ok(AttentionOutput {
        output,
        present_key,
        present_value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_device() -> GpuDevice {
        GpuDevice::new_sync().expect("GPU device required for tests")
    }

    fn assert_close(got: &[f32], want: &[f32], tol: f32, what: &str) {
        assert_eq!(got.len(), want.len(), "{what}: length mismatch");
        for (i, (&g, &w)) in got.iter().zip(want).enumerate() {
            assert!(
                (g - w).abs() < tol,
                "{what}: element {i} got {g}, want {w}"
            );
        }
    }

    fn identity_params() -> AttentionParameters {
        AttentionParameters {
            batch_size: 1,
            num_heads: 1,
            kv_num_heads: 1,
            sequence_length: 2,
            kv_sequence_length: 2,
            past_sequence_length: 0,
            head_size: 2,
            v_head_size: 2,
            scale: 1.0,
        }
    }

    #[test]
    fn hand_computed_end_to_end() {
        let device = get_device();
        let mut cache = KernelCache::new();

        // Q = K = I, V = [[1,2],[3,4]], scale 1: scores are the identity,
        // each softmax row is [e, 1]/(e+1) up to permutation.
        let eye = GpuTensor::from_slice(&device, &[1.0, 0.0, 0.0, 1.0], &[1, 1, 2, 2]);
        let k = GpuTensor::from_slice(&device, &[1.0, 0.0, 0.0, 1.0], &[1, 1, 2, 2]);
        let v = GpuTensor::from_slice(&device, &[1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2]);
        let params = identity_params();

        let result = apply_attention(
            &device, &mut cache, &eye, &k, &v, None, None, None, false, &params, None,
        )
        .expect("attention failed");

        assert_eq!(result.output.shape(), &[1, 2, 2]);
        assert!(result.present_key.is_none());
        assert!(result.present_value.is_none());

        let out = result.output.to_vec_sync(&device);
        assert_close(
            &out,
            &[1.5378, 2.5378, 2.4622, 3.4622],
            1e-4,
            "identity attention",
        );
    }

    #[test]
    fn repeated_runs_are_identical() {
        let device = get_device();
        let mut cache = KernelCache::new();

        let q = GpuTensor::from_slice(&device, &[0.3, -1.2, 0.8, 2.1], &[1, 1, 2, 2]);
        let k = GpuTensor::from_slice(&device, &[1.0, 0.5, -0.7, 0.2], &[1, 1, 2, 2]);
        let v = GpuTensor::from_slice(&device, &[1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2]);
        let params = identity_params();

        let first = apply_attention(
            &device, &mut cache, &q, &k, &v, None, None, None, false, &params, None,
        )
        .expect("attention failed");
        let second = apply_attention(
            &device, &mut cache, &q, &k, &v, None, None, None, false, &params, None,
        )
        .expect("attention failed");

        assert_eq!(
            first.output.to_vec_sync(&device),
            second.output.to_vec_sync(&device),
            "same inputs must give bitwise-identical outputs"
        );
    }

    #[test]
    fn bias_steers_the_softmax() {
        let device = get_device();
        let mut cache = KernelCache::new();

        // Zero Q makes all scores equal; the bias picks the first kv row.
        let q = GpuTensor::from_slice(&device, &[0.0, 0.0], &[1, 1, 1, 2]);
        let k = GpuTensor::from_slice(&device, &[1.0, 0.0, 0.0, 1.0], &[1, 1, 2, 2]);
        let v = GpuTensor::from_slice(&device, &[1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2]);
        let bias = GpuTensor::from_slice(&device, &[0.0, -1000.0], &[1, 1, 1, 2]);
        let params = AttentionParameters {
            sequence_length: 1,
            ..identity_params()
        };

        let result = apply_attention(
            &device,
            &mut cache,
            &q,
            &k,
            &v,
            Some(&bias),
            None,
            None,
            false,
            &params,
            None,
        )
        .expect("attention failed");

        let out = result.output.to_vec_sync(&device);
        assert_close(&out, &[1.0, 2.0], 1e-4, "biased attention");
    }

    #[test]
    fn cache_append_preserves_past_then_current() {
        let device = get_device();
        let mut cache = KernelCache::new();

        // All keys identical: softmax is uniform 1/3, output is the mean of
        // the three value rows.
        let params = AttentionParameters {
            batch_size: 1,
            num_heads: 1,
            kv_num_heads: 1,
            sequence_length: 1,
            kv_sequence_length: 1,
            past_sequence_length: 2,
            head_size: 2,
            v_head_size: 2,
            scale: 1.0,
        };
        let q = GpuTensor::from_slice(&device, &[0.5, -0.5], &[1, 1, 1, 2]);
        let k = GpuTensor::from_slice(&device, &[1.0, 0.0], &[1, 1, 1, 2]);
        let v = GpuTensor::from_slice(&device, &[0.0, 0.0], &[1, 1, 1, 2]);
        let past_key =
            GpuTensor::from_slice(&device, &[1.0, 0.0, 1.0, 0.0], &[1, 1, 2, 2]);
        let past_value =
            GpuTensor::from_slice(&device, &[3.0, 6.0, 9.0, 12.0], &[1, 1, 2, 2]);

        let result = apply_attention(
            &device,
            &mut cache,
            &q,
            &k,
            &v,
            None,
            Some(&past_key),
            Some(&past_value),
            true,
            &params,
            None,
        )
        .expect("attention failed");

        let present_key = result.present_key.expect("present key missing");
        let present_value = result.present_value.expect("present value missing");
        assert_eq!(present_key.shape(), &[1, 1, 3, 2]);
        assert_eq!(
            present_key.to_vec_sync(&device),
            vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0],
            "past rows then current rows"
        );
        assert_eq!(
            present_value.to_vec_sync(&device),
            vec![3.0, 6.0, 9.0, 12.0, 0.0, 0.0],
            "past rows then current rows"
        );

        let out = result.output.to_vec_sync(&device);
        assert_close(&out, &[4.0, 6.0], 1e-5, "uniform mix over cache");
    }

    #[test]
    fn grouped_heads_share_kv_heads() {
        let device = get_device();
        let mut cache = KernelCache::new();

        // 4 query heads over 2 kv heads: heads {0,1} read kv head 0,
        // heads {2,3} read kv head 1. A single kv row makes the softmax 1.
        let params = AttentionParameters {
            batch_size: 1,
            num_heads: 4,
            kv_num_heads: 2,
            sequence_length: 1,
            kv_sequence_length: 1,
            past_sequence_length: 0,
            head_size: 1,
            v_head_size: 1,
            scale: 0.0,
        };
        let q = GpuTensor::from_slice(&device, &[1.0, 1.0, 1.0, 1.0], &[1, 4, 1, 1]);
        let k = GpuTensor::from_slice(&device, &[1.0, 1.0], &[1, 2, 1, 1]);
        let v = GpuTensor::from_slice(&device, &[7.0, 9.0], &[1, 2, 1, 1]);

        let result = apply_attention(
            &device, &mut cache, &q, &k, &v, None, None, None, false, &params, None,
        )
        .expect("attention failed");

        let out = result.output.to_vec_sync(&device);
        assert_eq!(out, vec![7.0, 7.0, 9.0, 9.0]);
    }

    #[test]
    fn ragged_lengths_mask_per_batch() {
        let device = get_device();
        let mut cache = KernelCache::new();

        // batch 0 starts empty (only its new row is valid), batch 1 carries
        // three cached rows. Identical keys make batch 1's mix uniform.
        let params = AttentionParameters {
            batch_size: 2,
            num_heads: 1,
            kv_num_heads: 1,
            sequence_length: 1,
            kv_sequence_length: 1,
            past_sequence_length: 3,
            head_size: 1,
            v_head_size: 1,
            scale: 1.0,
        };
        let ragged = RaggedLengths::new(&device, &[0, 3], 4).expect("ragged lengths");

        let q = GpuTensor::from_slice(&device, &[1.0, 1.0], &[2, 1, 1, 1]);
        let k = GpuTensor::from_slice(&device, &[1.0, 1.0], &[2, 1, 1, 1]);
        let v = GpuTensor::from_slice(&device, &[2.0, 16.0], &[2, 1, 1, 1]);
        let past_key = GpuTensor::from_slice(
            &device,
            &[0.0, 0.0, 0.0, 1.0, 1.0, 1.0],
            &[2, 1, 3, 1],
        );
        let past_value = GpuTensor::from_slice(
            &device,
            &[0.0, 0.0, 0.0, 4.0, 8.0, 12.0],
            &[2, 1, 3, 1],
        );

        let result = apply_attention(
            &device,
            &mut cache,
            &q,
            &k,
            &v,
            None,
            Some(&past_key),
            Some(&past_value),
            true,
            &params,
            Some(&ragged),
        )
        .expect("attention failed");

        let out = result.output.to_vec_sync(&device);
        assert_close(&out[..1], &[2.0], 1e-5, "batch 0 sees only its new row");
        assert_close(&out[1..], &[10.0], 1e-5, "batch 1 mixes all four rows");

        // Valid cache prefixes: batch 0 row 0 is the new row, batch 1 rows
        // 0..3 are past and row 3 is the new row.
        let present_value = result.present_value.expect("present value missing");
        let pv = present_value.to_vec_sync(&device);
        assert_eq!(present_value.shape(), &[2, 1, 4, 1]);
        assert_eq!(pv[0], 2.0);
        assert_eq!(&pv[4..8], &[4.0, 8.0, 12.0, 16.0]);
    }

    #[test]
    fn shape_mismatch_is_rejected_before_dispatch() {
        let device = get_device();
        let mut cache = KernelCache::new();

        let params = identity_params();
        let bad_q = GpuTensor::from_slice(&device, &[1.0, 0.0], &[1, 1, 1, 2]);
        let k = GpuTensor::from_slice(&device, &[1.0, 0.0, 0.0, 1.0], &[1, 1, 2, 2]);
        let v = GpuTensor::from_slice(&device, &[1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2]);

        let err = apply_attention(
            &device, &mut cache, &bad_q, &k, &v, None, None, None, false, &params, None,
        );
        match err {
            Err(AttentionError::ShapeMismatch { what, .. }) => assert_eq!(what, "q"),
            Err(other) => panic!("expected shape mismatch, got {other}"),
            Ok(_) => panic!("expected shape mismatch, got output"),
        }
    }

    #[test]
    fn ragged_batch_count_must_match() {
        let device = get_device();
        let mut cache = KernelCache::new();

        let params = AttentionParameters {
            sequence_length: 1,
            ..identity_params()
        };
        let q = GpuTensor::from_slice(&device, &[1.0, 0.0], &[1, 1, 1, 2]);
        let k = GpuTensor::from_slice(&device, &[1.0, 0.0, 0.0, 1.0], &[1, 1, 2, 2]);
        let v = GpuTensor::from_slice(&device, &[1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2]);
        let ragged = RaggedLengths::new(&device, &[0, 0], 3).expect("ragged lengths");

        let err = apply_attention(
            &device,
            &mut cache,
            &q,
            &k,
            &v,
            None,
            None,
            None,
            false,
            &params,
            Some(&ragged),
        );
        assert!(err.is_err(), "batch count mismatch must be rejected");
    }
}
