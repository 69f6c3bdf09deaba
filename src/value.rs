//! Value aggregation: tiled probs x V with cache append, interleaved output.

use crate::device::GpuDevice;
use crate::kernel::{hash_wgsl, BindingSpec, KernelCache};
use crate::params::{AttentionParameters, OutputPlan, RaggedLengths};
use crate::probs::TILE_SIZE;
use crate::tensor::GpuTensor;

pub(crate) struct ValueConfig {
    pub feed_past_value: bool,
    pub has_present_value: bool,
    pub ragged: bool,
}

/// WGSL for the value-aggregation kernel.
///
/// One workgroup computes one TILE_SIZE x TILE_SIZE tile of the
/// [seq, v_head_size] product for one (batch, head) pair. V rows come from
/// the past cache or the current value tensor and are appended to the present
/// cache as they are loaded. The result is stored interleaved as
/// [batch, seq, num_heads * v_head_size].
pub(crate) fn value_wgsl(cfg: &ValueConfig) -> String {
    let tile_sq = TILE_SIZE * TILE_SIZE;

    let mut s = String::from(
        r#"// Attention output: tiled probs x V with optional cache append

struct Params {
    m: u32,
    n: u32,
    k: u32,
    num_heads: u32,
    kv_num_heads: u32,
    n_reps: u32,
    kv_sequence_length: u32,
    past_sequence_length: u32,
}

"#,
    );

    let mut binding = 0u32;
    let mut bind = |s: &mut String, decl: &str| {
        s.push_str(&format!("@group(0) @binding({binding}) {decl};\n"));
        binding += 1;
    };
    bind(&mut s, "var<storage, read> probs: array<f32>");
    bind(&mut s, "var<storage, read> v: array<f32>");
    if cfg.feed_past_value {
        bind(&mut s, "var<storage, read> past_value: array<f32>");
    }
    if cfg.ragged {
        bind(&mut s, "var<storage, read> seqlens: array<u32>");
    }
    if cfg.has_present_value {
        bind(&mut s, "var<storage, read_write> present_value: array<f32>");
    }
    bind(&mut s, "var<storage, read_write> output: array<f32>");
    bind(&mut s, "var<uniform> params: Params");

    s.push_str(&format!(
        r#"
const TILE_SIZE: u32 = {TILE_SIZE}u;
var<workgroup> tile_probs: array<f32, {tile_sq}>;
var<workgroup> tile_v: array<f32, {tile_sq}>;

@compute @workgroup_size({TILE_SIZE}, {TILE_SIZE}, 1)
fn main(
    @builtin(workgroup_id) wg_id: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
) {{
    let batch_head = wg_id.z;
    let batch_idx = batch_head / params.num_heads;
    let head_idx = batch_head % params.num_heads;
    let m = wg_id.y * TILE_SIZE;
    let n = wg_id.x * TILE_SIZE;
    let abs_kv_head = batch_idx * params.kv_num_heads + head_idx / params.n_reps;

    let probs_offset = batch_head * params.m * params.k;
    let v_offset = abs_kv_head * params.kv_sequence_length * params.n;
"#
    ));
    if cfg.feed_past_value {
        s.push_str(
            "    let past_value_offset = abs_kv_head * params.past_sequence_length * params.n;\n",
        );
    }
    if cfg.has_present_value {
        s.push_str("    let present_value_offset = abs_kv_head * params.k * params.n;\n");
    }
    if cfg.ragged {
        s.push_str("    let past_len = seqlens[batch_idx];\n");
        s.push_str("    let total_len = past_len + params.kv_sequence_length;\n");
    } else {
        s.push_str("    let past_len = params.past_sequence_length;\n");
        s.push_str("    let total_len = params.k;\n");
    }

    s.push_str(
        r#"
    var value = 0.0;
    for (var w: u32 = 0u; w < params.k; w = w + TILE_SIZE) {
        if (m + lid.y < params.m && w + lid.x < total_len) {
            tile_probs[TILE_SIZE * lid.y + lid.x] =
                probs[probs_offset + (m + lid.y) * params.k + w + lid.x];
        }
        let v_row = w + lid.y;
        if (v_row < total_len && n + lid.x < params.n) {
            let idx = TILE_SIZE * lid.y + lid.x;
"#,
    );
    if cfg.feed_past_value {
        s.push_str(
            r#"            if (v_row < past_len) {
                tile_v[idx] = past_value[past_value_offset + v_row * params.n + n + lid.x];
            } else {
                tile_v[idx] = v[v_offset + (v_row - past_len) * params.n + n + lid.x];
            }
"#,
        );
    } else {
        s.push_str("            tile_v[idx] = v[v_offset + v_row * params.n + n + lid.x];\n");
    }
    if cfg.has_present_value {
        // One workgroup per cache cell: the first row tile of the first
        // query head in each kv group does the append.
        s.push_str(
            r#"            if (wg_id.y == 0u && head_idx % params.n_reps == 0u) {
                present_value[present_value_offset + v_row * params.n + n + lid.x] = tile_v[idx];
            }
"#,
        );
    }
    s.push_str(
        r#"        }
        workgroupBarrier();
        for (var i: u32 = 0u; i < TILE_SIZE; i = i + 1u) {
            if (w + i < total_len) {
                value = value + tile_probs[TILE_SIZE * lid.y + i] * tile_v[TILE_SIZE * i + lid.x];
            }
        }
        workgroupBarrier();
    }

    if (m + lid.y < params.m && n + lid.x < params.n) {
        let out_idx = batch_idx * params.m * params.num_heads * params.n
            + (m + lid.y) * params.num_heads * params.n + head_idx * params.n + n + lid.x;
        output[out_idx] = value;
    }
}
"#,
    );
    s
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ValueParams {
    m: u32,
    n: u32,
    k: u32,
    num_heads: u32,
    kv_num_heads: u32,
    n_reps: u32,
    kv_sequence_length: u32,
    past_sequence_length: u32,
}

/// Dispatch the value-aggregation kernel, writing the attention output.
#[allow(clippy::too_many_arguments)]
pub(crate) fn compute_attention_value(
    device: &GpuDevice,
    cache: &mut KernelCache,
    probs: &GpuTensor,
    v: &GpuTensor,
    past_value: Option<&GpuTensor>,
    present_value: Option<&GpuTensor>,
    output: &GpuTensor,
    params: &AttentionParameters,
    plan: &OutputPlan,
    ragged: Option<&RaggedLengths>,
) {
    assert!(
        !plan.feed_past_value || past_value.is_some(),
        "feed_past_value requires a past_value tensor"
    );
    assert_eq!(
        plan.has_present_value,
        present_value.is_some(),
        "present_value tensor must match the output plan"
    );

    let cfg = ValueConfig {
        feed_past_value: plan.feed_past_value,
        has_present_value: plan.has_present_value,
        ragged: ragged.is_some(),
    };
    let wgsl = value_wgsl(&cfg);

    let uniform = ValueParams {
        m: params.sequence_length as u32,
        n: params.v_head_size as u32,
        k: plan.total_sequence_length as u32,
        num_heads: params.num_heads as u32,
        kv_num_heads: params.kv_num_heads as u32,
        n_reps: params.n_reps() as u32,
        kv_sequence_length: params.kv_sequence_length as u32,
        past_sequence_length: plan.past_sequence_length as u32,
    };

    let mut bindings = vec![
        BindingSpec::Storage { read_only: true },
        BindingSpec::Storage { read_only: true },
    ];
    if cfg.feed_past_value {
        bindings.push(BindingSpec::Storage { read_only: true });
    }
    if cfg.ragged {
        bindings.push(BindingSpec::Storage { read_only: true });
    }
    if cfg.has_present_value {
        bindings.push(BindingSpec::Storage { read_only: false });
    }
    bindings.push(BindingSpec::Storage { read_only: false });
    bindings.push(BindingSpec::Uniform);

    let hash = hash_wgsl(&wgsl);
    let cached = cache.get_or_compile_dynamic(device, &wgsl, hash, &bindings);

    use wgpu::util::DeviceExt;
    let params_buf = device
        .device
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("value params"),
            contents: bytemuck::bytes_of(&uniform),
            usage: wgpu::BufferUsages::UNIFORM,
        });

    let mut buffers: Vec<&wgpu::Buffer> = vec![&probs.buffer.buffer, &v.buffer.buffer];
    if let Some(pv) = past_value.filter(|_| cfg.feed_past_value) {
        buffers.push(&pv.buffer.buffer);
    }
    if let Some(r) = ragged {
        buffers.push(&r.lengths.buffer.buffer);
    }
    if let Some(pv) = present_value {
        buffers.push(&pv.buffer.buffer);
    }
    buffers.push(&output.buffer.buffer);

    let mut entries: Vec<wgpu::BindGroupEntry> = buffers
        .iter()
        .enumerate()
        .map(|(i, buf)| wgpu::BindGroupEntry {
            binding: i as u32,
            resource: buf.as_entire_binding(),
        })
        .collect();
    entries.push(wgpu::BindGroupEntry {
        binding: entries.len() as u32,
        resource: params_buf.as_entire_binding(),
    });

    let bind_group = device.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("value bind group"),
        layout: &cached.bind_group_layout,
        entries: &entries,
    });

    let mut encoder = device
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("value dispatch"),
        });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("value compute"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&cached.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(
            (params.v_head_size as u32).div_ceil(TILE_SIZE),
            (params.sequence_length as u32).div_ceil(TILE_SIZE),
            (params.batch_size * params.num_heads) as u32,
        );
    }
    cache.submit_or_enqueue(device, encoder.finish());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cfg() -> ValueConfig {
        ValueConfig {
            feed_past_value: false,
            has_present_value: false,
            ragged: false,
        }
    }

    #[test]
    fn wgsl_cache_fragments_are_conditional() {
        let plain = value_wgsl(&base_cfg());
        assert!(!plain.contains("past_value"));
        assert!(!plain.contains("present_value"));
        assert!(!plain.contains("seqlens"));

        let cached = value_wgsl(&ValueConfig {
            feed_past_value: true,
            has_present_value: true,
            ..base_cfg()
        });
        assert!(cached.contains("var<storage, read> past_value"));
        assert!(cached.contains("var<storage, read_write> present_value"));
        assert!(cached.contains("v_row - past_len"));
    }

    fn get_device() -> GpuDevice {
        GpuDevice::new_sync().expect("GPU device required for tests")
    }

    #[test]
    fn weighted_sum_of_value_rows() {
        let device = get_device();
        let mut cache = KernelCache::new();

        let params = AttentionParameters {
            batch_size: 1,
            num_heads: 1,
            kv_num_heads: 1,
            sequence_length: 1,
            kv_sequence_length: 2,
            past_sequence_length: 0,
            head_size: 2,
            v_head_size: 2,
            scale: 0.0,
        };
        let plan = OutputPlan::resolve(&params, false, false, false, None);

        let probs = GpuTensor::from_slice(&device, &[0.25, 0.75], &[1, 1, 1, 2]);
        let v = GpuTensor::from_slice(&device, &[1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2]);
        let output = GpuTensor::uninit(&device, &[1, 1, 2]);

        compute_attention_value(
            &device, &mut cache, &probs, &v, None, None, &output, &params, &plan, None,
        );

        let result = output.to_vec_sync(&device);
        assert_eq!(result, vec![2.5, 3.5]);
    }

    #[test]
    fn past_rows_feed_in_and_present_captures_both() {
        let device = get_device();
        let mut cache = KernelCache::new();

        let params = AttentionParameters {
            batch_size: 1,
            num_heads: 1,
            kv_num_heads: 1,
            sequence_length: 1,
            kv_sequence_length: 1,
            past_sequence_length: 1,
            head_size: 2,
            v_head_size: 2,
            scale: 0.0,
        };
        let plan = OutputPlan::resolve(&params, true, true, true, None);
        assert!(plan.feed_past_value);

        let probs = GpuTensor::from_slice(&device, &[0.5, 0.5], &[1, 1, 1, 2]);
        let v = GpuTensor::from_slice(&device, &[20.0, 21.0], &[1, 1, 1, 2]);
        let past_value = GpuTensor::from_slice(&device, &[10.0, 11.0], &[1, 1, 1, 2]);
        let present_value = GpuTensor::uninit(&device, &[1, 1, 2, 2]);
        let output = GpuTensor::uninit(&device, &[1, 1, 2]);

        compute_attention_value(
            &device,
            &mut cache,
            &probs,
            &v,
            Some(&past_value),
            Some(&present_value),
            &output,
            &params,
            &plan,
            None,
        );

        let result = output.to_vec_sync(&device);
        assert_eq!(result, vec![15.0, 16.0]);

        let present = present_value.to_vec_sync(&device);
        assert_eq!(present, vec![10.0, 11.0, 20.0, 21.0]);
    }
}
