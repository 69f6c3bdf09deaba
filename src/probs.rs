//! Score kernel: tiled Q·K^T with cache append, grouped heads, bias, ragged lengths.

use crate::device::GpuDevice;
use crate::kernel::{hash_wgsl, BindingSpec, KernelCache};
use crate::params::{AttentionParameters, OutputPlan, RaggedLengths};
use crate::tensor::GpuTensor;

/// Shared-memory tile edge for the score and value-aggregation kernels.
pub(crate) const TILE_SIZE: u32 = 12;

/// Vector width for loads along a dimension: 4, then 2, then scalar.
pub(crate) fn components_for(dim: usize) -> u32 {
    if dim % 4 == 0 {
        4
    } else if dim % 2 == 0 {
        2
    } else {
        1
    }
}

pub(crate) fn value_type(components: u32) -> &'static str {
    match components {
        4 => "vec4<f32>",
        2 => "vec2<f32>",
        _ => "f32",
    }
}

pub(crate) struct ProbsConfig {
    pub components: u32,
    pub feed_past_key: bool,
    pub has_present_key: bool,
    pub has_attention_bias: bool,
    pub ragged: bool,
}

/// WGSL for the score kernel.
///
/// One workgroup computes one TILE_SIZE x TILE_SIZE tile of the
/// [seq, total_seq] score slab for one (batch, head) pair. Q rows and K rows
/// are staged in workgroup memory; K rows come from the past cache or the
/// current key tensor and are appended to the present cache as they are
/// loaded.
pub(crate) fn probs_wgsl(cfg: &ProbsConfig) -> String {
    let value_t = value_type(cfg.components);
    let tile_sq = TILE_SIZE * TILE_SIZE;

    let mut s = String::from(
        r#"// Attention scores: tiled Q x K^T with optional cache append

struct Params {
    m: u32,
    n: u32,
    k: u32,
    num_heads: u32,
    kv_num_heads: u32,
    n_reps: u32,
    kv_sequence_length: u32,
    past_sequence_length: u32,
    alpha: f32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

"#,
    );

    let mut binding = 0u32;
    let mut bind = |s: &mut String, decl: &str| {
        s.push_str(&format!("@group(0) @binding({binding}) {decl};\n"));
        binding += 1;
    };
    bind(&mut s, &format!("var<storage, read> q: array<{value_t}>"));
    bind(&mut s, &format!("var<storage, read> key: array<{value_t}>"));
    if cfg.feed_past_key {
        bind(
            &mut s,
            &format!("var<storage, read> past_key: array<{value_t}>"),
        );
    }
    if cfg.has_attention_bias {
        bind(&mut s, "var<storage, read> attention_bias: array<f32>");
    }
    if cfg.ragged {
        bind(&mut s, "var<storage, read> seqlens: array<u32>");
    }
    if cfg.has_present_key {
        bind(
            &mut s,
            &format!("var<storage, read_write> present_key: array<{value_t}>"),
        );
    }
    bind(&mut s, "var<storage, read_write> output: array<f32>");
    bind(&mut s, "var<uniform> params: Params");

    s.push_str(&format!(
        r#"
const TILE_SIZE: u32 = {TILE_SIZE}u;
var<workgroup> tile_q: array<{value_t}, {tile_sq}>;
var<workgroup> tile_k: array<{value_t}, {tile_sq}>;

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

    let q_offset = batch_head * params.m * params.k + m * params.k;
    let key_offset = abs_kv_head * params.kv_sequence_length * params.k;
"#
    ));
    if cfg.feed_past_key {
        s.push_str(
            "    let past_key_offset = abs_kv_head * params.past_sequence_length * params.k;\n",
        );
    }
    if cfg.has_present_key {
        s.push_str("    let present_key_offset = abs_kv_head * params.n * params.k;\n");
    }
    if cfg.ragged {
        s.push_str("    let past_len = seqlens[batch_idx];\n");
        s.push_str("    let total_len = past_len + params.kv_sequence_length;\n");
    } else {
        s.push_str("    let past_len = params.past_sequence_length;\n");
        s.push_str("    let total_len = params.n;\n");
    }

    s.push_str(&format!(
        r#"
    var value = {value_t}(0.0);
    for (var w: u32 = 0u; w < params.k; w = w + TILE_SIZE) {{
        if (m + lid.y < params.m && w + lid.x < params.k) {{
            tile_q[TILE_SIZE * lid.y + lid.x] = q[q_offset + lid.y * params.k + w + lid.x];
        }}
        if (n + lid.y < total_len && w + lid.x < params.k) {{
            let row = n + lid.y;
            let idx = TILE_SIZE * lid.y + lid.x;
"#
    ));
    if cfg.feed_past_key {
        s.push_str(
            r#"            if (row < past_len) {
                tile_k[idx] = past_key[past_key_offset + row * params.k + w + lid.x];
            } else {
                tile_k[idx] = key[key_offset + (row - past_len) * params.k + w + lid.x];
            }
"#,
        );
    } else {
        s.push_str(
            "            tile_k[idx] = key[key_offset + row * params.k + w + lid.x];\n",
        );
    }
    if cfg.has_present_key {
        // One workgroup per cache cell: the first row tile of the first
        // query head in each kv group does the append.
        s.push_str(
            r#"            if (wg_id.y == 0u && head_idx % params.n_reps == 0u) {
                present_key[present_key_offset + row * params.k + w + lid.x] = tile_k[idx];
            }
"#,
        );
    }
    s.push_str(
        r#"        }
        workgroupBarrier();
        for (var i: u32 = 0u; i < TILE_SIZE; i = i + 1u) {
            if (w + i < params.k) {
                value = value + tile_q[TILE_SIZE * lid.y + i] * tile_k[TILE_SIZE * lid.x + i];
            }
        }
        workgroupBarrier();
    }

    if (m + lid.y < params.m && n + lid.x < total_len) {
        let out_idx = batch_head * params.m * params.n + (m + lid.y) * params.n + n + lid.x;
"#,
    );
    let lane_sum = match cfg.components {
        4 => "value.x + value.y + value.z + value.w",
        2 => "value.x + value.y",
        _ => "value",
    };
    s.push_str(&format!("        var sum = ({lane_sum}) * params.alpha;\n"));
    if cfg.has_attention_bias {
        s.push_str("        sum = sum + attention_bias[out_idx];\n");
    }
    s.push_str(
        r#"        output[out_idx] = sum;
    }
}
"#,
    );
    s
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ProbsParams {
    m: u32,
    n: u32,
    k: u32,
    num_heads: u32,
    kv_num_heads: u32,
    n_reps: u32,
    kv_sequence_length: u32,
    past_sequence_length: u32,
    alpha: f32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

/// Dispatch the score kernel, writing raw logits into `probs`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn compute_attention_probs(
    device: &GpuDevice,
    cache: &mut KernelCache,
    q: &GpuTensor,
    key: &GpuTensor,
    past_key: Option<&GpuTensor>,
    attention_bias: Option<&GpuTensor>,
    present_key: Option<&GpuTensor>,
    probs: &GpuTensor,
    params: &AttentionParameters,
    plan: &OutputPlan,
    ragged: Option<&RaggedLengths>,
) {
    assert!(
        !plan.feed_past_key || past_key.is_some(),
        "feed_past_key requires a past_key tensor"
    );
    assert_eq!(
        plan.has_present_key,
        present_key.is_some(),
        "present_key tensor must match the output plan"
    );

    let components = components_for(params.head_size);
    let cfg = ProbsConfig {
        components,
        feed_past_key: plan.feed_past_key,
        has_present_key: plan.has_present_key,
        has_attention_bias: attention_bias.is_some(),
        ragged: ragged.is_some(),
    };
    let wgsl = probs_wgsl(&cfg);

    let uniform = ProbsParams {
        m: params.sequence_length as u32,
        n: plan.total_sequence_length as u32,
        k: (params.head_size / components as usize) as u32,
        num_heads: params.num_heads as u32,
        kv_num_heads: params.kv_num_heads as u32,
        n_reps: params.n_reps() as u32,
        kv_sequence_length: params.kv_sequence_length as u32,
        past_sequence_length: plan.past_sequence_length as u32,
        alpha: params.alpha(),
        _pad0: 0,
        _pad1: 0,
        _pad2: 0,
    };

    let mut bindings = vec![
        BindingSpec::Storage { read_only: true },
        BindingSpec::Storage { read_only: true },
    ];
    if cfg.feed_past_key {
        bindings.push(BindingSpec::Storage { read_only: true });
    }
    if cfg.has_attention_bias {
        bindings.push(BindingSpec::Storage { read_only: true });
    }
    if cfg.ragged {
        bindings.push(BindingSpec::Storage { read_only: true });
    }
    if cfg.has_present_key {
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
            label: Some("probs params"),
            contents: bytemuck::bytes_of(&uniform),
            usage: wgpu::BufferUsages::UNIFORM,
        });

    let mut buffers: Vec<&wgpu::Buffer> = vec![&q.buffer.buffer, &key.buffer.buffer];
    if let Some(pk) = past_key.filter(|_| cfg.feed_past_key) {
        buffers.push(&pk.buffer.buffer);
    }
    if let Some(bias) = attention_bias {
        buffers.push(&bias.buffer.buffer);
    }
    if let Some(r) = ragged {
        buffers.push(&r.lengths.buffer.buffer);
    }
    if let Some(pk) = present_key {
        buffers.push(&pk.buffer.buffer);
    }
    buffers.push(&probs.buffer.buffer);

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
        label: Some("probs bind group"),
        layout: &cached.bind_group_layout,
        entries: &entries,
    });

    let mut encoder = device
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("probs dispatch"),
        });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("probs compute"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&cached.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(
            (plan.total_sequence_length as u32).div_ceil(TILE_SIZE),
            (params.sequence_length as u32).div_ceil(TILE_SIZE),
            (params.batch_size * params.num_heads) as u32,
        );
    }
    cache.submit_or_enqueue(device, encoder.finish());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cfg() -> ProbsConfig {
        ProbsConfig {
            components: 1,
            feed_past_key: false,
            has_present_key: false,
            has_attention_bias: false,
            ragged: false,
        }
    }

    #[test]
    fn wgsl_cache_fragments_are_conditional() {
        let plain = probs_wgsl(&base_cfg());
        assert!(!plain.contains("past_key"));
        assert!(!plain.contains("present_key"));
        assert!(!plain.contains("attention_bias"));
        assert!(!plain.contains("seqlens"));

        let cached = probs_wgsl(&ProbsConfig {
            feed_past_key: true,
            has_present_key: true,
            ..base_cfg()
        });
        assert!(cached.contains("var<storage, read> past_key"));
        assert!(cached.contains("var<storage, read_write> present_key"));
        assert!(cached.contains("row - past_len"));
    }

    #[test]
    fn wgsl_vector_width_selection() {
        assert_eq!(components_for(8), 4);
        assert_eq!(components_for(6), 2);
        assert_eq!(components_for(5), 1);

        let vec4 = probs_wgsl(&ProbsConfig {
            components: 4,
            ..base_cfg()
        });
        assert!(vec4.contains("array<vec4<f32>"));
        assert!(vec4.contains("value.x + value.y + value.z + value.w"));

        let scalar = probs_wgsl(&base_cfg());
        assert!(!scalar.contains("vec4"));
    }

    #[test]
    fn wgsl_ragged_reads_per_batch_length() {
        let ragged = probs_wgsl(&ProbsConfig {
            ragged: true,
            ..base_cfg()
        });
        assert!(ragged.contains("var<storage, read> seqlens: array<u32>"));
        assert!(ragged.contains("seqlens[batch_idx]"));
    }

    #[test]
    fn wgsl_bias_added_after_scaling() {
        let biased = probs_wgsl(&ProbsConfig {
            has_attention_bias: true,
            ..base_cfg()
        });
        let scale_pos = biased.find("params.alpha").expect("scale missing");
        let bias_pos = biased
            .find("sum + attention_bias")
            .expect("bias add missing");
        assert!(scale_pos < bias_pos, "bias must be added after scaling");
    }
}
