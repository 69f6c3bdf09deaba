//! In-place row softmax over the score slab, with ragged-length masking.

use crate::device::GpuDevice;
use crate::kernel::{hash_wgsl, BindingSpec, KernelCache};
use crate::params::{AttentionParameters, OutputPlan, RaggedLengths};
use crate::probs::{components_for, value_type};
use crate::tensor::GpuTensor;

pub(crate) struct SoftmaxConfig {
    pub components: u32,
    pub ragged: bool,
    pub workgroup_size: u32,
}

/// WGSL for the in-place softmax.
///
/// One workgroup normalizes one row of the [seq, total_seq] slab for one
/// (batch, head) pair. Each thread owns a contiguous chunk of
/// `elements_per_thread` values; per-thread max and exp-sum partials are
/// staged in workgroup memory and combined by a linear scan over all lanes.
///
/// With ragged lengths the valid prefix of a row is `seqlens[batch] + row + 1`
/// and everything past it is zeroed, so stale values in the slab cannot leak
/// into the value aggregation.
pub(crate) fn softmax_wgsl(cfg: &SoftmaxConfig) -> String {
    let value_t = value_type(cfg.components);
    let components = cfg.components;
    let wg = cfg.workgroup_size;

    let mut s = String::from(
        r#"// Row softmax in place over attention scores

struct Params {
    num_heads: u32,
    sequence_length: u32,
    total_sequence_length_comp: u32,
    elements_per_thread: u32,
}

"#,
    );

    let mut binding = 0u32;
    let mut bind = |s: &mut String, decl: &str| {
        s.push_str(&format!("@group(0) @binding({binding}) {decl};\n"));
        binding += 1;
    };
    bind(
        &mut s,
        &format!("var<storage, read_write> x: array<{value_t}>"),
    );
    if cfg.ragged {
        bind(&mut s, "var<storage, read> seqlens: array<u32>");
    }
    bind(&mut s, "var<uniform> params: Params");

    s.push_str(&format!(
        r#"
var<workgroup> thread_max: array<f32, {wg}>;
var<workgroup> thread_sum: array<f32, {wg}>;

@compute @workgroup_size({wg}, 1, 1)
fn main(
    @builtin(workgroup_id) wg_id: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
) {{
    let batch_head = wg_id.z;
    let row = wg_id.y;
    let tid = lid.x;
    let row_offset = (batch_head * params.sequence_length + row)
        * params.total_sequence_length_comp;
    let local_offset = tid * params.elements_per_thread;
"#
    ));
    if cfg.ragged {
        s.push_str("    let batch_idx = batch_head / params.num_heads;\n");
        s.push_str("    let seq_causal = seqlens[batch_idx] + row + 1u;\n");
    } else {
        s.push_str("    let seq_causal = params.total_sequence_length_comp;\n");
    }

    let loop_header = "for (var i: u32 = 0u; i < params.elements_per_thread \
&& local_offset + i < seq_causal; i = i + 1u)";
    let lane_max = match cfg.components {
        4 => "max(max(max_vec.x, max_vec.y), max(max_vec.z, max_vec.w))",
        2 => "max(max_vec.x, max_vec.y)",
        _ => "max_vec",
    };
    let lane_sum = match cfg.components {
        4 => "sum_vec.x + sum_vec.y + sum_vec.z + sum_vec.w",
        2 => "sum_vec.x + sum_vec.y",
        _ => "sum_vec",
    };

    s.push_str(&format!(
        r#"
    var max_vec = {value_t}(-3.402823e+38);
    {loop_header} {{
        max_vec = max(max_vec, x[row_offset + local_offset + i]);
    }}
    thread_max[tid] = {lane_max};
    workgroupBarrier();

    var row_max = -3.402823e+38;
    for (var i: u32 = 0u; i < {wg}u; i = i + 1u) {{
        row_max = max(row_max, thread_max[i]);
    }}

    var sum_vec = {value_t}(0.0);
    {loop_header} {{
        sum_vec = sum_vec + exp(x[row_offset + local_offset + i] - {value_t}(row_max));
    }}
    thread_sum[tid] = {lane_sum};
    workgroupBarrier();

    var row_sum = 0.0;
    for (var i: u32 = 0u; i < {wg}u; i = i + 1u) {{
        row_sum = row_sum + thread_sum[i];
    }}

    if (row_sum == 0.0) {{
        {loop_header} {{
            x[row_offset + local_offset + i] = {value_t}(1.0 / f32(seq_causal * {components}u));
        }}
    }} else {{
        {loop_header} {{
            x[row_offset + local_offset + i] =
                exp(x[row_offset + local_offset + i] - {value_t}(row_max)) / row_sum;
        }}
    }}
"#
    ));
    if cfg.ragged {
        s.push_str(&format!(
            r#"
    for (var j: u32 = seq_causal + tid; j < params.total_sequence_length_comp; j = j + {wg}u) {{
        x[row_offset + j] = {value_t}(0.0);
    }}
"#
        ));
    }
    s.push_str("}\n");
    s
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct SoftmaxParams {
    num_heads: u32,
    sequence_length: u32,
    total_sequence_length_comp: u32,
    elements_per_thread: u32,
}

/// Dispatch the softmax kernel over the score slab, in place.
pub(crate) fn compute_inplace_softmax(
    device: &GpuDevice,
    cache: &mut KernelCache,
    probs: &GpuTensor,
    params: &AttentionParameters,
    plan: &OutputPlan,
    ragged: Option<&RaggedLengths>,
) {
    // Per-batch valid lengths are not vector-aligned, so ragged rows are
    // processed scalar.
    let components = if ragged.is_some() {
        1
    } else {
        components_for(plan.total_sequence_length)
    };
    let total_comp = (plan.total_sequence_length / components as usize) as u32;
    let workgroup_size = if total_comp < 64 { 32 } else { 64 };

    let cfg = SoftmaxConfig {
        components,
        ragged: ragged.is_some(),
        workgroup_size,
    };
    let wgsl = softmax_wgsl(&cfg);

    let uniform = SoftmaxParams {
        num_heads: params.num_heads as u32,
        sequence_length: params.sequence_length as u32,
        total_sequence_length_comp: total_comp,
        elements_per_thread: total_comp.div_ceil(workgroup_size),
    };

    let mut bindings = vec![BindingSpec::Storage { read_only: false }];
    if cfg.ragged {
        bindings.push(BindingSpec::Storage { read_only: true });
    }
    bindings.push(BindingSpec::Uniform);

    let hash = hash_wgsl(&wgsl);
    let cached = cache.get_or_compile_dynamic(device, &wgsl, hash, &bindings);

    use wgpu::util::DeviceExt;
    let params_buf = device
        .device
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("softmax params"),
            contents: bytemuck::bytes_of(&uniform),
            usage: wgpu::BufferUsages::UNIFORM,
        });

    let mut buffers: Vec<&wgpu::Buffer> = vec![&probs.buffer.buffer];
    if let Some(r) = ragged {
        buffers.push(&r.lengths.buffer.buffer);
    }

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
        label: Some("softmax bind group"),
        layout: &cached.bind_group_layout,
        entries: &entries,
    });

    let mut encoder = device
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("softmax dispatch"),
        });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("softmax compute"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&cached.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(
            1,
            params.sequence_length as u32,
            (params.batch_size * params.num_heads) as u32,
        );
    }
    cache.submit_or_enqueue(device, encoder.finish());
}
