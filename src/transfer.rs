//! Layout transform: [batch, seq, heads*head_size] to [batch, heads, seq, head_size].

use crate::device::GpuDevice;
use crate::error::AttentionError;
use crate::kernel::{hash_wgsl, BindingSpec, KernelCache};
use crate::tensor::GpuTensor;

const WORKGROUP_SIZE: u32 = 64;

pub(crate) struct TransferConfig {
    pub has_bias: bool,
}

/// WGSL for the BSD to BNSH relayout, one thread per output element.
pub(crate) fn transfer_wgsl(cfg: &TransferConfig) -> String {
    let mut s = String::from(
        r#"// Relayout [batch, seq, heads*head_size] to [batch, heads, seq, head_size]

struct Params {
    data_size: u32,
    batch_offset: u32,
    sequence_offset: u32,
    head_offset: u32,
    bias_offset: u32,
    num_heads: u32,
    sequence_length: u32,
    _pad: u32,
}

"#,
    );

    let mut binding = 0u32;
    s.push_str(&format!(
        "@group(0) @binding({binding}) var<storage, read> input: array<f32>;\n"
    ));
    binding += 1;
    if cfg.has_bias {
        s.push_str(&format!(
            "@group(0) @binding({binding}) var<storage, read> bias: array<f32>;\n"
        ));
        binding += 1;
    }
    s.push_str(&format!(
        "@group(0) @binding({binding}) var<storage, read_write> output: array<f32>;\n"
    ));
    binding += 1;
    s.push_str(&format!(
        "@group(0) @binding({binding}) var<uniform> params: Params;\n"
    ));

    s.push_str(&format!(
        r#"
@compute @workgroup_size({WORKGROUP_SIZE})
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    let idx = gid.x;
    if (idx >= params.data_size) {{ return; }}

    let d = idx % params.head_offset;
    let s = (idx / params.head_offset) % params.sequence_length;
    let h = (idx / (params.head_offset * params.sequence_length)) % params.num_heads;
    let b = idx / params.batch_offset;
    let input_offset = b * params.batch_offset + s * params.sequence_offset
        + h * params.head_offset + d;
"#
    ));
    if cfg.has_bias {
        s.push_str(
            "    let bias_idx = input_offset % params.sequence_offset + params.bias_offset;\n",
        );
        s.push_str("    output[idx] = input[input_offset] + bias[bias_idx];\n");
    } else {
        s.push_str("    output[idx] = input[input_offset];\n");
    }
    s.push_str("}\n");
    s
}

/// Rearrange a `[batch, seq, num_heads*head_size]` tensor into
/// `[batch, num_heads, seq, head_size]`, optionally adding a bias.
///
/// `bias` is the packed QKV bias of shape `[3*hidden]`; `bias_offset`
/// selects the Q (0), K (hidden), or V (2*hidden) segment. The bias index
/// wraps through the flattened per-row offset, so every sequence position
/// receives the same per-channel bias.
pub fn transfer_bsd_to_bnsh(
    device: &GpuDevice,
    cache: &mut KernelCache,
    input: &GpuTensor,
    bias: Option<&GpuTensor>,
    bias_offset: usize,
    num_heads: usize,
    sequence_length: usize,
    head_size: usize,
) -> Result<GpuTensor, AttentionError> {
    if input.ndim() != 3 {
        return Err(AttentionError::ShapeMismatch {
            what: "transfer input",
            details: format!("expected rank 3, got shape {:?}", input.shape()),
        });
    }
    let hidden = num_heads * head_size;
    if input.shape()[1] != sequence_length || input.shape()[2] != hidden {
        return Err(AttentionError::ShapeMismatch {
            what: "transfer input",
            details: format!(
                "expected [batch, {sequence_length}, {hidden}], got {:?}",
                input.shape()
            ),
        });
    }
    if let Some(b) = bias {
        if b.numel() < bias_offset + hidden {
            return Err(AttentionError::ShapeMismatch {
                what: "transfer bias",
                details: format!(
                    "bias of {} elements too small for offset {bias_offset} + hidden {hidden}",
                    b.numel()
                ),
            });
        }
    }

    let batch_size = input.shape()[0];
    let out = GpuTensor::uninit(device, &[batch_size, num_heads, sequence_length, head_size]);
    let data_size = out.numel() as u32;

    let cfg = TransferConfig {
        has_bias: bias.is_some(),
    };
    let wgsl = transfer_wgsl(&cfg);

    #[repr(C)]
    #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
    struct TransferParams {
        data_size: u32,
        batch_offset: u32,
        sequence_offset: u32,
        head_offset: u32,
        bias_offset: u32,
        num_heads: u32,
        sequence_length: u32,
        _pad: u32,
    }
    let uniform = TransferParams {
        data_size,
        batch_offset: (sequence_length * hidden) as u32,
        sequence_offset: hidden as u32,
        head_offset: head_size as u32,
        bias_offset: bias_offset as u32,
        num_heads: num_heads as u32,
        sequence_length: sequence_length as u32,
        _pad: 0,
    };

    let mut bindings = vec![BindingSpec::Storage { read_only: true }];
    if bias.is_some() {
        bindings.push(BindingSpec::Storage { read_only: true });
    }
    bindings.push(BindingSpec::Storage { read_only: false });
    bindings.push(BindingSpec::Uniform);

    let hash = hash_wgsl(&wgsl);
    let cached = cache.get_or_compile_dynamic(device, &wgsl, hash, &bindings);

    use wgpu::util::DeviceExt;
    let params_buf = device
        .device
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("transfer params"),
            contents: bytemuck::bytes_of(&uniform),
            usage: wgpu::BufferUsages::UNIFORM,
        });

    let mut entries = Vec::new();
    let mut binding = 0u32;
    entries.push(wgpu::BindGroupEntry {
        binding,
        resource: input.buffer.buffer.as_entire_binding(),
    });
    binding += 1;
    if let Some(b) = bias {
        entries.push(wgpu::BindGroupEntry {
            binding,
            resource: b.buffer.buffer.as_entire_binding(),
        });
        binding += 1;
    }
    entries.push(wgpu::BindGroupEntry {
        binding,
        resource: out.buffer.buffer.as_entire_binding(),
    });
    binding += 1;
    entries.push(wgpu::BindGroupEntry {
        binding,
        resource: params_buf.as_entire_binding(),
    });

    let bind_group = device.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("transfer bind group"),
        layout: &cached.bind_group_layout,
        entries: &entries,
    });

    let mut encoder = device
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("transfer dispatch"),
        });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("transfer compute"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&cached.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(data_size.div_ceil(WORKGROUP_SIZE), 1, 1);
    }
    cache.submit_or_enqueue(device, encoder.finish());

    Ok(out)
}
