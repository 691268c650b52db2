//! wgpu compute device.

use std::borrow::Cow;
use std::collections::HashMap;

use futures::channel::oneshot;
use tracing::{debug, info, warn};
use wgpu::util::DeviceExt;

use crate::device::{BufferHandle, ComputeDevice, DeviceProperties, KernelCall};
use crate::gpu_tree::{self, Access, PassGroups};
use crate::kernels::{KernelId, StageArgs};
use crate::{Result, SimError};

/// Subgroup width assumed when the vendor does not tell us better.
const DEFAULT_WARP_SIZE: u32 = 32;
const AMD_VENDOR_ID: u32 = 0x1002;

/// GPU context holding device and queue.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub info: wgpu::AdapterInfo,
    pub limits: wgpu::Limits,
}

impl GpuContext {
    /// Create a new GPU context with the adapter's full limits.
    pub async fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| SimError::GpuInit("No suitable GPU adapter found".into()))?;

        let info = adapter.get_info();
        let limits = adapter.limits();
        info!(adapter = %info.name, backend = ?info.backend, "using GPU adapter");

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("forcegraph device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| SimError::GpuInit(e.to_string()))?;

        Ok(Self {
            device,
            queue,
            info,
            limits,
        })
    }
}

struct DeviceBuffer {
    buffer: wgpu::Buffer,
    byte_len: u64,
}

struct CompiledKernel {
    layout: wgpu::BindGroupLayout,
    passes: Vec<(wgpu::ComputePipeline, PassGroups)>,
}

/// Compute device running the WGSL kernels through wgpu.
pub struct WgpuDevice {
    ctx: GpuContext,
    properties: DeviceProperties,
    buffers: HashMap<BufferHandle, DeviceBuffer>,
    kernels: HashMap<KernelId, CompiledKernel>,
    next_id: u64,
}

impl WgpuDevice {
    pub fn new(ctx: GpuContext) -> Self {
        let warp_size = if ctx.info.vendor == AMD_VENDOR_ID {
            64
        } else {
            DEFAULT_WARP_SIZE
        };
        let max_buffer_size = ctx
            .limits
            .max_buffer_size
            .min(u64::from(ctx.limits.max_storage_buffer_binding_size));
        let properties = DeviceProperties {
            name: ctx.info.name.clone(),
            warp_size,
            max_buffer_size,
        };
        Self {
            ctx,
            properties,
            buffers: HashMap::new(),
            kernels: HashMap::new(),
            next_id: 1,
        }
    }

    /// Open the default adapter.
    pub async fn request() -> Result<Self> {
        Ok(Self::new(GpuContext::new().await?))
    }

    pub fn context(&self) -> &GpuContext {
        &self.ctx
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&DeviceBuffer> {
        self.buffers.get(&handle).ok_or(SimError::UnknownHandle(handle))
    }

    /// Resolves once everything submitted so far has executed.
    async fn idle(&self) -> std::result::Result<(), oneshot::Canceled> {
        let (sender, receiver) = oneshot::channel();
        self.ctx.queue.on_submitted_work_done(move || {
            let _ = sender.send(());
        });
        let _ = self.ctx.device.poll(wgpu::Maintain::Wait);
        receiver.await
    }

    async fn compile(&mut self, kernel: KernelId) -> Result<()> {
        if self.kernels.contains_key(&kernel) {
            return Ok(());
        }
        let program = gpu_tree::program(kernel);
        let limit = self.ctx.limits.max_storage_buffers_per_shader_stage as usize;
        if program.storage.len() > limit {
            return Err(SimError::kernel(
                kernel,
                format!(
                    "needs {} storage buffers, device allows {limit}",
                    program.storage.len()
                ),
            ));
        }

        let device = &self.ctx.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(kernel.as_str()),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(program.source)),
        });

        let mut entries: Vec<_> = program
            .storage
            .iter()
            .enumerate()
            .map(|(binding, access)| wgpu::BindGroupLayoutEntry {
                binding: binding as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage {
                        read_only: *access == Access::Read,
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: program.storage.len() as u32,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(kernel.as_str()),
            entries: &entries,
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(kernel.as_str()),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let passes = program
            .passes
            .iter()
            .map(|pass| {
                let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(pass.entry),
                    layout: Some(&pipeline_layout),
                    module: &module,
                    entry_point: Some(pass.entry),
                    compilation_options: Default::default(),
                    cache: None,
                });
                (pipeline, pass.groups)
            })
            .collect();

        if let Some(error) = device.pop_error_scope().await {
            return Err(SimError::kernel(kernel, error.to_string()));
        }
        debug!(%kernel, "kernel compiled");
        self.kernels.insert(kernel, CompiledKernel { layout, passes });
        Ok(())
    }

    /// A build that could not place every body leaves `blocked` short.
    async fn check_build(&mut self, call: &KernelCall) -> Result<()> {
        let StageArgs::BuildTree(args) = &call.args else {
            return Ok(());
        };
        let bytes = self.read_buffer(args.blocked).await?;
        let inserted = bytes
            .get(..4)
            .map(bytemuck::pod_read_unaligned::<i32>)
            .unwrap_or(-1);
        if inserted != args.num_bodies as i32 {
            return Err(SimError::kernel(
                KernelId::BuildTree,
                format!("inserted {inserted} of {} bodies", args.num_bodies),
            ));
        }
        Ok(())
    }
}

impl ComputeDevice for WgpuDevice {
    fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    fn create_buffer(&mut self, label: &str, byte_len: u64) -> Result<BufferHandle> {
        let size = byte_len.max(4).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        if size > self.properties.max_buffer_size {
            return Err(SimError::Allocation {
                label: label.to_string(),
                bytes: byte_len,
                message: "exceeds the maximum buffer size".to_string(),
            });
        }

        let device = &self.ctx.device;
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            buffer.destroy();
            return Err(SimError::Allocation {
                label: label.to_string(),
                bytes: byte_len,
                message: error.to_string(),
            });
        }

        let handle = BufferHandle::new(self.next_id);
        self.next_id += 1;
        self.buffers.insert(handle, DeviceBuffer { buffer, byte_len });
        Ok(handle)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let target = self.buffer(buffer)?;
        let end = offset + data.len() as u64;
        if end > target.byte_len || offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(SimError::invalid(format!(
                "write of {} bytes at {offset} does not fit a {} byte buffer",
                data.len(),
                target.byte_len
            )));
        }
        if data.is_empty() {
            return Ok(());
        }
        if data.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT == 0 {
            self.ctx.queue.write_buffer(&target.buffer, offset, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(data.len().next_multiple_of(4), 0);
            self.ctx.queue.write_buffer(&target.buffer, offset, &padded);
        }
        Ok(())
    }

    async fn read_buffer(&mut self, buffer: BufferHandle) -> Result<Vec<u8>> {
        let source = self.buffer(buffer)?;
        let size = source.buffer.size();
        let byte_len = source.byte_len as usize;

        let staging = self.ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback encoder"),
            });
        encoder.copy_buffer_to_buffer(&source.buffer, 0, &staging, 0, size);
        self.ctx.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        let _ = self.ctx.device.poll(wgpu::Maintain::Wait);

        receiver
            .await
            .map_err(|_| SimError::Readback("map callback dropped".into()))?
            .map_err(|e| SimError::Readback(e.to_string()))?;

        let bytes = {
            let data = slice.get_mapped_range();
            data[..byte_len].to_vec()
        };
        staging.unmap();
        staging.destroy();
        Ok(bytes)
    }

    fn release_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        let released = self
            .buffers
            .remove(&buffer)
            .ok_or(SimError::UnknownHandle(buffer))?;
        released.buffer.destroy();
        Ok(())
    }

    async fn dispatch(&mut self, call: KernelCall) -> Result<()> {
        let kernel = call.kernel();
        let invocation = gpu_tree::invocation(&call.args, &call.geometry);
        if let Some(stale) = invocation
            .storage
            .iter()
            .chain(&call.dependencies)
            .find(|handle| !self.buffers.contains_key(handle))
        {
            return Err(SimError::kernel(
                kernel,
                format!("buffer handle {} is no longer live", stale.id()),
            ));
        }

        self.compile(kernel).await?;
        let compiled = self
            .kernels
            .get(&kernel)
            .ok_or_else(|| SimError::kernel(kernel, "kernel was not compiled"))?;

        let device = &self.ctx.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let params = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("kernel params"),
            contents: &invocation.uniform,
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let mut entries = Vec::with_capacity(invocation.storage.len() + 1);
        for (binding, handle) in invocation.storage.iter().enumerate() {
            let buffer = &self.buffer(*handle)?.buffer;
            entries.push(wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: buffer.as_entire_binding(),
            });
        }
        entries.push(wgpu::BindGroupEntry {
            binding: invocation.storage.len() as u32,
            resource: params.as_entire_binding(),
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel.as_str()),
            layout: &compiled.layout,
            entries: &entries,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(kernel.as_str()),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.as_str()),
                timestamp_writes: None,
            });
            pass.set_bind_group(0, &bind_group, &[]);
            for (pipeline, groups) in &compiled.passes {
                pass.set_pipeline(pipeline);
                let count = match groups {
                    PassGroups::Geometry => invocation.groups,
                    PassGroups::Single => 1,
                };
                pass.dispatch_workgroups(count, 1, 1);
            }
        }
        self.ctx.queue.submit(Some(encoder.finish()));

        if let Some(error) = device.pop_error_scope().await {
            warn!(%kernel, %error, "dispatch rejected");
            return Err(SimError::kernel(kernel, error.to_string()));
        }
        self.idle()
            .await
            .map_err(|_| SimError::kernel(kernel, "device lost before completion"))?;
        debug!(%kernel, groups = invocation.groups, "gpu dispatch");

        self.check_build(&call).await
    }

    async fn finish(&mut self) -> Result<()> {
        self.idle()
            .await
            .map_err(|_| SimError::Readback("device lost before the queue drained".into()))
    }

    fn live_buffers(&self) -> Vec<BufferHandle> {
        let mut handles: Vec<_> = self.buffers.keys().copied().collect();
        handles.sort();
        handles
    }
}
