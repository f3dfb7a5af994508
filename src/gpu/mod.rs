//! GPU execution backend (wgpu / WebGPU)
//!
//! Runs the WGSL kernels emitted by the code generator: one storage buffer
//! per input column, the hoisted literal buffer when the kernel asks for
//! it, an atomic output buffer seeded with the aggregate's identity, and a
//! staging-buffer readback. Shader modules cache by kernel fingerprint so
//! repeated shapes skip recompilation.
//!
//! Initialization degrades gracefully: no adapter means the dispatcher
//! keeps every kernel on CPU.
//!
//! References:
//! - Harris (2007): optimizing parallel reduction in CUDA
//! - Leis et al. (2014): morsel-driven parallelism

use crate::codegen::wgsl::WgslKernel;
use crate::error::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;
use wgpu::util::DeviceExt;

/// Information about one GPU adapter
#[derive(Debug, Clone)]
pub struct GpuDeviceInfo {
    /// Device name
    pub name: String,
    /// Discrete / integrated / virtual / CPU fallback
    pub device_type: wgpu::DeviceType,
    /// Driver backend
    pub backend: wgpu::Backend,
}

/// Enumerate all visible adapters. Empty on machines without GPUs.
#[must_use]
pub fn enumerate_devices() -> Vec<GpuDeviceInfo> {
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    instance
        .enumerate_adapters(wgpu::Backends::all())
        .iter()
        .map(|adapter| {
            let info = adapter.get_info();
            GpuDeviceInfo {
                name: info.name,
                device_type: info.device_type,
                backend: info.backend,
            }
        })
        .collect()
}

/// Compiled-shader cache keyed by kernel fingerprint.
struct ShaderCache {
    cache: DashMap<String, Arc<wgpu::ShaderModule>>,
}

impl ShaderCache {
    fn new() -> Self {
        Self {
            cache: DashMap::new(),
        }
    }

    fn get_or_insert(
        &self,
        key: &str,
        device: &wgpu::Device,
        source: &str,
    ) -> Arc<wgpu::ShaderModule> {
        let entry = self.cache.entry(key.to_string()).or_insert_with(|| {
            Arc::new(device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(key),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            }))
        });
        Arc::clone(&*entry)
    }

    fn len(&self) -> usize {
        self.cache.len()
    }
}

/// GPU compute engine over one device.
pub struct GpuEngine {
    device: wgpu::Device,
    queue: wgpu::Queue,
    shaders: ShaderCache,
    device_count: usize,
}

impl GpuEngine {
    /// Initialize against the highest-performance adapter.
    ///
    /// # Errors
    /// [`Error::GpuInitFailed`] without an adapter or device; callers fall
    /// back to CPU dispatch.
    pub async fn new() -> Result<Self> {
        let device_count = enumerate_devices().len();
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
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
            .ok_or_else(|| Error::GpuInitFailed("no GPU adapter found".to_string()))?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("rayo-db GPU device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(|e| Error::GpuInitFailed(format!("failed to create device: {e}")))?;

        Ok(Self {
            device,
            queue,
            shaders: ShaderCache::new(),
            device_count: device_count.max(1),
        })
    }

    /// Visible adapter count (round-robin targets for the dispatcher).
    #[must_use]
    pub const fn device_count(&self) -> usize {
        self.device_count
    }

    /// Cached shader count.
    #[must_use]
    pub fn shader_cache_len(&self) -> usize {
        self.shaders.len()
    }

    /// Run a generated aggregate kernel over one column's raw bytes (i32
    /// little-endian) and read back the reduced slot.
    ///
    /// # Errors
    /// [`Error::GpuExecution`] on buffer-map failures.
    #[allow(clippy::too_many_lines)]
    pub async fn run_aggregate(
        &self,
        kernel: &WgslKernel,
        input: &[u8],
        filter_col: Option<&[u8]>,
    ) -> Result<i64> {
        if input.is_empty() {
            return Ok(i64::from(kernel.agg.identity()));
        }

        let fingerprint = format!(
            "{:?}_{}_{}",
            kernel.agg,
            kernel.entry_point,
            crate::runtime::groupby::murmur_hash3_32(kernel.source.as_bytes(), 0)
        );
        let shader = self
            .shaders
            .get_or_insert(&fingerprint, &self.device, &kernel.source);

        let input_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("kernel input"),
                contents: input,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            });

        let output_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("kernel output"),
                contents: bytemuck::cast_slice(&[kernel.agg.identity()]),
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
            });

        let literal_buffer = kernel.needs_literals.then(|| {
            self.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("literal buffer"),
                    contents: bytemuck::cast_slice(&kernel.literals),
                    usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                })
        });
        let filter_buffer = filter_col.map(|bytes| {
            self.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("filter column"),
                    contents: bytes,
                    usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                })
        });

        let storage_entry = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let mut layout_entries = vec![storage_entry(0, true), storage_entry(1, false)];
        let mut bind_entries = vec![
            wgpu::BindGroupEntry {
                binding: 0,
                resource: input_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: output_buffer.as_entire_binding(),
            },
        ];
        if let Some(lits) = &literal_buffer {
            layout_entries.push(storage_entry(2, true));
            bind_entries.push(wgpu::BindGroupEntry {
                binding: 2,
                resource: lits.as_entire_binding(),
            });
        }
        if let Some(f) = &filter_buffer {
            layout_entries.push(storage_entry(3, true));
            bind_entries.push(wgpu::BindGroupEntry {
                binding: 3,
                resource: f.as_entire_binding(),
            });
        }

        let bind_group_layout =
            self.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("kernel bind group layout"),
                    entries: &layout_entries,
                });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kernel bind group"),
            layout: &bind_group_layout,
            entries: &bind_entries,
        });

        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("kernel pipeline layout"),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("kernel pipeline"),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: &kernel.entry_point,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("kernel encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("kernel pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            #[allow(clippy::cast_possible_truncation)]
            let workgroup_count = ((input.len() / 4) as u32).div_ceil(256);
            pass.dispatch_workgroups(workgroup_count, 1, 1);
        }

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("kernel staging"),
            size: 4,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        encoder.copy_buffer_to_buffer(&output_buffer, 0, &staging, 0, 4);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = futures_intrusive::channel::shared::oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            tx.send(result).ok();
        });
        self.device.poll(wgpu::Maintain::Wait);

        rx.receive()
            .await
            .ok_or_else(|| Error::GpuExecution("buffer map channel closed".to_string()))?
            .map_err(|e| Error::GpuExecution(format!("buffer mapping failed: {e}")))?;

        let view = slice.get_mapped_range();
        let result = i32::from_le_bytes([view[0], view[1], view[2], view[3]]);
        drop(view);
        staging.unmap();

        Ok(i64::from(result))
    }
}
