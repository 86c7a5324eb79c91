use std::sync::Arc;

use bitonic_merge_sorting::WorkSize;
use log::{debug, info, trace, warn};
use wgpu_profiler::{GpuProfiler, GpuProfilerSettings, GpuTimerQueryResult};

use super::{ComputeBackend, Dispatch, HostTransfer, Kernel, KernelParams};
use crate::{
    error::{Result, SortError},
    wgpu_utils::{
        binding_builder::{BindGroupBuilder, BindGroupLayoutBuilder, BindGroupLayoutWithDesc},
        buffers::{create_storage_buffer_init, read_buffer, STORAGE_USAGE},
        uniform_buffer::DynamicUniformBuffer,
    },
};

const ELEMENT_SIZE: u64 = std::mem::size_of::<i32>() as u64;

#[derive(Clone, Debug)]
pub struct WgpuBackendConfig {
    pub power_preference: wgpu::PowerPreference,
    pub force_fallback_adapter: bool,
    /// Wrap every stage in a GPU timer scope and log the timings after each submit.
    pub enable_profiling: bool,
}

impl Default for WgpuBackendConfig {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            enable_profiling: false,
        }
    }
}

struct KernelPipeline {
    storage_layout: BindGroupLayoutWithDesc,
    pipeline: wgpu::ComputePipeline,
}

struct PendingDispatch {
    kernel: Kernel,
    bind_group: wgpu::BindGroup,
    params_index: usize,
    work_size: WorkSize,
}

/// Sorter kernels running as wgpu compute pipelines.
///
/// Dispatches are recorded and only encoded on `submit`, into a single command buffer.
/// Their parameters are packed in one uniform buffer read through dynamic offsets so that
/// every dispatch sees its own `dimension` and `block`.
pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    params_layout: BindGroupLayoutWithDesc,
    kernels: Vec<KernelPipeline>,
    pending: Vec<PendingDispatch>,
    params: Vec<KernelParams>,
    profiler: Option<GpuProfiler>,
}

fn create_kernel_pipelines(
    device: &wgpu::Device,
    shader: &wgpu::ShaderModule,
    params_layout: &BindGroupLayoutWithDesc,
) -> Vec<KernelPipeline> {
    Kernel::ALL
        .iter()
        .map(|kernel| {
            let storage_layout = kernel
                .slots()
                .iter()
                .fold(BindGroupLayoutBuilder::new(), |builder, slot| builder.add_storage_buffer(slot.binding(), slot.read_only()))
                .create(device, Some(kernel.entry_point()));

            let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(&format!("{} Pipeline Layout", kernel.stage())),
                bind_group_layouts: &[&params_layout.layout, &storage_layout.layout],
                push_constant_ranges: &[],
            });

            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(&format!("{} Pipeline", kernel.entry_point())),
                layout: Some(&layout),
                module: shader,
                entry_point: kernel.entry_point(),
            });

            KernelPipeline { storage_layout, pipeline }
        })
        .collect()
}

fn log_timings(results: &[GpuTimerQueryResult], depth: usize) {
    for result in results {
        debug!(
            "{:indent$}{} - {:.3}ms",
            "",
            result.label,
            (result.time.end - result.time.start) * 1000.0,
            indent = depth * 2
        );
        log_timings(&result.nested_queries, depth + 1);
    }
}

impl WgpuBackend {
    /// Request an adapter and a device matching `config`.
    pub async fn request(config: WgpuBackendConfig) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: config.power_preference,
                compatible_surface: None,
                force_fallback_adapter: config.force_fallback_adapter,
            })
            .await
            .ok_or(SortError::NoAdapter)?;

        let adapter_info = adapter.get_info();
        info!("Using adapter {} ({:?})", adapter_info.name, adapter_info.backend);

        let required_features = if config.enable_profiling {
            adapter.features() & GpuProfiler::ALL_WGPU_TIMER_FEATURES
        } else {
            wgpu::Features::empty()
        };

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Buffer sorter device"),
                    required_features,
                    required_limits: adapter.limits(),
                },
                None,
            )
            .await?;

        Self::new(Arc::new(device), Arc::new(queue), &config)
    }

    /// Build the kernels on an existing device.
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>, config: &WgpuBackendConfig) -> Result<Self> {
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Sorter compute shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../../shaders/sorter.wgsl").into()),
        });

        let params_layout = DynamicUniformBuffer::<KernelParams>::create_layout(&device, wgpu::ShaderStages::COMPUTE, Some("Sorter parameters"));
        let kernels = create_kernel_pipelines(&device, &shader, &params_layout);

        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            return Err(SortError::Backend(format!("failed to build sorter kernels: {error}")));
        }

        let profiler = if config.enable_profiling {
            if !device.features().contains(wgpu::Features::TIMESTAMP_QUERY) {
                warn!("Timestamp queries are not supported, profiling scopes will not report timings");
            }
            let profiler = GpuProfiler::new(GpuProfilerSettings::default())
                .map_err(|e| SortError::Backend(format!("failed to create GPU profiler: {e:?}")))?;
            Some(profiler)
        } else {
            None
        };

        Ok(Self {
            device,
            queue,
            params_layout,
            kernels,
            pending: Vec::new(),
            params: Vec::new(),
            profiler,
        })
    }

    fn kernel(&self, kernel: Kernel) -> &KernelPipeline {
        &self.kernels[kernel.index()]
    }

    fn check_buffer_size(&self, label: &'static str, bytes: u64) -> Result<()> {
        let limits = self.device.limits();
        let max = (limits.max_storage_buffer_binding_size as u64).min(limits.max_buffer_size);
        if bytes > max {
            return Err(SortError::Allocation {
                label,
                bytes,
                reason: format!("device storage buffers are limited to {max} bytes"),
            });
        }
        Ok(())
    }

    fn allocation_result(&self, label: &'static str, bytes: u64, buffer: wgpu::Buffer) -> Result<wgpu::Buffer> {
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(error) => Err(SortError::Allocation { label, bytes, reason: error.to_string() }),
            None => Ok(buffer),
        }
    }

    fn encode_pending(&mut self, encoder: &mut wgpu::CommandEncoder, params: &DynamicUniformBuffer<KernelParams>) {
        let mut start = 0;
        while start < self.pending.len() {
            // one pass per stage, consecutive dispatches of the same kernel share it
            let kernel = self.pending[start].kernel;
            let end = self.pending[start..].iter().position(|d| d.kernel != kernel).map_or(self.pending.len(), |n| start + n);
            let stage = &self.pending[start..end];

            match self.profiler.as_mut() {
                Some(profiler) => {
                    let mut scope = profiler.scope(kernel.stage(), &mut *encoder, &self.device);
                    encode_stage(&mut scope, &self.kernels, params, stage);
                }
                None => encode_stage(&mut *encoder, &self.kernels, params, stage),
            }

            start = end;
        }
    }
}

fn encode_stage(
    encoder: &mut wgpu::CommandEncoder,
    kernels: &[KernelPipeline],
    params: &DynamicUniformBuffer<KernelParams>,
    dispatches: &[PendingDispatch],
) {
    let Some(first) = dispatches.first() else {
        return;
    };

    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
        label: Some(&format!("{} Pass", first.kernel.stage())),
        timestamp_writes: None,
    });
    pass.set_pipeline(&kernels[first.kernel.index()].pipeline);

    for dispatch in dispatches {
        pass.set_bind_group(0, params.bind_group(), &[params.offset(dispatch.params_index)]);
        pass.set_bind_group(1, &dispatch.bind_group, &[]);
        pass.dispatch_workgroups(dispatch.work_size.x, dispatch.work_size.y, dispatch.work_size.z);
    }
}

impl ComputeBackend for WgpuBackend {
    type Buffer = wgpu::Buffer;

    fn element_count(&self, buffer: &wgpu::Buffer) -> usize {
        (buffer.size() / ELEMENT_SIZE) as usize
    }

    fn create_buffer(&mut self, label: &'static str, len: usize) -> Result<wgpu::Buffer> {
        let bytes = len as u64 * ELEMENT_SIZE;
        self.check_buffer_size(label, bytes)?;

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: bytes,
            usage: STORAGE_USAGE,
            mapped_at_creation: false,
        });
        self.allocation_result(label, bytes, buffer)
    }

    fn create_buffer_init(&mut self, label: &'static str, contents: &[i32]) -> Result<wgpu::Buffer> {
        let bytes = contents.len() as u64 * ELEMENT_SIZE;
        self.check_buffer_size(label, bytes)?;

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = create_storage_buffer_init(&self.device, label, contents);
        self.allocation_result(label, bytes, buffer)
    }

    fn release_buffer(&mut self, buffer: wgpu::Buffer) {
        // recorded bind groups keep their own reference until the GPU is done with it
        drop(buffer);
    }

    fn dispatch(&mut self, dispatch: Dispatch<'_, wgpu::Buffer>) -> Result<()> {
        let Dispatch { bindings, params, work_size } = dispatch;
        let kernel = bindings.kernel();
        trace!("{} {:?} over {:?}", kernel.entry_point(), params, work_size);

        // caller buffers are only checked by wgpu here: wrong usage or another device
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let resources = bindings.resources();
        let bind_group = resources
            .iter()
            .fold(BindGroupBuilder::new(&self.kernel(kernel).storage_layout), |builder, (_, buffer)| {
                builder.resource(buffer.as_entire_binding())
            })
            .create(&self.device, Some(kernel.entry_point()));

        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(SortError::Backend(format!("cannot bind buffers of {}: {error}", kernel.entry_point())));
        }

        self.params.push(params);
        self.pending.push(PendingDispatch {
            kernel,
            bind_group,
            params_index: self.params.len() - 1,
            work_size,
        });
        Ok(())
    }

    fn submit(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let params = DynamicUniformBuffer::new(&self.device, &self.params_layout, &self.params, Some("Sorter parameters"));
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Sort Encoder") });

        self.encode_pending(&mut encoder, &params);
        if let Some(profiler) = self.profiler.as_mut() {
            profiler.resolve_queries(&mut encoder);
        }

        debug!("Submitting {} dispatches", self.pending.len());
        self.queue.submit(Some(encoder.finish()));
        self.discard();

        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(SortError::Backend(error.to_string()));
        }

        if let Some(profiler) = self.profiler.as_mut() {
            profiler
                .end_frame()
                .map_err(|e| SortError::Backend(format!("profiler frame error: {e:?}")))?;
            self.device.poll(wgpu::Maintain::Wait);
            if let Some(results) = profiler.process_finished_frame(self.queue.get_timestamp_period()) {
                log_timings(&results, 0);
            }
        }

        Ok(())
    }

    fn discard(&mut self) {
        self.pending.clear();
        self.params.clear();
    }
}

impl HostTransfer for WgpuBackend {
    fn upload(&mut self, label: &'static str, data: &[i32]) -> Result<wgpu::Buffer> {
        self.create_buffer_init(label, data)
    }

    fn download(&mut self, buffer: &wgpu::Buffer) -> Result<Vec<i32>> {
        read_buffer(&self.device, &self.queue, buffer)
    }
}
