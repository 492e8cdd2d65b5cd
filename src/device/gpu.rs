//! wgpu compute executor (Vulkan / Metal / DX12).
//!
//! Each kernel is a WGSL module under `shaders/`. Image samples are packed
//! four per `u32` word; bin buffers are plain `u32` arrays. Every buffer is
//! at least one word long so a zero-bin run still has valid bindings.
//!
//! When the adapter supports `TIMESTAMP_QUERY` each compute pass records
//! begin/end timestamps; otherwise kernel time falls back to host wall-clock
//! time around submit and wait.
//!
//! With `readback_timeout_ms` set, every wait on the device (upload, kernel
//! completion, buffer mapping) polls against that deadline instead of
//! blocking.

use std::sync::mpsc::{self, TryRecvError};
use std::time::{Duration, Instant};

use bytemuck::{Pod, Zeroable};
use tracing::{debug, info, warn};
use wgpu::util::DeviceExt;

use super::{BufferRole, DeviceInfo, DeviceKind, Executor, Kernel, KernelParams, Launch, ReadBack};
use crate::config::{EqualizeConfig, PowerPreference};
use crate::error::{Error, Result};
use crate::timing::KernelProfile;

const HIST_SIMPLE_WGSL: &str = include_str!("shaders/hist_simple.wgsl");
const HIST_CUM_WGSL: &str = include_str!("shaders/hist_cum.wgsl");
const HIST_LUT_WGSL: &str = include_str!("shaders/hist_lut.wgsl");
const BACK_PROJ_WGSL: &str = include_str!("shaders/back_proj.wgsl");

/// Threads per workgroup for the per-sample kernels.
const SAMPLE_WORKGROUP: u32 = 256;
/// Threads per workgroup for the per-bin kernels.
const BIN_WORKGROUP: u32 = 64;

/// Uniform block shared by all four shaders.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct Params {
    len: u32,
    bins: u32,
    total: u32,
    pad: u32,
}

/// Device buffer bound to one role.
#[derive(Debug)]
pub struct GpuBuffer {
    role: BufferRole,
    len: usize,
    buffer: wgpu::Buffer,
}

impl GpuBuffer {
    pub fn role(&self) -> BufferRole {
        self.role
    }

    /// Length in elements of the role.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

struct Pipelines {
    histogram: wgpu::ComputePipeline,
    scan: wgpu::ComputePipeline,
    normalize: wgpu::ComputePipeline,
    back_project: wgpu::ComputePipeline,
}

impl Pipelines {
    fn get(&self, kernel: Kernel) -> &wgpu::ComputePipeline {
        match kernel {
            Kernel::Histogram => &self.histogram,
            Kernel::CumulativeScan => &self.scan,
            Kernel::Normalize => &self.normalize,
            Kernel::BackProject => &self.back_project,
        }
    }
}

/// Timestamp query resources, one begin/end pair per pass.
struct Timestamps {
    query_set: wgpu::QuerySet,
    resolve: wgpu::Buffer,
    /// Nanoseconds per timestamp tick.
    period: f32,
}

const TIMESTAMP_BYTES: u64 = 2 * std::mem::size_of::<u64>() as u64;

#[derive(Debug)]
enum WaitFailure {
    TimedOut(Duration),
    Failed(String),
}

/// Call `step` until it yields a value or `timeout` has passed.
fn poll_until<T>(
    timeout: Duration,
    mut step: impl FnMut() -> std::result::Result<Option<T>, String>,
) -> std::result::Result<T, WaitFailure> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = step().map_err(WaitFailure::Failed)? {
            return Ok(value);
        }
        if Instant::now() >= deadline {
            return Err(WaitFailure::TimedOut(timeout));
        }
        std::thread::yield_now();
    }
}

pub struct GpuExecutor {
    device: wgpu::Device,
    queue: wgpu::Queue,
    info: DeviceInfo,
    pipelines: Pipelines,
    timestamps: Option<Timestamps>,
    max_workgroups_per_dim: u32,
    max_buffer_size: u64,
    readback_timeout: Option<Duration>,
}

impl GpuExecutor {
    /// Select an adapter, create the device and build the four kernels.
    pub fn new(config: &EqualizeConfig) -> Result<Self> {
        config.validate()?;
        pollster::block_on(Self::new_async(config))
    }

    pub async fn new_async(config: &EqualizeConfig) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());

        let power_preference = match config.power_preference {
            PowerPreference::LowPower => wgpu::PowerPreference::LowPower,
            PowerPreference::HighPerformance => wgpu::PowerPreference::HighPerformance,
        };
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

        let adapter_info = adapter.get_info();
        let adapter_limits = adapter.limits();
        info!(
            adapter = %adapter_info.name,
            backend = ?adapter_info.backend,
            device_type = ?adapter_info.device_type,
            "selected GPU adapter"
        );

        let supports_timestamps = adapter.features().contains(wgpu::Features::TIMESTAMP_QUERY);
        let use_timestamps = config.profiling && supports_timestamps;
        if config.profiling && !supports_timestamps {
            warn!("adapter lacks timestamp queries, kernel times use host wall-clock");
        }
        let required_features = if use_timestamps {
            wgpu::Features::TIMESTAMP_QUERY
        } else {
            wgpu::Features::empty()
        };

        let limits = wgpu::Limits {
            max_storage_buffer_binding_size: adapter_limits.max_storage_buffer_binding_size,
            max_buffer_size: adapter_limits.max_buffer_size,
            ..wgpu::Limits::downlevel_defaults()
        };

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("histeq"),
                required_features,
                required_limits: limits.clone(),
                memory_hints: wgpu::MemoryHints::Performance,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

        let pipelines = Pipelines {
            histogram: build_pipeline(&device, Kernel::Histogram, HIST_SIMPLE_WGSL).await?,
            scan: build_pipeline(&device, Kernel::CumulativeScan, HIST_CUM_WGSL).await?,
            normalize: build_pipeline(&device, Kernel::Normalize, HIST_LUT_WGSL).await?,
            back_project: build_pipeline(&device, Kernel::BackProject, BACK_PROJ_WGSL).await?,
        };

        let timestamps = use_timestamps.then(|| Timestamps {
            query_set: device.create_query_set(&wgpu::QuerySetDescriptor {
                label: Some("timestamp_query_set"),
                ty: wgpu::QueryType::Timestamp,
                count: 2,
            }),
            resolve: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("timestamp_resolve"),
                size: TIMESTAMP_BYTES,
                usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            }),
            period: queue.get_timestamp_period(),
        });

        let info = DeviceInfo {
            name: adapter_info.name.clone(),
            kind: match adapter_info.device_type {
                wgpu::DeviceType::IntegratedGpu => DeviceKind::IntegratedGpu,
                wgpu::DeviceType::DiscreteGpu => DeviceKind::DiscreteGpu,
                wgpu::DeviceType::VirtualGpu => DeviceKind::VirtualGpu,
                wgpu::DeviceType::Cpu => DeviceKind::Cpu,
                _ => DeviceKind::Other,
            },
            backend: format!("{:?}", adapter_info.backend),
        };

        Ok(Self {
            device,
            queue,
            info,
            pipelines,
            timestamps,
            max_workgroups_per_dim: limits.max_compute_workgroups_per_dimension,
            max_buffer_size: limits
                .max_buffer_size
                .min(limits.max_storage_buffer_binding_size as u64),
            readback_timeout: config.readback_timeout_ms.map(Duration::from_millis),
        })
    }

    /// True when an adapter can be found at all.
    pub fn is_available() -> bool {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
            .is_ok()
    }

    /// Whether kernel times come from device timestamps.
    pub fn has_timestamps(&self) -> bool {
        self.timestamps.is_some()
    }

    /// Split a workgroup count across x and y when it exceeds the per-dimension limit.
    fn tile_workgroups(&self, kernel: Kernel, workgroups: u32) -> Result<(u32, u32)> {
        let max = self.max_workgroups_per_dim;
        if workgroups <= max {
            return Ok((workgroups.max(1), 1));
        }
        let wy = workgroups.div_ceil(max);
        if wy > max {
            return Err(Error::dispatch(
                kernel,
                format!("{workgroups} workgroups exceed the device dispatch limit"),
            ));
        }
        Ok((max, wy))
    }

    fn wait_idle(&self) -> std::result::Result<(), String> {
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    /// Drive the device until a callback delivers on `rx`, honouring the
    /// configured timeout.
    fn await_callback<T>(&self, rx: mpsc::Receiver<T>) -> std::result::Result<T, WaitFailure> {
        let dropped = || "device callback dropped".to_string();
        match self.readback_timeout {
            None => {
                self.wait_idle().map_err(WaitFailure::Failed)?;
                rx.recv().map_err(|_| WaitFailure::Failed(dropped()))
            }
            Some(timeout) => poll_until(timeout, || {
                self.device
                    .poll(wgpu::PollType::Poll)
                    .map_err(|e| e.to_string())?;
                match rx.try_recv() {
                    Ok(value) => Ok(Some(value)),
                    Err(TryRecvError::Empty) => Ok(None),
                    Err(TryRecvError::Disconnected) => Err(dropped()),
                }
            }),
        }
    }

    /// Wait for all submitted work to finish.
    fn wait_submitted(&self) -> std::result::Result<(), WaitFailure> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.queue.on_submitted_work_done(move || {
            tx.send(()).ok();
        });
        self.await_callback(rx)
    }

    /// Map `slice` for reading.
    fn map_read(&self, slice: &wgpu::BufferSlice<'_>) -> std::result::Result<(), WaitFailure> {
        let (tx, rx) = mpsc::sync_channel(1);
        slice.map_async(wgpu::MapMode::Read, move |r| {
            tx.send(r).ok();
        });
        self.await_callback(rx)?
            .map_err(|e| WaitFailure::Failed(e.to_string()))
    }

    /// Copy `count` elements of `buffer` back to the host.
    fn read_back<T: Pod>(&self, buffer: &GpuBuffer, count: usize) -> Result<ReadBack<T>> {
        let start = Instant::now();
        if count == 0 {
            return Ok(ReadBack {
                data: Vec::new(),
                elapsed: start.elapsed(),
            });
        }

        let size = buffer.buffer.size();
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging_readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback_encoder"),
            });
        encoder.copy_buffer_to_buffer(&buffer.buffer, 0, &staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        self.map_read(&slice).map_err(|failure| match failure {
            WaitFailure::TimedOut(t) => Error::ReadbackTimeout {
                role: buffer.role,
                timeout_ms: t.as_millis() as u64,
            },
            WaitFailure::Failed(reason) => Error::transfer(buffer.role, reason),
        })?;

        let mapped = slice.get_mapped_range();
        let data = bytemuck::cast_slice::<u8, T>(&mapped)[..count].to_vec();
        drop(mapped);
        staging.unmap();

        Ok(ReadBack {
            data,
            elapsed: start.elapsed(),
        })
    }

    /// Device execution time of a pass whose timestamps were copied to `staging`.
    fn pass_duration(
        &self,
        kernel: Kernel,
        ts: &Timestamps,
        staging: &wgpu::Buffer,
    ) -> Result<Duration> {
        let slice = staging.slice(..);
        self.map_read(&slice).map_err(|failure| match failure {
            WaitFailure::TimedOut(t) => {
                Error::dispatch(kernel, format!("timestamp read-back timed out after {t:?}"))
            }
            WaitFailure::Failed(reason) => Error::dispatch(kernel, reason),
        })?;
        let mapped = slice.get_mapped_range();
        let ticks: &[u64] = bytemuck::cast_slice(&mapped);
        let elapsed = ticks[1].saturating_sub(ticks[0]);
        drop(mapped);
        staging.unmap();
        Ok(Duration::from_nanos((elapsed as f64 * ts.period as f64) as u64))
    }

    fn dispatch(
        &self,
        kernel: Kernel,
        params: KernelParams,
        bindings: &[&GpuBuffer],
        workgroups: u32,
    ) -> Result<KernelProfile> {
        let queued = Instant::now();
        let (wx, wy) = self.tile_workgroups(kernel, workgroups)?;

        let uniform = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("histeq_params"),
                contents: bytemuck::bytes_of(&Params {
                    len: params.sample_count,
                    bins: params.bins,
                    total: params.sample_count,
                    pad: 0,
                }),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let pipeline = self.pipelines.get(kernel);
        let layout = pipeline.get_bind_group_layout(0);
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: uniform.as_entire_binding(),
        }];
        entries.extend(bindings.iter().enumerate().map(|(i, b)| wgpu::BindGroupEntry {
            binding: i as u32 + 1,
            resource: b.buffer.as_entire_binding(),
        }));
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel.entry_point()),
            layout: &layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(kernel.entry_point()),
            });
        {
            let timestamp_writes =
                self.timestamps
                    .as_ref()
                    .map(|ts| wgpu::ComputePassTimestampWrites {
                        query_set: &ts.query_set,
                        beginning_of_pass_write_index: Some(0),
                        end_of_pass_write_index: Some(1),
                    });
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.entry_point()),
                timestamp_writes,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(wx, wy, 1);
        }
        // one staging buffer per pass; a timed-out map must not outlive it
        let ts_staging = self.timestamps.as_ref().map(|ts| {
            let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("timestamp_staging"),
                size: TIMESTAMP_BYTES,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            encoder.resolve_query_set(&ts.query_set, 0..2, &ts.resolve, 0);
            encoder.copy_buffer_to_buffer(&ts.resolve, 0, &staging, 0, TIMESTAMP_BYTES);
            (ts, staging)
        });

        self.queue.submit(std::iter::once(encoder.finish()));
        let submitted = queued.elapsed();

        if let Some(e) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(Error::dispatch(kernel, e.to_string()));
        }
        self.wait_submitted().map_err(|failure| match failure {
            WaitFailure::TimedOut(t) => {
                Error::dispatch(kernel, format!("kernel did not finish within {t:?}"))
            }
            WaitFailure::Failed(reason) => Error::dispatch(kernel, reason),
        })?;
        let done = queued.elapsed();

        let execution = match &ts_staging {
            Some((ts, staging)) => Some(self.pass_duration(kernel, ts, staging)?),
            None => None,
        };
        let profile = match execution {
            Some(execution) => {
                let started = done.saturating_sub(execution).max(submitted);
                KernelProfile::from_offsets(submitted, started, started + execution)
            }
            None => KernelProfile::from_offsets(submitted, submitted, done),
        };
        Ok(profile)
    }
}

/// Compile one WGSL module and its entry point, surfacing validation errors.
async fn build_pipeline(
    device: &wgpu::Device,
    kernel: Kernel,
    source: &str,
) -> Result<wgpu::ComputePipeline> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(kernel.entry_point()),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(kernel.entry_point()),
        layout: None,
        module: &module,
        entry_point: Some(kernel.entry_point()),
        compilation_options: Default::default(),
        cache: None,
    });
    if let Some(e) = device.pop_error_scope().await {
        return Err(Error::ProgramBuild {
            entry_point: kernel.entry_point().to_string(),
            log: e.to_string(),
        });
    }
    Ok(pipeline)
}

fn expect_samples(kernel: Kernel, buffer: &GpuBuffer, len: u32) -> Result<()> {
    if !buffer.role.holds_samples() {
        return Err(Error::dispatch(
            kernel,
            format!("{} buffer bound to an argument of the wrong element type", buffer.role),
        ));
    }
    if buffer.len != len as usize {
        return Err(Error::dispatch(
            kernel,
            format!("{} buffer holds {} samples, expected {len}", buffer.role, buffer.len),
        ));
    }
    Ok(())
}

fn expect_bins(kernel: Kernel, buffer: &GpuBuffer, bins: u32) -> Result<()> {
    if buffer.role.holds_samples() {
        return Err(Error::dispatch(
            kernel,
            format!("{} buffer bound to an argument of the wrong element type", buffer.role),
        ));
    }
    if buffer.len != bins as usize {
        return Err(Error::dispatch(
            kernel,
            format!("bin buffer holds {} entries, expected {bins}", buffer.len),
        ));
    }
    Ok(())
}

impl Executor for GpuExecutor {
    type Buffer = GpuBuffer;

    fn device_info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn allocate(&self, role: BufferRole, len: usize) -> Result<GpuBuffer> {
        let bytes = (len as u64 * role.element_size() as u64)
            .next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT)
            .max(wgpu::COPY_BUFFER_ALIGNMENT);
        if bytes > self.max_buffer_size {
            return Err(Error::Allocation {
                role,
                bytes,
                reason: format!("device limit is {} bytes", self.max_buffer_size),
            });
        }

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(match role {
                BufferRole::InputImage => "input_image",
                BufferRole::OutputImage => "output_image",
                BufferRole::Histogram => "histogram",
                BufferRole::Cumulative => "cumulative",
                BufferRole::RemapTable => "lut",
            }),
            size: bytes,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Some(e) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(Error::Allocation {
                role,
                bytes,
                reason: e.to_string(),
            });
        }

        debug!(%role, len, bytes, "allocated device buffer");
        Ok(GpuBuffer { role, len, buffer })
    }

    fn write_samples(&self, buffer: &GpuBuffer, samples: &[u8]) -> Result<Duration> {
        if !buffer.role.holds_samples() {
            return Err(Error::transfer(buffer.role, "not a sample buffer"));
        }
        if buffer.len != samples.len() {
            return Err(Error::transfer(
                buffer.role,
                format!("buffer holds {} samples, got {}", buffer.len, samples.len()),
            ));
        }

        let start = Instant::now();
        let mut padded = samples.to_vec();
        padded.resize(buffer.buffer.size() as usize, 0);
        self.queue.write_buffer(&buffer.buffer, 0, &padded);
        self.queue.submit(std::iter::empty());
        self.wait_submitted().map_err(|failure| match failure {
            WaitFailure::TimedOut(t) => Error::transfer(
                buffer.role,
                format!("upload did not complete within {t:?}"),
            ),
            WaitFailure::Failed(reason) => Error::transfer(buffer.role, reason),
        })?;
        Ok(start.elapsed())
    }

    fn fill_zero(&self, buffer: &GpuBuffer) -> Result<()> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("fill_zero"),
            });
        encoder.clear_buffer(&buffer.buffer, 0, None);
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn launch(&self, params: KernelParams, launch: Launch<'_, GpuBuffer>) -> Result<KernelProfile> {
        let kernel = launch.kernel();
        let bin_groups = params.bins.div_ceil(BIN_WORKGROUP);
        match launch {
            Launch::Histogram { image, histogram } => {
                expect_samples(kernel, image, params.sample_count)?;
                expect_bins(kernel, histogram, params.bins)?;
                let groups = params.sample_count.div_ceil(SAMPLE_WORKGROUP);
                self.dispatch(kernel, params, &[image, histogram], groups)
            }
            Launch::CumulativeScan {
                histogram,
                cumulative,
            } => {
                expect_bins(kernel, histogram, params.bins)?;
                expect_bins(kernel, cumulative, params.bins)?;
                self.dispatch(kernel, params, &[histogram, cumulative], bin_groups)
            }
            Launch::Normalize { cumulative, lut } => {
                expect_bins(kernel, cumulative, params.bins)?;
                expect_bins(kernel, lut, params.bins)?;
                self.dispatch(kernel, params, &[cumulative, lut], bin_groups)
            }
            Launch::BackProject { image, lut, output } => {
                expect_samples(kernel, image, params.sample_count)?;
                expect_bins(kernel, lut, params.bins)?;
                expect_samples(kernel, output, params.sample_count)?;
                let words = params.sample_count.div_ceil(4);
                let groups = words.div_ceil(SAMPLE_WORKGROUP);
                self.dispatch(kernel, params, &[image, lut, output], groups)
            }
        }
    }

    fn read_bins(&self, buffer: &GpuBuffer) -> Result<ReadBack<u32>> {
        if buffer.role.holds_samples() {
            return Err(Error::transfer(buffer.role, "not a bin buffer"));
        }
        self.read_back(buffer, buffer.len)
    }

    fn read_samples(&self, buffer: &GpuBuffer) -> Result<ReadBack<u8>> {
        if !buffer.role.holds_samples() {
            return Err(Error::transfer(buffer.role, "not a sample buffer"));
        }
        self.read_back(buffer, buffer.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CpuExecutor;
    use crate::image::Image;
    use crate::pipeline::Pipeline;

    /// `None` when the machine has no usable adapter.
    fn executor(config: &EqualizeConfig) -> Option<GpuExecutor> {
        match GpuExecutor::new(config) {
            Ok(exec) => Some(exec),
            Err(Error::DeviceUnavailable(reason)) => {
                eprintln!("skipping GPU test: {reason}");
                None
            }
            Err(e) => panic!("GPU executor failed to initialize: {e}"),
        }
    }

    fn gradient(width: usize, height: usize, channels: usize) -> Image {
        let samples = (0..width * height * channels)
            .map(|i| ((i * 37 + i / 7) % 256) as u8)
            .collect();
        Image::from_raw(width, height, channels, samples).unwrap()
    }

    #[test]
    fn test_matches_cpu_executor() {
        let config = EqualizeConfig::default();
        let Some(gpu) = executor(&config) else { return };
        // 3-channel with a sample count that is not a multiple of 4
        let image = gradient(13, 7, 3);

        for bins in [256, 100, 7, 1] {
            let config = EqualizeConfig::with_bins(bins);
            let expected = Pipeline::new(CpuExecutor::new(), config.clone())
                .run(&image)
                .unwrap();
            let actual = Pipeline::new(&gpu, config).run(&image).unwrap();

            assert_eq!(actual.histogram, expected.histogram, "bins={bins}");
            assert_eq!(actual.cumulative, expected.cumulative, "bins={bins}");
            assert_eq!(actual.lut, expected.lut, "bins={bins}");
            assert_eq!(actual.output, expected.output, "bins={bins}");
        }
    }

    #[test]
    fn test_zero_bins_zero_fills_output() {
        let config = EqualizeConfig::with_bins(0);
        let Some(gpu) = executor(&config) else { return };
        let image = gradient(5, 3, 1);
        let result = Pipeline::new(&gpu, config).run(&image).unwrap();
        assert!(result.histogram.is_empty());
        assert!(result.lut.is_empty());
        assert!(result.output.samples().iter().all(|&v| v == 0));
    }

    #[test]
    fn test_two_by_two_scenario() {
        let config = EqualizeConfig::default();
        let Some(gpu) = executor(&config) else { return };
        let image = Image::gray(2, 2, vec![0, 85, 170, 255]).unwrap();
        let result = Pipeline::new(&gpu, config).run(&image).unwrap();
        assert_eq!(result.lut[0], 64);
        assert_eq!(result.lut[255], 255);
        assert_eq!(result.output.samples(), &[64, 128, 191, 255]);
        assert_eq!(result.timings.len(), 4);
    }

    #[test]
    fn test_readback_timeout_still_completes_small_runs() {
        let config = EqualizeConfig {
            readback_timeout_ms: Some(10_000),
            ..EqualizeConfig::default()
        };
        let Some(gpu) = executor(&config) else { return };
        let image = Image::filled(4, 4, 1, 200);
        let result = Pipeline::new(&gpu, config).run(&image).unwrap();
        assert_eq!(result.histogram[200], 16);
        assert!(result.output.samples().iter().all(|&v| v == 255));
    }

    #[test]
    fn test_wait_gives_up_at_deadline() {
        let timeout = Duration::from_millis(20);
        let start = Instant::now();
        let mut polls = 0;
        let err = poll_until::<()>(timeout, || {
            polls += 1;
            Ok(None)
        })
        .unwrap_err();
        assert!(matches!(err, WaitFailure::TimedOut(t) if t == timeout));
        assert!(start.elapsed() >= timeout);
        assert!(polls > 1);
    }

    #[test]
    fn test_wait_returns_once_ready() {
        let mut polls = 0;
        let value = poll_until(Duration::from_secs(5), || {
            polls += 1;
            Ok((polls == 3).then_some(polls))
        })
        .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn test_wait_surfaces_device_errors() {
        let err = poll_until::<()>(Duration::from_secs(5), || Err("device lost".to_string()))
            .unwrap_err();
        assert!(matches!(err, WaitFailure::Failed(reason) if reason == "device lost"));
    }

    #[test]
    fn test_executor_survives_repeated_timed_runs() {
        let config = EqualizeConfig {
            readback_timeout_ms: Some(10_000),
            ..EqualizeConfig::default()
        };
        let Some(gpu) = executor(&config) else { return };
        let image = gradient(9, 5, 1);
        let first = Pipeline::new(&gpu, config.clone()).run(&image).unwrap();
        let second = Pipeline::new(&gpu, config).run(&image).unwrap();
        assert_eq!(first.output, second.output);
    }

    #[test]
    fn test_wrong_buffer_roles_rejected() {
        let config = EqualizeConfig::default();
        let Some(gpu) = executor(&config) else { return };
        let img = gpu.allocate(BufferRole::InputImage, 4).unwrap();
        let hist = gpu.allocate(BufferRole::Histogram, 256).unwrap();
        let err = gpu
            .launch(
                KernelParams {
                    sample_count: 4,
                    bins: 256,
                },
                Launch::Histogram {
                    image: &hist,
                    histogram: &img,
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Dispatch { kernel: Kernel::Histogram, .. }));
    }
}
