//! Pipeline orchestrator.
//!
//! Runs the four stages in a fixed, strictly linear order:
//!
//! ```text
//! Unconfigured -> BuffersAllocated -> InputTransferred -> HistogramDone
//!   -> CumulativeDone -> LutDone -> BackProjectionDone -> ResultsRead
//! ```
//!
//! Inputs are validated before any buffer exists. Any failure afterwards
//! aborts the run; buffers are dropped with the run and no partial result is
//! returned.

use std::fmt;
use std::time::Duration;

use tracing::{debug, info};

use crate::bins::BinCount;
use crate::config::{Backend, EqualizeConfig};
use crate::device::{BufferRole, CpuExecutor, DeviceInfo, Executor, Kernel, KernelParams};
use crate::error::{Error, Result};
use crate::image::Image;
use crate::report::Report;
use crate::stages;
use crate::timing::{KernelProfile, StageTiming};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineState {
    Unconfigured,
    BuffersAllocated,
    InputTransferred,
    HistogramDone,
    CumulativeDone,
    LutDone,
    BackProjectionDone,
    ResultsRead,
}

impl PipelineState {
    /// The only state reachable from this one.
    pub fn next(self) -> Option<PipelineState> {
        use PipelineState::*;
        match self {
            Unconfigured => Some(BuffersAllocated),
            BuffersAllocated => Some(InputTransferred),
            InputTransferred => Some(HistogramDone),
            HistogramDone => Some(CumulativeDone),
            CumulativeDone => Some(LutDone),
            LutDone => Some(BackProjectionDone),
            BackProjectionDone => Some(ResultsRead),
            ResultsRead => None,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Everything a completed run produces.
#[derive(Clone, Debug)]
pub struct Equalization {
    pub output: Image,
    /// Empty when intermediates were not read back.
    pub histogram: Vec<u32>,
    pub cumulative: Vec<u32>,
    pub lut: Vec<u32>,
    /// One record per stage, in dispatch order.
    pub timings: Vec<StageTiming>,
    /// Host-to-device transfer time of the input image.
    pub upload: Duration,
    pub bins: BinCount,
    pub device: DeviceInfo,
}

impl Equalization {
    pub fn timing(&self, kernel: Kernel) -> Option<&StageTiming> {
        self.timings.iter().find(|t| t.kernel == kernel)
    }

    /// Sum of the device execution times of all four kernels.
    pub fn total_kernel_time(&self) -> Duration {
        self.timings.iter().map(|t| t.profile.execution()).sum()
    }

    pub fn report(&self) -> Report<'_> {
        Report::new(self)
    }
}

struct Buffers<B> {
    input: B,
    output: B,
    histogram: B,
    cumulative: B,
    lut: B,
}

/// Tracks the linear state machine of one run.
struct RunState {
    state: PipelineState,
}

impl RunState {
    fn new() -> Self {
        Self {
            state: PipelineState::Unconfigured,
        }
    }

    fn advance(&mut self, to: PipelineState) {
        debug_assert_eq!(self.state.next(), Some(to), "pipeline states are strictly linear");
        debug!(from = %self.state, to = %to, "pipeline state");
        self.state = to;
    }
}

/// Histogram-equalization pipeline bound to one executor.
pub struct Pipeline<E: Executor> {
    executor: E,
    config: EqualizeConfig,
}

impl<E: Executor> Pipeline<E> {
    pub fn new(executor: E, config: EqualizeConfig) -> Self {
        Self { executor, config }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn config(&self) -> &EqualizeConfig {
        &self.config
    }

    /// Equalize `image` end to end.
    pub fn run(&self, image: &Image) -> Result<Equalization> {
        let bins = self.config.validate()?;
        let sample_count = validate_image(image)?;
        let exec = &self.executor;
        let device = exec.device_info();
        let params = KernelParams {
            sample_count,
            bins: bins.get(),
        };

        info!(
            width = image.width(),
            height = image.height(),
            channels = image.channels(),
            bins = bins.get(),
            device = %device,
            "equalizing image"
        );

        let mut run = RunState::new();
        let buffers = Buffers {
            input: exec.allocate(BufferRole::InputImage, image.byte_size())?,
            output: exec.allocate(BufferRole::OutputImage, image.byte_size())?,
            histogram: exec.allocate(BufferRole::Histogram, bins.len())?,
            cumulative: exec.allocate(BufferRole::Cumulative, bins.len())?,
            lut: exec.allocate(BufferRole::RemapTable, bins.len())?,
        };
        run.advance(PipelineState::BuffersAllocated);

        let upload = exec.write_samples(&buffers.input, image.samples())?;
        run.advance(PipelineState::InputTransferred);

        let mut timings = Vec::with_capacity(Kernel::ALL.len());

        exec.fill_zero(&buffers.histogram)?;
        let profile = stages::build_histogram(exec, params, &buffers.input, &buffers.histogram)?;
        let histogram = self.read_intermediate(&buffers.histogram, Kernel::Histogram, profile, &mut timings)?;
        run.advance(PipelineState::HistogramDone);

        exec.fill_zero(&buffers.cumulative)?;
        let profile = stages::cumulative_scan(exec, params, &buffers.histogram, &buffers.cumulative)?;
        let cumulative =
            self.read_intermediate(&buffers.cumulative, Kernel::CumulativeScan, profile, &mut timings)?;
        run.advance(PipelineState::CumulativeDone);

        exec.fill_zero(&buffers.lut)?;
        let profile = stages::build_remap_table(exec, params, &buffers.cumulative, &buffers.lut)?;
        let lut = self.read_intermediate(&buffers.lut, Kernel::Normalize, profile, &mut timings)?;
        run.advance(PipelineState::LutDone);

        let profile = stages::back_project(exec, params, &buffers.input, &buffers.lut, &buffers.output)?;
        run.advance(PipelineState::BackProjectionDone);

        let read = exec.read_samples(&buffers.output)?;
        timings.push(StageTiming {
            kernel: Kernel::BackProject,
            profile,
            transfer: read.elapsed,
        });
        let output = Image::from_raw(image.width(), image.height(), image.channels(), read.data)?;
        run.advance(PipelineState::ResultsRead);

        let result = Equalization {
            output,
            histogram,
            cumulative,
            lut,
            timings,
            upload,
            bins,
            device,
        };
        info!(
            kernel_ns = result.total_kernel_time().as_nanos() as u64,
            "equalization complete"
        );
        Ok(result)
    }

    fn read_intermediate(
        &self,
        buffer: &E::Buffer,
        kernel: Kernel,
        profile: KernelProfile,
        timings: &mut Vec<StageTiming>,
    ) -> Result<Vec<u32>> {
        let (data, transfer) = if self.config.read_back_intermediates {
            let read = self.executor.read_bins(buffer)?;
            (read.data, read.elapsed)
        } else {
            (Vec::new(), Duration::ZERO)
        };
        debug!(
            stage = kernel.stage_name(),
            kernel_ns = profile.execution_ns() as u64,
            transfer_ns = transfer.as_nanos() as u64,
            "stage complete"
        );
        timings.push(StageTiming {
            kernel,
            profile,
            transfer,
        });
        Ok(data)
    }
}

fn validate_image(image: &Image) -> Result<u32> {
    if image.is_empty() {
        return Err(Error::EmptyImage);
    }
    u32::try_from(image.sample_count()).map_err(|_| Error::ImageTooLarge(image.sample_count()))
}

/// Equalize on the CPU executor with `bins` bins.
pub fn equalize(image: &Image, bins: i64) -> Result<Equalization> {
    Pipeline::new(CpuExecutor::new(), EqualizeConfig::with_bins(bins)).run(image)
}

/// Equalize on the executor selected by `config.backend`.
pub fn equalize_with_config(image: &Image, config: &EqualizeConfig) -> Result<Equalization> {
    // Reject bad configurations before creating a device.
    config.validate()?;
    match config.backend {
        Backend::Cpu => Pipeline::new(CpuExecutor::new(), config.clone()).run(image),
        #[cfg(feature = "gpu")]
        Backend::Gpu => {
            let executor = crate::device::GpuExecutor::new(config)?;
            Pipeline::new(executor, config.clone()).run(image)
        }
        #[cfg(not(feature = "gpu"))]
        Backend::Gpu => Err(Error::DeviceUnavailable(
            "built without the `gpu` feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::device::cpu::CpuBuffer;
    use crate::device::{Launch, ReadBack};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Allocate(BufferRole, usize),
        Write(BufferRole),
        Zero(BufferRole),
        Launch(Kernel),
        ReadBins(BufferRole),
        ReadSamples(BufferRole),
    }

    /// Wraps the CPU executor, recording every call and optionally failing one kernel.
    struct Recording {
        inner: CpuExecutor,
        calls: RefCell<Vec<Call>>,
        fail_on: Option<Kernel>,
    }

    impl Recording {
        fn new() -> Self {
            Self {
                inner: CpuExecutor::new(),
                calls: RefCell::new(Vec::new()),
                fail_on: None,
            }
        }

        fn failing(kernel: Kernel) -> Self {
            Self {
                fail_on: Some(kernel),
                ..Self::new()
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.borrow().clone()
        }

        fn launched(&self) -> Vec<Kernel> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Launch(k) => Some(k),
                    _ => None,
                })
                .collect()
        }
    }

    impl Executor for Recording {
        type Buffer = CpuBuffer;

        fn device_info(&self) -> DeviceInfo {
            self.inner.device_info()
        }

        fn allocate(&self, role: BufferRole, len: usize) -> Result<CpuBuffer> {
            self.calls.borrow_mut().push(Call::Allocate(role, len));
            self.inner.allocate(role, len)
        }

        fn write_samples(&self, buffer: &CpuBuffer, samples: &[u8]) -> Result<Duration> {
            self.calls.borrow_mut().push(Call::Write(buffer.role()));
            self.inner.write_samples(buffer, samples)
        }

        fn fill_zero(&self, buffer: &CpuBuffer) -> Result<()> {
            self.calls.borrow_mut().push(Call::Zero(buffer.role()));
            self.inner.fill_zero(buffer)
        }

        fn launch(&self, params: KernelParams, launch: Launch<'_, CpuBuffer>) -> Result<KernelProfile> {
            let kernel = launch.kernel();
            self.calls.borrow_mut().push(Call::Launch(kernel));
            if self.fail_on == Some(kernel) {
                return Err(Error::dispatch(kernel, "injected failure"));
            }
            self.inner.launch(params, launch)
        }

        fn read_bins(&self, buffer: &CpuBuffer) -> Result<ReadBack<u32>> {
            self.calls.borrow_mut().push(Call::ReadBins(buffer.role()));
            self.inner.read_bins(buffer)
        }

        fn read_samples(&self, buffer: &CpuBuffer) -> Result<ReadBack<u8>> {
            self.calls.borrow_mut().push(Call::ReadSamples(buffer.role()));
            self.inner.read_samples(buffer)
        }
    }

    #[test]
    fn test_state_machine_is_linear() {
        let mut state = PipelineState::Unconfigured;
        let mut visited = vec![state];
        while let Some(next) = state.next() {
            assert!(next > state);
            state = next;
            visited.push(state);
        }
        assert_eq!(visited.len(), 8);
        assert_eq!(state, PipelineState::ResultsRead);
    }

    #[test]
    fn test_stage_order_and_buffer_lifecycle() {
        let exec = Recording::new();
        let image = Image::filled(3, 2, 1, 10);
        let pipeline = Pipeline::new(&exec, EqualizeConfig::with_bins(16));
        pipeline.run(&image).unwrap();

        use BufferRole::*;
        assert_eq!(
            exec.calls(),
            vec![
                Call::Allocate(InputImage, 6),
                Call::Allocate(OutputImage, 6),
                Call::Allocate(Histogram, 16),
                Call::Allocate(Cumulative, 16),
                Call::Allocate(RemapTable, 16),
                Call::Write(InputImage),
                Call::Zero(Histogram),
                Call::Launch(Kernel::Histogram),
                Call::ReadBins(Histogram),
                Call::Zero(Cumulative),
                Call::Launch(Kernel::CumulativeScan),
                Call::ReadBins(Cumulative),
                Call::Zero(RemapTable),
                Call::Launch(Kernel::Normalize),
                Call::ReadBins(RemapTable),
                Call::Launch(Kernel::BackProject),
                Call::ReadSamples(OutputImage),
            ]
        );
    }

    #[test]
    fn test_invalid_bins_rejected_before_allocation() {
        let exec = Recording::new();
        let image = Image::filled(2, 2, 1, 0);
        let err = Pipeline::new(&exec, EqualizeConfig::with_bins(300))
            .run(&image)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidBinCount(300)));
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn test_empty_image_rejected_before_allocation() {
        let exec = Recording::new();
        let image = Image::filled(0, 4, 1, 0);
        let err = Pipeline::new(&exec, EqualizeConfig::default())
            .run(&image)
            .unwrap_err();
        assert!(matches!(err, Error::EmptyImage));
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn test_dispatch_failure_aborts_run() {
        let exec = Recording::failing(Kernel::CumulativeScan);
        let image = Image::filled(2, 2, 1, 50);
        let err = Pipeline::new(&exec, EqualizeConfig::default())
            .run(&image)
            .unwrap_err();

        assert!(matches!(err, Error::Dispatch { kernel: Kernel::CumulativeScan, .. }));
        assert_eq!(exec.launched(), vec![Kernel::Histogram, Kernel::CumulativeScan]);
        assert!(!exec.calls().contains(&Call::ReadSamples(BufferRole::OutputImage)));
    }

    #[test]
    fn test_intermediates_can_be_skipped() {
        let exec = Recording::new();
        let config = EqualizeConfig {
            read_back_intermediates: false,
            ..EqualizeConfig::default()
        };
        let image = Image::gray(2, 2, vec![0, 85, 170, 255]).unwrap();
        let result = Pipeline::new(&exec, config).run(&image).unwrap();

        assert!(result.histogram.is_empty());
        assert!(result.cumulative.is_empty());
        assert!(result.lut.is_empty());
        assert_eq!(result.output.samples(), &[64, 128, 191, 255]);
        assert!(!exec.calls().iter().any(|c| matches!(c, Call::ReadBins(_))));
    }

    #[test]
    fn test_timings_cover_every_stage() {
        let image = Image::filled(8, 8, 3, 30);
        let result = equalize(&image, 256).unwrap();
        let kernels: Vec<_> = result.timings.iter().map(|t| t.kernel).collect();
        assert_eq!(kernels, Kernel::ALL);
        assert!(result.timing(Kernel::Normalize).is_some());
        assert_eq!(result.device.kind, crate::device::DeviceKind::Cpu);
    }

    #[test]
    fn test_config_checked_before_device_selection() {
        let config = EqualizeConfig {
            backend: Backend::Gpu,
            bins: 999,
            ..EqualizeConfig::default()
        };
        let image = Image::filled(2, 2, 1, 0);
        // configuration is checked before any device is requested
        let err = equalize_with_config(&image, &config).unwrap_err();
        assert!(err.is_configuration());
    }
}
