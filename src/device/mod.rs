//! Compute executors and device memory regions.
//!
//! An [`Executor`] is the explicit execution context threaded through every
//! stage: it owns the device and command stream, allocates role-bound
//! buffers, runs the four named kernels and performs blocking transfers.
//!
//! ## Executors
//!
//! | Executor | Feature | Parallelism |
//! |----------|---------|-------------|
//! | [`cpu::CpuExecutor`] | always | rayon work-stealing pool, atomic bins |
//! | [`gpu::GpuExecutor`] | `gpu` | wgpu compute shaders (Vulkan/Metal/DX12) |
//!
//! ## Kernel entry points
//!
//! | Kernel | Entry point | Arguments |
//! |--------|-------------|-----------|
//! | Histogram | `hist_simple` | image, histogram |
//! | Cumulative scan | `hist_cum` | histogram, cumulative |
//! | Normalize | `hist_lut` | cumulative, lut |
//! | Back-projection | `back_proj` | image, lut, output |

use std::fmt;
use std::time::Duration;

use crate::error::Result;
use crate::timing::KernelProfile;

pub mod cpu;
#[cfg(feature = "gpu")]
pub mod gpu;

pub use cpu::CpuExecutor;
#[cfg(feature = "gpu")]
pub use gpu::GpuExecutor;

/// Logical role a device buffer is bound to for the whole run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferRole {
    InputImage,
    OutputImage,
    Histogram,
    Cumulative,
    RemapTable,
}

impl BufferRole {
    /// Size of one element in bytes.
    pub fn element_size(self) -> usize {
        if self.holds_samples() {
            1
        } else {
            std::mem::size_of::<u32>()
        }
    }

    /// Image buffers hold u8 samples; the others hold u32 bin values.
    pub fn holds_samples(self) -> bool {
        matches!(self, Self::InputImage | Self::OutputImage)
    }
}

impl fmt::Display for BufferRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InputImage => "input image",
            Self::OutputImage => "output image",
            Self::Histogram => "histogram",
            Self::Cumulative => "cumulative histogram",
            Self::RemapTable => "remap table",
        };
        f.write_str(name)
    }
}

/// The four entry points of the equalization program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kernel {
    Histogram,
    CumulativeScan,
    Normalize,
    BackProject,
}

impl Kernel {
    pub const ALL: [Kernel; 4] = [
        Kernel::Histogram,
        Kernel::CumulativeScan,
        Kernel::Normalize,
        Kernel::BackProject,
    ];

    pub fn entry_point(self) -> &'static str {
        match self {
            Self::Histogram => "hist_simple",
            Self::CumulativeScan => "hist_cum",
            Self::Normalize => "hist_lut",
            Self::BackProject => "back_proj",
        }
    }

    /// Human-readable stage name used in reports.
    pub fn stage_name(self) -> &'static str {
        match self {
            Self::Histogram => "Histogram",
            Self::CumulativeScan => "Cumulative Histogram",
            Self::Normalize => "LUT",
            Self::BackProject => "Back-projection",
        }
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entry_point())
    }
}

/// Scalar arguments shared by every dispatch of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelParams {
    /// Total number of samples in the image (T).
    pub sample_count: u32,
    /// Number of histogram bins (N).
    pub bins: u32,
}

/// Buffer arguments of one dispatch, in entry-point argument order.
#[derive(Debug)]
pub enum Launch<'a, B> {
    Histogram {
        image: &'a B,
        histogram: &'a B,
    },
    CumulativeScan {
        histogram: &'a B,
        cumulative: &'a B,
    },
    Normalize {
        cumulative: &'a B,
        lut: &'a B,
    },
    BackProject {
        image: &'a B,
        lut: &'a B,
        output: &'a B,
    },
}

impl<B> Launch<'_, B> {
    pub fn kernel(&self) -> Kernel {
        match self {
            Self::Histogram { .. } => Kernel::Histogram,
            Self::CumulativeScan { .. } => Kernel::CumulativeScan,
            Self::Normalize { .. } => Kernel::Normalize,
            Self::BackProject { .. } => Kernel::BackProject,
        }
    }
}

/// Data returned by a blocking read-back, with the host-observed transfer time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadBack<T> {
    pub data: Vec<T>,
    pub elapsed: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    IntegratedGpu,
    DiscreteGpu,
    VirtualGpu,
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub kind: DeviceKind,
    pub backend: String,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.backend, self.name)
    }
}

/// Execution context for the equalization pipeline.
///
/// Buffers are sized in elements of their role (`u8` samples for images,
/// `u32` values for bins). Every read-back blocks until the producing
/// dispatch has finished, which is the only ordering guarantee the
/// orchestrator relies on.
pub trait Executor {
    type Buffer;

    fn device_info(&self) -> DeviceInfo;

    /// Allocate an uninitialized buffer holding `len` elements.
    fn allocate(&self, role: BufferRole, len: usize) -> Result<Self::Buffer>;

    /// Upload image samples into a sample buffer. Returns the transfer time.
    fn write_samples(&self, buffer: &Self::Buffer, samples: &[u8]) -> Result<Duration>;

    /// Zero every element of the buffer.
    fn fill_zero(&self, buffer: &Self::Buffer) -> Result<()>;

    /// Run one kernel to completion on the device.
    fn launch(&self, params: KernelParams, launch: Launch<'_, Self::Buffer>) -> Result<KernelProfile>;

    fn read_bins(&self, buffer: &Self::Buffer) -> Result<ReadBack<u32>>;

    fn read_samples(&self, buffer: &Self::Buffer) -> Result<ReadBack<u8>>;
}

impl<E: Executor + ?Sized> Executor for &E {
    type Buffer = E::Buffer;

    fn device_info(&self) -> DeviceInfo {
        (**self).device_info()
    }

    fn allocate(&self, role: BufferRole, len: usize) -> Result<Self::Buffer> {
        (**self).allocate(role, len)
    }

    fn write_samples(&self, buffer: &Self::Buffer, samples: &[u8]) -> Result<Duration> {
        (**self).write_samples(buffer, samples)
    }

    fn fill_zero(&self, buffer: &Self::Buffer) -> Result<()> {
        (**self).fill_zero(buffer)
    }

    fn launch(&self, params: KernelParams, launch: Launch<'_, Self::Buffer>) -> Result<KernelProfile> {
        (**self).launch(params, launch)
    }

    fn read_bins(&self, buffer: &Self::Buffer) -> Result<ReadBack<u32>> {
        (**self).read_bins(buffer)
    }

    fn read_samples(&self, buffer: &Self::Buffer) -> Result<ReadBack<u8>> {
        (**self).read_samples(buffer)
    }
}
