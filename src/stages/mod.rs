//! The four equalization stages.
//!
//! Each stage module holds two things:
//! - the kernel body in host form, operating on atomic bin storage and
//!   sample slices (run by [`crate::device::CpuExecutor`] and used as the
//!   reference the GPU shaders must agree with)
//! - a typed stage function that dispatches the kernel on any
//!   [`crate::device::Executor`] and returns its profile
//!
//! Stages run in the fixed order histogram, cumulative scan, normalize,
//! back-projection. Each consumes only buffers written by earlier stages
//! plus the read-only input image.

pub mod back_project;
pub mod histogram;
pub mod normalize;
pub mod scan;

pub use back_project::back_project;
pub use histogram::build_histogram;
pub use normalize::build_remap_table;
pub use scan::cumulative_scan;

#[cfg(test)]
pub(crate) fn atomics(values: &[u32]) -> Vec<std::sync::atomic::AtomicU32> {
    values
        .iter()
        .map(|&v| std::sync::atomic::AtomicU32::new(v))
        .collect()
}

#[cfg(test)]
pub(crate) fn load_all(values: &[std::sync::atomic::AtomicU32]) -> Vec<u32> {
    values
        .iter()
        .map(|v| v.load(std::sync::atomic::Ordering::Relaxed))
        .collect()
}
