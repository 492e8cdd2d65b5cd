//! Normalizer (`hist_lut`): cumulative histogram to remap table.
//!
//! `lut[i] = round(cum[i] * 255 / T)`, rounding half up in 64-bit integer
//! arithmetic. Integer rounding of a non-decreasing input is non-decreasing,
//! so the table preserves intensity order. `T = 0` yields an all-zero table.

use std::sync::atomic::{AtomicU32, Ordering};

use rayon::prelude::*;
use tracing::trace;

use crate::device::{Executor, KernelParams, Launch};
use crate::error::Result;
use crate::timing::KernelProfile;

/// Highest output intensity.
pub const MAX_INTENSITY: u32 = 255;

/// Scale one cumulative count into `[0, 255]`.
#[inline]
pub fn remap_entry(cumulative: u32, total: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    let total = total as u64;
    let scaled = (cumulative as u64 * MAX_INTENSITY as u64 + total / 2) / total;
    scaled.min(MAX_INTENSITY as u64) as u32
}

/// Kernel body: fill `lut` from `cumulative` for an image of `total` samples.
pub fn fill_remap_table(cumulative: &[AtomicU32], lut: &[AtomicU32], total: u32) {
    cumulative
        .par_iter()
        .zip(lut.par_iter())
        .for_each(|(cum, out)| {
            out.store(remap_entry(cum.load(Ordering::Relaxed), total), Ordering::Relaxed);
        });
}

/// Dispatch `hist_lut(cumulative, lut)`.
pub fn build_remap_table<E: Executor>(
    exec: &E,
    params: KernelParams,
    cumulative: &E::Buffer,
    lut: &E::Buffer,
) -> Result<KernelProfile> {
    let profile = exec.launch(params, Launch::Normalize { cumulative, lut })?;
    trace!(bins = params.bins, ns = profile.execution_ns() as u64, "remap table built");
    Ok(profile)
}
