//! Back-projector (`back_proj`): apply the remap table to every sample.
//!
//! Uses the same bucketing as the histogram so each sample resolves to a
//! valid table index. Each output sample has exactly one writer.

use std::sync::atomic::{AtomicU32, Ordering};

use rayon::prelude::*;
use tracing::trace;

use crate::bins::bin_index;
use crate::device::{Executor, KernelParams, Launch};
use crate::error::Result;
use crate::timing::KernelProfile;

/// Kernel body: `output[p] = lut[bin(input[p])]`.
///
/// An empty table writes zeros.
pub fn project(input: &[u8], lut: &[AtomicU32], output: &mut [u8]) {
    let bins = lut.len() as u32;
    if bins == 0 {
        output.par_iter_mut().for_each(|o| *o = 0);
        return;
    }

    output
        .par_iter_mut()
        .zip(input.par_iter())
        .for_each(|(o, &v)| {
            *o = lut[bin_index(v, bins)].load(Ordering::Relaxed).min(255) as u8;
        });
}

/// Dispatch `back_proj(image, lut, output)`.
pub fn back_project<E: Executor>(
    exec: &E,
    params: KernelParams,
    image: &E::Buffer,
    lut: &E::Buffer,
    output: &E::Buffer,
) -> Result<KernelProfile> {
    let profile = exec.launch(params, Launch::BackProject { image, lut, output })?;
    trace!(
        samples = params.sample_count,
        ns = profile.execution_ns() as u64,
        "back-projection done"
    );
    Ok(profile)
}
