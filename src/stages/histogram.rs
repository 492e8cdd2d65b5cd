//! Histogram builder (`hist_simple`).
//!
//! Every sample adds one to its bin. Samples are processed concurrently, so
//! increments to a shared bin are atomic read-modify-writes; addition is
//! commutative, so the result does not depend on execution order.

use std::sync::atomic::{AtomicU32, Ordering};

use rayon::prelude::*;
use tracing::trace;

use crate::bins::bin_index;
use crate::device::{Executor, KernelParams, Launch};
use crate::error::Result;
use crate::timing::KernelProfile;

/// Kernel body: accumulate `samples` into a zeroed `histogram`.
///
/// The bin count is the histogram length. An empty histogram is a no-op.
pub fn accumulate(samples: &[u8], histogram: &[AtomicU32]) {
    let bins = histogram.len() as u32;
    if bins == 0 {
        return;
    }

    samples.par_iter().for_each(|&v| {
        histogram[bin_index(v, bins)].fetch_add(1, Ordering::Relaxed);
    });
}

/// Dispatch `hist_simple(image, histogram)`.
pub fn build_histogram<E: Executor>(
    exec: &E,
    params: KernelParams,
    image: &E::Buffer,
    histogram: &E::Buffer,
) -> Result<KernelProfile> {
    let profile = exec.launch(params, Launch::Histogram { image, histogram })?;
    trace!(
        samples = params.sample_count,
        bins = params.bins,
        ns = profile.execution_ns() as u64,
        "histogram built"
    );
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{atomics, load_all};

    #[test]
    fn test_counts_every_sample() {
        let samples = [0u8, 85, 170, 255, 85];
        let hist = atomics(&[0; 256]);
        accumulate(&samples, &hist);
        let hist = load_all(&hist);

        assert_eq!(hist[0], 1);
        assert_eq!(hist[85], 2);
        assert_eq!(hist[170], 1);
        assert_eq!(hist[255], 1);
        assert_eq!(hist.iter().sum::<u32>(), 5);
    }

    #[test]
    fn test_zero_bins_is_noop() {
        let hist: Vec<AtomicU32> = Vec::new();
        accumulate(&[1, 2, 3], &hist);
        assert!(hist.is_empty());
    }

    #[test]
    fn test_coarse_bins_conserve_samples() {
        let samples: Vec<u8> = (0..=255).collect();
        let hist = atomics(&[0; 4]);
        accumulate(&samples, &hist);
        assert_eq!(load_all(&hist), vec![64, 64, 64, 64]);
    }

    #[test]
    fn test_contended_bin_loses_no_updates() {
        let samples = vec![100u8; 1 << 18];
        let hist = atomics(&[0; 256]);
        accumulate(&samples, &hist);
        assert_eq!(hist[100].load(Ordering::Relaxed), 1 << 18);
    }
}
