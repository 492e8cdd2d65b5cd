//! Cumulative scan (`hist_cum`).
//!
//! Host form is a serial inclusive prefix sum over at most 256 bins. Counts
//! saturate at `u32::MAX`.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::trace;

use crate::device::{Executor, KernelParams, Launch};
use crate::error::Result;
use crate::timing::KernelProfile;

/// Kernel body: `cumulative[i] = histogram[0] + ... + histogram[i]`.
///
/// Writes `min(histogram.len(), cumulative.len())` entries.
pub fn inclusive_scan(histogram: &[AtomicU32], cumulative: &[AtomicU32]) {
    let mut running = 0u32;
    for (count, out) in histogram.iter().zip(cumulative) {
        running = running.saturating_add(count.load(Ordering::Relaxed));
        out.store(running, Ordering::Relaxed);
    }
}

/// Dispatch `hist_cum(histogram, cumulative)`.
pub fn cumulative_scan<E: Executor>(
    exec: &E,
    params: KernelParams,
    histogram: &E::Buffer,
    cumulative: &E::Buffer,
) -> Result<KernelProfile> {
    let profile = exec.launch(
        params,
        Launch::CumulativeScan {
            histogram,
            cumulative,
        },
    )?;
    trace!(bins = params.bins, ns = profile.execution_ns() as u64, "cumulative scan done");
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{atomics, load_all};

    #[test]
    fn test_running_total() {
        let hist = atomics(&[1, 0, 2, 5]);
        let cum = atomics(&[0; 4]);
        inclusive_scan(&hist, &cum);
        assert_eq!(load_all(&cum), vec![1, 1, 3, 8]);
    }

    #[test]
    fn test_single_bin_unchanged() {
        let hist = atomics(&[42]);
        let cum = atomics(&[0]);
        inclusive_scan(&hist, &cum);
        assert_eq!(load_all(&cum), vec![42]);
    }

    #[test]
    fn test_empty() {
        let cum: Vec<AtomicU32> = Vec::new();
        inclusive_scan(&[], &cum);
        assert!(cum.is_empty());
    }
}
