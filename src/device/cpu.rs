//! Multi-core CPU executor backed by rayon.
//!
//! Bin buffers are arrays of `AtomicU32`, so the histogram kernel performs
//! the same contended atomic adds a GPU would. Sample buffers sit behind a
//! `RwLock`: the input image is read by two stages, the output image is
//! written by one.
//!
//! Dispatches run to completion before `launch` returns, so read-backs never
//! wait.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use tracing::debug;

use super::{BufferRole, DeviceInfo, DeviceKind, Executor, Kernel, KernelParams, Launch, ReadBack};
use crate::error::{Error, Result};
use crate::stages::{back_project, histogram, normalize, scan};
use crate::timing::KernelProfile;

enum Storage {
    Samples(RwLock<Vec<u8>>),
    Bins(Box<[AtomicU32]>),
}

/// Host-memory region bound to one role.
pub struct CpuBuffer {
    role: BufferRole,
    storage: Storage,
}

impl CpuBuffer {
    pub fn role(&self) -> BufferRole {
        self.role
    }

    pub fn len(&self) -> usize {
        match &self.storage {
            Storage::Samples(s) => s.read().map(|s| s.len()).unwrap_or(0),
            Storage::Bins(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn samples(&self, kernel: Kernel) -> Result<RwLockReadGuard<'_, Vec<u8>>> {
        match &self.storage {
            Storage::Samples(s) => s
                .read()
                .map_err(|_| Error::dispatch(kernel, format!("{} buffer is poisoned", self.role))),
            Storage::Bins(_) => Err(self.wrong_kind(kernel)),
        }
    }

    fn samples_mut(&self, kernel: Kernel) -> Result<RwLockWriteGuard<'_, Vec<u8>>> {
        match &self.storage {
            Storage::Samples(s) => s
                .write()
                .map_err(|_| Error::dispatch(kernel, format!("{} buffer is poisoned", self.role))),
            Storage::Bins(_) => Err(self.wrong_kind(kernel)),
        }
    }

    fn bins(&self, kernel: Kernel) -> Result<&[AtomicU32]> {
        match &self.storage {
            Storage::Bins(b) => Ok(b),
            Storage::Samples(_) => Err(self.wrong_kind(kernel)),
        }
    }

    fn wrong_kind(&self, kernel: Kernel) -> Error {
        Error::dispatch(
            kernel,
            format!("{} buffer bound to an argument of the wrong element type", self.role),
        )
    }
}

impl std::fmt::Debug for CpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuBuffer")
            .field("role", &self.role)
            .field("len", &self.len())
            .finish()
    }
}

/// Executor running every kernel on a rayon thread pool.
pub struct CpuExecutor {
    pool: Option<rayon::ThreadPool>,
}

impl CpuExecutor {
    /// Use rayon's global pool.
    pub fn new() -> Self {
        Self { pool: None }
    }

    /// Use a dedicated pool with `threads` workers.
    pub fn with_threads(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("histeq-cpu-{i}"))
            .build()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;
        Ok(Self { pool: Some(pool) })
    }

    pub fn threads(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }

    fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    fn run(&self, params: KernelParams, launch: Launch<'_, CpuBuffer>) -> Result<()> {
        let kernel = launch.kernel();
        match launch {
            Launch::Histogram {
                image,
                histogram: counts,
            } => {
                let guard = image.samples(kernel)?;
                let samples: &[u8] = &guard;
                let bins = counts.bins(kernel)?;
                check_bins(kernel, bins, params.bins)?;
                self.install(|| histogram::accumulate(samples, bins));
            }
            Launch::CumulativeScan {
                histogram: counts,
                cumulative,
            } => {
                let hist = counts.bins(kernel)?;
                let cum = cumulative.bins(kernel)?;
                check_bins(kernel, hist, params.bins)?;
                check_bins(kernel, cum, params.bins)?;
                scan::inclusive_scan(hist, cum);
            }
            Launch::Normalize { cumulative, lut } => {
                let cum = cumulative.bins(kernel)?;
                let table = lut.bins(kernel)?;
                check_bins(kernel, cum, params.bins)?;
                check_bins(kernel, table, params.bins)?;
                self.install(|| normalize::fill_remap_table(cum, table, params.sample_count));
            }
            Launch::BackProject { image, lut, output } => {
                if std::ptr::eq(image, output) {
                    return Err(Error::dispatch(kernel, "output buffer aliases the input image"));
                }
                let input_guard = image.samples(kernel)?;
                let input: &[u8] = &input_guard;
                let table = lut.bins(kernel)?;
                check_bins(kernel, table, params.bins)?;
                let mut out_guard = output.samples_mut(kernel)?;
                let out: &mut [u8] = &mut out_guard;
                if out.len() != input.len() {
                    return Err(Error::dispatch(
                        kernel,
                        format!(
                            "output holds {} samples but input holds {}",
                            out.len(),
                            input.len()
                        ),
                    ));
                }
                self.install(|| back_project::project(input, table, out));
            }
        }
        Ok(())
    }
}

impl Default for CpuExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn check_bins(kernel: Kernel, buffer: &[AtomicU32], bins: u32) -> Result<()> {
    if buffer.len() == bins as usize {
        Ok(())
    } else {
        Err(Error::dispatch(
            kernel,
            format!("bin buffer holds {} entries, expected {bins}", buffer.len()),
        ))
    }
}

impl Executor for CpuExecutor {
    type Buffer = CpuBuffer;

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            name: format!("{} worker threads", self.threads()),
            kind: DeviceKind::Cpu,
            backend: "rayon".to_string(),
        }
    }

    fn allocate(&self, role: BufferRole, len: usize) -> Result<CpuBuffer> {
        let bytes = (len * role.element_size()) as u64;
        let alloc_err = |e: std::collections::TryReserveError| Error::Allocation {
            role,
            bytes,
            reason: e.to_string(),
        };

        let storage = if role.holds_samples() {
            let mut samples = Vec::new();
            samples.try_reserve_exact(len).map_err(alloc_err)?;
            samples.resize(len, 0u8);
            Storage::Samples(RwLock::new(samples))
        } else {
            let mut bins = Vec::new();
            bins.try_reserve_exact(len).map_err(alloc_err)?;
            bins.extend((0..len).map(|_| AtomicU32::new(0)));
            Storage::Bins(bins.into_boxed_slice())
        };

        debug!(%role, len, bytes, "allocated host buffer");
        Ok(CpuBuffer { role, storage })
    }

    fn write_samples(&self, buffer: &CpuBuffer, samples: &[u8]) -> Result<Duration> {
        let start = Instant::now();
        let Storage::Samples(lock) = &buffer.storage else {
            return Err(Error::transfer(buffer.role, "not a sample buffer"));
        };
        let mut dst = lock
            .write()
            .map_err(|_| Error::transfer(buffer.role, "buffer is poisoned"))?;
        if dst.len() != samples.len() {
            return Err(Error::transfer(
                buffer.role,
                format!("buffer holds {} samples, got {}", dst.len(), samples.len()),
            ));
        }
        dst.copy_from_slice(samples);
        Ok(start.elapsed())
    }

    fn fill_zero(&self, buffer: &CpuBuffer) -> Result<()> {
        match &buffer.storage {
            Storage::Samples(lock) => {
                let mut dst = lock
                    .write()
                    .map_err(|_| Error::transfer(buffer.role, "buffer is poisoned"))?;
                dst.fill(0);
            }
            Storage::Bins(bins) => {
                self.install(|| bins.par_iter().for_each(|b| b.store(0, Ordering::Relaxed)));
            }
        }
        Ok(())
    }

    fn launch(&self, params: KernelParams, launch: Launch<'_, CpuBuffer>) -> Result<KernelProfile> {
        let queued = Instant::now();
        let submitted = queued.elapsed();
        let started = queued.elapsed();
        self.run(params, launch)?;
        let ended = queued.elapsed();
        Ok(KernelProfile::from_offsets(submitted, started, ended))
    }

    fn read_bins(&self, buffer: &CpuBuffer) -> Result<ReadBack<u32>> {
        let start = Instant::now();
        let Storage::Bins(bins) = &buffer.storage else {
            return Err(Error::transfer(buffer.role, "not a bin buffer"));
        };
        let data = bins.iter().map(|b| b.load(Ordering::Relaxed)).collect();
        Ok(ReadBack {
            data,
            elapsed: start.elapsed(),
        })
    }

    fn read_samples(&self, buffer: &CpuBuffer) -> Result<ReadBack<u8>> {
        let start = Instant::now();
        let Storage::Samples(lock) = &buffer.storage else {
            return Err(Error::transfer(buffer.role, "not a sample buffer"));
        };
        let data = lock
            .read()
            .map_err(|_| Error::transfer(buffer.role, "buffer is poisoned"))?
            .clone();
        Ok(ReadBack {
            data,
            elapsed: start.elapsed(),
        })
    }
}
