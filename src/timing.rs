//! Per-dispatch profiling records.
//!
//! Each kernel launch returns a [`KernelProfile`] alongside its effect, the
//! same four timestamps an accelerator event reports (queued, submitted,
//! started, ended). Nothing here is shared mutable state: profiles travel with
//! the dispatch result and are collected by the orchestrator.

use std::fmt;
use std::time::Duration;

use crate::device::Kernel;

/// Event timestamps of one kernel dispatch, relative to when it was queued.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelProfile {
    pub submitted: Duration,
    pub started: Duration,
    pub ended: Duration,
}

impl KernelProfile {
    /// Build a profile from offsets, clamping so the sequence never runs backwards.
    pub fn from_offsets(submitted: Duration, started: Duration, ended: Duration) -> Self {
        let started = started.max(submitted);
        let ended = ended.max(started);
        Self {
            submitted,
            started,
            ended,
        }
    }

    /// Time spent in the queue before submission.
    pub fn queue_time(&self) -> Duration {
        self.submitted
    }

    /// Time between submission and the kernel starting.
    pub fn submit_time(&self) -> Duration {
        self.started - self.submitted
    }

    /// Device execution time of the kernel.
    pub fn execution(&self) -> Duration {
        self.ended - self.started
    }

    pub fn execution_ns(&self) -> u128 {
        self.execution().as_nanos()
    }

    /// Queued to ended.
    pub fn total(&self) -> Duration {
        self.ended
    }

    pub fn display(&self, resolution: ProfilingResolution) -> FullProfile<'_> {
        FullProfile {
            profile: self,
            resolution,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProfilingResolution {
    Ns,
    #[default]
    Us,
    Ms,
    S,
}

impl ProfilingResolution {
    fn divisor(self) -> u128 {
        match self {
            Self::Ns => 1,
            Self::Us => 1_000,
            Self::Ms => 1_000_000,
            Self::S => 1_000_000_000,
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Self::Ns => "ns",
            Self::Us => "us",
            Self::Ms => "ms",
            Self::S => "s",
        }
    }

    pub fn scale(self, d: Duration) -> u128 {
        d.as_nanos() / self.divisor()
    }
}

/// "Queued .., Submitted .., Executed .., Total .. [us]"
pub struct FullProfile<'a> {
    profile: &'a KernelProfile,
    resolution: ProfilingResolution,
}

impl fmt::Display for FullProfile<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = self.resolution;
        let p = self.profile;
        write!(
            f,
            "Queued {}, Submitted {}, Executed {}, Total {} [{}]",
            r.scale(p.queue_time()),
            r.scale(p.submit_time()),
            r.scale(p.execution()),
            r.scale(p.total()),
            r.unit()
        )
    }
}

/// Timing record for one pipeline stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageTiming {
    pub kernel: Kernel,
    pub profile: KernelProfile,
    /// Host-observed duration of the blocking read-back that follows the dispatch.
    pub transfer: Duration,
}

impl StageTiming {
    pub fn execution_ns(&self) -> u128 {
        self.profile.execution_ns()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_are_monotonic() {
        let p = KernelProfile::from_offsets(
            Duration::from_nanos(500),
            Duration::from_nanos(200),
            Duration::from_nanos(100),
        );
        assert_eq!(p.started, p.submitted);
        assert_eq!(p.ended, p.started);
        assert_eq!(p.execution(), Duration::ZERO);
    }

    #[test]
    fn test_full_profile_format() {
        let p = KernelProfile::from_offsets(
            Duration::from_micros(3),
            Duration::from_micros(10),
            Duration::from_micros(52),
        );
        assert_eq!(
            p.display(ProfilingResolution::Us).to_string(),
            "Queued 3, Submitted 7, Executed 42, Total 52 [us]"
        );
        assert_eq!(p.execution_ns(), 42_000);
    }
}
