//! Run configuration.
//!
//! Deserializable so host applications can keep it next to their own
//! settings; every field has a default.

use serde::{Deserialize, Serialize};

use crate::bins::BinCount;
use crate::error::{Error, Result};

/// Which executor a run should use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Cpu,
    Gpu,
}

/// Adapter preference for the GPU executor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerPreference {
    LowPower,
    #[default]
    HighPerformance,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EqualizeConfig {
    /// Histogram resolution, 0-256.
    pub bins: i64,
    pub backend: Backend,
    /// Read back histogram, cumulative histogram and LUT for reporting.
    pub read_back_intermediates: bool,
    /// Give up on a blocking read-back after this many milliseconds (GPU only).
    pub readback_timeout_ms: Option<u64>,
    pub power_preference: PowerPreference,
    /// Request device timestamp queries when the adapter supports them.
    pub profiling: bool,
}

impl Default for EqualizeConfig {
    fn default() -> Self {
        Self {
            bins: BinCount::FULL.get() as i64,
            backend: Backend::Cpu,
            read_back_intermediates: true,
            readback_timeout_ms: None,
            power_preference: PowerPreference::HighPerformance,
            profiling: true,
        }
    }
}

impl EqualizeConfig {
    pub fn with_bins(bins: i64) -> Self {
        Self {
            bins,
            ..Self::default()
        }
    }

    /// Check every field; returns the validated bin count.
    pub fn validate(&self) -> Result<BinCount> {
        let bins = BinCount::new(self.bins)?;
        if self.readback_timeout_ms == Some(0) {
            return Err(Error::InvalidConfig(
                "readback_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(bins)
    }
}
