//! Error taxonomy for a single equalization run.
//!
//! Every error is terminal: the orchestrator never retries and never returns
//! partially computed histogram, LUT or output data.

use crate::device::{BufferRole, Kernel};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Configuration errors, raised before any device resource exists.
    #[error("Bin count {0} is outside the supported range 0-256")]
    InvalidBinCount(i64),

    #[error("Image contains no samples")]
    EmptyImage,

    #[error("Image has {0} samples, more than a 32-bit histogram can count")]
    ImageTooLarge(usize),

    #[error("Sample buffer of length {len} does not match {width}x{height}x{channels}")]
    InvalidShape {
        width: usize,
        height: usize,
        channels: usize,
        len: usize,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Compute program errors.
    #[error("Failed to build compute program for `{entry_point}`: {log}")]
    ProgramBuild { entry_point: String, log: String },

    // Device / runtime errors.
    #[error("No compute device available: {0}")]
    DeviceUnavailable(String),

    #[error("Failed to allocate {bytes} bytes for the {role} buffer: {reason}")]
    Allocation {
        role: BufferRole,
        bytes: u64,
        reason: String,
    },

    #[error("Dispatch of `{kernel}` failed: {reason}")]
    Dispatch { kernel: Kernel, reason: String },

    #[error("Transfer of the {role} buffer failed: {reason}")]
    Transfer { role: BufferRole, reason: String },

    #[error("Read-back of the {role} buffer timed out after {timeout_ms} ms")]
    ReadbackTimeout { role: BufferRole, timeout_ms: u64 },
}

impl Error {
    /// True for errors raised while validating inputs, before allocation.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidBinCount(_)
                | Self::EmptyImage
                | Self::ImageTooLarge(_)
                | Self::InvalidShape { .. }
                | Self::InvalidConfig(_)
        )
    }

    pub fn dispatch(kernel: Kernel, reason: impl Into<String>) -> Self {
        Self::Dispatch {
            kernel,
            reason: reason.into(),
        }
    }

    pub fn transfer(role: BufferRole, reason: impl Into<String>) -> Self {
        Self::Transfer {
            role,
            reason: reason.into(),
        }
    }
}
