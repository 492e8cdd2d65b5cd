//! Bin count and the intensity bucketing shared by histogram and back-projection.
//!
//! ## Bucketing
//!
//! A sample `v` (0-255) lands in bin `v * N / 256` (integer floor):
//! - `N = 256`: identity, one bin per intensity
//! - `N = 128`: intensities 0-1 share bin 0, 2-3 share bin 1, ...
//! - `N = 1`: every sample lands in bin 0
//!
//! The result is always `< N`, so every sample resolves to a valid table
//! index and the histogram always sums to the sample count.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Number of distinct 8-bit intensities.
pub const INTENSITY_LEVELS: u32 = 256;

/// Validated histogram resolution in `0..=256`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u32")]
pub struct BinCount(u32);

impl BinCount {
    pub const FULL: BinCount = BinCount(INTENSITY_LEVELS);
    pub const ZERO: BinCount = BinCount(0);

    pub fn new(bins: i64) -> Result<Self> {
        if (0..=INTENSITY_LEVELS as i64).contains(&bins) {
            Ok(Self(bins as u32))
        } else {
            Err(Error::InvalidBinCount(bins))
        }
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn len(self) -> usize {
        self.0 as usize
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for BinCount {
    fn default() -> Self {
        Self::FULL
    }
}

impl TryFrom<i64> for BinCount {
    type Error = Error;

    fn try_from(bins: i64) -> Result<Self> {
        Self::new(bins)
    }
}

impl From<BinCount> for u32 {
    fn from(bins: BinCount) -> u32 {
        bins.0
    }
}

impl std::fmt::Display for BinCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Map a sample to its bin. Callers must not pass `bins == 0`.
#[inline]
pub fn bin_index(sample: u8, bins: u32) -> usize {
    debug_assert!(bins > 0 && bins <= INTENSITY_LEVELS);
    (sample as u32 * bins / INTENSITY_LEVELS) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_count_range() {
        assert_eq!(BinCount::new(0).unwrap().get(), 0);
        assert_eq!(BinCount::new(256).unwrap(), BinCount::FULL);
        assert!(matches!(BinCount::new(257), Err(Error::InvalidBinCount(257))));
        assert!(matches!(BinCount::new(-1), Err(Error::InvalidBinCount(-1))));
    }

    #[test]
    fn test_full_resolution_is_identity() {
        for v in 0..=255u8 {
            assert_eq!(bin_index(v, 256), v as usize);
        }
    }

    #[test]
    fn test_bucketing_stays_in_range() {
        for bins in 1..=256u32 {
            assert_eq!(bin_index(0, bins), 0);
            assert_eq!(bin_index(255, bins), bins as usize - 1);
        }
    }

    #[test]
    fn test_half_resolution_pairs_intensities() {
        assert_eq!(bin_index(0, 128), 0);
        assert_eq!(bin_index(1, 128), 0);
        assert_eq!(bin_index(2, 128), 1);
        assert_eq!(bin_index(255, 128), 127);
    }

    #[test]
    fn test_serde_rejects_out_of_range() {
        let bins: BinCount = serde_json::from_str("64").unwrap();
        assert_eq!(bins.get(), 64);
        assert!(serde_json::from_str::<BinCount>("512").is_err());
        assert_eq!(serde_json::to_string(&bins).unwrap(), "64");
    }
}
