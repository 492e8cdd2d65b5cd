//! Image model for the equalization pipeline.
//!
//! Images are `(height, width, channels)` arrays of u8 samples, the same
//! layout the rest of the crate's bindings use:
//! - **Grayscale**: (height, width, 1)
//! - **RGB**: (height, width, 3)
//! - **RGBA**: (height, width, 4)
//!
//! Every sample is equalized independently of its channel, so a colour image
//! is treated as one pool of intensities.

use ndarray::{Array3, ArrayView3};

use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Image {
    data: Array3<u8>,
}

impl Image {
    /// Wrap an array, forcing standard (row-major, contiguous) layout.
    pub fn from_array(data: Array3<u8>) -> Self {
        let data = if data.is_standard_layout() {
            data
        } else {
            data.as_standard_layout().into_owned()
        };
        Self { data }
    }

    pub fn from_view(view: ArrayView3<u8>) -> Self {
        Self {
            data: view.as_standard_layout().into_owned(),
        }
    }

    /// Build an image from interleaved samples.
    pub fn from_raw(width: usize, height: usize, channels: usize, samples: Vec<u8>) -> Result<Self> {
        let len = samples.len();
        let data = Array3::from_shape_vec((height, width, channels), samples).map_err(|_| {
            Error::InvalidShape {
                width,
                height,
                channels,
                len,
            }
        })?;
        Ok(Self { data })
    }

    pub fn gray(width: usize, height: usize, samples: Vec<u8>) -> Result<Self> {
        Self::from_raw(width, height, 1, samples)
    }

    /// Image filled with a single value.
    pub fn filled(width: usize, height: usize, channels: usize, value: u8) -> Self {
        Self {
            data: Array3::from_elem((height, width, channels), value),
        }
    }

    pub fn width(&self) -> usize {
        self.data.dim().1
    }

    pub fn height(&self) -> usize {
        self.data.dim().0
    }

    pub fn channels(&self) -> usize {
        self.data.dim().2
    }

    /// Total number of samples (width x height x channels).
    pub fn sample_count(&self) -> usize {
        self.data.len()
    }

    /// Size of the image in bytes, one byte per sample.
    pub fn byte_size(&self) -> usize {
        self.sample_count()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn same_shape(&self, other: &Image) -> bool {
        self.data.dim() == other.data.dim()
    }

    pub fn samples(&self) -> &[u8] {
        // from_array/from_raw guarantee standard layout
        self.data
            .as_slice()
            .expect("image data is kept in standard layout")
    }

    pub fn view(&self) -> ArrayView3<'_, u8> {
        self.data.view()
    }

    pub fn as_array(&self) -> &Array3<u8> {
        &self.data
    }

    pub fn into_array(self) -> Array3<u8> {
        self.data
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.data.into_raw_vec_and_offset().0
    }
}
