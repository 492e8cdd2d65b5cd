//! WebAssembly exports.
//!
//! These functions are exposed to JavaScript via wasm-bindgen and always run
//! on the CPU executor. Images are flat interleaved u8 arrays of length
//! `width * height * channels`.

use wasm_bindgen::prelude::*;

use crate::image::Image;
use crate::pipeline::{equalize, Equalization};

// ============================================================================
// Helpers
// ============================================================================

fn run(data: &[u8], width: usize, height: usize, channels: usize, bins: i32) -> Result<Equalization, JsError> {
    let image = Image::from_raw(width, height, channels, data.to_vec())?;
    Ok(equalize(&image, bins as i64)?)
}

// ============================================================================
// Histogram Equalization
// ============================================================================

/// Equalize an image.
///
/// # Arguments
/// * `data` - Flat array of samples (length = width * height * channels)
/// * `width` - Image width in pixels
/// * `height` - Image height in pixels
/// * `channels` - Samples per pixel (1, 3 or 4)
/// * `bins` - Histogram bins, 0-256
///
/// # Returns
/// Flat array of equalized samples in the input layout
#[wasm_bindgen]
pub fn equalize_histogram_wasm(
    data: &[u8],
    width: usize,
    height: usize,
    channels: usize,
    bins: i32,
) -> Result<Vec<u8>, JsError> {
    Ok(run(data, width, height, channels, bins)?.output.into_raw())
}

// ============================================================================
// Histogram Only
// ============================================================================

/// Histogram of an image with `bins` bins, as computed by the first stage.
#[wasm_bindgen]
pub fn histogram_wasm(
    data: &[u8],
    width: usize,
    height: usize,
    channels: usize,
    bins: i32,
) -> Result<Vec<u32>, JsError> {
    Ok(run(data, width, height, channels, bins)?.histogram)
}
