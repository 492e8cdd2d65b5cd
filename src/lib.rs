//! Histogram equalization as a four-stage data-parallel pipeline.
//!
//! An 8-bit image is equalized by four kernels run in order on one
//! [`device::Executor`]:
//!
//! 1. `hist_simple` counts samples into N bins (0 <= N <= 256)
//! 2. `hist_cum` turns the histogram into an inclusive cumulative histogram
//! 3. `hist_lut` scales the cumulative histogram into a remap table
//! 4. `back_proj` maps every sample through the table
//!
//! ## Image Format
//! Images are `(height, width, channels)` u8 arrays:
//! - **Grayscale**: (height, width, 1)
//! - **RGB**: (height, width, 3)
//! - **RGBA**: (height, width, 4)
//!
//! All channels share one histogram; the sample total T counts every channel.
//!
//! ## Executors
//! The CPU executor (rayon) is always available. The `gpu` feature adds a
//! wgpu executor producing bit-identical results.
//!
//! ```no_run
//! use histeq_rust::{equalize, Image};
//!
//! let image = Image::gray(2, 2, vec![0, 85, 170, 255])?;
//! let result = equalize(&image, 256)?;
//! assert_eq!(result.output.samples(), &[64, 128, 191, 255]);
//! println!("{}", result.report());
//! # Ok::<(), histeq_rust::Error>(())
//! ```

pub mod bins;
pub mod config;
pub mod device;
pub mod error;
pub mod image;
pub mod pipeline;
pub mod report;
pub mod stages;
pub mod timing;

#[cfg(feature = "wasm")]
pub mod wasm;

pub use bins::{bin_index, BinCount, INTENSITY_LEVELS};
pub use config::{Backend, EqualizeConfig, PowerPreference};
pub use device::{CpuExecutor, DeviceInfo, DeviceKind, Executor, Kernel};
#[cfg(feature = "gpu")]
pub use device::GpuExecutor;
pub use error::{Error, Result};
pub use image::Image;
pub use pipeline::{equalize, equalize_with_config, Equalization, Pipeline, PipelineState};
pub use report::Report;
pub use timing::{KernelProfile, ProfilingResolution, StageTiming};

// Python bindings (only when python feature is enabled)
#[cfg(feature = "python")]
mod python {
    use numpy::{IntoPyArray, PyArray1, PyArray3, PyReadonlyArray3};
    use pyo3::exceptions::{PyRuntimeError, PyValueError};
    use pyo3::prelude::*;

    use crate::config::{Backend, EqualizeConfig};
    use crate::error::Error;
    use crate::image::Image;
    use crate::pipeline::{equalize_with_config, Equalization};

    // ========================================================================
    // Helpers
    // ========================================================================

    type Arrays<'py> = (
        Bound<'py, PyArray3<u8>>,
        Bound<'py, PyArray1<u32>>,
        Bound<'py, PyArray1<u32>>,
        Bound<'py, PyArray1<u32>>,
    );

    fn to_py_err(e: Error) -> PyErr {
        if e.is_configuration() {
            PyValueError::new_err(e.to_string())
        } else {
            PyRuntimeError::new_err(e.to_string())
        }
    }

    fn run(py: Python<'_>, image: PyReadonlyArray3<'_, u8>, bins: i64, backend: &str) -> PyResult<Equalization> {
        let backend = match backend {
            "cpu" => Backend::Cpu,
            "gpu" => Backend::Gpu,
            other => {
                return Err(PyValueError::new_err(format!(
                    "backend must be 'cpu' or 'gpu', got '{other}'"
                )))
            }
        };
        let config = EqualizeConfig {
            bins,
            backend,
            ..EqualizeConfig::default()
        };
        let image = Image::from_view(image.as_array());
        py.allow_threads(|| equalize_with_config(&image, &config))
            .map_err(to_py_err)
    }

    // ========================================================================
    // Histogram Equalization
    // ========================================================================

    /// Equalize a (height, width, channels) u8 image.
    ///
    /// Returns `(output, histogram, cumulative, lut)`.
    #[pyfunction]
    #[pyo3(signature = (image, bins = 256, backend = "cpu"))]
    pub fn equalize_histogram<'py>(
        py: Python<'py>,
        image: PyReadonlyArray3<'py, u8>,
        bins: i64,
        backend: &str,
    ) -> PyResult<Arrays<'py>> {
        let result = run(py, image, bins, backend)?;
        Ok((
            result.output.into_array().into_pyarray(py),
            result.histogram.into_pyarray(py),
            result.cumulative.into_pyarray(py),
            result.lut.into_pyarray(py),
        ))
    }

    /// Equalize and return the text report instead of the arrays.
    #[pyfunction]
    #[pyo3(signature = (image, bins = 256, backend = "cpu"))]
    pub fn equalize_histogram_report<'py>(
        py: Python<'py>,
        image: PyReadonlyArray3<'py, u8>,
        bins: i64,
        backend: &str,
    ) -> PyResult<String> {
        let result = run(py, image, bins, backend)?;
        Ok(result.report().to_string())
    }

    // ========================================================================
    // Module
    // ========================================================================

    #[pymodule]
    pub fn histeq_rust(m: &Bound<'_, PyModule>) -> PyResult<()> {
        m.add_function(wrap_pyfunction!(equalize_histogram, m)?)?;
        m.add_function(wrap_pyfunction!(equalize_histogram_report, m)?)?;
        Ok(())
    }
}
