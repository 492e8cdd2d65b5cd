//! Human-readable run report.

use std::fmt;

use crate::device::Kernel;
use crate::pipeline::Equalization;
use crate::timing::ProfilingResolution;

/// Formats an [`Equalization`] as a plain-text report.
///
/// ```text
/// Running on rayon, 8 worker threads
///
/// Histogram: [0, 3, 1, ...]
/// Histogram kernel execution time [ns]: 10500
/// Histogram profile: Queued 0, Submitted 0, Executed 10, Total 10 [us]
/// ```
pub struct Report<'a> {
    result: &'a Equalization,
    resolution: ProfilingResolution,
}

impl<'a> Report<'a> {
    pub fn new(result: &'a Equalization) -> Self {
        Self {
            result,
            resolution: ProfilingResolution::default(),
        }
    }

    pub fn with_resolution(mut self, resolution: ProfilingResolution) -> Self {
        self.resolution = resolution;
        self
    }

    fn values(&self, kernel: Kernel) -> Option<(&'static str, &'a [u32])> {
        let r = self.result;
        match kernel {
            Kernel::Histogram => Some(("Histogram", r.histogram.as_slice())),
            Kernel::CumulativeScan => Some(("Cumulative Histogram", r.cumulative.as_slice())),
            Kernel::Normalize => Some(("Look-up table (LUT)", r.lut.as_slice())),
            Kernel::BackProject => None,
        }
    }
}

struct Bracketed<'a>(&'a [u32]);

impl fmt::Display for Bracketed<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v}")?;
        }
        f.write_str("]")
    }
}

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = self.result;
        writeln!(f, "Running on {}", r.device)?;
        writeln!(
            f,
            "Image: {}x{}x{}, {} bins",
            r.output.width(),
            r.output.height(),
            r.output.channels(),
            r.bins
        )?;
        writeln!(
            f,
            "Input upload [{}]: {}",
            self.resolution.unit(),
            self.resolution.scale(r.upload)
        )?;

        for timing in &r.timings {
            let stage = timing.kernel.stage_name();
            writeln!(f)?;
            if let Some((label, values)) = self.values(timing.kernel) {
                if !values.is_empty() {
                    writeln!(f, "{label}: {}", Bracketed(values))?;
                }
            }
            writeln!(f, "{stage} kernel execution time [ns]: {}", timing.execution_ns())?;
            writeln!(f, "{stage} profile: {}", timing.profile.display(self.resolution))?;
            writeln!(
                f,
                "{stage} read-back [{}]: {}",
                self.resolution.unit(),
                self.resolution.scale(timing.transfer)
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EqualizeConfig;
    use crate::device::CpuExecutor;
    use crate::image::Image;
    use crate::pipeline::{equalize, Pipeline};

    #[test]
    fn test_report_lists_every_stage() {
        let image = Image::gray(2, 2, vec![0, 85, 170, 255]).unwrap();
        let result = equalize(&image, 4).unwrap();
        let text = result.report().to_string();

        assert!(text.starts_with("Running on "));
        assert!(text.contains("Image: 2x2x1, 4 bins"));
        assert!(text.contains("Histogram: [1, 1, 1, 1]"));
        assert!(text.contains("Cumulative Histogram: [1, 2, 3, 4]"));
        assert!(text.contains("Look-up table (LUT): [64, 128, 191, 255]"));
        for kernel in Kernel::ALL {
            let line = format!("{} kernel execution time [ns]: ", kernel.stage_name());
            assert!(text.contains(&line), "missing {line:?}");
        }
        assert!(text.contains("Back-projection profile: Queued "));
        assert!(text.contains(" [us]"));
    }

    #[test]
    fn test_report_resolution() {
        let image = Image::filled(4, 4, 1, 9);
        let result = equalize(&image, 256).unwrap();
        let text = result
            .report()
            .with_resolution(ProfilingResolution::Ns)
            .to_string();
        assert!(text.contains(" [ns]"));
        assert!(!text.contains(" [us]"));
    }

    #[test]
    fn test_report_omits_skipped_intermediates() {
        let config = EqualizeConfig {
            read_back_intermediates: false,
            ..EqualizeConfig::default()
        };
        let image = Image::filled(4, 4, 1, 9);
        let result = Pipeline::new(CpuExecutor::new(), config).run(&image).unwrap();
        let text = result.report().to_string();
        assert!(!text.contains("Histogram: ["));
        assert!(text.contains("Histogram kernel execution time [ns]: "));
    }
}
