// THEORY:
// A station is configured from one YAML file. Every key has a default, so an
// empty file (or no file at all) gives a working setup: 50% ROI, 50 px flow
// window, 5 s calibration dwell, output next to the binary unless a USB stick
// is plugged in.

use crate::core_modules::calibration::{CalibrationOptions, DEFAULT_DWELL};
use crate::core_modules::destination::OutputTarget;
use crate::core_modules::series_logger::DEFAULT_FLUSH_CAPACITY;
use crate::error::{Result, VelocityError};
use crate::pipeline::PipelineConfig;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    pub pipeline: PipelineConfig,
    pub calibration: CalibrationConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Text file holding the conversion factor.
    pub factor_file: PathBuf,
    pub dwell_secs: f64,
    pub use_roi: bool,
    pub scale_factor: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            factor_file: PathBuf::from("conv_factor.txt"),
            dwell_secs: DEFAULT_DWELL.as_secs_f64(),
            use_roi: true,
            scale_factor: 0.5,
        }
    }
}

impl CalibrationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.dwell_secs > 0.0 && self.dwell_secs.is_finite()) {
            return Err(VelocityError::InvalidConfig(format!(
                "dwell_secs must be positive, got {}",
                self.dwell_secs
            )));
        }
        if self.use_roi && !(self.scale_factor > 0.0 && self.scale_factor <= 1.0) {
            return Err(VelocityError::InvalidConfig(format!(
                "calibration scale_factor must be in (0, 1], got {}",
                self.scale_factor
            )));
        }
        Ok(())
    }

    pub fn options(&self) -> Result<CalibrationOptions> {
        self.validate()?;
        let dwell = Duration::try_from_secs_f64(self.dwell_secs)
            .map_err(|e| VelocityError::InvalidConfig(format!("dwell_secs {}: {e}", self.dwell_secs)))?;
        Ok(CalibrationOptions {
            dwell,
            roi_scale: self.use_roi.then_some(self.scale_factor),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub target: OutputTarget,
    /// File used when no removable volume is involved.
    pub local_file: PathBuf,
    /// Stem of the collision-free name used on removable volumes.
    pub base_name: String,
    /// Rows buffered before each write.
    pub flush_capacity: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            target: OutputTarget::default(),
            local_file: PathBuf::from("output_data.csv"),
            base_name: "output_data".to_string(),
            flush_capacity: DEFAULT_FLUSH_CAPACITY,
        }
    }
}

impl StationConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }
}
