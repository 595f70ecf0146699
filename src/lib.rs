// THEORY:
// This file is the entry point for the `flowmeter` library crate. It exposes the
// measurement pipeline, the calibration session and their configuration as the
// public API. Camera access, dense optical flow and on-screen display are left to
// the caller through the capability traits in `core_modules::flow`,
// `core_modules::calibration` and `core_modules::destination`, so the whole core
// runs headless against synthetic frames.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod pipeline;

pub use crate::config::StationConfig;
pub use crate::core_modules::calibration::{CalibrationFactor, run_calibration};
pub use crate::core_modules::flow::{CapturedFrame, FlowEstimator, FrameSource, MotionField};
pub use crate::error::VelocityError;
pub use crate::pipeline::{VelocityPipeline, run_measurement};
