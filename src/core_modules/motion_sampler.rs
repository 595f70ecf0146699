// THEORY:
// The `MotionSampler` turns a dense motion field into one number per frame.
//
// Key architectural principles:
// 1.  **Sparse Reading**: The field has one vector per pixel but neighbouring
//     vectors are strongly correlated (the flow window spans many pixels), so
//     reading every pixel buys nothing. The field is read on a regular grid with
//     a spacing of half the flow window.
// 2.  **Cell-Centered Grid**: Grid points sit at the middle of each cell
//     (offset `step / 2`) rather than at pixel (0, 0), so no edge of the ROI is
//     systematically under-sampled.
// 3.  **Unit Conversion**: Each sampled vector is a displacement in pixels per
//     frame. Multiplying its length by the frame rate and the calibration factor
//     gives physical units per second.
// 4.  **Robust Mean**: Invalid vectors (NaN or infinite) are dropped from the
//     mean instead of poisoning the logged series.

use crate::core_modules::flow::MotionField;
use crate::error::{Result, VelocityError};

/// The fixed set of coordinates the field is read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleGrid {
    width: u32,
    height: u32,
    step: u32,
    points: Vec<(u32, u32)>,
}

impl SampleGrid {
    /// Builds the grid for a `width x height` frame and a flow window size.
    pub fn new(width: u32, height: u32, window_size: u32) -> Self {
        let step = (window_size / 2).max(2);
        let offset = step / 2;

        let xs: Vec<u32> = (offset..width).step_by(step as usize).collect();
        let mut points = Vec::with_capacity(xs.len() * (height / step + 1) as usize);
        for y in (offset..height).step_by(step as usize) {
            points.extend(xs.iter().map(|&x| (x, y)));
        }

        Self { width, height, step, points }
    }

    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Grid coordinates in row-major order.
    pub fn points(&self) -> &[(u32, u32)] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// A single grid reading, kept for visualization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowSample {
    pub x: u32,
    pub y: u32,
    pub dx: f32,
    pub dy: f32,
    /// Physical units per second.
    pub speed: f64,
}

/// The outcome of sampling one motion field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameSample {
    /// Mean of all valid per-sample speeds, 0 when there are none.
    pub velocity: f64,
    pub samples: Vec<FlowSample>,
    /// Grid points skipped because their vector was not finite.
    pub rejected: usize,
}

/// Samples motion fields on a fixed grid.
#[derive(Debug, Clone)]
pub struct MotionSampler {
    grid: SampleGrid,
}

impl MotionSampler {
    pub fn new(width: u32, height: u32, window_size: u32) -> Self {
        Self { grid: SampleGrid::new(width, height, window_size) }
    }

    pub fn grid(&self) -> &SampleGrid {
        &self.grid
    }

    /// Converts a motion field into a frame-level velocity.
    pub fn sample(&self, field: &MotionField, frame_rate: f64, calibration_factor: f64) -> Result<FrameSample> {
        if field.dimensions() != self.grid.dimensions() {
            return Err(VelocityError::DimensionMismatch {
                expected: self.grid.dimensions(),
                found: field.dimensions(),
            });
        }

        let scale = frame_rate * calibration_factor;
        let mut samples = Vec::with_capacity(self.grid.len());
        let mut rejected = 0;

        for &(x, y) in self.grid.points() {
            let Some([dx, dy]) = field.get(x, y) else {
                rejected += 1;
                continue;
            };
            let magnitude = (dx as f64).hypot(dy as f64);
            if !magnitude.is_finite() {
                rejected += 1;
                continue;
            }
            samples.push(FlowSample { x, y, dx, dy, speed: magnitude * scale });
        }

        let velocity = if samples.is_empty() {
            0.0
        } else {
            samples.iter().map(|s| s.speed).sum::<f64>() / samples.len() as f64
        };

        Ok(FrameSample { velocity, samples, rejected })
    }
}
