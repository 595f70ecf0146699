// THEORY:
// Grid-sampled flow magnitudes are noisy from one frame to the next. An
// exponential moving average gives a steady reading with a small, known lag and
// needs only one number of state.

use crate::error::{Result, VelocityError};

pub const DEFAULT_ALPHA: f64 = 0.1;

/// Exponential moving average over frame-level velocities.
#[derive(Debug, Clone)]
pub struct VelocitySmoother {
    alpha: f64,
    previous_average: f64,
}

impl VelocitySmoother {
    /// `alpha` must lie in (0, 1]; larger values follow the input faster.
    pub fn new(alpha: f64) -> Result<Self> {
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(VelocityError::InvalidConfig(format!(
                "smoothing factor must be in (0, 1], got {alpha}"
            )));
        }
        Ok(Self { alpha, previous_average: 0.0 })
    }

    /// Folds in the current frame's velocity and returns the new average.
    pub fn update(&mut self, current: f64) -> f64 {
        let average = self.alpha * current + (1.0 - self.alpha) * self.previous_average;
        self.previous_average = average;
        average
    }

    pub fn average(&self) -> f64 {
        self.previous_average
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn reset(&mut self) {
        self.previous_average = 0.0;
    }
}
