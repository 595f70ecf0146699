// THEORY:
// The `flow` module holds the data that crosses the boundary between the
// measurement core and the outside world: captured frames going in, and the
// dense motion field coming back from whatever optics library computes it.
//
// Both the frame source and the motion computation are traits. The core never
// talks to a camera or to an optical-flow implementation directly, which keeps
// every stage testable with synthetic frames and hand-made fields.

use image::{GrayImage, RgbImage};
use std::time::Duration;

/// A single frame as handed over by a `FrameSource`.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// The color pixels of the full frame.
    pub image: RgbImage,
    /// Capture time, measured from when the source was opened.
    pub timestamp: Duration,
}

impl CapturedFrame {
    pub fn new(image: RgbImage, timestamp: Duration) -> Self {
        Self { image, timestamp }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Pull-based, blocking access to a live camera or a recorded clip.
pub trait FrameSource {
    /// Returns the next frame, or `None` once the stream has ended.
    fn next_frame(&mut self) -> anyhow::Result<Option<CapturedFrame>>;
}

/// The external dense motion computation.
pub trait FlowEstimator {
    /// Computes one displacement vector per pixel between two equal-sized
    /// luminance frames.
    fn compute_flow(&mut self, previous: &GrayImage, current: &GrayImage) -> anyhow::Result<MotionField>;
}

/// A per-pixel field of `(dx, dy)` displacements, in pixels per frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionField {
    width: u32,
    height: u32,
    vectors: Vec<[f32; 2]>,
}

impl MotionField {
    /// Wraps a row-major vector buffer. Returns `None` when the buffer length
    /// does not match `width * height`.
    pub fn from_vectors(width: u32, height: u32, vectors: Vec<[f32; 2]>) -> Option<Self> {
        if vectors.len() != (width as usize) * (height as usize) {
            return None;
        }
        Some(Self { width, height, vectors })
    }

    pub fn zeros(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            vectors: vec![[0.0, 0.0]; (width as usize) * (height as usize)],
        }
    }

    pub fn from_fn(width: u32, height: u32, mut f: impl FnMut(u32, u32) -> [f32; 2]) -> Self {
        let mut vectors = Vec::with_capacity((width as usize) * (height as usize));
        for y in 0..height {
            for x in 0..width {
                vectors.push(f(x, y));
            }
        }
        Self { width, height, vectors }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// The displacement at an exact pixel, or `None` outside the field.
    pub fn get(&self, x: u32, y: u32) -> Option<[f32; 2]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.vectors.get((y as usize) * (self.width as usize) + x as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_vectors_rejects_wrong_length() {
        assert!(MotionField::from_vectors(3, 2, vec![[0.0, 0.0]; 5]).is_none());
        assert!(MotionField::from_vectors(3, 2, vec![[0.0, 0.0]; 6]).is_some());
    }

    #[test]
    fn from_fn_is_row_major() {
        let field = MotionField::from_fn(4, 3, |x, y| [x as f32, y as f32]);
        assert_eq!(field.get(2, 1), Some([2.0, 1.0]));
        assert_eq!(field.get(3, 2), Some([3.0, 2.0]));
        assert_eq!(field.get(4, 0), None);
        assert_eq!(field.get(0, 3), None);
    }
}
