// THEORY:
// The region of interest is the centered window of the frame that the rest of
// the pipeline looks at. It is derived once from the first frame's size and a
// scale factor, and never moves afterwards.

use crate::error::{Result, VelocityError};
use image::{GrayImage, RgbImage, imageops};

/// An axis-aligned rectangle inside a frame, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    /// The whole frame.
    pub fn full(frame_width: u32, frame_height: u32) -> Self {
        Self { x: 0, y: 0, width: frame_width, height: frame_height }
    }

    /// A `floor(W*s) x floor(H*s)` window centered in a `W x H` frame.
    pub fn centered(frame_width: u32, frame_height: u32, scale_factor: f64) -> Result<Self> {
        if !(scale_factor > 0.0 && scale_factor <= 1.0) {
            return Err(VelocityError::InvalidConfig(format!(
                "ROI scale factor must be in (0, 1], got {scale_factor}"
            )));
        }

        let width = (frame_width as f64 * scale_factor).floor() as u32;
        let height = (frame_height as f64 * scale_factor).floor() as u32;
        if width == 0 || height == 0 {
            return Err(VelocityError::InvalidConfig(format!(
                "scale factor {scale_factor} gives an empty ROI for a {frame_width}x{frame_height} frame"
            )));
        }

        Ok(Self {
            x: (frame_width - width) / 2,
            y: (frame_height - height) / 2,
            width,
            height,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn fits_within(&self, frame_width: u32, frame_height: u32) -> bool {
        self.x + self.width <= frame_width && self.y + self.height <= frame_height
    }

    pub fn crop(&self, frame: &RgbImage) -> RgbImage {
        imageops::crop_imm(frame, self.x, self.y, self.width, self.height).to_image()
    }

    pub fn crop_luma(&self, frame: &GrayImage) -> GrayImage {
        imageops::crop_imm(frame, self.x, self.y, self.width, self.height).to_image()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn centered_roi_is_contained_and_centered() {
        let frames = [(640u32, 480u32), (1920, 1080), (7, 5), (1, 1), (333, 101)];
        for &(w, h) in &frames {
            for step in 1..=100 {
                let s = step as f64 / 100.0;
                let Ok(roi) = Roi::centered(w, h, s) else {
                    continue;
                };
                assert!(roi.fits_within(w, h), "{roi:?} escapes {w}x{h} at s={s}");

                let center_x = roi.x as f64 + roi.width as f64 / 2.0;
                let center_y = roi.y as f64 + roi.height as f64 / 2.0;
                assert!((center_x - w as f64 / 2.0).abs() <= 1.0);
                assert!((center_y - h as f64 / 2.0).abs() <= 1.0);
            }
        }
    }

    #[test]
    fn half_scale_of_vga() {
        let roi = Roi::centered(640, 480, 0.5).unwrap();
        assert_eq!(roi, Roi { x: 160, y: 120, width: 320, height: 240 });
    }

    #[test]
    fn unit_scale_is_the_full_frame() {
        assert_eq!(Roi::centered(640, 480, 1.0).unwrap(), Roi::full(640, 480));
    }

    #[test]
    fn zero_sized_roi_is_a_config_error() {
        assert!(matches!(Roi::centered(10, 10, 0.05), Err(VelocityError::InvalidConfig(_))));
        assert!(matches!(Roi::centered(10, 10, 0.0), Err(VelocityError::InvalidConfig(_))));
        assert!(matches!(Roi::centered(10, 10, 1.5), Err(VelocityError::InvalidConfig(_))));
    }

    #[test]
    fn crop_takes_the_right_pixels() {
        let frame = RgbImage::from_fn(8, 6, |x, y| Rgb([x as u8, y as u8, 0]));
        let roi = Roi::centered(8, 6, 0.5).unwrap();
        let cropped = roi.crop(&frame);
        assert_eq!(cropped.dimensions(), (4, 3));
        assert_eq!(cropped.get_pixel(0, 0), &Rgb([2, 1, 0]));
        assert_eq!(cropped.get_pixel(3, 2), &Rgb([5, 3, 0]));
    }
}
