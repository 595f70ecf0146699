use crate::capture::gray_to_mat;
use anyhow::Result;
use flowmeter::pipeline::{FrameObserver, FrameReport};
use image::GrayImage;
use opencv::{
    core::{Mat, Point, Scalar},
    highgui, imgproc,
};
use std::ops::ControlFlow;

const WINDOW: &str = "Optical flow";

/// Draws the sampled flow vectors and the smoothed velocity, and stops the
/// run when `q` is pressed.
pub struct FlowWindow {
    fps_shown: bool,
}

impl FlowWindow {
    pub fn new(fps_shown: bool) -> Self {
        Self { fps_shown }
    }
}

impl FrameObserver for FlowWindow {
    fn observe(&mut self, roi_luma: &GrayImage, report: &FrameReport) -> Result<ControlFlow<()>> {
        let gray = gray_to_mat(roi_luma)?;
        let mut vis = Mat::default();
        imgproc::cvt_color(&gray, &mut vis, imgproc::COLOR_GRAY2BGR, 0)?;

        let green = Scalar::new(0.0, 255.0, 0.0, 0.0);
        for s in &report.sample.samples {
            let from = Point::new(s.x as i32, s.y as i32);
            let to = Point::new((s.x as f32 + s.dx + 0.5) as i32, (s.y as f32 + s.dy + 0.5) as i32);
            imgproc::line(&mut vis, from, to, green, 1, imgproc::LINE_8, 0)?;
        }

        let black = Scalar::all(0.0);
        if self.fps_shown {
            let text = format!("FPS: {:.2}", report.frame_rate);
            imgproc::put_text(&mut vis, &text, Point::new(10, 30), imgproc::FONT_HERSHEY_PLAIN, 1.0, black, 1, imgproc::LINE_8, false)?;
        }
        let text = format!("Avg Velocity: {:.2}", report.reading.velocity);
        imgproc::put_text(&mut vis, &text, Point::new(10, 50), imgproc::FONT_HERSHEY_PLAIN, 1.0, black, 1, imgproc::LINE_8, false)?;

        highgui::imshow(WINDOW, &vis)?;
        if highgui::wait_key(1)? & 0xFF == 'q' as i32 {
            return Ok(ControlFlow::Break(()));
        }
        Ok(ControlFlow::Continue(()))
    }
}

impl Drop for FlowWindow {
    fn drop(&mut self) {
        let _ = highgui::destroy_all_windows();
    }
}
