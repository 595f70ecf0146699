use anyhow::{Context, Result, bail};
use flowmeter::{CapturedFrame, FlowEstimator, FrameSource, MotionField};
use image::{GrayImage, RgbImage};
use opencv::{
    core::{self, Mat, Scalar},
    imgproc,
    prelude::*,
    video,
    videoio::{self, VideoCapture},
};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::info;

/// Where frame timestamps come from.
enum Clock {
    /// Wall clock since the device was opened.
    Live(Instant),
    /// The container's presentation time.
    Clip,
}

/// `FrameSource` over an OpenCV capture device or video file.
pub struct OpenCvSource {
    cap: VideoCapture,
    clock: Clock,
}

impl OpenCvSource {
    pub fn camera(index: i32) -> Result<Self> {
        let cap = VideoCapture::new(index, videoio::CAP_ANY)?;
        if !cap.is_opened()? {
            bail!("could not open camera {index}");
        }
        info!(index, "camera opened");
        Ok(Self { cap, clock: Clock::Live(Instant::now()) })
    }

    pub fn file(path: &Path) -> Result<Self> {
        let name = path.to_str().context("video path is not valid UTF-8")?;
        let cap = VideoCapture::from_file(name, videoio::CAP_ANY)?;
        if !cap.is_opened()? {
            bail!("could not open video file {}", path.display());
        }
        let fps = cap.get(videoio::CAP_PROP_FPS)?;
        info!(path = %path.display(), fps, "video file opened");
        Ok(Self { cap, clock: Clock::Clip })
    }

    /// Frame rate reported by the container, when it reports one.
    pub fn container_fps(&self) -> Option<f64> {
        match self.clock {
            Clock::Clip => self.cap.get(videoio::CAP_PROP_FPS).ok().filter(|fps| *fps > 0.0),
            Clock::Live(_) => None,
        }
    }

    fn timestamp(&self) -> Result<Duration> {
        Ok(match &self.clock {
            Clock::Live(opened) => opened.elapsed(),
            Clock::Clip => {
                let millis = self.cap.get(videoio::CAP_PROP_POS_MSEC)?.max(0.0);
                Duration::from_secs_f64(millis / 1000.0)
            }
        })
    }
}

impl FrameSource for OpenCvSource {
    fn next_frame(&mut self) -> Result<Option<CapturedFrame>> {
        let mut frame = Mat::default();
        if !self.cap.read(&mut frame)? || frame.empty() {
            return Ok(None);
        }
        let timestamp = self.timestamp()?;

        let mut rgb = Mat::default();
        imgproc::cvt_color(&frame, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;
        let (width, height) = (rgb.cols() as u32, rgb.rows() as u32);
        let image = RgbImage::from_raw(width, height, rgb.data_bytes()?.to_vec())
            .context("captured frame has an unexpected layout")?;

        Ok(Some(CapturedFrame::new(image, timestamp)))
    }
}

pub fn gray_to_mat(image: &GrayImage) -> Result<Mat> {
    let (width, height) = image.dimensions();
    let mut mat = Mat::new_rows_cols_with_default(height as i32, width as i32, core::CV_8UC1, Scalar::all(0.0))?;
    mat.data_bytes_mut()?.copy_from_slice(image.as_raw());
    Ok(mat)
}

/// Gunnar Farneback dense flow from OpenCV.
pub struct FarnebackFlow {
    pub pyr_scale: f64,
    pub levels: i32,
    pub window_size: i32,
    pub iterations: i32,
    pub poly_n: i32,
    pub poly_sigma: f64,
}

impl FarnebackFlow {
    pub fn new(window_size: u32) -> Self {
        Self {
            pyr_scale: 0.5,
            levels: 3,
            window_size: window_size as i32,
            iterations: 5,
            poly_n: 5,
            poly_sigma: 1.2,
        }
    }
}

impl FlowEstimator for FarnebackFlow {
    fn compute_flow(&mut self, previous: &GrayImage, current: &GrayImage) -> Result<MotionField> {
        let prev = gray_to_mat(previous)?;
        let next = gray_to_mat(current)?;
        let mut flow = Mat::default();
        video::calc_optical_flow_farneback(
            &prev,
            &next,
            &mut flow,
            self.pyr_scale,
            self.levels,
            self.window_size,
            self.iterations,
            self.poly_n,
            self.poly_sigma,
            0,
        )?;

        let (width, height) = current.dimensions();
        let vectors = flow.data_typed::<core::Vec2f>()?.iter().map(|v| [v[0], v[1]]).collect();
        MotionField::from_vectors(width, height, vectors).context("flow field does not match the frame size")
    }
}
