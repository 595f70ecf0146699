// THEORY:
// Calibration answers one question: how many physical units does one pixel of
// flow correspond to? A QR marker of known printed size is held in front of the
// camera. Its pixel span, measured from the detected corner quadrilateral, and
// the printed size typed in by the operator give the conversion factor.
//
// Key architectural principles:
// 1.  **One-Shot Session**: A `CalibrationSession` is a small state machine that
//     lives for one calibration attempt and is separate from the measurement
//     pipeline. Whether a marker was found is a field of the session, read by the
//     caller once the session has ended.
// 2.  **Uninterrupted Dwell**: The marker must decode on every frame for the
//     whole dwell window. Losing the marker, or seeing it without a payload,
//     restarts the window; visibility is never accumulated across gaps.
// 3.  **Last Measurement Wins**: The span used is the one measured on the frame
//     that completed the dwell, not an average over the window.
// 4.  **Validated Factor**: A `CalibrationFactor` can only hold a strictly
//     positive value. Degenerate geometry and bad operator input are errors, never
//     silently stored.

use crate::core_modules::contrast::to_luminance;
use crate::core_modules::flow::FrameSource;
use crate::core_modules::roi::Roi;
use crate::error::{Result, VelocityError};
use image::RgbImage;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_DWELL: Duration = Duration::from_secs(5);

/// Physical units per pixel. Always strictly positive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationFactor(f64);

impl Default for CalibrationFactor {
    fn default() -> Self {
        Self(1.0)
    }
}

impl fmt::Display for CalibrationFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl CalibrationFactor {
    pub fn new(value: f64) -> Result<Self> {
        if value.is_finite() && value > 0.0 {
            Ok(Self(value))
        } else {
            Err(VelocityError::InvalidCalibrationInput(format!(
                "conversion factor must be a positive number, got {value}"
            )))
        }
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// Reads a factor file. A missing file is `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value: f64 = contents.trim().parse().map_err(|_| {
            VelocityError::InvalidCalibrationInput(format!(
                "{} does not hold a number: {:?}",
                path.display(),
                contents.trim()
            ))
        })?;
        Self::new(value).map(Some)
    }

    /// Reads a factor file, falling back to 1.0 when there is none.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path)? {
            Some(factor) => {
                info!(factor = factor.0, path = %path.display(), "loaded conversion factor");
                Ok(factor)
            }
            None => {
                warn!(path = %path.display(), "no conversion factor found, using 1.0");
                Ok(Self::default())
            }
        }
    }

    /// Writes the factor through a temporary sibling file so a crash never
    /// leaves a truncated value behind.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            write!(file, "{}", self.0)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        info!(factor = self.0, path = %path.display(), "saved conversion factor");
        Ok(())
    }
}

/// A corner of a detected marker, in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point2) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// What the QR capability saw in one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QrObservation {
    /// Decoded payload, if decoding succeeded.
    pub payload: Option<String>,
    /// The marker quadrilateral, if one was located.
    pub corners: Option<[Point2; 4]>,
}

/// Detect-and-decode capability for QR markers.
pub trait QrDetector {
    fn detect_and_decode(&mut self, frame: &RgbImage) -> anyhow::Result<QrObservation>;
}

/// Blocking prompt for a number typed by the operator (keypad, terminal).
pub trait NumericPrompt {
    fn prompt(&mut self, title: &str, message: &str) -> anyhow::Result<String>;
}

/// `QrDetector` backed by `rqrr`.
#[derive(Debug, Default)]
pub struct RqrrDetector;

impl QrDetector for RqrrDetector {
    fn detect_and_decode(&mut self, frame: &RgbImage) -> anyhow::Result<QrObservation> {
        let luma = to_luminance(frame);
        let (width, height) = luma.dimensions();
        let mut prepared =
            rqrr::PreparedImage::prepare_from_greyscale(width as usize, height as usize, |x, y| {
                luma.get_pixel(x as u32, y as u32).0[0]
            });

        let Some(grid) = prepared.detect_grids().into_iter().next() else {
            return Ok(QrObservation::default());
        };

        let corners = grid.bounds.map(|p| Point2::new(p.x as f64, p.y as f64));
        let payload = grid.decode().ok().map(|(_, content)| content);
        Ok(QrObservation { payload, corners: Some(corners) })
    }
}

/// Mean length of the two edges leaving corner 0 (towards corners 1 and 3).
pub fn marker_span(corners: &[Point2; 4]) -> f64 {
    let width = corners[0].distance(&corners[1]);
    let height = corners[0].distance(&corners[3]);
    (width + height) / 2.0
}

/// Parses the operator's entry as a positive physical size.
pub fn parse_physical_size(input: &str) -> Result<f64> {
    let value: f64 = input
        .trim()
        .parse()
        .map_err(|_| VelocityError::InvalidCalibrationInput(format!("{input:?} is not a number")))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(VelocityError::InvalidCalibrationInput(format!(
            "physical size must be positive, got {value}"
        )));
    }
    Ok(value)
}

/// `physical_size / pixel_span`, refusing a zero span before dividing.
pub fn conversion_factor(physical_size: f64, pixel_span: f64) -> Result<CalibrationFactor> {
    if !(pixel_span > 0.0) || !pixel_span.is_finite() {
        return Err(VelocityError::DegenerateMarkerGeometry(pixel_span));
    }
    CalibrationFactor::new(physical_size / pixel_span)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    /// No frame observed yet.
    Idle,
    /// No marker in view.
    Searching,
    /// Marker in view, not yet decoded for the full dwell.
    Tracking,
    /// Marker decoded continuously for the full dwell.
    Stable,
    Success,
    Failed,
    Aborted,
}

impl CalibrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Aborted)
    }
}

/// A single calibration attempt.
#[derive(Debug, Clone)]
pub struct CalibrationSession {
    state: CalibrationState,
    dwell: Duration,
    first_decoded_at: Option<Duration>,
    pixel_span: Option<f64>,
    payload: Option<String>,
    /// Set once the dwell completes.
    pub marker_detected: bool,
}

impl CalibrationSession {
    pub fn new(dwell: Duration) -> Self {
        Self {
            state: CalibrationState::Idle,
            dwell,
            first_decoded_at: None,
            pixel_span: None,
            payload: None,
            marker_detected: false,
        }
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    /// The span measured on the most recent decoded frame.
    pub fn pixel_span(&self) -> Option<f64> {
        self.pixel_span
    }

    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    /// Feeds one frame's QR result, stamped with its capture time.
    pub fn observe(&mut self, observation: &QrObservation, at: Duration) -> CalibrationState {
        if self.state.is_terminal() || self.state == CalibrationState::Stable {
            return self.state;
        }

        let next = match (&observation.corners, observation.payload.as_deref()) {
            (None, _) => {
                self.first_decoded_at = None;
                CalibrationState::Searching
            }
            (Some(_), None) | (Some(_), Some("")) => {
                self.first_decoded_at = None;
                CalibrationState::Tracking
            }
            (Some(corners), Some(payload)) => {
                let since = *self.first_decoded_at.get_or_insert(at);
                self.pixel_span = Some(marker_span(corners));
                self.payload = Some(payload.to_string());
                if at.saturating_sub(since) >= self.dwell {
                    self.marker_detected = true;
                    CalibrationState::Stable
                } else {
                    CalibrationState::Tracking
                }
            }
        };

        if next != self.state {
            debug!(from = ?self.state, to = ?next, at = ?at, "calibration state change");
        }
        self.state = next;
        self.state
    }

    /// Turns the operator's entry into a factor. Only valid once stable.
    pub fn complete(&mut self, physical_input: &str) -> Result<CalibrationFactor> {
        if self.state != CalibrationState::Stable {
            return Err(VelocityError::CalibrationIncomplete);
        }
        let result = self
            .pixel_span
            .ok_or(VelocityError::DegenerateMarkerGeometry(0.0))
            .and_then(|span| {
                let size = parse_physical_size(physical_input)?;
                conversion_factor(size, span)
            });
        self.state = match result {
            Ok(_) => CalibrationState::Success,
            Err(_) => CalibrationState::Failed,
        };
        result
    }

    /// Cancels the session from any non-terminal state.
    pub fn abort(&mut self) {
        if !self.state.is_terminal() {
            self.state = CalibrationState::Aborted;
        }
    }
}

/// Settings for a calibration run.
#[derive(Debug, Clone)]
pub struct CalibrationOptions {
    pub dwell: Duration,
    /// Crop to the centered ROI before looking for the marker.
    pub roi_scale: Option<f64>,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        Self { dwell: DEFAULT_DWELL, roi_scale: Some(0.5) }
    }
}

/// What a successful calibration produced.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationOutcome {
    pub factor: CalibrationFactor,
    pub pixel_span: f64,
    pub physical_size: f64,
    pub payload: Option<String>,
}

/// Runs a full session: watch frames until the marker is stable, ask for its
/// size, then persist the factor to `factor_file`.
pub fn run_calibration(
    source: &mut dyn FrameSource,
    detector: &mut dyn QrDetector,
    prompt: &mut dyn NumericPrompt,
    options: &CalibrationOptions,
    factor_file: &Path,
    stop: &AtomicBool,
) -> Result<CalibrationOutcome> {
    let mut session = CalibrationSession::new(options.dwell);
    let mut roi: Option<Roi> = None;

    info!(dwell = ?options.dwell, "calibration started, hold the marker in view");

    loop {
        if stop.load(Ordering::Relaxed) {
            session.abort();
            info!("calibration cancelled");
            return Err(VelocityError::CalibrationIncomplete);
        }

        let Some(frame) = source.next_frame()? else {
            session.abort();
            warn!("frame source ended before the marker was stable");
            return Err(VelocityError::CalibrationIncomplete);
        };

        let view = match options.roi_scale {
            Some(scale) => {
                let (width, height) = frame.dimensions();
                let region = match roi {
                    Some(region) => region,
                    None => {
                        let region = Roi::centered(width, height, scale)?;
                        roi = Some(region);
                        region
                    }
                };
                if !region.fits_within(width, height) {
                    return Err(VelocityError::DimensionMismatch {
                        expected: (region.x + region.width, region.y + region.height),
                        found: (width, height),
                    });
                }
                region.crop(&frame.image)
            }
            None => frame.image,
        };

        let observation = detector.detect_and_decode(&view)?;
        if session.observe(&observation, frame.timestamp) == CalibrationState::Stable {
            break;
        }
    }

    let pixel_span = session.pixel_span().unwrap_or(0.0);
    if !(pixel_span > 0.0) {
        session.abort();
        return Err(VelocityError::DegenerateMarkerGeometry(pixel_span));
    }
    info!(pixel_span, payload = ?session.payload(), "marker stable");

    let input = prompt.prompt("Numeric Input", "Please enter the QR size in cm:")?;
    let factor = session.complete(&input)?;
    let physical_size = parse_physical_size(&input)?;
    factor.save(factor_file)?;

    Ok(CalibrationOutcome {
        factor,
        pixel_span,
        physical_size,
        payload: session.payload().map(str::to_string),
    })
}
