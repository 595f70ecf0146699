// THEORY:
// The `pipeline` module is the top-level API of the measurement engine. It owns
// every piece of cross-frame state (previous luminance frame, previous
// timestamp, the EMA accumulator) and drives one frame at a time through the
// stages:
//
//   frame -> ROI -> contrast -> [external flow] -> sampler -> smoother -> logger
//
// The loop is synchronous and single-threaded. It blocks on the frame source
// and on flushes, checks for a stop request at the top of every iteration, and
// always finalizes the logger before handing control back, whichever way the
// run ended.

use crate::config::StationConfig;
use crate::core_modules::calibration::CalibrationFactor;
use crate::core_modules::contrast::{equalize_luminance, to_luminance};
use crate::core_modules::destination::{VolumeLocator, resolve_destination};
use crate::core_modules::flow::{CapturedFrame, FlowEstimator, FrameSource};
use crate::core_modules::motion_sampler::{FrameSample, MotionSampler};
use crate::core_modules::roi::Roi;
use crate::core_modules::series_logger::{BatchSink, SeriesLogger, VelocityReading};
use crate::core_modules::smoother::VelocitySmoother;
use crate::error::{Result, VelocityError};
use image::GrayImage;
use serde::Deserialize;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

/// Configuration for the VelocityPipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Side length of the centered ROI relative to the frame, in (0, 1].
    pub scale_factor: f64,
    /// When false the whole frame is measured.
    pub use_roi: bool,
    /// Flow window size in pixels. The sample grid spacing is half of it.
    pub window_size: u32,
    /// EMA weight of the newest frame.
    pub smoothing_alpha: f64,
    /// Used whenever the measured frame interval is zero.
    pub default_frame_rate: f64,
    /// Overrides the measured rate, for clips with a known container rate.
    /// Per source frame; divided by `frame_stride` when frames are skipped.
    pub fixed_frame_rate: Option<f64>,
    /// Only every n-th frame is measured.
    pub frame_stride: u32,
    pub equalize_contrast: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scale_factor: 0.5,
            use_roi: true,
            window_size: 50,
            smoothing_alpha: 0.1,
            default_frame_rate: 30.0,
            fixed_frame_rate: None,
            frame_stride: 1,
            equalize_contrast: true,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(VelocityError::InvalidConfig(msg));
        if self.use_roi && !(self.scale_factor > 0.0 && self.scale_factor <= 1.0) {
            return invalid(format!("scale_factor must be in (0, 1], got {}", self.scale_factor));
        }
        if self.window_size == 0 {
            return invalid("window_size must be positive".into());
        }
        if !(self.smoothing_alpha > 0.0 && self.smoothing_alpha <= 1.0) {
            return invalid(format!("smoothing_alpha must be in (0, 1], got {}", self.smoothing_alpha));
        }
        if !(self.default_frame_rate > 0.0 && self.default_frame_rate.is_finite()) {
            return invalid(format!("default_frame_rate must be positive, got {}", self.default_frame_rate));
        }
        if let Some(rate) = self.fixed_frame_rate {
            if !(rate > 0.0 && rate.is_finite()) {
                return invalid(format!("fixed_frame_rate must be positive, got {rate}"));
            }
        }
        if self.frame_stride == 0 {
            return invalid("frame_stride must be at least 1".into());
        }
        Ok(())
    }
}

/// The result of one measured frame.
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub reading: VelocityReading,
    /// Unsmoothed frame-level velocity.
    pub raw_velocity: f64,
    pub frame_rate: f64,
    pub sample: FrameSample,
}

#[derive(Debug, Clone)]
pub enum FrameOutcome {
    /// First frame: stored as the flow reference, nothing measured.
    Seeded,
    /// Not selected by the frame stride.
    Skipped,
    Measured(FrameReport),
}

/// Receives every measured frame, e.g. to draw it on screen.
pub trait FrameObserver {
    /// `roi_luma` is the luminance frame the flow was computed on. Returning
    /// `Break` ends the run cleanly.
    fn observe(&mut self, roi_luma: &GrayImage, report: &FrameReport) -> anyhow::Result<ControlFlow<()>>;
}

/// Observer that does nothing.
#[derive(Debug, Default)]
pub struct Headless;

impl FrameObserver for Headless {
    fn observe(&mut self, _roi_luma: &GrayImage, _report: &FrameReport) -> anyhow::Result<ControlFlow<()>> {
        Ok(ControlFlow::Continue(()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfStream,
    StopSignal,
    Observer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub frames_acquired: u64,
    pub readings_recorded: u64,
    pub rows_written: usize,
    /// Flushes that failed during the run and were left for retry.
    pub storage_errors: usize,
    pub stopped_by: StopReason,
}

/// Everything fixed or carried forward once the first frame has arrived.
#[derive(Debug, Clone)]
struct ReferenceState {
    frame_size: (u32, u32),
    roi: Roi,
    sampler: MotionSampler,
    previous_luma: GrayImage,
    previous_timestamp: Duration,
}

/// The main, top-level struct for velocity measurement.
pub struct VelocityPipeline<F: FlowEstimator> {
    config: PipelineConfig,
    flow: F,
    factor: CalibrationFactor,
    smoother: VelocitySmoother,
    reference: Option<ReferenceState>,
    frames_seen: u64,
}

impl<F: FlowEstimator> VelocityPipeline<F> {
    pub fn new(config: PipelineConfig, flow: F, factor: CalibrationFactor) -> Result<Self> {
        config.validate()?;
        let smoother = VelocitySmoother::new(config.smoothing_alpha)?;
        Ok(Self {
            config,
            flow,
            factor,
            smoother,
            reference: None,
            frames_seen: 0,
        })
    }

    pub fn factor(&self) -> CalibrationFactor {
        self.factor
    }

    pub fn roi(&self) -> Option<Roi> {
        self.reference.as_ref().map(|r| r.roi)
    }

    /// The luminance frame the next flow computation will start from.
    pub fn reference_luma(&self) -> Option<&GrayImage> {
        self.reference.as_ref().map(|r| &r.previous_luma)
    }

    pub fn smoothed_velocity(&self) -> f64 {
        self.smoother.average()
    }

    /// Runs one frame through the pipeline.
    pub fn process_frame(&mut self, frame: CapturedFrame) -> Result<FrameOutcome> {
        let index = self.frames_seen;
        self.frames_seen += 1;

        let Some(reference) = self.reference.as_mut() else {
            self.reference = Some(seed_reference(&self.config, &frame, self.factor)?);
            return Ok(FrameOutcome::Seeded);
        };

        if frame.dimensions() != reference.frame_size {
            return Err(VelocityError::DimensionMismatch {
                expected: reference.frame_size,
                found: frame.dimensions(),
            });
        }

        if index % self.config.frame_stride as u64 != 0 {
            return Ok(FrameOutcome::Skipped);
        }

        let frame_rate = measured_frame_rate(&self.config, reference.previous_timestamp, frame.timestamp);
        let luma = prepare_luma(&self.config, &frame, reference.roi);
        let field = self.flow.compute_flow(&reference.previous_luma, &luma)?;
        let sample = reference.sampler.sample(&field, frame_rate, self.factor.value())?;
        let smoothed = self.smoother.update(sample.velocity);

        reference.previous_luma = luma;
        reference.previous_timestamp = frame.timestamp;

        Ok(FrameOutcome::Measured(FrameReport {
            reading: VelocityReading {
                frame_index: index,
                velocity: smoothed,
                timestamp: Some(frame.timestamp.as_secs_f64()),
            },
            raw_velocity: sample.velocity,
            frame_rate,
            sample,
        }))
    }

    /// Drives frames from `source` into `logger` until the stream ends, `stop`
    /// is raised, or the observer asks to stop. The logger is finalized on
    /// every exit path.
    pub fn run<S: BatchSink>(
        &mut self,
        source: &mut dyn FrameSource,
        logger: &mut SeriesLogger<S>,
        observer: &mut dyn FrameObserver,
        stop: &AtomicBool,
    ) -> Result<RunSummary> {
        let outcome = self.drive(source, logger, observer, stop);
        let finalized = logger.finalize();

        match (outcome, finalized) {
            (Ok(mut summary), Ok(())) => {
                summary.rows_written = logger.rows_written();
                info!(?summary, "measurement finished");
                Ok(summary)
            }
            (Ok(_), Err(loss)) => Err(loss),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(loss)) => {
                error!(error = %loss, "logger could not be finalized after a failed run");
                Err(e)
            }
        }
    }

    fn drive<S: BatchSink>(
        &mut self,
        source: &mut dyn FrameSource,
        logger: &mut SeriesLogger<S>,
        observer: &mut dyn FrameObserver,
        stop: &AtomicBool,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary {
            frames_acquired: 0,
            readings_recorded: 0,
            rows_written: 0,
            storage_errors: 0,
            stopped_by: StopReason::EndOfStream,
        };

        let first = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(VelocityError::AcquisitionFailure("stream produced no frames".into())),
            Err(e) => return Err(VelocityError::AcquisitionFailure(format!("{e:#}"))),
        };
        summary.frames_acquired += 1;
        self.process_frame(first)?;

        loop {
            if stop.load(Ordering::Relaxed) {
                info!("stop requested");
                summary.stopped_by = StopReason::StopSignal;
                break;
            }

            let Some(frame) = source.next_frame()? else {
                summary.stopped_by = StopReason::EndOfStream;
                break;
            };
            summary.frames_acquired += 1;

            let FrameOutcome::Measured(report) = self.process_frame(frame)? else {
                continue;
            };

            match logger.record(report.reading) {
                Ok(()) => {}
                Err(VelocityError::StorageWrite { rows, .. }) => {
                    warn!(rows, "readings held in memory until storage recovers");
                    summary.storage_errors += 1;
                }
                Err(e) => return Err(e),
            }
            summary.readings_recorded += 1;

            if let Some(luma) = self.reference_luma() {
                if observer.observe(luma, &report)?.is_break() {
                    summary.stopped_by = StopReason::Observer;
                    break;
                }
            }
        }

        Ok(summary)
    }
}

/// Fixes ROI and sample grid from the first frame and keeps its luminance as
/// the first flow reference.
fn seed_reference(config: &PipelineConfig, frame: &CapturedFrame, factor: CalibrationFactor) -> Result<ReferenceState> {
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 {
        return Err(VelocityError::AcquisitionFailure("first frame is empty".into()));
    }
    let roi = if config.use_roi {
        Roi::centered(width, height, config.scale_factor)?
    } else {
        Roi::full(width, height)
    };
    let sampler = MotionSampler::new(roi.width, roi.height, config.window_size);
    info!(
        frame = ?(width, height),
        roi = ?roi,
        grid_step = sampler.grid().step(),
        grid_points = sampler.grid().len(),
        factor = factor.value(),
        "pipeline geometry fixed"
    );
    Ok(ReferenceState {
        frame_size: (width, height),
        roi,
        sampler,
        previous_luma: prepare_luma(config, frame, roi),
        previous_timestamp: frame.timestamp,
    })
}

/// ROI crop, optional equalization, then luminance.
fn prepare_luma(config: &PipelineConfig, frame: &CapturedFrame, roi: Roi) -> GrayImage {
    let cropped = roi.crop(&frame.image);
    if config.equalize_contrast {
        to_luminance(&equalize_luminance(&cropped))
    } else {
        to_luminance(&cropped)
    }
}

/// Measured frames per second from the gap since the last measured frame.
/// A zero or backwards gap falls back to the default rate. Configured rates
/// are per source frame, so they are divided by the stride: each motion field
/// spans `frame_stride` source frames.
fn measured_frame_rate(config: &PipelineConfig, previous: Duration, current: Duration) -> f64 {
    let stride = f64::from(config.frame_stride.max(1));
    if let Some(rate) = config.fixed_frame_rate {
        return rate / stride;
    }
    match current.checked_sub(previous) {
        Some(delta) if !delta.is_zero() => 1.0 / delta.as_secs_f64(),
        _ => config.default_frame_rate / stride,
    }
}

/// Loads the calibration factor, resolves the output file and runs a complete
/// measurement with the given collaborators.
pub fn run_measurement<F: FlowEstimator>(
    config: &StationConfig,
    source: &mut dyn FrameSource,
    flow: F,
    locator: &mut dyn VolumeLocator,
    observer: &mut dyn FrameObserver,
    stop: &AtomicBool,
) -> Result<RunSummary> {
    config.pipeline.validate()?;
    let factor = CalibrationFactor::load_or_default(&config.calibration.factor_file)?;
    let path = resolve_destination(
        config.output.target,
        &config.output.local_file,
        &config.output.base_name,
        locator,
    )?;
    let mut logger = SeriesLogger::create_csv(path, config.output.flush_capacity)?;
    let mut pipeline = VelocityPipeline::new(config.pipeline.clone(), flow, factor)?;
    pipeline.run(source, &mut logger, observer, stop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::flow::MotionField;
    use crate::core_modules::series_logger::CsvFileSink;
    use image::{Rgb, RgbImage};
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};

    /// Frames of a fixed size, one every `interval`.
    struct SyntheticSource {
        frames: VecDeque<CapturedFrame>,
    }

    impl SyntheticSource {
        fn new(count: u64, size: (u32, u32), interval: Duration) -> Self {
            let frames = (0..count)
                .map(|i| {
                    let image = RgbImage::from_fn(size.0, size.1, |x, y| Rgb([(x * 7 + y * 3 + i as u32) as u8, 90, 40]));
                    CapturedFrame::new(image, interval * i as u32)
                })
                .collect();
            Self { frames }
        }
    }

    impl FrameSource for SyntheticSource {
        fn next_frame(&mut self) -> anyhow::Result<Option<CapturedFrame>> {
            Ok(self.frames.pop_front())
        }
    }

    /// Every pixel moves by the same vector; remembers the sizes it saw.
    struct UniformFlow {
        vector: [f32; 2],
        calls: Vec<(u32, u32)>,
    }

    impl UniformFlow {
        fn new(dx: f32, dy: f32) -> Self {
            Self { vector: [dx, dy], calls: Vec::new() }
        }
    }

    impl FlowEstimator for UniformFlow {
        fn compute_flow(&mut self, previous: &GrayImage, current: &GrayImage) -> anyhow::Result<MotionField> {
            assert_eq!(previous.dimensions(), current.dimensions());
            self.calls.push(current.dimensions());
            let (w, h) = current.dimensions();
            Ok(MotionField::from_fn(w, h, |_, _| self.vector))
        }
    }

    #[derive(Default)]
    struct MemorySink {
        rows: Vec<VelocityReading>,
        path: PathBuf,
    }

    impl BatchSink for MemorySink {
        fn write_batch(&mut self, batch: &[VelocityReading]) -> std::io::Result<()> {
            self.rows.extend_from_slice(batch);
            Ok(())
        }

        fn location(&self) -> &Path {
            &self.path
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            scale_factor: 0.5,
            window_size: 10,
            smoothing_alpha: 1.0,
            ..Default::default()
        }
    }

    fn unit_factor() -> CalibrationFactor {
        CalibrationFactor::default()
    }

    #[test]
    fn first_frame_only_seeds() {
        let mut pipeline = VelocityPipeline::new(config(), UniformFlow::new(1.0, 0.0), unit_factor()).unwrap();
        let frame = CapturedFrame::new(RgbImage::new(80, 60), Duration::ZERO);
        assert!(matches!(pipeline.process_frame(frame).unwrap(), FrameOutcome::Seeded));
        assert_eq!(pipeline.roi(), Some(Roi { x: 20, y: 15, width: 40, height: 30 }));
        assert_eq!(pipeline.reference_luma().map(|l| l.dimensions()), Some((40, 30)));
    }

    #[test]
    fn velocity_uses_measured_frame_rate_and_factor() {
        let factor = CalibrationFactor::new(0.05).unwrap();
        let mut pipeline = VelocityPipeline::new(config(), UniformFlow::new(3.0, 4.0), factor).unwrap();
        let mut source = SyntheticSource::new(5, (80, 60), Duration::from_millis(40));
        let mut logger = SeriesLogger::new(MemorySink::default(), 100).unwrap();
        let stop = AtomicBool::new(false);

        let summary = pipeline.run(&mut source, &mut logger, &mut Headless, &stop).unwrap();
        assert_eq!(summary.frames_acquired, 5);
        assert_eq!(summary.readings_recorded, 4);
        assert_eq!(summary.stopped_by, StopReason::EndOfStream);

        let rows = &logger.sink().rows;
        assert_eq!(rows.iter().map(|r| r.frame_index).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        // 5 px/frame at 25 fps, 0.05 units per pixel
        for row in rows {
            assert!((row.velocity - 5.0 * 25.0 * 0.05).abs() < 1e-6, "{row:?}");
        }
        assert_eq!(pipeline.flow.calls, vec![(40, 30); 4]);
    }

    #[test]
    fn zero_interval_falls_back_to_default_rate() {
        let mut pipeline = VelocityPipeline::new(config(), UniformFlow::new(1.0, 0.0), unit_factor()).unwrap();
        let mut source = SyntheticSource::new(3, (80, 60), Duration::ZERO);
        let mut logger = SeriesLogger::new(MemorySink::default(), 100).unwrap();
        pipeline.run(&mut source, &mut logger, &mut Headless, &AtomicBool::new(false)).unwrap();
        for row in &logger.sink().rows {
            assert!((row.velocity - 30.0).abs() < 1e-9);
        }
    }

    #[test]
    fn fixed_frame_rate_overrides_timestamps() {
        let cfg = PipelineConfig { fixed_frame_rate: Some(10.0), ..config() };
        let mut pipeline = VelocityPipeline::new(cfg, UniformFlow::new(2.0, 0.0), unit_factor()).unwrap();
        let mut source = SyntheticSource::new(3, (80, 60), Duration::from_millis(5));
        let mut logger = SeriesLogger::new(MemorySink::default(), 100).unwrap();
        pipeline.run(&mut source, &mut logger, &mut Headless, &AtomicBool::new(false)).unwrap();
        assert!(logger.sink().rows.iter().all(|r| (r.velocity - 20.0).abs() < 1e-9));
    }

    #[test]
    fn smoothing_carries_across_frames() {
        let cfg = PipelineConfig { smoothing_alpha: 0.5, fixed_frame_rate: Some(1.0), ..config() };
        let mut pipeline = VelocityPipeline::new(cfg, UniformFlow::new(8.0, 0.0), unit_factor()).unwrap();
        let mut source = SyntheticSource::new(4, (80, 60), Duration::from_millis(33));
        let mut logger = SeriesLogger::new(MemorySink::default(), 100).unwrap();
        pipeline.run(&mut source, &mut logger, &mut Headless, &AtomicBool::new(false)).unwrap();
        let velocities: Vec<f64> = logger.sink().rows.iter().map(|r| r.velocity).collect();
        assert_eq!(velocities, vec![4.0, 6.0, 7.0]);
    }

    #[test]
    fn stride_gives_same_velocity_with_timestamps_or_fixed_rate() {
        // 10 fps clip, 1 px per source frame, so 2 px between measured frames.
        let run = |fixed_frame_rate: Option<f64>| {
            let cfg = PipelineConfig { frame_stride: 2, fixed_frame_rate, ..config() };
            let mut pipeline = VelocityPipeline::new(cfg, UniformFlow::new(2.0, 0.0), unit_factor()).unwrap();
            let mut source = SyntheticSource::new(7, (80, 60), Duration::from_millis(100));
            let mut logger = SeriesLogger::new(MemorySink::default(), 100).unwrap();
            pipeline.run(&mut source, &mut logger, &mut Headless, &AtomicBool::new(false)).unwrap();
            logger.sink().rows.iter().map(|r| r.velocity).collect::<Vec<_>>()
        };

        let timed = run(None);
        let fixed = run(Some(10.0));
        assert_eq!(timed.len(), 3);
        assert_eq!(fixed.len(), 3);
        for (t, f) in timed.iter().zip(&fixed) {
            assert!((t - 10.0).abs() < 1e-6, "timestamp timing gave {t}");
            assert!((f - 10.0).abs() < 1e-6, "fixed timing gave {f}");
        }
    }

    #[test]
    fn stride_scales_default_rate_fallback() {
        let cfg = PipelineConfig { frame_stride: 3, ..config() };
        let rate = measured_frame_rate(&cfg, Duration::from_millis(40), Duration::from_millis(40));
        assert!((rate - 10.0).abs() < 1e-9);
    }

    #[test]
    fn stride_skips_frames_but_keeps_indices() {
        let cfg = PipelineConfig { frame_stride: 2, ..config() };
        let mut pipeline = VelocityPipeline::new(cfg, UniformFlow::new(1.0, 0.0), unit_factor()).unwrap();
        let mut source = SyntheticSource::new(7, (80, 60), Duration::from_millis(10));
        let mut logger = SeriesLogger::new(MemorySink::default(), 100).unwrap();
        let summary = pipeline.run(&mut source, &mut logger, &mut Headless, &AtomicBool::new(false)).unwrap();
        assert_eq!(summary.frames_acquired, 7);
        let rows = &logger.sink().rows;
        assert_eq!(rows.iter().map(|r| r.frame_index).collect::<Vec<_>>(), vec![2, 4, 6]);
        // two source frames per measured frame: 20 ms apart
        assert!(rows.iter().all(|r| (r.velocity - 50.0).abs() < 1e-6));
    }

    #[test]
    fn size_change_is_fatal_but_rows_are_kept() {
        let mut pipeline = VelocityPipeline::new(config(), UniformFlow::new(1.0, 0.0), unit_factor()).unwrap();
        let mut source = SyntheticSource::new(3, (80, 60), Duration::from_millis(10));
        source.frames.push_back(CapturedFrame::new(RgbImage::new(100, 60), Duration::from_millis(30)));
        let mut logger = SeriesLogger::new(MemorySink::default(), 100).unwrap();

        let err = pipeline.run(&mut source, &mut logger, &mut Headless, &AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, VelocityError::DimensionMismatch { expected: (80, 60), found: (100, 60) }));
        assert!(logger.is_finalized());
        assert_eq!(logger.sink().rows.len(), 2);
    }

    #[test]
    fn empty_stream_is_an_acquisition_failure() {
        let mut pipeline = VelocityPipeline::new(config(), UniformFlow::new(1.0, 0.0), unit_factor()).unwrap();
        let mut source = SyntheticSource::new(0, (80, 60), Duration::ZERO);
        let mut logger = SeriesLogger::new(MemorySink::default(), 100).unwrap();
        let err = pipeline.run(&mut source, &mut logger, &mut Headless, &AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, VelocityError::AcquisitionFailure(_)));
    }

    #[test]
    fn stop_signal_still_flushes() {
        let mut pipeline = VelocityPipeline::new(config(), UniformFlow::new(1.0, 0.0), unit_factor()).unwrap();
        let mut source = SyntheticSource::new(10, (80, 60), Duration::from_millis(10));
        let mut logger = SeriesLogger::new(MemorySink::default(), 100).unwrap();
        let stop = AtomicBool::new(true);
        let summary = pipeline.run(&mut source, &mut logger, &mut Headless, &stop).unwrap();
        assert_eq!(summary.stopped_by, StopReason::StopSignal);
        assert_eq!(summary.frames_acquired, 1);
        assert!(logger.is_finalized());
    }

    struct StopAfter(usize);

    impl FrameObserver for StopAfter {
        fn observe(&mut self, roi_luma: &GrayImage, report: &FrameReport) -> anyhow::Result<ControlFlow<()>> {
            assert_eq!(roi_luma.dimensions(), (40, 30));
            assert!(!report.sample.samples.is_empty());
            self.0 -= 1;
            Ok(if self.0 == 0 { ControlFlow::Break(()) } else { ControlFlow::Continue(()) })
        }
    }

    #[test]
    fn observer_can_end_the_run() {
        let mut pipeline = VelocityPipeline::new(config(), UniformFlow::new(1.0, 0.0), unit_factor()).unwrap();
        let mut source = SyntheticSource::new(10, (80, 60), Duration::from_millis(10));
        let mut logger = SeriesLogger::new(MemorySink::default(), 2).unwrap();
        let summary = pipeline.run(&mut source, &mut logger, &mut StopAfter(3), &AtomicBool::new(false)).unwrap();
        assert_eq!(summary.stopped_by, StopReason::Observer);
        assert_eq!(summary.readings_recorded, 3);
        assert_eq!(summary.rows_written, 3);
        assert_eq!(logger.flush_count(), 2);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let bad = PipelineConfig { frame_stride: 0, ..config() };
        assert!(VelocityPipeline::new(bad, UniformFlow::new(0.0, 0.0), unit_factor()).is_err());
        let bad = PipelineConfig { smoothing_alpha: 0.0, ..config() };
        assert!(VelocityPipeline::new(bad, UniformFlow::new(0.0, 0.0), unit_factor()).is_err());
    }

    #[test]
    fn calibrated_measurement_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut station = StationConfig::default();
        station.pipeline = config();
        station.calibration.factor_file = dir.path().join("conv_factor.txt");
        station.output.local_file = dir.path().join("output_data.csv");
        station.output.target = crate::core_modules::destination::OutputTarget::Local;
        station.output.flush_capacity = 2;

        CalibrationFactor::new(0.05).unwrap().save(&station.calibration.factor_file).unwrap();

        let mut source = SyntheticSource::new(4, (80, 60), Duration::from_millis(100));
        let summary = run_measurement(
            &station,
            &mut source,
            UniformFlow::new(0.0, 2.0),
            &mut crate::core_modules::destination::NoVolumes,
            &mut Headless,
            &AtomicBool::new(false),
        )
        .unwrap();
        assert_eq!(summary.rows_written, 3);

        let csv = std::fs::read_to_string(&station.output.local_file).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some(CsvFileSink::HEADER));
        let rows: Vec<(u64, f64)> = lines
            .map(|l| {
                let (frame, data) = l.split_once(',').unwrap();
                (frame.parse().unwrap(), data.parse().unwrap())
            })
            .collect();
        assert_eq!(rows.len(), 3);
        // 2 px/frame * 10 fps * 0.05
        assert!(rows.iter().all(|&(_, v)| (v - 1.0).abs() < 1e-9));
        assert_eq!(rows.iter().map(|r| r.0).collect::<Vec<_>>(), vec![1, 2, 3]);
    }
}
