mod capture;
mod display;

use anyhow::{Context, Result};
use capture::{FarnebackFlow, OpenCvSource};
use clap::{Parser, Subcommand};
use display::FlowWindow;
use flowmeter::core_modules::calibration::{NumericPrompt, RqrrDetector};
use flowmeter::core_modules::destination::LsblkVolumeLocator;
use flowmeter::pipeline::{FrameObserver, Headless};
use flowmeter::{StationConfig, run_calibration, run_measurement};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "camera_station")]
#[command(about = "Measure surface velocity from a camera, or calibrate it with a QR marker")]
#[command(version)]
struct Cli {
    /// Station configuration (YAML). Defaults apply when the file is missing.
    #[arg(long, default_value = "station.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the velocity measurement and log the series to CSV.
    Measure {
        /// Read a recorded clip instead of the camera.
        #[arg(long)]
        video: Option<PathBuf>,

        /// Capture device index.
        #[arg(long, default_value = "0")]
        camera: i32,

        /// Show the sampled flow in a window (press q to stop).
        #[arg(long)]
        display: bool,
    },

    /// Derive the pixel-to-centimetre factor from a QR marker of known size.
    Calibrate {
        /// Capture device index.
        #[arg(long, default_value = "0")]
        camera: i32,
    },
}

/// Numeric entry on the terminal.
struct StdinPrompt;

impl NumericPrompt for StdinPrompt {
    fn prompt(&mut self, title: &str, message: &str) -> Result<String> {
        print!("[{title}] {message} ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim().to_string())
    }
}

fn load_config(path: &Path) -> Result<StationConfig> {
    if !path.exists() {
        warn!(path = %path.display(), "no configuration file, using defaults");
        return Ok(StationConfig::default());
    }
    StationConfig::load(path).with_context(|| format!("loading {}", path.display()))
}

fn measure(config: StationConfig, video: Option<PathBuf>, camera: i32, display: bool, stop: &AtomicBool) -> Result<()> {
    let mut config = config;
    let mut source = match &video {
        Some(path) => OpenCvSource::file(path)?,
        None => OpenCvSource::camera(camera)?,
    };
    if config.pipeline.fixed_frame_rate.is_none() {
        config.pipeline.fixed_frame_rate = source.container_fps();
    }

    let flow = FarnebackFlow::new(config.pipeline.window_size);
    let mut observer: Box<dyn FrameObserver> = if display {
        Box::new(FlowWindow::new(true))
    } else {
        Box::new(Headless)
    };

    let summary = run_measurement(&config, &mut source, flow, &mut LsblkVolumeLocator, observer.as_mut(), stop)?;
    info!(
        frames = summary.frames_acquired,
        readings = summary.readings_recorded,
        rows = summary.rows_written,
        stopped_by = ?summary.stopped_by,
        "measurement complete"
    );
    Ok(())
}

fn calibrate(config: StationConfig, camera: i32, stop: &AtomicBool) -> Result<()> {
    let options = config.calibration.options()?;
    let mut source = OpenCvSource::camera(camera)?;
    let outcome = run_calibration(
        &mut source,
        &mut RqrrDetector,
        &mut StdinPrompt,
        &options,
        &config.calibration.factor_file,
        stop,
    )?;
    println!(
        "Conversion factor {} cm/px (marker {} cm over {:.2} px) saved to {}",
        outcome.factor,
        outcome.physical_size,
        outcome.pixel_span,
        config.calibration.factor_file.display()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowmeter=info,camera_station=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    let stop = Arc::new(AtomicBool::new(false));
    let signal_flag = Arc::clone(&stop);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing current frame");
            signal_flag.store(true, Ordering::Relaxed);
        }
    });

    // The capture loop is blocking; keep it off the async workers.
    tokio::task::spawn_blocking(move || match cli.command {
        Commands::Measure { video, camera, display } => measure(config, video, camera, display, &stop),
        Commands::Calibrate { camera } => calibrate(config, camera, &stop),
    })
    .await?
}
