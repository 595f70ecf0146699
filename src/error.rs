// THEORY:
// One error type for the whole measurement core. Each variant maps onto a
// failure class the operator has to be able to tell apart: some are fatal for
// a run (acquisition, dimension change, missing removable volume), some only
// fail a calibration session, and the storage variants distinguish "rows are
// still pending" from "rows are gone".

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VelocityError {
    /// The first frame could not be read, so no ROI or grid can be derived.
    #[error("could not acquire the first frame: {0}")]
    AcquisitionFailure(String),

    #[error("frame size changed mid-run: expected {expected:?}, got {found:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        found: (u32, u32),
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid calibration input: {0}")]
    InvalidCalibrationInput(String),

    /// The marker quadrilateral collapsed to a zero pixel span.
    #[error("degenerate marker geometry: measured pixel span is {0}")]
    DegenerateMarkerGeometry(f64),

    #[error("calibration session ended before the marker was stable")]
    CalibrationIncomplete,

    /// A flush failed. The rows it tried to write are still buffered.
    #[error("failed to write {rows} buffered rows to {path:?}")]
    StorageWrite {
        path: PathBuf,
        rows: usize,
        #[source]
        source: std::io::Error,
    },

    /// The final flush failed and the buffered rows could not be kept.
    #[error("data loss: {rows} readings could not be written to {path:?}")]
    DataLoss {
        path: PathBuf,
        rows: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("removable-volume logging was requested but no removable volume is mounted")]
    NoRemovableVolume,

    #[error("failed to parse configuration")]
    Config(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Failure reported by an injected collaborator (camera, flow, QR, prompt).
    #[error(transparent)]
    Capability(#[from] anyhow::Error),
}

pub type Result<T, E = VelocityError> = std::result::Result<T, E>;
