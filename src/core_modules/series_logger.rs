// THEORY:
// The `SeriesLogger` is the only stage that touches durable storage during a
// measurement run. Writing one row per frame to a USB stick is slow and wears
// the medium, so readings are held in memory and written in batches.
//
// Key architectural principles:
// 1.  **Write, Then Clear**: A batch leaves the buffer only after the sink has
//     reported it durable. A failed write keeps every row pending. The next
//     attempt comes after another `capacity` rows (or at `finalize`), so an
//     outage costs one write attempt per batch, not one per frame. While the
//     sink stays down the buffer grows by `capacity` rows per attempt; nothing
//     is dropped before `finalize`.
// 2.  **Strict Order**: Rows reach the sink in the order they were recorded.
//     There is a single owner and no background flushing.
// 3.  **Loud Loss**: If the final flush fails there is nowhere left to keep the
//     rows. That is reported as `DataLoss` with the row count, never swallowed.
// 4.  **Pluggable Sink**: The logger batches; a `BatchSink` knows the file
//     format. `CsvFileSink` writes the `Frame,Data` table.

use crate::error::{Result, VelocityError};
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

pub const DEFAULT_FLUSH_CAPACITY: usize = 25;

/// One smoothed velocity value for one processed frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VelocityReading {
    pub frame_index: u64,
    pub velocity: f64,
    /// Capture time in seconds since the source opened.
    pub timestamp: Option<f64>,
}

/// Durable destination for batches of readings.
pub trait BatchSink {
    /// Writes every row of `batch`, in order. On error nothing may be assumed
    /// written.
    fn write_batch(&mut self, batch: &[VelocityReading]) -> std::io::Result<()>;

    fn location(&self) -> &Path;
}

/// Appends rows to a `Frame,Data` CSV file.
#[derive(Debug)]
pub struct CsvFileSink {
    path: PathBuf,
}

impl CsvFileSink {
    pub const HEADER: &'static str = "Frame,Data";

    /// Creates (or truncates) the file and writes the header row.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = File::create(&path)?;
        writeln!(file, "{}", Self::HEADER)?;
        file.sync_all()?;
        Ok(Self { path })
    }

    pub fn render_rows(batch: &[VelocityReading]) -> String {
        let mut out = String::with_capacity(batch.len() * 24);
        for reading in batch {
            // Writing into a String cannot fail.
            let _ = writeln!(out, "{},{}", reading.frame_index, reading.velocity);
        }
        out
    }
}

impl BatchSink for CsvFileSink {
    fn write_batch(&mut self, batch: &[VelocityReading]) -> std::io::Result<()> {
        let rows = Self::render_rows(batch);
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(rows.as_bytes())?;
        file.sync_data()
    }

    fn location(&self) -> &Path {
        &self.path
    }
}

/// Batches readings in memory and hands them to a `BatchSink`.
pub struct SeriesLogger<S: BatchSink = CsvFileSink> {
    sink: S,
    buffer: Vec<VelocityReading>,
    capacity: usize,
    /// Buffer length that triggers the next automatic flush.
    flush_at: usize,
    flushes: usize,
    rows_written: usize,
    finalized: bool,
}

impl SeriesLogger<CsvFileSink> {
    /// Logger writing a fresh CSV file at `path`.
    pub fn create_csv(path: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        Self::new(CsvFileSink::create(path)?, capacity)
    }
}

impl<S: BatchSink> SeriesLogger<S> {
    pub fn new(sink: S, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(VelocityError::InvalidConfig("flush capacity must be at least 1".into()));
        }
        info!(path = %sink.location().display(), capacity, "series logger ready");
        Ok(Self {
            sink,
            buffer: Vec::with_capacity(capacity),
            capacity,
            flush_at: capacity,
            flushes: 0,
            rows_written: 0,
            finalized: false,
        })
    }

    /// Buffers a reading, flushing once the buffer holds `capacity` rows.
    ///
    /// A failed flush returns `StorageWrite`; the reading itself is always kept
    /// and the retry waits for `capacity` more rows.
    pub fn record(&mut self, reading: VelocityReading) -> Result<()> {
        self.buffer.push(reading);
        if self.buffer.len() >= self.flush_at {
            self.flush()?;
        }
        Ok(())
    }

    /// Writes all pending rows, clearing them only when the write succeeded.
    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        match self.sink.write_batch(&self.buffer) {
            Ok(()) => {
                debug!(rows = self.buffer.len(), "flushed readings");
                self.flushes += 1;
                self.rows_written += self.buffer.len();
                self.buffer.clear();
                self.flush_at = self.capacity;
                Ok(())
            }
            Err(source) => {
                self.flush_at = self.buffer.len() + self.capacity;
                error!(
                    rows = self.buffer.len(),
                    path = %self.sink.location().display(),
                    error = %source,
                    "flush failed, keeping rows for retry"
                );
                Err(VelocityError::StorageWrite {
                    path: self.sink.location().to_path_buf(),
                    rows: self.buffer.len(),
                    source,
                })
            }
        }
    }

    /// Writes whatever is still pending. Runs at most once; later calls are
    /// no-ops. If the write fails the pending rows are dropped and reported as
    /// `DataLoss`.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;

        match self.flush() {
            Ok(()) => {
                info!(rows = self.rows_written, path = %self.sink.location().display(), "series finalized");
                Ok(())
            }
            Err(VelocityError::StorageWrite { path, rows, source }) => {
                self.buffer.clear();
                error!(rows, path = %path.display(), "final flush failed, readings lost");
                Err(VelocityError::DataLoss { path, rows, source })
            }
            Err(other) => Err(other),
        }
    }

    pub fn pending(&self) -> &[VelocityReading] {
        &self.buffer
    }

    pub fn flush_count(&self) -> usize {
        self.flushes
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn location(&self) -> &Path {
        self.sink.location()
    }
}

impl<S: BatchSink> Drop for SeriesLogger<S> {
    fn drop(&mut self) {
        if !self.finalized {
            warn!("series logger dropped without finalize, flushing now");
            if let Err(e) = self.finalize() {
                error!(error = %e, "flush on drop failed");
            }
        }
    }
}
