//! Durable record of every detection/match outcome.
//!
//! The log is a single pretty-printed JSON array. Writers go through the
//! [`EventSink`] trait; [`JsonEventLog`] is the on-disk implementation,
//! [`MemoryEventLog`] the in-process one, and [`RecorderHandle`] funnels
//! several producers through one writer thread.

use crate::types::{BoundingBox, MatchVerdict};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Timestamp format of event records (local time, second precision).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Error, Debug)]
pub enum EventLogError {
    #[error("event log {path} is corrupt, refusing to overwrite it: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("event log I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode event log: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("recorder thread exited")]
    ChannelClosed,
}

impl EventLogError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    FaceRecognized,
    FaceUnauthorised,
    /// Detected but not scored (the face's embedding could not be compared).
    FaceDetected,
}

/// One detected face in one processed image or frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: String,
    #[serde(rename = "source_image")]
    pub source: String,
    pub face_index: usize,
    pub bbox: BoundingBox,
    pub det_score: f32,
    pub recognized_as: String,
    pub confidence_score: f32,
    pub event_type: EventType,
}

impl EventRecord {
    /// Record for a face that was scored.
    pub fn scored(
        timestamp: &str,
        source: &str,
        face_index: usize,
        bbox: BoundingBox,
        det_score: f32,
        verdict: &MatchVerdict,
    ) -> Self {
        Self {
            timestamp: timestamp.to_string(),
            source: source.to_string(),
            face_index,
            bbox,
            det_score,
            recognized_as: verdict.label.to_string(),
            confidence_score: verdict.confidence,
            event_type: if verdict.is_accepted {
                EventType::FaceRecognized
            } else {
                EventType::FaceUnauthorised
            },
        }
    }

    /// Record for a face whose scoring failed.
    pub fn unscored(
        timestamp: &str,
        source: &str,
        face_index: usize,
        bbox: BoundingBox,
        det_score: f32,
    ) -> Self {
        Self {
            timestamp: timestamp.to_string(),
            source: source.to_string(),
            face_index,
            bbox,
            det_score,
            recognized_as: "Unknown".to_string(),
            confidence_score: 0.0,
            event_type: EventType::FaceDetected,
        }
    }
}

/// Append-only destination for event records.
pub trait EventSink {
    fn append(&self, record: &EventRecord) -> Result<(), EventLogError>;
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn append(&self, record: &EventRecord) -> Result<(), EventLogError> {
        (**self).append(record)
    }
}

impl<T: EventSink + ?Sized> EventSink for Box<T> {
    fn append(&self, record: &EventRecord) -> Result<(), EventLogError> {
        (**self).append(record)
    }
}

/// JSON document on disk, rewritten in full on every append.
///
/// Each append holds an exclusive `flock` on `<log>.lock` for the whole
/// read-modify-write, and the new document replaces the old one by rename.
#[derive(Debug, Clone)]
pub struct JsonEventLog {
    path: PathBuf,
}

impl JsonEventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record. An absent or zero-length file is an empty log.
    pub fn load(&self) -> Result<Vec<EventRecord>, EventLogError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EventLogError::io(&self.path, e)),
        };
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).map_err(|source| EventLogError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn write_all(&self, records: &[EventRecord]) -> Result<(), EventLogError> {
        let mut data = serde_json::to_string_pretty(records).map_err(EventLogError::Encode)?;
        data.push('\n');

        let tmp = self.tmp_path();
        let mut file = File::create(&tmp).map_err(|e| EventLogError::io(&tmp, e))?;
        file.write_all(data.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| EventLogError::io(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| EventLogError::io(&self.path, e))
    }
}

impl EventSink for JsonEventLog {
    fn append(&self, record: &EventRecord) -> Result<(), EventLogError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| EventLogError::io(parent, e))?;
        }

        let _lock = FileLock::exclusive(&self.lock_path())?;

        let mut records = self.load()?;
        records.push(record.clone());
        self.write_all(&records)?;

        tracing::debug!(
            path = %self.path.display(),
            total = records.len(),
            face_index = record.face_index,
            "event recorded"
        );
        Ok(())
    }
}

/// Exclusive advisory lock, released when the file is closed on drop.
struct FileLock {
    _file: File,
}

impl FileLock {
    fn exclusive(path: &Path) -> Result<Self, EventLogError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| EventLogError::io(path, e))?;

        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(EventLogError::io(path, std::io::Error::last_os_error()));
        }
        Ok(Self { _file: file })
    }
}

/// Records held in memory.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    records: Mutex<Vec<EventRecord>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl EventSink for MemoryEventLog {
    fn append(&self, record: &EventRecord) -> Result<(), EventLogError> {
        match self.records.lock() {
            Ok(mut records) => records.push(record.clone()),
            Err(poisoned) => poisoned.into_inner().push(record.clone()),
        }
        Ok(())
    }
}

struct AppendRequest {
    record: EventRecord,
    reply: oneshot::Sender<Result<(), EventLogError>>,
}

/// Clone-safe handle to a single writer thread that owns the sink.
///
/// Must be used from synchronous code (it blocks on the reply).
#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::Sender<AppendRequest>,
}

impl RecorderHandle {
    /// Spawn the writer thread. It exits once every handle is dropped.
    pub fn spawn<S>(sink: S) -> Result<Self, EventLogError>
    where
        S: EventSink + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<AppendRequest>(16);

        std::thread::Builder::new()
            .name("vigil-recorder".into())
            .spawn(move || {
                tracing::debug!("recorder thread started");
                while let Some(req) = rx.blocking_recv() {
                    let result = sink.append(&req.record);
                    if let Err(e) = &result {
                        tracing::error!(error = %e, "event append failed");
                    }
                    let _ = req.reply.send(result);
                }
                tracing::debug!("recorder thread exiting");
            })
            .map_err(|e| EventLogError::Io {
                path: PathBuf::from("<recorder thread>"),
                source: e,
            })?;

        Ok(Self { tx })
    }
}

impl EventSink for RecorderHandle {
    fn append(&self, record: &EventRecord) -> Result<(), EventLogError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .blocking_send(AppendRequest {
                record: record.clone(),
                reply: reply_tx,
            })
            .map_err(|_| EventLogError::ChannelClosed)?;
        reply_rx
            .blocking_recv()
            .map_err(|_| EventLogError::ChannelClosed)?
    }
}
