//! Output sinks for merged documents.

use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{Delivery, OutputSink};
use crate::codec::ChunkCodec;
use crate::error::AdapterError;
use crate::progress::Notification;

/// Reject names that would escape the output directory.
fn validate_file_name(name: &str) -> Result<(), AdapterError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.chars().any(char::is_control);
    if bad {
        return Err(AdapterError::Other(format!(
            "'{name}' is not a plain file name"
        )));
    }
    Ok(())
}

/// Writes the document into a directory.
///
/// Uses atomic write (temp file + rename) so a crash never leaves a
/// truncated PDF under the final name.
#[derive(Debug, Clone)]
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl OutputSink for FileSink {
    async fn deliver(&self, bytes: Vec<u8>, suggested_name: &str) -> Result<Delivery, AdapterError> {
        validate_file_name(suggested_name)?;
        let dir = self.dir.clone();
        let path = dir.join(suggested_name);
        let len = bytes.len();

        let written = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&dir, &written, &bytes))
            .await
            .map_err(|e| AdapterError::Other(format!("write task failed: {e}")))??;

        info!("Wrote {} bytes to {}", len, path.display());
        Ok(Delivery {
            file_name: suggested_name.to_string(),
            path: Some(path),
        })
    }
}

fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), AdapterError> {
    let io_err = |at: &Path, e: std::io::Error| AdapterError::Io {
        resource: at.display().to_string(),
        source: e,
    };

    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| io_err(dir, e))?;
    tmp.write_all(bytes).map_err(|e| io_err(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| io_err(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| io_err(path, e.error))?;
    Ok(())
}

/// Serialised `download` frames waiting for a host session to write them.
pub type DownloadFrames = mpsc::Receiver<String>;

/// Frames a sink may queue before `deliver` waits for the session.
const DOWNLOAD_BACKLOG: usize = 4;

/// Delivers the document in-band as a [`Notification::Download`] frame.
///
/// Frames travel on their own bounded channel rather than the broadcast
/// notifier, so a slow reader delays a merge instead of losing its output.
/// A document whose complete frame would exceed the frame limit is refused.
#[derive(Debug, Clone)]
pub struct MessageSink {
    frames: mpsc::Sender<String>,
    codec: ChunkCodec,
    max_message_bytes: usize,
}

impl MessageSink {
    /// A sink and the receiver its frames arrive on; hand the receiver to
    /// [`crate::message::serve`].
    pub fn channel(codec: ChunkCodec, max_message_bytes: usize) -> (Self, DownloadFrames) {
        let (tx, rx) = mpsc::channel(DOWNLOAD_BACKLOG);
        let sink = Self {
            frames: tx,
            codec,
            max_message_bytes,
        };
        (sink, rx)
    }
}

#[async_trait]
impl OutputSink for MessageSink {
    async fn deliver(&self, bytes: Vec<u8>, suggested_name: &str) -> Result<Delivery, AdapterError> {
        validate_file_name(suggested_name)?;

        let codec = self.codec.clone();
        let data = tokio::task::spawn_blocking(move || codec.encode(&bytes))
            .await
            .map_err(|e| AdapterError::Other(format!("encode task failed: {e}")))?
            .map_err(|e| AdapterError::Other(e.to_string()))?;

        let frame = serde_json::to_string(&Notification::Download {
            file_name: suggested_name.to_string(),
            data,
        })
        .map_err(|e| AdapterError::Other(format!("serialising download frame: {e}")))?;

        if frame.len() > self.max_message_bytes {
            return Err(AdapterError::Other(format!(
                "download frame is {} bytes, frame limit is {}",
                frame.len(),
                self.max_message_bytes
            )));
        }

        debug!("Queueing {}-byte download frame for {}", frame.len(), suggested_name);
        self.frames
            .send(frame)
            .await
            .map_err(|_| AdapterError::Unavailable {
                resource: "host session".into(),
                reason: "no session is reading download frames".into(),
            })?;
        Ok(Delivery {
            file_name: suggested_name.to_string(),
            path: None,
        })
    }
}
