//! Host message protocol.
//!
//! Newline-delimited JSON frames, each tagged with `type`:
//!
//! ```text
//! → {"type":"start","url":"https://…/{page}.pdf"}
//! ← {"success":true}
//! ← {"type":"progressUpdate","current":1,"total":0}
//! → {"type":"MERGE_PDF","bookTitle":"My Book"}
//! ← {"success":true,"fileName":"My_Book_20260101_120000.pdf","pageCount":12}
//! ```
//!
//! Every request gets exactly one [`Response`]. Notifications from the
//! orchestrator are interleaved on the same stream as they happen.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::adapter::DownloadFrames;
use crate::error::PipelineError;
use crate::orchestrator::{Orchestrator, RunSnapshot};

/// A request frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Begin a capture run over `url`.
    #[serde(rename = "start")]
    Start { url: String },

    /// Stop the active run and clear its pages.
    #[serde(rename = "stop")]
    Stop,

    /// Merge the stored pages and deliver the result.
    #[serde(rename = "MERGE_PDF", rename_all = "camelCase")]
    MergePdf {
        #[serde(default)]
        book_title: Option<String>,
    },

    /// A page captured by the host; `data` is chunk-codec text.
    #[serde(rename = "pageCaptured")]
    PageCaptured { index: u32, data: String },

    /// Report the Run state.
    #[serde(rename = "status")]
    Status,
}

/// The reply to one [`Request`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<RunSnapshot>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(error: &PipelineError) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

/// Parse one frame, refusing anything over `limit` bytes.
pub fn parse_frame(line: &str, limit: usize) -> Result<Request, PipelineError> {
    if line.len() > limit {
        return Err(PipelineError::MessageTooLarge {
            size: line.len(),
            limit,
        });
    }
    serde_json::from_str(line).map_err(|e| PipelineError::MalformedMessage(e.to_string()))
}

impl Orchestrator {
    /// Dispatch a request. Failures become `{success: false, error}`.
    pub async fn handle(&self, request: Request) -> Response {
        let result = match request {
            Request::Start { url } => self.start(url).await.map(|()| Response::ok()),
            Request::Stop => self.stop().await.map(|()| Response::ok()),
            Request::MergePdf { book_title } => {
                self.request_merge(book_title.as_deref())
                    .await
                    .map(|summary| Response {
                        success: true,
                        file_name: Some(summary.file_name),
                        page_count: Some(summary.page_count),
                        ..Response::default()
                    })
            }
            Request::PageCaptured { index, data } => self.record_encoded(index, data).await,
            Request::Status => Ok(Response {
                success: true,
                state: Some(self.snapshot()),
                ..Response::default()
            }),
        };

        result.unwrap_or_else(|e| {
            debug!("Request failed: {}", e);
            Response::failure(&e)
        })
    }

    async fn record_encoded(&self, index: u32, data: String) -> Result<Response, PipelineError> {
        let codec = self.codec().clone();
        let payload = tokio::task::spawn_blocking(move || codec.decode(&data))
            .await
            .map_err(|e| PipelineError::Internal(format!("decode task failed: {e}")))??;
        self.record_captured_page(index, payload).await?;
        Ok(Response::ok())
    }
}

async fn write_frame<W, T>(writer: &mut W, frame: &T, limit: usize) -> Result<(), PipelineError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let line = serde_json::to_string(frame)
        .map_err(|e| PipelineError::Internal(format!("serialising frame: {e}")))?;
    if line.len() > limit {
        return Err(PipelineError::MessageTooLarge {
            size: line.len(),
            limit,
        });
    }
    write_line(writer, line).await
}

async fn write_line<W>(writer: &mut W, mut line: String) -> Result<(), PipelineError>
where
    W: AsyncWrite + Unpin,
{
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Splits a byte stream into newline-terminated frames.
///
/// At most `limit` bytes of a frame are ever buffered; the rest of an
/// oversize frame is skipped. Partial state lives in the struct, so
/// `next_frame` can be cancelled by `select!` without losing input.
struct FrameReader<R> {
    reader: R,
    limit: usize,
    buf: Vec<u8>,
    size: usize,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    fn new(reader: R, limit: usize) -> Self {
        Self {
            reader,
            limit,
            buf: Vec::new(),
            size: 0,
        }
    }

    /// `Ok(None)` at end of input. A frame that is too long or not UTF-8
    /// comes back as an inner error and the stream stays usable.
    async fn next_frame(&mut self) -> std::io::Result<Option<Result<String, PipelineError>>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if self.size == 0 {
                    return Ok(None);
                }
                return Ok(Some(self.finish()));
            }

            let newline = available.iter().position(|&b| b == b'\n');
            let body = &available[..newline.unwrap_or(available.len())];
            let room = self.limit.saturating_sub(self.buf.len());
            self.buf.extend_from_slice(&body[..body.len().min(room)]);
            self.size += body.len();
            let consumed = newline.map_or(available.len(), |i| i + 1);
            self.reader.consume(consumed);

            if newline.is_some() {
                return Ok(Some(self.finish()));
            }
        }
    }

    fn finish(&mut self) -> Result<String, PipelineError> {
        let size = std::mem::take(&mut self.size);
        let mut bytes = std::mem::take(&mut self.buf);
        if size > self.limit {
            return Err(PipelineError::MessageTooLarge {
                size,
                limit: self.limit,
            });
        }
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        String::from_utf8(bytes)
            .map_err(|e| PipelineError::MalformedMessage(format!("frame is not valid UTF-8: {e}")))
    }
}

async fn next_download(downloads: &mut Option<DownloadFrames>) -> Option<String> {
    match downloads {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn flush_downloads<W>(
    downloads: &mut Option<DownloadFrames>,
    writer: &mut W,
) -> Result<(), PipelineError>
where
    W: AsyncWrite + Unpin,
{
    if let Some(rx) = downloads {
        while let Ok(frame) = rx.try_recv() {
            write_line(writer, frame).await?;
        }
    }
    Ok(())
}

/// Run the protocol over a byte stream until the reader reaches EOF.
///
/// Requests are handled one at a time, in arrival order. A frame that is
/// oversize or not UTF-8 gets a failure response and the session goes on.
/// `downloads` is the receiver of the [`crate::adapter::MessageSink`] the
/// orchestrator delivers to, if any; a merge's `download` frame is written
/// before the merge's response. Notifications are forwarded between
/// requests; a stream that falls behind loses the oldest.
pub async fn serve<R, W>(
    orchestrator: &Orchestrator,
    mut downloads: Option<DownloadFrames>,
    reader: R,
    mut writer: W,
) -> Result<(), PipelineError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let limit = orchestrator.config().max_message_bytes;
    let mut frames = FrameReader::new(reader, limit);
    let mut notifications = orchestrator.subscribe();
    info!("Host session started");

    loop {
        tokio::select! {
            frame = frames.next_frame() => {
                let Some(frame) = frame? else {
                    break;
                };
                let response = match frame {
                    Ok(line) if line.trim().is_empty() => continue,
                    Ok(line) => match parse_frame(&line, limit) {
                        Ok(request) => orchestrator.handle(request).await,
                        Err(e) => {
                            warn!("Rejected frame: {}", e);
                            Response::failure(&e)
                        }
                    },
                    Err(e) => {
                        warn!("Rejected frame: {}", e);
                        Response::failure(&e)
                    }
                };
                flush_downloads(&mut downloads, &mut writer).await?;
                write_frame(&mut writer, &response, limit).await?;
            }
            Some(frame) = next_download(&mut downloads) => write_line(&mut writer, frame).await?,
            event = notifications.recv() => match event {
                Ok(notification) => match write_frame(&mut writer, &notification, limit).await {
                    Err(PipelineError::MessageTooLarge { size, limit }) => {
                        warn!("Dropped a {}-byte notification (limit {})", size, limit);
                    }
                    other => other?,
                },
                Err(RecvError::Lagged(n)) => warn!("Host stream lagged; {} notification(s) dropped", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    // Flush what the last requests produced before the reader hit EOF.
    flush_downloads(&mut downloads, &mut writer).await?;
    while let Ok(notification) = notifications.try_recv() {
        if let Err(e) = write_frame(&mut writer, &notification, limit).await {
            match e {
                PipelineError::MessageTooLarge { .. } => warn!("Dropped notification: {}", e),
                other => return Err(other),
            }
        }
    }

    info!("Host session ended");
    Ok(())
}
