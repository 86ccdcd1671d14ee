//! Opening capture sources at a byte offset.
//!
//! Files are read by seeking to the offset and bounding the read by the size
//! observed when the poll started. HTTP sources are polled with
//! `Range: bytes=<offset>-`; servers that ignore the range are handled by
//! discarding the first `offset` bytes of the full body.

use super::lines::{finish_remainder, read_lines, ByteStream};
use super::parser::{ComponentTree, FrameAssembler};
use crate::config::IngestConfig;
use crate::error::{Error, Result};
use crate::types::{CaptureRecord, Locator};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use std::io::SeekFrom;
use std::time::Duration;
use tokio::io::AsyncSeekExt;
use tokio_util::sync::CancellationToken;

/// Bytes available from a source starting at some offset.
pub struct SourceRead {
    pub stream: ByteStream,
    /// Total source size when known
    pub total_size: Option<u64>,
    /// The source is now shorter than the requested offset
    pub truncated: bool,
}

impl SourceRead {
    fn truncated(total_size: Option<u64>) -> Self {
        Self {
            stream: ByteStream::empty(),
            total_size,
            truncated: true,
        }
    }
}

/// Opens file and HTTP capture sources.
#[derive(Clone)]
pub struct SourceReader {
    http: reqwest::Client,
    chunk_size: usize,
}

impl SourceReader {
    pub fn new(config: &IngestConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .user_agent(concat!("tickscope/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            chunk_size: config.read_chunk_bytes,
        })
    }

    /// Open `locator` for reading from `offset` onward.
    pub async fn open_from(&self, locator: &Locator, offset: u64) -> Result<SourceRead> {
        match locator {
            Locator::File(path) => {
                let size = tokio::fs::metadata(path).await?.len();
                if size < offset {
                    return Ok(SourceRead::truncated(Some(size)));
                }
                let mut file = tokio::fs::File::open(path).await?;
                if offset > 0 {
                    file.seek(SeekFrom::Start(offset)).await?;
                }
                Ok(SourceRead {
                    stream: ByteStream::file(file, size - offset, self.chunk_size),
                    total_size: Some(size),
                    truncated: false,
                })
            }
            Locator::Http(url) => self.open_http(url, offset).await,
        }
    }

    async fn open_http(&self, url: &str, offset: u64) -> Result<SourceRead> {
        let response = self
            .http
            .get(url)
            .header(RANGE, format!("bytes={}-", offset))
            .send()
            .await?;
        let status = response.status();

        match status {
            StatusCode::PARTIAL_CONTENT => {
                let total = header_str(&response, CONTENT_RANGE).and_then(content_range_total);
                Ok(SourceRead {
                    stream: ByteStream::http(response, 0),
                    total_size: total,
                    truncated: false,
                })
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                let total = header_str(&response, CONTENT_RANGE).and_then(content_range_total);
                match total {
                    Some(total) if total < offset => Ok(SourceRead::truncated(Some(total))),
                    _ => Ok(SourceRead {
                        stream: ByteStream::empty(),
                        total_size: total,
                        truncated: false,
                    }),
                }
            }
            s if s.is_success() => {
                // Range ignored: the full body comes back
                let total: Option<u64> =
                    header_str(&response, CONTENT_LENGTH).and_then(|v| v.parse().ok());
                if total.is_some_and(|t| t < offset) {
                    return Ok(SourceRead::truncated(total));
                }
                Ok(SourceRead {
                    stream: ByteStream::http(response, offset),
                    total_size: total,
                    truncated: false,
                })
            }
            s => Err(Error::SourceUnavailable {
                locator: url.to_string(),
                message: format!("HTTP {}", s),
            }),
        }
    }

    /// Check that a source exists and report its size when known.
    pub async fn probe(&self, locator: &Locator) -> Result<Option<u64>> {
        match locator {
            Locator::File(path) => {
                let meta = tokio::fs::metadata(path)
                    .await
                    .map_err(|e| Error::SourceUnavailable {
                        locator: locator.to_string(),
                        message: e.to_string(),
                    })?;
                if !meta.is_file() {
                    return Err(Error::SourceUnavailable {
                        locator: locator.to_string(),
                        message: "not a regular file".to_string(),
                    });
                }
                Ok(Some(meta.len()))
            }
            Locator::Http(url) => {
                let response = self
                    .http
                    .get(url.as_str())
                    .header(RANGE, "bytes=0-0")
                    .send()
                    .await?;
                let status = response.status();
                if status == StatusCode::PARTIAL_CONTENT
                    || status == StatusCode::RANGE_NOT_SATISFIABLE
                {
                    return Ok(header_str(&response, CONTENT_RANGE).and_then(content_range_total));
                }
                if status.is_success() {
                    return Ok(header_str(&response, CONTENT_LENGTH).and_then(|v| v.parse().ok()));
                }
                Err(Error::SourceUnavailable {
                    locator: url.clone(),
                    message: format!("HTTP {}", status),
                })
            }
        }
    }
}

fn header_str(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<&str> {
    response.headers().get(name)?.to_str().ok()
}

/// Total length from `bytes a-b/<total>` or `bytes */<total>`.
pub fn content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

/// Result of a full source scan.
#[derive(Debug, Default)]
pub struct ScanSummary {
    pub frames: u64,
    pub bytes: u64,
    pub skipped_lines: usize,
    pub last_tick: Option<u64>,
    pub tree: ComponentTree,
}

/// Read a whole source from the start, handing each assembled frame to `on_frame`.
///
/// The final line is accepted even without a trailing newline. Cancellation
/// stops the scan with [`Error::Cancelled`].
pub async fn scan_source<F>(
    reader: &SourceReader,
    locator: &Locator,
    cancel: &CancellationToken,
    mut on_frame: F,
) -> Result<ScanSummary>
where
    F: FnMut(CaptureRecord),
{
    let mut read = reader.open_from(locator, 0).await?;
    let mut assembler = FrameAssembler::new();
    let mut summary = ScanSummary::default();

    let lines = read_lines(&mut read.stream, Vec::new(), None, cancel, |line| {
        if let Some(frame) = assembler.push_line(line) {
            fold_frame(&mut summary, frame, &mut on_frame);
        }
    })
    .await?;
    finish_remainder(&lines.remainder, |line| {
        if let Some(frame) = assembler.push_line(line) {
            fold_frame(&mut summary, frame, &mut on_frame);
        }
    });
    if let Some(frame) = assembler.flush() {
        fold_frame(&mut summary, frame, &mut on_frame);
    }

    summary.bytes = lines.bytes_read;
    summary.skipped_lines = assembler.skipped();
    Ok(summary)
}

fn fold_frame<F>(summary: &mut ScanSummary, frame: CaptureRecord, on_frame: &mut F)
where
    F: FnMut(CaptureRecord),
{
    summary.tree.observe(&frame);
    summary.frames += 1;
    summary.last_tick = Some(summary.last_tick.map_or(frame.tick, |t| t.max(frame.tick)));
    on_frame(frame);
}
