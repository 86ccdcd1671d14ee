//! Line splitting over incrementally read byte sources.
//!
//! A [`ByteStream`] yields raw chunks from a file range, an HTTP body, or an
//! in-memory buffer. [`read_lines`] turns those chunks into complete lines and
//! hands back everything it did not consume as a remainder, so the next call
//! resumes exactly where this one stopped.

use crate::error::{Error, Result};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// Default chunk size for in-memory streams.
const MEMORY_CHUNK: usize = 64 * 1024;

/// Source of raw bytes for the line reader.
pub struct ByteStream {
    inner: StreamInner,
    chunk_size: usize,
}

enum StreamInner {
    Empty,
    Memory {
        data: Vec<u8>,
        pos: usize,
    },
    File {
        file: tokio::fs::File,
        remaining: u64,
    },
    Http {
        response: reqwest::Response,
        /// Bytes still to discard from the front of the body
        skip: u64,
        /// Body ended before `skip` bytes were discarded
        short: bool,
    },
}

impl ByteStream {
    /// A stream with no bytes.
    pub fn empty() -> Self {
        Self {
            inner: StreamInner::Empty,
            chunk_size: MEMORY_CHUNK,
        }
    }

    /// A stream over an in-memory buffer.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            inner: StreamInner::Memory {
                data: data.into(),
                pos: 0,
            },
            chunk_size: MEMORY_CHUNK,
        }
    }

    /// Override the chunk size (memory and file streams only).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// A stream over `remaining` bytes of an already positioned file.
    pub(crate) fn file(file: tokio::fs::File, remaining: u64, chunk_size: usize) -> Self {
        Self {
            inner: StreamInner::File { file, remaining },
            chunk_size: chunk_size.max(1),
        }
    }

    /// A stream over an HTTP response body, discarding the first `skip` bytes.
    pub(crate) fn http(response: reqwest::Response, skip: u64) -> Self {
        Self {
            inner: StreamInner::Http {
                response,
                skip,
                short: false,
            },
            chunk_size: MEMORY_CHUNK,
        }
    }

    /// True once an HTTP body ended before the requested skip was satisfied,
    /// meaning the remote source is now shorter than the caller's offset.
    pub fn ended_short(&self) -> bool {
        matches!(self.inner, StreamInner::Http { short: true, .. })
    }

    /// Next chunk of bytes, or `None` at end of stream.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        match &mut self.inner {
            StreamInner::Empty => Ok(None),
            StreamInner::Memory { data, pos } => {
                if *pos >= data.len() {
                    return Ok(None);
                }
                let end = (*pos + self.chunk_size).min(data.len());
                let chunk = data[*pos..end].to_vec();
                *pos = end;
                Ok(Some(chunk))
            }
            StreamInner::File { file, remaining } => {
                if *remaining == 0 {
                    return Ok(None);
                }
                let want = (*remaining).min(self.chunk_size as u64) as usize;
                let mut buf = vec![0u8; want];
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    // File shrank between the size check and the read
                    *remaining = 0;
                    return Ok(None);
                }
                buf.truncate(n);
                *remaining -= n as u64;
                Ok(Some(buf))
            }
            StreamInner::Http {
                response,
                skip,
                short,
            } => loop {
                let Some(bytes) = response.chunk().await? else {
                    if *skip > 0 {
                        *short = true;
                    }
                    return Ok(None);
                };
                if *skip == 0 {
                    return Ok(Some(bytes.to_vec()));
                }
                if (bytes.len() as u64) <= *skip {
                    *skip -= bytes.len() as u64;
                    continue;
                }
                let start = *skip as usize;
                *skip = 0;
                return Ok(Some(bytes[start..].to_vec()));
            },
        }
    }
}

/// Outcome of one [`read_lines`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReadSummary {
    /// Bytes pulled from the stream (the caller's offset advances by this)
    pub bytes_read: u64,
    /// Non-blank lines handed to the callback
    pub lines: usize,
    /// Unconsumed bytes: a partial trailing line plus any lines skipped by the cap
    pub remainder: Vec<u8>,
    /// The line cap was reached
    pub capped: bool,
    /// The stream reported end of data
    pub eof: bool,
}

/// Read complete lines from `stream`, starting with `leftover` from a previous call.
///
/// Lines are split on `\n` with a trailing `\r` stripped; blank lines are
/// skipped and do not count toward `max_lines`. Once `max_lines` lines have
/// been handed out, reading stops and everything not yet consumed is returned
/// in the remainder.
///
/// Cancellation returns [`Error::Cancelled`]; the caller's previous offset and
/// leftover stay valid because nothing is committed on that path.
pub async fn read_lines<F>(
    stream: &mut ByteStream,
    leftover: Vec<u8>,
    max_lines: Option<usize>,
    cancel: &CancellationToken,
    mut on_line: F,
) -> Result<ReadSummary>
where
    F: FnMut(&str),
{
    let mut buf = leftover;
    let mut consumed = 0usize;
    let mut summary = ReadSummary::default();

    loop {
        while let Some(pos) = buf[consumed..].iter().position(|&b| b == b'\n') {
            if max_lines.is_some_and(|max| summary.lines >= max) {
                summary.capped = true;
                break;
            }
            let mut line = &buf[consumed..consumed + pos];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            consumed += pos + 1;
            if emit_line(line, &mut on_line) {
                summary.lines += 1;
            }
        }
        if summary.capped || max_lines.is_some_and(|max| summary.lines >= max) {
            summary.capped = true;
            break;
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            chunk = stream.next_chunk() => chunk?,
        };

        match chunk {
            Some(chunk) => {
                summary.bytes_read += chunk.len() as u64;
                buf.drain(..consumed);
                consumed = 0;
                buf.extend_from_slice(&chunk);
            }
            None => {
                summary.eof = true;
                break;
            }
        }
    }

    buf.drain(..consumed);
    summary.remainder = buf;
    Ok(summary)
}

/// Hand a final unterminated line to the callback.
///
/// Used once a source is known to be complete, so a last line written
/// without a newline is not lost. Returns true if a line was emitted.
pub fn finish_remainder<F>(remainder: &[u8], mut on_line: F) -> bool
where
    F: FnMut(&str),
{
    let line = remainder.strip_suffix(b"\r").unwrap_or(remainder);
    emit_line(line, &mut on_line)
}

fn emit_line<F: FnMut(&str)>(line: &[u8], on_line: &mut F) -> bool {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return false;
    }
    on_line(text);
    true
}
