//! Server-sent event framing
//!
//! Reassembles the upstream body into whole events. Byte chunks may split an
//! event (or a UTF-8 sequence) anywhere; frames are separated by a blank line
//! with either LF or CRLF line endings; `data:` may span several lines.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;

use crate::connection::Connection;
use crate::error::{Error, Result};

/// Largest single event accepted before the stream is failed.
pub(crate) const MAX_EVENT_BYTES: usize = 4 * 1024 * 1024;

/// One complete upstream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Lazy sequence of upstream events read from an open connection.
#[derive(Debug)]
pub struct RawEvents {
    connection: Connection,
    buffer: Vec<u8>,
    /// Bytes of `buffer` already searched without finding a separator
    scanned: usize,
    finished: bool,
}

impl RawEvents {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            buffer: Vec::new(),
            scanned: 0,
            finished: false,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    fn push(&mut self, chunk: &[u8]) {
        // CR only ever appears in line endings; JSON escapes it inside strings
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
    }

    /// Pop the next complete frame. Frames with neither data nor an event
    /// name (comments, keep-alives) are consumed and skipped.
    fn next_frame(&mut self) -> Option<Result<RawEvent>> {
        loop {
            // Back up one byte so a separator split across chunks is found
            let from = self.scanned.saturating_sub(1);
            let Some(offset) = self.buffer[from..].windows(2).position(|w| w == b"\n\n") else {
                self.scanned = self.buffer.len();
                if self.buffer.len() > MAX_EVENT_BYTES {
                    self.finished = true;
                    self.buffer.clear();
                    self.scanned = 0;
                    return Some(Err(Error::upstream(format!(
                        "event exceeds {MAX_EVENT_BYTES} bytes"
                    ))));
                }
                return None;
            };
            let end = from + offset;
            let frame: Vec<u8> = self.buffer.drain(..end + 2).collect();
            self.scanned = 0;
            match parse_frame(&frame[..end]) {
                Ok(Some(event)) => return Some(Ok(event)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }

    /// Whatever is left when upstream closes without a trailing blank line.
    fn take_trailing(&mut self) -> Option<Result<RawEvent>> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        if rest.iter().all(|b| b.is_ascii_whitespace()) {
            return None;
        }
        parse_frame(&rest).transpose()
    }
}

fn parse_frame(frame: &[u8]) -> Result<Option<RawEvent>> {
    let text = std::str::from_utf8(frame)
        .map_err(|e| Error::upstream(format!("event is not valid UTF-8: {e}")))?;

    let mut event = None;
    let mut data: Vec<&str> = Vec::new();
    for line in text.split('\n') {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => data.push(value),
            "event" => event = Some(value.to_string()),
            _ => {}
        }
    }

    if data.is_empty() && event.is_none() {
        return Ok(None);
    }
    Ok(Some(RawEvent {
        event,
        data: data.join("\n"),
    }))
}

impl Stream for RawEvents {
    type Item = Result<RawEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(frame) = this.next_frame() {
                return Poll::Ready(Some(frame));
            }
            if this.finished {
                return Poll::Ready(None);
            }
            match this.connection.poll_chunk(cx) {
                Poll::Ready(Some(Ok(chunk))) => this.push(&chunk),
                Poll::Ready(Some(Err(e))) => {
                    this.finished = true;
                    this.buffer.clear();
                    this.scanned = 0;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    this.finished = true;
                    return Poll::Ready(this.take_trailing());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
