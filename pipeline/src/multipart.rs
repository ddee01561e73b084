//! `multipart/x-mixed-replace` framing for MJPEG streams.
//!
//! Each part is
//!
//! ```text
//! --<boundary>\r\n
//! Content-Type: image/jpeg\r\n
//! \r\n
//! <jpeg bytes>\r\n
//! ```
//!
//! and the stream is never terminated with a closing delimiter.

use bytes::{BufMut, Bytes, BytesMut};

const PART_HEADERS: &[u8] = b"Content-Type: image/jpeg\r\n\r\n";
const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Value for the response `Content-Type` header.
pub fn content_type(boundary: &str) -> String {
    format!("multipart/x-mixed-replace; boundary={boundary}")
}

/// One complete part carrying `jpeg`.
pub fn encode_part(boundary: &str, jpeg: &[u8]) -> Bytes {
    let len = 2 + boundary.len() + PART_HEADERS.len() + jpeg.len() + 2 * CRLF.len();
    let mut part = BytesMut::with_capacity(len);
    part.put_slice(b"--");
    part.put_slice(boundary.as_bytes());
    part.put_slice(CRLF);
    part.put_slice(PART_HEADERS);
    part.put_slice(jpeg);
    part.put_slice(CRLF);
    part.freeze()
}

/// Parse state for an incoming multipart stream.
enum ParseState {
    /// Looking for the `--<boundary>\r\n` delimiter.
    SeekingBoundary,
    /// Found the delimiter, looking for the end of the part headers.
    SeekingHeaderEnd,
    /// Collecting body bytes until the next delimiter.
    CollectingBody,
}

/// Incremental parser for an MJPEG multipart stream.
///
/// Feed it chunks as they arrive, split anywhere; it returns every part body
/// completed by that chunk. A body is complete once the next delimiter has
/// been seen, so the last part of a stream is only returned by [`finish`].
///
/// [`finish`]: MultipartReader::finish
pub struct MultipartReader {
    delimiter: Vec<u8>,
    buffer: BytesMut,
    state: ParseState,
    /// Offset into `buffer` already scanned for the next delimiter.
    scanned: usize,
}

impl MultipartReader {
    pub fn new(boundary: &str) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 4);
        delimiter.extend_from_slice(b"--");
        delimiter.extend_from_slice(boundary.as_bytes());
        delimiter.extend_from_slice(CRLF);
        Self {
            delimiter,
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            scanned: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut parts = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, &self.delimiter) {
                        let _ = self.buffer.split_to(pos + self.delimiter.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep a tail in case the delimiter spans chunks.
                        if self.buffer.len() > self.delimiter.len() {
                            let _ = self.buffer.split_to(self.buffer.len() - self.delimiter.len());
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    // Headers end with an empty line; the first header line
                    // follows the delimiter's own CRLF.
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let _ = self.buffer.split_to(pos + HEADER_END.len());
                        self.scanned = 0;
                        self.state = ParseState::CollectingBody;
                    } else {
                        break;
                    }
                }
                ParseState::CollectingBody => {
                    let Some(pos) = find_subsequence(&self.buffer[self.scanned..], &self.delimiter)
                    else {
                        self.scanned = self.buffer.len().saturating_sub(self.delimiter.len());
                        break;
                    };
                    let body_end = self.scanned + pos;
                    let mut part = self.buffer.split_to(body_end);
                    let _ = self.buffer.split_to(self.delimiter.len());
                    if part.ends_with(CRLF) {
                        part.truncate(part.len() - CRLF.len());
                    }
                    parts.push(part.freeze());
                    self.state = ParseState::SeekingHeaderEnd;
                }
            }
        }

        parts
    }

    /// The body of a trailing part whose closing CRLF has arrived.
    pub fn finish(mut self) -> Option<Bytes> {
        match self.state {
            ParseState::CollectingBody if self.buffer.ends_with(CRLF) => {
                self.buffer.truncate(self.buffer.len() - CRLF.len());
                Some(self.buffer.freeze())
            }
            _ => None,
        }
    }
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
