// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Request body decoders: known-length and chunked transfer coding.

use crate::errors::{Error, Result};
use crate::stream::{StreamReader, StreamWriter, Transport};

const CRLF: &[u8] = b"\r\n";
const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// I/O context a body reader operates in. The request owns the streams and
/// lends them out per call.
pub struct BodyContext<'a> {
    /// Raw transport under the streams.
    pub transport: &'a mut dyn Transport,
    /// Buffered reader the body is decoded from.
    pub reader: &'a mut StreamReader,
    /// Buffered writer, needed for the 100-Continue interim response.
    pub writer: &'a mut StreamWriter,
    /// Set while the peer is holding its body back for `100 Continue`.
    pub needs_100_continue: &'a mut bool,
}

impl std::fmt::Debug for BodyContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyContext")
            .field("needs_100_continue", &self.needs_100_continue)
            .finish()
    }
}

impl BodyContext<'_> {
    /// Emit the interim response exactly once, on the first body read.
    fn send_100_if_needed(&mut self) -> Result<()> {
        if !*self.needs_100_continue {
            return Ok(());
        }
        *self.needs_100_continue = false;
        self.writer
            .write(self.transport, CONTINUE_RESPONSE)
            .map_err(Error::from_io)?;
        self.writer.flush(self.transport).map_err(Error::from_io)
    }
}

/// Decoder for the body of a single request. Exactly one per request; never
/// reused across requests.
#[derive(Debug)]
pub enum BodyReader {
    /// The request carries no body.
    None,
    /// Body framed by `Content-Length`.
    KnownLength {
        /// Bytes the peer still owes us.
        remaining: u64,
    },
    /// Body framed with the chunked transfer coding.
    Chunked {
        /// Decoded bytes not yet handed to the caller.
        buffer: Vec<u8>,
        /// Running total of wire bytes consumed, checked against `max_len`.
        bytes_read: u64,
        /// The zero-size terminator chunk has been seen.
        done: bool,
        /// Trailer headers have been read (and discarded).
        trailers_read: bool,
        /// `max_request_body_size`; zero disables the check.
        max_len: u64,
    },
}

impl BodyReader {
    /// Decoder for a `Content-Length: n` body.
    pub fn known_length(n: u64) -> Self {
        BodyReader::KnownLength { remaining: n }
    }

    /// Decoder for a chunked body bounded by `max_len` wire bytes.
    pub fn chunked(max_len: u64) -> Self {
        BodyReader::Chunked {
            buffer: Vec::new(),
            bytes_read: 0,
            done: false,
            trailers_read: false,
            max_len,
        }
    }

    /// True once every body byte has been delivered.
    pub fn is_exhausted(&self) -> bool {
        match self {
            BodyReader::None => true,
            BodyReader::KnownLength { remaining } => *remaining == 0,
            BodyReader::Chunked { buffer, done, .. } => *done && buffer.is_empty(),
        }
    }

    /// Read up to `size` body bytes (`None` reads to the end). Returns an
    /// empty vector once the body is exhausted.
    pub fn read(&mut self, cx: &mut BodyContext<'_>, size: Option<usize>) -> Result<Vec<u8>> {
        match self {
            BodyReader::None => Ok(Vec::new()),
            BodyReader::KnownLength { remaining } => {
                if *remaining == 0 {
                    return Ok(Vec::new());
                }
                let want = size.map_or(*remaining, |s| (s as u64).min(*remaining)) as usize;
                if want == 0 {
                    return Ok(Vec::new());
                }
                cx.send_100_if_needed()?;
                let data = cx.reader.read(cx.transport, want)?;
                *remaining -= data.len() as u64;
                Ok(data)
            }
            BodyReader::Chunked { .. } => self.read_chunked(cx, size),
        }
    }

    /// Read one LF-terminated line of the body, bounded by `size`.
    pub fn read_line(&mut self, cx: &mut BodyContext<'_>, size: Option<usize>) -> Result<Vec<u8>> {
        match self {
            BodyReader::None => Ok(Vec::new()),
            BodyReader::KnownLength { remaining } => {
                if *remaining == 0 {
                    return Ok(Vec::new());
                }
                let cap = size.map_or(*remaining, |s| (s as u64).min(*remaining)) as usize;
                cx.send_100_if_needed()?;
                let data = cx
                    .reader
                    .read_line_capped(cx.transport, cap)
                    .map_err(Error::from_io)?;
                *remaining -= data.len() as u64;
                Ok(data)
            }
            BodyReader::Chunked { .. } => {
                let mut data = Vec::new();
                loop {
                    if size.is_some_and(|s| data.len() >= s) {
                        return Ok(data);
                    }
                    if !self.chunk_buffered(cx)? {
                        return Ok(data);
                    }
                    let BodyReader::Chunked { buffer, .. } = self else {
                        unreachable!()
                    };
                    let newline = buffer.iter().position(|&b| b == b'\n');
                    let take = match (newline, size) {
                        (Some(pos), Some(s)) => (pos + 1).min(s - data.len()),
                        (Some(pos), None) => pos + 1,
                        (None, Some(s)) => buffer.len().min(s - data.len()),
                        (None, None) => buffer.len(),
                    };
                    data.extend(buffer.drain(..take));
                    if data.last() == Some(&b'\n') {
                        return Ok(data);
                    }
                }
            }
        }
    }

    /// Read and discard whatever the gateway left unconsumed, so a kept-alive
    /// connection resumes at a message boundary.
    pub fn drain(&mut self, cx: &mut BodyContext<'_>) -> Result<()> {
        while !self.is_exhausted() {
            if self.read(cx, Some(16 * 1024))?.is_empty() {
                if self.is_exhausted() {
                    // the read consumed the chunked terminator; clean end
                    break;
                }
                // stream ended before the declared body did
                return Err(Error::MalformedHeader(
                    "Request body ended prematurely".into(),
                ));
            }
        }
        Ok(())
    }

    fn read_chunked(&mut self, cx: &mut BodyContext<'_>, size: Option<usize>) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        loop {
            if size.is_some_and(|s| data.len() >= s) {
                return Ok(data);
            }
            if !self.chunk_buffered(cx)? {
                return Ok(data);
            }
            let BodyReader::Chunked { buffer, .. } = self else {
                unreachable!()
            };
            let take = size.map_or(buffer.len(), |s| (s - data.len()).min(buffer.len()));
            data.extend(buffer.drain(..take));
        }
    }

    /// Ensure at least one decoded byte is buffered. False means end of body.
    fn chunk_buffered(&mut self, cx: &mut BodyContext<'_>) -> Result<bool> {
        let BodyReader::Chunked {
            buffer,
            bytes_read,
            done,
            trailers_read,
            max_len,
        } = self
        else {
            return Ok(false);
        };
        if !buffer.is_empty() {
            return Ok(true);
        }
        if *done {
            return Ok(false);
        }

        cx.send_100_if_needed()?;
        let line = cx.reader.read_line(cx.transport, None)?;
        if line.is_empty() {
            return Err(Error::MalformedHeader(
                "Premature end of chunked request body".into(),
            ));
        }
        *bytes_read += line.len() as u64;
        if *max_len > 0 && *bytes_read > *max_len {
            return Err(Error::MaxSizeExceeded("Request Entity Too Large".into()));
        }

        let trimmed = trim_wire(&line);
        let size_field = trimmed
            .split(|&b| b == b';')
            .next()
            .unwrap_or_default();
        let size_str = std::str::from_utf8(size_field)
            .ok()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let chunk_size = size_str
            .and_then(|s| u64::from_str_radix(s, 16).ok())
            .ok_or_else(|| {
                Error::BadContentLength(format!(
                    "Bad chunked transfer size: {:?}",
                    String::from_utf8_lossy(trimmed)
                ))
            })?;

        if chunk_size == 0 {
            Self::read_trailers(cx, bytes_read, trailers_read, *max_len)?;
            *done = true;
            return Ok(false);
        }
        if *max_len > 0 && *bytes_read + chunk_size > *max_len {
            return Err(Error::MaxSizeExceeded("Request Entity Too Large".into()));
        }

        let chunk = cx.reader.read(cx.transport, chunk_size as usize)?;
        if chunk.len() as u64 != chunk_size {
            return Err(Error::MalformedHeader(
                "Premature end of chunked request body".into(),
            ));
        }
        *bytes_read += chunk.len() as u64;
        buffer.extend_from_slice(&chunk);

        let crlf = cx.reader.read(cx.transport, 2)?;
        *bytes_read += crlf.len() as u64;
        if crlf != CRLF {
            return Err(Error::MalformedHeader(format!(
                "Bad chunked transfer coding (expected CRLF, got {:?})",
                String::from_utf8_lossy(&crlf)
            )));
        }
        Ok(true)
    }

    /// Trailer headers after the terminator chunk are read and discarded.
    fn read_trailers(
        cx: &mut BodyContext<'_>,
        bytes_read: &mut u64,
        trailers_read: &mut bool,
        max_len: u64,
    ) -> Result<()> {
        while !*trailers_read {
            let line = cx.reader.read_line(cx.transport, None)?;
            if line.is_empty() {
                return Err(Error::MalformedHeader("Illegal end of headers.".into()));
            }
            *bytes_read += line.len() as u64;
            if max_len > 0 && *bytes_read > max_len {
                return Err(Error::MaxSizeExceeded("Request Entity Too Large".into()));
            }
            if line == CRLF {
                *trailers_read = true;
            }
        }
        Ok(())
    }
}

fn trim_wire(line: &[u8]) -> &[u8] {
    let mut slice = line;
    while let [rest @ .., last] = slice {
        if matches!(last, b'\r' | b'\n' | b' ' | b'\t') {
            slice = rest;
        } else {
            break;
        }
    }
    slice
}
