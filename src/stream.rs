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

//! Buffered read/write framing over a raw byte transport.
//!
//! [`StreamReader`] and [`StreamWriter`] do not own the transport; the
//! connection does, and passes it into each call. This keeps a single owner
//! for the socket while both directions share it.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::errors::{is_acceptable_shutdown_error, is_eintr, Error, Result};

/// Default capacity for stream buffers, and the largest unit written to a
/// socket in one call.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// A raw byte transport: a kernel socket, or a TLS session over one.
pub trait Transport: Send {
    /// Read up to `buf.len()` bytes. `Ok(0)` signals end of stream.
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write up to `buf.len()` bytes and report how many were taken.
    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// The underlying kernel file descriptor, for readiness registration.
    fn raw_fd(&self) -> RawFd;

    /// Bound the time a blocking read may wait.
    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()>;

    /// Bound the time a blocking write may wait.
    fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()>;

    /// Shut down both directions of the kernel socket.
    fn shutdown(&self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }

    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write(buf)
    }

    fn raw_fd(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, dur)
    }

    fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, dur)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, std::net::Shutdown::Both)
    }
}

impl Transport for UnixStream {
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }

    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write(buf)
    }

    fn raw_fd(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        UnixStream::set_read_timeout(self, dur)
    }

    fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        UnixStream::set_write_timeout(self, dur)
    }

    fn shutdown(&self) -> io::Result<()> {
        UnixStream::shutdown(self, std::net::Shutdown::Both)
    }
}

/// Buffered reader half of a connection.
#[derive(Debug)]
pub struct StreamReader {
    buf: Vec<u8>,
    pos: usize,
    bufsize: usize,
    bytes_read: u64,
}

impl StreamReader {
    /// Create a reader with the given fill granularity.
    pub fn new(bufsize: usize) -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            bufsize: bufsize.max(1),
            bytes_read: 0,
        }
    }

    /// Bytes pulled off the transport so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// True if a previous fill left unconsumed bytes in the buffer.
    ///
    /// This is a non-blocking peek at the internal buffer only; it never
    /// touches the transport. A pipelined request shows up here.
    pub fn has_buffered_data(&self) -> bool {
        self.pos < self.buf.len()
    }

    fn buffered(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    fn consume(&mut self, n: usize) -> Vec<u8> {
        let end = (self.pos + n).min(self.buf.len());
        let out = self.buf[self.pos..end].to_vec();
        self.pos = end;
        out
    }

    /// Pull one transport read into the buffer. `Ok(0)` is end of stream.
    fn fill(&mut self, transport: &mut dyn Transport) -> io::Result<usize> {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        let start = self.buf.len();
        self.buf.resize(start + self.bufsize, 0);
        loop {
            match transport.read_some(&mut self.buf[start..]) {
                Ok(n) => {
                    self.buf.truncate(start + n);
                    self.bytes_read += n as u64;
                    return Ok(n);
                }
                Err(err) if is_eintr(&err) => continue,
                Err(err) => {
                    self.buf.truncate(start);
                    return Err(err);
                }
            }
        }
    }

    /// Read exactly `n` bytes unless the stream ends first.
    pub fn read(&mut self, transport: &mut dyn Transport, n: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n.min(self.bufsize));
        while out.len() < n {
            if !self.has_buffered_data() && self.fill(transport)? == 0 {
                break;
            }
            let mut chunk = self.consume(n - out.len());
            out.append(&mut chunk);
        }
        Ok(out)
    }

    /// Read until `delim` (inclusive), end of stream, or `max` bytes.
    ///
    /// Exceeding `max` without seeing the delimiter is a
    /// [`Error::MaxSizeExceeded`]; the buffered bytes stay put so the caller
    /// can still produce a response.
    pub fn read_until(
        &mut self,
        transport: &mut dyn Transport,
        delim: u8,
        max: Option<usize>,
    ) -> Result<Vec<u8>> {
        let mut scanned = 0;
        loop {
            let window = self.buffered();
            if let Some(found) = window[scanned.min(window.len())..]
                .iter()
                .position(|&b| b == delim)
            {
                let line_len = scanned + found + 1;
                if max.is_some_and(|m| line_len > m) {
                    return Err(Error::MaxSizeExceeded(
                        "Line exceeds maximum allowed length".into(),
                    ));
                }
                return Ok(self.consume(line_len));
            }
            scanned = window.len();
            if max.is_some_and(|m| scanned > m) {
                return Err(Error::MaxSizeExceeded(
                    "Line exceeds maximum allowed length".into(),
                ));
            }
            if self.fill(transport).map_err(Error::from_io)? == 0 {
                // stream ended mid-line; hand back what there is
                let rest = self.buffered().len();
                return Ok(self.consume(rest));
            }
        }
    }

    /// Read one LF-terminated line (terminator included), bounded by `max`.
    pub fn read_line(
        &mut self,
        transport: &mut dyn Transport,
        max: Option<usize>,
    ) -> Result<Vec<u8>> {
        self.read_until(transport, b'\n', max)
    }

    /// Read one line, returning at most `cap` bytes. Unlike [`read_line`],
    /// hitting the cap before a terminator returns the partial line rather
    /// than erroring, matching body-read semantics where the cap is the
    /// number of body bytes still owed.
    ///
    /// [`read_line`]: StreamReader::read_line
    pub fn read_line_capped(
        &mut self,
        transport: &mut dyn Transport,
        cap: usize,
    ) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while out.len() < cap {
            if !self.has_buffered_data() && self.fill(transport)? == 0 {
                break;
            }
            let window = self.buffered();
            let limit = (cap - out.len()).min(window.len());
            match window[..limit].iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    let mut line = self.consume(pos + 1);
                    out.append(&mut line);
                    return Ok(out);
                }
                None => {
                    let mut chunk = self.consume(limit);
                    out.append(&mut chunk);
                }
            }
        }
        Ok(out)
    }
}

/// Buffered writer half of a connection.
#[derive(Debug)]
pub struct StreamWriter {
    buf: Vec<u8>,
    bufsize: usize,
    bytes_written: u64,
    closed: bool,
}

impl StreamWriter {
    /// Create a writer that flushes once `bufsize` bytes accumulate.
    pub fn new(bufsize: usize) -> Self {
        Self {
            buf: Vec::new(),
            bufsize: bufsize.max(1),
            bytes_written: 0,
            closed: false,
        }
    }

    /// Bytes accepted for writing so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Queue `data`, flushing whenever the buffer crosses its high-water
    /// mark.
    pub fn write(&mut self, transport: &mut dyn Transport, data: &[u8]) -> io::Result<()> {
        self.buf.extend_from_slice(data);
        self.bytes_written += data.len() as u64;
        if self.buf.len() >= self.bufsize {
            self.flush(transport)?;
        }
        Ok(())
    }

    /// Push the pending buffer onto the transport.
    ///
    /// A zero-byte write breaks the loop rather than spinning; an
    /// acceptable-shutdown error drops the buffer, since the peer that would
    /// have read it is gone.
    pub fn flush(&mut self, transport: &mut dyn Transport) -> io::Result<()> {
        while !self.buf.is_empty() {
            let limit = self.buf.len().min(self.bufsize);
            match transport.write_some(&self.buf[..limit]) {
                Ok(0) => break,
                Ok(n) => {
                    self.buf.drain(..n);
                }
                Err(err) if is_eintr(&err) => continue,
                Err(err) if is_acceptable_shutdown_error(&err) => {
                    self.buf.clear();
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Flush and mark closed. Only the first call performs observable work;
    /// acceptable-shutdown errors are swallowed.
    pub fn close(&mut self, transport: &mut dyn Transport) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.flush(transport) {
            Ok(()) => Ok(()),
            Err(err) if is_acceptable_shutdown_error(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }
}


#[cfg(test)]
mod test {
    use super::mock::MockTransport;
    use super::{StreamReader, StreamWriter};
    use crate::errors::Error;

    #[test]
    fn read_line_returns_terminated_line() {
        let mut transport = MockTransport::with_input(b"GET / HTTP/1.1\r\nHost: x\r\n");
        let mut reader = StreamReader::new(8);
        let line = reader.read_line(&mut transport, None).unwrap();
        assert_eq!(b"GET / HTTP/1.1\r\n".as_slice(), line);
        assert!(reader.has_buffered_data());
    }

    #[test]
    fn read_line_hands_back_partial_line_at_eof() {
        let mut transport = MockTransport::with_input(b"GET / HT");
        let mut reader = StreamReader::new(64);
        let line = reader.read_line(&mut transport, None).unwrap();
        assert_eq!(b"GET / HT".as_slice(), line);
        let line = reader.read_line(&mut transport, None).unwrap();
        assert!(line.is_empty());
    }

    #[test]
    fn read_line_enforces_max() {
        let mut transport = MockTransport::with_input(b"aaaaaaaaaaaaaaaaaaaa\r\n");
        let mut reader = StreamReader::new(4);
        let err = reader.read_line(&mut transport, Some(8)).unwrap_err();
        assert!(matches!(err, Error::MaxSizeExceeded(_)));
    }

    #[test]
    fn read_collects_exactly_n_bytes_across_fills() {
        let mut transport = MockTransport::with_input(b"abcdefghij");
        let mut reader = StreamReader::new(3);
        assert_eq!(b"abcdefg".as_slice(), reader.read(&mut transport, 7).unwrap());
        assert_eq!(b"hij".as_slice(), reader.read(&mut transport, 64).unwrap());
        assert_eq!(10, reader.bytes_read());
    }

    #[test]
    fn buffered_data_peek_does_not_touch_transport() {
        let mut transport = MockTransport::with_input(b"a\r\nleftover");
        let mut reader = StreamReader::new(64);
        reader.read_line(&mut transport, None).unwrap();
        let before = reader.bytes_read();
        assert!(reader.has_buffered_data());
        assert_eq!(before, reader.bytes_read());
    }

    #[test]
    fn writer_flushes_partial_writes_to_completion() {
        let mut transport = MockTransport {
            max_write: Some(4),
            ..MockTransport::default()
        };
        let mut writer = StreamWriter::new(8);
        writer.write(&mut transport, b"hello world").unwrap();
        writer.flush(&mut transport).unwrap();
        assert_eq!(b"hello world".as_slice(), transport.output);
        assert_eq!(11, writer.bytes_written());
    }

    #[test]
    fn writer_drops_buffer_on_broken_pipe() {
        let mut transport = MockTransport::default();
        transport.write_errnos.push_back(libc::EPIPE);
        let mut writer = StreamWriter::new(4);
        writer.write(&mut transport, b"doomed bytes").unwrap();
        writer.flush(&mut transport).unwrap();
        assert!(transport.output.is_empty());
    }

    #[test]
    fn writer_close_is_idempotent() {
        let mut transport = MockTransport::default();
        let mut writer = StreamWriter::new(64);
        writer.write(&mut transport, b"bye").unwrap();
        writer.close(&mut transport).unwrap();
        writer.close(&mut transport).unwrap();
        assert_eq!(b"bye".as_slice(), transport.output);
    }
}
