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

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use stoker::stream::{StreamReader, Transport};
use stoker::Headers;

const REQUEST: &[u8] = b"GET /where?q=now HTTP/1.1\r\n\
    Host: origin.example.com\r\n\
    Accept: text/html\r\n\
    Accept-Encoding: gzip, br\r\n\
    User-Agent: bench/0.1\r\n\r\n";

/// Replays one canned byte buffer, forever.
struct Replay {
    data: &'static [u8],
    pos: usize,
}

impl Transport for Replay {
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.data.len() {
            self.pos = 0;
        }
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn raw_fd(&self) -> RawFd {
        -1
    }

    fn set_read_timeout(&self, _dur: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    fn set_write_timeout(&self, _dur: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    fn shutdown(&self) -> io::Result<()> {
        Ok(())
    }
}

fn benchmark(c: &mut Criterion) {
    c.bench_function("read_request_head", |b| {
        b.iter(|| {
            let mut transport = Replay {
                data: black_box(REQUEST),
                pos: 0,
            };
            let mut reader = StreamReader::new(1024);
            loop {
                let line = reader.read_line(&mut transport, Some(8192)).unwrap();
                if line == b"\r\n" || line.is_empty() {
                    break;
                }
            }
        })
    });

    c.bench_function("header_merge", |b| {
        b.iter(|| {
            let mut headers = Headers::default();
            headers.insert(black_box(b"Accept"), b"text/html");
            headers.insert(black_box(b"Accept"), b"text/plain");
            headers.insert(black_box(b"Host"), b"origin.example.com");
            headers.get(b"accept")
        })
    });
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
