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

//! The HTTP/1.1 request/response state machine.
//!
//! One [`Request`] covers a single request/response exchange on a
//! connection: parse the request line and headers, select body framing,
//! let the gateway respond, and decide whether the connection survives.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::time::SystemTime;

use crate::body::{BodyContext, BodyReader};
use crate::errors::{Error, Result};
use crate::gateway::Gateway;
use crate::server::ServerConfig;
use crate::stream::{StreamReader, StreamWriter, Transport};
use crate::tls::TlsEnviron;

const CRLF: &[u8] = b"\r\n";
const QUOTED_SLASH: &[u8] = b"%2F";

/// Header names whose repeated occurrences merge into one comma-separated
/// value ([IETF RFC 9110 Section 5.3](https://www.rfc-editor.org/rfc/rfc9110#section-5.3)).
const COMMA_SEPARATED_HEADERS: &[&[u8]] = &[
    b"accept",
    b"accept-charset",
    b"accept-encoding",
    b"accept-language",
    b"accept-ranges",
    b"allow",
    b"cache-control",
    b"connection",
    b"content-encoding",
    b"content-language",
    b"expect",
    b"if-match",
    b"if-none-match",
    b"pragma",
    b"proxy-authenticate",
    b"te",
    b"trailer",
    b"transfer-encoding",
    b"upgrade",
    b"vary",
    b"via",
    b"warning",
    b"www-authenticate",
];

/// HTTP protocol version within the 1.x family.
///
/// Anything with a major version above 1 is rejected before this type is
/// produced; minor versions above 1 behave as 1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HttpVersion {
    /// HTTP/1.0
    V1_0,
    /// HTTP/1.1
    V1_1,
}

impl std::fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::V1_0 => "HTTP/1.0",
            Self::V1_1 => "HTTP/1.1",
        })
    }
}

/// Ordered, case-insensitive request header map. Names are stored
/// lower-cased; list-valued headers merge on insert.
#[derive(Debug, Default)]
pub struct Headers {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Headers {
    /// Insert a header under its lower-cased name, merging list-valued
    /// headers by comma concatenation and replacing the rest.
    pub fn insert(&mut self, name: &[u8], value: &[u8]) {
        let name = name.to_ascii_lowercase();
        if let Some((_, existing)) = self.entries.iter_mut().find(|(k, _)| *k == name) {
            if COMMA_SEPARATED_HEADERS.contains(&name.as_slice()) {
                existing.extend_from_slice(b", ");
                existing.extend_from_slice(value);
            } else {
                *existing = value.to_vec();
            }
        } else {
            self.entries.push((name, value.to_vec()));
        }
    }

    /// Extend the most recently inserted header with an obs-fold
    /// continuation line. False if there is nothing to continue.
    pub fn append_continuation(&mut self, value: &[u8]) -> bool {
        match self.entries.last_mut() {
            Some((_, existing)) => {
                existing.extend_from_slice(b" ");
                existing.extend_from_slice(value);
                true
            }
            None => false,
        }
    }

    /// Look a header up by case-insensitive name.
    pub fn get(&self, name: &[u8]) -> Option<&[u8]> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Iterate headers in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Number of distinct header names seen.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no headers were seen.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything a request borrows from its connection for one exchange.
pub struct RequestScope<'c> {
    /// Raw transport under the buffered streams.
    pub transport: &'c mut dyn Transport,
    /// The connection's buffered reader.
    pub reader: &'c mut StreamReader,
    /// The connection's buffered writer.
    pub writer: &'c mut StreamWriter,
    /// Server configuration.
    pub config: &'c ServerConfig,
    /// TLS-derived environment of the connection, empty for plaintext.
    pub ssl_env: &'c TlsEnviron,
    /// Peer address, when the connection is IP-based.
    pub remote_addr: Option<SocketAddr>,
    /// Sampled from the connection manager: whether keep-alive has room.
    pub can_keepalive: bool,
}

impl std::fmt::Debug for RequestScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestScope")
            .field("remote_addr", &self.remote_addr)
            .field("can_keepalive", &self.can_keepalive)
            .finish()
    }
}

/// An HTTP request (and its response).
///
/// A single connection may consist of multiple request/response pairs,
/// served strictly one after another.
#[derive(Debug)]
pub struct Request<'c> {
    scope: RequestScope<'c>,

    method: Vec<u8>,
    uri: Vec<u8>,
    path: Vec<u8>,
    authority: Vec<u8>,
    query: Vec<u8>,
    request_protocol: HttpVersion,
    response_protocol: HttpVersion,
    inheaders: Headers,
    body: BodyReader,
    chunked_read: bool,
    needs_100_continue: bool,

    status: Vec<u8>,
    outheaders: Vec<(Vec<u8>, Vec<u8>)>,
    sent_headers: bool,
    chunked_write: bool,
    close_connection: bool,
    response_remaining: Option<u64>,

    ready: bool,
    started_request: bool,
}

impl<'c> Request<'c> {
    /// Bind a fresh request to its connection scope.
    pub(crate) fn new(scope: RequestScope<'c>) -> Self {
        let protocol = scope.config.protocol;
        Self {
            scope,
            method: Vec::new(),
            uri: Vec::new(),
            path: Vec::new(),
            authority: Vec::new(),
            query: Vec::new(),
            request_protocol: HttpVersion::V1_1,
            // lowest common protocol in case reading the request line errors
            response_protocol: HttpVersion::V1_0.min(protocol),
            inheaders: Headers::default(),
            body: BodyReader::None,
            chunked_read: false,
            needs_100_continue: false,
            status: Vec::new(),
            outheaders: Vec::new(),
            sent_headers: false,
            chunked_write: false,
            close_connection: false,
            response_remaining: None,
            ready: false,
            started_request: false,
        }
    }

    /// The request method, verbatim bytes.
    pub fn method(&self) -> &[u8] {
        &self.method
    }

    /// The raw request target as it appeared on the wire.
    pub fn uri(&self) -> &[u8] {
        &self.uri
    }

    /// The decoded path, with `%2F` preserved literally.
    pub fn path(&self) -> &[u8] {
        &self.path
    }

    /// The authority component, for absolute- and authority-form targets.
    pub fn authority(&self) -> &[u8] {
        &self.authority
    }

    /// The raw query string, without the `?`.
    pub fn query(&self) -> &[u8] {
        &self.query
    }

    /// Protocol version the client spoke.
    pub fn version(&self) -> HttpVersion {
        self.request_protocol
    }

    /// Request headers.
    pub fn headers(&self) -> &Headers {
        &self.inheaders
    }

    /// Convenience lookup of one request header.
    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.inheaders.get(name)
    }

    /// TLS environment of the connection, empty for plaintext.
    pub fn tls_environ(&self) -> &TlsEnviron {
        self.scope.ssl_env
    }

    /// Peer address, when known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.scope.remote_addr
    }

    /// True once the request parsed cleanly and a response may be generated.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// True once any part of the current request line was received.
    pub(crate) fn started_request(&self) -> bool {
        self.started_request
    }

    /// True once response headers hit the wire. Flips exactly once.
    pub fn sent_headers(&self) -> bool {
        self.sent_headers
    }

    /// True if this exchange must be the connection's last.
    pub fn close_connection(&self) -> bool {
        self.close_connection
    }

    /// Force the connection closed after this exchange.
    pub fn set_close_connection(&mut self) {
        self.close_connection = true;
    }

    fn body_context(&mut self) -> BodyContext<'_> {
        BodyContext {
            transport: &mut *self.scope.transport,
            reader: &mut *self.scope.reader,
            writer: &mut *self.scope.writer,
            needs_100_continue: &mut self.needs_100_continue,
        }
    }

    /// Read up to `size` request body bytes (`None` reads to the end).
    pub fn read_body(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        let mut body = std::mem::replace(&mut self.body, BodyReader::None);
        let result = body.read(&mut self.body_context(), size);
        self.body = body;
        result
    }

    /// Read one line of the request body, bounded by `size`.
    pub fn read_body_line(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        let mut body = std::mem::replace(&mut self.body, BodyReader::None);
        let result = body.read_line(&mut self.body_context(), size);
        self.body = body;
        result
    }

    // ------------------------------------------------------------------
    // Parse
    // ------------------------------------------------------------------

    /// Parse the next request line and message headers.
    ///
    /// Protocol rejections are answered inline with a simple response and
    /// leave the request not-ready; only I/O failures surface as errors.
    pub(crate) fn parse(&mut self) -> Result<()> {
        let header_budget = self.scope.config.max_request_header_size;
        let line_max = if header_budget == 0 {
            None
        } else {
            Some(header_budget)
        };

        let mut line = match self.scope.reader.read_line(self.scope.transport, line_max) {
            Ok(line) => line,
            Err(Error::MaxSizeExceeded(_)) => {
                return self.simple_response(
                    "414 Request-URI Too Long",
                    "The Request-URI sent with the request exceeds the maximum allowed bytes.",
                );
            }
            Err(err) => return Err(err),
        };
        self.started_request = !line.is_empty();
        if line.is_empty() {
            self.close_connection = true;
            return Ok(());
        }
        if line == CRLF {
            // ignore at most one empty line before the request line
            line = match self.scope.reader.read_line(self.scope.transport, line_max) {
                Ok(line) => line,
                Err(Error::MaxSizeExceeded(_)) => {
                    return self.simple_response(
                        "414 Request-URI Too Long",
                        "The Request-URI sent with the request exceeds the maximum allowed bytes.",
                    );
                }
                Err(err) => return Err(err),
            };
            if line.is_empty() {
                self.close_connection = true;
                return Ok(());
            }
        }

        if !self.read_request_line(&line)? {
            return Ok(());
        }

        let spent = line.len();
        if !self.read_headers(header_budget.saturating_sub(spent), header_budget != 0)? {
            return Ok(());
        }

        self.apply_connection_headers();

        if !self.select_transfer_coding()? {
            return Ok(());
        }

        if !self.scope.can_keepalive {
            self.close_connection = true;
        }
        self.ready = true;
        Ok(())
    }

    fn read_request_line(&mut self, line: &[u8]) -> Result<bool> {
        let line = trim_crlf(line);
        if !line.is_ascii() {
            self.simple_response("400 Bad Request", "Malformed Request-URI")?;
            return Ok(false);
        }

        let mut parts = line.split(|&b| b == b' ');
        let (method, uri, protocol) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(m), Some(u), Some(p), None) if !m.is_empty() && !u.is_empty() => (m, u, p),
            _ => {
                self.simple_response("400 Bad Request", "Malformed Request-Line")?;
                return Ok(false);
            }
        };

        if method.iter().any(|b| b.is_ascii_lowercase()) {
            self.simple_response(
                "400 Bad Request",
                "Malformed method name: method names are case-sensitive and uppercase.",
            )?;
            return Ok(false);
        }
        self.method = method.to_vec();
        self.uri = uri.to_vec();

        let Some(version_digits) = protocol.strip_prefix(b"HTTP/") else {
            self.simple_response("400 Bad Request", "Malformed Request-Line: bad protocol")?;
            return Ok(false);
        };
        let version = match version_digits {
            [major @ b'0'..=b'9', b'.', minor @ b'0'..=b'9'] => (major - b'0', minor - b'0'),
            _ => {
                self.simple_response("400 Bad Request", "Malformed Request-Line: bad version")?;
                return Ok(false);
            }
        };
        if version.0 > 1 {
            self.simple_response("505 HTTP Version Not Supported", "Cannot fulfill request")?;
            return Ok(false);
        }
        self.request_protocol = if version >= (1, 1) {
            HttpVersion::V1_1
        } else {
            HttpVersion::V1_0
        };
        self.response_protocol = self.request_protocol.min(self.scope.config.protocol);

        self.parse_target()
    }

    /// Split and validate the request target.
    ///
    /// `%2F` in the path is preserved literally: the path is split on the
    /// escape, each piece is decoded, and the pieces are rejoined with the
    /// escape. Decoding it would let an encoded slash change routing.
    fn parse_target(&mut self) -> Result<bool> {
        let uri = self.uri.clone();
        let strict = self.scope.config.strict_mode;
        let proxy = self.scope.config.proxy_mode;

        if self.method == b"OPTIONS" && uri == b"*" {
            self.path = b"*".to_vec();
            return Ok(true);
        }

        if self.method == b"CONNECT" {
            if !proxy {
                self.simple_response("405 Method Not Allowed", "")?;
                return Ok(false);
            }
            if !is_authority_form(&uri) {
                self.simple_response(
                    "400 Bad Request",
                    "Invalid path in Request-URI: request-target must match authority-form.",
                )?;
                return Ok(false);
            }
            self.authority = uri.clone();
            self.path = uri;
            return Ok(true);
        }

        let (before_fragment, fragment) = split_once(&uri, b'#');
        if fragment.is_some() {
            self.simple_response("400 Bad Request", "Illegal #fragment in Request-URI.")?;
            return Ok(false);
        }

        let absolute = split_scheme(before_fragment).is_some();
        if absolute && strict && !proxy {
            self.simple_response(
                "400 Bad Request",
                "Absolute URI not allowed if server is not a proxy.",
            )?;
            return Ok(false);
        }

        let (authority, path_and_query) = if absolute {
            let after_scheme = split_scheme(before_fragment).unwrap_or(before_fragment);
            let after_scheme = after_scheme.strip_prefix(b"//").unwrap_or(after_scheme);
            match after_scheme.iter().position(|&b| b == b'/') {
                Some(slash) => (after_scheme[..slash].to_vec(), &after_scheme[slash..]),
                None => (after_scheme.to_vec(), b"/".as_slice()),
            }
        } else {
            if strict && !before_fragment.starts_with(b"/") {
                self.simple_response(
                    "400 Bad Request",
                    "Invalid path in Request-URI: request-target must contain origin-form \
                     which starts with absolute-path (URI starting with a slash \"/\").",
                )?;
                return Ok(false);
            }
            (Vec::new(), before_fragment)
        };

        let (raw_path, query) = split_once(path_and_query, b'?');
        self.query = query.unwrap_or_default().to_vec();
        let mut path = decode_path_preserving_quoted_slash(raw_path);
        if !path.starts_with(b"/") {
            path.insert(0, b'/');
        }
        self.path = path;
        self.authority = authority;
        Ok(true)
    }

    fn read_headers(&mut self, mut budget: usize, limited: bool) -> Result<bool> {
        loop {
            let max = if limited { Some(budget) } else { None };
            let line = match self.scope.reader.read_line(self.scope.transport, max) {
                Ok(line) => line,
                Err(Error::MaxSizeExceeded(_)) => {
                    self.simple_response(
                        "413 Request Entity Too Large",
                        "The request entity sent with the request exceeds the maximum \
                         allowed bytes.",
                    )?;
                    return Ok(false);
                }
                Err(err) => return Err(err),
            };
            if line.is_empty() {
                self.simple_response("400 Bad Request", "Illegal end of headers.")?;
                return Ok(false);
            }
            if limited {
                budget = budget.saturating_sub(line.len());
            }
            if line == CRLF {
                return Ok(true);
            }
            if !line.ends_with(CRLF) {
                self.simple_response("400 Bad Request", "HTTP requires CRLF terminators")?;
                return Ok(false);
            }
            let line = trim_crlf(&line);

            if matches!(line.first(), Some(b' ') | Some(b'\t')) {
                if !self.inheaders.append_continuation(trim_ows(line)) {
                    self.simple_response("400 Bad Request", "Illegal header line.")?;
                    return Ok(false);
                }
                continue;
            }
            let Some(colon) = line.iter().position(|&b| b == b':') else {
                self.simple_response("400 Bad Request", "Illegal header line.")?;
                return Ok(false);
            };
            let name = trim_ows(&line[..colon]);
            if name.is_empty() {
                self.simple_response("400 Bad Request", "Illegal header line.")?;
                return Ok(false);
            }
            let value = trim_ows(&line[colon + 1..]);
            self.inheaders.insert(name, value);
        }
    }

    fn apply_connection_headers(&mut self) {
        let connection = self
            .inheaders
            .get(b"connection")
            .map(<[u8]>::to_ascii_lowercase)
            .unwrap_or_default();
        match self.request_protocol {
            HttpVersion::V1_1 => {
                if header_list_contains(&connection, b"close") {
                    self.close_connection = true;
                }
            }
            HttpVersion::V1_0 => {
                if !header_list_contains(&connection, b"keep-alive") {
                    self.close_connection = true;
                }
            }
        }

        if self.request_protocol == HttpVersion::V1_1 {
            let expect = self
                .inheaders
                .get(b"expect")
                .map(<[u8]>::to_ascii_lowercase)
                .unwrap_or_default();
            if expect == b"100-continue" {
                self.needs_100_continue = true;
            }
        }
    }

    /// Pick the body framing. Chunked wins over `Content-Length`.
    fn select_transfer_coding(&mut self) -> Result<bool> {
        let te = self
            .inheaders
            .get(b"transfer-encoding")
            .map(<[u8]>::to_ascii_lowercase);
        if let Some(te) = te {
            for coding in te.split(|&b| b == b',') {
                let coding = trim_ows(coding);
                if coding.is_empty() {
                    continue;
                }
                if coding == b"chunked" {
                    self.chunked_read = true;
                } else {
                    self.simple_response("501 Not Implemented", "Unknown transfer encoding")?;
                    return Ok(false);
                }
            }
        }
        let mrbs = self.scope.config.max_request_body_size;
        if self.chunked_read {
            self.body = BodyReader::chunked(mrbs);
            return Ok(true);
        }

        match self.inheaders.get(b"content-length") {
            None => {
                self.body = BodyReader::None;
            }
            Some(value) => {
                let parsed = std::str::from_utf8(value)
                    .ok()
                    .and_then(|s| s.trim().parse::<u64>().ok());
                let Some(cl) = parsed else {
                    self.simple_response("400 Bad Request", "Malformed Content-Length Header.")?;
                    return Ok(false);
                };
                if mrbs > 0 && cl > mrbs {
                    self.simple_response(
                        "413 Request Entity Too Large",
                        "The entity sent with the request exceeds the maximum allowed bytes.",
                    )?;
                    return Ok(false);
                }
                self.body = BodyReader::known_length(cl);
            }
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Respond
    // ------------------------------------------------------------------

    /// Call the gateway and settle the response framing.
    pub(crate) fn respond(&mut self, gateway: &dyn Gateway) -> Result<()> {
        match gateway.respond(self) {
            Ok(()) => {}
            Err(Error::MaxSizeExceeded(_)) => {
                self.simple_response("413 Request Entity Too Large", "Request Entity Too Large")?;
                self.close_connection = true;
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        if self.ready {
            self.ensure_headers_sent()?;
        }

        // A kept-alive connection must resume at a message boundary, so eat
        // whatever body the gateway left behind.
        if !self.close_connection && !self.body.is_exhausted() {
            let mut body = std::mem::replace(&mut self.body, BodyReader::None);
            let drained = body.drain(&mut self.body_context());
            self.body = body;
            if drained.is_err() {
                self.close_connection = true;
            }
        }

        if self.chunked_write {
            self.scope
                .writer
                .write(self.scope.transport, b"0\r\n\r\n")
                .map_err(Error::from_io)?;
        }
        if self.response_remaining.is_some_and(|n| n > 0) {
            // promised more bytes than were written; the peer cannot trust
            // this framing again
            self.close_connection = true;
        }
        self.scope
            .writer
            .flush(self.scope.transport)
            .map_err(Error::from_io)?;
        Ok(())
    }

    /// Set the response status line, e.g. `b"200 OK"`.
    ///
    /// Invalid once headers have been sent.
    pub fn set_status(&mut self, status: &[u8]) -> Result<()> {
        if self.sent_headers {
            return Err(Error::Fatal(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "response headers already sent",
            )));
        }
        self.status = status.to_vec();
        Ok(())
    }

    /// Append a response header. Invalid once headers have been sent.
    pub fn add_header(&mut self, name: &[u8], value: &[u8]) -> Result<()> {
        if self.sent_headers {
            return Err(Error::Fatal(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "response headers already sent",
            )));
        }
        self.outheaders.push((name.to_vec(), value.to_vec()));
        Ok(())
    }

    fn declared_content_length(&self) -> Option<u64> {
        self.outheaders
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(b"content-length"))
            .and_then(|(_, v)| std::str::from_utf8(v).ok())
            .and_then(|s| s.trim().parse().ok())
    }

    /// Send headers now if the gateway has not already done so.
    pub fn ensure_headers_sent(&mut self) -> Result<()> {
        if !self.sent_headers {
            self.send_headers()?;
        }
        Ok(())
    }

    /// Assemble and send the response status line and headers.
    ///
    /// Requires `status` and `outheaders` to be final; flips `sent_headers`.
    pub fn send_headers(&mut self) -> Result<()> {
        if self.sent_headers {
            return Ok(());
        }
        if self.status.is_empty() {
            self.status = b"200 OK".to_vec();
        }
        let code: u16 = std::str::from_utf8(&self.status[..3.min(self.status.len())])
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(500);

        fn has_header(headers: &[(Vec<u8>, Vec<u8>)], name: &[u8]) -> bool {
            headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
        }

        if code == 413 {
            self.close_connection = true;
        } else if !has_header(&self.outheaders, b"content-length") {
            if code < 200 || matches!(code, 204 | 205 | 304) {
                // no body; no length needed
            } else if self.response_protocol == HttpVersion::V1_1 && self.method != b"HEAD" {
                self.chunked_write = true;
                self.outheaders
                    .push((b"Transfer-Encoding".to_vec(), b"chunked".to_vec()));
            } else {
                // closing the connection is the only way to bound the body
                self.close_connection = true;
            }
        }

        if !has_header(&self.outheaders, b"connection") {
            if self.response_protocol == HttpVersion::V1_1 {
                if self.close_connection {
                    self.outheaders
                        .push((b"Connection".to_vec(), b"close".to_vec()));
                }
            } else if !self.close_connection {
                self.outheaders
                    .push((b"Connection".to_vec(), b"Keep-Alive".to_vec()));
            }
        }
        if self
            .outheaders
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case(b"connection") && v.eq_ignore_ascii_case(b"keep-alive"))
        {
            let timeout = self.scope.config.timeout.as_secs();
            self.outheaders
                .push((b"Keep-Alive".to_vec(), format!("timeout={timeout}").into_bytes()));
        }

        if !has_header(&self.outheaders, b"date") {
            self.outheaders.push((
                b"Date".to_vec(),
                httpdate::fmt_http_date(SystemTime::now()).into_bytes(),
            ));
        }
        if !has_header(&self.outheaders, b"server") {
            self.outheaders.push((
                b"Server".to_vec(),
                self.scope.config.server_name.clone().into_bytes(),
            ));
        }

        self.response_remaining = self.declared_content_length();

        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(self.scope.config.protocol.to_string().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(&self.status);
        buf.extend_from_slice(CRLF);
        for (name, value) in &self.outheaders {
            buf.extend_from_slice(name);
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value);
            buf.extend_from_slice(CRLF);
        }
        buf.extend_from_slice(CRLF);

        self.scope
            .writer
            .write(self.scope.transport, &buf)
            .map_err(Error::from_io)?;
        self.sent_headers = true;
        Ok(())
    }

    /// Write response body data, honoring the declared framing.
    pub fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if !self.sent_headers {
            if self
                .declared_content_length()
                .is_some_and(|n| (chunk.len() as u64) > n)
            {
                self.simple_response(
                    "500 Internal Server Error",
                    "Response body exceeds the declared Content-Length.",
                )?;
                // discard everything else the gateway tries to write
                self.response_remaining = Some(0);
                return Ok(());
            }
            self.send_headers()?;
        }

        let mut chunk = chunk;
        if let Some(remaining) = self.response_remaining {
            if (chunk.len() as u64) > remaining {
                tracing::error!(
                    declared = remaining,
                    attempted = chunk.len(),
                    "response write exceeds declared Content-Length; truncating"
                );
                chunk = &chunk[..remaining as usize];
            }
            self.response_remaining = Some(remaining - chunk.len() as u64);
        }

        if self.chunked_write {
            if chunk.is_empty() {
                return Ok(());
            }
            let mut framed = String::new();
            let _ = write!(framed, "{:x}", chunk.len());
            let mut buf = framed.into_bytes();
            buf.extend_from_slice(CRLF);
            buf.extend_from_slice(chunk);
            buf.extend_from_slice(CRLF);
            self.scope
                .writer
                .write(self.scope.transport, &buf)
                .map_err(Error::from_io)?;
        } else {
            self.scope
                .writer
                .write(self.scope.transport, chunk)
                .map_err(Error::from_io)?;
        }
        Ok(())
    }

    /// Write a minimal error response and mark the connection for closing.
    ///
    /// Used for failures produced by the state machine itself; a response
    /// already under way suppresses the write.
    pub(crate) fn simple_response(&mut self, status: &str, msg: &str) -> Result<()> {
        self.close_connection = true;
        if self.sent_headers {
            return Ok(());
        }
        self.sent_headers = true;

        let buf = simple_response_bytes(self.scope.config, status, msg);
        self.scope
            .writer
            .write(self.scope.transport, &buf)
            .map_err(Error::from_io)?;
        self.scope
            .writer
            .flush(self.scope.transport)
            .map_err(Error::from_io)?;
        Ok(())
    }
}

/// Serialize a minimal error response: status line, `Content-Type`,
/// `Content-Length`, `Date`, `Server`, then the message body.
pub(crate) fn simple_response_bytes(config: &ServerConfig, status: &str, msg: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(config.protocol.to_string().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(status.as_bytes());
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(b"Content-Type: text/plain\r\n");
    buf.extend_from_slice(format!("Content-Length: {}\r\n", msg.len()).as_bytes());
    buf.extend_from_slice(
        format!("Date: {}\r\n", httpdate::fmt_http_date(SystemTime::now())).as_bytes(),
    );
    buf.extend_from_slice(format!("Server: {}\r\n", config.server_name).as_bytes());
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(msg.as_bytes());
    buf
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn trim_ows(value: &[u8]) -> &[u8] {
    let start = value
        .iter()
        .position(|&b| b != b' ' && b != b'\t')
        .unwrap_or(value.len());
    let end = value
        .iter()
        .rposition(|&b| b != b' ' && b != b'\t')
        .map_or(start, |p| p + 1);
    &value[start..end]
}

fn split_once(input: &[u8], delim: u8) -> (&[u8], Option<&[u8]>) {
    match input.iter().position(|&b| b == delim) {
        Some(pos) => (&input[..pos], Some(&input[pos + 1..])),
        None => (input, None),
    }
}

/// If `uri` carries a scheme, the slice after `scheme:` (still including any
/// leading `//`). A scheme'd target is absolute-form regardless of whether
/// an authority follows.
fn split_scheme(uri: &[u8]) -> Option<&[u8]> {
    let colon = uri.iter().position(|&b| b == b':')?;
    if colon == 0 || !uri[0].is_ascii_alphabetic() {
        return None;
    }
    if !uri[..colon]
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.'))
    {
        return None;
    }
    Some(&uri[colon + 1..])
}

/// `host:port` with a numeric, non-empty port and no path components.
fn is_authority_form(uri: &[u8]) -> bool {
    if uri.iter().any(|&b| b == b'/' || b == b'?' || b == b'#') {
        return false;
    }
    let Some(colon) = uri.iter().rposition(|&b| b == b':') else {
        return false;
    };
    let (host, port) = (&uri[..colon], &uri[colon + 1..]);
    !host.is_empty() && !port.is_empty() && port.iter().all(u8::is_ascii_digit)
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decode percent escapes; invalid sequences pass through untouched.
fn percent_decode_lenient(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                input.get(i + 1).copied().and_then(hex_value),
                input.get(i + 2).copied().and_then(hex_value),
            ) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(input[i]);
        i += 1;
    }
    out
}

/// Decode a path while keeping `%2F` escapes literal: split on the escape
/// (either case), decode the pieces, rejoin with the canonical upper-case
/// escape.
fn decode_path_preserving_quoted_slash(path: &[u8]) -> Vec<u8> {
    let mut pieces: Vec<Vec<u8>> = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + 3 <= path.len() {
        if path[i] == b'%' && path[i + 1] == b'2' && (path[i + 2] | 0x20) == b'f' {
            pieces.push(percent_decode_lenient(&path[start..i]));
            start = i + 3;
            i = start;
        } else {
            i += 1;
        }
    }
    pieces.push(percent_decode_lenient(&path[start..]));
    pieces.join(QUOTED_SLASH)
}

fn header_list_contains(value: &[u8], token: &[u8]) -> bool {
    value
        .split(|&b| b == b',')
        .any(|item| trim_ows(item).eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod test {
    use super::{
        decode_path_preserving_quoted_slash, header_list_contains, percent_decode_lenient,
        split_scheme, Headers, HttpVersion, Request, RequestScope,
    };
    use crate::errors::Result;
    use crate::gateway::Gateway;
    use crate::server::ServerConfig;
    use crate::stream::mock::MockTransport;
    use crate::stream::{StreamReader, StreamWriter};
    use crate::tls::TlsEnviron;

    struct Harness {
        transport: MockTransport,
        reader: StreamReader,
        writer: StreamWriter,
        config: ServerConfig,
        ssl_env: TlsEnviron,
    }

    impl Harness {
        fn new(input: &[u8]) -> Self {
            Self {
                transport: MockTransport::with_input(input),
                reader: StreamReader::new(1024),
                writer: StreamWriter::new(1024),
                config: ServerConfig::default(),
                ssl_env: TlsEnviron::new(),
            }
        }

        fn request(&mut self) -> Request<'_> {
            Request::new(RequestScope {
                transport: &mut self.transport,
                reader: &mut self.reader,
                writer: &mut self.writer,
                config: &self.config,
                ssl_env: &self.ssl_env,
                remote_addr: None,
                can_keepalive: true,
            })
        }

        fn output(&self) -> String {
            String::from_utf8_lossy(&self.transport.output).into_owned()
        }
    }

    struct NullGateway;

    impl Gateway for NullGateway {
        fn respond(&self, req: &mut Request<'_>) -> Result<()> {
            req.set_status(b"200 OK")?;
            req.add_header(b"Content-Length", b"0")?;
            req.send_headers()
        }
    }

    #[test]
    fn parses_method_target_version() {
        let mut h = Harness::new(b"GET /pov?x=1 HTTP/1.1\r\nHost: h\r\n\r\n");
        let mut req = h.request();
        req.parse().unwrap();
        assert!(req.is_ready());
        assert_eq!(b"GET".as_slice(), req.method());
        assert_eq!(b"/pov".as_slice(), req.path());
        assert_eq!(b"x=1".as_slice(), req.query());
        assert_eq!(HttpVersion::V1_1, req.version());
        assert_eq!(Some(b"h".as_slice()), req.header(b"Host"));
    }

    #[test]
    fn skips_one_leading_empty_line() {
        let mut h = Harness::new(b"\r\nGET / HTTP/1.1\r\nHost: h\r\n\r\n");
        let mut req = h.request();
        req.parse().unwrap();
        assert!(req.is_ready());
    }

    #[test]
    fn eof_before_request_line_closes_silently() {
        let mut h = Harness::new(b"");
        let mut req = h.request();
        req.parse().unwrap();
        assert!(!req.is_ready());
        assert!(req.close_connection());
        assert!(h.output().is_empty());
    }

    #[test]
    fn rejects_lowercase_method() {
        let mut h = Harness::new(b"get / HTTP/1.1\r\n\r\n");
        let mut req = h.request();
        req.parse().unwrap();
        assert!(!req.is_ready());
        drop(req);
        assert!(h.output().contains("400 Bad Request"));
        assert!(h.output().contains("Malformed method name"));
    }

    #[test]
    fn rejects_bad_protocol() {
        let mut h = Harness::new(b"GET / HTTQ/1.1\r\n\r\n");
        let mut req = h.request();
        req.parse().unwrap();
        drop(req);
        assert!(h.output().contains("Malformed Request-Line: bad protocol"));
    }

    #[test]
    fn rejects_unsupported_major_version() {
        let mut h = Harness::new(b"GET / HTTP/2.0\r\n\r\n");
        let mut req = h.request();
        req.parse().unwrap();
        drop(req);
        assert!(h.output().contains("505"));
        assert!(h.output().contains("Cannot fulfill request"));
    }

    #[test]
    fn rejects_absolute_uri_outside_proxy_mode() {
        let mut h = Harness::new(b"GET http://google.com/ HTTP/1.1\r\nHost: h\r\n\r\n");
        let mut req = h.request();
        req.parse().unwrap();
        drop(req);
        assert!(h
            .output()
            .contains("Absolute URI not allowed if server is not a proxy."));
    }

    #[test]
    fn rejects_fragment_in_target() {
        let mut h = Harness::new(b"GET /page#frag HTTP/1.1\r\nHost: h\r\n\r\n");
        let mut req = h.request();
        req.parse().unwrap();
        drop(req);
        assert!(h.output().contains("Illegal #fragment in Request-URI."));
    }

    #[test]
    fn rejects_relative_origin_form() {
        let mut h = Harness::new(b"GET page HTTP/1.1\r\nHost: h\r\n\r\n");
        let mut req = h.request();
        req.parse().unwrap();
        drop(req);
        assert!(h.output().contains("Invalid path in Request-URI"));
    }

    #[test]
    fn rejects_connect_outside_proxy_mode() {
        let mut h = Harness::new(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n");
        let mut req = h.request();
        req.parse().unwrap();
        drop(req);
        assert!(h.output().contains("405"));
    }

    #[test]
    fn options_asterisk_sets_literal_path() {
        let mut h = Harness::new(b"OPTIONS * HTTP/1.1\r\nHost: h\r\n\r\n");
        let mut req = h.request();
        req.parse().unwrap();
        assert!(req.is_ready());
        assert_eq!(b"*".as_slice(), req.path());
    }

    #[test]
    fn quoted_slash_survives_decoding() {
        let mut h = Harness::new(b"GET /a%2Fb%20c%2fd HTTP/1.1\r\nHost: h\r\n\r\n");
        let mut req = h.request();
        req.parse().unwrap();
        assert_eq!(b"/a%2Fb c%2Fd".as_slice(), req.path());
    }

    #[test]
    fn rejects_malformed_content_length() {
        let mut h = Harness::new(b"POST / HTTP/1.1\r\nContent-Length: forty\r\n\r\n");
        let mut req = h.request();
        req.parse().unwrap();
        drop(req);
        assert!(h.output().contains("Malformed Content-Length Header."));
    }

    #[test]
    fn oversized_content_length_yields_413() {
        let mut h = Harness::new(b"POST /upload HTTP/1.1\r\nContent-Length: 9999\r\n\r\n");
        h.config.max_request_body_size = 1000;
        let mut req = h.request();
        req.parse().unwrap();
        assert!(!req.is_ready());
        assert!(req.close_connection());
        drop(req);
        assert!(h.output().contains("413 Request Entity Too Large"));
        assert!(h
            .output()
            .contains("The entity sent with the request exceeds the maximum allowed bytes."));
    }

    #[test]
    fn body_exactly_at_limit_is_accepted() {
        let mut h = Harness::new(b"POST / HTTP/1.1\r\nContent-Length: 1000\r\n\r\n");
        h.config.max_request_body_size = 1000;
        let mut req = h.request();
        req.parse().unwrap();
        assert!(req.is_ready());
    }

    #[test]
    fn oversized_request_line_yields_414() {
        let long = vec![b'a'; 64];
        let mut line = b"GET /".to_vec();
        line.extend_from_slice(&long);
        line.extend_from_slice(b" HTTP/1.1\r\n\r\n");
        let mut h = Harness::new(&line);
        h.config.max_request_header_size = 32;
        let mut req = h.request();
        req.parse().unwrap();
        drop(req);
        assert!(h.output().contains("414 Request-URI Too Long"));
    }

    #[test]
    fn unknown_transfer_coding_yields_501() {
        let mut h = Harness::new(b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n");
        let mut req = h.request();
        req.parse().unwrap();
        drop(req);
        assert!(h.output().contains("501"));
    }

    #[test]
    fn comma_headers_merge_like_a_single_header() {
        let mut h = Harness::new(
            b"GET / HTTP/1.1\r\nAccept: text/html\r\nAccept: text/plain\r\nX-One: a\r\nX-One: b\r\n\r\n",
        );
        let mut req = h.request();
        req.parse().unwrap();
        assert_eq!(
            Some(b"text/html, text/plain".as_slice()),
            req.header(b"accept")
        );
        // non-list headers keep the last value
        assert_eq!(Some(b"b".as_slice()), req.header(b"x-one"));
    }

    #[test]
    fn obs_fold_continuation_extends_previous_header() {
        let mut h = Harness::new(b"GET / HTTP/1.1\r\nX-Long: part one\r\n  part two\r\n\r\n");
        let mut req = h.request();
        req.parse().unwrap();
        assert_eq!(Some(b"part one part two".as_slice()), req.header(b"x-long"));
    }

    #[test]
    fn http10_without_keepalive_closes() {
        let mut h = Harness::new(b"GET / HTTP/1.0\r\n\r\n");
        let mut req = h.request();
        req.parse().unwrap();
        assert!(req.is_ready());
        assert!(req.close_connection());
    }

    #[test]
    fn http10_with_keepalive_header_stays_open() {
        let mut h = Harness::new(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n");
        let mut req = h.request();
        req.parse().unwrap();
        req.respond(&NullGateway).unwrap();
        assert!(!req.close_connection());
        drop(req);
        assert!(h.output().contains("Connection: Keep-Alive"));
        assert!(h.output().contains("Keep-Alive: timeout="));
    }

    #[test]
    fn connection_close_request_header_forces_close() {
        let mut h = Harness::new(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        let mut req = h.request();
        req.parse().unwrap();
        assert!(req.close_connection());
    }

    #[test]
    fn keepalive_cap_forces_close() {
        let mut h = Harness::new(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
        let mut req = Request::new(RequestScope {
            transport: &mut h.transport,
            reader: &mut h.reader,
            writer: &mut h.writer,
            config: &h.config,
            ssl_env: &h.ssl_env,
            remote_addr: None,
            can_keepalive: false,
        });
        req.parse().unwrap();
        assert!(req.is_ready());
        assert!(req.close_connection());
    }

    #[test]
    fn response_without_length_on_http11_is_chunked() {
        let mut h = Harness::new(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
        let mut req = h.request();
        req.parse().unwrap();
        struct Chunky;
        impl Gateway for Chunky {
            fn respond(&self, req: &mut Request<'_>) -> Result<()> {
                req.set_status(b"200 OK")?;
                req.write(b"hello ")?;
                req.write(b"world")
            }
        }
        req.respond(&Chunky).unwrap();
        assert!(!req.close_connection());
        drop(req);
        let out = h.output();
        assert!(out.contains("Transfer-Encoding: chunked"));
        assert!(out.contains("6\r\nhello \r\n"));
        assert!(out.contains("5\r\nworld\r\n"));
        assert!(out.ends_with("0\r\n\r\n"));
    }

    #[test]
    fn overlong_write_is_truncated_to_declared_length() {
        let mut h = Harness::new(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
        let mut req = h.request();
        req.parse().unwrap();
        struct Overrun;
        impl Gateway for Overrun {
            fn respond(&self, req: &mut Request<'_>) -> Result<()> {
                req.set_status(b"200 OK")?;
                req.add_header(b"Content-Length", b"4")?;
                req.write(b"pied")?;
                req.write(b" piper")
            }
        }
        req.respond(&Overrun).unwrap();
        drop(req);
        let out = h.output();
        assert!(out.ends_with("\r\n\r\npied"));
    }

    #[test]
    fn underrun_of_declared_length_closes_connection() {
        let mut h = Harness::new(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
        let mut req = h.request();
        req.parse().unwrap();
        struct Underrun;
        impl Gateway for Underrun {
            fn respond(&self, req: &mut Request<'_>) -> Result<()> {
                req.set_status(b"200 OK")?;
                req.add_header(b"Content-Length", b"100")?;
                req.write(b"short")
            }
        }
        req.respond(&Underrun).unwrap();
        assert!(req.close_connection());
    }

    #[test]
    fn status_204_gets_no_framing_headers() {
        let mut h = Harness::new(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
        let mut req = h.request();
        req.parse().unwrap();
        struct NoContent;
        impl Gateway for NoContent {
            fn respond(&self, req: &mut Request<'_>) -> Result<()> {
                req.set_status(b"204 No Content")?;
                req.send_headers()
            }
        }
        req.respond(&NoContent).unwrap();
        drop(req);
        let out = h.output();
        assert!(!out.contains("Content-Length"));
        assert!(!out.contains("Transfer-Encoding"));
    }

    #[test]
    fn simple_response_shape() {
        let mut h = Harness::new(b"");
        let mut req = h.request();
        req.simple_response("400 Bad Request", "nope").unwrap();
        assert!(req.sent_headers());
        assert!(req.close_connection());
        drop(req);
        let out = h.output();
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(out.contains("Content-Type: text/plain\r\n"));
        assert!(out.contains("Content-Length: 4\r\n"));
        assert!(out.contains("Date: "));
        assert!(out.contains("Server: "));
        assert!(out.ends_with("\r\n\r\nnope"));
    }

    #[test]
    fn headers_struct_is_case_insensitive_and_ordered() {
        let mut headers = Headers::default();
        headers.insert(b"Host", b"example");
        headers.insert(b"Via", b"a");
        headers.insert(b"VIA", b"b");
        assert_eq!(Some(b"example".as_slice()), headers.get(b"hOsT"));
        assert_eq!(Some(b"a, b".as_slice()), headers.get(b"via"));
        assert_eq!(2, headers.len());
    }

    #[test]
    fn percent_decoding_is_lenient() {
        assert_eq!(b"a b".as_slice(), percent_decode_lenient(b"a%20b"));
        assert_eq!(b"a%2xb".as_slice(), percent_decode_lenient(b"a%2xb"));
        assert_eq!(b"a%".as_slice(), percent_decode_lenient(b"a%"));
    }

    #[test]
    fn quoted_slash_canonicalizes_case() {
        assert_eq!(
            b"/a%2Fb".as_slice(),
            decode_path_preserving_quoted_slash(b"/a%2fb")
        );
    }

    #[test]
    fn scheme_detection() {
        assert!(split_scheme(b"http://host/path").is_some());
        assert!(split_scheme(b"/plain/path").is_none());
        assert!(split_scheme(b"no-scheme-here").is_none());
    }

    #[test]
    fn header_list_membership_ignores_spacing_and_case() {
        assert!(header_list_contains(b"keep-alive, Upgrade", b"upgrade"));
        assert!(header_list_contains(b"Close", b"close"));
        assert!(!header_list_contains(b"closed", b"close"));
    }
}
