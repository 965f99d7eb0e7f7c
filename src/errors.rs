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

//! Failure taxonomy of the server core, plus the platform errno sets used to
//! decide whether a socket error is worth telling anyone about.

use core::fmt::Display;
use std::io;

/// Failures produced by the server core.
///
/// Parse variants carry the human-readable message that becomes the body of
/// the simple error response. Socket variants wrap the originating
/// [`io::Error`] after classification.
#[derive(Debug)]
pub enum Error {
    /// A request body or chunk exceeded a configured limit.
    MaxSizeExceeded(String),
    /// A peer sent plaintext HTTP on a TLS port.
    NoTls,
    /// The TLS handshake or record layer failed for any other reason.
    FatalTls(String),
    /// The request line could not be parsed.
    MalformedRequestLine(String),
    /// A request or trailer header could not be parsed.
    MalformedHeader(String),
    /// The `Content-Length` header or a chunk-size line was not a number.
    BadContentLength(String),
    /// The request target carried a `#fragment`.
    IllegalFragment,
    /// The request target was not a valid origin/absolute/asterisk form.
    InvalidPath(String),
    /// The request named an HTTP major version above 1.
    UnsupportedVersion,
    /// No request line arrived within the connection idle timeout.
    RequestTimeout,
    /// The peer went away; one of the ignorable socket errors.
    PeerClosed(io::Error),
    /// A retryable socket condition (`EINTR`, would-block).
    Transient(io::Error),
    /// An unclassified socket error.
    Fatal(io::Error),
}

impl Error {
    /// Classify an I/O error into the socket-level variants.
    ///
    /// Timeout decisions (408 vs. silent close) are context dependent and
    /// stay with the caller; a timed-out read classifies as [`Error::PeerClosed`]
    /// here because `ETIMEDOUT` is in the ignorable set.
    pub fn from_io(err: io::Error) -> Self {
        if is_eintr(&err) || is_nonblocking(&err) {
            Error::Transient(err)
        } else if is_ignorable_socket_error(&err) {
            Error::PeerClosed(err)
        } else {
            Error::Fatal(err)
        }
    }

    /// The wrapped I/O error, for the socket-level variants.
    pub fn io(&self) -> Option<&io::Error> {
        match self {
            Error::PeerClosed(err) | Error::Transient(err) | Error::Fatal(err) => Some(err),
            _ => None,
        }
    }

    /// The message to place in the body of a simple error response.
    pub fn response_message(&self) -> String {
        match self {
            Error::MaxSizeExceeded(msg)
            | Error::FatalTls(msg)
            | Error::MalformedRequestLine(msg)
            | Error::MalformedHeader(msg)
            | Error::BadContentLength(msg)
            | Error::InvalidPath(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    fn description_str(&self) -> &'static str {
        match *self {
            Error::MaxSizeExceeded(_) => "Maximum allowed size exceeded",
            Error::NoTls => "Client sent plain HTTP to a TLS port",
            Error::FatalTls(_) => "Fatal TLS failure",
            Error::MalformedRequestLine(_) => "Malformed request line",
            Error::MalformedHeader(_) => "Malformed header",
            Error::BadContentLength(_) => "Bad content length",
            Error::IllegalFragment => "Illegal #fragment in Request-URI.",
            Error::InvalidPath(_) => "Invalid path in Request-URI",
            Error::UnsupportedVersion => "Cannot fulfill request",
            Error::RequestTimeout => "Request timed out",
            Error::PeerClosed(_) => "Peer closed the connection",
            Error::Transient(_) => "Transient socket error",
            Error::Fatal(_) => "Socket error",
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::MaxSizeExceeded(msg)
            | Error::FatalTls(msg)
            | Error::MalformedRequestLine(msg)
            | Error::MalformedHeader(msg)
            | Error::BadContentLength(msg)
            | Error::InvalidPath(msg) => write!(f, "{}: {}", self.description_str(), msg),
            Error::PeerClosed(err) | Error::Transient(err) | Error::Fatal(err) => {
                write!(f, "{}: {}", self.description_str(), err)
            }
            _ => f.write_str(self.description_str()),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::PeerClosed(err) | Error::Transient(err) | Error::Fatal(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::from_io(err)
    }
}

/// Result whose `Err` variant is [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(unix)]
const EINTR_ERRNOS: &[i32] = &[libc::EINTR];

#[cfg(windows)]
const EINTR_ERRNOS: &[i32] = &[10004]; // WSAEINTR

#[cfg(all(unix, not(target_os = "macos")))]
const NONBLOCKING_ERRNOS: &[i32] = &[libc::EAGAIN, libc::EWOULDBLOCK];

#[cfg(target_os = "macos")]
const NONBLOCKING_ERRNOS: &[i32] = &[libc::EAGAIN, libc::EWOULDBLOCK, libc::EPROTOTYPE];

#[cfg(windows)]
const NONBLOCKING_ERRNOS: &[i32] = &[10035]; // WSAEWOULDBLOCK

#[cfg(all(unix, not(target_os = "macos")))]
const IGNORABLE_ERRNOS: &[i32] = &[
    libc::EPIPE,
    libc::EBADF,
    libc::ENOTSOCK,
    libc::ETIMEDOUT,
    libc::ECONNREFUSED,
    libc::ECONNRESET,
    libc::ECONNABORTED,
    libc::ENETRESET,
    libc::EHOSTDOWN,
    libc::EHOSTUNREACH,
];

#[cfg(target_os = "macos")]
const IGNORABLE_ERRNOS: &[i32] = &[
    libc::EPIPE,
    libc::EBADF,
    libc::ENOTSOCK,
    libc::ETIMEDOUT,
    libc::ECONNREFUSED,
    libc::ECONNRESET,
    libc::ECONNABORTED,
    libc::ENETRESET,
    libc::EHOSTDOWN,
    libc::EHOSTUNREACH,
    libc::EPROTOTYPE,
];

#[cfg(windows)]
const IGNORABLE_ERRNOS: &[i32] = &[
    10009, // WSAEBADF
    10038, // WSAENOTSOCK
    10060, // WSAETIMEDOUT
    10061, // WSAECONNREFUSED
    10054, // WSAECONNRESET
    10053, // WSAECONNABORTED
    10052, // WSAENETRESET
    10064, // WSAEHOSTDOWN
    10065, // WSAEHOSTUNREACH
];

#[cfg(unix)]
const ACCEPTABLE_SHUTDOWN_ERRNOS: &[i32] = &[
    libc::EPIPE,
    libc::EBADF,
    libc::ENOTCONN,
    libc::ESHUTDOWN,
    libc::ECONNRESET,
    libc::ECONNABORTED,
];

#[cfg(windows)]
const ACCEPTABLE_SHUTDOWN_ERRNOS: &[i32] = &[
    10009, // WSAEBADF
    10057, // WSAENOTCONN
    10058, // WSAESHUTDOWN
    10054, // WSAECONNRESET
    10053, // WSAECONNABORTED
];

// SSL-wrapped sockets surface timeouts as strings rather than errnos, and the
// wording differs between backends.
const TIMEOUT_MARKERS: &[&str] = &["timed out", "The read operation timed out"];

fn errno_in(err: &io::Error, set: &[i32]) -> bool {
    err.raw_os_error().is_some_and(|code| set.contains(&code))
}

/// True if the error is an interrupted system call and the operation should
/// be retried.
pub fn is_eintr(err: &io::Error) -> bool {
    errno_in(err, EINTR_ERRNOS) || err.kind() == io::ErrorKind::Interrupted
}

/// True if the error reports a non-blocking operation that found no data.
pub fn is_nonblocking(err: &io::Error) -> bool {
    errno_in(err, NONBLOCKING_ERRNOS) || err.kind() == io::ErrorKind::WouldBlock
}

/// True if the error means the peer is gone and the connection should be
/// dropped without further ceremony.
pub fn is_ignorable_socket_error(err: &io::Error) -> bool {
    if errno_in(err, IGNORABLE_ERRNOS) {
        return true;
    }
    if err.raw_os_error().is_none() {
        let msg = err.to_string();
        return TIMEOUT_MARKERS.iter().any(|marker| msg.contains(marker));
    }
    false
}

/// True if the error may be swallowed while closing an already-dying socket.
pub fn is_acceptable_shutdown_error(err: &io::Error) -> bool {
    errno_in(err, ACCEPTABLE_SHUTDOWN_ERRNOS)
        || matches!(
            err.kind(),
            io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
        )
}

/// True if a blocking read or write gave up because the socket timeout
/// elapsed. Platforms disagree on whether that surfaces as `WouldBlock` or
/// `TimedOut`.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
