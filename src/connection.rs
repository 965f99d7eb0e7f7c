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

//! An active connection: one socket, its buffered streams, and the request
//! cycle that runs over them.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Instant;

use crate::errors::{is_timeout, Error, Result};
use crate::gateway::Gateway;
use crate::request::{simple_response_bytes, Request, RequestScope};
use crate::server::ServerConfig;
use crate::stream::{StreamReader, StreamWriter, Transport, DEFAULT_BUFFER_SIZE};
use crate::tls::TlsEnviron;

/// Mark a file descriptor non-inheritable across `exec`.
pub(crate) fn prevent_socket_inheritance(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on an owned fd with F_GETFD/F_SETFD mutates no memory.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// What the current exchange had managed before an error, for deciding
/// between a 408, a 500 and a silent drop.
#[derive(Debug, Default)]
struct ExchangeState {
    started: bool,
    sent_headers: bool,
}

/// An HTTP connection (active socket).
///
/// Lives in exactly one place at a time: the manager's idle pool, the ready
/// deque, or a worker.
pub struct Connection {
    transport: Box<dyn Transport>,
    reader: StreamReader,
    writer: StreamWriter,
    config: Arc<ServerConfig>,
    last_used: Instant,
    requests_seen: u64,
    remote_addr: Option<SocketAddr>,
    ssl_env: TlsEnviron,
    is_unix: bool,
    linger: bool,
    closed: bool,
    peer_creds: Option<(libc::pid_t, libc::uid_t, libc::gid_t)>,
    peer_names: Option<(String, String)>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.transport.raw_fd())
            .field("remote_addr", &self.remote_addr)
            .field("requests_seen", &self.requests_seen)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Connection {
    /// Bind an accepted (and possibly TLS-wrapped) socket into a connection.
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        config: Arc<ServerConfig>,
        remote_addr: Option<SocketAddr>,
        ssl_env: TlsEnviron,
        is_unix: bool,
    ) -> io::Result<Self> {
        prevent_socket_inheritance(transport.raw_fd())?;
        let timeout = (!config.timeout.is_zero()).then_some(config.timeout);
        transport.set_read_timeout(timeout)?;
        transport.set_write_timeout(timeout)?;
        Ok(Self {
            transport,
            reader: StreamReader::new(DEFAULT_BUFFER_SIZE),
            writer: StreamWriter::new(DEFAULT_BUFFER_SIZE),
            config,
            last_used: Instant::now(),
            requests_seen: 0,
            remote_addr,
            ssl_env,
            is_unix,
            linger: false,
            closed: false,
            peer_creds: None,
            peer_names: None,
        })
    }

    /// Kernel fd, for readiness registration.
    pub fn raw_fd(&self) -> RawFd {
        self.transport.raw_fd()
    }

    /// Peer address, for IP sockets.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// When the connection last finished serving a request.
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Stamp the connection as just-used.
    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// True if the read buffer already holds bytes (a pipelined request).
    pub fn has_buffered_data(&self) -> bool {
        self.reader.has_buffered_data()
    }

    /// Total bytes pulled off this connection's transport.
    pub fn bytes_read(&self) -> u64 {
        self.reader.bytes_read()
    }

    /// Total bytes written to this connection.
    pub fn bytes_written(&self) -> u64 {
        self.writer.bytes_written()
    }

    /// Requests served on this connection.
    pub fn requests_seen(&self) -> u64 {
        self.requests_seen
    }

    /// Serve one request/response exchange.
    ///
    /// Returns true when the connection should go back to the keep-alive
    /// pool. All failures are classified and answered here; the caller only
    /// decides between `put` and `close`.
    pub fn communicate(&mut self, gateway: &dyn Gateway, can_keepalive: bool) -> bool {
        let mut state = ExchangeState::default();
        match self.serve_one(gateway, can_keepalive, &mut state) {
            Ok(keep) => keep,
            Err(err) => {
                self.handle_failure(err, &state);
                false
            }
        }
    }

    fn serve_one(
        &mut self,
        gateway: &dyn Gateway,
        can_keepalive: bool,
        state: &mut ExchangeState,
    ) -> Result<bool> {
        let mut req = Request::new(RequestScope {
            transport: self.transport.as_mut(),
            reader: &mut self.reader,
            writer: &mut self.writer,
            config: &self.config,
            ssl_env: &self.ssl_env,
            remote_addr: self.remote_addr,
            can_keepalive,
        });

        let parsed = req.parse();
        state.started = req.started_request();
        state.sent_headers = req.sent_headers();
        parsed?;

        self.requests_seen += 1;
        if !req.is_ready() {
            // the parse path already answered; let the connection close
            return Ok(false);
        }

        let responded = req.respond(gateway);
        state.sent_headers = req.sent_headers();
        responded?;

        Ok(!req.close_connection())
    }

    /// 408 is only owed to a peer that has shown signs of life: bytes of
    /// the current request on the wire, or a previously completed request
    /// on this connection. A silent fresh connection just goes away.
    fn owes_timeout_response(&self, state: &ExchangeState) -> bool {
        state.started || self.requests_seen > 0 || self.reader.has_buffered_data()
    }

    fn handle_failure(&mut self, err: Error, state: &ExchangeState) {
        if let Some(io_err) = err.io() {
            if is_timeout(io_err) {
                if self.owes_timeout_response(state) {
                    self.conditional_error(state, "408 Request Timeout", "Request Timeout");
                }
                return;
            }
        }
        match err {
            Error::RequestTimeout => {
                if self.owes_timeout_response(state) {
                    self.conditional_error(state, "408 Request Timeout", "Request Timeout");
                }
            }
            Error::PeerClosed(_) | Error::Transient(_) => {}
            Error::NoTls => self.handle_no_tls(state),
            Error::FatalTls(reason) => {
                tracing::debug!(reason = %reason, "fatal TLS failure while serving");
            }
            Error::Fatal(io_err) => {
                tracing::warn!(error = %io_err, "socket error while serving request");
                self.conditional_error(state, "500 Internal Server Error", "");
            }
            other => {
                tracing::error!(error = %other, "internal error while serving request");
                self.conditional_error(state, "500 Internal Server Error", "");
            }
        }
    }

    /// Tell a client that spoke plaintext on a TLS port what went wrong,
    /// then linger so it has a chance to read the answer.
    fn handle_no_tls(&mut self, state: &ExchangeState) {
        if state.sent_headers {
            return;
        }
        let msg = "The client sent a plain HTTP request, but this server \
                   only speaks HTTPS on this port.";
        let buf = simple_response_bytes(&self.config, "400 Bad Request", msg);
        let _ = self.writer.write(self.transport.as_mut(), &buf);
        let _ = self.writer.flush(self.transport.as_mut());
        self.linger = true;
    }

    /// Answer with an error unless a response already started.
    fn conditional_error(&mut self, state: &ExchangeState, status: &str, msg: &str) {
        if state.sent_headers {
            return;
        }
        let buf = simple_response_bytes(&self.config, status, msg);
        let _ = self.writer.write(self.transport.as_mut(), &buf);
        let _ = self.writer.flush(self.transport.as_mut());
    }

    /// Close the connection. Idempotent; only the first call does work.
    ///
    /// With `linger` set the kernel shutdown is skipped so the FIN goes out
    /// when the fd is released, giving the peer time to read the response.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.writer.close(self.transport.as_mut());
        if !self.linger {
            let _ = self.transport.shutdown();
        }
    }

    /// `(pid, uid, gid)` of the peer process, for Unix sockets on Linux.
    /// The lookup runs once per connection and is memoized.
    #[cfg(target_os = "linux")]
    pub fn peer_creds(&mut self) -> io::Result<(libc::pid_t, libc::uid_t, libc::gid_t)> {
        if !self.is_unix {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "SO_PEERCRED is only available on Unix domain sockets",
            ));
        }
        if !self.config.peercreds_enabled {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "peer creds lookup is disabled within this server",
            ));
        }
        if let Some(creds) = self.peer_creds {
            return Ok(creds);
        }
        let mut ucred = libc::ucred {
            pid: 0,
            uid: 0,
            gid: 0,
        };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
        // SAFETY: ucred and len describe a valid, writable out-buffer.
        let rc = unsafe {
            libc::getsockopt(
                self.transport.raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                &mut ucred as *mut libc::ucred as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        let creds = (ucred.pid, ucred.uid, ucred.gid);
        self.peer_creds = Some(creds);
        Ok(creds)
    }

    /// `(username, group)` of the peer process, memoized per connection.
    ///
    /// Unavailable on sandboxed runtimes that advertise themselves through
    /// `SERVER_SOFTWARE` (Google App Engine), where the passwd database is
    /// not meaningful.
    #[cfg(target_os = "linux")]
    pub fn resolve_peer_creds(&mut self) -> io::Result<(String, String)> {
        let sandboxed = std::env::var("SERVER_SOFTWARE")
            .is_ok_and(|v| v.starts_with("Google App Engine/"));
        if sandboxed {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "UID/GID lookup is unavailable under the current platform",
            ));
        }
        if !self.config.peercreds_resolve_enabled {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "UID/GID lookup is disabled within this server",
            ));
        }
        if let Some(names) = &self.peer_names {
            return Ok(names.clone());
        }
        let (_, uid, gid) = self.peer_creds()?;
        let names = (lookup_user(uid)?, lookup_group(gid)?);
        self.peer_names = Some(names.clone());
        Ok(names)
    }
}

#[cfg(target_os = "linux")]
fn lookup_user(uid: libc::uid_t) -> io::Result<String> {
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0 as libc::c_char; 1024];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    // SAFETY: out-params point at valid storage sized by buf.len().
    let rc = unsafe { libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result) };
    if rc != 0 || result.is_null() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no passwd entry for uid {uid}"),
        ));
    }
    // SAFETY: getpwuid_r populated pw_name with a NUL-terminated string.
    let name = unsafe { std::ffi::CStr::from_ptr(pwd.pw_name) };
    Ok(name.to_string_lossy().into_owned())
}

#[cfg(target_os = "linux")]
fn lookup_group(gid: libc::gid_t) -> io::Result<String> {
    let mut grp: libc::group = unsafe { std::mem::zeroed() };
    let mut buf = vec![0 as libc::c_char; 1024];
    let mut result: *mut libc::group = std::ptr::null_mut();
    // SAFETY: out-params point at valid storage sized by buf.len().
    let rc = unsafe { libc::getgrgid_r(gid, &mut grp, buf.as_mut_ptr(), buf.len(), &mut result) };
    if rc != 0 || result.is_null() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no group entry for gid {gid}"),
        ));
    }
    // SAFETY: getgrgid_r populated gr_name with a NUL-terminated string.
    let name = unsafe { std::ffi::CStr::from_ptr(grp.gr_name) };
    Ok(name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod test {
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;
    use std::sync::Arc;

    use super::{prevent_socket_inheritance, Connection};
    use crate::server::ServerConfig;
    use crate::tls::TlsEnviron;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn connection(server: TcpStream) -> Connection {
        Connection::new(
            Box::new(server),
            Arc::new(ServerConfig::default()),
            None,
            TlsEnviron::new(),
            false,
        )
        .unwrap()
    }

    #[test]
    fn construction_sets_cloexec() {
        let (_client, server) = socket_pair();
        let fd = server.as_raw_fd();
        let conn = connection(server);
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert!(flags >= 0);
        assert_ne!(0, flags & libc::FD_CLOEXEC);
        drop(conn);
    }

    #[test]
    fn close_is_idempotent() {
        let (_client, server) = socket_pair();
        let mut conn = connection(server);
        conn.close();
        conn.close();
        conn.close();
    }

    #[test]
    fn cloexec_helper_rejects_bad_fd() {
        assert!(prevent_socket_inheritance(-1).is_err());
    }
}
