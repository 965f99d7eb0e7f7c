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

//! The server facade: bind, listen, serve, stop.
//!
//! The serving thread runs a tight loop around [`Server::tick`], which asks
//! the connection manager for one ready connection and hands it to the
//! worker pool. Workers call back into the manager to return keep-alive
//! connections. The dynamic resizer runs on its own cadence thread.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::connection::prevent_socket_inheritance;
use crate::errors::is_ignorable_socket_error;
use crate::gateway::Gateway;
use crate::manager::ConnectionManager;
use crate::request::HttpVersion;
use crate::resizer::DynamicResizer;
use crate::stream::Transport;
use crate::tls::TlsAdapter;
use crate::worker::{PoolTotals, WorkerPool};

/// Where the server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAddr {
    /// TCP `(host, port)`. Host `0.0.0.0` or `::` binds all interfaces;
    /// an empty host is rejected at prepare time.
    Tcp(String, u16),
    /// Unix domain socket at a filesystem path, chmodded to `0777`.
    Unix(PathBuf),
    /// Linux abstract-namespace Unix socket (no filesystem presence).
    Abstract(Vec<u8>),
}

impl BindAddr {
    /// Parse the CLI notation: `host:port`, a filesystem path, or `@name`
    /// for an abstract socket.
    pub fn parse(input: &str) -> Option<Self> {
        if let Some(name) = input.strip_prefix('@') {
            return Some(BindAddr::Abstract(name.as_bytes().to_vec()));
        }
        if input.contains('/') {
            return Some(BindAddr::Unix(PathBuf::from(input)));
        }
        let (host, port) = input.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Some(BindAddr::Tcp(host.to_string(), port))
    }
}

/// Server configuration. Fields mirror the constructor keywords of the
/// facade; everything has a workable default.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Value of the default `Server:` response header.
    pub server_name: String,
    /// Version written in every status line; also caps response features.
    pub protocol: HttpVersion,
    /// `listen()` backlog.
    pub request_queue_size: i32,
    /// How long `stop` waits for workers to drain.
    pub shutdown_timeout: Duration,
    /// Per-connection idle timeout.
    pub timeout: Duration,
    /// Maximum bytes for the request line plus headers; 0 is unlimited.
    pub max_request_header_size: usize,
    /// Maximum bytes for a request body; 0 is unlimited.
    pub max_request_body_size: u64,
    /// Set `TCP_NODELAY` on the listening socket.
    pub nodelay: bool,
    /// Initial (and minimum) worker count.
    pub min_threads: usize,
    /// Maximum worker count; negative means unlimited.
    pub max_threads: isize,
    /// Resizer: minimum idle workers kept available.
    pub min_spare: usize,
    /// Resizer: maximum idle workers tolerated.
    pub max_spare: usize,
    /// Resizer: minimum time between shrink operations; zero disables.
    pub shrink_frequency: Duration,
    /// Resizer cadence; zero disables the resizer thread.
    pub resize_frequency: Duration,
    /// Bound on the ready-connection queue; `None` is unbounded.
    pub accepted_queue_size: Option<usize>,
    /// How long `put` may wait on a full queue before the connection is
    /// closed instead. Zero never blocks the acceptor.
    pub accepted_queue_timeout: Duration,
    /// Look up `SO_PEERCRED` on Unix-socket connections.
    pub peercreds_enabled: bool,
    /// Additionally resolve uid/gid to user/group names.
    pub peercreds_resolve_enabled: bool,
    /// Cap on idle keep-alive connections; `None` is unlimited.
    pub keep_alive_conn_limit: Option<usize>,
    /// Behave as a proxy: allow absolute-form targets and `CONNECT`.
    pub proxy_mode: bool,
    /// Reject requests a compliant client would never send.
    pub strict_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: concat!("stoker/", env!("CARGO_PKG_VERSION")).to_string(),
            protocol: HttpVersion::V1_1,
            request_queue_size: 5,
            shutdown_timeout: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
            max_request_header_size: 0,
            max_request_body_size: 0,
            nodelay: true,
            min_threads: 10,
            max_threads: -1,
            min_spare: 2,
            max_spare: 10,
            shrink_frequency: Duration::from_secs(5),
            resize_frequency: Duration::from_secs(1),
            accepted_queue_size: None,
            accepted_queue_timeout: Duration::ZERO,
            peercreds_enabled: false,
            peercreds_resolve_enabled: false,
            keep_alive_conn_limit: Some(10),
            proxy_mode: false,
            strict_mode: true,
        }
    }
}

/// Server-level counters. Worker-level counters live in the pool; the
/// `enabled` flag is the single check hot paths make.
#[derive(Debug, Default)]
pub struct ServerStats {
    enabled: AtomicBool,
    accepts: AtomicU64,
    socket_errors: AtomicU64,
}

impl ServerStats {
    /// True when statistics collection is on.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Toggle statistics collection.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub(crate) fn inc_accepts(&self) {
        self.accepts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_socket_errors(&self) {
        self.socket_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Connections accepted so far.
    pub fn accepts(&self) -> u64 {
        self.accepts.load(Ordering::Relaxed)
    }

    /// Accept-path socket errors so far.
    pub fn socket_errors(&self) -> u64 {
        self.socket_errors.load(Ordering::Relaxed)
    }
}

/// Point-in-time aggregation of server and pool statistics.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    /// Connections accepted.
    pub accepts: u64,
    /// Accept-path socket errors.
    pub socket_errors: u64,
    /// Worker totals (requests, bytes, work time).
    pub totals: PoolTotals,
    /// Live worker threads.
    pub threads: usize,
    /// Idle worker threads.
    pub threads_idle: usize,
    /// Queued ready connections.
    pub queue: usize,
}

/// A socket accepted from the listener, before it becomes a connection.
pub enum AcceptedStream {
    /// Plain TCP.
    Tcp(TcpStream),
    /// Unix domain.
    Unix(UnixStream),
    /// Already wrapped (TLS).
    Boxed(Box<dyn Transport>),
}

impl std::fmt::Debug for AcceptedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcceptedStream::Tcp(_) => f.write_str("AcceptedStream::Tcp"),
            AcceptedStream::Unix(_) => f.write_str("AcceptedStream::Unix"),
            AcceptedStream::Boxed(_) => f.write_str("AcceptedStream::Boxed"),
        }
    }
}

impl AcceptedStream {
    pub(crate) fn boxed(transport: Box<dyn Transport>) -> Self {
        AcceptedStream::Boxed(transport)
    }

    pub(crate) fn into_transport(self) -> Box<dyn Transport> {
        match self {
            AcceptedStream::Tcp(stream) => Box::new(stream),
            AcceptedStream::Unix(stream) => Box::new(stream),
            AcceptedStream::Boxed(transport) => transport,
        }
    }
}

/// The listening socket, owned by the server facade. The manager reads its
/// fd for readiness and accepts from it, nothing more.
#[derive(Debug)]
pub enum ServerSocket {
    /// TCP listener.
    Tcp(TcpListener),
    /// Unix-domain listener (filesystem path or abstract).
    Unix(UnixListener),
}

impl ServerSocket {
    /// Accept one pending connection. The listener is non-blocking, so an
    /// empty backlog surfaces as `WouldBlock`.
    pub fn accept(&self) -> io::Result<(AcceptedStream, Option<SocketAddr>)> {
        match self {
            ServerSocket::Tcp(listener) => {
                let (stream, addr) = listener.accept()?;
                stream.set_nonblocking(false)?;
                Ok((AcceptedStream::Tcp(stream), Some(addr)))
            }
            ServerSocket::Unix(listener) => {
                let (stream, _) = listener.accept()?;
                stream.set_nonblocking(false)?;
                Ok((AcceptedStream::Unix(stream), None))
            }
        }
    }

    /// The listener's kernel fd.
    pub fn raw_fd(&self) -> RawFd {
        match self {
            ServerSocket::Tcp(listener) => listener.as_raw_fd(),
            ServerSocket::Unix(listener) => listener.as_raw_fd(),
        }
    }

    /// True for Unix-domain listeners.
    pub fn is_unix(&self) -> bool {
        matches!(self, ServerSocket::Unix(_))
    }

    /// The all-zeroes address of the listener's family, used when the peer
    /// address cannot be resolved.
    pub fn fallback_peer_addr(&self) -> Option<SocketAddr> {
        match self {
            ServerSocket::Tcp(listener) => listener.local_addr().ok().map(|addr| {
                if addr.is_ipv4() {
                    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
                } else {
                    SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
                }
            }),
            ServerSocket::Unix(_) => None,
        }
    }
}

struct ResizerHandle {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

/// An HTTP server.
///
/// Lifecycle: `new` (unbound) → [`prepare`] (listening, workers running) →
/// [`serve`] (accepting) → [`stop`]. [`start`] chains prepare and serve.
///
/// [`prepare`]: Server::prepare
/// [`serve`]: Server::serve
/// [`stop`]: Server::stop
/// [`start`]: Server::start
pub struct Server {
    bind_addr: BindAddr,
    config: Arc<ServerConfig>,
    stats: Arc<ServerStats>,
    manager: Arc<ConnectionManager>,
    pool: Arc<WorkerPool>,
    socket: Mutex<Option<ServerSocket>>,
    bound_addr: Mutex<Option<SocketAddr>>,
    ready: AtomicBool,
    interrupt: Mutex<Option<String>>,
    resizer: Mutex<Option<ResizerHandle>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("bind_addr", &self.bind_addr)
            .field("ready", &self.ready.load(Ordering::Relaxed))
            .finish()
    }
}

impl Server {
    /// Assemble a server; nothing is bound until [`Server::prepare`].
    pub fn new(
        bind_addr: BindAddr,
        gateway: Arc<dyn Gateway>,
        config: ServerConfig,
        tls_adapter: Option<Arc<dyn TlsAdapter>>,
    ) -> io::Result<Self> {
        let config = Arc::new(config);
        let stats = Arc::new(ServerStats::default());
        let manager = Arc::new(ConnectionManager::new(
            config.clone(),
            stats.clone(),
            tls_adapter,
        )?);
        let pool = Arc::new(WorkerPool::new(
            config.clone(),
            stats.clone(),
            gateway,
            manager.clone(),
        ));
        Ok(Self {
            bind_addr,
            config,
            stats,
            manager,
            pool,
            socket: Mutex::new(None),
            bound_addr: Mutex::new(None),
            ready: AtomicBool::new(false),
            interrupt: Mutex::new(None),
            resizer: Mutex::new(None),
        })
    }

    /// The configuration this server runs with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Server-level counters.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Aggregate server and worker statistics.
    pub fn stats_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepts: self.stats.accepts(),
            socket_errors: self.stats.socket_errors(),
            totals: self.pool.totals(),
            threads: self.pool.size(),
            threads_idle: self.pool.idle_count(),
            queue: self.pool.qsize(),
        }
    }

    /// The actual TCP address bound, once prepared. Useful with port 0.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock().expect("bound addr lock poisoned")
    }

    /// True while the acceptor and workers are meant to be running.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Bind the listening socket, start the workers and the resizer.
    pub fn prepare(&self) -> io::Result<()> {
        if self.is_ready() {
            return Ok(());
        }

        let listener = if std::env::var_os("LISTEN_PID").is_some() {
            // systemd socket activation: the unit hands us fd 3
            // SAFETY: under LISTEN_PID the service manager owns fd 3 and
            // guarantees it is a listening socket.
            let listener = unsafe { TcpListener::from_raw_fd(3) };
            listener.set_nonblocking(true)?;
            ServerSocket::Tcp(listener)
        } else {
            match &self.bind_addr {
                BindAddr::Tcp(host, port) => self.bind_tcp(host, *port)?,
                BindAddr::Unix(path) => self.bind_unix(path.clone())?,
                BindAddr::Abstract(name) => bind_abstract(name, self.config.request_queue_size)?,
            }
        };

        prevent_socket_inheritance(listener.raw_fd())?;
        if let ServerSocket::Tcp(l) = &listener {
            *self.bound_addr.lock().expect("bound addr lock poisoned") = l.local_addr().ok();
        }
        self.manager.register_listener(listener.raw_fd())?;
        *self.socket.lock().expect("listener lock poisoned") = Some(listener);

        self.pool.start();
        self.start_resizer();
        self.ready.store(true, Ordering::SeqCst);
        tracing::debug!(bind_addr = ?self.bind_addr, "server prepared");
        Ok(())
    }

    fn bind_tcp(&self, host: &str, port: u16) -> io::Result<ServerSocket> {
        if host.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Host values of '' are not allowed. Use '0.0.0.0' (IPv4) or '::' (IPv6) \
                 instead to listen on all active interfaces.",
            ));
        }
        let candidates = (host, port).to_socket_addrs()?;
        let mut last_err = None;
        for addr in candidates {
            match self.try_bind_tcp(addr) {
                Ok(listener) => return Ok(ServerSocket::Tcp(listener)),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "No socket could be created")
        }))
    }

    fn try_bind_tcp(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        if addr.port() != 0 {
            // ephemeral ports skip SO_REUSEADDR so they cannot steal a
            // port already in use elsewhere
            socket.set_reuse_address(true)?;
        }
        if self.config.nodelay {
            socket.set_nodelay(true)?;
        }
        if let SocketAddr::V6(v6) = addr {
            if v6.ip().is_unspecified() {
                // dual-stack when listening on IN6ADDR_ANY
                let _ = socket.set_only_v6(false);
            }
        }
        socket.bind(&SockAddr::from(addr))?;
        socket.listen(self.config.request_queue_size)?;
        let listener: TcpListener = socket.into();
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    fn bind_unix(&self, path: PathBuf) -> io::Result<ServerSocket> {
        // stale socket files from a previous run are fair game
        let _ = std::fs::remove_file(&path);

        let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        // SAFETY: fchmod on our own, just-created fd.
        let mut perms_set = unsafe { libc::fchmod(socket.as_raw_fd(), 0o777) == 0 };
        socket.bind(&SockAddr::unix(&path)?)?;
        if !perms_set {
            perms_set =
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o777)).is_ok();
        }
        if !perms_set {
            tracing::warn!(path = %path.display(), "failed to set socket fs mode permissions");
        }
        socket.listen(self.config.request_queue_size)?;
        let listener: UnixListener = socket.into();
        listener.set_nonblocking(true)?;
        Ok(ServerSocket::Unix(listener))
    }

    fn start_resizer(&self) {
        if self.config.resize_frequency.is_zero() {
            return;
        }
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let pool = self.pool.clone();
        let mut resizer = DynamicResizer::new(
            self.config.min_spare,
            self.config.max_spare,
            self.config.shrink_frequency,
        );
        let frequency = self.config.resize_frequency;
        let spawned = std::thread::Builder::new()
            .name("stoker-resizer".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(frequency) {
                    Err(RecvTimeoutError::Timeout) => resizer.run(&*pool),
                    _ => return,
                }
            });
        match spawned {
            Ok(thread) => {
                *self.resizer.lock().expect("resizer lock poisoned") =
                    Some(ResizerHandle { stop_tx, thread });
            }
            Err(err) => tracing::error!(error = %err, "failed to spawn resizer thread"),
        }
    }

    fn stop_resizer(&self) {
        if let Some(handle) = self.resizer.lock().expect("resizer lock poisoned").take() {
            let _ = handle.stop_tx.send(());
            let _ = handle.thread.join();
        }
    }

    /// Run the accept loop until [`Server::stop`] or an interrupt.
    pub fn serve(&self) -> io::Result<()> {
        while self.is_ready() {
            self.tick();
            let interrupted = self
                .interrupt
                .lock()
                .expect("interrupt lock poisoned")
                .take();
            if let Some(reason) = interrupted {
                tracing::debug!(reason = %reason, "interrupt requested; shutting down");
                self.stop();
                return Err(io::Error::new(io::ErrorKind::Interrupted, reason));
            }
        }
        Ok(())
    }

    /// Prepare and serve in one call.
    pub fn start(&self) -> io::Result<()> {
        self.prepare()?;
        self.serve()
    }

    /// Ask the serving thread to stop and surface `reason` from `serve`.
    pub fn interrupt(&self, reason: impl Into<String>) {
        *self.interrupt.lock().expect("interrupt lock poisoned") = Some(reason.into());
    }

    /// One scheduling beat: move a ready connection to the workers, then
    /// evict expired keep-alive connections.
    pub fn tick(&self) {
        if !self.is_ready() {
            return;
        }
        {
            let guard = self.socket.lock().expect("listener lock poisoned");
            let Some(listener) = guard.as_ref() else {
                return;
            };
            if let Some(conn) = self.manager.get_conn(listener) {
                if let Err(mut conn) = self.pool.put(conn) {
                    // the workers cannot keep up; shedding beats blocking
                    // the acceptor
                    conn.close();
                }
            }
        }
        self.manager.expire();
    }

    /// Gracefully shut down. Idempotent; later calls find nothing to do.
    pub fn stop(&self) {
        self.ready.store(false, Ordering::SeqCst);

        let listener = self.socket.lock().expect("listener lock poisoned").take();
        if let Some(listener) = listener {
            if let ServerSocket::Tcp(ref l) = listener {
                // touch our own socket so a blocked accept returns
                if let Ok(addr) = l.local_addr() {
                    match TcpStream::connect_timeout(&addr, Duration::from_secs(1)) {
                        Ok(_) => {}
                        Err(err) if is_ignorable_socket_error(&err) => {}
                        Err(err) => {
                            tracing::debug!(error = %err, "self-connect during stop failed")
                        }
                    }
                }
            }
            drop(listener);
            if let BindAddr::Unix(path) = &self.bind_addr {
                let _ = std::fs::remove_file(path);
            }
        }

        self.manager.close();
        self.pool.stop(self.config.shutdown_timeout);
        self.stop_resizer();
        tracing::debug!("server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.is_ready() {
            self.stop();
        }
    }
}

#[cfg(target_os = "linux")]
fn bind_abstract(name: &[u8], _backlog: i32) -> io::Result<ServerSocket> {
    use std::os::linux::net::SocketAddrExt;

    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name)?;
    let listener = UnixListener::bind_addr(&addr)?;
    listener.set_nonblocking(true)?;
    Ok(ServerSocket::Unix(listener))
}

#[cfg(not(target_os = "linux"))]
fn bind_abstract(_name: &[u8], _backlog: i32) -> io::Result<ServerSocket> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract Unix sockets are Linux-only",
    ))
}

#[cfg(test)]
mod test {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpStream;
    use std::sync::Arc;
    use std::time::Duration;

    use super::{BindAddr, Server, ServerConfig};
    use crate::errors::Result;
    use crate::gateway::Gateway;
    use crate::request::Request;

    /// Routes the end-to-end scenarios by path.
    struct ScenarioGateway;

    impl Gateway for ScenarioGateway {
        fn respond(&self, req: &mut Request<'_>) -> Result<()> {
            match req.path() {
                b"/pov" => {
                    let body = b"pPeErRsSiIsStTeEnNcCeE oOfF vViIsSiIoOnN";
                    req.set_status(b"200 OK")?;
                    req.add_header(b"Content-Length", body.len().to_string().as_bytes())?;
                    req.send_headers()?;
                    req.write(body)
                }
                b"/echo" => {
                    let body = req.read_body(None)?;
                    req.set_status(b"200 OK")?;
                    req.add_header(b"Content-Length", body.len().to_string().as_bytes())?;
                    req.send_headers()?;
                    req.write(&body)
                }
                b"/upload" => {
                    let body = req.read_body(None)?;
                    let reply = format!("thanks for '{}'", String::from_utf8_lossy(&body));
                    req.set_status(b"200 OK")?;
                    req.add_header(b"Content-Length", reply.len().to_string().as_bytes())?;
                    req.send_headers()?;
                    req.write(reply.as_bytes())
                }
                _ => {
                    req.set_status(b"404 Not Found")?;
                    req.add_header(b"Content-Length", b"0")?;
                    req.send_headers()
                }
            }
        }
    }

    fn start_server(mut config: ServerConfig) -> (Arc<Server>, std::net::SocketAddr) {
        config.min_threads = 2;
        let server = Arc::new(
            Server::new(
                BindAddr::Tcp("127.0.0.1".to_string(), 0),
                Arc::new(ScenarioGateway),
                config,
                None,
            )
            .unwrap(),
        );
        server.prepare().unwrap();
        let addr = server.bound_addr().unwrap();
        let background = server.clone();
        std::thread::spawn(move || {
            let _ = background.serve();
        });
        (server, addr)
    }

    /// Read one response off the wire: status line, headers, then a body
    /// sized by `Content-Length`.
    fn read_response(reader: &mut BufReader<TcpStream>) -> (String, Vec<String>, Vec<u8>) {
        let mut status = String::new();
        reader.read_line(&mut status).unwrap();
        let mut headers = Vec::new();
        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            if line == "\r\n" {
                break;
            }
            if let Some(value) = line
                .to_ascii_lowercase()
                .strip_prefix("content-length:")
                .map(str::trim)
            {
                content_length = value.parse().unwrap();
            }
            headers.push(line.trim_end().to_string());
        }
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).unwrap();
        (status.trim_end().to_string(), headers, body)
    }

    #[test]
    fn keep_alive_serves_multiple_requests_on_one_connection() {
        let (server, addr) = start_server(ServerConfig::default());
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut write_half = stream.try_clone().unwrap();

        for _ in 0..3 {
            write_half
                .write_all(b"GET /pov HTTP/1.1\r\nHost: h\r\n\r\n")
                .unwrap();
            let (status, headers, body) = read_response(&mut reader);
            assert_eq!("HTTP/1.1 200 OK", status);
            assert_eq!(b"pPeErRsSiIsStTeEnNcCeE oOfF vViIsSiIoOnN".as_slice(), body);
            assert!(!headers.iter().any(|h| h.eq_ignore_ascii_case("connection: close")));
        }

        server.stop();
    }

    #[test]
    fn chunked_upload_is_decoded_and_echoed() {
        let (server, addr) = start_server(ServerConfig::default());
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut write_half = stream.try_clone().unwrap();

        write_half
            .write_all(
                b"POST /echo HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n\
                  13\r\nI am a request body\r\n0\r\n\r\n",
            )
            .unwrap();
        let (status, _, body) = read_response(&mut reader);
        assert_eq!("HTTP/1.1 200 OK", status);
        assert_eq!(b"I am a request body".as_slice(), body);

        server.stop();
    }

    #[test]
    fn oversized_body_is_rejected_with_413() {
        let mut config = ServerConfig::default();
        config.max_request_body_size = 1000;
        let (server, addr) = start_server(config);
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut write_half = stream.try_clone().unwrap();

        write_half
            .write_all(b"POST /upload HTTP/1.1\r\nHost: h\r\nContent-Length: 9999\r\n\r\n")
            .unwrap();
        let (status, _, body) = read_response(&mut reader);
        assert_eq!("HTTP/1.1 413 Request Entity Too Large", status);
        assert!(String::from_utf8_lossy(&body)
            .contains("The entity sent with the request exceeds the maximum allowed bytes."));

        // server closes after a 413
        let mut probe = [0u8; 1];
        assert_eq!(0, reader.read(&mut probe).unwrap_or(0));

        server.stop();
    }

    #[test]
    fn expect_100_continue_round_trip() {
        let (server, addr) = start_server(ServerConfig::default());
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut write_half = stream.try_clone().unwrap();

        write_half
            .write_all(
                b"POST /upload HTTP/1.1\r\nHost: h\r\nExpect: 100-continue\r\n\
                  Content-Length: 17\r\n\r\n",
            )
            .unwrap();

        let mut interim = [0u8; 25];
        reader.read_exact(&mut interim).unwrap();
        assert_eq!(b"HTTP/1.1 100 Continue\r\n\r\n".as_slice(), interim);

        write_half.write_all(b"I am a small file").unwrap();
        let (status, _, body) = read_response(&mut reader);
        assert_eq!("HTTP/1.1 200 OK", status);
        assert_eq!(b"thanks for 'I am a small file'".as_slice(), body);

        server.stop();
    }

    #[test]
    fn absolute_uri_is_rejected_outside_proxy_mode() {
        let (server, addr) = start_server(ServerConfig::default());
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut write_half = stream.try_clone().unwrap();

        write_half
            .write_all(b"GET http://google.com/ HTTP/1.1\r\nHost: h\r\n\r\n")
            .unwrap();
        let (status, _, body) = read_response(&mut reader);
        assert_eq!("HTTP/1.1 400 Bad Request", status);
        assert_eq!(
            "Absolute URI not allowed if server is not a proxy.",
            String::from_utf8_lossy(&body)
        );

        server.stop();
    }

    #[test]
    fn idle_mid_request_connection_gets_408() {
        let mut config = ServerConfig::default();
        config.timeout = Duration::from_millis(200);
        let (server, addr) = start_server(config);
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut write_half = stream.try_clone().unwrap();

        // half a request line, then silence
        write_half.write_all(b"GET /pov").unwrap();
        let (status, _, _) = read_response(&mut reader);
        assert_eq!("HTTP/1.1 408 Request Timeout", status);

        server.stop();
    }

    #[test]
    fn stop_is_idempotent_and_releases_the_port() {
        let (server, addr) = start_server(ServerConfig::default());
        server.stop();
        server.stop();
        assert!(!server.is_ready());
        // the listener is gone; a fresh connect must fail or be refused
        let outcome = TcpStream::connect_timeout(&addr, Duration::from_millis(500));
        if let Ok(stream) = outcome {
            // a race may accept one last connection; it must be dead
            stream
                .set_read_timeout(Some(Duration::from_secs(1)))
                .unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            let _ = reader.read_line(&mut line);
            assert!(line.is_empty());
        }
    }

    #[test]
    fn bind_addr_parse_accepts_all_forms() {
        assert_eq!(
            Some(BindAddr::Tcp("127.0.0.1".to_string(), 8080)),
            BindAddr::parse("127.0.0.1:8080")
        );
        assert_eq!(
            Some(BindAddr::Tcp("::1".to_string(), 8080)),
            BindAddr::parse("[::1]:8080")
        );
        assert_eq!(
            Some(BindAddr::Unix("/tmp/srv.sock".into())),
            BindAddr::parse("/tmp/srv.sock")
        );
        assert_eq!(
            Some(BindAddr::Abstract(b"srv".to_vec())),
            BindAddr::parse("@srv")
        );
        assert_eq!(None, BindAddr::parse("no-port"));
    }

    #[test]
    fn empty_host_is_rejected() {
        let server = Server::new(
            BindAddr::Tcp(String::new(), 0),
            Arc::new(ScenarioGateway),
            ServerConfig::default(),
            None,
        )
        .unwrap();
        assert!(server.prepare().is_err());
    }
}
