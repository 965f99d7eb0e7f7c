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

//! Keep-alive connection management: readiness selection over idle
//! connections and the listening socket, the ready deque, and eviction.

use std::collections::VecDeque;
use std::io::Write;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;

use crate::connection::Connection;
use crate::errors::{is_eintr, is_ignorable_socket_error, is_nonblocking};
use crate::request::simple_response_bytes;
use crate::server::{ServerConfig, ServerSocket, ServerStats};
use crate::tls::{TlsAdapter, WrapFailure};

const LISTEN_TOKEN: Token = Token(usize::MAX);
const SELECT_TIMEOUT: Duration = Duration::from_millis(10);

/// Owns the idle keep-alive pool and the ready deque.
///
/// A connection is in exactly one place at any time: registered with the
/// poller (idle), in the ready deque, or inside a worker. `get_conn` moves
/// connections from the poller to the deque and hands the head to the
/// caller; `put` moves them back when a worker is done with them.
pub struct ConnectionManager {
    config: Arc<ServerConfig>,
    stats: Arc<ServerStats>,
    tls: Option<Arc<dyn TlsAdapter>>,
    poll: Mutex<(Poll, Events)>,
    registry: Registry,
    idle: Mutex<Slab<Connection>>,
    readable: Mutex<VecDeque<Connection>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("idle", &self.idle.lock().map(|s| s.len()).unwrap_or(0))
            .field(
                "readable",
                &self.readable.lock().map(|d| d.len()).unwrap_or(0),
            )
            .finish()
    }
}

impl ConnectionManager {
    /// Create a manager; the listening socket is registered separately once
    /// the server facade has bound it.
    pub(crate) fn new(
        config: Arc<ServerConfig>,
        stats: Arc<ServerStats>,
        tls: Option<Arc<dyn TlsAdapter>>,
    ) -> std::io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        Ok(Self {
            config,
            stats,
            tls,
            poll: Mutex::new((poll, Events::with_capacity(64))),
            registry,
            idle: Mutex::new(Slab::new()),
            readable: Mutex::new(VecDeque::new()),
        })
    }

    /// Watch the listening socket for incoming connections.
    pub(crate) fn register_listener(&self, fd: RawFd) -> std::io::Result<()> {
        self.registry
            .register(&mut SourceFd(&fd), LISTEN_TOKEN, Interest::READABLE)
    }

    fn deregister_fd(&self, fd: RawFd) {
        let _ = self.registry.deregister(&mut SourceFd(&fd));
    }

    /// Return a connection for keep-alive reuse.
    ///
    /// A connection whose read buffer already holds a pipelined request goes
    /// straight onto the ready deque; the rest park in the poller until the
    /// peer sends again.
    pub fn put(&self, mut conn: Connection) {
        conn.touch();
        if conn.has_buffered_data() {
            self.readable
                .lock()
                .expect("readable deque lock poisoned")
                .push_back(conn);
            return;
        }
        let fd = conn.raw_fd();
        let mut idle = self.idle.lock().expect("idle pool lock poisoned");
        let key = idle.insert(conn);
        if self
            .registry
            .register(&mut SourceFd(&fd), Token(key), Interest::READABLE)
            .is_err()
        {
            let mut conn = idle.remove(key);
            drop(idle);
            conn.close();
        }
    }

    /// Pull one servable connection: the deque head, a freshly readable
    /// idle connection, or a newly accepted one.
    pub fn get_conn(&self, listener: &ServerSocket) -> Option<Connection> {
        if let Some(conn) = self
            .readable
            .lock()
            .expect("readable deque lock poisoned")
            .pop_front()
        {
            return Some(conn);
        }

        {
            let mut guard = self.poll.lock().expect("poll lock poisoned");
            let (poll, events) = &mut *guard;
            if let Err(err) = poll.poll(events, Some(SELECT_TIMEOUT)) {
                if !is_eintr(&err) {
                    // some registered fd may have died under us
                    self.sweep_dead_fds();
                }
                return None;
            }
            // the poller is edge-style, so consume every event in the batch:
            // readiness not acted on now would not be reported again
            for event in events.iter() {
                match event.token() {
                    LISTEN_TOKEN => self.accept_drain(listener),
                    token => {
                        let conn = {
                            let mut idle = self.idle.lock().expect("idle pool lock poisoned");
                            idle.try_remove(token.0)
                        };
                        if let Some(conn) = conn {
                            self.deregister_fd(conn.raw_fd());
                            self.readable
                                .lock()
                                .expect("readable deque lock poisoned")
                                .push_back(conn);
                        }
                    }
                }
            }
        }

        self.readable
            .lock()
            .expect("readable deque lock poisoned")
            .pop_front()
    }

    /// Accept until the backlog is dry, parking each new connection on the
    /// ready deque (a fresh accept is servable by definition).
    fn accept_drain(&self, listener: &ServerSocket) {
        loop {
            match self.accept_one(listener) {
                Accepted::Conn(conn) => {
                    self.readable
                        .lock()
                        .expect("readable deque lock poisoned")
                        .push_back(conn);
                }
                Accepted::Skipped => continue,
                Accepted::Drained => return,
            }
        }
    }

    fn accept_one(&self, listener: &ServerSocket) -> Accepted {
        let (stream, addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) if is_nonblocking(&err) => return Accepted::Drained,
            Err(err) if is_eintr(&err) => return Accepted::Skipped,
            Err(err) if is_ignorable_socket_error(&err) => {
                if self.stats.is_enabled() {
                    self.stats.inc_socket_errors();
                }
                return Accepted::Skipped;
            }
            Err(err) => {
                if self.stats.is_enabled() {
                    self.stats.inc_socket_errors();
                }
                tracing::warn!(error = %err, "accept failed");
                return Accepted::Drained;
            }
        };
        if self.stats.is_enabled() {
            self.stats.inc_accepts();
        }

        let (transport, ssl_env) = match (&self.tls, stream) {
            (None, stream) => (stream, crate::tls::TlsEnviron::new()),
            (Some(adapter), crate::server::AcceptedStream::Tcp(sock)) => {
                match adapter.wrap(sock) {
                    Ok(wrapped) => (crate::server::AcceptedStream::boxed(wrapped.0), wrapped.1),
                    Err(WrapFailure::NoTls(mut raw)) => {
                        self.send_plaintext_400(&mut raw);
                        return Accepted::Skipped;
                    }
                    Err(WrapFailure::Fatal(err)) => {
                        tracing::debug!(error = %err, "TLS handshake failed");
                        return Accepted::Skipped;
                    }
                }
            }
            // TLS only layers over TCP; anything else passes through
            (Some(_), stream) => (stream, crate::tls::TlsEnviron::new()),
        };

        let is_unix = listener.is_unix();
        let remote_addr = if is_unix {
            None
        } else {
            addr.or_else(|| listener.fallback_peer_addr())
        };

        match Connection::new(
            transport.into_transport(),
            self.config.clone(),
            remote_addr,
            ssl_env,
            is_unix,
        ) {
            Ok(conn) => Accepted::Conn(conn),
            Err(err) => {
                tracing::warn!(error = %err, "dropping connection during setup");
                Accepted::Skipped
            }
        }
    }

    /// Courtesy answer for a client that spoke plaintext HTTP on a TLS
    /// port. Bypasses the connection lifecycle: no TLS session exists.
    fn send_plaintext_400(&self, sock: &mut std::net::TcpStream) {
        let msg = "The client sent a plain HTTP request, but this server \
                   only speaks HTTPS on this port.";
        let buf = simple_response_bytes(&self.config, "400 Bad Request", msg);
        if let Err(err) = sock.write_all(&buf) {
            if !is_ignorable_socket_error(&err) {
                tracing::warn!(error = %err, "failed to send plain-HTTP 400");
            }
        }
        let _ = sock.flush();
    }

    /// Close idle connections that outlived the server timeout.
    pub fn expire(&self) {
        let timeout = self.config.timeout;
        if timeout.is_zero() {
            return;
        }
        let now = Instant::now();
        let expired: Vec<Connection> = {
            let mut idle = self.idle.lock().expect("idle pool lock poisoned");
            let tokens: Vec<usize> = idle
                .iter()
                .filter(|(_, conn)| now.duration_since(conn.last_used()) > timeout)
                .map(|(token, _)| token)
                .collect();
            tokens.into_iter().map(|token| idle.remove(token)).collect()
        };
        for mut conn in expired {
            self.deregister_fd(conn.raw_fd());
            conn.close();
        }
    }

    /// True while another keep-alive connection fits under the configured
    /// cap. The listening socket is in neither collection, so the count is
    /// exactly the number of held connections.
    pub fn can_add_keepalive_connection(&self) -> bool {
        let Some(limit) = self.config.keep_alive_conn_limit else {
            return true;
        };
        let held = self.readable.lock().expect("readable deque lock poisoned").len()
            + self.idle.lock().expect("idle pool lock poisoned").len();
        held < limit
    }

    /// After a poll failure, probe every registered fd with `fstat` and
    /// close the ones the kernel no longer recognizes.
    fn sweep_dead_fds(&self) {
        let dead: Vec<Connection> = {
            let mut idle = self.idle.lock().expect("idle pool lock poisoned");
            let tokens: Vec<usize> = idle
                .iter()
                .filter(|(_, conn)| !fd_is_alive(conn.raw_fd()))
                .map(|(token, _)| token)
                .collect();
            tokens.into_iter().map(|token| idle.remove(token)).collect()
        };
        for mut conn in dead {
            self.deregister_fd(conn.raw_fd());
            conn.close();
        }
    }

    /// Close every held connection. The listening socket itself belongs to
    /// the server facade and is closed there.
    pub fn close(&self) {
        let mut held: Vec<Connection> = self
            .readable
            .lock()
            .expect("readable deque lock poisoned")
            .drain(..)
            .collect();
        {
            let mut idle = self.idle.lock().expect("idle pool lock poisoned");
            let tokens: Vec<usize> = idle.iter().map(|(token, _)| token).collect();
            for token in tokens {
                let conn = idle.remove(token);
                self.deregister_fd(conn.raw_fd());
                held.push(conn);
            }
        }
        for mut conn in held {
            conn.close();
        }
    }

    #[cfg(test)]
    fn held_count(&self) -> usize {
        self.readable.lock().unwrap().len() + self.idle.lock().unwrap().len()
    }
}

enum Accepted {
    Conn(Connection),
    Skipped,
    Drained,
}

fn fd_is_alive(fd: RawFd) -> bool {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: stat points at a zeroed, properly sized buffer.
    unsafe { libc::fstat(fd, &mut stat) == 0 }
}
