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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
#![doc(test(attr(deny(warnings))))]

//! A thread-pooled HTTP/1.1 server with keep-alive connection management
//! and TLS.
//!
//! The serving thread runs a tight loop, moving ready connections onto a
//! queue:
//!
//! ```text
//! server.start()
//! ->  while ready:
//!         tick()
//!         conn = manager.get_conn()   # select over listener + idle conns
//!         pool.put(conn)
//!         manager.expire()
//! ```
//!
//! Worker threads pop connections off the queue and drive the HTTP state
//! machine, returning keep-alive connections to the manager:
//!
//! ```text
//! worker:
//!     conn = pool.pop()
//!     keep = conn.communicate()       # parse request, gateway responds
//!     if keep: manager.put(conn) else: conn.close()
//! ```
//!
//! Responses are produced by a [`Gateway`] implementation; the server core
//! only speaks the wire protocol. A [`tls::TlsAdapter`] can be interposed
//! between the socket and the parser without the rest of the server
//! noticing.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stoker::{BindAddr, Gateway, Request, Server, ServerConfig};
//!
//! struct Hello;
//!
//! impl Gateway for Hello {
//!     fn respond(&self, req: &mut Request<'_>) -> stoker::Result<()> {
//!         req.set_status(b"200 OK")?;
//!         req.add_header(b"Content-Length", b"5")?;
//!         req.send_headers()?;
//!         req.write(b"hello")
//!     }
//! }
//!
//! fn main() -> std::io::Result<()> {
//!     let server = Server::new(
//!         BindAddr::Tcp("127.0.0.1".into(), 8080),
//!         Arc::new(Hello),
//!         ServerConfig::default(),
//!         None,
//!     )?;
//!     server.start()
//! }
//! ```

pub mod body;
pub mod connection;
pub mod errors;
pub mod gateway;
pub mod manager;
pub mod request;
pub mod resizer;
pub mod server;
pub mod stream;
pub mod tls;
pub mod worker;

pub use connection::Connection;
pub use errors::{Error, Result};
pub use gateway::Gateway;
pub use manager::ConnectionManager;
pub use request::{Headers, HttpVersion, Request};
pub use server::{BindAddr, Server, ServerConfig, ServerStats, StatsSnapshot};
pub use stream::Transport;
pub use tls::RustlsAdapter;
pub use worker::WorkerPool;
