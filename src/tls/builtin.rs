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

//! The rustls-backed TLS adapter.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::PrivateKeyDer;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, ServerConnection, StreamOwned};

use crate::errors::{is_acceptable_shutdown_error, is_timeout, Error, Result};
use crate::stream::Transport;
use crate::tls::{
    cert_environ, cipher_key_bits, der_to_pem, looks_like_plain_http, protocol_name, TlsAdapter,
    TlsEnviron, WrapFailure, PLAINTEXT_PEEK_BYTES,
};

const PEEK_TIMEOUT: Duration = Duration::from_millis(500);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// TLS adapter over [`rustls`].
///
/// Built from PEM files; optionally verifies client certificates against a
/// CA bundle, in which case the `SSL_CLIENT_*` environment is populated.
pub struct RustlsAdapter {
    config: Arc<ServerConfig>,
    client_auth: bool,
    server_cert_env: TlsEnviron,
}

impl std::fmt::Debug for RustlsAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustlsAdapter")
            .field("client_auth", &self.client_auth)
            .finish()
    }
}

impl RustlsAdapter {
    /// Build an adapter from PEM-encoded certificate chain and private key
    /// files. `client_ca` enables optional client certificate verification.
    pub fn from_pem_files(
        certificate: impl AsRef<Path>,
        private_key: impl AsRef<Path>,
        client_ca: Option<&Path>,
    ) -> Result<Self> {
        let certificate = certificate.as_ref();
        let certs = read_certs(certificate)?;
        let key = read_private_key(private_key.as_ref())?;

        let builder = ServerConfig::builder();
        let (config, client_auth) = match client_ca {
            None => (
                builder
                    .with_no_client_auth()
                    .with_single_cert(certs.clone(), key)
                    .map_err(|err| Error::FatalTls(err.to_string()))?,
                false,
            ),
            Some(ca_path) => {
                let mut roots = RootCertStore::empty();
                for cert in read_certs(ca_path)? {
                    roots
                        .add(cert)
                        .map_err(|err| Error::FatalTls(err.to_string()))?;
                }
                let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                    .allow_unauthenticated()
                    .build()
                    .map_err(|err| Error::FatalTls(err.to_string()))?;
                (
                    builder
                        .with_client_cert_verifier(verifier)
                        .with_single_cert(certs.clone(), key)
                        .map_err(|err| Error::FatalTls(err.to_string()))?,
                    true,
                )
            }
        };

        let mut server_cert_env = TlsEnviron::new();
        if let Some(leaf) = certs.first() {
            cert_environ("SSL_SERVER", leaf, &mut server_cert_env);
        }

        Ok(Self {
            config: Arc::new(config),
            client_auth,
            server_cert_env,
        })
    }

    /// Peek at the first bytes to catch a client speaking plaintext HTTP.
    ///
    /// Best effort: a timeout or empty peek is inconclusive and lets the
    /// handshake proceed to fail with its own diagnostics.
    fn check_for_plain_http(&self, sock: &TcpStream) -> bool {
        let mut peeked = [0u8; PLAINTEXT_PEEK_BYTES];
        if sock.set_read_timeout(Some(PEEK_TIMEOUT)).is_err() {
            return false;
        }
        match sock.peek(&mut peeked) {
            Ok(n) => looks_like_plain_http(&peeked[..n]),
            Err(_) => false,
        }
    }

    fn handshake(&self, sock: &mut TcpStream) -> Result<ServerConnection> {
        let mut conn = ServerConnection::new(self.config.clone())
            .map_err(|err| Error::FatalTls(err.to_string()))?;
        sock.set_read_timeout(Some(HANDSHAKE_TIMEOUT))
            .map_err(Error::from_io)?;
        sock.set_write_timeout(Some(HANDSHAKE_TIMEOUT))
            .map_err(Error::from_io)?;

        while conn.is_handshaking() {
            match conn.complete_io(sock) {
                Ok(_) => {}
                Err(err) => return Err(classify_handshake_error(&err)),
            }
        }
        Ok(conn)
    }

    fn get_environ(&self, transport: &RustlsTransport) -> TlsEnviron {
        let mut env = TlsEnviron::new();
        env.insert("wsgi.url_scheme".into(), "https".into());
        env.insert("HTTPS".into(), "on".into());
        env.insert(
            "SSL_VERSION_INTERFACE".into(),
            format!("{}/{} rustls", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        );
        env.insert("SSL_VERSION_LIBRARY".into(), "rustls".into());

        if let Some((name, protocol, bits)) = transport.cipher_info() {
            env.insert("SSL_PROTOCOL".into(), protocol.into());
            env.insert("SSL_CIPHER".into(), name);
            env.insert("SSL_CIPHER_USEKEYSIZE".into(), bits.to_string());
        }
        if let Some(sni) = transport.server_name_indication() {
            env.insert("SSL_TLS_SNI".into(), sni.to_string());
        }

        match transport.peer_cert() {
            Some(der) => {
                env.insert("SSL_CLIENT_VERIFY".into(), "SUCCESS".into());
                env.insert("SSL_CLIENT_CERT".into(), der_to_pem(der));
                cert_environ("SSL_CLIENT", der, &mut env);
            }
            None => {
                env.insert("SSL_CLIENT_VERIFY".into(), "NONE".into());
            }
        }

        env.extend(
            self.server_cert_env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        env
    }
}

impl TlsAdapter for RustlsAdapter {
    fn wrap(
        &self,
        mut sock: TcpStream,
    ) -> std::result::Result<(Box<dyn Transport>, TlsEnviron), WrapFailure> {
        if self.check_for_plain_http(&sock) {
            return Err(WrapFailure::NoTls(sock));
        }
        let conn = match self.handshake(&mut sock) {
            Ok(conn) => conn,
            // plaintext detected by the record layer instead of the probe;
            // the raw socket is still good for the courtesy 400
            Err(Error::NoTls) => return Err(WrapFailure::NoTls(sock)),
            Err(err) => return Err(WrapFailure::Fatal(err)),
        };
        let transport = RustlsTransport {
            stream: StreamOwned::new(conn, sock),
            verify_mode: self.client_auth,
        };
        let env = self.get_environ(&transport);
        Ok((Box::new(transport), env))
    }
}

fn classify_handshake_error(err: &io::Error) -> Error {
    if is_timeout(err) || err.kind() == io::ErrorKind::UnexpectedEof {
        // no usable ClientHello arrived; same bucket as plaintext peers
        return Error::NoTls;
    }
    if is_acceptable_shutdown_error(err) {
        return Error::PeerClosed(io::Error::new(err.kind(), err.to_string()));
    }
    if let Some(inner) = err.get_ref().and_then(|e| e.downcast_ref::<rustls::Error>()) {
        return match inner {
            // garbage where a TLS record was expected
            rustls::Error::InvalidMessage(_) => Error::NoTls,
            other => Error::FatalTls(other.to_string()),
        };
    }
    Error::FatalTls(err.to_string())
}

/// Byte transport over an established rustls session.
pub struct RustlsTransport {
    stream: StreamOwned<ServerConnection, TcpStream>,
    verify_mode: bool,
}

impl std::fmt::Debug for RustlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustlsTransport")
            .field("fd", &self.stream.sock.as_raw_fd())
            .finish()
    }
}

impl RustlsTransport {
    /// Negotiated `(cipher name, protocol name, key bits)`.
    pub fn cipher_info(&self) -> Option<(String, &'static str, u16)> {
        let suite = self.stream.conn.negotiated_cipher_suite()?;
        let name = format!("{:?}", suite.suite());
        let protocol = self
            .stream
            .conn
            .protocol_version()
            .map(|v| protocol_name(u16::from(v)))
            .unwrap_or("UNKNOWN");
        let bits = cipher_key_bits(&name);
        Some((name, protocol, bits))
    }

    /// DER bytes of the peer certificate, when one was presented.
    pub fn peer_cert(&self) -> Option<&[u8]> {
        self.stream
            .conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref())
    }

    /// Whether the adapter was configured to verify client certificates.
    pub fn verify_mode(&self) -> bool {
        self.verify_mode
    }

    /// SNI hostname the client asked for, if any.
    pub fn server_name_indication(&self) -> Option<&str> {
        self.stream.conn.server_name()
    }
}

impl Transport for RustlsTransport {
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.read(buf) {
            Ok(n) => Ok(n),
            // close_notify-less shutdowns are routine; treat as EOF
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.sock.as_raw_fd()
    }

    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.stream.sock.set_read_timeout(dur)
    }

    fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.stream.sock.set_write_timeout(dur)
    }

    /// Shut the kernel socket down, swallowing the errors an already-dead
    /// peer produces and joining the rest into one failure. No close_notify
    /// goes out; the peer sees a plain EOF, which every HTTP client treats
    /// as end of connection.
    fn shutdown(&self) -> io::Result<()> {
        let mut failures: Vec<String> = Vec::new();
        match self.stream.sock.shutdown(std::net::Shutdown::Both) {
            Ok(()) => {}
            Err(err) if is_acceptable_shutdown_error(&err) => {}
            Err(err) => failures.push(err.to_string()),
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::Other, failures.join("; ")))
        }
    }
}

fn read_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path).map_err(|err| {
        Error::FatalTls(format!("cannot read certificate {}: {err}", path.display()))
    })?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<io::Result<Vec<_>>>()
        .map_err(|err| {
            Error::FatalTls(format!("bad certificate {}: {err}", path.display()))
        })?;
    if certs.is_empty() {
        return Err(Error::FatalTls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|err| {
        Error::FatalTls(format!("cannot read private key {}: {err}", path.display()))
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|err| Error::FatalTls(format!("bad private key {}: {err}", path.display())))?
        .ok_or_else(|| {
            Error::FatalTls(format!("no private key found in {}", path.display()))
        })
}

#[cfg(test)]
mod test {
    use std::io;

    use super::classify_handshake_error;
    use crate::errors::Error;

    #[test]
    fn handshake_timeout_maps_to_no_tls() {
        let err = io::Error::new(io::ErrorKind::WouldBlock, "timed out");
        assert!(matches!(classify_handshake_error(&err), Error::NoTls));
        let err = io::Error::new(io::ErrorKind::TimedOut, "timed out");
        assert!(matches!(classify_handshake_error(&err), Error::NoTls));
    }

    #[test]
    fn clean_eof_during_handshake_maps_to_no_tls() {
        let err = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(classify_handshake_error(&err), Error::NoTls));
    }

    #[test]
    fn reset_during_handshake_closes_silently() {
        let err = io::Error::from_raw_os_error(libc::ECONNRESET);
        assert!(matches!(
            classify_handshake_error(&err),
            Error::PeerClosed(_)
        ));
    }

    #[test]
    fn record_layer_garbage_maps_to_no_tls() {
        let inner = rustls::Error::InvalidMessage(rustls::InvalidMessage::InvalidContentType);
        let err = io::Error::new(io::ErrorKind::InvalidData, inner);
        assert!(matches!(classify_handshake_error(&err), Error::NoTls));
    }

    #[test]
    fn other_tls_failures_are_fatal() {
        let inner = rustls::Error::AlertReceived(rustls::AlertDescription::HandshakeFailure);
        let err = io::Error::new(io::ErrorKind::InvalidData, inner);
        assert!(matches!(
            classify_handshake_error(&err),
            Error::FatalTls(_)
        ));
    }
}
