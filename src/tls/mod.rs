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

//! TLS adapter contract and the TLS-derived request environment.
//!
//! An adapter turns an accepted TCP socket into a byte transport plus a
//! string-keyed environment merged into each request served on the
//! connection. The environment variable names follow mod_ssl
//! (`SSL_PROTOCOL`, `SSL_CLIENT_S_DN_CN`, ...) so gateways built against
//! that convention keep working.

use std::collections::BTreeMap;
use std::net::TcpStream;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use x509_parser::prelude::{FromDer, GeneralName, ParsedExtension, X509Certificate, X509Name};

use crate::errors::Error;
use crate::stream::Transport;

pub mod builtin;

pub use builtin::RustlsAdapter;

/// String-keyed environment derived from a TLS session.
pub type TlsEnviron = BTreeMap<String, String>;

/// Why a socket could not be wrapped with TLS.
#[derive(Debug)]
pub enum WrapFailure {
    /// The peer spoke plaintext HTTP. The raw socket is handed back so the
    /// caller can answer with a plain-HTTP `400` before closing.
    NoTls(TcpStream),
    /// The handshake failed and the connection is already dead.
    Fatal(Error),
}

/// Server-side TLS integration.
///
/// `wrap` performs the plaintext probe and the handshake; on success it
/// returns the encrypted byte transport and the session environment. A
/// plaintext peer surfaces as [`WrapFailure::NoTls`] with the raw socket
/// intact; everything else is [`WrapFailure::Fatal`] and closes silently.
pub trait TlsAdapter: Send + Sync {
    /// Handshake over an accepted socket.
    fn wrap(
        &self,
        sock: TcpStream,
    ) -> std::result::Result<(Box<dyn Transport>, TlsEnviron), WrapFailure>;
}

/// Bytes peeked before the handshake to spot a client speaking plaintext
/// HTTP on a TLS port.
pub(crate) const PLAINTEXT_PEEK_BYTES: usize = 16;

const HTTP_METHODS: &[&[u8]] = &[
    b"GET ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"HEAD ",
    b"OPTIONS ",
    b"PATCH ",
    b"CONNECT ",
    b"TRACE ",
];

/// True if the peeked bytes open like an HTTP request line.
pub(crate) fn looks_like_plain_http(peeked: &[u8]) -> bool {
    HTTP_METHODS.iter().any(|method| peeked.starts_with(method))
}

/// Map a TLS protocol version number to its display name.
pub fn protocol_name(version: u16) -> &'static str {
    match version {
        769 => "TLSv1",
        770 => "TLSv1.1",
        771 | 772 => "TLSv1.2",
        773 => "TLSv1.3",
        _ => "UNKNOWN",
    }
}

/// Rough symmetric key size of a cipher suite, derived from its name.
pub(crate) fn cipher_key_bits(suite_name: &str) -> u16 {
    if suite_name.contains("256") || suite_name.contains("CHACHA20") {
        256
    } else if suite_name.contains("128") {
        128
    } else {
        0
    }
}

// mod_ssl's ssl_engine_vars.c attribute codes, keyed by dotted OID.
fn ldap_code(oid: &str) -> Option<&'static str> {
    Some(match oid {
        "2.5.4.3" => "CN",
        "2.5.4.6" => "C",
        "2.5.4.8" => "ST",
        "2.5.4.7" => "L",
        "2.5.4.10" => "O",
        "2.5.4.11" => "OU",
        "2.5.4.12" => "T",
        "2.5.4.43" => "I",
        "2.5.4.42" => "G",
        "2.5.4.4" => "S",
        "2.5.4.13" => "D",
        "0.9.2342.19200300.100.1.1" => "UID",
        "1.2.840.113549.1.9.1" => "Email",
        _ => return None,
    })
}

/// Render a distinguished name into environment variables.
///
/// `env[prefix]` holds the whole DN as `/k1=v1/k2=v2`; each attribute code
/// also gets `prefix_CODE`, with indexed variants when a code repeats.
/// Attribute types without an LDAP code keep their textual OID.
pub(crate) fn dn_environ(prefix: &str, attrs: &[(String, String)], env: &mut TlsEnviron) {
    if attrs.is_empty() {
        return;
    }
    let mut dn = String::new();
    let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
    for (code, value) in attrs {
        dn.push('/');
        dn.push_str(code);
        dn.push('=');
        dn.push_str(value);
        if ldap_code_known(code) {
            match grouped.iter_mut().find(|(c, _)| c == code) {
                Some((_, values)) => values.push(value.clone()),
                None => grouped.push((code.clone(), vec![value.clone()])),
            }
        }
    }
    env.insert(prefix.to_string(), dn);
    for (code, values) in grouped {
        env.insert(format!("{prefix}_{code}"), values.join(","));
        if values.len() > 1 {
            for (i, value) in values.iter().enumerate() {
                env.insert(format!("{prefix}_{code}_{i}"), value.clone());
            }
        }
    }
}

fn ldap_code_known(code: &str) -> bool {
    !code.contains('.')
}

fn name_attributes(name: &X509Name<'_>) -> Vec<(String, String)> {
    name.iter_attributes()
        .map(|attr| {
            let oid = attr.attr_type().to_id_string();
            let code = ldap_code(&oid).map_or(oid, str::to_string);
            let value = attr.as_str().map_or_else(|_| String::new(), str::to_string);
            (code, value)
        })
        .collect()
}

/// `SSL_*_SAN_DNS_n` / `SSL_*_SAN_Email_n` variables for a certificate.
fn san_environ(prefix: &str, cert: &X509Certificate<'_>, env: &mut TlsEnviron) {
    let mut dns_count = 0;
    let mut email_count = 0;
    for ext in cert.extensions() {
        let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() else {
            continue;
        };
        for general_name in &san.general_names {
            match general_name {
                GeneralName::DNSName(value) => {
                    env.insert(format!("{prefix}_SAN_DNS_{dns_count}"), (*value).to_string());
                    dns_count += 1;
                }
                GeneralName::RFC822Name(value) => {
                    env.insert(
                        format!("{prefix}_SAN_Email_{email_count}"),
                        (*value).to_string(),
                    );
                    email_count += 1;
                }
                _ => {}
            }
        }
    }
}

/// Fill `SSL_<prefix>_*` variables (subject/issuer DN, SAN, version,
/// serial) from a DER-encoded certificate. Unparseable certificates
/// contribute nothing.
pub(crate) fn cert_environ(prefix: &str, der: &[u8], env: &mut TlsEnviron) {
    let Ok((_, cert)) = X509Certificate::from_der(der) else {
        return;
    };
    dn_environ(
        &format!("{prefix}_S_DN"),
        &name_attributes(cert.subject()),
        env,
    );
    dn_environ(
        &format!("{prefix}_I_DN"),
        &name_attributes(cert.issuer()),
        env,
    );
    san_environ(prefix, &cert, env);
    env.insert(
        format!("{prefix}_M_VERSION"),
        cert.version().0.to_string(),
    );
    env.insert(
        format!("{prefix}_M_SERIAL"),
        cert.tbs_certificate.serial.to_string(),
    );
}

/// PEM-encode a DER certificate, 64 columns per line.
pub(crate) fn der_to_pem(der: &[u8]) -> String {
    let encoded = BASE64.encode(der);
    let mut pem = String::with_capacity(encoded.len() + 64);
    pem.push_str("-----BEGIN CERTIFICATE-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        pem.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}
