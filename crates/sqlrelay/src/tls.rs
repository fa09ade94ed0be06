// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TLS support for routed connections.
//!
//! This module wraps rustls behind the small surface the rest of the router
//! needs: a [`TlsSession`] that unifies client and server connections, a
//! [`TlsConfig`] builder that loads PEM material, and the TLS record-layer
//! constants used by passthrough routing.
//!
//! The router terminates TLS on either leg of a connection depending on the
//! route's SSL modes; in passthrough mode no session is created at all and
//! records are only delimited, never decrypted.

use std::fmt;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, ServerConfig, ServerConnection};

use crate::routing::DEFAULT_SSL_SESSION_CACHE_SIZE;

// ============================================================================
// Record layer
// ============================================================================

/// TLS record header size: type, legacy version, length.
pub const TLS_RECORD_HEADER_SIZE: usize = 5;

/// Alert level `fatal` as it appears in the first alert body byte pair.
pub const TLS_ALERT_LEVEL_FATAL: u8 = 0x02;

/// TLS record content types seen on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsContentType {
    ChangeCipherSpec = 0x14,
    Alert = 0x15,
    Handshake = 0x16,
    ApplicationData = 0x17,
    Heartbeat = 0x18,
}

impl TlsContentType {
    pub fn from_byte(v: u8) -> Option<Self> {
        match v {
            0x14 => Some(TlsContentType::ChangeCipherSpec),
            0x15 => Some(TlsContentType::Alert),
            0x16 => Some(TlsContentType::Handshake),
            0x17 => Some(TlsContentType::ApplicationData),
            0x18 => Some(TlsContentType::Heartbeat),
            _ => None,
        }
    }
}

impl fmt::Display for TlsContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TlsContentType::ChangeCipherSpec => "change-cipher-spec",
            TlsContentType::Alert => "alert",
            TlsContentType::Handshake => "handshake",
            TlsContentType::ApplicationData => "application",
            TlsContentType::Heartbeat => "heartbeat",
        };
        write!(f, "{}", s)
    }
}

/// A parsed TLS record header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlsRecordHeader {
    pub content_type: u8,
    pub version: u16,
    pub payload_len: u16,
}

/// Parse a record header from the front of `buf` without consuming.
///
/// Returns `None` if fewer than [`TLS_RECORD_HEADER_SIZE`] bytes are
/// available.
pub fn peek_record_header(buf: &[u8]) -> Option<TlsRecordHeader> {
    if buf.len() < TLS_RECORD_HEADER_SIZE {
        return None;
    }

    Some(TlsRecordHeader {
        content_type: buf[0],
        version: u16::from_be_bytes([buf[1], buf[2]]),
        payload_len: u16::from_be_bytes([buf[3], buf[4]]),
    })
}

// ============================================================================
// Session
// ============================================================================

/// Outcome of driving the TLS handshake state machine one step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsResult {
    /// Handshake complete, application data may flow.
    Finished,

    /// More bytes from the peer are needed.
    WantRead,

    /// Handshake bytes are queued and must reach the peer first.
    WantWrite,
}

/// One TLS session, client- or server-side.
///
/// Unifies `rustls::ClientConnection` and `rustls::ServerConnection` so the
/// [`Channel`](crate::channel::Channel) can stay agnostic of which leg of
/// the route it encrypts.
pub enum TlsSession {
    Client(Box<ClientConnection>),
    Server(Box<ServerConnection>),
}

impl TlsSession {
    /// Create a server-side session (accepting a client handshake).
    pub fn accept(config: Arc<ServerConfig>) -> io::Result<Self> {
        ServerConnection::new(config)
            .map(|conn| TlsSession::Server(Box::new(conn)))
            .map_err(|e| io::Error::other(format!("TLS accept setup failed: {}", e)))
    }

    /// Create a client-side session towards `server_name`.
    pub fn connect(config: Arc<ClientConfig>, server_name: &str) -> io::Result<Self> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| io::Error::other(format!("invalid TLS server name: {}", e)))?;

        ClientConnection::new(config, name)
            .map(|conn| TlsSession::Client(Box::new(conn)))
            .map_err(|e| io::Error::other(format!("TLS connect setup failed: {}", e)))
    }

    pub fn is_handshaking(&self) -> bool {
        match self {
            TlsSession::Client(conn) => conn.is_handshaking(),
            TlsSession::Server(conn) => conn.is_handshaking(),
        }
    }

    pub fn wants_read(&self) -> bool {
        match self {
            TlsSession::Client(conn) => conn.wants_read(),
            TlsSession::Server(conn) => conn.wants_read(),
        }
    }

    pub fn wants_write(&self) -> bool {
        match self {
            TlsSession::Client(conn) => conn.wants_write(),
            TlsSession::Server(conn) => conn.wants_write(),
        }
    }

    /// Feed ciphertext from the socket into the session.
    pub fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
        match self {
            TlsSession::Client(conn) => conn.read_tls(rd),
            TlsSession::Server(conn) => conn.read_tls(rd),
        }
    }

    /// Drain ciphertext produced by the session towards the socket.
    pub fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
        match self {
            TlsSession::Client(conn) => conn.write_tls(wr),
            TlsSession::Server(conn) => conn.write_tls(wr),
        }
    }

    /// Process buffered ciphertext; advances the handshake and makes
    /// decrypted plaintext readable.
    pub fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            TlsSession::Client(conn) => conn.process_new_packets(),
            TlsSession::Server(conn) => conn.process_new_packets(),
        }
    }

    /// Read decrypted plaintext out of the session.
    pub fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            TlsSession::Client(conn) => conn.reader().read(buf),
            TlsSession::Server(conn) => conn.reader().read(buf),
        }
    }

    /// Queue plaintext for encryption.
    pub fn write_plaintext(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TlsSession::Client(conn) => conn.writer().write(buf),
            TlsSession::Server(conn) => conn.writer().write(buf),
        }
    }

    /// Queue the close-notify alert.
    pub fn send_close_notify(&mut self) {
        match self {
            TlsSession::Client(conn) => conn.send_close_notify(),
            TlsSession::Server(conn) => conn.send_close_notify(),
        }
    }
}

impl fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsSession::Client(_) => write!(f, "TlsSession::Client"),
            TlsSession::Server(_) => write!(f, "TlsSession::Server"),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// TLS configuration of one route.
///
/// `server` covers the client-facing leg (the router accepts handshakes),
/// `client` the server-facing leg (the router initiates handshakes). Either
/// may be absent when the corresponding SSL mode never needs it.
#[derive(Clone, Default)]
pub struct TlsConfig {
    pub(crate) server: Option<Arc<ServerConfig>>,
    pub(crate) client: Option<Arc<ClientConfig>>,
}

impl TlsConfig {
    pub fn server_config(&self) -> Option<Arc<ServerConfig>> {
        self.server.clone()
    }

    pub fn client_config(&self) -> Option<Arc<ClientConfig>> {
        self.client.clone()
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("server", &self.server.is_some())
            .field("client", &self.client.is_some())
            .finish()
    }
}

/// Builder for [`TlsConfig`].
pub struct TlsConfigBuilder {
    cert_chain_pem: Option<Vec<u8>>,
    private_key_pem: Option<Vec<u8>>,
    root_certs_pem: Vec<Vec<u8>>,
    verify_peer: bool,
    session_cache: bool,
}

impl TlsConfigBuilder {
    pub fn new() -> Self {
        Self {
            cert_chain_pem: None,
            private_key_pem: None,
            root_certs_pem: Vec::new(),
            verify_peer: true,
            session_cache: true,
        }
    }

    /// Certificate chain (PEM) presented on the client-facing leg.
    pub fn with_cert_pem(mut self, pem: Vec<u8>) -> Self {
        self.cert_chain_pem = Some(pem);
        self
    }

    /// Load the certificate chain from a file.
    pub fn with_cert_file(self, path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(self.with_cert_pem(std::fs::read(path)?))
    }

    /// Private key (PEM) for the certificate chain.
    pub fn with_key_pem(mut self, pem: Vec<u8>) -> Self {
        self.private_key_pem = Some(pem);
        self
    }

    /// Load the private key from a file.
    pub fn with_key_file(self, path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(self.with_key_pem(std::fs::read(path)?))
    }

    /// Add a root certificate (PEM) trusted for the server-facing leg.
    pub fn with_root_cert_pem(mut self, pem: Vec<u8>) -> Self {
        self.root_certs_pem.push(pem);
        self
    }

    /// Load root certificates from a file.
    pub fn with_root_certs_file(self, path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(self.with_root_cert_pem(std::fs::read(path)?))
    }

    /// Disable server-certificate verification on the server-facing leg
    /// (maps the route's `server_ssl_verify = DISABLED`).
    pub fn dangerous_disable_verify(mut self) -> Self {
        self.verify_peer = false;
        self
    }

    /// Toggle the server-side TLS session cache.
    pub fn with_session_cache(mut self, enabled: bool) -> Self {
        self.session_cache = enabled;
        self
    }

    pub fn build(self) -> io::Result<TlsConfig> {
        let server = match (&self.cert_chain_pem, &self.private_key_pem) {
            (Some(cert_pem), Some(key_pem)) => {
                let certs = parse_certs(cert_pem)?;
                let key = parse_key(key_pem)?;

                let mut config = ServerConfig::builder()
                    .with_no_client_auth()
                    .with_single_cert(certs, key)
                    .map_err(|e| io::Error::other(format!("TLS server config: {}", e)))?;

                if self.session_cache {
                    config.session_storage = rustls::server::ServerSessionMemoryCache::new(
                        DEFAULT_SSL_SESSION_CACHE_SIZE as usize,
                    );
                }

                Some(Arc::new(config))
            }
            (None, None) => None,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "TLS certificate and key must both be set",
                ));
            }
        };

        let client = {
            let builder = ClientConfig::builder();

            let config = if self.verify_peer {
                let mut roots = rustls::RootCertStore::empty();
                for pem in &self.root_certs_pem {
                    for cert in parse_certs(pem)? {
                        roots
                            .add(cert)
                            .map_err(|e| io::Error::other(format!("bad root cert: {}", e)))?;
                    }
                }

                builder
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            } else {
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerifier::new()))
                    .with_no_client_auth()
            };

            Some(Arc::new(config))
        };

        Ok(TlsConfig { server, client })
    }
}

impl Default for TlsConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_certs(pem: &[u8]) -> io::Result<Vec<CertificateDer<'static>>> {
    let mut rd = io::BufReader::new(pem);
    rustls_pemfile::certs(&mut rd).collect()
}

fn parse_key(pem: &[u8]) -> io::Result<PrivateKeyDer<'static>> {
    let mut rd = io::BufReader::new(pem);
    rustls_pemfile::private_key(&mut rd)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no private key in PEM"))
}

/// Certificate verifier that accepts everything. Only reachable through
/// [`TlsConfigBuilder::dangerous_disable_verify`].
#[derive(Debug)]
struct NoVerifier {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl NoVerifier {
    fn new() -> Self {
        Self {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_from_byte() {
        assert_eq!(
            TlsContentType::from_byte(0x14),
            Some(TlsContentType::ChangeCipherSpec)
        );
        assert_eq!(TlsContentType::from_byte(0x15), Some(TlsContentType::Alert));
        assert_eq!(
            TlsContentType::from_byte(0x16),
            Some(TlsContentType::Handshake)
        );
        assert_eq!(
            TlsContentType::from_byte(0x17),
            Some(TlsContentType::ApplicationData)
        );
        assert_eq!(
            TlsContentType::from_byte(0x18),
            Some(TlsContentType::Heartbeat)
        );
        assert_eq!(TlsContentType::from_byte(0x00), None);
    }

    #[test]
    fn test_content_type_display() {
        assert_eq!(TlsContentType::Alert.to_string(), "alert");
        assert_eq!(TlsContentType::ApplicationData.to_string(), "application");
    }

    #[test]
    fn test_peek_record_header() {
        // handshake record, TLS 1.2, 3-byte body
        let buf = [0x16, 0x03, 0x03, 0x00, 0x03, 0xaa, 0xbb, 0xcc];

        let hdr = peek_record_header(&buf).unwrap();
        assert_eq!(hdr.content_type, 0x16);
        assert_eq!(hdr.version, 0x0303);
        assert_eq!(hdr.payload_len, 3);

        // too short
        assert!(peek_record_header(&buf[..4]).is_none());
    }

    #[test]
    fn test_builder_requires_cert_and_key_together() {
        let res = TlsConfigBuilder::new()
            .with_cert_pem(b"-----BEGIN CERTIFICATE-----".to_vec())
            .build();
        assert!(res.is_err());
    }

    #[test]
    fn test_builder_client_only() {
        let config = TlsConfigBuilder::new().build().unwrap();
        assert!(config.server_config().is_none());
        assert!(config.client_config().is_some());
    }
}
