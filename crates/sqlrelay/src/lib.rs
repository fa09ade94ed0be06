// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # sqlrelay — protocol-aware TCP router for MySQL-family wire protocols
//!
//! sqlrelay sits between database clients and a fleet of backend servers.
//! It terminates client connections, selects a destination from a dynamic
//! pool, brokers a bidirectional byte stream, and takes part in the
//! application-layer handshake deeply enough to upgrade or downgrade TLS
//! between the two legs and to detect per-command message boundaries.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                           Route Service                            |
//! |     acceptor + mio reactor, one per configured route               |
//! +--------------------------------------------------------------------+
//! |                       Connection Machines                          |
//! |   classic / X per-connection coroutines over two Channels          |
//! +--------------------------------------------------------------------+
//! |   Connector          |  Destination Provider   |  Containers       |
//! |   resolve + connect  |  round-robin, next-/    |  bucketed map,    |
//! |   with failover      |  first-available, md    |  mass disconnect  |
//! +--------------------------------------------------------------------+
//! |   Channels (plaintext/TLS buffers)  |  Framing codecs (classic, X) |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`service::RoutingService`] | Acceptor + reactor of one route |
//! | [`context::RoutingContext`] | Config, quarantine and gauges shared per route |
//! | [`destination::DestinationProvider`] | Source of the ordered backend list |
//! | [`connector::Connector`] | Destination walk + non-blocking connect |
//! | [`channel::Channel`] | Byte stream with optional TLS layer |
//! | [`connection_container::ConnectionContainer`] | Live-connection registry |
//!
//! ## Modules overview
//!
//! - [`routing`] - strategies, SSL modes, per-route defaults
//! - [`protocol`] - classic and X wire codecs
//! - [`destination`] - providers and routing strategies
//! - [`connection`] - the per-connection state machines
//! - [`service`] - putting a route on the wire
//!
//! The router forwards authentication opaquely: it never validates
//! credentials, never parses SQL, and never rewrites client packets.

pub mod channel;
pub mod connection;
pub mod connection_container;
pub mod connector;
pub mod context;
pub mod destination;
pub mod protocol;
pub mod routing;
pub mod service;
pub mod tls;

use std::fmt;
use std::io;

use connector::ConnectError;

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by the router's public API.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Configuration errors
    // ========================================================================
    /// Invalid route configuration (bad timeout, destination list, ...).
    Config(String),

    // ========================================================================
    // Transport errors
    // ========================================================================
    /// Socket-level failure (bind, register, ...).
    Io(io::Error),

    /// Connecting to the backend fleet failed.
    Connect(ConnectError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "configuration error: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Connect(e) => write!(f, "connect error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Config(_) => None,
            Error::Io(e) => Some(e),
            Error::Connect(e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<ConnectError> for Error {
    fn from(e: ConnectError) -> Self {
        Error::Connect(e)
    }
}

/// Convenient alias for API results using the public [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Re-exports
// ============================================================================

pub use channel::Channel;
pub use connection_container::ConnectionContainer;
pub use connector::Connector;
pub use context::{RoutingConfig, RoutingContext};
pub use destination::{DestinationProvider, TcpAddress};
pub use protocol::Protocol;
pub use routing::{RoutingStrategy, SslMode};
pub use service::RoutingService;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::Config("destination_connect_timeout must be larger than 0ms".to_string());
        assert!(e.to_string().contains("configuration error"));

        let e = Error::Io(io::Error::new(io::ErrorKind::AddrInUse, "in use"));
        assert!(e.to_string().contains("I/O error"));

        let e = Error::from(ConnectError::NoDestinations);
        assert!(e.to_string().contains("no connectable destinations"));
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error as _;

        let e = Error::Io(io::Error::new(io::ErrorKind::AddrInUse, "in use"));
        assert!(e.source().is_some());

        let e = Error::Config("bad".to_string());
        assert!(e.source().is_none());
    }
}
