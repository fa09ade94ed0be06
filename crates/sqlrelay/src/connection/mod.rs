// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-connection plumbing shared by both protocol machines.
//!
//! A connection is a single-threaded cooperative state machine owned by its
//! route's reactor. Each step performs one piece of non-blocking I/O and
//! either finishes, or suspends on one of the I/O wants below until the
//! reactor resumes it. Cross-thread visibility is confined to the
//! [`ConnectionHandle`]: the container and supervisor use it to request a
//! disconnect and to read addresses and transfer stats; the machine itself
//! is never touched from outside the reactor.

pub mod classic;
pub mod xproto;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connector::ConnectError;
use crate::context::RoutingContext;
use crate::destination::{DestinationProvider, TcpAddress};

// ============================================================================
// Identity
// ============================================================================

/// Opaque identity of one connection, unique within a route.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ============================================================================
// I/O wants
// ============================================================================

/// What a suspended state machine is waiting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoWant {
    /// Client socket readable.
    RecvClient,

    /// Client socket writable (send buffer pending).
    SendClient,

    /// Server socket readable.
    RecvServer,

    /// Server socket writable (send buffer pending).
    SendServer,

    /// Server connect in progress: writable or the destination connect
    /// timeout, whichever first.
    Connect,

    /// Either socket readable (opaque relay phase).
    RecvEither,
}

/// Outcome of resuming a connection on the reactor.
#[derive(Debug)]
pub enum RunResult {
    /// Park the connection until the want is satisfied.
    Suspend(IoWant),

    /// Terminal state reached; remove and drop the connection.
    Done,
}

// ============================================================================
// Handle
// ============================================================================

/// Byte counters of one connection, updated by the machine, read by the
/// supervisor.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Client-to-server bytes.
    bytes_up: AtomicU64,

    /// Server-to-client bytes.
    bytes_down: AtomicU64,
}

impl ConnectionStats {
    pub fn add_up(&self, n: u64) {
        self.bytes_up.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_down(&self, n: u64) {
        self.bytes_down.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }
}

/// Shared view of a connection, held by the container while the machine
/// itself lives on the reactor.
pub struct ConnectionHandle {
    id: ConnectionId,

    /// `ip:port` of the client, for logging and error messages.
    client_address: String,

    /// Address of the selected server, once connected.
    server_address: Mutex<Option<TcpAddress>>,

    /// Set by `disconnect()`; observed by the machine at its next resume.
    disconnect: AtomicBool,

    /// Wakes the owning reactor so a disconnect is observed promptly.
    waker: Option<Arc<mio::Waker>>,

    stats: ConnectionStats,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, client_addr: &SocketAddr, waker: Option<Arc<mio::Waker>>) -> Self {
        Self {
            id,
            client_address: client_addr.to_string(),
            server_address: Mutex::new(None),
            disconnect: AtomicBool::new(false),
            waker,
            stats: ConnectionStats::default(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn client_address(&self) -> &str {
        &self.client_address
    }

    pub fn server_address(&self) -> Option<TcpAddress> {
        self.server_address.lock().clone()
    }

    pub fn set_server_address(&self, addr: TcpAddress) {
        *self.server_address.lock() = Some(addr);
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Request the connection to tear down.
    ///
    /// Idempotent and non-blocking: sets the flag and wakes the reactor,
    /// which fails the connection's pending I/O at the next poll round.
    pub fn disconnect(&self) {
        if !self.disconnect.swap(true, Ordering::SeqCst) {
            if let Some(waker) = &self.waker {
                let _ = waker.wake();
            }
        }
    }

    pub fn disconnect_requested(&self) -> bool {
        self.disconnect.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("client", &self.client_address)
            .field("server", &*self.server_address.lock())
            .field("disconnect", &self.disconnect_requested())
            .finish()
    }
}

// ============================================================================
// Connect failure dispositions
// ============================================================================

/// Route-level reactions to a terminal connect failure.
///
/// No-destinations pauses the route's acceptor through the provider's
/// callback slot; descriptor exhaustion asks the hosting process to release
/// pooled descriptors (and the connector does not retry in a tight loop).
pub(crate) fn react_to_connect_error(
    context: &RoutingContext,
    provider: &dyn DestinationProvider,
    err: &ConnectError,
) {
    match err {
        ConnectError::NoDestinations => {
            log::warn!(
                "[{}] no destinations available, stopping socket acceptors",
                context.name()
            );
            provider.notifier().stop_acceptor();
        }
        ConnectError::ResourceExhaustion(e) => {
            log::error!("[{}] out of file descriptors: {}", context.name(), e);
            context.notify_fd_exhaustion();
        }
        ConnectError::Exhausted(_) => {}
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RoutingConfig;
    use crate::destination::FirstAvailableDestinations;
    use std::io;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_handle_addresses() {
        let addr: SocketAddr = "10.0.0.9:31337".parse().unwrap();
        let handle = ConnectionHandle::new(ConnectionId(7), &addr, None);

        assert_eq!(handle.id(), ConnectionId(7));
        assert_eq!(handle.client_address(), "10.0.0.9:31337");
        assert!(handle.server_address().is_none());

        handle.set_server_address(TcpAddress::new("db1", 3306));
        assert_eq!(handle.server_address(), Some(TcpAddress::new("db1", 3306)));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let addr: SocketAddr = "10.0.0.9:31337".parse().unwrap();
        let handle = ConnectionHandle::new(ConnectionId(1), &addr, None);

        assert!(!handle.disconnect_requested());
        handle.disconnect();
        handle.disconnect();
        assert!(handle.disconnect_requested());
    }

    #[test]
    fn test_stats_counters() {
        let addr: SocketAddr = "10.0.0.9:1".parse().unwrap();
        let handle = ConnectionHandle::new(ConnectionId(1), &addr, None);

        handle.stats().add_up(100);
        handle.stats().add_up(20);
        handle.stats().add_down(7);

        assert_eq!(handle.stats().bytes_up(), 120);
        assert_eq!(handle.stats().bytes_down(), 7);
    }

    #[test]
    fn test_no_destinations_pauses_acceptor() {
        let context = RoutingContext::new(RoutingConfig::default());
        let provider = FirstAvailableDestinations::new();

        let stops = Arc::new(AtomicUsize::new(0));
        let s = stops.clone();
        provider
            .notifier()
            .register_stop_acceptor(Box::new(move || {
                s.fetch_add(1, Ordering::SeqCst);
            }));

        react_to_connect_error(&context, &provider, &ConnectError::NoDestinations);
        assert_eq!(stops.load(Ordering::SeqCst), 1);

        // plain exhaustion does not pause the acceptor
        react_to_connect_error(
            &context,
            &provider,
            &ConnectError::Exhausted(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "refused",
            )),
        );
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fd_exhaustion_notifies_hook() {
        let context = RoutingContext::new(RoutingConfig::default());

        let releases = Arc::new(AtomicUsize::new(0));
        let r = releases.clone();
        context.register_fd_exhaustion_hook(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));

        let provider = FirstAvailableDestinations::new();
        react_to_connect_error(
            &context,
            &provider,
            &ConnectError::ResourceExhaustion(io::Error::from_raw_os_error(libc::EMFILE)),
        );

        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }
}
