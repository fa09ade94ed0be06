// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Destinations and destination providers.
//!
//! A *destination* is one logical backend (hostname, port, id) yielded by a
//! provider in preference order. The connector walks the list, resolves each
//! destination to endpoints, and reports connect outcomes back through
//! [`Destination::connect_status`]; strategies use that feedback to shape the
//! next fetch.
//!
//! Providers also carry a [`DestinationNodesStateNotifier`]: callback slots
//! through which an external supervisor (metadata cache, REST API, ...)
//! learns about allowed-node changes and through which the provider can
//! pause and resume the route's acceptor.

mod first_available;
mod next_available;
mod round_robin;

pub use first_available::FirstAvailableDestinations;
pub use next_available::NextAvailableDestinations;
pub use round_robin::RoundRobinDestinations;

use std::fmt;
use std::io;

use parking_lot::Mutex;

use crate::routing::RoutingStrategy;

// ============================================================================
// Addresses
// ============================================================================

/// A hostname (or IP literal) with a TCP port.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TcpAddress {
    pub address: String,
    pub port: u16,
}

impl TcpAddress {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Parse `host`, `host:port` or `[v6addr]:port`; `default_port` fills
    /// in when none is given.
    pub fn parse(s: &str, default_port: u16) -> io::Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty address",
            ));
        }

        // bracketed IPv6 literal
        if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("invalid address: {s}"))
            })?;

            let port = match after.strip_prefix(':') {
                Some(p) => p.parse::<u16>().map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, format!("invalid port in: {s}"))
                })?,
                None if after.is_empty() => default_port,
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("invalid address: {s}"),
                    ));
                }
            };

            return Ok(Self::new(host, port));
        }

        // unbracketed v6 (multiple colons): treat the whole string as host
        if s.matches(':').count() > 1 {
            return Ok(Self::new(s, default_port));
        }

        match s.split_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse::<u16>().map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, format!("invalid port in: {s}"))
                })?;
                Ok(Self::new(host, port))
            }
            Some(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid address: {s}"),
            )),
            None => Ok(Self::new(s, default_port)),
        }
    }
}

impl fmt::Display for TcpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

/// The set of backends a route is allowed to use.
pub type AllowedNodes = Vec<TcpAddress>;

// ============================================================================
// Destinations
// ============================================================================

/// One logical backend, valid for a single connector iteration.
pub trait Destination: Send + Sync {
    /// Identifier, usually `hostname:port`.
    fn id(&self) -> &str;

    fn hostname(&self) -> &str;

    fn port(&self) -> u16;

    /// False once the owning strategy has invalidated this destination.
    fn good(&self) -> bool {
        true
    }

    /// Feedback sink for the connector's per-destination outcome.
    fn connect_status(&self, _ec: io::ErrorKind) {}
}

/// Destinations in preference order, as one provider fetch returned them.
pub type Destinations = Vec<Box<dyn Destination>>;

/// Plain value destination without strategy feedback.
#[derive(Clone, Debug)]
pub struct AddressDestination {
    id: String,
    hostname: String,
    port: u16,
}

impl AddressDestination {
    pub fn new(addr: &TcpAddress) -> Self {
        Self {
            id: addr.to_string(),
            hostname: addr.address.clone(),
            port: addr.port,
        }
    }
}

impl Destination for AddressDestination {
    fn id(&self) -> &str {
        &self.id
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn port(&self) -> u16 {
        self.port
    }
}

// ============================================================================
// State notifier
// ============================================================================

/// Notification when the allowed-nodes set changed: the new full set, the
/// subset usable for new connections, whether existing connections to
/// removed nodes should be dropped, and a human-readable reason.
pub type AllowedNodesChangedCallback =
    Box<dyn Fn(&AllowedNodes, &AllowedNodes, bool, &str) + Send + Sync>;

/// Ask the route to start accepting connections again.
pub type StartAcceptorCallback = Box<dyn Fn() -> io::Result<()> + Send + Sync>;

/// Ask the route to stop accepting connections.
pub type StopAcceptorCallback = Box<dyn Fn() + Send + Sync>;

/// Metadata was refreshed: whether the instance set changed, and the new set.
pub type MetadataRefreshCallback = Box<dyn Fn(bool, &AllowedNodes) + Send + Sync>;

/// Is this destination currently quarantined?
pub type QueryQuarantinedCallback = Box<dyn Fn(&TcpAddress) -> bool + Send + Sync>;

/// Handle for unregistering an allowed-nodes callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallbackHandle(u64);

/// Registry of the callback slots a provider exposes.
///
/// Allowed-nodes changes support multiple subscribers; the acceptor control,
/// metadata-refresh and quarantine-query slots are single-subscriber.
#[derive(Default)]
pub struct DestinationNodesStateNotifier {
    allowed_nodes_change: Mutex<AllowedNodesCallbacks>,
    start_acceptor: Mutex<Option<StartAcceptorCallback>>,
    stop_acceptor: Mutex<Option<StopAcceptorCallback>>,
    md_refresh: Mutex<Option<MetadataRefreshCallback>>,
    query_quarantined: Mutex<Option<QueryQuarantinedCallback>>,
}

#[derive(Default)]
struct AllowedNodesCallbacks {
    next_id: u64,
    entries: Vec<(u64, AllowedNodesChangedCallback)>,
}

impl DestinationNodesStateNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Registration
    // ========================================================================

    pub fn register_allowed_nodes_change_callback(
        &self,
        callback: AllowedNodesChangedCallback,
    ) -> CallbackHandle {
        let mut callbacks = self.allowed_nodes_change.lock();
        let id = callbacks.next_id;
        callbacks.next_id += 1;
        callbacks.entries.push((id, callback));
        CallbackHandle(id)
    }

    pub fn unregister_allowed_nodes_change_callback(&self, handle: CallbackHandle) {
        let mut callbacks = self.allowed_nodes_change.lock();
        callbacks.entries.retain(|(id, _)| *id != handle.0);
    }

    pub fn register_start_acceptor(&self, callback: StartAcceptorCallback) {
        *self.start_acceptor.lock() = Some(callback);
    }

    pub fn unregister_start_acceptor(&self) {
        *self.start_acceptor.lock() = None;
    }

    pub fn register_stop_acceptor(&self, callback: StopAcceptorCallback) {
        *self.stop_acceptor.lock() = Some(callback);
    }

    pub fn unregister_stop_acceptor(&self) {
        *self.stop_acceptor.lock() = None;
    }

    pub fn register_md_refresh_callback(&self, callback: MetadataRefreshCallback) {
        *self.md_refresh.lock() = Some(callback);
    }

    pub fn unregister_md_refresh_callback(&self) {
        *self.md_refresh.lock() = None;
    }

    pub fn register_query_quarantined(&self, callback: QueryQuarantinedCallback) {
        *self.query_quarantined.lock() = Some(callback);
    }

    pub fn unregister_query_quarantined(&self) {
        *self.query_quarantined.lock() = None;
    }

    // ========================================================================
    // Invocation
    // ========================================================================

    pub fn notify_allowed_nodes_changed(
        &self,
        new_allowed: &AllowedNodes,
        for_new_connections: &AllowedNodes,
        disconnect_existing: bool,
        reason: &str,
    ) {
        let callbacks = self.allowed_nodes_change.lock();
        for (_, callback) in &callbacks.entries {
            callback(new_allowed, for_new_connections, disconnect_existing, reason);
        }
    }

    /// Invoke the start-acceptor slot; Ok when no subscriber is present.
    pub fn start_acceptor(&self) -> io::Result<()> {
        match &*self.start_acceptor.lock() {
            Some(callback) => callback(),
            None => Ok(()),
        }
    }

    /// Invoke the stop-acceptor slot.
    pub fn stop_acceptor(&self) {
        if let Some(callback) = &*self.stop_acceptor.lock() {
            callback();
        }
    }

    pub fn notify_md_refresh(&self, changed: bool, new_allowed: &AllowedNodes) {
        if let Some(callback) = &*self.md_refresh.lock() {
            callback(changed, new_allowed);
        }
    }

    /// Query the quarantine slot; false when no subscriber is present.
    pub fn is_quarantined(&self, addr: &TcpAddress) -> bool {
        match &*self.query_quarantined.lock() {
            Some(callback) => callback(addr),
            None => false,
        }
    }
}

// ============================================================================
// Provider
// ============================================================================

/// Source of the ordered destination list for a route.
pub trait DestinationProvider: Send + Sync {
    /// The strategy this provider implements.
    fn strategy(&self) -> RoutingStrategy;

    /// Destinations to connect to, in order of preference.
    fn destinations(&self) -> Destinations;

    /// Refresh after connecting to all destinations failed. `None` means
    /// there is nothing new to try.
    fn refresh_destinations(&self, _prev: &Destinations) -> Option<Destinations> {
        None
    }

    /// Current address list, unordered by strategy.
    fn addresses(&self) -> Vec<TcpAddress>;

    /// Whether the provider has any destinations at all.
    fn is_empty(&self) -> bool {
        self.addresses().is_empty()
    }

    /// The provider's callback registry.
    fn notifier(&self) -> &DestinationNodesStateNotifier;
}

/// Shared backing list for the static strategies.
#[derive(Default)]
pub(crate) struct StaticAddressList {
    addrs: Mutex<Vec<TcpAddress>>,
}

impl StaticAddressList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a destination; duplicates are ignored.
    pub(crate) fn add(&self, addr: TcpAddress) {
        let mut addrs = self.addrs.lock();
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }

    pub(crate) fn remove(&self, addr: &TcpAddress) {
        self.addrs.lock().retain(|a| a != addr);
    }

    pub(crate) fn clear(&self) {
        self.addrs.lock().clear();
    }

    pub(crate) fn snapshot(&self) -> Vec<TcpAddress> {
        self.addrs.lock().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.addrs.lock().len()
    }
}

// ============================================================================
// Tests
// ============================================================================
