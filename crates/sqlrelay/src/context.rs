// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared per-route context.
//!
//! One [`RoutingContext`] exists per route and is shared by every
//! connection on it. It carries the route configuration, the per-client-IP
//! handshake-error counters used for quarantining, the active-worker
//! accounting the route's teardown waits on, and the observability gauges.
//!
//! Mutable state is either atomic or held under its own mutex; nothing in
//! here is ever locked across a connection's suspension points.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::destination::TcpAddress;
use crate::protocol::Protocol;
use crate::routing::{self, AccessMode, RoutingStrategy, SslMode};
use crate::tls::TlsConfig;

// ============================================================================
// Client IP keys
// ============================================================================

/// Fixed-size key for quarantine counting; sized for IPv6, IPv4 occupies
/// the first four bytes.
pub type ClientIpKey = [u8; 16];

/// Derive the quarantine key from a peer address.
pub fn client_ip_key(addr: &SocketAddr) -> ClientIpKey {
    let mut key = ClientIpKey::default();
    match addr.ip() {
        std::net::IpAddr::V4(v4) => key[..4].copy_from_slice(&v4.octets()),
        std::net::IpAddr::V6(v6) => key.copy_from_slice(&v6.octets()),
    }
    key
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration of one route.
#[derive(Clone, Debug)]
pub struct RoutingConfig {
    /// Configuration name, e.g. `routing:cluster_default_ro`.
    pub name: String,

    pub protocol: Protocol,
    pub routing_strategy: RoutingStrategy,
    pub access_mode: AccessMode,

    pub bind_address: TcpAddress,

    /// Receive buffer size per channel.
    pub net_buffer_length: usize,

    /// Per-attempt timeout connecting to a destination.
    pub destination_connect_timeout: Duration,

    /// Timeout waiting for the handshake response from the client.
    pub client_connect_timeout: Duration,

    /// Idle-client timeout; zero disables it.
    pub wait_timeout: Duration,

    /// Maximum client connections; zero means unlimited.
    pub max_connections: i32,

    /// Handshake errors per client IP before it is blocked.
    pub max_connect_errors: u64,

    pub source_ssl_mode: SslMode,
    pub dest_ssl_mode: SslMode,

    pub tls: TlsConfig,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            name: "routing".to_string(),
            protocol: Protocol::Classic,
            routing_strategy: RoutingStrategy::Undefined,
            access_mode: AccessMode::Undefined,
            bind_address: TcpAddress::new(routing::DEFAULT_BIND_ADDRESS, 0),
            net_buffer_length: routing::DEFAULT_NET_BUFFER_LENGTH,
            destination_connect_timeout: routing::DEFAULT_DESTINATION_CONNECT_TIMEOUT,
            client_connect_timeout: routing::DEFAULT_CLIENT_CONNECT_TIMEOUT,
            wait_timeout: routing::DEFAULT_WAIT_TIMEOUT,
            max_connections: routing::DEFAULT_MAX_CONNECTIONS,
            max_connect_errors: routing::DEFAULT_MAX_CONNECT_ERRORS,
            source_ssl_mode: SslMode::Preferred,
            dest_ssl_mode: SslMode::AsClient,
            tls: TlsConfig::default(),
        }
    }
}

impl RoutingConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.destination_connect_timeout.is_zero() {
            return Err(crate::Error::Config(
                "destination_connect_timeout must be larger than 0ms".to_string(),
            ));
        }

        if self.max_connections < 0 {
            return Err(crate::Error::Config(
                "max_connections must not be negative".to_string(),
            ));
        }

        Ok(())
    }
}

// ============================================================================
// Context
// ============================================================================

/// Data shared by a route and all of its connections.
pub struct RoutingContext {
    config: RoutingConfig,

    /// Connection error counters for IPv4 or IPv6 hosts.
    conn_error_counters: Mutex<HashMap<ClientIpKey, u64>>,

    /// Number of active client workers; the condvar lets teardown wait for
    /// all of them.
    active_client_threads: Mutex<u64>,
    active_client_threads_cond: Condvar,

    /// Number of active connections on this route.
    info_active_routes: AtomicU16,

    /// Number of connections handled over the route's lifetime.
    info_handled_routes: AtomicU64,

    /// Invoked when a connect fails on fd exhaustion, so the hosting
    /// process can release pooled descriptors.
    fd_exhaustion_hook: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl RoutingContext {
    pub fn new(config: RoutingConfig) -> Self {
        Self {
            config,
            conn_error_counters: Mutex::new(HashMap::new()),
            active_client_threads: Mutex::new(0),
            active_client_threads_cond: Condvar::new(),
            info_active_routes: AtomicU16::new(0),
            info_handled_routes: AtomicU64::new(0),
            fd_exhaustion_hook: Mutex::new(None),
        }
    }

    /// Install the descriptor-release hook of the hosting process.
    pub fn register_fd_exhaustion_hook(&self, hook: Box<dyn Fn() + Send + Sync>) {
        *self.fd_exhaustion_hook.lock() = Some(hook);
    }

    /// Invoke the descriptor-release hook, if any.
    pub fn notify_fd_exhaustion(&self) {
        if let Some(hook) = &*self.fd_exhaustion_hook.lock() {
            hook();
        }
    }

    // ========================================================================
    // Config accessors
    // ========================================================================

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn protocol(&self) -> Protocol {
        self.config.protocol
    }

    pub fn bind_address(&self) -> &TcpAddress {
        &self.config.bind_address
    }

    pub fn net_buffer_length(&self) -> usize {
        self.config.net_buffer_length
    }

    pub fn destination_connect_timeout(&self) -> Duration {
        self.config.destination_connect_timeout
    }

    pub fn client_connect_timeout(&self) -> Duration {
        self.config.client_connect_timeout
    }

    pub fn wait_timeout(&self) -> Duration {
        self.config.wait_timeout
    }

    pub fn max_connections(&self) -> i32 {
        self.config.max_connections
    }

    pub fn max_connect_errors(&self) -> u64 {
        self.config.max_connect_errors
    }

    pub fn source_ssl_mode(&self) -> SslMode {
        self.config.source_ssl_mode
    }

    pub fn dest_ssl_mode(&self) -> SslMode {
        self.config.dest_ssl_mode
    }

    pub fn tls(&self) -> &TlsConfig {
        &self.config.tls
    }

    // ========================================================================
    // Quarantine
    // ========================================================================

    /// Count a handshake failure for a client host; returns true once the
    /// host crossed `max_connect_errors` and must be blocked.
    ///
    /// On a blocked classic route the caller additionally writes the fake
    /// login towards the server so the backend quarantines the host too.
    pub fn block_client_host(&self, ip_key: ClientIpKey, ip_str: &str) -> bool {
        let errors = {
            let mut counters = self.conn_error_counters.lock();
            let entry = counters.entry(ip_key).or_insert(0);
            *entry += 1;
            *entry
        };

        if errors > self.config.max_connect_errors {
            log::warn!(
                "[{}] blocking client host {} ({} connection errors)",
                self.config.name,
                ip_str,
                errors
            );
            return true;
        }

        log::info!(
            "[{}] {} connection error(s) for {}",
            self.config.name,
            errors,
            ip_str
        );

        false
    }

    /// Whether a client host is already at or above the block threshold.
    pub fn is_blocked(&self, ip_key: &ClientIpKey) -> bool {
        self.conn_error_counters
            .lock()
            .get(ip_key)
            .is_some_and(|&errors| errors >= self.config.max_connect_errors)
    }

    /// Snapshot of the hosts at or above the block threshold.
    pub fn blocked_client_hosts(&self) -> Vec<ClientIpKey> {
        let counters = self.conn_error_counters.lock();
        counters
            .iter()
            .filter(|(_, &errors)| errors >= self.config.max_connect_errors)
            .map(|(key, _)| *key)
            .collect()
    }

    // ========================================================================
    // Worker accounting
    // ========================================================================

    pub fn increase_active_thread_counter(&self) {
        let mut active = self.active_client_threads.lock();
        *active += 1;
    }

    pub fn decrease_active_thread_counter(&self) {
        let mut active = self.active_client_threads.lock();
        *active -= 1;
        if *active == 0 {
            self.active_client_threads_cond.notify_all();
        }
    }

    /// Block until every worker has finished. Used on route teardown.
    pub fn wait_until_idle(&self) {
        let mut active = self.active_client_threads.lock();
        while *active > 0 {
            self.active_client_threads_cond.wait(&mut active);
        }
    }

    // ========================================================================
    // Gauges
    // ========================================================================

    pub fn increase_info_active_routes(&self) {
        self.info_active_routes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrease_info_active_routes(&self) {
        self.info_active_routes.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn increase_info_handled_routes(&self) {
        self.info_handled_routes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_routes(&self) -> u16 {
        self.info_active_routes.load(Ordering::Relaxed)
    }

    pub fn handled_routes(&self) -> u64 {
        self.info_handled_routes.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_client_ip_key_v4() {
        let addr: SocketAddr = "192.168.1.7:5000".parse().unwrap();
        let key = client_ip_key(&addr);

        assert_eq!(&key[..4], &[192, 168, 1, 7]);
        assert_eq!(&key[4..], &[0u8; 12]);
    }

    #[test]
    fn test_client_ip_key_v6() {
        let addr: SocketAddr = "[::1]:5000".parse().unwrap();
        let key = client_ip_key(&addr);

        let mut expected = [0u8; 16];
        expected[15] = 1;
        assert_eq!(key, expected);
    }

    #[test]
    fn test_config_defaults() {
        let config = RoutingConfig::default();

        assert_eq!(config.net_buffer_length, 16384);
        assert_eq!(
            config.destination_connect_timeout,
            Duration::from_secs(5)
        );
        assert_eq!(config.client_connect_timeout, Duration::from_secs(9));
        assert_eq!(config.wait_timeout, Duration::ZERO);
        assert_eq!(config.max_connections, 0);
        assert_eq!(config.max_connect_errors, 100);
        assert_eq!(config.bind_address.address, "127.0.0.1");

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = RoutingConfig {
            destination_connect_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RoutingConfig {
            max_connections: -1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_quarantine_threshold() {
        let context = RoutingContext::new(RoutingConfig {
            max_connect_errors: 100,
            ..Default::default()
        });

        let addr: SocketAddr = "10.1.2.3:4444".parse().unwrap();
        let key = client_ip_key(&addr);

        // the first 99 failures do not block
        for _ in 0..99 {
            assert!(!context.block_client_host(key, "10.1.2.3"));
        }
        assert!(!context.is_blocked(&key));

        // crossing the threshold blocks
        context.block_client_host(key, "10.1.2.3");
        assert!(context.block_client_host(key, "10.1.2.3"));
        assert!(context.is_blocked(&key));

        // snapshot holds exactly this host
        assert_eq!(context.blocked_client_hosts(), vec![key]);
    }

    #[test]
    fn test_quarantine_is_per_host() {
        let context = RoutingContext::new(RoutingConfig {
            max_connect_errors: 2,
            ..Default::default()
        });

        let a = client_ip_key(&"10.0.0.1:1".parse().unwrap());
        let b = client_ip_key(&"10.0.0.2:1".parse().unwrap());

        context.block_client_host(a, "10.0.0.1");
        context.block_client_host(a, "10.0.0.1");

        assert!(!context.is_blocked(&b));

        context.block_client_host(b, "10.0.0.2");
        context.block_client_host(b, "10.0.0.2");
        assert!(context.is_blocked(&a));
        assert!(context.is_blocked(&b));

        let mut blocked = context.blocked_client_hosts();
        blocked.sort_unstable();
        let mut expected = vec![a, b];
        expected.sort_unstable();
        assert_eq!(blocked, expected);
    }

    #[test]
    fn test_worker_accounting() {
        let context = Arc::new(RoutingContext::new(RoutingConfig::default()));

        context.increase_active_thread_counter();
        context.increase_active_thread_counter();

        let ctx = context.clone();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            ctx.decrease_active_thread_counter();
            std::thread::sleep(Duration::from_millis(30));
            ctx.decrease_active_thread_counter();
        });

        context.wait_until_idle();
        worker.join().unwrap();
    }

    #[test]
    fn test_gauges() {
        let context = RoutingContext::new(RoutingConfig::default());

        context.increase_info_active_routes();
        context.increase_info_active_routes();
        context.increase_info_handled_routes();

        assert_eq!(context.active_routes(), 2);
        assert_eq!(context.handled_routes(), 1);

        context.decrease_info_active_routes();
        assert_eq!(context.active_routes(), 1);
    }
}
