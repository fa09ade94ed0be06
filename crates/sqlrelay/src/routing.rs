// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Route-level policies and defaults.
//!
//! A *route* is one listening endpoint with a fixed protocol, routing
//! strategy, SSL policy and destination provider. This module holds the
//! vocabulary shared by all of them: the strategy and SSL-mode enums, the
//! per-route default values, and small helpers like the thread-name
//! shortener used when naming reactor threads.

use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

/// Timeout for idling clients. 0 == no timeout used.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::ZERO;

/// Max number of active connections per route. 0 == no limit.
pub const DEFAULT_MAX_CONNECTIONS: i32 = 0;

/// Timeout for a single connect() attempt against a destination.
pub const DEFAULT_DESTINATION_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum connect or handshake errors per client host.
///
/// Such errors can happen when the client does not reply to the handshake,
/// sends an incorrect packet, or garbage.
pub const DEFAULT_MAX_CONNECT_ERRORS: u64 = 100;

/// Bind address used when none is configured.
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";

/// Network buffer length; matches the server-side default.
pub const DEFAULT_NET_BUFFER_LENGTH: usize = 16384;

/// Timeout waiting for the handshake response from the client
/// (server-side default minus one second).
pub const DEFAULT_CLIENT_CONNECT_TIMEOUT: Duration = Duration::from_secs(9);

/// Delay before an idling connection may be moved to the pool when
/// connection sharing is allowed.
pub const DEFAULT_CONNECTION_SHARING_DELAY: Duration = Duration::from_millis(1000);

/// Interval between reachability probes of an unreachable destination.
pub const DEFAULT_UNREACHABLE_DESTINATION_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Default SSL session cache mode.
pub const DEFAULT_SSL_SESSION_CACHE_MODE: bool = true;

/// Default SSL session cache size.
pub const DEFAULT_SSL_SESSION_CACHE_SIZE: u32 = 1024;

/// Default SSL session cache timeout.
pub const DEFAULT_SSL_SESSION_CACHE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default maximum total connections handled by all routes of a process.
pub const DEFAULT_MAX_TOTAL_CONNECTIONS: u64 = 512;

/// Default ports written to the config file during bootstrap.
pub const DEFAULT_PORT_CLASSIC_RW: u16 = 6446;
pub const DEFAULT_PORT_CLASSIC_RO: u16 = 6447;
pub const DEFAULT_PORT_X_RW: u16 = 6448;
pub const DEFAULT_PORT_X_RO: u16 = 6449;
pub const DEFAULT_PORT_RW_SPLIT: u16 = 6450;

/// Longest thread name the platform accepts (pthread limit).
const MAX_THREAD_NAME_LEN: usize = 15;

// ============================================================================
// Strategies and modes
// ============================================================================

/// Routing strategies supported by a route.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RoutingStrategy {
    #[default]
    Undefined,

    /// Try the first destination; on transient failure fall through within
    /// one connect pass, return to the first on the next pass.
    FirstAvailable,

    /// Primary/backup chain that never fails back: a destination that
    /// reported a connect error stays invalid.
    NextAvailable,

    /// Rotate the starting destination on every fetch.
    RoundRobin,

    /// Round-robin over secondaries, falling back to primaries when no
    /// secondary is available (metadata-driven routes only).
    RoundRobinWithFallback,
}

impl RoutingStrategy {
    /// Parse the configuration-file value.
    pub fn from_name(value: &str) -> Self {
        match value {
            "first-available" => RoutingStrategy::FirstAvailable,
            "next-available" => RoutingStrategy::NextAvailable,
            "round-robin" => RoutingStrategy::RoundRobin,
            "round-robin-with-fallback" => RoutingStrategy::RoundRobinWithFallback,
            _ => RoutingStrategy::Undefined,
        }
    }

    /// Configuration-file name of the strategy; empty for `Undefined`.
    pub fn name(self) -> &'static str {
        match self {
            RoutingStrategy::Undefined => "",
            RoutingStrategy::FirstAvailable => "first-available",
            RoutingStrategy::NextAvailable => "next-available",
            RoutingStrategy::RoundRobin => "round-robin",
            RoutingStrategy::RoundRobinWithFallback => "round-robin-with-fallback",
        }
    }
}

/// Access mode of the servers behind a route.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AccessMode {
    #[default]
    Undefined,
    Auto,
}

impl AccessMode {
    pub fn from_name(value: &str) -> Self {
        match value {
            "auto" => AccessMode::Auto,
            _ => AccessMode::Undefined,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AccessMode::Undefined => "",
            AccessMode::Auto => "auto",
        }
    }
}

/// SSL policy of one side of a route.
///
/// `source` (client-facing) routes use `Disabled`, `Preferred`, `Required`
/// or `Passthrough`; `dest` (server-facing) routes use `Disabled`,
/// `Preferred`, `Required` or `AsClient`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SslMode {
    #[default]
    Default,
    Disabled,
    Preferred,
    Required,
    Passthrough,
    AsClient,
}

impl SslMode {
    pub fn from_name(value: &str) -> Self {
        match value {
            "DISABLED" => SslMode::Disabled,
            "PREFERRED" => SslMode::Preferred,
            "REQUIRED" => SslMode::Required,
            "PASSTHROUGH" => SslMode::Passthrough,
            "AS_CLIENT" => SslMode::AsClient,
            _ => SslMode::Default,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SslMode::Default => "",
            SslMode::Disabled => "DISABLED",
            SslMode::Preferred => "PREFERRED",
            SslMode::Required => "REQUIRED",
            SslMode::Passthrough => "PASSTHROUGH",
            SslMode::AsClient => "AS_CLIENT",
        }
    }
}

/// Bootstrap section kinds and their defaults.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapSection {
    ClassicRw,
    ClassicRo,
    XRw,
    XRo,
    RwSplit,
}

impl BootstrapSection {
    pub fn default_port(self) -> u16 {
        match self {
            BootstrapSection::ClassicRw => DEFAULT_PORT_CLASSIC_RW,
            BootstrapSection::ClassicRo => DEFAULT_PORT_CLASSIC_RO,
            BootstrapSection::XRw => DEFAULT_PORT_X_RW,
            BootstrapSection::XRo => DEFAULT_PORT_X_RO,
            BootstrapSection::RwSplit => DEFAULT_PORT_RW_SPLIT,
        }
    }

    pub fn default_strategy(self) -> RoutingStrategy {
        match self {
            BootstrapSection::ClassicRw | BootstrapSection::XRw => RoutingStrategy::FirstAvailable,
            BootstrapSection::ClassicRo | BootstrapSection::XRo => {
                RoutingStrategy::RoundRobinWithFallback
            }
            BootstrapSection::RwSplit => RoutingStrategy::RoundRobin,
        }
    }

    pub fn section_name(self) -> &'static str {
        match self {
            BootstrapSection::ClassicRw => "bootstrap_rw",
            BootstrapSection::ClassicRo => "bootstrap_ro",
            BootstrapSection::XRw => "bootstrap_x_rw",
            BootstrapSection::XRo => "bootstrap_x_ro",
            BootstrapSection::RwSplit => "bootstrap_rw_split",
        }
    }
}

// ============================================================================
// Thread names
// ============================================================================

/// Shorten a route configuration name into a thread name.
///
/// The config name is expected to be `routing` or `routing:<tag>`. A
/// `_default_` marker inside the tag is stripped together with everything
/// before it. The result is `<prefix>:<short-tag>` truncated to the
/// platform's 15-byte thread-name limit.
///
/// ```
/// use sqlrelay::routing::thread_name;
///
/// assert_eq!(thread_name("routing:cluster_default_x_ro", "RtS"), "RtS:x_ro");
/// assert_eq!(thread_name("routing", "RtS"), "RtS:");
/// assert_eq!(thread_name("", "pre"), "pre:parse err");
/// ```
pub fn thread_name(config_name: &str, prefix: &str) -> String {
    let tag = if config_name == "routing" {
        ""
    } else if let Some(rest) = config_name.strip_prefix("routing:") {
        rest
    } else {
        return format!("{prefix}:parse err");
    };

    let short = match tag.find("_default_") {
        Some(pos) => &tag[pos + "_default_".len()..],
        None => tag,
    };

    let mut name = format!("{prefix}:{short}");
    name.truncate(MAX_THREAD_NAME_LEN);
    name
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(DEFAULT_WAIT_TIMEOUT, Duration::ZERO);
        assert_eq!(DEFAULT_MAX_CONNECTIONS, 0);
        assert_eq!(DEFAULT_DESTINATION_CONNECT_TIMEOUT, Duration::from_secs(5));
        assert_eq!(DEFAULT_BIND_ADDRESS, "127.0.0.1");
        assert_eq!(DEFAULT_NET_BUFFER_LENGTH, 16384);
        assert_eq!(DEFAULT_MAX_CONNECT_ERRORS, 100);
        assert_eq!(DEFAULT_CLIENT_CONNECT_TIMEOUT, Duration::from_secs(9));
        assert_eq!(DEFAULT_MAX_TOTAL_CONNECTIONS, 512);
    }

    #[test]
    fn test_bootstrap_ports() {
        assert_eq!(BootstrapSection::ClassicRw.default_port(), 6446);
        assert_eq!(BootstrapSection::ClassicRo.default_port(), 6447);
        assert_eq!(BootstrapSection::XRw.default_port(), 6448);
        assert_eq!(BootstrapSection::XRo.default_port(), 6449);
        assert_eq!(BootstrapSection::RwSplit.default_port(), 6450);
    }

    #[test]
    fn test_strategy_name_roundtrip() {
        for strategy in [
            RoutingStrategy::FirstAvailable,
            RoutingStrategy::NextAvailable,
            RoutingStrategy::RoundRobin,
            RoutingStrategy::RoundRobinWithFallback,
        ] {
            assert_eq!(RoutingStrategy::from_name(strategy.name()), strategy);
        }

        assert_eq!(
            RoutingStrategy::from_name("no-such-strategy"),
            RoutingStrategy::Undefined
        );
    }

    #[test]
    fn test_ssl_mode_names() {
        assert_eq!(SslMode::from_name("PASSTHROUGH"), SslMode::Passthrough);
        assert_eq!(SslMode::from_name("AS_CLIENT"), SslMode::AsClient);
        assert_eq!(SslMode::from_name("bogus"), SslMode::Default);
        assert_eq!(SslMode::Required.name(), "REQUIRED");
    }

    #[test]
    fn test_thread_name_parse_errors() {
        // config name must begin with "routing"
        assert_eq!(thread_name("", ""), ":parse err");
        assert_eq!(thread_name("routin", ""), ":parse err");
        assert_eq!(thread_name(" routing", ""), ":parse err");
        assert_eq!(thread_name("", "pre"), "pre:parse err");
        assert_eq!(thread_name("routin", "pre"), "pre:parse err");
        assert_eq!(thread_name(" routing", "pre"), "pre:parse err");
    }

    #[test]
    fn test_thread_name_empty_prefix() {
        assert_eq!(thread_name("routing", ""), ":");
        assert_eq!(thread_name("routing:", ""), ":");
    }

    #[test]
    fn test_thread_name_no_default_marker() {
        // no "_default_" marker: fall back to <prefix>:<tag> trimmed to 15
        assert_eq!(thread_name("routing:test_def_ult_x_ro", "RtS"), "RtS:test_def_ul");
        assert_eq!(thread_name("routing:test_def_ult_ro", "RtS"), "RtS:test_def_ul");
        assert_eq!(thread_name("routing:test_x_ro", "RtS"), "RtS:test_x_ro");
        assert_eq!(thread_name("routing:test_ro", "RtS"), "RtS:test_ro");
    }

    #[test]
    fn test_thread_name_real_cases() {
        assert_eq!(thread_name("routing:test_default_x_ro", "RtS"), "RtS:x_ro");
        assert_eq!(thread_name("routing:test_default_ro", "RtS"), "RtS:ro");
        assert_eq!(thread_name("routing", "RtS"), "RtS:");
    }
}
