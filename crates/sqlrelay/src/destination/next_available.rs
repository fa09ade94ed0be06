// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Next-available destination strategy.
//!
//! The address list is a primary/backup chain: `valid_ndx` is the lowest
//! index that has not yet reported a connect failure. A failure at index
//! `i` advances `valid_ndx` to `i + 1`; it never regresses, so the chain
//! never fails back to an earlier node even if it comes up again.
//!
//! ```text
//!   A -> B -> C -> sorry, no more servers
//!   (regardless of whether A and B go back up or not)
//! ```

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{
    Destination, DestinationNodesStateNotifier, DestinationProvider, Destinations,
    StaticAddressList, TcpAddress,
};
use crate::routing::RoutingStrategy;

/// Next-available over a static address list.
#[derive(Default)]
pub struct NextAvailableDestinations {
    addrs: StaticAddressList,

    /// Lowest index that has not reported a connect failure.
    valid_ndx: Arc<AtomicUsize>,

    notifier: DestinationNodesStateNotifier,
}

impl NextAvailableDestinations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, address: impl Into<String>, port: u16) {
        self.addrs.add(TcpAddress::new(address, port));
    }

    pub fn add_address(&self, addr: TcpAddress) {
        self.addrs.add(addr);
    }

    /// Lowest index still considered connectable.
    pub fn valid_ndx(&self) -> usize {
        self.valid_ndx.load(Ordering::SeqCst)
    }
}

impl DestinationProvider for NextAvailableDestinations {
    fn strategy(&self) -> RoutingStrategy {
        RoutingStrategy::NextAvailable
    }

    fn destinations(&self) -> Destinations {
        self.addrs
            .snapshot()
            .iter()
            .enumerate()
            .map(|(ndx, addr)| {
                Box::new(StateTrackingDestination {
                    id: addr.to_string(),
                    hostname: addr.address.clone(),
                    port: addr.port,
                    ndx,
                    valid_ndx: self.valid_ndx.clone(),
                }) as Box<dyn Destination>
            })
            .collect()
    }

    fn addresses(&self) -> Vec<TcpAddress> {
        self.addrs.snapshot()
    }

    fn notifier(&self) -> &DestinationNodesStateNotifier {
        &self.notifier
    }
}

/// Destination that reports failures back into the owning chain.
struct StateTrackingDestination {
    id: String,
    hostname: String,
    port: u16,

    /// Index of this destination in the fetch.
    ndx: usize,

    /// Shared with the provider; advanced on failure, never regressed.
    valid_ndx: Arc<AtomicUsize>,
}

impl Destination for StateTrackingDestination {
    fn id(&self) -> &str {
        &self.id
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn good(&self) -> bool {
        self.ndx >= self.valid_ndx.load(Ordering::SeqCst)
    }

    fn connect_status(&self, _ec: io::ErrorKind) {
        // mark this index as invalid
        self.valid_ndx.fetch_max(self.ndx + 1, Ordering::SeqCst);
    }
}

// ============================================================================
// Tests
// ============================================================================
