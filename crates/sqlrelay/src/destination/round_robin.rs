// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Round-robin destination strategy.
//!
//! Every fetch rotates the starting position over the current address list:
//!
//! ```text
//! addresses:  [0 1 2 3 4]      start_pos = 2
//! fetch:      [2 3 4] + [0 1]  start_pos = 3 afterwards
//! ```
//!
//! All destinations are always good; connect failures carry no memory into
//! the next fetch.

use parking_lot::Mutex;

use super::{
    AddressDestination, DestinationNodesStateNotifier, DestinationProvider, Destinations,
    StaticAddressList, TcpAddress,
};
use crate::routing::RoutingStrategy;

/// Round-robin over a static address list.
#[derive(Default)]
pub struct RoundRobinDestinations {
    addrs: StaticAddressList,

    /// Starting index of the next fetch.
    start_pos: Mutex<usize>,

    notifier: DestinationNodesStateNotifier,
}

impl RoundRobinDestinations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, address: impl Into<String>, port: u16) {
        self.addrs.add(TcpAddress::new(address, port));
    }

    pub fn add_address(&self, addr: TcpAddress) {
        self.addrs.add(addr);
    }

    pub fn remove(&self, addr: &TcpAddress) {
        self.addrs.remove(addr);
    }

    pub fn clear(&self) {
        self.addrs.clear();
    }
}

impl DestinationProvider for RoundRobinDestinations {
    fn strategy(&self) -> RoutingStrategy {
        RoutingStrategy::RoundRobin
    }

    fn destinations(&self) -> Destinations {
        let addrs = self.addrs.snapshot();
        let mut start_pos = self.start_pos.lock();

        let mut dests: Destinations = Vec::with_capacity(addrs.len());
        if addrs.is_empty() {
            return dests;
        }

        // clamp in case the list shrank since the last fetch
        let start = *start_pos % addrs.len();

        for addr in addrs[start..].iter().chain(addrs[..start].iter()) {
            dests.push(Box::new(AddressDestination::new(addr)));
        }

        *start_pos = (start + 1) % addrs.len();

        dests
    }

    fn addresses(&self) -> Vec<TcpAddress> {
        self.addrs.snapshot()
    }

    fn notifier(&self) -> &DestinationNodesStateNotifier {
        &self.notifier
    }
}

// ============================================================================
// Tests
// ============================================================================
