// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! First-available destination strategy.
//!
//! Like next-available with the valid index frozen at 0: every fetch starts
//! at the first destination, later ones are only tried on transient failure
//! of the current attempt within one connect pass, and exhaustion returns
//! to the first on the next pass. All destinations are always good.

use super::{
    AddressDestination, Destination, DestinationNodesStateNotifier, DestinationProvider,
    Destinations, StaticAddressList, TcpAddress,
};
use crate::routing::RoutingStrategy;

/// First-available over a static address list.
#[derive(Default)]
pub struct FirstAvailableDestinations {
    addrs: StaticAddressList,
    notifier: DestinationNodesStateNotifier,
}

impl FirstAvailableDestinations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, address: impl Into<String>, port: u16) {
        self.addrs.add(TcpAddress::new(address, port));
    }

    pub fn add_address(&self, addr: TcpAddress) {
        self.addrs.add(addr);
    }
}

impl DestinationProvider for FirstAvailableDestinations {
    fn strategy(&self) -> RoutingStrategy {
        RoutingStrategy::FirstAvailable
    }

    fn destinations(&self) -> Destinations {
        self.addrs
            .snapshot()
            .iter()
            .map(|addr| Box::new(AddressDestination::new(addr)) as Box<dyn Destination>)
            .collect()
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_is_stable() {
        let balancer = FirstAvailableDestinations::new();
        balancer.add("a", 1);
        balancer.add("b", 2);

        for _ in 0..3 {
            let dests = balancer.destinations();
            let names: Vec<_> = dests.iter().map(|d| d.id().to_string()).collect();
            assert_eq!(names, ["a:1", "b:2"]);
        }
    }

    #[test]
    fn test_failures_leave_goodness_untouched() {
        let balancer = FirstAvailableDestinations::new();
        balancer.add("a", 1);
        balancer.add("b", 2);

        let dests = balancer.destinations();
        dests[0].connect_status(std::io::ErrorKind::ConnectionRefused);

        assert!(dests.iter().all(|d| d.good()));
        assert!(balancer.destinations().iter().all(|d| d.good()));
    }
}
