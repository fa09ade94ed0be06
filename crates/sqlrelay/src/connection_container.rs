// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registry of a route's live connections.
//!
//! Backed by a fixed-bucket concurrent map (127 buckets, one mutex each).
//! `for_each` locks one bucket at a time, so the map may be mutated behind
//! the iteration: every connection present at entry is visited, connections
//! inserted during iteration may or may not be. Visitors may call
//! [`ConnectionHandle::disconnect`] on the entry under visit; they must not
//! erase it — a connection erases itself from its run loop when it reaches
//! its terminal state.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::destination::AllowedNodes;

// ============================================================================
// Concurrent map
// ============================================================================

/// Default number of buckets.
const DEFAULT_NUM_BUCKETS: usize = 127;

/// Hash map with a fixed number of independently locked buckets.
pub struct ConcurrentMap<K, V, S = RandomState> {
    buckets: Vec<Bucket<K, V>>,
    hasher: S,
}

struct Bucket<K, V> {
    data: Mutex<HashMap<K, V>>,
}

impl<K, V> Default for Bucket<K, V> {
    fn default() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Hash + Eq, V> ConcurrentMap<K, V> {
    pub fn new() -> Self {
        Self::with_buckets(DEFAULT_NUM_BUCKETS)
    }

    pub fn with_buckets(num_buckets: usize) -> Self {
        assert!(num_buckets > 0);

        Self {
            buckets: (0..num_buckets).map(|_| Bucket::default()).collect(),
            hasher: RandomState::new(),
        }
    }
}

impl<K: Hash + Eq, V, S: BuildHasher> ConcurrentMap<K, V, S> {
    fn bucket(&self, key: &K) -> &Bucket<K, V> {
        let index = (self.hasher.hash_one(key) as usize) % self.buckets.len();
        &self.buckets[index]
    }

    pub fn put(&self, key: K, value: V) {
        self.bucket(&key).data.lock().insert(key, value);
    }

    pub fn erase(&self, key: &K) -> Option<V> {
        self.bucket(key).data.lock().remove(key)
    }

    /// Apply `predicate` to the entry with `key`, while its bucket is held.
    pub fn for_one<P: FnMut(&V)>(&self, key: &K, mut predicate: P) {
        let data = self.bucket(key).data.lock();
        if let Some(value) = data.get(key) {
            predicate(value);
        }
    }

    /// Apply `predicate` to every entry, one bucket lock at a time.
    pub fn for_each<P: FnMut(&K, &V)>(&self, mut predicate: P) {
        for bucket in &self.buckets {
            let data = bucket.data.lock();
            for (key, value) in data.iter() {
                predicate(key, value);
            }
        }
    }

    /// Sum of all bucket sizes.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(|b| b.data.lock().len()).sum()
    }
}

impl<K: Hash + Eq, V> Default for ConcurrentMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Connection container
// ============================================================================

/// Container for the connections of one route.
#[derive(Default)]
pub struct ConnectionContainer {
    connections: ConcurrentMap<ConnectionId, Arc<ConnectionHandle>>,
}

impl ConnectionContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection. Called by the route when a machine is spawned.
    pub fn add_connection(&self, handle: Arc<ConnectionHandle>) {
        self.connections.put(handle.id(), handle);
    }

    /// Remove a connection. Called from the connection's run loop once it
    /// reached its terminal state.
    pub fn remove_connection(&self, id: ConnectionId) {
        self.connections.erase(&id);
    }

    /// Request disconnection of every connection whose server is not in
    /// `allowed`. Connections without a server yet are left alone.
    pub fn disconnect(&self, allowed: &AllowedNodes) {
        self.connections.for_each(|_, handle| {
            if let Some(server) = handle.server_address() {
                if !allowed.contains(&server) {
                    log::info!(
                        "disconnecting client {}: server {} is no longer allowed",
                        handle.client_address(),
                        server
                    );
                    handle.disconnect();
                }
            }
        });
    }

    /// Request disconnection of every connection.
    pub fn disconnect_all(&self) {
        self.connections.for_each(|_, handle| handle.disconnect());
    }

    /// Look up a connection by client address.
    pub fn get(&self, client_address: &str) -> Option<Arc<ConnectionHandle>> {
        let mut found = None;
        self.connections.for_each(|_, handle| {
            if handle.client_address() == client_address && found.is_none() {
                found = Some(handle.clone());
            }
        });
        found
    }

    /// Snapshot of all connection handles.
    pub fn connections(&self) -> Vec<Arc<ConnectionHandle>> {
        let mut out = Vec::with_capacity(self.size());
        self.connections.for_each(|_, handle| out.push(handle.clone()));
        out
    }

    pub fn size(&self) -> usize {
        self.connections.size()
    }
}

// ============================================================================
// Tests
// ============================================================================
