//! Routing table and shortest-path computation.

use crate::RouteError;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

// ============================================================================
// Routing Table
// ============================================================================

/// Route to one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RouteEntry {
    /// Destination main address.
    pub destination: Ipv4Addr,
    /// Neighbor to hand the packet to.
    pub next_hop: Ipv4Addr,
    /// Hop count.
    pub distance: u32,
}

/// Routing table, replaced wholesale on each recomputation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    entries: BTreeMap<Ipv4Addr, RouteEntry>,
}

impl RoutingTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the route to `destination`.
    pub fn lookup(&self, destination: Ipv4Addr) -> Result<&RouteEntry, RouteError> {
        self.entries
            .get(&destination)
            .ok_or(RouteError::NoRoute(destination))
    }

    /// All routes, ordered by destination.
    pub fn iter(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries.values()
    }

    /// Number of routes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no routes.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, entry: RouteEntry) {
        self.entries.insert(entry.destination, entry);
    }

    fn contains(&self, destination: Ipv4Addr) -> bool {
        self.entries.contains_key(&destination)
    }
}

// ============================================================================
// Route Computation
// ============================================================================

/// Inputs of the route computation, taken from the protocol repositories.
#[derive(Debug, Clone, Default)]
pub struct TopologyView {
    /// Symmetric one-hop neighbors.
    pub neighbors: BTreeSet<Ipv4Addr>,
    /// (neighbor, two-hop address) pairs.
    pub two_hop: BTreeSet<(Ipv4Addr, Ipv4Addr)>,
    /// (last hop, destination) edges learned from TC messages.
    pub topology: BTreeSet<(Ipv4Addr, Ipv4Addr)>,
}

/// Compute shortest hop-count routes from `local`.
///
/// Neighbors are at distance 1, two-hop neighbors at 2, and every further
/// ring is grown from the topology edges. When several candidates reach a
/// destination at the same distance the lowest next hop wins.
pub fn compute_routes(local: Ipv4Addr, view: &TopologyView) -> RoutingTable {
    let mut table = RoutingTable::new();

    for &neighbor in &view.neighbors {
        table.insert(RouteEntry {
            destination: neighbor,
            next_hop: neighbor,
            distance: 1,
        });
    }

    let mut distance = 1;
    loop {
        let mut ring: BTreeMap<Ipv4Addr, Ipv4Addr> = BTreeMap::new();
        if distance == 1 {
            for &(neighbor, two_hop) in &view.two_hop {
                if two_hop == local || table.contains(two_hop) || !view.neighbors.contains(&neighbor) {
                    continue;
                }
                offer(&mut ring, two_hop, neighbor);
            }
        }
        for &(last, destination) in &view.topology {
            if destination == local || table.contains(destination) {
                continue;
            }
            if let Some(via) = table.entries.get(&last) {
                if via.distance == distance {
                    offer(&mut ring, destination, via.next_hop);
                }
            }
        }
        if ring.is_empty() {
            break;
        }
        distance += 1;
        for (destination, next_hop) in ring {
            table.insert(RouteEntry {
                destination,
                next_hop,
                distance,
            });
        }
    }
    table
}

fn offer(ring: &mut BTreeMap<Ipv4Addr, Ipv4Addr>, destination: Ipv4Addr, next_hop: Ipv4Addr) {
    ring.entry(destination)
        .and_modify(|current| {
            if next_hop < *current {
                *current = next_hop;
            }
        })
        .or_insert(next_hop);
}
