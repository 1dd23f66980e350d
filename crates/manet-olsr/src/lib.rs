//! # manet-olsr
//!
//! Optimized Link State Routing (RFC 3626) for the MANET simulator.
//!
//! This crate provides the per-node protocol state machine ([`OlsrState`]):
//! - Link sensing and neighbor detection from HELLO messages
//! - Two-hop neighbor tracking and MPR selection ([`mpr`])
//! - Topology control (TC) processing with ANSN staleness checks
//! - MPR flooding decisions with a per-originator duplicate set
//! - Shortest-path route computation ([`routing`])
//!
//! The state machine is pure: it never schedules events. The node entity
//! hosting it drives the periodic emissions and hands received messages in.

pub mod mpr;
pub mod routing;

pub use routing::{compute_routes, RouteEntry, RoutingTable, TopologyView};

use manet_common::SimTime;
use manet_packet::{
    encode_time, seq_newer, Hello, LinkCode, LinkMessage, LinkType, MessageBody, NeighborType,
    OlsrMessage, Tc, Willingness,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::{debug, trace};

/// TTL of flooded TC messages.
pub const TC_TTL: u8 = 255;

/// Errors raised by route lookups.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RouteError {
    #[error("no route to {0}")]
    NoRoute(Ipv4Addr),
}

// ============================================================================
// Configuration
// ============================================================================

/// OLSR protocol parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OlsrConfig {
    /// HELLO emission interval in seconds.
    pub hello_interval_s: f64,
    /// TC emission interval in seconds.
    pub tc_interval_s: f64,
    /// Neighbor hold time as a multiple of the HELLO interval.
    pub neighbor_hold_factor: f64,
    /// Topology hold time as a multiple of the TC interval.
    pub topology_hold_factor: f64,
    /// How long duplicate tuples are remembered, in seconds.
    pub duplicate_hold_time_s: f64,
    /// Upper bound of the random jitter applied to emissions, in seconds.
    pub max_jitter_s: f64,
    /// Willingness advertised in HELLO messages.
    pub willingness: Willingness,
}

impl Default for OlsrConfig {
    fn default() -> Self {
        OlsrConfig {
            hello_interval_s: 2.0,
            tc_interval_s: 5.0,
            neighbor_hold_factor: 3.0,
            topology_hold_factor: 3.0,
            duplicate_hold_time_s: 30.0,
            max_jitter_s: 0.5,
            willingness: Willingness::Default,
        }
    }
}

impl OlsrConfig {
    /// Check parameter ranges.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("hello_interval_s", self.hello_interval_s),
            ("tc_interval_s", self.tc_interval_s),
            ("neighbor_hold_factor", self.neighbor_hold_factor),
            ("topology_hold_factor", self.topology_hold_factor),
            ("duplicate_hold_time_s", self.duplicate_hold_time_s),
            ("max_jitter_s", self.max_jitter_s),
        ] {
            if !value.is_finite() {
                return Err(format!("{} must be finite, got {}", name, value));
            }
        }
        if !(self.hello_interval_s > 0.0) {
            return Err(format!("hello interval must be positive, got {}", self.hello_interval_s));
        }
        if !(self.tc_interval_s > 0.0) {
            return Err(format!("TC interval must be positive, got {}", self.tc_interval_s));
        }
        if self.neighbor_hold_factor < 1.0 || self.topology_hold_factor < 1.0 {
            return Err("hold factors must be at least 1".to_string());
        }
        if !(self.duplicate_hold_time_s > 0.0) {
            return Err("duplicate hold time must be positive".to_string());
        }
        if self.max_jitter_s < 0.0 || self.max_jitter_s >= self.hello_interval_s {
            return Err(format!(
                "max jitter must be in [0, hello interval), got {}",
                self.max_jitter_s
            ));
        }
        Ok(())
    }

    /// HELLO interval.
    pub fn hello_interval(&self) -> SimTime {
        SimTime::from_secs(self.hello_interval_s)
    }

    /// TC interval.
    pub fn tc_interval(&self) -> SimTime {
        SimTime::from_secs(self.tc_interval_s)
    }

    /// Neighbor hold time (validity of HELLO information).
    pub fn neighbor_hold_time(&self) -> SimTime {
        SimTime::from_secs(self.hello_interval_s * self.neighbor_hold_factor)
    }

    /// Topology hold time (validity of TC information).
    pub fn topology_hold_time(&self) -> SimTime {
        SimTime::from_secs(self.tc_interval_s * self.topology_hold_factor)
    }

    /// Duplicate tuple hold time.
    pub fn duplicate_hold_time(&self) -> SimTime {
        SimTime::from_secs(self.duplicate_hold_time_s)
    }
}

// ============================================================================
// Repositories
// ============================================================================

#[derive(Debug, Clone)]
struct LinkTuple {
    /// None once the link was reported lost or never confirmed.
    sym_until: Option<SimTime>,
    asym_until: SimTime,
    expires: SimTime,
}

impl LinkTuple {
    fn is_symmetric(&self, now: SimTime) -> bool {
        self.sym_until.is_some_and(|until| until >= now)
    }

    fn link_type(&self, now: SimTime) -> LinkType {
        if self.is_symmetric(now) {
            LinkType::Symmetric
        } else if self.asym_until >= now {
            LinkType::Asymmetric
        } else {
            LinkType::Lost
        }
    }
}

#[derive(Debug, Clone)]
struct NeighborTuple {
    willingness: Willingness,
    symmetric: bool,
}

#[derive(Debug, Clone)]
struct TopologyTuple {
    ansn: u16,
    expires: SimTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum MessageKind {
    Hello,
    Tc,
}

impl MessageKind {
    fn of(message: &OlsrMessage) -> Self {
        match message.body {
            MessageBody::Hello(_) => MessageKind::Hello,
            MessageBody::Tc(_) => MessageKind::Tc,
        }
    }
}

#[derive(Debug, Clone)]
struct DuplicateTuple {
    sequence: u16,
    retransmitted: bool,
    expires: SimTime,
}

/// Result of handling one received message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageOutcome {
    /// The message was new and its contents were applied.
    pub processed: bool,
    /// Copy to retransmit, when this node relays for the sender.
    pub forward: Option<OlsrMessage>,
    /// The routing table changed.
    pub routes_changed: bool,
}

// ============================================================================
// Protocol State
// ============================================================================

/// OLSR state of one node.
#[derive(Debug, Clone)]
pub struct OlsrState {
    main_address: Ipv4Addr,
    config: OlsrConfig,
    links: BTreeMap<Ipv4Addr, LinkTuple>,
    neighbors: BTreeMap<Ipv4Addr, NeighborTuple>,
    two_hop: BTreeMap<(Ipv4Addr, Ipv4Addr), SimTime>,
    mpr_set: BTreeSet<Ipv4Addr>,
    mpr_selectors: BTreeMap<Ipv4Addr, SimTime>,
    advertised: BTreeSet<Ipv4Addr>,
    /// Keep sending empty TCs until this time after the selector set empties.
    empty_tc_until: Option<SimTime>,
    topology: BTreeMap<(Ipv4Addr, Ipv4Addr), TopologyTuple>,
    duplicates: BTreeMap<(Ipv4Addr, MessageKind), DuplicateTuple>,
    routing_table: RoutingTable,
    message_sequence: u16,
    packet_sequence: u16,
    ansn: u16,
}

impl OlsrState {
    /// Create the state of the node with `main_address`.
    pub fn new(main_address: Ipv4Addr, config: OlsrConfig) -> Self {
        OlsrState {
            main_address,
            config,
            links: BTreeMap::new(),
            neighbors: BTreeMap::new(),
            two_hop: BTreeMap::new(),
            mpr_set: BTreeSet::new(),
            mpr_selectors: BTreeMap::new(),
            advertised: BTreeSet::new(),
            empty_tc_until: None,
            topology: BTreeMap::new(),
            duplicates: BTreeMap::new(),
            routing_table: RoutingTable::new(),
            message_sequence: 0,
            packet_sequence: 0,
            ansn: 0,
        }
    }

    /// Main address of this node.
    pub fn main_address(&self) -> Ipv4Addr {
        self.main_address
    }

    pub fn config(&self) -> &OlsrConfig {
        &self.config
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    /// Next hop towards `destination`.
    pub fn lookup(&self, destination: Ipv4Addr) -> Result<&RouteEntry, RouteError> {
        self.routing_table.lookup(destination)
    }

    /// Neighbors selected as MPR by this node.
    pub fn mpr_set(&self) -> &BTreeSet<Ipv4Addr> {
        &self.mpr_set
    }

    /// Neighbors that selected this node as MPR.
    pub fn mpr_selectors(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.mpr_selectors.keys().copied()
    }

    /// Symmetric one-hop neighbors.
    pub fn symmetric_neighbors(&self) -> Vec<Ipv4Addr> {
        self.neighbors
            .iter()
            .filter(|(_, n)| n.symmetric)
            .map(|(addr, _)| *addr)
            .collect()
    }

    /// Strict two-hop neighbors.
    pub fn two_hop_neighbors(&self) -> BTreeSet<Ipv4Addr> {
        self.two_hop
            .keys()
            .map(|(_, target)| *target)
            .filter(|target| *target != self.main_address && !self.is_symmetric(*target))
            .collect()
    }

    /// Number of topology tuples.
    pub fn topology_len(&self) -> usize {
        self.topology.len()
    }

    /// Current advertised neighbor sequence number.
    pub fn ansn(&self) -> u16 {
        self.ansn
    }

    /// Allocate the sequence number of the next outgoing packet.
    pub fn next_packet_sequence(&mut self) -> u16 {
        self.packet_sequence = self.packet_sequence.wrapping_add(1);
        self.packet_sequence
    }

    fn next_message_sequence(&mut self) -> u16 {
        self.message_sequence = self.message_sequence.wrapping_add(1);
        self.message_sequence
    }

    fn is_symmetric(&self, address: Ipv4Addr) -> bool {
        self.neighbors.get(&address).is_some_and(|n| n.symmetric)
    }

    // ------------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------------

    /// Build a HELLO describing every known link.
    pub fn make_hello(&mut self, now: SimTime) -> OlsrMessage {
        let mut groups: BTreeMap<LinkCode, Vec<Ipv4Addr>> = BTreeMap::new();
        for (address, link) in &self.links {
            let link_type = link.link_type(now);
            let neighbor_type = if link_type != LinkType::Symmetric {
                NeighborType::NotNeighbor
            } else if self.mpr_set.contains(address) {
                NeighborType::Mpr
            } else {
                NeighborType::Symmetric
            };
            groups
                .entry(LinkCode::new(link_type, neighbor_type))
                .or_default()
                .push(*address);
        }

        OlsrMessage {
            originator: self.main_address,
            vtime: encode_time(self.config.neighbor_hold_time().as_secs_f64()),
            ttl: 1,
            hop_count: 0,
            sequence: self.next_message_sequence(),
            body: MessageBody::Hello(Hello {
                htime: encode_time(self.config.hello_interval_s),
                willingness: self.config.willingness,
                links: groups
                    .into_iter()
                    .map(|(link_code, neighbors)| LinkMessage {
                        link_code,
                        neighbors,
                    })
                    .collect(),
            }),
        }
    }

    /// Build a TC advertising the MPR selector set.
    ///
    /// Returns None when there is nothing to advertise. After the selector
    /// set empties, empty TCs keep going out for one topology hold time so
    /// that other nodes drop the stale edges.
    pub fn make_tc(&mut self, now: SimTime) -> Option<OlsrMessage> {
        let withdrawing = matches!(self.empty_tc_until, Some(until) if now <= until);
        if self.mpr_selectors.is_empty() && !withdrawing {
            return None;
        }
        Some(OlsrMessage {
            originator: self.main_address,
            vtime: encode_time(self.config.topology_hold_time().as_secs_f64()),
            ttl: TC_TTL,
            hop_count: 0,
            sequence: self.next_message_sequence(),
            body: MessageBody::Tc(Tc {
                ansn: self.ansn,
                advertised: self.mpr_selectors.keys().copied().collect(),
            }),
        })
    }

    // ------------------------------------------------------------------------
    // Reception
    // ------------------------------------------------------------------------

    /// Handle a message received from the one-hop neighbor `sender`.
    pub fn handle_message(&mut self, sender: Ipv4Addr, message: &OlsrMessage, now: SimTime) -> MessageOutcome {
        let mut outcome = MessageOutcome::default();
        if message.originator == self.main_address || message.ttl == 0 {
            return outcome;
        }
        let kind = MessageKind::of(message);
        if kind != MessageKind::Hello && !self.is_symmetric(sender) {
            trace!(node = %self.main_address, %sender, "control message from non-symmetric neighbor");
            return outcome;
        }

        let key = (message.originator, kind);
        let seen = self.duplicates.get(&key).cloned();
        match seen {
            Some(dup) if !seq_newer(message.sequence, dup.sequence) => {
                if message.sequence != dup.sequence || dup.retransmitted {
                    trace!(node = %self.main_address, %message, "duplicate ignored");
                    return outcome;
                }
            }
            _ => {
                match &message.body {
                    MessageBody::Hello(hello) => self.process_hello(sender, message, hello, now),
                    MessageBody::Tc(tc) => self.process_tc(message, tc, now),
                }
                self.duplicates.insert(
                    key,
                    DuplicateTuple {
                        sequence: message.sequence,
                        retransmitted: false,
                        expires: now + self.config.duplicate_hold_time(),
                    },
                );
                outcome.processed = true;
                outcome.routes_changed = self.refresh(now);
            }
        }

        if kind == MessageKind::Tc && message.ttl > 1 && self.mpr_selectors.contains_key(&sender) {
            let mut relayed = message.clone();
            relayed.ttl -= 1;
            relayed.hop_count = relayed.hop_count.saturating_add(1);
            if let Some(dup) = self.duplicates.get_mut(&key) {
                dup.retransmitted = true;
            }
            outcome.forward = Some(relayed);
        }
        outcome
    }

    fn process_hello(&mut self, sender: Ipv4Addr, message: &OlsrMessage, hello: &Hello, now: SimTime) {
        let validity = SimTime::from_secs(message.validity_time());
        let hold = self.config.neighbor_hold_time();
        let listed = hello.link_code_for(self.main_address);

        let link = self.links.entry(sender).or_insert(LinkTuple {
            sym_until: None,
            asym_until: now,
            expires: now,
        });
        let was_symmetric = link.is_symmetric(now);
        link.asym_until = now + validity;
        match listed.map(|code| code.link_type) {
            Some(LinkType::Lost) => link.sym_until = None,
            Some(LinkType::Symmetric) | Some(LinkType::Asymmetric) => {
                link.sym_until = Some(now + validity);
                link.expires = now + validity + hold;
            }
            _ => {}
        }
        link.expires = link.expires.max(link.asym_until);
        let symmetric = link.is_symmetric(now);
        if symmetric && !was_symmetric {
            debug!(node = %self.main_address, neighbor = %sender, "link became symmetric");
        }

        self.neighbors.insert(
            sender,
            NeighborTuple {
                willingness: hello.willingness,
                symmetric,
            },
        );

        if symmetric {
            for group in &hello.links {
                for &address in &group.neighbors {
                    if address == self.main_address {
                        continue;
                    }
                    match group.link_code.neighbor_type {
                        NeighborType::Symmetric | NeighborType::Mpr => {
                            self.two_hop.insert((sender, address), now + validity);
                        }
                        NeighborType::NotNeighbor => {
                            self.two_hop.remove(&(sender, address));
                        }
                    }
                }
            }
        }

        if listed.is_some_and(|code| code.neighbor_type == NeighborType::Mpr) {
            self.mpr_selectors.insert(sender, now + validity);
        } else {
            self.mpr_selectors.remove(&sender);
        }
    }

    fn process_tc(&mut self, message: &OlsrMessage, tc: &Tc, now: SimTime) {
        let originator = message.originator;
        let stale = self
            .topology
            .iter()
            .any(|((last, _), tuple)| *last == originator && seq_newer(tuple.ansn, tc.ansn));
        if stale {
            trace!(node = %self.main_address, %originator, ansn = tc.ansn, "stale TC ignored");
            return;
        }

        self.topology
            .retain(|(last, _), tuple| *last != originator || !seq_newer(tc.ansn, tuple.ansn));
        let expires = now + SimTime::from_secs(message.validity_time());
        for &destination in &tc.advertised {
            self.topology.insert(
                (originator, destination),
                TopologyTuple {
                    ansn: tc.ansn,
                    expires,
                },
            );
        }
    }

    // ------------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------------

    /// Drop expired tuples. Returns true if the routing table changed.
    pub fn expire(&mut self, now: SimTime) -> bool {
        self.links.retain(|_, link| link.expires >= now);
        self.duplicates.retain(|_, dup| dup.expires >= now);
        self.topology.retain(|_, tuple| tuple.expires >= now);
        self.refresh(now)
    }

    /// Re-derive neighbor symmetry, two-hop set, MPRs, selectors and routes.
    fn refresh(&mut self, now: SimTime) -> bool {
        let links = &self.links;
        self.neighbors.retain(|address, _| links.contains_key(address));
        for (address, neighbor) in self.neighbors.iter_mut() {
            neighbor.symmetric = links.get(address).is_some_and(|l| l.is_symmetric(now));
        }

        let neighbors = &self.neighbors;
        let symmetric = |address: &Ipv4Addr| neighbors.get(address).is_some_and(|n| n.symmetric);
        self.two_hop
            .retain(|(via, _), expires| *expires >= now && symmetric(via));
        self.mpr_selectors
            .retain(|selector, expires| *expires >= now && symmetric(selector));

        let willingness: BTreeMap<Ipv4Addr, Willingness> = self
            .neighbors
            .iter()
            .filter(|(_, n)| n.symmetric)
            .map(|(address, n)| (*address, n.willingness))
            .collect();
        let two_hop_pairs: BTreeSet<(Ipv4Addr, Ipv4Addr)> = self.two_hop.keys().copied().collect();
        let mpr_set = mpr::select_mprs(self.main_address, &willingness, &two_hop_pairs);
        if mpr_set != self.mpr_set {
            debug!(node = %self.main_address, mprs = ?mpr_set, "MPR set changed");
            self.mpr_set = mpr_set;
        }

        let selectors: BTreeSet<Ipv4Addr> = self.mpr_selectors.keys().copied().collect();
        if selectors != self.advertised {
            self.ansn = self.ansn.wrapping_add(1);
            if selectors.is_empty() {
                self.empty_tc_until = Some(now + self.config.topology_hold_time());
            }
            self.advertised = selectors;
        }

        let view = TopologyView {
            neighbors: willingness.keys().copied().collect(),
            two_hop: two_hop_pairs,
            topology: self.topology.keys().copied().collect(),
        };
        let table = compute_routes(self.main_address, &view);
        if table != self.routing_table {
            debug!(node = %self.main_address, routes = table.len(), "routing table recomputed");
            self.routing_table = table;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn addr(i: usize) -> Ipv4Addr {
        Ipv4Addr::new(10, 1, 1, i as u8 + 1)
    }

    fn secs(s: f64) -> SimTime {
        SimTime::from_secs(s)
    }

    fn nodes(n: usize) -> Vec<OlsrState> {
        (0..n).map(|i| OlsrState::new(addr(i), OlsrConfig::default())).collect()
    }

    fn adjacent(links: &[(usize, usize)], node: usize) -> Vec<usize> {
        let mut out: Vec<usize> = links
            .iter()
            .filter_map(|&(a, b)| match node {
                n if n == a => Some(b),
                n if n == b => Some(a),
                _ => None,
            })
            .collect();
        out.sort();
        out
    }

    /// Deliver `message` from `origin` to its neighbors, relaying forwards.
    fn flood(states: &mut [OlsrState], links: &[(usize, usize)], origin: usize, message: OlsrMessage, now: SimTime) {
        let mut queue = VecDeque::from([(origin, message)]);
        while let Some((from, message)) = queue.pop_front() {
            let sender = states[from].main_address();
            for to in adjacent(links, from) {
                let outcome = states[to].handle_message(sender, &message, now);
                if let Some(relayed) = outcome.forward {
                    queue.push_back((to, relayed));
                }
            }
        }
    }

    fn hello_rounds(states: &mut [OlsrState], links: &[(usize, usize)], rounds: usize) {
        for round in 0..rounds {
            let now = secs(round as f64);
            for i in 0..states.len() {
                let hello = states[i].make_hello(now);
                flood(states, links, i, hello, now);
            }
        }
    }

    fn tc_round(states: &mut [OlsrState], links: &[(usize, usize)], now: SimTime) {
        for i in 0..states.len() {
            if let Some(tc) = states[i].make_tc(now) {
                flood(states, links, i, tc, now);
            }
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(OlsrConfig::default().validate().is_ok());
        let config = OlsrConfig {
            hello_interval_s: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = OlsrConfig {
            max_jitter_s: 5.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = OlsrConfig {
            hello_interval_s: f64::INFINITY,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(OlsrConfig::default().neighbor_hold_time(), secs(6.0));
        assert_eq!(OlsrConfig::default().topology_hold_time(), secs(15.0));
    }

    #[test]
    fn test_link_sensing_asymmetric_then_symmetric() {
        let mut a = OlsrState::new(addr(0), OlsrConfig::default());
        let mut b = OlsrState::new(addr(1), OlsrConfig::default());
        let now = secs(1.0);

        // B hears A, but A's HELLO does not list B yet.
        let hello = a.make_hello(now);
        assert!(b.handle_message(addr(0), &hello, now).processed);
        assert!(b.symmetric_neighbors().is_empty());

        // B now lists A as asymmetric; A sees itself and turns symmetric.
        let hello = b.make_hello(now);
        match &hello.body {
            MessageBody::Hello(h) => {
                assert_eq!(
                    h.link_code_for(addr(0)),
                    Some(LinkCode::new(LinkType::Asymmetric, NeighborType::NotNeighbor))
                );
            }
            MessageBody::Tc(_) => panic!("expected HELLO"),
        }
        a.handle_message(addr(1), &hello, now);
        assert_eq!(a.symmetric_neighbors(), vec![addr(1)]);
        assert_eq!(a.lookup(addr(1)).unwrap().distance, 1);

        let hello = a.make_hello(now);
        b.handle_message(addr(0), &hello, now);
        assert_eq!(b.symmetric_neighbors(), vec![addr(0)]);
    }

    #[test]
    fn test_neighbor_expires_after_hold_time() {
        let mut states = nodes(2);
        hello_rounds(&mut states, &[(0, 1)], 2);
        assert_eq!(states[0].symmetric_neighbors(), vec![addr(1)]);

        // Last HELLO at 1 s; validity 6 s.
        assert!(!states[0].expire(secs(6.5)));
        assert!(states[0].expire(secs(7.5)));
        assert!(states[0].symmetric_neighbors().is_empty());
        assert!(states[0].routing_table().is_empty());
    }

    #[test]
    fn test_mpr_selection_on_line() {
        let links = [(0, 1), (1, 2), (2, 3)];
        let mut states = nodes(4);
        hello_rounds(&mut states, &links, 5);

        assert_eq!(states[0].mpr_set(), &[addr(1)].into_iter().collect());
        assert_eq!(states[1].mpr_set(), &[addr(2)].into_iter().collect());
        assert_eq!(states[2].mpr_set(), &[addr(1)].into_iter().collect());
        let selectors: Vec<Ipv4Addr> = states[1].mpr_selectors().collect();
        assert_eq!(selectors, vec![addr(0), addr(2)]);
        assert_eq!(states[0].two_hop_neighbors(), [addr(2)].into_iter().collect());
    }

    #[test]
    fn test_line_converges_after_tc_flooding() {
        let links = [(0, 1), (1, 2), (2, 3)];
        let mut states = nodes(4);
        hello_rounds(&mut states, &links, 5);
        assert!(states[0].lookup(addr(3)).is_err());

        tc_round(&mut states, &links, secs(5.0));
        for (i, state) in states.iter().enumerate() {
            for j in 0..4 {
                if i == j {
                    continue;
                }
                let route = state.lookup(addr(j)).unwrap();
                assert_eq!(route.distance, (i as i64 - j as i64).unsigned_abs() as u32);
                let expected_next = if j > i { addr(i + 1) } else { addr(i - 1) };
                assert_eq!(route.next_hop, expected_next);
            }
        }
    }

    #[test]
    fn test_full_mesh_needs_no_relays() {
        let links = [(0, 1), (0, 2), (1, 2)];
        let mut states = nodes(3);
        hello_rounds(&mut states, &links, 5);
        assert!(states.iter().all(|s| s.mpr_set().is_empty()));
        assert!(states.iter().all(|s| s.mpr_selectors().count() == 0));
        assert!(states.iter_mut().all(|s| s.make_tc(secs(30.0)).is_none()));
    }

    #[test]
    fn test_old_sequence_numbers_are_ignored() {
        let mut states = nodes(2);
        hello_rounds(&mut states, &[(0, 1)], 2);
        let now = secs(2.0);
        let tc = |sequence, ansn| OlsrMessage {
            originator: addr(1),
            vtime: encode_time(15.0),
            ttl: TC_TTL,
            hop_count: 0,
            sequence,
            body: MessageBody::Tc(Tc {
                ansn,
                advertised: vec![addr(5)],
            }),
        };

        assert!(states[0].handle_message(addr(1), &tc(100, 4), now).processed);
        assert_eq!(states[0].lookup(addr(5)).unwrap().next_hop, addr(1));
        assert!(!states[0].handle_message(addr(1), &tc(100, 4), now).processed);
        assert!(!states[0].handle_message(addr(1), &tc(99, 4), now).processed);

        // Newer sequence but older ANSN: processed as a message, topology kept.
        let stale = OlsrMessage {
            body: MessageBody::Tc(Tc {
                ansn: 3,
                advertised: vec![addr(6)],
            }),
            ..tc(101, 3)
        };
        states[0].handle_message(addr(1), &stale, now);
        assert!(states[0].lookup(addr(6)).is_err());
        assert!(states[0].lookup(addr(5)).is_ok());
    }

    #[test]
    fn test_tc_from_non_symmetric_sender_dropped() {
        let mut state = OlsrState::new(addr(0), OlsrConfig::default());
        let tc = OlsrMessage {
            originator: addr(3),
            vtime: encode_time(15.0),
            ttl: TC_TTL,
            hop_count: 2,
            sequence: 1,
            body: MessageBody::Tc(Tc {
                ansn: 1,
                advertised: vec![addr(4)],
            }),
        };
        let outcome = state.handle_message(addr(2), &tc, secs(1.0));
        assert_eq!(outcome, MessageOutcome::default());
        assert_eq!(state.topology_len(), 0);
    }

    #[test]
    fn test_ansn_increments_on_selector_change() {
        let links = [(0, 1), (1, 2)];
        let mut states = nodes(3);
        hello_rounds(&mut states, &links, 5);
        assert!(states[1].ansn() > 0);
        let before = states[1].ansn();

        // Node 0 and 2 disappear; the selector set empties.
        states[1].expire(secs(20.0));
        assert_eq!(states[1].mpr_selectors().count(), 0);
        assert_eq!(states[1].ansn(), before.wrapping_add(1));
        // Empty TCs still go out to withdraw the old edges.
        assert!(states[1].make_tc(secs(21.0)).is_some());
        assert!(states[1].make_tc(secs(40.0)).is_none());
    }
}
