//! # manet-node
//!
//! The IP layer of a simulated node.
//!
//! A [`Node`] entity sits above the node's MAC entity and:
//! - runs the OLSR state machine (periodic HELLO/TC emission, jittered MPR
//!   relaying, housekeeping)
//! - routes and forwards unicast datagrams by routing table lookup
//! - hosts the node's applications and drives their timers
//! - posts an [`IpEvent`] observation for every send, forward, delivery and
//!   drop, which is what flow accounting consumes

use manet_apps::{AppOutput, Application};
use manet_common::metric_defs::{self, MetricLabels};
use manet_common::{
    DropReason, Entity, EntityId, Event, EventPayload, IpEvent, IpEventKind, MacDestination,
    MacRxPacketEvent, MacTxFailedEvent, MacTxRequestEvent, NodeId, SimContext, SimError, SimTime,
};
use manet_olsr::{OlsrConfig, OlsrState};
use manet_packet::{OlsrMessage, OlsrPacket, Packet, Payload, OLSR_PORT};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tracing::{debug, trace};

/// Timer ID constants for the node entity.
pub const TIMER_START: u64 = 1;
const TIMER_HELLO: u64 = 2;
const TIMER_TC: u64 = 3;
const TIMER_HOUSEKEEPING: u64 = 4;
const TIMER_APP_BASE: u64 = 0x1000; // app index * 4 + action
const TIMER_FORWARD_BASE: u64 = 0x10_0000; // relay slot is added to this

const APP_START: u64 = 0;
const APP_WAKE: u64 = 1;
const APP_STOP: u64 = 2;

/// Interval of the OLSR tuple expiry sweep.
const HOUSEKEEPING_INTERVAL_MS: u64 = 1000;

// ============================================================================
// Addressing
// ============================================================================

/// Maps node indices to IPv4 addresses inside one subnet.
///
/// Node `i` gets host number `i + 1`, so the scenario's 10.1.1.0/24 yields
/// 10.1.1.1 for node 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AddressPlan {
    /// Network address.
    pub network: Ipv4Addr,
    /// Prefix length of the subnet.
    pub prefix_len: u8,
}

impl Default for AddressPlan {
    fn default() -> Self {
        AddressPlan {
            network: Ipv4Addr::new(10, 1, 1, 0),
            prefix_len: 24,
        }
    }
}

impl AddressPlan {
    fn mask(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix_len as u32)
        }
    }

    /// Check that the subnet is well formed and has room for `node_count` hosts.
    pub fn validate(&self, node_count: usize) -> Result<(), String> {
        if self.prefix_len > 30 {
            return Err(format!("prefix length {} leaves no host addresses", self.prefix_len));
        }
        if u32::from(self.network) & !self.mask() != 0 {
            return Err(format!("{}/{} has host bits set", self.network, self.prefix_len));
        }
        let hosts = (1u64 << (32 - self.prefix_len as u32)) - 2;
        if node_count as u64 > hosts {
            return Err(format!(
                "{}/{} holds {} hosts, {} nodes requested",
                self.network, self.prefix_len, hosts, node_count
            ));
        }
        Ok(())
    }

    /// Address of a node.
    pub fn address_of(&self, node: NodeId) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network).wrapping_add(node.0 + 1))
    }

    /// Node owning an address, if it belongs to the subnet.
    pub fn node_of(&self, address: Ipv4Addr) -> Option<NodeId> {
        let raw = u32::from(address);
        if raw & self.mask() != u32::from(self.network) {
            return None;
        }
        let host = raw & !self.mask();
        (host >= 1 && host != !self.mask()).then(|| NodeId(host - 1))
    }
}

// ============================================================================
// Node Entity
// ============================================================================

/// IP layer entity of one node.
pub struct Node {
    id: EntityId,
    node: NodeId,
    name: String,
    address: Ipv4Addr,
    plan: AddressPlan,
    mac: EntityId,
    olsr: OlsrState,
    applications: Vec<Application>,
    /// Messages waiting for their relay jitter to elapse.
    pending_relays: BTreeMap<u64, OlsrMessage>,
    next_relay_slot: u64,
    metric_labels: MetricLabels,
}

impl Node {
    /// Create the node entity. `mac` is the node's MAC entity.
    pub fn new(
        id: EntityId,
        node: NodeId,
        name: impl Into<String>,
        plan: AddressPlan,
        mac: EntityId,
        olsr: OlsrConfig,
    ) -> Self {
        let address = plan.address_of(node);
        Node {
            id,
            node,
            name: name.into(),
            address,
            plan,
            mac,
            olsr: OlsrState::new(address, olsr),
            applications: Vec::new(),
            pending_relays: BTreeMap::new(),
            next_relay_slot: 0,
            metric_labels: MetricLabels::for_node(node.0),
        }
    }

    /// Install an application.
    pub fn add_application(&mut self, application: Application) {
        self.applications.push(application);
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    /// Human-readable description.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// IPv4 address of the node.
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    /// OLSR state.
    pub fn olsr(&self) -> &OlsrState {
        &self.olsr
    }

    /// Installed applications.
    pub fn applications(&self) -> &[Application] {
        &self.applications
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    fn timer(&self, delay: SimTime, timer_id: u64, ctx: &mut SimContext) {
        ctx.post_event(delay, vec![self.id], EventPayload::Timer { timer_id });
    }

    fn jitter(&self, ctx: &mut SimContext) -> SimTime {
        let max = self.olsr.config().max_jitter_s;
        if max <= 0.0 {
            return SimTime::ZERO;
        }
        SimTime::from_secs(ctx.rng().gen_range(0.0..max))
    }

    fn start(&mut self, ctx: &mut SimContext) -> Result<(), SimError> {
        debug!(node = %self.address, name = %self.name, "node starting");
        let hello_delay = self.jitter(ctx);
        self.timer(hello_delay, TIMER_HELLO, ctx);
        let tc_delay = self.jitter(ctx);
        self.timer(tc_delay, TIMER_TC, ctx);
        self.timer(SimTime::from_millis(HOUSEKEEPING_INTERVAL_MS), TIMER_HOUSEKEEPING, ctx);

        for (index, app) in self.applications.iter().enumerate() {
            let base = TIMER_APP_BASE + index as u64 * 4;
            ctx.post_at(
                app.start_time(),
                vec![self.id],
                EventPayload::Timer { timer_id: base + APP_START },
            )?;
            ctx.post_at(
                app.stop_time(),
                vec![self.id],
                EventPayload::Timer { timer_id: base + APP_STOP },
            )?;
        }
        Ok(())
    }

    fn hello_timer(&mut self, ctx: &mut SimContext) {
        let hello = self.olsr.make_hello(ctx.time());
        trace!(node = %self.address, %hello, "sending HELLO");
        metrics::counter!(metric_defs::OLSR_HELLO_SENT.name, &self.metric_labels.to_labels()).increment(1);
        self.broadcast_olsr(vec![hello], ctx);

        let interval = self.olsr.config().hello_interval();
        let delay = interval - self.jitter(ctx);
        self.timer(delay, TIMER_HELLO, ctx);
    }

    fn tc_timer(&mut self, ctx: &mut SimContext) {
        if let Some(tc) = self.olsr.make_tc(ctx.time()) {
            trace!(node = %self.address, %tc, "sending TC");
            metrics::counter!(metric_defs::OLSR_TC_SENT.name, &self.metric_labels.to_labels()).increment(1);
            self.broadcast_olsr(vec![tc], ctx);
        }
        let interval = self.olsr.config().tc_interval();
        let delay = interval - self.jitter(ctx);
        self.timer(delay, TIMER_TC, ctx);
    }

    fn housekeeping_timer(&mut self, ctx: &mut SimContext) {
        if self.olsr.expire(ctx.time()) {
            self.routes_changed();
        }
        self.timer(SimTime::from_millis(HOUSEKEEPING_INTERVAL_MS), TIMER_HOUSEKEEPING, ctx);
    }

    fn relay_timer(&mut self, slot: u64, ctx: &mut SimContext) {
        if let Some(message) = self.pending_relays.remove(&slot) {
            trace!(node = %self.address, %message, "relaying");
            metrics::counter!(metric_defs::OLSR_TC_FORWARDED.name, &self.metric_labels.to_labels()).increment(1);
            self.broadcast_olsr(vec![message], ctx);
        }
    }

    fn app_timer(&mut self, timer_id: u64, ctx: &mut SimContext) {
        let index = ((timer_id - TIMER_APP_BASE) / 4) as usize;
        let action = (timer_id - TIMER_APP_BASE) % 4;
        let Some(app) = self.applications.get_mut(index) else {
            return;
        };
        let output = match action {
            APP_START => {
                debug!(node = %self.address, app = app.name(), "application started");
                app.start(ctx)
            }
            APP_WAKE if app.is_running() => app.wake(ctx),
            APP_STOP => {
                debug!(node = %self.address, app = app.name(), "application stopped");
                app.stop();
                AppOutput::default()
            }
            _ => AppOutput::default(),
        };
        self.apply_app_output(index, output, ctx);
    }

    fn apply_app_output(&mut self, index: usize, output: AppOutput, ctx: &mut SimContext) {
        for packet in output.packets {
            self.send(packet, ctx);
        }
        if let Some(at) = output.wake_at {
            let delay = at - ctx.time();
            self.timer(delay, TIMER_APP_BASE + index as u64 * 4 + APP_WAKE, ctx);
        }
    }

    // ------------------------------------------------------------------------
    // OLSR
    // ------------------------------------------------------------------------

    fn broadcast_olsr(&mut self, messages: Vec<OlsrMessage>, ctx: &mut SimContext) {
        let olsr = OlsrPacket {
            sequence: self.olsr.next_packet_sequence(),
            messages,
        };
        let mut packet = Packet::udp(
            ctx.next_uid(),
            (self.address, OLSR_PORT),
            (Ipv4Addr::BROADCAST, OLSR_PORT),
            Payload::Olsr(olsr),
        );
        packet.ttl = 1;
        self.to_mac(packet, MacDestination::Broadcast, ctx);
    }

    fn receive_olsr(&mut self, sender: Ipv4Addr, olsr: &OlsrPacket, ctx: &mut SimContext) {
        let now = ctx.time();
        for message in &olsr.messages {
            let outcome = self.olsr.handle_message(sender, message, now);
            if outcome.routes_changed {
                self.routes_changed();
            }
            if let Some(relayed) = outcome.forward {
                let slot = self.next_relay_slot;
                self.next_relay_slot += 1;
                self.pending_relays.insert(slot, relayed);
                let delay = self.jitter(ctx);
                self.timer(delay, TIMER_FORWARD_BASE + slot, ctx);
            }
        }
    }

    fn routes_changed(&self) {
        metrics::counter!(metric_defs::OLSR_ROUTE_RECOMPUTATIONS.name, &self.metric_labels.to_labels())
            .increment(1);
        if tracing::enabled!(tracing::Level::TRACE) {
            for route in self.olsr.routing_table().iter() {
                trace!(
                    node = %self.address,
                    destination = %route.destination,
                    next_hop = %route.next_hop,
                    distance = route.distance,
                    "route"
                );
            }
        }
    }

    // ------------------------------------------------------------------------
    // IP
    // ------------------------------------------------------------------------

    fn observe(&self, packet: Packet, kind: IpEventKind, ctx: &mut SimContext) {
        ctx.post_observation(EventPayload::Ip(IpEvent {
            node: self.node,
            packet,
            kind,
        }));
    }

    fn drop_packet(&self, packet: Packet, reason: DropReason, ctx: &mut SimContext) {
        debug!(node = %self.address, uid = packet.uid, reason = reason.as_label(), "dropping packet");
        let mut labels = self.metric_labels.to_labels();
        labels.push(("reason", reason.as_label().to_string()));
        metrics::counter!(metric_defs::IP_DROPS.name, &labels).increment(1);
        self.observe(packet, IpEventKind::Drop(reason), ctx);
    }

    fn to_mac(&self, packet: Packet, destination: MacDestination, ctx: &mut SimContext) {
        ctx.post_immediate(
            vec![self.mac],
            EventPayload::MacTxRequest(MacTxRequestEvent { packet, destination }),
        );
    }

    /// Originate a packet from a local application.
    fn send(&mut self, packet: Packet, ctx: &mut SimContext) {
        self.observe(packet.clone(), IpEventKind::Send, ctx);
        if packet.destination == self.address {
            self.deliver(packet, ctx);
            return;
        }
        self.route(packet, ctx);
    }

    /// Hand a unicast packet to the next hop.
    fn route(&mut self, packet: Packet, ctx: &mut SimContext) {
        let next_hop = match self.olsr.lookup(packet.destination) {
            Ok(route) => route.next_hop,
            Err(e) => {
                trace!(node = %self.address, error = %e, "route lookup failed");
                self.drop_packet(packet, DropReason::NoRoute, ctx);
                return;
            }
        };
        let Some(next_node) = self.plan.node_of(next_hop) else {
            self.drop_packet(packet, DropReason::NoRoute, ctx);
            return;
        };
        self.to_mac(packet, MacDestination::Unicast(next_node), ctx);
    }

    fn forward(&mut self, mut packet: Packet, ctx: &mut SimContext) {
        if !packet.decrement_ttl() {
            self.drop_packet(packet, DropReason::TtlExpired, ctx);
            return;
        }
        if self.olsr.lookup(packet.destination).is_err() {
            self.drop_packet(packet, DropReason::NoRoute, ctx);
            return;
        }
        metrics::counter!(metric_defs::IP_FORWARDED.name, &self.metric_labels.to_labels()).increment(1);
        self.observe(packet.clone(), IpEventKind::Forward, ctx);
        self.route(packet, ctx);
    }

    fn deliver(&mut self, packet: Packet, ctx: &mut SimContext) {
        self.observe(packet.clone(), IpEventKind::Deliver, ctx);
        let port = packet.destination_port;
        let Some(index) = self.applications.iter().position(|a| a.local_port() == port) else {
            trace!(node = %self.address, port, "no application on port");
            return;
        };
        let output = self.applications[index].receive(&packet, ctx);
        self.apply_app_output(index, output, ctx);
    }

    fn handle_mac_rx(&mut self, rx: &MacRxPacketEvent, ctx: &mut SimContext) {
        if let Payload::Olsr(olsr) = &rx.packet.payload {
            if rx.packet.destination_port == OLSR_PORT {
                self.receive_olsr(rx.packet.source, olsr, ctx);
            }
            return;
        }
        let packet = rx.packet.clone();
        if packet.destination == self.address {
            self.deliver(packet, ctx);
        } else if packet.is_broadcast() {
            trace!(node = %self.address, uid = packet.uid, "unhandled broadcast");
        } else {
            self.forward(packet, ctx);
        }
    }

    fn handle_mac_failure(&mut self, failed: &MacTxFailedEvent, ctx: &mut SimContext) {
        self.drop_packet(failed.packet.clone(), DropReason::MacFailure(failed.reason), ctx);
    }
}

impl Entity for Node {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        match &event.payload {
            EventPayload::MacRxPacket(rx) => self.handle_mac_rx(rx, ctx),
            EventPayload::MacTxFailed(failed) => self.handle_mac_failure(failed, ctx),
            EventPayload::Timer { timer_id } => match *timer_id {
                TIMER_START => self.start(ctx)?,
                TIMER_HELLO => self.hello_timer(ctx),
                TIMER_TC => self.tc_timer(ctx),
                TIMER_HOUSEKEEPING => self.housekeeping_timer(ctx),
                id if id >= TIMER_FORWARD_BASE => self.relay_timer(id - TIMER_FORWARD_BASE, ctx),
                id if id >= TIMER_APP_BASE => self.app_timer(id, ctx),
                _ => {}
            },
            _ => {}
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manet_apps::{EchoServer, EchoServerConfig};
    use manet_common::EventId;
    use manet_packet::{
        encode_time, Hello, LinkCode, LinkMessage, LinkType, MessageBody, NeighborType, Willingness,
    };

    const NODE: EntityId = EntityId(1);
    const MAC: EntityId = EntityId(2);

    fn node() -> Node {
        Node::new(NODE, NodeId(0), "Source Node", AddressPlan::default(), MAC, OlsrConfig::default())
    }

    fn addr(host: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 1, 1, host)
    }

    fn event(payload: EventPayload) -> Event {
        Event {
            id: EventId(0),
            time: SimTime::ZERO,
            source: MAC,
            targets: vec![NODE],
            payload,
        }
    }

    fn drain(ctx: &mut SimContext) -> Vec<Event> {
        std::iter::from_fn(|| ctx.scheduler_mut().pop_next()).collect()
    }

    fn ip_kinds(events: &[Event]) -> Vec<IpEventKind> {
        events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::Ip(ip) => Some(ip.kind),
                _ => None,
            })
            .collect()
    }

    fn mac_requests(events: &[Event]) -> Vec<MacTxRequestEvent> {
        events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::MacTxRequest(req) => Some(req.clone()),
                _ => None,
            })
            .collect()
    }

    /// HELLO from 10.1.1.2 listing node 0 as a heard link.
    fn hello_from_neighbor() -> MacRxPacketEvent {
        let hello = OlsrMessage {
            originator: addr(2),
            vtime: encode_time(6.0),
            ttl: 1,
            hop_count: 0,
            sequence: 1,
            body: MessageBody::Hello(Hello {
                htime: encode_time(2.0),
                willingness: Willingness::Default,
                links: vec![LinkMessage {
                    link_code: LinkCode::new(LinkType::Asymmetric, NeighborType::NotNeighbor),
                    neighbors: vec![addr(1)],
                }],
            }),
        };
        let mut packet = Packet::udp(
            900,
            (addr(2), OLSR_PORT),
            (Ipv4Addr::BROADCAST, OLSR_PORT),
            Payload::Olsr(OlsrPacket {
                sequence: 1,
                messages: vec![hello],
            }),
        );
        packet.ttl = 1;
        MacRxPacketEvent {
            packet,
            from: NodeId(1),
        }
    }

    fn data(source: Ipv4Addr, destination: Ipv4Addr, port: u16) -> Packet {
        Packet::udp(77, (source, 49153), (destination, port), Payload::Data { len: 1024 })
    }

    #[test]
    fn test_address_plan() {
        let plan = AddressPlan::default();
        assert_eq!(plan.address_of(NodeId(0)), addr(1));
        assert_eq!(plan.address_of(NodeId(4)), addr(5));
        assert_eq!(plan.node_of(addr(2)), Some(NodeId(1)));
        assert_eq!(plan.node_of(addr(0)), None);
        assert_eq!(plan.node_of(addr(255)), None);
        assert_eq!(plan.node_of(Ipv4Addr::new(10, 1, 2, 1)), None);
        assert!(plan.validate(5).is_ok());
        assert!(plan.validate(300).is_err());
        let bad = AddressPlan {
            network: addr(7),
            prefix_len: 24,
        };
        assert!(bad.validate(5).is_err());
    }

    #[test]
    fn test_start_schedules_protocol_and_app_timers() {
        let mut n = node();
        n.add_application(Application::EchoServer(EchoServer::new(
            EchoServerConfig::default(),
            NodeId(0),
            addr(1),
        )));
        let mut ctx = SimContext::new(1);
        n.handle_event(&event(EventPayload::Timer { timer_id: TIMER_START }), &mut ctx)
            .unwrap();
        // HELLO, TC, housekeeping, app start, app stop
        assert_eq!(ctx.scheduler().pending_count(), 5);
    }

    #[test]
    fn test_hello_timer_broadcasts_and_reschedules() {
        let mut n = node();
        let mut ctx = SimContext::new(1);
        n.handle_event(&event(EventPayload::Timer { timer_id: TIMER_HELLO }), &mut ctx)
            .unwrap();
        let events = drain(&mut ctx);
        let requests = mac_requests(&events);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].destination, MacDestination::Broadcast);
        assert_eq!(requests[0].packet.destination_port, OLSR_PORT);
        assert_eq!(requests[0].packet.ttl, 1);
        let timers = events
            .iter()
            .filter(|e| matches!(e.payload, EventPayload::Timer { timer_id: TIMER_HELLO }))
            .count();
        assert_eq!(timers, 1);
    }

    #[test]
    fn test_send_without_route_is_dropped() {
        let mut n = node();
        let mut ctx = SimContext::new(1);
        n.send(data(addr(1), addr(2), 9), &mut ctx);
        let events = drain(&mut ctx);
        assert_eq!(
            ip_kinds(&events),
            vec![IpEventKind::Send, IpEventKind::Drop(DropReason::NoRoute)]
        );
        assert!(mac_requests(&events).is_empty());
    }

    #[test]
    fn test_neighbor_hello_enables_unicast() {
        let mut n = node();
        let mut ctx = SimContext::new(1);
        n.handle_event(&event(EventPayload::MacRxPacket(hello_from_neighbor())), &mut ctx)
            .unwrap();
        assert_eq!(n.olsr().symmetric_neighbors(), vec![addr(2)]);

        n.send(data(addr(1), addr(2), 9), &mut ctx);
        let events = drain(&mut ctx);
        assert_eq!(ip_kinds(&events), vec![IpEventKind::Send]);
        let requests = mac_requests(&events);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].destination, MacDestination::Unicast(NodeId(1)));
    }

    #[test]
    fn test_forwarding_decrements_ttl() {
        let mut n = node();
        let mut ctx = SimContext::new(1);
        n.handle_event(&event(EventPayload::MacRxPacket(hello_from_neighbor())), &mut ctx)
            .unwrap();
        drain(&mut ctx);

        let rx = MacRxPacketEvent {
            packet: data(addr(5), addr(2), 9),
            from: NodeId(4),
        };
        n.handle_event(&event(EventPayload::MacRxPacket(rx)), &mut ctx).unwrap();
        let events = drain(&mut ctx);
        assert_eq!(ip_kinds(&events), vec![IpEventKind::Forward]);
        let requests = mac_requests(&events);
        assert_eq!(requests[0].packet.ttl, manet_packet::DEFAULT_TTL - 1);
    }

    #[test]
    fn test_ttl_expiry_drops() {
        let mut n = node();
        let mut ctx = SimContext::new(1);
        let mut packet = data(addr(5), addr(2), 9);
        packet.ttl = 1;
        let rx = MacRxPacketEvent {
            packet,
            from: NodeId(4),
        };
        n.handle_event(&event(EventPayload::MacRxPacket(rx)), &mut ctx).unwrap();
        assert_eq!(
            ip_kinds(&drain(&mut ctx)),
            vec![IpEventKind::Drop(DropReason::TtlExpired)]
        );
    }

    #[test]
    fn test_delivery_reaches_listening_server() {
        let mut n = node();
        n.add_application(Application::EchoServer(EchoServer::new(
            EchoServerConfig::default(),
            NodeId(0),
            addr(1),
        )));
        let mut ctx = SimContext::new(1);
        n.handle_event(&event(EventPayload::MacRxPacket(hello_from_neighbor())), &mut ctx)
            .unwrap();
        n.app_timer(TIMER_APP_BASE + APP_START, &mut ctx);
        drain(&mut ctx);

        let rx = MacRxPacketEvent {
            packet: data(addr(2), addr(1), 9),
            from: NodeId(1),
        };
        n.handle_event(&event(EventPayload::MacRxPacket(rx)), &mut ctx).unwrap();
        let events = drain(&mut ctx);
        assert_eq!(ip_kinds(&events), vec![IpEventKind::Deliver, IpEventKind::Send]);
        let requests = mac_requests(&events);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].packet.destination, addr(2));
        assert_eq!(requests[0].packet.destination_port, 49153);
    }

    #[test]
    fn test_mac_failure_becomes_drop() {
        let mut n = node();
        let mut ctx = SimContext::new(1);
        let failed = MacTxFailedEvent {
            packet: data(addr(1), addr(2), 9),
            destination: MacDestination::Unicast(NodeId(1)),
            reason: manet_common::MacFailureReason::RetryExhausted,
        };
        n.handle_event(&event(EventPayload::MacTxFailed(failed)), &mut ctx).unwrap();
        assert_eq!(
            ip_kinds(&drain(&mut ctx)),
            vec![IpEventKind::Drop(DropReason::MacFailure(
                manet_common::MacFailureReason::RetryExhausted
            ))]
        );
    }
}
