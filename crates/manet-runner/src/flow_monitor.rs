//! Per-flow packet accounting.
//!
//! The monitor is fed with the IP-layer observations emitted by the nodes.
//! Unicast packets are classified by their 5-tuple; flow ids are assigned
//! from 1 in order of first appearance. A packet is tracked by its uid from
//! the moment it is sent until it is delivered or dropped, so that every
//! transmitted packet ends up either received or lost.

use manet_common::{IpEvent, IpEventKind, Packet, SimTime};
use manet_packet::FiveTuple;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use tracing::{debug, trace};

/// Identifier of a flow, starting at 1.
pub type FlowId = u32;

/// Statistics of a single flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStats {
    /// Packets originated.
    pub tx_packets: u64,
    /// Bytes originated, IP header included.
    pub tx_bytes: u64,
    /// Packets delivered to the destination host.
    pub rx_packets: u64,
    /// Bytes delivered, IP header included.
    pub rx_bytes: u64,
    /// Packets dropped in the network or still in flight after the grace period.
    pub lost_packets: u64,
    /// Number of times any packet of this flow was relayed.
    pub times_forwarded: u64,
    /// Sum of end-to-end delays of received packets, in seconds.
    pub delay_sum: f64,
    /// Sum of absolute delay differences between consecutive receptions, in seconds.
    pub jitter_sum: f64,
    /// Delay of the most recently received packet, in seconds.
    pub last_delay: Option<f64>,
    /// Time of the first transmission, in seconds.
    pub time_first_tx_packet: Option<f64>,
    /// Time of the last transmission, in seconds.
    pub time_last_tx_packet: Option<f64>,
    /// Time of the first reception, in seconds.
    pub time_first_rx_packet: Option<f64>,
    /// Time of the last reception, in seconds.
    pub time_last_rx_packet: Option<f64>,
}

impl FlowStats {
    /// Mean end-to-end delay in seconds.
    pub fn mean_delay(&self) -> Option<f64> {
        (self.rx_packets > 0).then(|| self.delay_sum / self.rx_packets as f64)
    }

    /// Receive throughput in bits per second between first and last reception.
    pub fn rx_throughput_bps(&self) -> Option<f64> {
        let (first, last) = (self.time_first_rx_packet?, self.time_last_rx_packet?);
        (last > first).then(|| self.rx_bytes as f64 * 8.0 / (last - first))
    }
}

/// One row of the final flow table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRecord {
    /// Flow id.
    pub flow_id: FlowId,
    /// Source address.
    pub source_address: Ipv4Addr,
    /// Destination address.
    pub destination_address: Ipv4Addr,
    /// Source port.
    pub source_port: u16,
    /// Destination port.
    pub destination_port: u16,
    /// Transport protocol number.
    pub protocol: u8,
    /// Accumulated statistics.
    #[serde(flatten)]
    pub stats: FlowStats,
}

impl fmt::Display for FlowRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Flow {} ({} -> {}) Tx Bytes: {} Rx Bytes: {} Lost Packets: {} Delay: {} s Jitter: {} s",
            self.flow_id,
            self.source_address,
            self.destination_address,
            self.stats.tx_bytes,
            self.stats.rx_bytes,
            self.stats.lost_packets,
            self.stats.delay_sum,
            self.stats.jitter_sum
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    flow: FlowId,
    sent_at: SimTime,
}

/// Classifies packets into flows and accumulates their statistics.
#[derive(Debug, Default)]
pub struct FlowMonitor {
    classifier: BTreeMap<FiveTuple, FlowId>,
    flows: BTreeMap<FlowId, (FiveTuple, FlowStats)>,
    in_flight: BTreeMap<u64, InFlight>,
    /// Packets counted lost by a drop report. A later delivery of the same
    /// uid (a relay got the frame but the sender never saw its ACK) turns
    /// the loss back into a reception.
    dropped: BTreeMap<u64, InFlight>,
}

impl FlowMonitor {
    /// Create an empty monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one IP-layer observation.
    pub fn observe(&mut self, event: &IpEvent, now: SimTime) {
        match event.kind {
            IpEventKind::Send => self.record_send(&event.packet, now),
            IpEventKind::Forward => self.record_forward(&event.packet),
            IpEventKind::Deliver => self.record_deliver(&event.packet, now),
            IpEventKind::Drop(reason) => {
                if self.record_loss(&event.packet) {
                    debug!(
                        node = %event.node,
                        uid = event.packet.uid,
                        reason = reason.as_label(),
                        "flow packet lost"
                    );
                }
            }
        }
    }

    /// Account an originated packet. Broadcasts are not classified.
    pub fn record_send(&mut self, packet: &Packet, now: SimTime) {
        if packet.is_broadcast() {
            return;
        }
        let tuple = packet.five_tuple();
        let next_id = self.classifier.len() as FlowId + 1;
        let flow = *self.classifier.entry(tuple).or_insert(next_id);
        let (_, stats) = self
            .flows
            .entry(flow)
            .or_insert_with(|| (tuple, FlowStats::default()));

        let t = now.as_secs_f64();
        stats.tx_packets += 1;
        stats.tx_bytes += u64::from(packet.size());
        stats.time_first_tx_packet.get_or_insert(t);
        stats.time_last_tx_packet = Some(t);
        self.in_flight.insert(packet.uid, InFlight { flow, sent_at: now });
        trace!(flow, uid = packet.uid, "flow packet sent");
    }

    /// Account a relay of a tracked packet.
    pub fn record_forward(&mut self, packet: &Packet) {
        if let Some(entry) = self.in_flight.get(&packet.uid) {
            if let Some((_, stats)) = self.flows.get_mut(&entry.flow) {
                stats.times_forwarded += 1;
            }
        }
    }

    /// Account a delivery at the destination host.
    ///
    /// Only the first delivery of a tracked packet counts. A delivery of a
    /// packet already reported dropped reverses that loss.
    pub fn record_deliver(&mut self, packet: &Packet, now: SimTime) {
        let entry = match self.in_flight.remove(&packet.uid) {
            Some(entry) => entry,
            None => {
                let Some(entry) = self.dropped.remove(&packet.uid) else {
                    return;
                };
                if let Some((_, stats)) = self.flows.get_mut(&entry.flow) {
                    stats.lost_packets = stats.lost_packets.saturating_sub(1);
                }
                debug!(uid = packet.uid, "dropped packet delivered after all");
                entry
            }
        };
        let Some((_, stats)) = self.flows.get_mut(&entry.flow) else {
            return;
        };
        let delay = (now - entry.sent_at).as_secs_f64();
        let t = now.as_secs_f64();
        stats.rx_packets += 1;
        stats.rx_bytes += u64::from(packet.size());
        stats.delay_sum += delay;
        if let Some(previous) = stats.last_delay {
            stats.jitter_sum += (delay - previous).abs();
        }
        stats.last_delay = Some(delay);
        stats.time_first_rx_packet.get_or_insert(t);
        stats.time_last_rx_packet = Some(t);
    }

    /// Account a drop of a tracked packet. Returns true if it was tracked.
    pub fn record_loss(&mut self, packet: &Packet) -> bool {
        let Some(entry) = self.in_flight.remove(&packet.uid) else {
            return false;
        };
        if let Some((_, stats)) = self.flows.get_mut(&entry.flow) {
            stats.lost_packets += 1;
        }
        self.dropped.insert(packet.uid, entry);
        true
    }

    /// Count packets sent before `deadline` that are still undelivered as lost.
    ///
    /// Drops reported for those packets become final. Returns the number of
    /// in-flight packets written off.
    pub fn expire_in_flight(&mut self, deadline: SimTime) -> usize {
        self.dropped.retain(|_, entry| entry.sent_at > deadline);
        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.sent_at <= deadline)
            .map(|(uid, _)| *uid)
            .collect();
        for uid in &expired {
            if let Some(entry) = self.in_flight.remove(uid) {
                if let Some((_, stats)) = self.flows.get_mut(&entry.flow) {
                    stats.lost_packets += 1;
                }
            }
        }
        expired.len()
    }

    /// Packets sent but not yet delivered or lost.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Flow id of a 5-tuple, if it has been seen.
    pub fn flow_id(&self, tuple: &FiveTuple) -> Option<FlowId> {
        self.classifier.get(tuple).copied()
    }

    /// Statistics of a flow.
    pub fn stats(&self, flow: FlowId) -> Option<&FlowStats> {
        self.flows.get(&flow).map(|(_, stats)| stats)
    }

    /// Number of flows seen.
    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Flow table ordered by flow id.
    pub fn records(&self) -> Vec<FlowRecord> {
        self.flows
            .iter()
            .map(|(id, (tuple, stats))| FlowRecord {
                flow_id: *id,
                source_address: tuple.source,
                destination_address: tuple.destination,
                source_port: tuple.source_port,
                destination_port: tuple.destination_port,
                protocol: tuple.protocol.number(),
                stats: stats.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manet_common::{DropReason, MacFailureReason, NodeId};
    use manet_packet::{Payload, EPHEMERAL_PORT_START};

    fn request(uid: u64) -> Packet {
        Packet::udp(
            uid,
            (Ipv4Addr::new(10, 1, 1, 1), EPHEMERAL_PORT_START),
            (Ipv4Addr::new(10, 1, 1, 2), 9),
            Payload::Data { len: 1024 },
        )
    }

    fn reply(uid: u64) -> Packet {
        Packet::udp(
            uid,
            (Ipv4Addr::new(10, 1, 1, 2), 9),
            (Ipv4Addr::new(10, 1, 1, 1), EPHEMERAL_PORT_START),
            Payload::Data { len: 1024 },
        )
    }

    fn ip(kind: IpEventKind, packet: Packet) -> IpEvent {
        IpEvent {
            node: NodeId(0),
            packet,
            kind,
        }
    }

    fn secs(s: f64) -> SimTime {
        SimTime::from_secs(s)
    }

    #[test]
    fn test_flow_ids_in_order_of_appearance() {
        let mut monitor = FlowMonitor::new();
        monitor.record_send(&request(1), secs(2.0));
        monitor.record_send(&reply(2), secs(2.01));
        monitor.record_send(&request(3), secs(3.0));

        assert_eq!(monitor.flow_count(), 2);
        assert_eq!(monitor.flow_id(&request(0).five_tuple()), Some(1));
        assert_eq!(monitor.flow_id(&reply(0).five_tuple()), Some(2));
        let stats = monitor.stats(1).unwrap();
        assert_eq!(stats.tx_packets, 2);
        assert_eq!(stats.tx_bytes, 2 * 1052);
    }

    #[test]
    fn test_broadcast_not_classified() {
        let mut monitor = FlowMonitor::new();
        let mut packet = request(1);
        packet.destination = Ipv4Addr::BROADCAST;
        monitor.record_send(&packet, secs(1.0));
        assert_eq!(monitor.flow_count(), 0);
        assert_eq!(monitor.in_flight(), 0);
    }

    #[test]
    fn test_delay_and_jitter() {
        let mut monitor = FlowMonitor::new();
        monitor.observe(&ip(IpEventKind::Send, request(1)), secs(2.0));
        monitor.observe(&ip(IpEventKind::Deliver, request(1)), secs(2.010));
        monitor.observe(&ip(IpEventKind::Send, request(2)), secs(3.0));
        monitor.observe(&ip(IpEventKind::Forward, request(2)), secs(3.005));
        monitor.observe(&ip(IpEventKind::Deliver, request(2)), secs(3.030));
        monitor.observe(&ip(IpEventKind::Send, request(3)), secs(4.0));
        monitor.observe(&ip(IpEventKind::Deliver, request(3)), secs(4.020));

        let stats = monitor.stats(1).unwrap();
        assert_eq!(stats.rx_packets, 3);
        assert_eq!(stats.rx_bytes, 3 * 1052);
        assert_eq!(stats.times_forwarded, 1);
        assert!((stats.delay_sum - 0.060).abs() < 1e-9);
        // |30 - 10| + |20 - 30| ms
        assert!((stats.jitter_sum - 0.030).abs() < 1e-9);
        assert!((stats.mean_delay().unwrap() - 0.020).abs() < 1e-9);
        assert_eq!(stats.time_first_rx_packet, Some(2.010));
    }

    #[test]
    fn test_duplicate_delivery_counted_once() {
        let mut monitor = FlowMonitor::new();
        monitor.record_send(&request(1), secs(2.0));
        monitor.record_deliver(&request(1), secs(2.1));
        monitor.record_deliver(&request(1), secs(2.2));
        assert_eq!(monitor.stats(1).unwrap().rx_packets, 1);
    }

    #[test]
    fn test_drops_and_grace_period_conserve_packets() {
        let mut monitor = FlowMonitor::new();
        for uid in 0..10 {
            monitor.record_send(&request(uid), secs(2.0 + uid as f64));
        }
        for uid in 0..5 {
            monitor.record_deliver(&request(uid), secs(2.5 + uid as f64));
        }
        monitor.observe(
            &ip(IpEventKind::Drop(DropReason::NoRoute), request(5)),
            secs(7.0),
        );
        monitor.observe(
            &ip(IpEventKind::Drop(DropReason::TtlExpired), request(99)),
            secs(7.0),
        );
        assert_eq!(monitor.in_flight(), 4);

        // Packets sent at 8 and 9 s are still within the grace period.
        assert_eq!(monitor.expire_in_flight(secs(7.5)), 2);
        assert_eq!(monitor.in_flight(), 2);
        assert_eq!(monitor.expire_in_flight(secs(30.0)), 2);

        let stats = monitor.stats(1).unwrap();
        assert_eq!(stats.rx_packets + stats.lost_packets, stats.tx_packets);
        assert_eq!(stats.lost_packets, 5);
    }

    #[test]
    fn test_delivery_after_sender_drop_reverses_loss() {
        let mut monitor = FlowMonitor::new();
        let relay = |kind| IpEvent {
            node: NodeId(2),
            packet: request(1),
            kind,
        };
        monitor.observe(&ip(IpEventKind::Send, request(1)), secs(2.0));
        monitor.observe(&relay(IpEventKind::Forward), secs(2.001));
        monitor.observe(
            &ip(
                IpEventKind::Drop(DropReason::MacFailure(MacFailureReason::RetryExhausted)),
                request(1),
            ),
            secs(2.004),
        );
        assert_eq!(monitor.stats(1).unwrap().lost_packets, 1);

        let destination = IpEvent {
            node: NodeId(1),
            packet: request(1),
            kind: IpEventKind::Deliver,
        };
        monitor.observe(&destination, secs(2.005));
        let stats = monitor.stats(1).unwrap();
        assert_eq!((stats.tx_packets, stats.rx_packets, stats.lost_packets), (1, 1, 0));
        assert_eq!(stats.times_forwarded, 1);
        assert!((stats.delay_sum - 0.005).abs() < 1e-9);

        // A second copy neither counts again nor disturbs the totals.
        monitor.observe(&destination, secs(2.006));
        assert_eq!(monitor.stats(1).unwrap().rx_packets, 1);
        assert_eq!(monitor.expire_in_flight(secs(30.0)), 0);
        assert_eq!(monitor.stats(1).unwrap().lost_packets, 0);
    }

    #[test]
    fn test_drop_final_after_expiry() {
        let mut monitor = FlowMonitor::new();
        monitor.record_send(&request(1), secs(2.0));
        assert!(monitor.record_loss(&request(1)));
        assert!(!monitor.record_loss(&request(1)));
        monitor.expire_in_flight(secs(31.0));
        monitor.record_deliver(&request(1), secs(31.5));

        let stats = monitor.stats(1).unwrap();
        assert_eq!((stats.rx_packets, stats.lost_packets), (0, 1));
    }

    #[test]
    fn test_report_line() {
        let mut monitor = FlowMonitor::new();
        monitor.record_send(&request(1), secs(2.0));
        monitor.record_deliver(&request(1), secs(2.5));
        let records = monitor.records();
        assert_eq!(
            records[0].to_string(),
            "Flow 1 (10.1.1.1 -> 10.1.1.2) Tx Bytes: 1052 Rx Bytes: 1052 Lost Packets: 0 Delay: 0.5 s Jitter: 0 s"
        );

        let json = serde_json::to_value(&records[0]).unwrap();
        assert_eq!(json["flowId"], 1);
        assert_eq!(json["sourceAddress"], "10.1.1.1");
        assert_eq!(json["txBytes"], 1052);
        assert_eq!(json["lostPackets"], 0);
    }
}
