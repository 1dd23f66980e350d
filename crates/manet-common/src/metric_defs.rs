//! Metric name definitions shared by the protocol crates and the runner.
//!
//! Protocol crates emit through the `metrics` facade using these names; the
//! runner lists them and installs the recorder.

use std::fmt;

/// Kind of metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonic counter.
    Counter,
    /// Distribution of observed values.
    Histogram,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Histogram => write!(f, "histogram"),
        }
    }
}

/// Unit of a metric's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricUnit {
    /// Plain count.
    Count,
    /// Microseconds.
    Microseconds,
    /// Bytes.
    Bytes,
    /// Decibel-milliwatts.
    Dbm,
}

/// Static description of a metric.
#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    /// Metric name.
    pub name: &'static str,
    /// Human-readable description.
    pub description: &'static str,
    /// Kind of metric.
    pub kind: MetricKind,
    /// Unit of values.
    pub unit: MetricUnit,
    /// Labels emitted in addition to `node`.
    pub labels: &'static [&'static str],
}

impl MetricDef {
    /// Unit as a display string (empty for plain counts).
    pub fn unit_str(&self) -> &'static str {
        match self.unit {
            MetricUnit::Count => "",
            MetricUnit::Microseconds => "us",
            MetricUnit::Bytes => "bytes",
            MetricUnit::Dbm => "dBm",
        }
    }
}

const fn counter(name: &'static str, description: &'static str, labels: &'static [&'static str]) -> MetricDef {
    MetricDef {
        name,
        description,
        kind: MetricKind::Counter,
        unit: MetricUnit::Count,
        labels,
    }
}

// ============================================================================
// MAC / PHY
// ============================================================================

/// Frames put on the air.
pub const MAC_TX_FRAMES: MetricDef = counter("manet.mac.tx_frames", "Frames transmitted", &["frame_type"]);

/// Airtime spent transmitting.
pub const MAC_TX_AIRTIME: MetricDef = MetricDef {
    name: "manet.mac.tx_airtime",
    description: "Total transmit airtime",
    kind: MetricKind::Counter,
    unit: MetricUnit::Microseconds,
    labels: &["frame_type"],
};

/// Frames received intact.
pub const MAC_RX_FRAMES: MetricDef = counter("manet.mac.rx_frames", "Frames received intact", &["frame_type"]);

/// Frames destroyed by overlap or half-duplex.
pub const MAC_RX_COLLIDED: MetricDef = counter("manet.mac.rx_collided", "Frames lost to collisions", &["frame_type"]);

/// Frames below receiver sensitivity.
pub const MAC_RX_WEAK: MetricDef = counter("manet.mac.rx_weak", "Frames below receiver sensitivity", &["frame_type"]);

/// Received signal power.
pub const MAC_RX_POWER: MetricDef = MetricDef {
    name: "manet.mac.rx_power",
    description: "Received power of intact frames",
    kind: MetricKind::Histogram,
    unit: MetricUnit::Dbm,
    labels: &["frame_type"],
};

/// Data frame retransmissions.
pub const MAC_RETRANSMISSIONS: MetricDef = counter("manet.mac.retransmissions", "Unicast retransmissions after ACK timeout", &[]);

/// Frames the MAC gave up on.
pub const MAC_TX_FAILED: MetricDef = counter("manet.mac.tx_failed", "Frames dropped by the MAC", &["reason"]);

/// Backoffs started because the medium was busy.
pub const MAC_BACKOFFS: MetricDef = counter("manet.mac.backoffs", "Backoffs on a busy medium", &[]);

// ============================================================================
// Routing
// ============================================================================

/// HELLO messages originated.
pub const OLSR_HELLO_SENT: MetricDef = counter("manet.olsr.hello_sent", "HELLO messages originated", &[]);

/// TC messages originated.
pub const OLSR_TC_SENT: MetricDef = counter("manet.olsr.tc_sent", "TC messages originated", &[]);

/// TC messages retransmitted as MPR.
pub const OLSR_TC_FORWARDED: MetricDef = counter("manet.olsr.tc_forwarded", "TC messages relayed as MPR", &[]);

/// Routing table recomputations.
pub const OLSR_ROUTE_RECOMPUTATIONS: MetricDef =
    counter("manet.olsr.route_recomputations", "Routing table recomputations", &[]);

// ============================================================================
// IP
// ============================================================================

/// Packets relayed towards another node.
pub const IP_FORWARDED: MetricDef = counter("manet.ip.forwarded", "Packets forwarded", &[]);

/// Packets dropped at the IP layer.
pub const IP_DROPS: MetricDef = counter("manet.ip.drops", "Packets dropped at the IP layer", &["reason"]);

// ============================================================================
// Applications
// ============================================================================

/// Echo requests sent by clients.
pub const APP_ECHO_SENT: MetricDef = counter("manet.app.echo_sent", "Echo requests sent", &[]);

/// Echo replies received by clients.
pub const APP_ECHO_RECEIVED: MetricDef = counter("manet.app.echo_received", "Echo replies received", &[]);

/// Echo requests answered by servers.
pub const APP_ECHO_SERVED: MetricDef = counter("manet.app.echo_served", "Echo requests answered", &[]);

// ============================================================================
// Timing
// ============================================================================

/// Wall-clock time spent in an entity's event handler.
pub const SIMULATION_STEP_TIME: MetricDef = MetricDef {
    name: "manet.timing.step_time",
    description: "Wall-clock time per event handler invocation",
    kind: MetricKind::Histogram,
    unit: MetricUnit::Microseconds,
    labels: &[],
};

/// Every defined metric.
pub const ALL: &[MetricDef] = &[
    MAC_TX_FRAMES,
    MAC_TX_AIRTIME,
    MAC_RX_FRAMES,
    MAC_RX_COLLIDED,
    MAC_RX_WEAK,
    MAC_RX_POWER,
    MAC_RETRANSMISSIONS,
    MAC_TX_FAILED,
    MAC_BACKOFFS,
    OLSR_HELLO_SENT,
    OLSR_TC_SENT,
    OLSR_TC_FORWARDED,
    OLSR_ROUTE_RECOMPUTATIONS,
    IP_FORWARDED,
    IP_DROPS,
    APP_ECHO_SENT,
    APP_ECHO_RECEIVED,
    APP_ECHO_SERVED,
    SIMULATION_STEP_TIME,
];

/// Base labels attached to every per-node metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricLabels {
    /// Node name, e.g. `node0`.
    pub node: String,
}

impl MetricLabels {
    /// Labels for the node with the given index.
    pub fn for_node(index: u32) -> Self {
        MetricLabels {
            node: format!("node{}", index),
        }
    }

    /// Convert to the label list accepted by the `metrics` macros.
    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        vec![("node", self.node.clone())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_metric_names_unique_and_prefixed() {
        let mut seen = HashSet::new();
        for def in ALL {
            assert!(def.name.starts_with("manet."), "{}", def.name);
            assert!(seen.insert(def.name), "duplicate metric {}", def.name);
        }
    }

    #[test]
    fn test_node_labels() {
        let labels = MetricLabels::for_node(3).to_labels();
        assert_eq!(labels, vec![("node", "node3".to_string())]);
    }
}
