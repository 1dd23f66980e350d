//! # manet-packet
//!
//! Packet model for the MANET simulator.
//!
//! This crate provides:
//! - The IPv4/UDP datagram carried between nodes ([`Packet`])
//! - The flow classification key derived from its headers ([`FiveTuple`])
//! - OLSR control message formats with RFC 3626 wire sizes ([`olsr`])
//!
//! Packets are not byte-encoded; every type knows its on-air size so that
//! the MAC can compute airtime and flow accounting can count bytes the way
//! an IP-layer flow classifier would (headers included).

pub mod olsr;

pub use olsr::{
    decode_time, encode_time, seq_newer, Hello, LinkCode, LinkMessage, LinkType, MessageBody,
    NeighborType, OlsrMessage, OlsrPacket, Tc, Willingness,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

// ============================================================================
// Constants
// ============================================================================

/// IPv4 header length in bytes (no options).
pub const IPV4_HEADER_LEN: u32 = 20;

/// UDP header length in bytes.
pub const UDP_HEADER_LEN: u32 = 8;

/// Largest UDP payload that fits in one IPv4 datagram.
pub const MAX_UDP_PAYLOAD: u32 = 65_535 - IPV4_HEADER_LEN - UDP_HEADER_LEN;

/// Default time-to-live for originated packets.
pub const DEFAULT_TTL: u8 = 64;

/// UDP port used by OLSR control traffic.
pub const OLSR_PORT: u16 = 698;

/// First port handed out to client sockets.
pub const EPHEMERAL_PORT_START: u16 = 49153;

// ============================================================================
// Header Types
// ============================================================================

/// Transport protocol carried in the IPv4 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Protocol {
    /// User Datagram Protocol.
    Udp = 17,
}

impl Protocol {
    /// IANA protocol number.
    pub fn number(self) -> u8 {
        self as u8
    }

    /// Returns a lowercase label string suitable for use as a metric label value.
    pub fn as_label(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
        }
    }
}

/// Datagram payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Opaque application bytes; only the length is modelled.
    Data {
        /// Payload length in bytes.
        len: u32,
    },
    /// OLSR control packet.
    Olsr(OlsrPacket),
}

impl Payload {
    /// Payload length in bytes.
    pub fn len(&self) -> u32 {
        match self {
            Payload::Data { len } => *len,
            Payload::Olsr(packet) => packet.wire_size(),
        }
    }

    /// Returns true if the payload carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a lowercase label string suitable for use as a metric label value.
    pub fn as_label(&self) -> &'static str {
        match self {
            Payload::Data { .. } => "data",
            Payload::Olsr(_) => "olsr",
        }
    }
}

// ============================================================================
// Packet
// ============================================================================

/// An IPv4 datagram with a UDP header.
///
/// `uid` is unique per originated packet for the whole simulation and is
/// preserved across forwarding hops, which is what flow accounting keys
/// in-flight packets on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Simulation-wide unique packet identifier.
    pub uid: u64,
    /// Source address.
    pub source: Ipv4Addr,
    /// Destination address.
    pub destination: Ipv4Addr,
    /// Remaining hop budget.
    pub ttl: u8,
    /// Transport protocol.
    pub protocol: Protocol,
    /// UDP source port.
    pub source_port: u16,
    /// UDP destination port.
    pub destination_port: u16,
    /// Datagram payload.
    pub payload: Payload,
}

impl Packet {
    /// Create a UDP datagram with the default TTL.
    pub fn udp(
        uid: u64,
        source: (Ipv4Addr, u16),
        destination: (Ipv4Addr, u16),
        payload: Payload,
    ) -> Self {
        Packet {
            uid,
            source: source.0,
            destination: destination.0,
            ttl: DEFAULT_TTL,
            protocol: Protocol::Udp,
            source_port: source.1,
            destination_port: destination.1,
            payload,
        }
    }

    /// Total size on the wire in bytes (IPv4 + UDP headers + payload).
    pub fn size(&self) -> u32 {
        IPV4_HEADER_LEN + UDP_HEADER_LEN + self.payload.len()
    }

    /// Returns true if the destination is the limited broadcast address.
    pub fn is_broadcast(&self) -> bool {
        self.destination.is_broadcast()
    }

    /// Decrement the TTL for forwarding.
    ///
    /// Returns false if the packet must not be forwarded any further.
    pub fn decrement_ttl(&mut self) -> bool {
        if self.ttl <= 1 {
            self.ttl = 0;
            return false;
        }
        self.ttl -= 1;
        true
    }

    /// Classification key for flow accounting.
    pub fn five_tuple(&self) -> FiveTuple {
        FiveTuple {
            source: self.source,
            destination: self.destination,
            protocol: self.protocol,
            source_port: self.source_port,
            destination_port: self.destination_port,
        }
    }
}

/// Flow classification key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FiveTuple {
    /// Source address.
    pub source: Ipv4Addr,
    /// Destination address.
    pub destination: Ipv4Addr,
    /// Transport protocol.
    pub protocol: Protocol,
    /// Source port.
    pub source_port: u16,
    /// Destination port.
    pub destination_port: u16,
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} ({})",
            self.source,
            self.source_port,
            self.destination,
            self.destination_port,
            self.protocol.as_label()
        )
    }
}
