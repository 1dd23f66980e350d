//! OLSR control message formats (RFC 3626).
//!
//! Messages are kept structured; [`OlsrPacket::wire_size`] reports the size
//! the RFC layout would occupy so the MAC charges the right airtime.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// OLSR packet header: length (2) + sequence number (2).
pub const PACKET_HEADER_LEN: u32 = 4;

/// Message header: type, vtime, size, originator, ttl, hop count, sequence.
pub const MESSAGE_HEADER_LEN: u32 = 12;

/// HELLO body header: reserved (2) + htime (1) + willingness (1).
pub const HELLO_HEADER_LEN: u32 = 4;

/// Link message header: link code (1) + reserved (1) + size (2).
pub const LINK_MESSAGE_HEADER_LEN: u32 = 4;

/// TC body header: ANSN (2) + reserved (2).
pub const TC_HEADER_LEN: u32 = 4;

/// Size of an IPv4 address in a message body.
pub const ADDRESS_LEN: u32 = 4;

/// Scaling factor C for the validity/emission time encoding (1/16 s).
pub const VTIME_SCALE_FACTOR: f64 = 0.0625;

// ============================================================================
// Time and Sequence Encoding
// ============================================================================

/// Encode a duration in seconds into the RFC 3626 mantissa/exponent byte.
///
/// The value is `C * (1 + a/16) * 2^b` with `a` in the high nibble and `b` in
/// the low nibble. Encoding truncates, so the decoded value never exceeds the
/// input.
pub fn encode_time(seconds: f64) -> u8 {
    let ratio = seconds / VTIME_SCALE_FACTOR;
    if ratio <= 1.0 {
        return 0;
    }
    let mut b = ratio.log2().floor() as i32;
    if b > 15 {
        return 0xFF;
    }
    let mut a = (16.0 * (ratio / 2f64.powi(b) - 1.0)) as i32;
    if a >= 16 {
        b += 1;
        a = 0;
    }
    if b > 15 {
        return 0xFF;
    }
    ((a.clamp(0, 15) as u8) << 4) | (b as u8)
}

/// Decode a mantissa/exponent byte into seconds.
pub fn decode_time(byte: u8) -> f64 {
    let a = (byte >> 4) as f64;
    let b = (byte & 0x0F) as i32;
    VTIME_SCALE_FACTOR * (1.0 + a / 16.0) * 2f64.powi(b)
}

/// Returns true if sequence number `a` is newer than `b`, with wrap-around.
pub fn seq_newer(a: u16, b: u16) -> bool {
    const HALF: u16 = u16::MAX / 2;
    (a > b && a - b <= HALF) || (b > a && b - a > HALF)
}

// ============================================================================
// Link Codes
// ============================================================================

/// Willingness of a node to carry traffic for others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Willingness {
    /// Never selected as MPR.
    Never = 0,
    /// Low willingness.
    Low = 1,
    /// Default willingness.
    Default = 3,
    /// High willingness.
    High = 6,
    /// Always selected as MPR.
    Always = 7,
}

impl Default for Willingness {
    fn default() -> Self {
        Willingness::Default
    }
}

/// Link type (bits 0-1 of the link code).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LinkType {
    /// No link information.
    Unspecified = 0,
    /// Heard, not yet confirmed bidirectional.
    Asymmetric = 1,
    /// Confirmed bidirectional.
    Symmetric = 2,
    /// Link lost.
    Lost = 3,
}

/// Neighbor type (bits 2-3 of the link code).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NeighborType {
    /// Not a symmetric neighbor.
    NotNeighbor = 0,
    /// Symmetric neighbor.
    Symmetric = 1,
    /// Symmetric neighbor selected as MPR.
    Mpr = 2,
}

/// Link code byte of a HELLO link message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LinkCode {
    /// Link type.
    pub link_type: LinkType,
    /// Neighbor type.
    pub neighbor_type: NeighborType,
}

impl LinkCode {
    /// Create a link code.
    pub fn new(link_type: LinkType, neighbor_type: NeighborType) -> Self {
        LinkCode {
            link_type,
            neighbor_type,
        }
    }

    /// Encode as the on-wire byte.
    pub fn to_byte(self) -> u8 {
        ((self.neighbor_type as u8) << 2) | (self.link_type as u8)
    }

    /// Decode from the on-wire byte. Returns None for reserved neighbor types.
    pub fn from_byte(byte: u8) -> Option<Self> {
        let link_type = match byte & 0x03 {
            0 => LinkType::Unspecified,
            1 => LinkType::Asymmetric,
            2 => LinkType::Symmetric,
            _ => LinkType::Lost,
        };
        let neighbor_type = match (byte >> 2) & 0x03 {
            0 => NeighborType::NotNeighbor,
            1 => NeighborType::Symmetric,
            2 => NeighborType::Mpr,
            _ => return None,
        };
        Some(LinkCode::new(link_type, neighbor_type))
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Neighbors sharing one link code inside a HELLO.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkMessage {
    /// Link code shared by all listed neighbors.
    pub link_code: LinkCode,
    /// Neighbor interface addresses.
    pub neighbors: Vec<Ipv4Addr>,
}

/// HELLO message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// Encoded emission interval.
    pub htime: u8,
    /// Sender willingness.
    pub willingness: Willingness,
    /// Link messages grouped by link code.
    pub links: Vec<LinkMessage>,
}

impl Hello {
    /// Link code under which `address` is listed, if any.
    pub fn link_code_for(&self, address: Ipv4Addr) -> Option<LinkCode> {
        self.links
            .iter()
            .find(|group| group.neighbors.contains(&address))
            .map(|group| group.link_code)
    }
}

/// Topology control message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tc {
    /// Advertised neighbor sequence number.
    pub ansn: u16,
    /// Advertised neighbor main addresses.
    pub advertised: Vec<Ipv4Addr>,
}

/// Message body variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Neighbor sensing.
    Hello(Hello),
    /// Topology control.
    Tc(Tc),
}

/// An OLSR message with its common header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OlsrMessage {
    /// Main address of the originator.
    pub originator: Ipv4Addr,
    /// Encoded validity time.
    pub vtime: u8,
    /// Remaining hops.
    pub ttl: u8,
    /// Hops travelled so far.
    pub hop_count: u8,
    /// Per-originator message sequence number.
    pub sequence: u16,
    /// Message body.
    pub body: MessageBody,
}

impl OlsrMessage {
    /// Validity time in seconds.
    pub fn validity_time(&self) -> f64 {
        decode_time(self.vtime)
    }

    /// Size of this message on the wire.
    pub fn wire_size(&self) -> u32 {
        let body = match &self.body {
            MessageBody::Hello(hello) => {
                HELLO_HEADER_LEN
                    + hello
                        .links
                        .iter()
                        .map(|l| LINK_MESSAGE_HEADER_LEN + ADDRESS_LEN * l.neighbors.len() as u32)
                        .sum::<u32>()
            }
            MessageBody::Tc(tc) => TC_HEADER_LEN + ADDRESS_LEN * tc.advertised.len() as u32,
        };
        MESSAGE_HEADER_LEN + body
    }

    /// Returns a lowercase label string suitable for use as a metric label value.
    pub fn as_label(&self) -> &'static str {
        match self.body {
            MessageBody::Hello(_) => "hello",
            MessageBody::Tc(_) => "tc",
        }
    }
}

impl fmt::Display for OlsrMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} from {} seq={} ttl={} hops={}",
            self.as_label().to_uppercase(),
            self.originator,
            self.sequence,
            self.ttl,
            self.hop_count
        )
    }
}

/// An OLSR packet: one or more messages behind a packet header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OlsrPacket {
    /// Per-interface packet sequence number.
    pub sequence: u16,
    /// Contained messages.
    pub messages: Vec<OlsrMessage>,
}

impl OlsrPacket {
    /// Size of this packet on the wire.
    pub fn wire_size(&self) -> u32 {
        PACKET_HEADER_LEN + self.messages.iter().map(|m| m.wire_size()).sum::<u32>()
    }
}
