//! # manet-wifi
//!
//! 802.11 adhoc networking for the MANET simulator.
//!
//! This crate provides:
//! - PHY timing parameters per standard ([`WifiStandard`], [`PhyParams`])
//! - Propagation loss and delay ([`propagation`])
//! - The shared medium entity that owns node mobility ([`Channel`])
//! - The per-node CSMA/CA MAC entity ([`WifiMac`])
//! - Collision detection ([`check_collision`])

pub mod channel;
pub mod mac;
pub mod propagation;

pub use channel::{Channel, ChannelConfig};
pub use mac::{MacConfig, WifiMac};
pub use propagation::{deliverable, PropagationConfig, PropagationLossModel, PropagationModel};

use manet_common::SimTime;
use serde::{Deserialize, Serialize};

// ============================================================================
// Frame Overheads
// ============================================================================

/// MAC header (24) + LLC/SNAP (8) + FCS (4) added to every data frame.
pub const DATA_FRAME_OVERHEAD: u32 = 36;

/// Size of an ACK control frame.
pub const ACK_FRAME_SIZE: u32 = 14;

// ============================================================================
// Standards
// ============================================================================

/// Supported 802.11 standards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WifiStandard {
    /// 802.11a, 5 GHz OFDM.
    #[serde(rename = "80211a")]
    Ieee80211a,
    /// 802.11g, 2.4 GHz ERP-OFDM.
    #[serde(rename = "80211g")]
    Ieee80211g,
    /// 802.11n (HT), 2.4 GHz.
    #[default]
    #[serde(rename = "80211n")]
    Ieee80211n,
}

impl WifiStandard {
    /// PHY parameters for this standard.
    pub fn phy_params(self) -> PhyParams {
        match self {
            WifiStandard::Ieee80211a => PhyParams {
                slot: SimTime::from_micros(9),
                sifs: SimTime::from_micros(16),
                preamble: SimTime::from_micros(20),
                data_rate_bps: 6_000_000,
                basic_rate_bps: 6_000_000,
                frequency_hz: 5.18e9,
                cw_min: 15,
                cw_max: 1023,
            },
            WifiStandard::Ieee80211g => PhyParams {
                slot: SimTime::from_micros(9),
                sifs: SimTime::from_micros(10),
                preamble: SimTime::from_micros(20),
                data_rate_bps: 6_000_000,
                basic_rate_bps: 6_000_000,
                frequency_hz: 2.412e9,
                cw_min: 15,
                cw_max: 1023,
            },
            WifiStandard::Ieee80211n => PhyParams {
                slot: SimTime::from_micros(9),
                sifs: SimTime::from_micros(10),
                preamble: SimTime::from_micros(36),
                data_rate_bps: 6_500_000,
                basic_rate_bps: 6_000_000,
                frequency_hz: 2.412e9,
                cw_min: 15,
                cw_max: 1023,
            },
        }
    }

    /// Display name.
    pub fn name(self) -> &'static str {
        match self {
            WifiStandard::Ieee80211a => "802.11a",
            WifiStandard::Ieee80211g => "802.11g",
            WifiStandard::Ieee80211n => "802.11n",
        }
    }
}

/// PHY timing and rate parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PhyParams {
    /// Slot time.
    pub slot: SimTime,
    /// Short interframe space.
    pub sifs: SimTime,
    /// PLCP preamble and header duration.
    pub preamble: SimTime,
    /// Rate for unicast data frames in bit/s.
    pub data_rate_bps: u64,
    /// Rate for broadcast and control frames in bit/s.
    pub basic_rate_bps: u64,
    /// Carrier frequency in Hz.
    pub frequency_hz: f64,
    /// Minimum contention window (slots).
    pub cw_min: u32,
    /// Maximum contention window (slots).
    pub cw_max: u32,
}

impl PhyParams {
    /// DCF interframe space: SIFS + 2 slots.
    pub fn difs(&self) -> SimTime {
        self.sifs + self.slot + self.slot
    }

    /// Airtime of a frame of `size_bytes` at `rate_bps`.
    pub fn airtime(&self, size_bytes: u32, rate_bps: u64) -> SimTime {
        let bits = size_bytes as u64 * 8;
        let payload_ns = (bits * 1_000_000_000).div_ceil(rate_bps.max(1));
        self.preamble + SimTime::from_nanos(payload_ns)
    }

    /// Time to wait for an ACK after the end of a data frame.
    pub fn ack_timeout(&self) -> SimTime {
        self.sifs + self.airtime(ACK_FRAME_SIZE, self.basic_rate_bps) + self.slot + self.slot
    }
}

// ============================================================================
// Collision Detection
// ============================================================================

/// Time span of a frame at one receiver.
#[derive(Debug, Clone)]
pub struct CollisionContext {
    /// First bit arrival.
    pub start_time: SimTime,
    /// Last bit arrival.
    pub end_time: SimTime,
    /// Frame uid.
    pub frame_uid: u64,
}

/// Result of a collision check.
#[derive(Debug, Clone, PartialEq)]
pub enum CollisionResult {
    /// No overlap.
    NoCollision,
    /// Overlaps the frame with the given uid; both are lost.
    BothDestroyed(u64),
}

/// Check an incoming frame against frames already being received.
///
/// There is no capture effect: any overlap destroys both frames.
pub fn check_collision(incoming: &CollisionContext, existing: &[CollisionContext]) -> CollisionResult {
    for other in existing {
        if incoming.start_time < other.end_time && incoming.end_time > other.start_time {
            return CollisionResult::BothDestroyed(other.frame_uid);
        }
    }
    CollisionResult::NoCollision
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_airtime() {
        let phy = WifiStandard::Ieee80211n.phy_params();
        // 1052-byte IP packet + MAC overhead at 6.5 Mbit/s
        let airtime = phy.airtime(1052 + DATA_FRAME_OVERHEAD, phy.data_rate_bps);
        let expected_ns = 36_000 + (1088u64 * 8 * 1_000_000_000).div_ceil(6_500_000);
        assert_eq!(airtime.as_nanos(), expected_ns);
        assert!(airtime.as_millis() >= 1);
    }

    #[test]
    fn test_difs_and_ack_timeout() {
        let phy = WifiStandard::Ieee80211a.phy_params();
        assert_eq!(phy.difs(), SimTime::from_micros(34));
        assert!(phy.ack_timeout() > phy.sifs + phy.airtime(ACK_FRAME_SIZE, phy.basic_rate_bps));
    }

    #[test]
    fn test_collision_no_overlap() {
        let incoming = CollisionContext {
            start_time: SimTime::from_micros(1000),
            end_time: SimTime::from_micros(1500),
            frame_uid: 1,
        };
        let existing = vec![CollisionContext {
            start_time: SimTime::from_micros(0),
            end_time: SimTime::from_micros(1000),
            frame_uid: 0,
        }];
        assert_eq!(check_collision(&incoming, &existing), CollisionResult::NoCollision);
    }

    #[test]
    fn test_collision_overlap() {
        let incoming = CollisionContext {
            start_time: SimTime::from_micros(400),
            end_time: SimTime::from_micros(900),
            frame_uid: 1,
        };
        let existing = vec![CollisionContext {
            start_time: SimTime::from_micros(0),
            end_time: SimTime::from_micros(500),
            frame_uid: 0,
        }];
        assert_eq!(check_collision(&incoming, &existing), CollisionResult::BothDestroyed(0));
    }

    #[test]
    fn test_standard_serde_names() {
        let parsed: WifiStandard = parse_standard("80211g");
        assert_eq!(parsed, WifiStandard::Ieee80211g);
    }

    fn parse_standard(name: &str) -> WifiStandard {
        use serde::de::value::{Error, StrDeserializer};
        use serde::de::IntoDeserializer;
        let de: StrDeserializer<'_, Error> = name.into_deserializer();
        WifiStandard::deserialize(de).expect("valid standard name")
    }
}
