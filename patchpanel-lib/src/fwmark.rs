//! Packed 32-bit firewall mark shared between the routing layers.
//!
//! The bit layout is a stable contract with shill, which tags its own
//! sockets with the same scheme:
//!
//! ```text
//!  31 30 | 29..26 | 25 | 24 |  23..16  |   15..0
//!  rsvd  |  QoS   | bp | ro |  source  | routing tag
//! ```
//!
//! - bits 0-15: routing tag, derived from the upstream interface index
//! - bits 16-23: traffic source
//! - bit 24: route-on-VPN, bit 25: bypass-VPN
//! - bits 26-29: QoS category
//! - bit 30: legacy SNAT bit, bit 31 reserved
//!
//! Every iptables rule using a fwmark uses a `(value, mask)` pair; the
//! [`Fwmark::with_mask`] rendering produces the `0x…/0x…` argument form.

use std::fmt;

/// Traffic sources tracked per packet. The numeric value is stored in
/// bits 16-23 of the fwmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TrafficSource {
    Unknown = 0,
    System = 1,
    User = 2,
    Arc = 3,
    CrostiniVm = 4,
    ParallelsVm = 5,
    BruschettaVm = 6,
    BorealisVm = 7,
    TetherDownstream = 8,
    WifiDirect = 9,
    WifiLohs = 10,
}

impl TrafficSource {
    fn from_bits(bits: u8) -> TrafficSource {
        match bits {
            1 => TrafficSource::System,
            2 => TrafficSource::User,
            3 => TrafficSource::Arc,
            4 => TrafficSource::CrostiniVm,
            5 => TrafficSource::ParallelsVm,
            6 => TrafficSource::BruschettaVm,
            7 => TrafficSource::BorealisVm,
            8 => TrafficSource::TetherDownstream,
            9 => TrafficSource::WifiDirect,
            10 => TrafficSource::WifiLohs,
            _ => TrafficSource::Unknown,
        }
    }
}

impl fmt::Display for TrafficSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrafficSource::Unknown => "UNKNOWN",
            TrafficSource::System => "SYSTEM",
            TrafficSource::User => "USER",
            TrafficSource::Arc => "ARC",
            TrafficSource::CrostiniVm => "CROSTINI_VM",
            TrafficSource::ParallelsVm => "PARALLELS_VM",
            TrafficSource::BruschettaVm => "BRUSCHETTA_VM",
            TrafficSource::BorealisVm => "BOREALIS_VM",
            TrafficSource::TetherDownstream => "TETHER_DOWNSTREAM",
            TrafficSource::WifiDirect => "WIFI_DIRECT",
            TrafficSource::WifiLohs => "WIFI_LOHS",
        };
        write!(f, "{name}")
    }
}

/// QoS categories applied by the qos_detect chains. Stored in bits 26-29.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum QosCategory {
    Default = 0,
    NetworkControl = 1,
    MultimediaConferencing = 2,
    RealTimeInteractive = 3,
    WebRtc = 4,
}

impl QosCategory {
    fn from_bits(bits: u8) -> QosCategory {
        match bits {
            1 => QosCategory::NetworkControl,
            2 => QosCategory::MultimediaConferencing,
            3 => QosCategory::RealTimeInteractive,
            4 => QosCategory::WebRtc,
            _ => QosCategory::Default,
        }
    }
}

/// A 32-bit SO_MARK / nfmark value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Fwmark(pub u32);

/// Mask covering the routing tag bits.
pub const ROUTING_MASK: Fwmark = Fwmark(0x0000_ffff);
/// Mask covering the traffic source bits.
pub const ALL_SOURCES_MASK: Fwmark = Fwmark(0x00ff_0000);
/// Bit set when the packet must be routed through the VPN.
pub const ROUTE_ON_VPN: Fwmark = Fwmark(0x0100_0000);
/// Bit set when the packet must skip the VPN.
pub const BYPASS_VPN: Fwmark = Fwmark(0x0200_0000);
/// Mask covering both VPN policy bits.
pub const VPN_MASK: Fwmark = Fwmark(0x0300_0000);
/// Mask covering the QoS category bits.
pub const QOS_MASK: Fwmark = Fwmark(0x3c00_0000);
/// Legacy SNAT tagging bit for IPv4 downstream traffic.
pub const LEGACY_SNAT: Fwmark = Fwmark(0x4000_0000);

const SOURCE_SHIFT: u32 = 16;
const VPN_SHIFT: u32 = 24;
const QOS_SHIFT: u32 = 26;

impl Fwmark {
    /// Routing tag for the upstream interface with index `ifindex`.
    /// `None` when the index does not fit the 16 routing bits.
    pub fn from_ifindex(ifindex: u32) -> Option<Fwmark> {
        if ifindex > u32::from(u16::MAX) {
            return None;
        }
        Some(Fwmark(ifindex))
    }

    pub fn from_source(source: TrafficSource) -> Fwmark {
        Fwmark(u32::from(source as u8) << SOURCE_SHIFT)
    }

    pub fn from_qos_category(category: QosCategory) -> Fwmark {
        Fwmark(u32::from(category as u8) << QOS_SHIFT)
    }

    /// Packs a full mark from its components.
    pub fn pack(
        routing_tag: u16,
        source: TrafficSource,
        route_on_vpn: bool,
        bypass_vpn: bool,
        qos: QosCategory,
    ) -> Fwmark {
        let mut value = u32::from(routing_tag);
        value |= u32::from(source as u8) << SOURCE_SHIFT;
        if route_on_vpn {
            value |= 1 << VPN_SHIFT;
        }
        if bypass_vpn {
            value |= 1 << (VPN_SHIFT + 1);
        }
        value |= u32::from(qos as u8) << QOS_SHIFT;
        Fwmark(value)
    }

    pub fn routing_tag(self) -> u16 {
        (self.0 & ROUTING_MASK.0) as u16
    }

    pub fn source(self) -> TrafficSource {
        TrafficSource::from_bits(((self.0 & ALL_SOURCES_MASK.0) >> SOURCE_SHIFT) as u8)
    }

    pub fn route_on_vpn(self) -> bool {
        self.0 & ROUTE_ON_VPN.0 != 0
    }

    pub fn bypass_vpn(self) -> bool {
        self.0 & BYPASS_VPN.0 != 0
    }

    pub fn qos_category(self) -> QosCategory {
        QosCategory::from_bits(((self.0 & QOS_MASK.0) >> QOS_SHIFT) as u8)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// Renders the `value/mask` argument accepted by `-m mark --mark` and
    /// `MARK --set-mark`.
    pub fn with_mask(self, mask: Fwmark) -> String {
        format!("{self}/{mask}")
    }
}

impl fmt::Display for Fwmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl std::ops::BitOr for Fwmark {
    type Output = Fwmark;
    fn bitor(self, rhs: Fwmark) -> Fwmark {
        Fwmark(self.0 | rhs.0)
    }
}

/// `value/mask` pair selecting the source bits of `source`.
pub fn source_fwmark_with_mask(source: TrafficSource) -> String {
    Fwmark::from_source(source).with_mask(ALL_SOURCES_MASK)
}

/// `value/mask` pair selecting the QoS bits of `category`.
pub fn qos_fwmark_with_mask(category: QosCategory) -> String {
    Fwmark::from_qos_category(category).with_mask(QOS_MASK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trips() {
        let sources = [
            TrafficSource::Unknown,
            TrafficSource::System,
            TrafficSource::User,
            TrafficSource::Arc,
            TrafficSource::CrostiniVm,
            TrafficSource::ParallelsVm,
            TrafficSource::BruschettaVm,
            TrafficSource::BorealisVm,
            TrafficSource::TetherDownstream,
            TrafficSource::WifiDirect,
            TrafficSource::WifiLohs,
        ];
        let categories = [
            QosCategory::Default,
            QosCategory::NetworkControl,
            QosCategory::MultimediaConferencing,
            QosCategory::RealTimeInteractive,
            QosCategory::WebRtc,
        ];
        for routing in [0u16, 1, 2, 73, 256, u16::MAX] {
            for source in sources {
                for qos in categories {
                    for (ro, bp) in [(false, false), (true, false), (false, true), (true, true)] {
                        let mark = Fwmark::pack(routing, source, ro, bp, qos);
                        assert_eq!(mark.routing_tag(), routing);
                        assert_eq!(mark.source(), source);
                        assert_eq!(mark.route_on_vpn(), ro);
                        assert_eq!(mark.bypass_vpn(), bp);
                        assert_eq!(mark.qos_category(), qos);
                    }
                }
            }
        }
    }

    #[test]
    fn masks_do_not_overlap() {
        assert_eq!(ROUTING_MASK.0 & ALL_SOURCES_MASK.0, 0);
        assert_eq!(ALL_SOURCES_MASK.0 & VPN_MASK.0, 0);
        assert_eq!(VPN_MASK.0 & QOS_MASK.0, 0);
        assert_eq!(QOS_MASK.0 & LEGACY_SNAT.0, 0);
        assert_eq!(VPN_MASK.0, ROUTE_ON_VPN.0 | BYPASS_VPN.0);
    }

    #[test]
    fn ifindex_mark_bounds() {
        assert_eq!(Fwmark::from_ifindex(7), Some(Fwmark(7)));
        assert_eq!(Fwmark::from_ifindex(0xffff), Some(Fwmark(0xffff)));
        assert_eq!(Fwmark::from_ifindex(0x1_0000), None);
    }

    #[test]
    fn mark_mask_rendering() {
        let mark = Fwmark::from_source(TrafficSource::Arc);
        assert_eq!(mark.with_mask(ALL_SOURCES_MASK), "0x00030000/0x00ff0000");
        assert_eq!(
            qos_fwmark_with_mask(QosCategory::RealTimeInteractive),
            "0x0c000000/0x3c000000"
        );
    }
}
