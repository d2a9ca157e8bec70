//! Inner addresses: the L3 addresses carried inside the tunnel.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// An address found inside a tunnelled packet, v4 or v6.
///
/// Ordering and hashing follow the raw byte representation, with all
/// v4 addresses sorting before all v6 addresses. This is the key type
/// of the routing table and of the exported/blocked address sets.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum InnerAddr {
    /// IPv4, 4 bytes in network order
    V4([u8; 4]),
    /// IPv6, 16 bytes in network order
    V6([u8; 16]),
}

impl InnerAddr {
    /// Byte length of the address (4 or 16).
    pub fn len(&self) -> usize {
        match self {
            InnerAddr::V4(_) => 4,
            InnerAddr::V6(_) => 16,
        }
    }

    /// Whether this is a v4 address.
    pub fn is_v4(&self) -> bool {
        matches!(self, InnerAddr::V4(_))
    }

    /// The on-wire type tag used by ZPRN entries.
    pub fn wire_type(&self) -> u16 {
        match self {
            InnerAddr::V4(_) => 4,
            InnerAddr::V6(_) => 6,
        }
    }

    /// Raw address bytes.
    pub fn bytes(&self) -> &[u8] {
        match self {
            InnerAddr::V4(b) => b,
            InnerAddr::V6(b) => b,
        }
    }

    /// Direct-broadcast predicate: a v4 address whose host byte is all-ones.
    /// v6 has no broadcast addresses.
    pub fn is_direct_broadcast(&self) -> bool {
        match self {
            InnerAddr::V4(b) => b[3] == 0xff,
            InnerAddr::V6(_) => false,
        }
    }

    /// Multicast predicate: v4 224/4, v6 ff00::/8.
    pub fn is_multicast(&self) -> bool {
        match self {
            InnerAddr::V4(b) => b[0] >> 4 == 0xe,
            InnerAddr::V6(b) => b[0] == 0xff,
        }
    }

    /// Convert to a std IP address (for display and hook arguments).
    pub fn to_ip(&self) -> IpAddr {
        match self {
            InnerAddr::V4(b) => IpAddr::V4(Ipv4Addr::from(*b)),
            InnerAddr::V6(b) => IpAddr::V6(Ipv6Addr::from(*b)),
        }
    }
}

impl From<IpAddr> for InnerAddr {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => InnerAddr::V4(v4.octets()),
            IpAddr::V6(v6) => InnerAddr::V6(v6.octets()),
        }
    }
}

impl fmt::Display for InnerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.to_ip().fmt(f)
    }
}

/// An address assigned to the TUN device, with its netmask.
#[derive(Clone, Copy, Debug)]
pub struct LocalAddr {
    /// Interface address
    pub addr: InnerAddr,
    /// Netmask, same family as `addr`
    pub mask: InnerAddr,
}

impl LocalAddr {
    /// Whether `other` falls inside this address/netmask.
    /// Always false across families.
    pub fn contains(&self, other: &InnerAddr) -> bool {
        let (a, m, o) = (self.addr.bytes(), self.mask.bytes(), other.bytes());
        if a.len() != o.len() {
            return false;
        }
        a.iter()
            .zip(m)
            .zip(o)
            .all(|((av, mv), ov)| av & mv == ov & mv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_broadcast_is_v4_only() {
        assert!(InnerAddr::V4([192, 168, 1, 255]).is_direct_broadcast());
        assert!(!InnerAddr::V4([192, 168, 1, 6]).is_direct_broadcast());
        let mut b = [0u8; 16];
        b[15] = 0xff;
        assert!(!InnerAddr::V6(b).is_direct_broadcast());
    }

    #[test]
    fn multicast_predicates() {
        assert!(InnerAddr::V4([224, 0, 0, 1]).is_multicast());
        assert!(InnerAddr::V4([239, 255, 0, 1]).is_multicast());
        assert!(!InnerAddr::V4([223, 0, 0, 1]).is_multicast());

        let mut b = [0u8; 16];
        b[0] = 0xff;
        assert!(InnerAddr::V6(b).is_multicast());
        b[0] = 0xfe;
        assert!(!InnerAddr::V6(b).is_multicast());
    }

    #[test]
    fn ordering_groups_v4_before_v6() {
        let a = InnerAddr::V4([255, 255, 255, 255]);
        let b = InnerAddr::V6([0; 16]);
        assert!(a < b);
    }

    #[test]
    fn local_addr_contains() {
        let l = LocalAddr {
            addr: InnerAddr::V4([192, 168, 1, 1]),
            mask: InnerAddr::V4([255, 255, 255, 0]),
        };
        assert!(l.contains(&InnerAddr::V4([192, 168, 1, 200])));
        assert!(!l.contains(&InnerAddr::V4([192, 168, 2, 200])));
        assert!(!l.contains(&InnerAddr::V6([0; 16])));
    }

    #[test]
    fn display_roundtrip() {
        assert_eq!(InnerAddr::V4([10, 9, 9, 9]).to_string(), "10.9.9.9");
        let v6: InnerAddr = "fd00::1".parse::<IpAddr>().unwrap().into();
        assert_eq!(v6.to_string(), "fd00::1");
    }
}
