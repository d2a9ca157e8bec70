//! ZPRN v2 control protocol framing.
//!
//! ZPRN shares the UDP data port with tunnelled traffic; a packet is
//! recognised as ZPRN by its first byte (the magic, 0x00, which can never
//! begin an IP packet). A packet carries one 4-byte header followed by any
//! number of variable-length entries:
//!
//! ```text
//! header:  magic=0x00  version=0x02  reserved u16
//! entry:   cmd u8  prio u8  addr-type u16 (network order)  addr bytes (4|16)
//! ```

use crate::addr::InnerAddr;
use crate::error::WireError;

/// Protocol version carried in the header.
pub const ZPRN_VERSION: u8 = 2;
/// Wire length of the packet header.
pub const ZPRN_HDR_LEN: usize = 4;

/// Route advertisement / withdrawal.
pub const CMD_ROUTEMOD: u8 = 0x00;
/// Peer connection open / close.
pub const CMD_CONNMGMT: u8 = 0x01;
/// Route probe.
pub const CMD_PROBE: u8 = 0x02;

/// ROUTEMOD prio marking a withdrawal; lower values advertise a hop count.
pub const PRIO_WITHDRAW: u8 = 0xff;
/// CONNMGMT prio: peer announces itself.
pub const CONNMGMT_OPEN: u8 = 0x00;
/// CONNMGMT prio: peer disconnects.
pub const CONNMGMT_CLOSE: u8 = 0x01;
/// PROBE prio: negative response (dead end).
pub const PROBE_RESPONSE: u8 = 0x00;
/// PROBE prio: request sent to peers known to route the address.
pub const PROBE_TO_ROUTERS: u8 = 0xfe;
/// PROBE prio: request sent to all other peers.
pub const PROBE_TO_OTHERS: u8 = 0xff;

/// ZPRN packets are kept under this size so they survive IPv6 paths
/// without fragmentation.
pub const ZPRN_MAX_PACKET: usize = 1232;

/// A single decoded ZPRN entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZprnEntry {
    /// Command code (`CMD_*`)
    pub cmd: u8,
    /// Command-specific priority byte
    pub prio: u8,
    /// The inner address the command refers to
    pub route: InnerAddr,
}

impl ZprnEntry {
    /// Encoded length of this entry: 4 fixed bytes plus the address.
    pub fn wire_len(&self) -> usize {
        4 + self.route.len()
    }

    /// Append the wire form of this entry to `out`. The address-type
    /// field is written in network order.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.cmd);
        out.push(self.prio);
        out.extend_from_slice(&self.route.wire_type().to_be_bytes());
        out.extend_from_slice(self.route.bytes());
    }

    /// Decode one entry from the front of `buf`, returning it together
    /// with the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), WireError> {
        if buf.len() < 4 {
            return Err(WireError::Truncated);
        }
        let cmd = buf[0];
        let prio = buf[1];
        let ty = u16::from_be_bytes([buf[2], buf[3]]);
        let route = match ty {
            4 => {
                if buf.len() < 8 {
                    return Err(WireError::Truncated);
                }
                InnerAddr::V4(buf[4..8].try_into().unwrap())
            }
            6 => {
                if buf.len() < 20 {
                    return Err(WireError::Truncated);
                }
                InnerAddr::V6(buf[4..20].try_into().unwrap())
            }
            other => return Err(WireError::BadAddrType(other)),
        };
        Ok((ZprnEntry { cmd, prio, route }, 4 + route.len()))
    }
}

/// Append a fresh packet header to `out`.
pub fn encode_header(out: &mut Vec<u8>) {
    out.extend_from_slice(&[0, ZPRN_VERSION, 0, 0]);
}

/// Header validity: magic zero and version 2. Other versions are
/// ignored by the router.
pub fn header_valid(buf: &[u8]) -> bool {
    buf.len() >= ZPRN_HDR_LEN && buf[0] == 0 && buf[1] == ZPRN_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_roundtrip_v4() {
        let e = ZprnEntry {
            cmd: CMD_ROUTEMOD,
            prio: 2,
            route: InnerAddr::V4([10, 9, 9, 9]),
        };
        let mut buf = Vec::new();
        e.encode_into(&mut buf);
        assert_eq!(buf.len(), e.wire_len());
        let (d, used) = ZprnEntry::decode(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(d, e);
    }

    #[test]
    fn entry_roundtrip_v6() {
        let mut a = [0u8; 16];
        a[0] = 0xfd;
        a[15] = 1;
        let e = ZprnEntry {
            cmd: CMD_PROBE,
            prio: PROBE_TO_ROUTERS,
            route: InnerAddr::V6(a),
        };
        let mut buf = Vec::new();
        e.encode_into(&mut buf);
        let (d, used) = ZprnEntry::decode(&buf).unwrap();
        assert_eq!(used, 20);
        assert_eq!(d, e);
    }

    #[test]
    fn multi_entry_packet_roundtrip() {
        let entries = [
            ZprnEntry {
                cmd: CMD_ROUTEMOD,
                prio: PRIO_WITHDRAW,
                route: InnerAddr::V4([10, 0, 0, 1]),
            },
            ZprnEntry {
                cmd: CMD_CONNMGMT,
                prio: CONNMGMT_OPEN,
                route: InnerAddr::V4([10, 0, 0, 2]),
            },
            ZprnEntry {
                cmd: CMD_PROBE,
                prio: PROBE_TO_OTHERS,
                route: InnerAddr::V6([0x20; 16]),
            },
        ];
        let mut buf = Vec::new();
        encode_header(&mut buf);
        for e in &entries {
            e.encode_into(&mut buf);
        }
        assert!(header_valid(&buf));

        let mut off = ZPRN_HDR_LEN;
        let mut decoded = Vec::new();
        while off < buf.len() {
            let (e, used) = ZprnEntry::decode(&buf[off..]).unwrap();
            decoded.push(e);
            off += used;
        }
        assert_eq!(decoded, entries);
    }

    #[test]
    fn truncated_entry_rejected() {
        let e = ZprnEntry {
            cmd: CMD_ROUTEMOD,
            prio: 1,
            route: InnerAddr::V6([1; 16]),
        };
        let mut buf = Vec::new();
        e.encode_into(&mut buf);
        assert_eq!(
            ZprnEntry::decode(&buf[..buf.len() - 1]),
            Err(WireError::Truncated)
        );
    }

    #[test]
    fn bad_addr_type_rejected() {
        let buf = [CMD_ROUTEMOD, 0, 0, 5, 1, 2, 3, 4];
        assert_eq!(ZprnEntry::decode(&buf), Err(WireError::BadAddrType(5)));
    }

    #[test]
    fn header_version_gate() {
        assert!(header_valid(&[0, 2, 0, 0]));
        assert!(!header_valid(&[0, 1, 0, 0]));
        assert!(!header_valid(&[1, 2, 0, 0]));
        assert!(!header_valid(&[0, 2, 0]));
    }
}
