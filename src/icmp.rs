//! Synthesis of ICMP / ICMPv6 error messages.
//!
//! The router answers TTL expiry and unroutable destinations with the
//! standard error layout: a fresh outer IP header, the 8-byte error header,
//! a copy of the offending packet's IP header, and the first 8 bytes of its
//! payload.

use crate::packet::{
    rfc1071_checksum, ICMP_HDR_LEN, IPPROTO_ICMP, IPPROTO_ICMPV6, IPV4_HDR_LEN, IPV6_HDR_LEN,
    MAX_TTL,
};

/// Which error condition is being reported.
#[derive(Clone, Copy, Debug)]
pub enum IcmpError {
    /// TTL / hop limit exceeded in transit
    TtlExceeded,
    /// Destination host unreachable
    HostUnreach,
    /// Destination network unreachable
    NetUnreach,
}

impl IcmpError {
    fn v4_type_code(self) -> (u8, u8) {
        match self {
            IcmpError::TtlExceeded => (11, 0),
            IcmpError::HostUnreach => (3, 1),
            IcmpError::NetUnreach => (3, 0),
        }
    }

    fn v6_type_code(self) -> (u8, u8) {
        match self {
            IcmpError::TtlExceeded => (3, 0),
            IcmpError::HostUnreach => (1, 0),
            IcmpError::NetUnreach => (1, 3),
        }
    }
}

/// Build an ICMPv4 error about `orig` (a full IPv4 packet), addressed back
/// to its source. `local_src` becomes the outer source address. Returns
/// `None` when `orig` is too short to quote.
///
/// The outer header checksum is left zero; the sender recomputes it before
/// transmission.
pub fn synth_v4(kind: IcmpError, orig: &[u8], local_src: [u8; 4]) -> Option<Vec<u8>> {
    if orig.len() < IPV4_HDR_LEN {
        return None;
    }
    let quoted_payload = orig.len().min(IPV4_HDR_LEN + 8) - IPV4_HDR_LEN;
    let total = 2 * IPV4_HDR_LEN + ICMP_HDR_LEN + quoted_payload;
    let mut b = vec![0u8; total];

    // outer header
    b[0] = 0x45;
    b[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    b[4..6].copy_from_slice(&rand::random::<u16>().to_be_bytes());
    b[8] = MAX_TTL;
    b[9] = IPPROTO_ICMP;
    b[12..16].copy_from_slice(&local_src);
    b[16..20].copy_from_slice(&orig[12..16]); // dst = offender's source

    // error header
    let (typ, code) = kind.v4_type_code();
    b[20] = typ;
    b[21] = code;

    // quoted original header (checksum refreshed) + payload head
    b[28..48].copy_from_slice(&orig[..IPV4_HDR_LEN]);
    b[38] = 0;
    b[39] = 0;
    let quoted_sum = rfc1071_checksum(&b[28..48]);
    b[38..40].copy_from_slice(&quoted_sum.to_be_bytes());
    b[48..48 + quoted_payload]
        .copy_from_slice(&orig[IPV4_HDR_LEN..IPV4_HDR_LEN + quoted_payload]);

    // ICMP checksum covers the whole message
    let sum = rfc1071_checksum(&b[20..]);
    b[22..24].copy_from_slice(&sum.to_be_bytes());
    Some(b)
}

/// Build an ICMPv6 error about `orig` (a full IPv6 packet), addressed back
/// to its source. The checksum is computed over the standard pseudo-header.
pub fn synth_v6(kind: IcmpError, orig: &[u8], local_src: [u8; 16]) -> Option<Vec<u8>> {
    if orig.len() < IPV6_HDR_LEN {
        return None;
    }
    let quoted_payload = orig.len().min(IPV6_HDR_LEN + 8) - IPV6_HDR_LEN;
    let icmp_len = ICMP_HDR_LEN + IPV6_HDR_LEN + quoted_payload;
    let total = IPV6_HDR_LEN + icmp_len;
    let mut b = vec![0u8; total];

    // outer header
    b[0] = 0x60;
    b[4..6].copy_from_slice(&(icmp_len as u16).to_be_bytes());
    b[6] = IPPROTO_ICMPV6;
    b[7] = MAX_TTL;
    b[8..24].copy_from_slice(&local_src);
    b[24..40].copy_from_slice(&orig[8..24]); // dst = offender's source

    // error header
    let (typ, code) = kind.v6_type_code();
    b[40] = typ;
    b[41] = code;

    // quoted original header + payload head
    b[48..88].copy_from_slice(&orig[..IPV6_HDR_LEN]);
    b[88..88 + quoted_payload]
        .copy_from_slice(&orig[IPV6_HDR_LEN..IPV6_HDR_LEN + quoted_payload]);

    // pseudo-header: src, dst, payload length, zero pad, next header 58
    let mut pseudo = Vec::with_capacity(40 + icmp_len);
    pseudo.extend_from_slice(&b[8..40]);
    pseudo.extend_from_slice(&(icmp_len as u32).to_be_bytes());
    pseudo.extend_from_slice(&[0, 0, 0, IPPROTO_ICMPV6]);
    pseudo.extend_from_slice(&b[40..]);
    let sum = rfc1071_checksum(&pseudo);
    b[42..44].copy_from_slice(&sum.to_be_bytes());
    Some(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::fixup_ipv4_checksum;

    fn orig_v4() -> Vec<u8> {
        let mut b = vec![0u8; 30];
        b[0] = 0x45;
        b[2..4].copy_from_slice(&30u16.to_be_bytes());
        b[8] = 1;
        b[9] = 17;
        b[12..16].copy_from_slice(&[10, 1, 1, 1]); // src A
        b[16..20].copy_from_slice(&[10, 2, 2, 2]); // dst B
        fixup_ipv4_checksum(&mut b);
        b[20..30].copy_from_slice(b"XXXXXXXXXX");
        b
    }

    #[test]
    fn v4_ttl_exceeded_layout() {
        let orig = orig_v4();
        let pkt = synth_v4(IcmpError::TtlExceeded, &orig, [192, 168, 1, 1]).unwrap();
        assert_eq!(pkt.len(), 56);
        assert_eq!(pkt[0] >> 4, 4);
        assert_eq!(pkt[8], MAX_TTL);
        assert_eq!(pkt[9], IPPROTO_ICMP);
        assert_eq!(&pkt[12..16], &[192, 168, 1, 1]);
        // addressed back to the offender's source
        assert_eq!(&pkt[16..20], &[10, 1, 1, 1]);
        assert_eq!((pkt[20], pkt[21]), (11, 0));
        // quoted header keeps the original destination
        assert_eq!(&pkt[28 + 16..28 + 20], &[10, 2, 2, 2]);
        // first 8 bytes of original payload
        assert_eq!(&pkt[48..56], b"XXXXXXXX");
        // message checksum folds to zero over the ICMP part
        assert_eq!(rfc1071_checksum(&pkt[20..]), 0);
    }

    #[test]
    fn v4_unreach_codes() {
        let orig = orig_v4();
        let host = synth_v4(IcmpError::HostUnreach, &orig, [192, 168, 1, 1]).unwrap();
        assert_eq!((host[20], host[21]), (3, 1));
        let net = synth_v4(IcmpError::NetUnreach, &orig, [192, 168, 1, 1]).unwrap();
        assert_eq!((net[20], net[21]), (3, 0));
    }

    #[test]
    fn v4_short_payload_quotes_what_exists() {
        let mut orig = orig_v4();
        orig.truncate(23); // 3 payload bytes
        let pkt = synth_v4(IcmpError::TtlExceeded, &orig, [192, 168, 1, 1]).unwrap();
        assert_eq!(pkt.len(), 48 + 3);
        assert_eq!(&pkt[48..51], b"XXX");
    }

    #[test]
    fn v6_layout_and_pseudo_header_checksum() {
        let mut orig = vec![0u8; IPV6_HDR_LEN + 12];
        orig[0] = 0x60;
        orig[4..6].copy_from_slice(&12u16.to_be_bytes());
        orig[6] = 17;
        orig[7] = 1;
        orig[8] = 0xfd; // src fd00::...
        orig[23] = 0x05;
        orig[24] = 0xfd; // dst
        orig[39] = 0x06;
        orig[40..52].copy_from_slice(b"YYYYYYYYYYYY");

        let mut local = [0u8; 16];
        local[0] = 0xfd;
        local[15] = 1;
        let pkt = synth_v6(IcmpError::TtlExceeded, &orig, local).unwrap();
        assert_eq!(pkt.len(), 96);
        assert_eq!(pkt[0] >> 4, 6);
        assert_eq!(pkt[6], IPPROTO_ICMPV6);
        assert_eq!(pkt[7], MAX_TTL);
        assert_eq!(&pkt[8..24], &local);
        assert_eq!(&pkt[24..40], &orig[8..24]);
        assert_eq!((pkt[40], pkt[41]), (3, 0));
        assert_eq!(&pkt[48..88], &orig[..IPV6_HDR_LEN]);
        assert_eq!(&pkt[88..96], b"YYYYYYYY");

        // verifying: pseudo-header sum including the stored checksum is zero
        let icmp_len = pkt.len() - IPV6_HDR_LEN;
        let mut pseudo = Vec::new();
        pseudo.extend_from_slice(&pkt[8..40]);
        pseudo.extend_from_slice(&(icmp_len as u32).to_be_bytes());
        pseudo.extend_from_slice(&[0, 0, 0, IPPROTO_ICMPV6]);
        pseudo.extend_from_slice(&pkt[40..]);
        assert_eq!(rfc1071_checksum(&pseudo), 0);
    }

    #[test]
    fn v6_unreach_codes() {
        let orig = vec![0x60; IPV6_HDR_LEN];
        let host = synth_v6(IcmpError::HostUnreach, &orig, [0; 16]).unwrap();
        assert_eq!((host[40], host[41]), (1, 0));
        let net = synth_v6(IcmpError::NetUnreach, &orig, [0; 16]).unwrap();
        assert_eq!((net[40], net[41]), (1, 3));
    }
}
