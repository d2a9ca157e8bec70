//! Remote peers and the shared peer registry.
//!
//! A peer is identified by its outer UDP socket address. The special
//! "local" peer has no address at all and stands for the TUN side of the
//! router. Peers are shared between the router and sender threads through
//! `Arc` handles; the socket address sits behind a per-peer reader-writer
//! lock because the router may rewrite it when a configured hostname
//! re-resolves while the sender is reading it.

use std::cmp::Ordering;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrd};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

/// Shared handle to a peer record.
pub type PeerHandle = Arc<Peer>;

/// Wall-clock seconds, the time base of all `seen` stamps.
pub fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A known remote, or the local TUN sentinel.
pub struct Peer {
    saddr: RwLock<Option<SocketAddr>>,
    seen: AtomicU64,
    cent: Option<usize>,
    to_discard: AtomicBool,
}

impl Peer {
    /// The local sentinel: represents packets entering/leaving via TUN.
    pub fn local() -> PeerHandle {
        Arc::new(Peer {
            saddr: RwLock::new(None),
            seen: AtomicU64::new(0),
            cent: None,
            to_discard: AtomicBool::new(false),
        })
    }

    /// A peer first observed on the wire.
    pub fn from_saddr(sa: SocketAddr) -> PeerHandle {
        Arc::new(Peer {
            saddr: RwLock::new(Some(sa)),
            seen: AtomicU64::new(unix_secs()),
            cent: None,
            to_discard: AtomicBool::new(false),
        })
    }

    /// A peer created from config entry `cent` (index into the configured
    /// remotes list), eligible for hostname re-resolution.
    pub fn from_config(sa: SocketAddr, cent: usize) -> PeerHandle {
        Arc::new(Peer {
            saddr: RwLock::new(Some(sa)),
            seen: AtomicU64::new(unix_secs()),
            cent: Some(cent),
            to_discard: AtomicBool::new(false),
        })
    }

    /// Snapshot of the socket address; `None` for the local sentinel.
    pub fn saddr(&self) -> Option<SocketAddr> {
        *self.saddr.read()
    }

    pub fn is_local(&self) -> bool {
        self.saddr.read().is_none()
    }

    /// Replace the socket address (hostname re-resolution).
    pub fn set_saddr(&self, sa: SocketAddr) {
        *self.saddr.write() = Some(sa);
    }

    /// Fill in the data port if resolution produced port zero.
    pub fn set_port_if_unset(&self, port: u16) {
        let mut guard = self.saddr.write();
        if let Some(sa) = guard.as_mut() {
            if sa.port() == 0 {
                sa.set_port(port);
            }
        }
    }

    /// Config-entry index, if this peer came from configuration.
    pub fn cent(&self) -> Option<usize> {
        self.cent
    }

    pub fn seen(&self) -> u64 {
        self.seen.load(AtomicOrd::Relaxed)
    }

    /// Record that a packet was accepted from this peer.
    pub fn touch(&self, now: u64) {
        self.seen.store(now, AtomicOrd::Relaxed);
    }

    pub fn is_discarded(&self) -> bool {
        self.to_discard.load(AtomicOrd::Relaxed)
    }

    /// Mark for removal in the next cleanup pass.
    pub fn mark_discard(&self) {
        self.to_discard.store(true, AtomicOrd::Relaxed);
    }

    /// Value equality: same family, address and port (or both local).
    pub fn same_addr(&self, other: &Peer) -> bool {
        self.saddr() == other.saddr()
    }

    /// Human-readable description used in log messages.
    pub fn desc(&self) -> String {
        match self.saddr() {
            Some(sa) => format!("peer {sa}"),
            None => "local".to_owned(),
        }
    }

    fn sort_key(&self) -> (u8, [u8; 16], u16) {
        saddr_sort_key(self.saddr())
    }
}

fn saddr_sort_key(sa: Option<SocketAddr>) -> (u8, [u8; 16], u16) {
    match sa {
        None => (0, [0; 16], 0),
        Some(SocketAddr::V4(v4)) => {
            let mut b = [0u8; 16];
            b[..4].copy_from_slice(&v4.ip().octets());
            (4, b, v4.port())
        }
        Some(SocketAddr::V6(v6)) => (6, v6.ip().octets(), v6.port()),
    }
}

/// Total order over peers by (family, address bytes, port), local first.
/// The registry is kept sorted under this order so ingress lookups can
/// binary-search.
pub fn cmp_peers(a: &Peer, b: &Peer) -> Ordering {
    a.sort_key().cmp(&b.sort_key())
}

/// Look up `sa` in the sorted registry; insert a fresh peer at the right
/// position if it is unknown. Returns the handle and whether it was
/// newly inserted.
pub fn lookup_or_insert(remotes: &mut Vec<PeerHandle>, sa: SocketAddr) -> (PeerHandle, bool) {
    let key = saddr_sort_key(Some(sa));
    match remotes.binary_search_by(|p| p.sort_key().cmp(&key)) {
        Ok(pos) => (remotes[pos].clone(), false),
        Err(pos) => {
            let peer = Peer::from_saddr(sa);
            remotes.insert(pos, peer.clone());
            (peer, true)
        }
    }
}

/// Insert `peer` keeping the registry sorted.
pub fn insert_sorted(remotes: &mut Vec<PeerHandle>, peer: PeerHandle) {
    let key = peer.sort_key();
    let pos = remotes.partition_point(|p| p.sort_key() < key);
    remotes.insert(pos, peer);
}

/// Remove the first entry matching `target` (by handle identity or by
/// address value) from a destination list. Split horizon is implemented
/// with this.
pub fn remove_peer(dests: &mut Vec<PeerHandle>, target: &PeerHandle) -> bool {
    if let Some(pos) = dests
        .iter()
        .position(|p| Arc::ptr_eq(p, target) || p.same_addr(target))
    {
        dests.remove(pos);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sa(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn local_sentinel() {
        let l = Peer::local();
        assert!(l.is_local());
        assert_eq!(l.saddr(), None);
        assert_eq!(l.desc(), "local");
    }

    #[test]
    fn registry_stays_sorted() {
        let mut remotes = Vec::new();
        for s in ["10.0.0.2:45940", "10.0.0.1:45940", "10.0.0.1:45939"] {
            lookup_or_insert(&mut remotes, sa(s));
        }
        let keys: Vec<_> = remotes.iter().map(|p| p.saddr().unwrap()).collect();
        assert_eq!(
            keys,
            vec![
                sa("10.0.0.1:45939"),
                sa("10.0.0.1:45940"),
                sa("10.0.0.2:45940")
            ]
        );
    }

    #[test]
    fn lookup_deduplicates() {
        let mut remotes = Vec::new();
        let (first, inserted) = lookup_or_insert(&mut remotes, sa("10.0.0.1:45940"));
        assert!(inserted);
        let (second, inserted) = lookup_or_insert(&mut remotes, sa("10.0.0.1:45940"));
        assert!(!inserted);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(remotes.len(), 1);
    }

    #[test]
    fn split_horizon_removal() {
        let mut dests = Vec::new();
        lookup_or_insert(&mut dests, sa("10.0.0.1:45940"));
        lookup_or_insert(&mut dests, sa("10.0.0.2:45940"));
        let outside = Peer::from_saddr(sa("10.0.0.1:45940"));
        // removal works by address value even through a different handle
        assert!(remove_peer(&mut dests, &outside));
        assert_eq!(dests.len(), 1);
        assert!(!remove_peer(&mut dests, &outside));
    }

    #[test]
    fn port_fill_only_when_unset() {
        let p = Peer::from_saddr(sa("10.0.0.1:0"));
        p.set_port_if_unset(45940);
        assert_eq!(p.saddr().unwrap().port(), 45940);
        p.set_port_if_unset(1);
        assert_eq!(p.saddr().unwrap().port(), 45940);
    }

    #[test]
    fn seen_and_discard_flags() {
        let p = Peer::from_saddr(sa("10.0.0.1:45940"));
        p.touch(1000);
        assert_eq!(p.seen(), 1000);
        assert!(!p.is_discarded());
        p.mark_discard();
        assert!(p.is_discarded());
    }
}
