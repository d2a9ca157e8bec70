//! The routing table: inner addresses mapped to ordered via-router lists.
//!
//! Each destination keeps a small list of peers it is reachable through,
//! tagged with the measured hop count, the last latency sample and a
//! freshness stamp. The periodic cleanup evicts stale entries and re-sorts
//! the list so the best router sits at the head: fewest hops first, then
//! lowest latency, then most recently seen.

use std::collections::HashMap;
use std::sync::Arc;

use crate::addr::InnerAddr;
use crate::peer::PeerHandle;

/// One way of reaching a destination.
pub struct ViaRouter {
    /// Next hop
    pub peer: PeerHandle,
    /// Last time this entry was refreshed (unix seconds)
    pub seen: u64,
    /// Measured round-trip latency in ms; zero until a ping matched
    pub latency: f64,
    /// Measured hop count (0 = the destination is local)
    pub hops: u8,
}

/// Hop-count update rule: accept the new count unless the jump upward is
/// exactly 0xbe or 0xbf, which shows up when an advertisement loops back
/// through a peer that measured us against a different initial TTL.
fn update_hopcnt(old: &mut u8, new: u8) {
    if new > *old && matches!(new - *old, 0xbe | 0xbf) {
        return;
    }
    *old = new;
}

/// The via-router list for one destination.
#[derive(Default)]
pub struct Route {
    /// Ordered router list; head is the current best
    pub routers: Vec<ViaRouter>,
    /// Set when the route transitioned empty -> non-empty; consumed by the
    /// periodic advertiser
    pub fresh_add: bool,
}

impl Route {
    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }

    /// Current best router, if any.
    pub fn head(&self) -> Option<&ViaRouter> {
        self.routers.first()
    }

    fn find(&mut self, peer: &PeerHandle) -> Option<&mut ViaRouter> {
        self.routers
            .iter_mut()
            .find(|v| Arc::ptr_eq(&v.peer, peer) || v.peer.same_addr(peer))
    }

    /// Add `peer` as a via-router with the given hop count, or refresh the
    /// existing entry. Returns true when a new entry was created.
    pub fn add_router(&mut self, peer: PeerHandle, hops: u8, now: u64) -> bool {
        if self.is_empty() {
            self.fresh_add = true;
        }
        match self.find(&peer) {
            Some(v) => {
                v.seen = now;
                update_hopcnt(&mut v.hops, hops);
                false
            }
            None => {
                self.routers.insert(
                    0,
                    ViaRouter {
                        peer,
                        seen: now,
                        latency: 0.0,
                        hops,
                    },
                );
                true
            }
        }
    }

    /// Refresh an existing entry with a measured hop count and latency.
    /// Unknown peers are ignored.
    pub fn update_router(&mut self, peer: &PeerHandle, hops: u8, latency: f64, now: u64) {
        if let Some(v) = self.find(peer) {
            v.seen = now;
            update_hopcnt(&mut v.hops, hops);
            v.latency = latency;
        }
    }

    /// Remove every entry routed through `peer`. Returns whether anything
    /// was removed.
    pub fn del_router(&mut self, peer: &PeerHandle) -> bool {
        let before = self.routers.len();
        self.routers
            .retain(|v| !(Arc::ptr_eq(&v.peer, peer) || v.peer.same_addr(peer)));
        self.routers.len() != before
    }

    /// Drop the current head.
    pub fn del_primary_router(&mut self) {
        if !self.routers.is_empty() {
            self.routers.remove(0);
        }
    }

    /// Evict entries not seen since `cutoff` (calling `on_removed` for
    /// each), then sort best-first.
    pub fn cleanup(&mut self, cutoff: u64, mut on_removed: impl FnMut(&PeerHandle)) {
        self.routers.retain(|v| {
            if v.seen > cutoff {
                return true;
            }
            on_removed(&v.peer);
            false
        });
        self.routers.sort_by(|a, b| {
            a.hops
                .cmp(&b.hops)
                .then(a.latency.total_cmp(&b.latency))
                .then(b.seen.cmp(&a.seen))
        });
    }

    /// Near-router swap: when the head needs at least two hops anyway and
    /// its successor's latency is within `max_near_rtt` ms, promote the
    /// successor so traffic spreads over effectively-equivalent paths.
    pub fn swap_near_routers(&mut self, max_near_rtt: f64) {
        if self.routers.len() >= 2
            && self.routers[0].hops >= 2
            && (self.routers[0].latency - self.routers[1].latency).abs() <= max_near_rtt
        {
            self.routers.swap(0, 1);
        }
    }
}

/// Map of destination inner address to its route.
#[derive(Default)]
pub struct RoutesTable {
    map: HashMap<InnerAddr, Route>,
}

impl RoutesTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The route for `dst`, created empty on first use.
    pub fn entry(&mut self, dst: InnerAddr) -> &mut Route {
        self.map.entry(dst).or_default()
    }

    /// The route for `dst` only if it has at least one via-router.
    pub fn have(&mut self, dst: &InnerAddr) -> Option<&mut Route> {
        self.map.get_mut(dst).filter(|r| !r.is_empty())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&InnerAddr, &mut Route)> {
        self.map.iter_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&InnerAddr, &Route)> {
        self.map.iter()
    }

    /// Retain only the routes for which `f` returns true.
    pub fn retain(&mut self, f: impl FnMut(&InnerAddr, &mut Route) -> bool) {
        self.map.retain(f);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Peer;

    fn peer(s: &str) -> PeerHandle {
        Peer::from_saddr(s.parse().unwrap())
    }

    #[test]
    fn add_and_refresh() {
        let p = peer("10.0.0.1:45940");
        let mut r = Route::default();
        assert!(r.add_router(p.clone(), 1, 100));
        assert!(r.fresh_add);
        // refresh updates seen/hops without creating a second entry
        assert!(!r.add_router(p.clone(), 2, 200));
        assert_eq!(r.routers.len(), 1);
        assert_eq!(r.routers[0].seen, 200);
        assert_eq!(r.routers[0].hops, 2);
    }

    #[test]
    fn hop_jump_artifacts_ignored() {
        let p = peer("10.0.0.1:45940");
        let mut r = Route::default();
        r.add_router(p.clone(), 1, 100);
        r.add_router(p.clone(), 1 + 0xbe, 101);
        assert_eq!(r.routers[0].hops, 1);
        r.add_router(p.clone(), 1 + 0xbf, 102);
        assert_eq!(r.routers[0].hops, 1);
        // a smaller jump is a legitimate path change
        r.add_router(p.clone(), 1 + 0xbd, 103);
        assert_eq!(r.routers[0].hops, 1 + 0xbd);
        // decreases always win
        r.add_router(p, 1, 104);
        assert_eq!(r.routers[0].hops, 1);
    }

    #[test]
    fn del_router_by_address_value() {
        let p = peer("10.0.0.1:45940");
        let alias = peer("10.0.0.1:45940");
        let mut r = Route::default();
        r.add_router(p, 1, 100);
        assert!(r.del_router(&alias));
        assert!(!r.del_router(&alias));
        assert!(r.is_empty());
    }

    #[test]
    fn cleanup_evicts_and_sorts() {
        let (p1, p2, p3) = (
            peer("10.0.0.1:45940"),
            peer("10.0.0.2:45940"),
            peer("10.0.0.3:45940"),
        );
        let mut r = Route::default();
        r.add_router(p1.clone(), 3, 1000);
        r.add_router(p2.clone(), 1, 400); // stale
        r.add_router(p3.clone(), 1, 1000);
        r.update_router(&p3, 1, 7.5, 1000);

        let mut evicted = Vec::new();
        r.cleanup(500, |p| evicted.push(p.desc()));
        assert_eq!(evicted, vec![p2.desc()]);

        // sorted: fewer hops first, p3 (1 hop) before p1 (3 hops)
        let order: Vec<u8> = r.routers.iter().map(|v| v.hops).collect();
        assert_eq!(order, vec![1, 3]);
    }

    #[test]
    fn cleanup_orders_by_latency_then_recency() {
        let (p1, p2, p3) = (
            peer("10.0.0.1:45940"),
            peer("10.0.0.2:45940"),
            peer("10.0.0.3:45940"),
        );
        let mut r = Route::default();
        r.add_router(p1.clone(), 2, 900);
        r.add_router(p2.clone(), 2, 1000);
        r.add_router(p3.clone(), 2, 950);
        r.update_router(&p1, 2, 4.0, 900);
        r.update_router(&p2, 2, 4.0, 1000);
        r.update_router(&p3, 2, 1.0, 950);

        r.cleanup(0, |_| {});
        // p3 wins on latency; p2 beats p1 on recency at equal latency
        let descs: Vec<_> = r.routers.iter().map(|v| v.peer.desc()).collect();
        assert_eq!(descs, vec![p3.desc(), p2.desc(), p1.desc()]);
    }

    #[test]
    fn near_router_swap() {
        let (p1, p2) = (peer("10.0.0.1:45940"), peer("10.0.0.2:45940"));
        let mut r = Route::default();
        r.add_router(p2.clone(), 2, 100);
        r.add_router(p1.clone(), 2, 100);
        r.update_router(&p1, 2, 10.0, 100);
        r.update_router(&p2, 2, 12.0, 100);
        r.cleanup(0, |_| {});
        assert_eq!(r.head().unwrap().peer.desc(), p1.desc());

        // within 5ms: swapped
        r.swap_near_routers(5.0);
        assert_eq!(r.head().unwrap().peer.desc(), p2.desc());

        // single-hop heads never swap
        let mut direct = Route::default();
        direct.add_router(p2.clone(), 1, 100);
        direct.add_router(p1.clone(), 1, 100);
        direct.swap_near_routers(5.0);
        assert_eq!(direct.head().unwrap().peer.desc(), p1.desc());
    }

    #[test]
    fn fresh_add_lifecycle() {
        let p = peer("10.0.0.1:45940");
        let mut r = Route::default();
        assert!(!r.fresh_add);
        r.add_router(p.clone(), 1, 100);
        assert!(r.fresh_add);
        r.fresh_add = false;
        // re-adding to a non-empty route does not re-arm the flag
        r.add_router(p.clone(), 1, 101);
        assert!(!r.fresh_add);
        r.del_router(&p);
        r.add_router(p, 1, 102);
        assert!(r.fresh_add);
    }

    #[test]
    fn table_have_skips_empty_routes() {
        let dst = InnerAddr::V4([10, 9, 9, 9]);
        let mut t = RoutesTable::new();
        t.entry(dst);
        assert!(t.have(&dst).is_none());
        t.entry(dst).add_router(peer("10.0.0.1:45940"), 1, 100);
        assert!(t.have(&dst).is_some());
    }
}
