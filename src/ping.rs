//! Single-slot cache for measuring per-route round-trip latency.
//!
//! The router records the most recent outgoing ICMP echo together with the
//! via-router it was sent through. When the matching echo reply comes back
//! (source and destination swapped, same id and sequence, same router) the
//! cache yields the measured latency and hop count for that route.

use std::sync::Arc;
use std::time::Instant;

use crate::addr::InnerAddr;
use crate::peer::PeerHandle;

/// The flow identity of an ICMP echo: inner addresses plus id/seq.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EchoFlow {
    pub src: InnerAddr,
    pub dst: InnerAddr,
    pub id: u16,
    pub seq: u16,
}

/// A successful reply match.
pub struct PingMatch {
    /// The via-router the echo was originally sent through
    pub router: PeerHandle,
    /// Measured hop count to the destination
    pub hops: u8,
    /// Round-trip time in milliseconds
    pub diff_ms: f64,
}

/// One-slot echo cache. A new `init` overwrites whatever was pending.
pub struct PingCache {
    epoch: Instant,
    slot: Option<Slot>,
}

struct Slot {
    flow: EchoFlow,
    router: PeerHandle,
    ttl: u8,
    seen_ms: f64,
}

impl PingCache {
    pub fn new() -> Self {
        PingCache {
            epoch: Instant::now(),
            slot: None,
        }
    }

    fn now_ms(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1000.0
    }

    /// Record an outgoing echo request: its flow, the router it was
    /// forwarded through, and its egress TTL.
    pub fn init(&mut self, flow: EchoFlow, router: PeerHandle, ttl: u8) {
        self.slot = Some(Slot {
            flow,
            router,
            ttl,
            seen_ms: self.now_ms(),
        });
    }

    /// Try to match an incoming echo reply against the stored request.
    ///
    /// `flow` is the reply's flow as seen on the wire; it matches when its
    /// addresses are the swap of the stored request and id/seq are equal,
    /// and `router` (the peer the reply arrived from) is the router the
    /// request left through. A match empties the slot.
    pub fn match_reply(
        &mut self,
        flow: &EchoFlow,
        router: &PeerHandle,
        ttl: u8,
    ) -> Option<PingMatch> {
        let slot = self.slot.as_ref()?;
        let flows_match = slot.flow.src == flow.dst
            && slot.flow.dst == flow.src
            && slot.flow.id == flow.id
            && slot.flow.seq == flow.seq;
        let router_match =
            Arc::ptr_eq(&slot.router, router) || slot.router.same_addr(router);
        if !(flows_match && router_match) {
            return None;
        }
        let diff_ms = self.now_ms() - slot.seen_ms;
        let hops = slot.ttl.saturating_sub(ttl).wrapping_add(1);
        let router = slot.router.clone();
        self.slot = None;
        Some(PingMatch {
            router,
            hops,
            diff_ms,
        })
    }
}

impl Default for PingCache {
    fn default() -> Self {
        Self::new()
    }
}
