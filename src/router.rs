//! The router core: ingress, verification, route resolution, ZPRN
//! dispatch and the periodic maintenance pass.
//!
//! The router thread owns every mutable table (peer registry, routes,
//! ping cache, local address sets) and is the only one to touch them; the
//! sender thread only ever sees peer handles embedded in its queue items.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{error, info, warn};

use crate::addr::{InnerAddr, LocalAddr};
use crate::config::Config;
use crate::error::SetupError;
use crate::icmp::{self, IcmpError};
use crate::nic;
use crate::packet::{
    IcmpView, Ipv4View, Ipv6View, ICMP4_ECHO, ICMP4_ECHO_REPLY, ICMP6_ECHO, ICMP6_ECHO_REPLY,
    ICMP_HDR_LEN, IPPROTO_ICMP, IPPROTO_ICMPV6, IPV4_HDR_LEN, IPV6_HDR_LEN, IP_DF, MAX_TTL,
};
use crate::peer::{cmp_peers, insert_sorted, lookup_or_insert, remove_peer, unix_secs, Peer, PeerHandle};
use crate::ping::{EchoFlow, PingCache};
use crate::resolve::{resolve_hostname, resolve_inner_addrs, run_peer_hooks, run_route_hooks};
use crate::routes::RoutesTable;
use crate::sender::{SendData, Sender, ZprnSendData};
use crate::zprn::{
    ZprnEntry, CMD_CONNMGMT, CMD_PROBE, CMD_ROUTEMOD, CONNMGMT_CLOSE, CONNMGMT_OPEN,
    PRIO_WITHDRAW, PROBE_RESPONSE, PROBE_TO_OTHERS, PROBE_TO_ROUTERS, ZPRN_HDR_LEN,
    ZPRN_VERSION,
};

/// Set by SIGINT/SIGTERM; the event loop exits at the next wakeup.
pub static SHUTDOWN: AtomicBool = AtomicBool::new(false);
/// Set by SIGUSR1; the event loop prints the peer and routing tables.
pub static DUMP_TABLES: AtomicBool = AtomicBool::new(false);

const TUN_TOKEN: Token = Token(0);
const UDP4_TOKEN: Token = Token(1);
const UDP6_TOKEN: Token = Token(2);

// read buffer, must exceed the TUN MTU
const BUF_SIZE: usize = 0xffff;

/// All router-thread state.
pub struct Router {
    cfg: Config,
    poll: Poll,
    tun: File,
    sock4: mio::net::UdpSocket,
    sock6: Option<mio::net::UdpSocket>,
    sender: Sender,
    remotes: Vec<PeerHandle>,
    routes: RoutesTable,
    locals: Vec<LocalAddr>,
    exported_locals: HashSet<InnerAddr>,
    blocked_broadcast_dsts: HashSet<InnerAddr>,
    ping_cache: PingCache,
    local_peer: PeerHandle,
    now: u64,
    last_cleanup: u64,
}

impl Router {
    /// Bring the node up: TUN device, host network config, sockets,
    /// configured remotes, privilege drop and the sender thread.
    pub fn init(mut cfg: Config) -> Result<Router, SetupError> {
        nic::redirect_stdin()?;

        let (tun, ifname) = nic::tun_alloc(&cfg.iface)?;
        cfg.iface = ifname;
        let dev = format!(" dev '{}'", cfg.iface);

        nic::runcmd(&format!("ip addr flush{dev}"))?;
        let mut locals = Vec::new();
        if !cfg.addrs.is_empty() {
            for a in &cfg.addrs {
                nic::runcmd(&format!("ip addr add '{a}'{dev}"))?;
            }
            locals = nic::scan_local_addrs(&cfg.iface)?;
            if locals.is_empty() {
                return Err(SetupError::Startup(
                    "failed to get local endpoint information via getifaddrs()".into(),
                ));
            }
        }

        let exported_locals: HashSet<InnerAddr> =
            resolve_inner_addrs(&cfg.exported_addrs, "exported local", cfg.preferred_af)
                .into_iter()
                .collect();
        let blocked_broadcast_dsts: HashSet<InnerAddr> = resolve_inner_addrs(
            &cfg.blocked_broadcasts,
            "blocked broadcast destination",
            cfg.preferred_af,
        )
        .into_iter()
        .collect();

        nic::runcmd(&format!("ip link set{dev} mtu 1472"))?;
        nic::runcmd(&format!("ip link set{dev} up"))?;
        for hook in &cfg.iface_hooks {
            nic::runcmd(&format!("{hook}{dev}"))?;
        }

        if let Some(user) = cfg.run_as_user.clone() {
            nic::drop_privileges(&user)?;
        }

        let mut remotes = Vec::new();
        for (cent, host) in cfg.remotes.iter().enumerate() {
            connect_remote(&cfg, &mut remotes, host, cent);
        }
        if remotes.is_empty() && !cfg.remotes.is_empty() {
            return Err(SetupError::Startup(
                "can't connect to any configured remote".into(),
            ));
        }

        let sock4 = nic::bind_udp(false, cfg.data_port)?;
        let sock6 = match nic::bind_udp(true, cfg.data_port) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("no IPv6 data socket: {e}");
                None
            }
        };

        let sender = Sender::spawn(
            tun.try_clone()?,
            sock4.try_clone()?,
            sock6.as_ref().map(|s| s.try_clone()).transpose()?,
        );

        let poll = Poll::new()?;
        poll.registry().register(
            &mut SourceFd(&tun.as_raw_fd()),
            TUN_TOKEN,
            Interest::READABLE,
        )?;
        let mut sock4 = mio::net::UdpSocket::from_std(sock4);
        poll.registry()
            .register(&mut sock4, UDP4_TOKEN, Interest::READABLE)?;
        let mut sock6 = sock6.map(mio::net::UdpSocket::from_std);
        if let Some(s6) = sock6.as_mut() {
            poll.registry().register(s6, UDP6_TOKEN, Interest::READABLE)?;
        }

        let now = unix_secs();
        Ok(Router {
            cfg,
            poll,
            tun,
            sock4,
            sock6,
            sender,
            remotes,
            routes: RoutesTable::new(),
            locals,
            exported_locals,
            blocked_broadcast_dsts,
            ping_cache: PingCache::new(),
            local_peer: Peer::local(),
            now,
            last_cleanup: now,
        })
    }

    /// The event loop. Returns when [`SHUTDOWN`] is raised, or with an
    /// error on an unrecoverable poll/TUN failure.
    pub fn run(&mut self) -> io::Result<()> {
        // announce ourselves, and pre-install self-routes so the first
        // local packet does not trigger a second advertisement
        self.send_connmgmt(CONNMGMT_OPEN);
        for local in self.locals.clone() {
            self.routes
                .entry(local.addr)
                .add_router(self.local_peer.clone(), 0, self.now);
        }

        let mut events = Events::with_capacity(32);
        let mut buf = vec![0u8; BUF_SIZE];
        let epmax_ms = 1500 * self.cfg.remote_timeout.max(1);

        while !SHUTDOWN.load(Ordering::Relaxed) {
            if DUMP_TABLES.swap(false, Ordering::Relaxed) {
                self.dump_tables();
            }

            let timeout = epmax_ms - rand::random::<u64>() % (epmax_ms / 2).max(1);
            match self
                .poll
                .poll(&mut events, Some(Duration::from_millis(timeout)))
            {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("poll failed: {e}");
                    return Err(e);
                }
            }

            self.now = unix_secs();
            for event in events.iter() {
                match event.token() {
                    TUN_TOKEN => self.drain_tun(&mut buf)?,
                    UDP4_TOKEN => self.drain_udp(false, &mut buf),
                    UDP6_TOKEN => self.drain_udp(true, &mut buf),
                    _ => {}
                }
            }

            if self.now.saturating_sub(self.last_cleanup) > self.cfg.remote_timeout / 4 {
                self.cleanup_pass();
            }
        }
        Ok(())
    }

    /// Announce departure and drain the sender.
    pub fn shutdown(mut self) {
        info!("disconnect from peers");
        self.send_connmgmt(CONNMGMT_CLOSE);
        self.sender.stop();
    }

    fn drain_tun(&mut self, buf: &mut [u8]) -> io::Result<()> {
        loop {
            match (&self.tun).read(buf) {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    let peer = self.local_peer.clone();
                    self.dispatch(peer, &mut buf[..n]);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    // a dead TUN device is unrecoverable
                    error!("read(tun) failed: {e}");
                    return Err(e);
                }
            }
        }
    }

    fn drain_udp(&mut self, v6: bool, buf: &mut [u8]) {
        loop {
            let res = if v6 {
                match &self.sock6 {
                    Some(s) => s.recv_from(buf),
                    None => return,
                }
            } else {
                self.sock4.recv_from(buf)
            };
            match res {
                Ok((0, _)) => continue,
                Ok((n, saddr)) => {
                    let (peer, inserted) = lookup_or_insert(&mut self.remotes, saddr);
                    if inserted {
                        run_peer_hooks(&self.cfg.route_hooks, false, &saddr);
                    }
                    self.dispatch(peer, &mut buf[..n]);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("recvfrom() failed: {e}");
                    return;
                }
            }
        }
    }

    /// Classify one ingress packet by the version nibble and hand it to
    /// the matching path.
    fn dispatch(&mut self, peer: PeerHandle, buf: &mut [u8]) {
        peer.touch(self.now);
        let desc = peer.desc();
        let ipver = if buf.len() < 2 { 0xff } else { buf[0] >> 4 };
        match ipver {
            0 => {
                if !self.handle_zprn(&peer, buf) {
                    error!("got invalid ZPRN packet from {desc}");
                }
            }
            4 => {
                if buf.len() < IPV4_HDR_LEN {
                    error!(
                        "received invalid ip packet (too small, size = {}) from {desc}",
                        buf.len()
                    );
                } else if let Some(len) = self.verify_ipv4(&peer, buf, &desc) {
                    self.route_ipv4(&peer, &mut buf[..len], &desc);
                }
            }
            6 => {
                if buf.len() < IPV6_HDR_LEN {
                    error!(
                        "received invalid ip packet (too small, size = {}) from {desc}",
                        buf.len()
                    );
                } else if let Some(len) = self.verify_ipv6(&peer, buf, &desc) {
                    self.route_ipv6(&peer, &mut buf[..len], &desc);
                }
            }
            v => error!("received a packet with unknown payload type (wrong ip_ver = {v}) from {desc}"),
        }
    }

    /// Is `ia` one of our own addresses?
    fn am_local(&self, ia: &InnerAddr, with_exported: bool) -> bool {
        self.locals.iter().any(|l| l.addr == *ia)
            || (with_exported && self.exported_locals.contains(ia))
    }

    fn local_of_v4(&self) -> Option<&LocalAddr> {
        self.locals.iter().find(|l| l.addr.is_v4())
    }

    fn local_of_v6(&self) -> Option<&LocalAddr> {
        self.locals.iter().find(|l| !l.addr.is_v4())
    }

    fn verify_ipv4(&self, peer: &PeerHandle, buf: &mut [u8], desc: &str) -> Option<usize> {
        let nread = buf.len();
        let view = Ipv4View::parse(buf)?;
        if peer.is_local() && !view.verify_checksum() {
            error!("invalid ipv4 packet (wrong checksum) from local");
            return None;
        }
        let total = view.total_len() as usize;
        if total < IPV4_HDR_LEN || nread < total {
            error!("can't read whole ipv4 packet (too small, size = {nread} of {total}) from {desc}");
            return None;
        }
        if !peer.is_local() && self.am_local(&view.src(), true) {
            warn!(
                "drop packet {} (looped with local as source)",
                view.id()
            );
            return None;
        }
        if nread != total {
            warn!("ipv4 packet size differ (size read {nread} / expected {total}) from {desc}");
        }
        Some(total)
    }

    fn verify_ipv6(&self, peer: &PeerHandle, buf: &mut [u8], desc: &str) -> Option<usize> {
        let nread = buf.len();
        let view = Ipv6View::parse(buf)?;
        let total = view.payload_len() as usize + IPV6_HDR_LEN;
        if nread < total {
            error!("can't read whole ipv6 packet (too small, size = {nread} of {total}) from {desc}");
            return None;
        }
        if !peer.is_local() && self.am_local(&view.src(), true) {
            warn!("drop ipv6 packet (looped with local as source)");
            return None;
        }
        if nread != total {
            warn!("ipv6 packet size differ (size read {nread} / expected {total}) from {desc}");
        }
        Some(total)
    }

    fn route_ipv4(&mut self, source_peer: &PeerHandle, buf: &mut [u8], desc: &str) {
        let (pkid, proto, frag, tos, src, dst, ttl) = {
            let v = match Ipv4View::parse(buf) {
                Some(v) => v,
                None => return,
            };
            (
                v.id(),
                v.protocol(),
                v.frag_off(),
                v.tos(),
                v.src(),
                v.dst(),
                v.ttl(),
            )
        };
        let is_icmp = proto == IPPROTO_ICMP;
        if is_icmp && buf.len() < IPV4_HDR_LEN + ICMP_HDR_LEN {
            warn!(
                "drop packet {pkid} (too small icmp packet; size = {}) from {desc}",
                buf.len()
            );
            return;
        }
        let (icmp_type, echo_id, echo_seq) = if is_icmp {
            let icmp = IcmpView::parse(&buf[IPV4_HDR_LEN..]).unwrap();
            (icmp.typ(), icmp.echo_id(), icmp.echo_seq())
        } else {
            (0, 0, 0)
        };
        let (is_icmp_errmsg, rm_route) = if is_icmp {
            let code = buf[IPV4_HDR_LEN + 1];
            classify_icmp4(icmp_type, code)
        } else {
            (false, false)
        };

        if dst.is_multicast() {
            return;
        }

        let source_is_local = source_peer.is_local();
        let iam_ep = source_is_local || self.am_local(&dst, true);
        let mut ttl = ttl;

        if ttl == 0 || (!iam_ep && ttl == 1) {
            warn!("drop packet {pkid} (too low ttl = {ttl}) from {desc}");
            if !is_icmp_errmsg {
                self.send_icmp4(IcmpError::TtlExceeded, buf, source_peer);
            }
            return;
        }
        if !iam_ep {
            ttl -= 1;
        }
        {
            let mut v = Ipv4View::parse(buf).unwrap();
            v.set_ttl(ttl);
            // the sender recomputes the header checksum right before
            // transmission
            v.zero_checksum();
        }

        let dests =
            self.resolve_route(source_peer, desc, src, dst, ttl, !source_is_local && iam_ep);

        if dests.is_empty() {
            if is_icmp_errmsg {
                return;
            }
            if let Some(local) = self.local_of_v4().copied() {
                let kind = if local.contains(&dst) {
                    IcmpError::HostUnreach
                } else {
                    IcmpError::NetUnreach
                };
                self.send_icmp4(kind, buf, source_peer);
            }
            self.drop_stale_route(&dst);
            return;
        }

        if is_icmp {
            if is_icmp_errmsg {
                if rm_route && buf.len() >= 2 * IPV4_HDR_LEN + ICMP_HDR_LEN {
                    // quoted original header starts after the error header
                    let qoff = IPV4_HDR_LEN + ICMP_HDR_LEN;
                    let target = InnerAddr::V4(buf[qoff + 16..qoff + 20].try_into().unwrap());
                    if let Some(r) = self.routes.have(&target) {
                        if r.del_router(source_peer) {
                            info!("delete route to {target} via {desc} (unreachable)");
                        }
                        if !r.is_empty() {
                            // someone else still routes there; swallow the error
                            return;
                        }
                    }
                }
            } else if dests.len() == 1 {
                let flow = EchoFlow {
                    src,
                    dst,
                    id: echo_id,
                    seq: echo_seq,
                };
                match icmp_type {
                    ICMP4_ECHO => self.ping_cache.init(flow, dests[0].clone(), ttl),
                    ICMP4_ECHO_REPLY => {
                        if let Some(m) = self.ping_cache.match_reply(&flow, source_peer, ttl) {
                            if let Some(r) = self.routes.have(&src) {
                                r.update_router(&m.router, m.hops, m.diff_ms, self.now);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        self.sender.enqueue_data(SendData {
            buffer: buf.to_vec(),
            dests,
            frag,
            tos,
        });
    }

    fn route_ipv6(&mut self, source_peer: &PeerHandle, buf: &mut [u8], desc: &str) {
        let (next, tos, src, dst, hops) = {
            let v = match Ipv6View::parse(buf) {
                Some(v) => v,
                None => return,
            };
            (
                v.next_header(),
                v.traffic_class(),
                v.src(),
                v.dst(),
                v.hop_limit(),
            )
        };
        // extension headers other than a directly-following ICMPv6 are
        // treated as opaque payload
        let is_icmp = next == IPPROTO_ICMPV6;
        if is_icmp && buf.len() < IPV6_HDR_LEN + ICMP_HDR_LEN {
            warn!(
                "drop packet (too small icmp6 packet; size = {}) from {desc}",
                buf.len()
            );
            return;
        }
        let (icmp_type, echo_id, echo_seq) = if is_icmp {
            let icmp = IcmpView::parse(&buf[IPV6_HDR_LEN..]).unwrap();
            (icmp.typ(), icmp.echo_id(), icmp.echo_seq())
        } else {
            (0, 0, 0)
        };
        let is_icmp_errmsg = is_icmp && icmp_type & 0x80 == 0;
        let rm_route = is_icmp_errmsg && matches!(icmp_type, 1 | 3);

        if dst.is_multicast() {
            return;
        }

        let source_is_local = source_peer.is_local();
        let iam_ep = source_is_local || self.am_local(&dst, true);
        let mut hops = hops;

        if hops == 0 || (!iam_ep && hops == 1) {
            warn!("drop packet (too low ttl = {hops}) from {desc}");
            if !is_icmp_errmsg {
                self.send_icmp6(IcmpError::TtlExceeded, buf, source_peer);
            }
            return;
        }
        if !iam_ep {
            hops -= 1;
            Ipv6View::parse(buf).unwrap().set_hop_limit(hops);
        }

        let dests =
            self.resolve_route(source_peer, desc, src, dst, hops, !source_is_local && iam_ep);

        if dests.is_empty() {
            if is_icmp_errmsg {
                return;
            }
            if let Some(local) = self.local_of_v6().copied() {
                let kind = if local.contains(&dst) {
                    IcmpError::HostUnreach
                } else {
                    IcmpError::NetUnreach
                };
                self.send_icmp6(kind, buf, source_peer);
            }
            self.drop_stale_route(&dst);
            return;
        }

        if is_icmp {
            if is_icmp_errmsg {
                let qoff = IPV6_HDR_LEN + ICMP_HDR_LEN;
                if rm_route && buf.len() >= qoff + IPV6_HDR_LEN {
                    let target = InnerAddr::V6(buf[qoff + 24..qoff + 40].try_into().unwrap());
                    if let Some(r) = self.routes.have(&target) {
                        if r.del_router(source_peer) {
                            info!("delete route to {target} via {desc} (unreachable)");
                        }
                        if !r.is_empty() {
                            return;
                        }
                    }
                }
            } else if dests.len() == 1 {
                let flow = EchoFlow {
                    src,
                    dst,
                    id: echo_id,
                    seq: echo_seq,
                };
                match icmp_type {
                    ICMP6_ECHO => self.ping_cache.init(flow, dests[0].clone(), hops),
                    ICMP6_ECHO_REPLY => {
                        if let Some(m) = self.ping_cache.match_reply(&flow, source_peer, hops) {
                            if let Some(r) = self.routes.have(&src) {
                                r.update_router(&m.router, m.hops, m.diff_ms, self.now);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        self.sender.enqueue_data(SendData {
            buffer: buf.to_vec(),
            dests,
            frag: IP_DF,
            tos,
        });
    }

    /// Learn the source route, then work out where the packet goes:
    /// local delivery, the best via-router, a suppressed broadcast, or a
    /// split-horizon flood of every other peer.
    fn resolve_route(
        &mut self,
        source_peer: &PeerHandle,
        desc: &str,
        src: InnerAddr,
        dst: InnerAddr,
        ttl: u8,
        dst_is_local: bool,
    ) -> Vec<PeerHandle> {
        let hops = if self.am_local(&src, false) {
            0
        } else {
            MAX_TTL.saturating_sub(ttl)
        };
        if self
            .routes
            .entry(src)
            .add_router(source_peer.clone(), hops, self.now)
        {
            info!("add route to {src} via {desc}");
        }

        if dst_is_local || (!source_peer.is_local() && dst.is_direct_broadcast()) {
            return vec![self.local_peer.clone()];
        }

        let max_near_rtt = self.cfg.max_near_rtt;
        if let Some(r) = self.routes.have(&dst) {
            // the peer a packet came from cannot be the way toward its
            // destination; such entries are stale
            let mut got_invalid = r.del_router(source_peer);
            if r.head().is_some_and(|h| {
                Arc::ptr_eq(&h.peer, source_peer) || h.peer.same_addr(source_peer)
            }) {
                got_invalid = true;
                r.del_primary_router();
            }
            if got_invalid {
                info!("delete route to {dst} via {desc} (invalid)");
            }
            if !r.is_empty() {
                if max_near_rtt > 0 {
                    r.swap_near_routers(max_near_rtt as f64);
                }
                return vec![r.head().unwrap().peer.clone()];
            }
        }

        if self.blocked_broadcast_dsts.contains(&dst) {
            return Vec::new();
        }

        info!("no known route to {dst}");
        let mut ret = self.remotes.clone();
        remove_peer(&mut ret, source_peer);
        if ret.is_empty() {
            info!("drop packet (no destination) from {desc}");
        }
        ret
    }

    /// Forget the primary route toward `dst`, if any; used when a packet
    /// for `dst` turned out to be undeliverable.
    fn drop_stale_route(&mut self, dst: &InnerAddr) {
        if let Some(r) = self.routes.have(dst) {
            let via = r.head().unwrap().peer.desc();
            info!("delete route to {dst} via {via} (invalid)");
            r.del_primary_router();
        }
    }

    fn send_icmp4(&mut self, kind: IcmpError, orig: &[u8], dest: &PeerHandle) {
        let local = self
            .local_of_v4()
            .map(|l| match l.addr {
                InnerAddr::V4(b) => b,
                InnerAddr::V6(_) => unreachable!(),
            })
            .unwrap_or([0; 4]);
        if let Some(buffer) = icmp::synth_v4(kind, orig, local) {
            self.sender.enqueue_data(SendData {
                buffer,
                dests: vec![dest.clone()],
                frag: 0,
                tos: 0,
            });
        }
    }

    fn send_icmp6(&mut self, kind: IcmpError, orig: &[u8], dest: &PeerHandle) {
        let local = self
            .local_of_v6()
            .map(|l| match l.addr {
                InnerAddr::V6(b) => b,
                InnerAddr::V4(_) => unreachable!(),
            })
            .unwrap_or([0; 16]);
        if let Some(buffer) = icmp::synth_v6(kind, orig, local) {
            self.sender.enqueue_data(SendData {
                buffer,
                dests: vec![dest.clone()],
                frag: IP_DF,
                tos: 0,
            });
        }
    }

    // ---- ZPRN -----------------------------------------------------------

    /// Parse and dispatch a ZPRN packet. Returns false when the packet is
    /// not valid ZPRN at all (wrong magic, version, or too short).
    fn handle_zprn(&mut self, srca: &PeerHandle, buf: &[u8]) -> bool {
        if buf.len() <= ZPRN_HDR_LEN + 2 || buf[0] != 0 || buf[1] != ZPRN_VERSION {
            return false;
        }
        let mut off = ZPRN_HDR_LEN;
        let mut got_least1 = false;
        while off < buf.len() {
            let (entry, used) = match ZprnEntry::decode(&buf[off..]) {
                Ok(x) => x,
                Err(_) => {
                    if !got_least1 {
                        warn!("got empty / incomplete ZPRNv2 packet");
                    }
                    break;
                }
            };
            match entry.cmd {
                CMD_ROUTEMOD => self.on_routemod(srca, &entry),
                CMD_CONNMGMT => self.on_connmgmt(srca, &entry),
                CMD_PROBE => self.on_probe(srca, &entry),
                other => warn!("got unknown ZPRNv2 command ({other:02x})"),
            }
            off += used;
            got_least1 = true;
        }
        true
    }

    fn on_routemod(&mut self, srca: &PeerHandle, d: &ZprnEntry) {
        let dst = d.route;
        if d.prio != PRIO_WITHDRAW {
            // advertisement: one hop farther than the advertiser
            if !self.am_local(&dst, true)
                && self
                    .routes
                    .entry(dst)
                    .add_router(srca.clone(), d.prio + 1, self.now)
            {
                info!(
                    "add route to {dst} via {} with {} hops (notified)",
                    srca.desc(),
                    d.prio + 1
                );
            }
            return;
        }

        // withdrawal
        if let Some(r) = self.routes.have(&dst) {
            if r.del_router(srca) {
                info!("delete route to {dst} via {} (notified)", srca.desc());
            }
        }

        let mut msg = *d;
        if self.am_local(&dst, false) {
            // a route to us is withdrawn, and we know we are here
            msg.prio = 0;
        } else if let Some(r) = self.routes.have(&dst) {
            msg.prio = r.head().unwrap().hops;
        } else {
            return;
        }
        self.send_zprn_msg(msg, Some(srca.clone()));
    }

    fn on_connmgmt(&mut self, srca: &PeerHandle, d: &ZprnEntry) {
        let dst = d.route;
        if d.prio == CONNMGMT_OPEN {
            if !self.am_local(&dst, true)
                && self.routes.entry(dst).add_router(srca.clone(), 1, self.now)
            {
                info!(
                    "add route to {dst} via {} with 1 hops (notified)",
                    srca.desc()
                );
            }
            return;
        }

        // the peer is going away entirely
        for (dest, route) in self.routes.iter_mut() {
            if route.del_router(srca) {
                info!("delete route to {dest} via {} (notified)", srca.desc());
            }
        }
        if let Some(r) = self.routes.have(&dst) {
            r.routers.clear();
            info!("delete route to {dst} via {} (notified)", srca.desc());
        }
    }

    fn on_probe(&mut self, srca: &PeerHandle, d: &ZprnEntry) {
        match d.prio {
            // a probe response is a withdrawal that must not trigger a
            // counter-advertisement
            PROBE_RESPONSE => {
                if let Some(r) = self.routes.have(&d.route) {
                    if r.del_router(srca) {
                        info!("delete route to {} via {} (notified)", d.route, srca.desc());
                    }
                }
            }
            PROBE_TO_OTHERS => self.answer_probe(srca, d, false),
            PROBE_TO_ROUTERS => self.answer_probe(srca, d, true),
            _ => {}
        }
    }

    fn answer_probe(&mut self, srca: &PeerHandle, d: &ZprnEntry, expected_to_have_route: bool) {
        let mut msg = *d;
        let mut do_we_have_route = false;
        if self.am_local(&d.route, false) {
            do_we_have_route = true;
            msg.prio = 0;
        } else if let Some(r) = self.routes.have(&d.route) {
            let head = r.head().unwrap();
            do_we_have_route = true;
            msg.prio = head.hops;
            if msg.prio == 0xff
                || Arc::ptr_eq(&head.peer, srca)
                || head.peer.same_addr(srca)
            {
                do_we_have_route = false;
            }
        }

        if do_we_have_route {
            msg.cmd = CMD_ROUTEMOD;
        } else if !expected_to_have_route {
            return;
        } else {
            // the prober believed we route this: answer with a dead-end
            msg.prio = PROBE_RESPONSE;
        }
        self.sender.enqueue_zprn(ZprnSendData {
            entry: msg,
            dests: vec![srca.clone()],
            confirmed: Some(srca.clone()),
        });
    }

    /// Broadcast a ZPRN message to every remote, with split horizon: a
    /// ROUTEMOD advertisement is never sent back to the advertised
    /// route's own next hop.
    fn send_zprn_msg(&mut self, msg: ZprnEntry, confirmed: Option<PeerHandle>) {
        let mut peers = self.remotes.clone();
        if msg.prio != PRIO_WITHDRAW && msg.cmd == CMD_ROUTEMOD {
            if let Some(r) = self.routes.have(&msg.route) {
                let head = r.head().unwrap().peer.clone();
                remove_peer(&mut peers, &head);
            }
        }
        self.sender.enqueue_zprn(ZprnSendData {
            entry: msg,
            dests: peers,
            confirmed,
        });
    }

    /// Probe a route: ask its routers (who should answer) and everyone
    /// else (who might know better).
    fn send_zprn_probe_req(&mut self, dest: InnerAddr) {
        let mut msg = ZprnEntry {
            cmd: CMD_PROBE,
            prio: PROBE_TO_OTHERS,
            route: dest,
        };
        let mut non_routers = self.remotes.clone();
        if let Some(r) = self.routes.have(&dest) {
            let routers: Vec<PeerHandle> = r.routers.iter().map(|v| v.peer.clone()).collect();
            for p in &routers {
                remove_peer(&mut non_routers, p);
            }
            msg.prio = PROBE_TO_ROUTERS;
            self.sender.enqueue_zprn(ZprnSendData {
                entry: msg,
                dests: routers,
                confirmed: None,
            });
        }
        if !non_routers.is_empty() {
            msg.prio = PROBE_TO_OTHERS;
            self.sender.enqueue_zprn(ZprnSendData {
                entry: msg,
                dests: non_routers,
                confirmed: None,
            });
        }
    }

    fn send_connmgmt(&mut self, prio: u8) {
        let Some(local) = self.locals.first() else {
            return;
        };
        let msg = ZprnEntry {
            cmd: CMD_CONNMGMT,
            prio,
            route: local.addr,
        };
        self.send_zprn_msg(msg, None);
    }

    // ---- periodic maintenance -------------------------------------------

    /// Refresh the registry against the config-re-resolved hostnames.
    /// Returns whether the peer's address could be refreshed.
    fn try_refresh_addr(&self, peer: &PeerHandle) -> bool {
        let Some(cent) = peer.cent() else {
            return false;
        };
        let Some(host) = self.cfg.remotes.get(cent) else {
            return false;
        };
        let Some(sa) = resolve_hostname(host, self.cfg.preferred_af) else {
            return false;
        };
        peer.set_saddr(sa);
        peer.set_port_if_unset(self.cfg.data_port);
        peer.touch(self.now);
        true
    }

    /// The periodic pass: age peers, detect duplicates, purge their
    /// routes, GC the routing table (advertising fresh routes, withdrawing
    /// dead ones, probing quiet ones), discard marked peers, reconnect
    /// lost configured remotes and re-sort the registry.
    fn cleanup_pass(&mut self) {
        let now = self.now;
        let timeout = self.cfg.remote_timeout;
        let mut found_remotes = vec![false; self.cfg.remotes.len()];

        let snapshot = self.remotes.clone();
        for (i, peer) in snapshot.iter().enumerate() {
            if let Some(cent) = peer.cent() {
                if let Some(f) = found_remotes.get_mut(cent) {
                    *f = true;
                }
            }

            let alive = now.saturating_sub(timeout) < peer.seen();
            if alive || self.try_refresh_addr(peer) {
                for other in &snapshot[i + 1..] {
                    if other.is_discarded() || !peer.same_addr(other) {
                        continue;
                    }
                    // duplicate addresses: the config-backed peer wins,
                    // ties keep the earlier handle
                    if peer.cent().is_none() && other.cent().is_some() {
                        peer.mark_discard();
                    } else {
                        other.mark_discard();
                    }
                }
                if !peer.is_discarded() {
                    continue;
                }
            }

            for (dst, route) in self.routes.iter_mut() {
                if route.del_router(peer) {
                    info!("delete route to {dst} via {} (outdated)", peer.desc());
                }
            }
            peer.mark_discard();
        }

        // route GC; collect the control traffic to emit afterwards so the
        // split-horizon lookups see the final table
        let cutoff = now.saturating_sub(2 * timeout);
        let probe_tin = now.saturating_sub(timeout);
        let mut adverts: Vec<(InnerAddr, u8, Option<PeerHandle>)> = Vec::new();
        let mut probes: Vec<InnerAddr> = Vec::new();
        self.routes.retain(|dst, route| {
            route.cleanup(cutoff, |peer| {
                info!("delete route to {dst} via {} (outdated)", peer.desc());
            });
            let empty = route.is_empty();
            if empty || route.fresh_add {
                route.fresh_add = false;
                match route.head() {
                    Some(h) => adverts.push((*dst, h.hops, Some(h.peer.clone()))),
                    None => adverts.push((*dst, PRIO_WITHDRAW, None)),
                }
            } else if route.head().is_some_and(|h| h.seen < probe_tin) {
                probes.push(*dst);
            }
            !empty
        });
        for (dst, prio, confirmed) in adverts {
            self.send_zprn_msg(
                ZprnEntry {
                    cmd: CMD_ROUTEMOD,
                    prio,
                    route: dst,
                },
                confirmed,
            );
            run_route_hooks(&self.cfg.route_hooks, prio == PRIO_WITHDRAW, &dst);
        }
        for dst in probes {
            self.send_zprn_probe_req(dst);
        }

        // discard peers after the table had its chance to notify
        let hooks = self.cfg.route_hooks.clone();
        self.remotes.retain(|p| {
            if p.is_discarded() {
                if let Some(sa) = p.saddr() {
                    run_peer_hooks(&hooks, true, &sa);
                }
                return false;
            }
            true
        });

        // reconnect configured remotes that vanished
        for (cent, seen) in found_remotes.iter().enumerate() {
            if !*seen {
                let host = self.cfg.remotes[cent].clone();
                connect_remote(&self.cfg, &mut self.remotes, &host, cent);
            }
        }

        self.remotes.sort_by(|a, b| cmp_peers(a, b));
        self.last_cleanup = now;
    }

    fn dump_tables(&self) {
        println!("-- connected peers:");
        println!("Peer\t\tSeen\t\tConfig Entry");
        for p in &self.remotes {
            let cent = p
                .cent()
                .and_then(|c| self.cfg.remotes.get(c))
                .map(String::as_str)
                .unwrap_or("");
            println!("{}\t{}s ago\t{cent}", p.desc(), self.now.saturating_sub(p.seen()));
        }
        println!("-- routing table:");
        println!("Destination\tGateway\t\tSeen\t\tLatency\tHops");
        for (dst, route) in self.routes.iter() {
            for v in &route.routers {
                println!(
                    "{dst}\t{}\t{}s ago\t{:4.2}\t{}",
                    v.peer.desc(),
                    self.now.saturating_sub(v.seen),
                    v.latency,
                    v.hops
                );
            }
        }
    }
}

/// Resolve a configured hostname and insert it into the registry.
fn connect_remote(cfg: &Config, remotes: &mut Vec<PeerHandle>, host: &str, cent: usize) {
    let Some(sa) = resolve_hostname(host, cfg.preferred_af) else {
        return;
    };
    let peer = Peer::from_config(sa, cent);
    peer.set_port_if_unset(cfg.data_port);
    info!("connected to remote {}", peer.desc());
    if let Some(sa) = peer.saddr() {
        run_peer_hooks(&cfg.route_hooks, false, &sa);
    }
    insert_sorted(remotes, peer);
}

/// ICMPv4 classification: (is error message, withdraws a route).
/// Echo, router discovery and timestamp messages are not errors; TTL
/// exceeded in transit and host/net unreachable additionally withdraw the
/// route toward the quoted destination.
fn classify_icmp4(typ: u8, code: u8) -> (bool, bool) {
    match typ {
        0 | 8 | 9 | 10 | 13 | 14 => (false, false),
        11 => (true, code == 0),
        3 => (true, matches!(code, 0 | 1)),
        _ => (true, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn icmp4_classification() {
        assert_eq!(classify_icmp4(0, 0), (false, false)); // echo reply
        assert_eq!(classify_icmp4(8, 0), (false, false)); // echo
        assert_eq!(classify_icmp4(13, 0), (false, false)); // timestamp
        assert_eq!(classify_icmp4(11, 0), (true, true)); // ttl exceeded in transit
        assert_eq!(classify_icmp4(11, 1), (true, false)); // frag reassembly
        assert_eq!(classify_icmp4(3, 0), (true, true)); // net unreach
        assert_eq!(classify_icmp4(3, 1), (true, true)); // host unreach
        assert_eq!(classify_icmp4(3, 4), (true, false)); // frag needed
        assert_eq!(classify_icmp4(5, 0), (true, false)); // redirect
    }
}
