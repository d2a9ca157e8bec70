//! The sender worker: a dedicated thread that serialises all outbound
//! traffic.
//!
//! The router enqueues two kinds of work: raw data packets (tunnelled IP
//! frames, or frames destined for the local TUN) and ZPRN control entries.
//! Both queues share one mutex and condvar. Within a drain pass all data
//! packets go out before any ZPRN packet, and ZPRN entries are batched per
//! destination into buffers capped at the IPv6-safe size.

use std::fs::File;
use std::io::Write;
use std::mem;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{error, warn};

use crate::packet::{fixup_ipv4_checksum, IP_DF};
use crate::peer::PeerHandle;
use crate::zprn::{self, ZprnEntry, ZPRN_MAX_PACKET};

/// A raw packet with its destination peers and outer socket options.
pub struct SendData {
    /// Full packet bytes (inner IP frame)
    pub buffer: Vec<u8>,
    /// Destination peers; empty (or led by the local peer) means "write to
    /// the TUN device"
    pub dests: Vec<PeerHandle>,
    /// IPv4 flags/fragment word in host order; the DF bit steers the outer
    /// don't-fragment option
    pub frag: u16,
    /// Outer TOS / traffic class
    pub tos: u8,
}

/// One ZPRN entry awaiting transmission to a set of peers.
pub struct ZprnSendData {
    /// The control entry
    pub entry: ZprnEntry,
    /// Destination peers
    pub dests: Vec<PeerHandle>,
    /// Peer whose reachability was just confirmed bidirectionally; its
    /// next transmission carries MSG_CONFIRM
    pub confirmed: Option<PeerHandle>,
}

#[derive(Default)]
struct Queues {
    tasks: Vec<SendData>,
    zprn: Vec<ZprnSendData>,
    stop: bool,
}

struct Shared {
    queues: Mutex<Queues>,
    cond: Condvar,
}

/// Handle owned by the router; enqueues work and manages the worker's
/// lifetime.
pub struct Sender {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Sender {
    /// Spawn the worker thread over its own handles to the TUN device and
    /// the UDP sockets.
    pub fn spawn(tun: File, sock4: UdpSocket, sock6: Option<UdpSocket>) -> Sender {
        let shared = Arc::new(Shared {
            queues: Mutex::new(Queues::default()),
            cond: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("sender".to_owned())
            .spawn(move || worker_fn(worker_shared, tun, sock4, sock6))
            .expect("failed to spawn sender thread");
        Sender {
            shared,
            worker: Some(worker),
        }
    }

    /// Queue a data packet. An empty destination list is dropped outright;
    /// a list led by the local peer collapses to "deliver to TUN".
    pub fn enqueue_data(&self, mut dat: SendData) {
        if dat.dests.is_empty() {
            return;
        }
        if dat.dests[0].is_local() {
            dat.dests.clear();
        }
        let mut q = self.shared.queues.lock();
        q.tasks.push(dat);
        drop(q);
        self.shared.cond.notify_one();
    }

    /// Queue a ZPRN entry. Local destinations are stripped; an empty
    /// result is a no-op.
    pub fn enqueue_zprn(&self, mut dat: ZprnSendData) {
        dat.dests.retain(|p| !p.is_local());
        if dat.dests.is_empty() {
            return;
        }
        let mut q = self.shared.queues.lock();
        q.zprn.push(dat);
        drop(q);
        self.shared.cond.notify_one();
    }

    /// Signal shutdown and wait for the worker to drain and exit.
    pub fn stop(mut self) {
        {
            let mut q = self.shared.queues.lock();
            q.stop = true;
        }
        self.shared.cond.notify_all();
        if let Some(h) = self.worker.take() {
            let _ = h.join();
        }
    }
}

/// Remove `peer` from the confirmed set if present; tells the kernel to
/// skip the neighbour-cache revalidation for this transmission.
fn take_confirmed(confirmed: &mut Vec<PeerHandle>, peer: &PeerHandle) -> bool {
    if let Some(pos) = confirmed
        .iter()
        .position(|p| Arc::ptr_eq(p, peer) || p.same_addr(peer))
    {
        confirmed.swap_remove(pos);
        true
    } else {
        false
    }
}

fn sockaddr_of(sa: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: zeroed sockaddr_storage is a valid "empty" value; we only
    // overlay the matching family struct.
    let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match sa {
        SocketAddr::V4(v4) => {
            let out = unsafe { &mut *(&mut ss as *mut _ as *mut libc::sockaddr_in) };
            out.sin_family = libc::AF_INET as libc::sa_family_t;
            out.sin_port = v4.port().to_be();
            out.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let out = unsafe { &mut *(&mut ss as *mut _ as *mut libc::sockaddr_in6) };
            out.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            out.sin6_port = v6.port().to_be();
            out.sin6_addr.s6_addr = v6.ip().octets();
            out.sin6_scope_id = v6.scope_id();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (ss, len as libc::socklen_t)
}

struct Wire {
    tun: File,
    sock4: UdpSocket,
    sock6: Option<UdpSocket>,
    df: bool,
    tos: u8,
    got_error: bool,
}

impl Wire {
    /// Flip the outer don't-fragment behavior of the v4 socket. The v6
    /// socket never fragments locally, matching the original DF-on wire
    /// behavior.
    fn set_df(&mut self, df: bool) {
        let val: libc::c_int = if df {
            libc::IP_PMTUDISC_WANT
        } else {
            libc::IP_PMTUDISC_DONT
        };
        // SAFETY: setsockopt on an owned socket fd with a c_int value.
        let rc = unsafe {
            libc::setsockopt(
                self.sock4.as_raw_fd(),
                libc::IPPROTO_IP,
                libc::IP_MTU_DISCOVER,
                &val as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            warn!(
                "SENDER WARNING: setsockopt(IP_MTU_DISCOVER) failed: {}",
                std::io::Error::last_os_error()
            );
        } else {
            self.df = df;
        }
    }

    fn set_tos(&mut self, tos: u8) {
        self.tos = tos;
        let val: libc::c_int = tos as libc::c_int;
        // SAFETY: as above.
        let rc = unsafe {
            libc::setsockopt(
                self.sock4.as_raw_fd(),
                libc::IPPROTO_IP,
                libc::IP_TOS,
                &val as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            warn!(
                "SENDER WARNING: setsockopt(IP_TOS) failed: {}",
                std::io::Error::last_os_error()
            );
            self.got_error = true;
        }
        if let Some(s6) = &self.sock6 {
            // SAFETY: as above.
            let rc = unsafe {
                libc::setsockopt(
                    s6.as_raw_fd(),
                    libc::IPPROTO_IPV6,
                    libc::IPV6_TCLASS,
                    &val as *const _ as *const libc::c_void,
                    mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rc < 0 {
                warn!(
                    "SENDER WARNING: setsockopt(IPV6_TCLASS) failed: {}",
                    std::io::Error::last_os_error()
                );
                self.got_error = true;
            }
        }
    }

    /// Transmit `buf` to one peer on the socket of its address family.
    fn sendto_peer(&mut self, peer: &PeerHandle, buf: &[u8], confirm: bool) {
        let Some(sa) = peer.saddr() else {
            error!(
                "SENDER INTERNAL ERROR: destination peer is local, size = {}",
                buf.len()
            );
            return;
        };
        let sock = match sa {
            SocketAddr::V4(_) => &self.sock4,
            SocketAddr::V6(_) => match &self.sock6 {
                Some(s) => s,
                None => {
                    error!(
                        "SENDER INTERNAL ERROR: no socket for destination family of {sa}, size = {}",
                        buf.len()
                    );
                    return;
                }
            },
        };
        let flags = if confirm { libc::MSG_CONFIRM } else { 0 };
        let (ss, slen) = sockaddr_of(&sa);
        // SAFETY: buf and ss are valid for the duration of the call.
        let rc = unsafe {
            libc::sendto(
                sock.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                flags,
                &ss as *const _ as *const libc::sockaddr,
                slen,
            )
        };
        if rc < 0 {
            if !self.got_error {
                warn!("sendto({sa}) failed: {}", std::io::Error::last_os_error());
            }
            self.got_error = true;
        }
    }
}

fn worker_fn(shared: Arc<Shared>, tun: File, sock4: UdpSocket, sock6: Option<UdpSocket>) {
    let mut wire = Wire {
        tun,
        sock4,
        sock6,
        df: false,
        tos: 0,
        got_error: false,
    };
    wire.set_df(false);
    wire.set_tos(0);

    let mut confirmed: Vec<PeerHandle> = Vec::new();

    loop {
        let (mut tasks, zprn_msgs) = {
            let mut q = shared.queues.lock();
            shared
                .cond
                .wait_while(&mut q, |q| !q.stop && q.tasks.is_empty() && q.zprn.is_empty());
            if q.tasks.is_empty() && q.zprn.is_empty() {
                return; // stop requested and nothing left to drain
            }
            (mem::take(&mut q.tasks), mem::take(&mut q.zprn))
        };

        wire.got_error = false;

        for dat in &mut tasks {
            fixup_ipv4_checksum(&mut dat.buffer);

            if dat.dests.is_empty() {
                // local delivery
                if let Err(e) = (&wire.tun).write(&dat.buffer) {
                    wire.got_error = true;
                    warn!("write(tun) failed: {e}");
                }
                continue;
            }

            if wire.tos != dat.tos {
                wire.set_tos(dat.tos);
            }
            let want_df = dat.frag & IP_DF != 0;
            if wire.df != want_df {
                wire.set_df(want_df);
            }

            for peer in &dat.dests {
                let confirm = take_confirmed(&mut confirmed, peer);
                wire.sendto_peer(peer, &dat.buffer, confirm);
            }
        }

        if zprn_msgs.is_empty() {
            continue;
        }
        drop(tasks);

        // control traffic goes out with neutral socket options
        if wire.df {
            wire.set_df(false);
        }
        if wire.tos != 0 {
            wire.set_tos(0);
        }

        if let [single] = &zprn_msgs[..] {
            // single-message fast path: no per-destination bucketing
            let mut buf = Vec::with_capacity(zprn::ZPRN_HDR_LEN + single.entry.wire_len());
            zprn::encode_header(&mut buf);
            single.entry.encode_into(&mut buf);
            if let Some(c) = &single.confirmed {
                confirmed.push(c.clone());
            }
            for peer in &single.dests {
                let confirm = take_confirmed(&mut confirmed, peer);
                wire.sendto_peer(peer, &buf, confirm);
            }
            continue;
        }

        // batch entries per destination, splitting buffers at the
        // fragmentation-safe limit
        let mut buckets: Vec<(PeerHandle, Vec<Vec<u8>>)> = Vec::new();
        for msg in &zprn_msgs {
            if let Some(c) = &msg.confirmed {
                confirmed.push(c.clone());
            }
            for peer in &msg.dests {
                let idx = match buckets
                    .iter()
                    .position(|(p, _)| Arc::ptr_eq(p, peer) || p.same_addr(peer))
                {
                    Some(i) => i,
                    None => {
                        buckets.push((peer.clone(), Vec::new()));
                        buckets.len() - 1
                    }
                };
                let bucket = &mut buckets[idx].1;
                let need = msg.entry.wire_len();
                if bucket
                    .last()
                    .map_or(true, |b| b.len() + need > ZPRN_MAX_PACKET)
                {
                    let mut fresh = Vec::with_capacity(zprn::ZPRN_HDR_LEN + need);
                    zprn::encode_header(&mut fresh);
                    bucket.push(fresh);
                }
                msg.entry.encode_into(bucket.last_mut().unwrap());
            }
        }

        for (peer, bufs) in &buckets {
            for buf in bufs {
                let confirm = take_confirmed(&mut confirmed, peer);
                wire.sendto_peer(peer, buf, confirm);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::InnerAddr;
    use crate::peer::Peer;
    use crate::zprn::CMD_ROUTEMOD;

    #[test]
    fn confirmed_set_is_consumed_once() {
        let p = Peer::from_saddr("10.0.0.1:45940".parse().unwrap());
        let alias = Peer::from_saddr("10.0.0.1:45940".parse().unwrap());
        let mut confirmed = vec![p];
        assert!(take_confirmed(&mut confirmed, &alias));
        assert!(!take_confirmed(&mut confirmed, &alias));
    }

    #[test]
    fn sockaddr_conversion_v4() {
        let sa: SocketAddr = "10.0.0.1:45940".parse().unwrap();
        let (ss, len) = sockaddr_of(&sa);
        assert_eq!(len as usize, mem::size_of::<libc::sockaddr_in>());
        assert_eq!(ss.ss_family, libc::AF_INET as libc::sa_family_t);
        // SAFETY: family checked above.
        let v4 = unsafe { &*(&ss as *const _ as *const libc::sockaddr_in) };
        assert_eq!(u16::from_be(v4.sin_port), 45940);
        assert_eq!(v4.sin_addr.s_addr.to_ne_bytes(), [10, 0, 0, 1]);
    }

    #[test]
    fn sockaddr_conversion_v6() {
        let sa: SocketAddr = "[fd00::1]:45940".parse().unwrap();
        let (ss, len) = sockaddr_of(&sa);
        assert_eq!(len as usize, mem::size_of::<libc::sockaddr_in6>());
        assert_eq!(ss.ss_family, libc::AF_INET6 as libc::sa_family_t);
    }

    #[test]
    fn zprn_bucketing_splits_at_limit() {
        // emulate the worker's bucketing logic for one destination
        let entry = ZprnEntry {
            cmd: CMD_ROUTEMOD,
            prio: 1,
            route: InnerAddr::V6([1; 16]),
        };
        let mut bufs: Vec<Vec<u8>> = Vec::new();
        for _ in 0..100 {
            let need = entry.wire_len();
            if bufs.last().map_or(true, |b| b.len() + need > ZPRN_MAX_PACKET) {
                let mut fresh = Vec::new();
                zprn::encode_header(&mut fresh);
                bufs.push(fresh);
            }
            entry.encode_into(bufs.last_mut().unwrap());
        }
        assert!(bufs.len() > 1);
        assert!(bufs.iter().all(|b| b.len() <= ZPRN_MAX_PACKET));
        assert!(bufs.iter().all(|b| zprn::header_valid(b)));
        // no entries lost to the splits
        let total: usize = bufs
            .iter()
            .map(|b| (b.len() - zprn::ZPRN_HDR_LEN) / entry.wire_len())
            .sum();
        assert_eq!(total, 100);
    }
}
