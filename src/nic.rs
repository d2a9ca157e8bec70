//! TUN device allocation and host network plumbing.
//!
//! Everything here runs once at startup: device creation, `ip`-command
//! bring-up, the local address scan, UDP socket setup and privilege drop.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::net::UdpSocket;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::process::Command;
use std::ptr;

use tracing::info;

use crate::addr::{InnerAddr, LocalAddr};
use crate::error::SetupError;

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct IfReq {
    ifr_name: [u8; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// Open `/dev/net/tun` and attach it to `name` (IFF_TUN, no packet info).
/// Returns the device file and the kernel-assigned interface name.
pub fn tun_alloc(name: &str) -> Result<(File, String), SetupError> {
    if name.len() >= libc::IFNAMSIZ {
        return Err(SetupError::Startup(format!(
            "interface name too long: '{name}'"
        )));
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/net/tun")
        .map_err(|e| SetupError::Startup(format!("opening /dev/net/tun: {e}")))?;

    let mut req = IfReq {
        ifr_name: [0; libc::IFNAMSIZ],
        ifr_flags: IFF_TUN | IFF_NO_PI,
        _pad: [0; 22],
    };
    req.ifr_name[..name.len()].copy_from_slice(name.as_bytes());

    // SAFETY: fd is a freshly opened tun control device and req outlives
    // the call.
    if unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &mut req) } < 0 {
        return Err(SetupError::Startup(format!(
            "ioctl(TUNSETIFF) for '{name}': {}",
            io::Error::last_os_error()
        )));
    }
    set_nonblocking(file.as_raw_fd())?;

    let end = req
        .ifr_name
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(libc::IFNAMSIZ);
    let actual = String::from_utf8_lossy(&req.ifr_name[..end]).into_owned();
    info!("connected to interface {actual}");
    Ok((file, actual))
}

fn set_nonblocking(fd: libc::c_int) -> Result<(), SetupError> {
    // SAFETY: plain fcntl flag manipulation on an owned fd.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(SetupError::Startup(format!(
                "fcntl(O_NONBLOCK): {}",
                io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

/// Run one bring-up shell command; any failure is fatal at startup.
pub fn runcmd(cmd: &str) -> Result<(), SetupError> {
    match Command::new("sh").arg("-c").arg(cmd).status() {
        Ok(st) if st.success() => Ok(()),
        Ok(st) => Err(SetupError::Startup(format!(
            "CONFIG APPLY ERROR: {cmd}; $? = {st}"
        ))),
        Err(e) => Err(SetupError::Startup(format!("CONFIG APPLY ERROR: {cmd}; {e}"))),
    }
}

/// Collect the (address, netmask) pairs currently assigned to `iface`.
pub fn scan_local_addrs(iface: &str) -> Result<Vec<LocalAddr>, SetupError> {
    let mut ifap: *mut libc::ifaddrs = ptr::null_mut();
    // SAFETY: getifaddrs fills ifap with a list we free below.
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        return Err(SetupError::Startup(format!(
            "getifaddrs() failed: {}",
            io::Error::last_os_error()
        )));
    }

    let mut out = Vec::new();
    let mut cur = ifap;
    while !cur.is_null() {
        // SAFETY: cur walks the list returned by getifaddrs.
        let ifa = unsafe { &*cur };
        cur = ifa.ifa_next;
        if ifa.ifa_addr.is_null() || ifa.ifa_netmask.is_null() || ifa.ifa_name.is_null() {
            continue;
        }
        let name = unsafe { std::ffi::CStr::from_ptr(ifa.ifa_name) };
        if name.to_bytes() != iface.as_bytes() {
            continue;
        }
        // SAFETY: family tag selects the matching sockaddr layout.
        let entry = unsafe {
            match (*ifa.ifa_addr).sa_family as libc::c_int {
                libc::AF_INET => {
                    let a = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                    let m = &*(ifa.ifa_netmask as *const libc::sockaddr_in);
                    Some(LocalAddr {
                        addr: InnerAddr::V4(a.sin_addr.s_addr.to_ne_bytes()),
                        mask: InnerAddr::V4(m.sin_addr.s_addr.to_ne_bytes()),
                    })
                }
                libc::AF_INET6 => {
                    let a = &*(ifa.ifa_addr as *const libc::sockaddr_in6);
                    let m = &*(ifa.ifa_netmask as *const libc::sockaddr_in6);
                    Some(LocalAddr {
                        addr: InnerAddr::V6(a.sin6_addr.s6_addr),
                        mask: InnerAddr::V6(m.sin6_addr.s6_addr),
                    })
                }
                _ => None,
            }
        };
        out.extend(entry);
    }
    // SAFETY: ifap came from getifaddrs above.
    unsafe { libc::freeifaddrs(ifap) };
    Ok(out)
}

/// Create a nonblocking UDP data socket bound to the catch-all address of
/// the requested family. SO_REUSEADDR avoids bind errors on fast restart;
/// the v6 socket is v6-only so both sockets can share the port.
pub fn bind_udp(ipv6: bool, port: u16) -> Result<UdpSocket, SetupError> {
    let family = if ipv6 { libc::AF_INET6 } else { libc::AF_INET };
    // SAFETY: raw socket setup; the fd is owned by the returned UdpSocket.
    unsafe {
        let fd = libc::socket(family, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(SetupError::Startup(format!(
                "socket(): {}",
                io::Error::last_os_error()
            )));
        }
        let sock = UdpSocket::from_raw_fd(fd);

        let one: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) < 0
        {
            return Err(SetupError::Startup(format!(
                "setsockopt(SO_REUSEADDR): {}",
                io::Error::last_os_error()
            )));
        }

        let rc = if ipv6 {
            if libc::setsockopt(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_V6ONLY,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            ) < 0
            {
                return Err(SetupError::Startup(format!(
                    "setsockopt(IPV6_V6ONLY): {}",
                    io::Error::last_os_error()
                )));
            }
            let mut sa: libc::sockaddr_in6 = std::mem::zeroed();
            sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sa.sin6_port = port.to_be();
            libc::bind(
                fd,
                &sa as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        } else {
            let mut sa: libc::sockaddr_in = std::mem::zeroed();
            sa.sin_family = libc::AF_INET as libc::sa_family_t;
            sa.sin_port = port.to_be();
            libc::bind(
                fd,
                &sa as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(SetupError::Startup(format!(
                "bind() port {port}: {}",
                io::Error::last_os_error()
            )));
        }
        sock.set_nonblocking(true)?;
        Ok(sock)
    }
}

/// Reopen stdin on `/dev/null` so a stray read never blocks a terminal.
pub fn redirect_stdin() -> Result<(), SetupError> {
    let null = OpenOptions::new()
        .read(true)
        .open("/dev/null")
        .map_err(|e| SetupError::Startup(format!("unable to open /dev/null: {e}")))?;
    // SAFETY: duplicating an owned fd onto stdin.
    if unsafe { libc::dup2(null.as_raw_fd(), 0) } < 0 {
        return Err(SetupError::Startup(format!(
            "dup2(stdin): {}",
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Drop root privileges to `user` (group "nogroup"). Runs before any
/// thread is spawned.
pub fn drop_privileges(user: &str) -> Result<(), SetupError> {
    info!("running daemon as user: '{user}'");
    let cuser = CString::new(user)
        .map_err(|_| SetupError::Startup(format!("invalid user name '{user}'")))?;
    let cgroup = CString::new("nogroup").unwrap();

    // SAFETY: getpwnam/getgrnam are called before threads exist.
    unsafe {
        let pw = libc::getpwnam(cuser.as_ptr());
        if pw.is_null() {
            return Err(SetupError::Startup(format!("getpwnam('{user}') failed")));
        }
        let gr = libc::getgrnam(cgroup.as_ptr());
        if gr.is_null() {
            return Err(SetupError::Startup("getgrnam('nogroup') failed".into()));
        }
        let gid = (*gr).gr_gid;
        let uid = (*pw).pw_uid;
        if libc::setgroups(1, &gid) < 0 || libc::setregid(gid, gid) < 0 {
            return Err(SetupError::Startup(format!(
                "set*gid() failed: {}",
                io::Error::last_os_error()
            )));
        }
        if libc::setreuid(uid, uid) < 0 {
            return Err(SetupError::Startup(format!(
                "setreuid() failed: {}",
                io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}
