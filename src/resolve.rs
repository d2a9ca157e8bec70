//! Hostname resolution and route-change shell hooks.

use std::net::{SocketAddr, ToSocketAddrs};
use std::process::Command;

use tracing::warn;

use crate::addr::InnerAddr;
use crate::config::PreferredAf;

/// Resolve `host` to a socket address, preferring the configured address
/// family when possible. The port comes back as zero when `host` carries
/// none; callers fill in the data port afterwards.
pub fn resolve_hostname(host: &str, preferred: PreferredAf) -> Option<SocketAddr> {
    let addrs: Vec<SocketAddr> = match (host, 0u16).to_socket_addrs() {
        Ok(it) => it.collect(),
        Err(e) => {
            warn!("can't resolve '{host}': {e}");
            return None;
        }
    };
    let matches_af = |sa: &&SocketAddr| match preferred {
        PreferredAf::Unspec => true,
        PreferredAf::V4 => sa.is_ipv4(),
        PreferredAf::V6 => sa.is_ipv6(),
    };
    addrs
        .iter()
        .find(matches_af)
        .or_else(|| addrs.first())
        .copied()
}

/// Resolve a list of hostnames to inner addresses, warning about each
/// failure. Used for the exported-local and blocked-broadcast sets.
pub fn resolve_inner_addrs(hosts: &[String], what: &str, preferred: PreferredAf) -> Vec<InnerAddr> {
    hosts
        .iter()
        .filter_map(|h| match resolve_hostname(h, preferred) {
            Some(sa) => Some(InnerAddr::from(sa.ip())),
            None => {
                warn!("CONFIG WARNING: can't resolve {what} '{h}'");
                None
            }
        })
        .collect()
}

fn run_hooks(hooks: &[String], args: &str) {
    for prefix in hooks {
        let cmd = format!("{prefix}{args}");
        match Command::new("sh").arg("-c").arg(&cmd).status() {
            Ok(st) if st.success() => {}
            Ok(st) => warn!("ROUTER HOOK ERROR: {cmd}; $? = {st}"),
            Err(e) => warn!("ROUTER HOOK ERROR: {cmd}; {e}"),
        }
    }
}

/// Notify the route hooks of a routing table change:
/// `<prefix> route {add|del} "<IA>"`.
pub fn run_route_hooks(hooks: &[String], deleted: bool, dest: &InnerAddr) {
    if hooks.is_empty() {
        return;
    }
    let verb = if deleted { "del" } else { "add" };
    run_hooks(hooks, &format!(" route {verb} \"{dest}\""));
}

/// Notify the route hooks of a peer change:
/// `<prefix> peer {add|del} "<sockaddr>"`.
pub fn run_peer_hooks(hooks: &[String], deleted: bool, saddr: &SocketAddr) {
    if hooks.is_empty() {
        return;
    }
    let verb = if deleted { "del" } else { "add" };
    run_hooks(hooks, &format!(" peer {verb} \"{saddr}\""));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_literal_addresses() {
        let sa = resolve_hostname("127.0.0.1", PreferredAf::Unspec).unwrap();
        assert!(sa.ip().is_loopback());
        assert_eq!(sa.port(), 0);
    }

    #[test]
    fn preferred_family_is_honored_for_literals() {
        let v6 = resolve_hostname("::1", PreferredAf::V6).unwrap();
        assert!(v6.is_ipv6());
        // a v4 literal still resolves even when v6 is preferred
        let v4 = resolve_hostname("127.0.0.1", PreferredAf::V6).unwrap();
        assert!(v4.is_ipv4());
    }

    #[test]
    fn inner_addr_resolution_skips_failures() {
        let out = resolve_inner_addrs(
            &["127.0.0.1".into(), "".into()],
            "blocked broadcast destination",
            PreferredAf::Unspec,
        );
        assert_eq!(out, vec![InnerAddr::V4([127, 0, 0, 1])]);
    }
}
