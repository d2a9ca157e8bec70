//! Configuration schema and the line-tag config file parser.
//!
//! The config file holds one statement per line; the first character is
//! the tag, the remainder the value. Empty lines and lines starting with
//! `#` are comments.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::warn;

use crate::error::SetupError;

/// Default UDP data port.
pub const DEFAULT_DATA_PORT: u16 = 45940;
/// Default peer/route staleness limit in seconds.
pub const DEFAULT_REMOTE_TIMEOUT: u64 = 300;
/// Default near-router swap window in milliseconds.
pub const DEFAULT_MAX_NEAR_RTT: u64 = 5;

/// Preferred outer address family for hostname resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreferredAf {
    Unspec,
    V4,
    V6,
}

impl PreferredAf {
    fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "INET" | "IPV4" => PreferredAf::V4,
            "INET6" | "IPV6" => PreferredAf::V6,
            other => {
                warn!("CONFIG WARNING: unsupported address family: {other}");
                PreferredAf::Unspec
            }
        }
    }
}

/// Immutable runtime configuration, fixed after startup.
#[derive(Clone, Debug)]
pub struct Config {
    /// UDP port data and ZPRN share (`P`)
    pub data_port: u16,
    /// Peer staleness limit in seconds (`T`); routes age at twice this
    pub remote_timeout: u64,
    /// Near-router swap window in ms (`n`); zero disables swapping
    pub max_near_rtt: u64,
    /// Preferred address family for resolution (`^`)
    pub preferred_af: PreferredAf,
    /// Remote peer hostnames (`R`)
    pub remotes: Vec<String>,
    /// TUN interface name (`I`, required)
    pub iface: String,
    /// Addresses to assign to the TUN (`A`)
    pub addrs: Vec<String>,
    /// Exported local addresses we claim to host (`L`)
    pub exported_addrs: Vec<String>,
    /// Destinations silently dropped when picked as broadcast targets (`B`)
    pub blocked_broadcasts: Vec<String>,
    /// One-shot interface setup commands (`H`)
    pub iface_hooks: Vec<String>,
    /// Route/peer change hook prefixes (`h`)
    pub route_hooks: Vec<String>,
    /// User to drop privileges to (`U`)
    pub run_as_user: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_port: DEFAULT_DATA_PORT,
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
            max_near_rtt: DEFAULT_MAX_NEAR_RTT,
            preferred_af: PreferredAf::Unspec,
            remotes: Vec::new(),
            iface: String::new(),
            addrs: Vec::new(),
            exported_addrs: Vec::new(),
            blocked_broadcasts: Vec::new(),
            iface_hooks: Vec::new(),
            route_hooks: Vec::new(),
            run_as_user: None,
        }
    }
}

impl Config {
    /// Load and parse the file at `path`.
    pub fn load(path: &Path) -> Result<Config, SetupError> {
        let file = File::open(path).map_err(|e| {
            SetupError::Config(format!("unable to open config file '{}': {e}", path.display()))
        })?;
        Self::parse(BufReader::new(file))
    }

    /// Parse a config file from any line source.
    pub fn parse(reader: impl BufRead) -> Result<Config, SetupError> {
        let mut cfg = Config::default();

        for line in reader.lines() {
            let line = line?;
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let tag = line.as_bytes()[0];
            let arg = line.get(1..).unwrap_or_default().to_owned();
            match tag {
                b'A' => cfg.addrs.push(arg),
                b'B' => cfg.blocked_broadcasts.push(arg),
                b'H' => cfg.iface_hooks.push(arg),
                b'h' => cfg.route_hooks.push(arg),
                b'I' => cfg.iface = arg,
                b'L' => cfg.exported_addrs.push(arg),
                b'P' => {
                    cfg.data_port = arg
                        .parse()
                        .map_err(|_| SetupError::Config(format!("invalid port: '{arg}'")))?
                }
                b'R' => cfg.remotes.push(arg),
                b'T' => {
                    cfg.remote_timeout = arg
                        .parse()
                        .map_err(|_| SetupError::Config(format!("invalid timeout: '{arg}'")))?
                }
                b'U' => cfg.run_as_user = Some(arg),
                b'n' => {
                    cfg.max_near_rtt = arg.parse().map_err(|_| {
                        SetupError::Config(format!("invalid max near rtt: '{arg}'"))
                    })?
                }
                b'^' => cfg.preferred_af = PreferredAf::parse(&arg),
                _ => warn!("CONFIG ERROR: unknown stmt in config file: '{line}'"),
            }
        }

        if cfg.iface.is_empty() {
            return Err(SetupError::Config("no interface specified".to_owned()));
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn defaults() {
        let cfg = Config::parse(Cursor::new("Itun0\n")).unwrap();
        assert_eq!(cfg.data_port, 45940);
        assert_eq!(cfg.remote_timeout, 300);
        assert_eq!(cfg.max_near_rtt, 5);
        assert_eq!(cfg.preferred_af, PreferredAf::Unspec);
        assert!(cfg.remotes.is_empty());
    }

    #[test]
    fn all_tags() {
        let text = "\
# a comment

Itun0
A10.0.1.1/24
B10.0.1.255
Hip link set dev %i multicast off
h/usr/local/bin/route-hook
Lexported.example.org
P45941
Rpeer.example.org
T60
Uzrouter
n12
^INET6
";
        let cfg = Config::parse(Cursor::new(text)).unwrap();
        assert_eq!(cfg.iface, "tun0");
        assert_eq!(cfg.addrs, vec!["10.0.1.1/24"]);
        assert_eq!(cfg.blocked_broadcasts, vec!["10.0.1.255"]);
        assert_eq!(cfg.iface_hooks.len(), 1);
        assert_eq!(cfg.route_hooks, vec!["/usr/local/bin/route-hook"]);
        assert_eq!(cfg.exported_addrs, vec!["exported.example.org"]);
        assert_eq!(cfg.data_port, 45941);
        assert_eq!(cfg.remotes, vec!["peer.example.org"]);
        assert_eq!(cfg.remote_timeout, 60);
        assert_eq!(cfg.run_as_user.as_deref(), Some("zrouter"));
        assert_eq!(cfg.max_near_rtt, 12);
        assert_eq!(cfg.preferred_af, PreferredAf::V6);
    }

    #[test]
    fn missing_iface_is_fatal() {
        assert!(Config::parse(Cursor::new("P45940\n")).is_err());
    }

    #[test]
    fn bad_numbers_are_fatal() {
        assert!(Config::parse(Cursor::new("Itun0\nPnotaport\n")).is_err());
        assert!(Config::parse(Cursor::new("Itun0\nTforever\n")).is_err());
    }

    #[test]
    fn af_aliases() {
        for (s, want) in [
            ("INET", PreferredAf::V4),
            ("ipv4", PreferredAf::V4),
            ("INET6", PreferredAf::V6),
            ("ipv6", PreferredAf::V6),
            ("bogus", PreferredAf::Unspec),
        ] {
            let cfg = Config::parse(Cursor::new(format!("Itun0\n^{s}\n"))).unwrap();
            assert_eq!(cfg.preferred_af, want, "{s}");
        }
    }
}
