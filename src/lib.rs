//! zmesh: a userspace L3 mesh router.
//!
//! Nodes attach to a local TUN device and tunnel IPv4/IPv6 packets
//! between each other over UDP. A small control protocol (ZPRN v2) on the
//! same port builds a distributed routing table with per-route hop and
//! latency metrics, automatic failover and split-horizon loop prevention.
//!
//! The `z` binary wires these modules to a config file, a TUN device and
//! a pair of UDP sockets; the library surface exists mostly for tests.

pub mod addr;
pub mod config;
pub mod error;
pub mod icmp;
pub mod nic;
pub mod packet;
pub mod peer;
pub mod ping;
pub mod resolve;
pub mod router;
pub mod routes;
pub mod sender;
pub mod zprn;
