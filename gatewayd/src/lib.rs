//! Hostname registry and reverse-proxy gateway for peers on a local network.
//!
//! Peers sign a registration with their key and receive a hostname under the
//! gateway's own name; requests for that hostname are then forwarded to the
//! peer. An mDNS engine announces local services, tracks remote ones and
//! answers address queries for issued names.

pub mod api;
pub mod config;
pub mod error;
pub mod gateway;
pub mod lookup_cache;
pub mod mdns;
pub mod proxy;
pub mod server;
pub mod store;
