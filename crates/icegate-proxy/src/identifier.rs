// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Correlation key between a source connection and its metadata requests
//!
//! Encoders send audio and metadata over separate HTTP requests, usually from
//! different ephemeral ports. The identifier hashes the username, the mount
//! and the remote host (without port) so both requests map to the same value.

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hasher;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(pub u64);

impl Identifier {
    /// FNV-1a 64 over `username`, `mount` and `host`, in that order
    pub fn from_parts(username: &str, mount: &str, host: &str) -> Self {
        let mut hasher = FnvHasher::default();
        hasher.write(username.as_bytes());
        hasher.write(mount.as_bytes());
        hasher.write(host.as_bytes());
        Identifier(hasher.finish())
    }

    pub fn for_peer(username: &str, mount: &str, peer: SocketAddr) -> Self {
        Self::from_parts(username, mount, &peer.ip().to_string())
    }

    /// Like `for_peer` but starting from a textual `host:port` address
    pub fn for_address(username: &str, mount: &str, address: &str) -> Self {
        Self::from_parts(username, mount, strip_port(address))
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Host part of `host:port`, `[v6]:port` or a bare host
pub fn strip_port(address: &str) -> &str {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        let port_len = addr.port().to_string().len() + 1;
        let host = &address[..address.len() - port_len];
        return host.trim_start_matches('[').trim_end_matches(']');
    }
    match address.rsplit_once(':') {
        Some((host, port))
            if !host.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            host
        }
        _ => address,
    }
}
