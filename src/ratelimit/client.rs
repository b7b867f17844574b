//! Client key derivation.

use axum::http::HeaderMap;
use std::net::{IpAddr, Ipv6Addr};

use crate::config::ClientConfig;

/// Key used when no client address can be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// A key that identifies a client for rate limiting.
///
/// Keys are derived from the client address and are not globally unique:
/// clients behind one NAT share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    /// The shared key for clients without a usable address.
    pub fn unknown() -> Self {
        Self(UNKNOWN_CLIENT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mask an address down to the prefix used for grouping.
///
/// IPv4 addresses and IPv4-mapped IPv6 addresses are returned as IPv4
/// unchanged. IPv6 addresses keep their first `prefix_len` bits.
pub fn coarsen_ip(ip: IpAddr, prefix_len: u8) -> IpAddr {
    match ip {
        IpAddr::V4(_) => ip,
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return IpAddr::V4(v4);
            }
            let prefix_len = prefix_len.min(128);
            if prefix_len == 128 {
                return ip;
            }
            let mask = if prefix_len == 0 {
                0
            } else {
                !0u128 << (128 - prefix_len)
            };
            IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask))
        }
    }
}

/// Derives client keys from request metadata.
#[derive(Debug, Clone)]
pub struct ClientIdentifier {
    trust_proxy: bool,
    ipv6_prefix_len: u8,
    proxy_headers: Vec<String>,
}

impl ClientIdentifier {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            trust_proxy: config.trust_proxy,
            ipv6_prefix_len: config.ipv6_prefix_len.min(128),
            proxy_headers: config
                .proxy_headers
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Full client key: coarsened address followed by any proxy headers.
    pub fn identify(&self, headers: &HeaderMap, remote: Option<IpAddr>) -> ClientKey {
        let Some(ip) = self.primary_address(headers, remote) else {
            return ClientKey::unknown();
        };

        let mut key = self.render(ip);
        for name in &self.proxy_headers {
            if let Some(value) = headers.get(name.as_str()).and_then(|v| v.to_str().ok()) {
                let value = value.trim();
                if !value.is_empty() {
                    key.push(':');
                    key.push_str(value);
                }
            }
        }

        ClientKey(key)
    }

    /// Address-only key, without proxy header suffixes.
    pub fn identify_address(&self, headers: &HeaderMap, remote: Option<IpAddr>) -> ClientKey {
        match self.primary_address(headers, remote) {
            Some(ip) => ClientKey(self.render(ip)),
            None => ClientKey::unknown(),
        }
    }

    fn primary_address(&self, headers: &HeaderMap, remote: Option<IpAddr>) -> Option<IpAddr> {
        if self.trust_proxy {
            let forwarded = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.split(',').next())
                .and_then(|first| first.trim().parse::<IpAddr>().ok());
            if forwarded.is_some() {
                return forwarded;
            }
        }
        remote
    }

    fn render(&self, ip: IpAddr) -> String {
        match coarsen_ip(ip, self.ipv6_prefix_len) {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("{}/{}", v6, self.ipv6_prefix_len),
        }
    }
}

impl Default for ClientIdentifier {
    fn default() -> Self {
        Self::new(&ClientConfig::default())
    }
}
