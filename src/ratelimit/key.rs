//! Throttling key derivation.

use std::fmt;
use std::net::SocketAddr;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

/// Role assumed for an identity that carries none.
pub const DEFAULT_ROLE: &str = "user";

const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";
const UNKNOWN_ADDRESS: &str = "unknown";

/// A caller resolved by an earlier authentication step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub role: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// The role used for keys and tier lookups.
    pub fn effective_role(&self) -> &str {
        self.role.as_deref().unwrap_or(DEFAULT_ROLE)
    }
}

/// The string a counter is indexed by. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThrottleKey(String);

impl ThrottleKey {
    /// Returns `None` for an empty (or all-whitespace) key.
    pub fn new(key: impl Into<String>) -> Option<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            None
        } else {
            Some(Self(key))
        }
    }

    fn prefixed(prefix: &str, subject: &str) -> Self {
        Self(format!("{}:{}", prefix, subject))
    }

    /// The same subject counted separately under `scope`.
    pub fn scoped(&self, scope: &str) -> Self {
        Self(format!("{}|{}", scope, self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThrottleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Borrowed view of the parts of a request that key derivation looks at.
#[derive(Debug, Clone, Copy)]
pub struct RequestMeta<'a> {
    pub headers: &'a HeaderMap,
    pub identity: Option<&'a Identity>,
    pub peer: Option<SocketAddr>,
}

impl<'a> RequestMeta<'a> {
    pub fn new(headers: &'a HeaderMap) -> Self {
        Self {
            headers,
            identity: None,
            peer: None,
        }
    }

    pub fn with_identity(mut self, identity: Option<&'a Identity>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_peer(mut self, peer: Option<SocketAddr>) -> Self {
        self.peer = peer;
        self
    }

    /// Best-effort client address: forwarded-for, then real-ip, then the socket peer.
    pub fn client_address(&self) -> String {
        self.header(FORWARDED_FOR)
            .and_then(|list| list.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .or_else(|| {
                self.header(REAL_IP)
                    .map(str::trim)
                    .filter(|ip| !ip.is_empty())
            })
            .map(str::to_string)
            .or_else(|| self.peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string())
    }

    fn header(&self, name: &str) -> Option<&'a str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// How a request is mapped to a throttling key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyStrategy {
    /// `user:<id>` for identified callers, `ip:<address>` otherwise
    #[default]
    Default,
    /// `<role>:<id>` for identified callers, [`KeyStrategy::Default`] otherwise
    RoleBased,
}

impl KeyStrategy {
    pub fn derive(&self, request: &RequestMeta<'_>) -> ThrottleKey {
        match (self, request.identity) {
            (KeyStrategy::RoleBased, Some(identity)) => {
                ThrottleKey::prefixed(identity.effective_role(), &identity.id)
            }
            _ => default_key(request),
        }
    }
}

fn default_key(request: &RequestMeta<'_>) -> ThrottleKey {
    match request.identity {
        Some(identity) => ThrottleKey::prefixed("user", &identity.id),
        None => ThrottleKey::prefixed("ip", &request.client_address()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_default_key_from_forwarded_for() {
        let map = headers(&[("x-forwarded-for", "192.168.1.1")]);
        let key = KeyStrategy::Default.derive(&RequestMeta::new(&map));
        assert_eq!(key.as_str(), "ip:192.168.1.1");
    }

    #[test]
    fn test_default_key_uses_first_forwarded_entry() {
        let map = headers(&[("x-forwarded-for", "203.0.113.5, 10.0.0.1")]);
        let key = KeyStrategy::Default.derive(&RequestMeta::new(&map));
        assert_eq!(key.as_str(), "ip:203.0.113.5");
    }

    #[test]
    fn test_default_key_falls_back_to_real_ip() {
        let map = headers(&[("x-real-ip", " 198.51.100.7 ")]);
        let key = KeyStrategy::Default.derive(&RequestMeta::new(&map));
        assert_eq!(key.as_str(), "ip:198.51.100.7");
    }

    #[test]
    fn test_default_key_skips_empty_forwarded_for() {
        let map = headers(&[("x-forwarded-for", " , 10.0.0.1"), ("x-real-ip", "198.51.100.7")]);
        let key = KeyStrategy::Default.derive(&RequestMeta::new(&map));
        assert_eq!(key.as_str(), "ip:198.51.100.7");
    }

    #[test]
    fn test_default_key_uses_socket_peer() {
        let map = HeaderMap::new();
        let peer: SocketAddr = "192.0.2.44:51000".parse().unwrap();
        let key = KeyStrategy::Default.derive(&RequestMeta::new(&map).with_peer(Some(peer)));
        assert_eq!(key.as_str(), "ip:192.0.2.44");
    }

    #[test]
    fn test_default_key_without_address_is_unknown() {
        let map = HeaderMap::new();
        let key = KeyStrategy::Default.derive(&RequestMeta::new(&map));
        assert_eq!(key.as_str(), "ip:unknown");
    }

    #[test]
    fn test_default_key_prefers_identity_over_headers() {
        let map = headers(&[("x-forwarded-for", "192.168.1.1")]);
        let identity = Identity::new("u1").with_role("admin");
        let meta = RequestMeta::new(&map).with_identity(Some(&identity));

        assert_eq!(KeyStrategy::Default.derive(&meta).as_str(), "user:u1");
    }

    #[test]
    fn test_role_based_key() {
        let map = headers(&[("x-forwarded-for", "192.168.1.1")]);
        let admin = Identity::new("u1").with_role("admin");
        let plain = Identity::new("u2");

        let meta = RequestMeta::new(&map).with_identity(Some(&admin));
        let key = KeyStrategy::RoleBased.derive(&meta);
        assert_eq!(key.as_str(), "admin:u1");

        let meta = RequestMeta::new(&map).with_identity(Some(&plain));
        let key = KeyStrategy::RoleBased.derive(&meta);
        assert_eq!(key.as_str(), "user:u2");
    }

    #[test]
    fn test_role_based_key_without_identity_delegates() {
        let map = headers(&[("x-forwarded-for", "192.168.1.1")]);
        let meta = RequestMeta::new(&map);
        assert_eq!(
            KeyStrategy::RoleBased.derive(&meta),
            KeyStrategy::Default.derive(&meta)
        );
    }

    #[test]
    fn test_throttle_key_rejects_empty() {
        assert!(ThrottleKey::new("").is_none());
        assert!(ThrottleKey::new("   ").is_none());
        assert_eq!(ThrottleKey::new("ip:1.2.3.4").unwrap().to_string(), "ip:1.2.3.4");
    }

    #[test]
    fn test_scoped_key() {
        let key = ThrottleKey::new("user:u1").unwrap();
        assert_eq!(key.scoped("upload").as_str(), "upload|user:u1");
    }
}
