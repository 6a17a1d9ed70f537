/*
    peer.rs - Peer model

    A peer is a single WireGuard endpoint registered under an account.
    Its `id` is generated once and never changes; its `key` is the
    WireGuard public key. Both are unique across the whole store.
*/

use super::types::Timestamp;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

/// Connection state reported by the peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerStatus {
    /// Last time the peer was seen by the management service
    pub last_seen: Timestamp,

    /// Whether the peer currently holds a session
    pub connected: bool,

    /// Whether the peer's login has expired and it must re-authenticate
    pub login_expired: bool,
}

/// Geolocation resolved from the peer's connection address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Location {
    pub connection_ip: Option<IpAddr>,
    pub country_code: String,
    pub city_name: String,
    pub geo_name_id: u32,
}

/// System information reported by the peer agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerSystemMeta {
    pub hostname: String,
    pub go_os: String,
    pub kernel: String,
    pub core: String,
    pub platform: String,
    pub os: String,
    pub wt_version: String,
    pub ui_version: String,
}

/// A network peer owned by exactly one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Peer {
    /// Stable identifier. Empty only in legacy stores that keyed peers by `key`.
    pub id: String,

    /// WireGuard public key
    pub key: String,

    /// Setup key used to register the peer
    pub setup_key: String,

    /// Overlay address assigned to the peer
    pub ip: IpAddr,

    pub meta: PeerSystemMeta,

    /// Human readable name, usually the hostname
    pub name: String,

    /// Unique DNS label within the account
    pub dns_label: String,

    pub status: PeerStatus,

    /// User that registered the peer, empty for setup-key peers
    pub user_id: String,

    pub ssh_key: String,
    pub ssh_enabled: bool,
    pub login_expiration_enabled: bool,

    /// Last successful login. Zero means the login was never recorded.
    pub last_login: Timestamp,

    pub location: Location,
}

impl Default for Peer {
    fn default() -> Self {
        Self {
            id: String::new(),
            key: String::new(),
            setup_key: String::new(),
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            meta: PeerSystemMeta::default(),
            name: String::new(),
            dns_label: String::new(),
            status: PeerStatus::default(),
            user_id: String::new(),
            ssh_key: String::new(),
            ssh_enabled: false,
            login_expiration_enabled: false,
            last_login: Timestamp::ZERO,
            location: Location::default(),
        }
    }
}

impl Peer {
    pub fn new(id: impl Into<String>, key: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            ip,
            ..Default::default()
        }
    }

    /// Whether the peer was registered by a user rather than a setup key
    pub fn added_with_sso_login(&self) -> bool {
        !self.user_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_peer_deserializes_without_id() {
        let json = r#"{"key":"wg-key","ip":"100.64.0.1","name":"laptop"}"#;
        let peer: Peer = serde_json::from_str(json).unwrap();

        assert!(peer.id.is_empty());
        assert_eq!(peer.key, "wg-key");
        assert!(peer.last_login.is_zero());
        assert_eq!(peer.ip, "100.64.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_sso_login_detection() {
        let mut peer = Peer::new("p1", "k1", "100.64.0.2".parse().unwrap());
        assert!(!peer.added_with_sso_login());
        peer.user_id = "u1".to_string();
        assert!(peer.added_with_sso_login());
    }
}
