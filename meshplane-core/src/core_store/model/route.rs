/*
    route.rs - Network route model
*/

use serde::{Deserialize, Serialize};

/// Address family of a routed network
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkType {
    #[default]
    Invalid,
    IPv4,
    IPv6,
}

impl NetworkType {
    pub fn as_i64(&self) -> i64 {
        match self {
            NetworkType::Invalid => 0,
            NetworkType::IPv4 => 1,
            NetworkType::IPv6 => 2,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => NetworkType::IPv4,
            2 => NetworkType::IPv6,
            _ => NetworkType::Invalid,
        }
    }
}

/// A network exposed through a routing peer (or a group of routing peers)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Route {
    pub id: String,

    /// Routed prefix in CIDR notation
    pub network: String,

    /// Identifier shared by routes that serve the same network for HA
    pub net_id: String,

    pub description: String,

    /// Routing peer ID. Mutually exclusive with `peer_groups`.
    pub peer: String,

    /// Groups whose peers act as routers
    pub peer_groups: Vec<String>,

    pub network_type: NetworkType,
    pub masquerade: bool,
    pub metric: i64,
    pub enabled: bool,

    /// Groups that receive the route
    pub groups: Vec<String>,
}
