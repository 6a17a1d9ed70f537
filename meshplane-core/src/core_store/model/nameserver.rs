/*
    nameserver.rs - DNS nameserver group model
*/

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NameServerType {
    #[default]
    Udp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameServer {
    pub ip: IpAddr,
    #[serde(default)]
    pub ns_type: NameServerType,
    pub port: u16,
}

/// A set of upstream nameservers distributed to peers in `groups`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NameServerGroup {
    pub id: String,
    pub name: String,
    pub description: String,
    pub name_servers: Vec<NameServer>,
    pub groups: Vec<String>,
    pub primary: bool,

    /// Match domains, only used when `primary` is false
    pub domains: Vec<String>,

    pub enabled: bool,
    pub search_domains_enabled: bool,
}
