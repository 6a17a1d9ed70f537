/*
    group.rs - Peer group model
*/

use serde::{Deserialize, Serialize};

/// Name of the built-in group that contains every peer of an account
pub const GROUP_ALL_NAME: &str = "All";

/// A named set of peers, referenced by routes, policies and nameserver groups
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Group {
    pub id: String,
    pub name: String,

    /// Who issued the group. Empty in stores written before the field existed.
    pub issued: String,

    /// Member peer IDs
    pub peers: Vec<String>,
}

impl Group {
    pub fn new(id: impl Into<String>, name: impl Into<String>, peers: Vec<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            issued: super::types::ISSUED_API.to_string(),
            peers,
        }
    }

    pub fn is_group_all(&self) -> bool {
        self.name == GROUP_ALL_NAME
    }
}
