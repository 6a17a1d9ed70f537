/*
    setup_key.rs - Setup key model
*/

use super::types::Timestamp;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetupKeyType {
    #[default]
    Reusable,
    OneOff,
}

impl SetupKeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetupKeyType::Reusable => "reusable",
            SetupKeyType::OneOff => "oneoff",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "oneoff" => SetupKeyType::OneOff,
            _ => SetupKeyType::Reusable,
        }
    }
}

/// Pre-shared key that lets a peer register without interactive login.
///
/// Accounts key their setup keys by `key`. Lookups by key are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupKey {
    pub id: String,
    pub key: String,
    pub name: String,
    pub key_type: SetupKeyType,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub updated_at: Timestamp,
    pub revoked: bool,
    pub used_times: u32,
    pub last_used: Timestamp,
    pub auto_groups: Vec<String>,

    /// Maximum number of uses, 0 means unlimited
    pub usage_limit: u32,

    pub ephemeral: bool,
}

impl SetupKey {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        !self.expires_at.is_zero() && now >= self.expires_at
    }

    pub fn is_overused(&self) -> bool {
        self.key_type == SetupKeyType::OneOff && self.used_times >= 1
            || self.usage_limit > 0 && self.used_times >= self.usage_limit
    }

    pub fn is_valid(&self, now: Timestamp) -> bool {
        !self.revoked && !self.is_expired(now) && !self.is_overused()
    }
}
