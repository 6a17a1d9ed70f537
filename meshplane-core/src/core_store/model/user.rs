/*
    user.rs - User and personal access token models
*/

use super::types::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Role of a user inside its account
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Owner,
    Admin,
    #[default]
    User,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Owner => "owner",
            UserRole::Admin => "admin",
            UserRole::User => "user",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "owner" => UserRole::Owner,
            "admin" => UserRole::Admin,
            _ => UserRole::User,
        }
    }
}

/// A personal access token owned by a user. Only the hash of the secret is stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonalAccessToken {
    pub id: String,
    pub user_id: String,
    pub name: String,

    /// Hash of the token secret; unique across the store
    pub hashed_token: String,

    pub expiration_date: Timestamp,
    pub created_by: String,
    pub created_at: Timestamp,
    pub last_used: Timestamp,
}

/// A user of the management service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: String,
    pub role: UserRole,
    pub is_service_user: bool,
    pub non_deletable: bool,
    pub service_user_name: String,

    /// Groups automatically assigned to peers this user registers
    pub auto_groups: Vec<String>,

    pub blocked: bool,
    pub last_login: Timestamp,

    /// Who issued the user. Empty in stores written before the field existed.
    pub issued: String,

    /// Tokens keyed by token ID
    pub pats: HashMap<String, PersonalAccessToken>,
}

impl User {
    pub fn new(id: impl Into<String>, role: UserRole) -> Self {
        Self {
            id: id.into(),
            role,
            issued: super::types::ISSUED_API.to_string(),
            ..Default::default()
        }
    }

    pub fn is_admin_or_owner(&self) -> bool {
        matches!(self.role, UserRole::Admin | UserRole::Owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in [UserRole::Owner, UserRole::Admin, UserRole::User] {
            assert_eq!(UserRole::parse(role.as_str()), role);
        }
        assert_eq!(UserRole::parse("unknown"), UserRole::User);
    }

    #[test]
    fn test_clone_is_independent() {
        let mut user = User::new("u1", UserRole::Admin);
        user.pats.insert(
            "t1".to_string(),
            PersonalAccessToken {
                id: "t1".to_string(),
                hashed_token: "h1".to_string(),
                ..Default::default()
            },
        );

        let mut copy = user.clone();
        copy.pats.get_mut("t1").unwrap().name = "changed".to_string();

        assert!(user.pats["t1"].name.is_empty());
        assert!(user.is_admin_or_owner());
    }
}
