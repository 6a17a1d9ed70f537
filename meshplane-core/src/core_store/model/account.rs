/*
    account.rs - Account aggregate

    The account is the root aggregate of the store. It owns every peer,
    user, group, route, policy, setup key and nameserver group of one
    tenant. Nothing is shared between accounts.

    `Clone` is a full deep copy: every collection and nested entity is
    owned, so a clone never aliases the original.
*/

use super::group::Group;
use super::nameserver::NameServerGroup;
use super::peer::Peer;
use super::policy::Policy;
use super::route::Route;
use super::setup_key::SetupKey;
use super::types::Timestamp;
use super::user::User;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Default lifetime of a peer login before re-authentication is required
pub const DEFAULT_PEER_LOGIN_EXPIRATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Maximum length of a DNS label
const MAX_DNS_LABEL_LEN: usize = 63;

/// Whether the account's domain is shared by many tenants or owned by one organisation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainCategory {
    #[default]
    #[serde(rename = "")]
    Unset,
    Public,
    Private,
}

impl DomainCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainCategory::Unset => "",
            DomainCategory::Public => "public",
            DomainCategory::Private => "private",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "public" => DomainCategory::Public,
            "private" => DomainCategory::Private,
            _ => DomainCategory::Unset,
        }
    }
}

/// Account-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Whether peers added via SSO must re-authenticate periodically
    pub peer_login_expiration_enabled: bool,

    #[serde(with = "humantime_serde")]
    pub peer_login_expiration: Duration,

    /// Propagate user auto-groups to the user's existing peers
    pub groups_propagation_enabled: bool,

    pub jwt_groups_enabled: bool,
    pub jwt_groups_claim_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            peer_login_expiration_enabled: true,
            peer_login_expiration: DEFAULT_PEER_LOGIN_EXPIRATION,
            groups_propagation_enabled: true,
            jwt_groups_enabled: false,
            jwt_groups_claim_name: String::new(),
        }
    }
}

/// Overlay network of an account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Network {
    pub identifier: String,

    /// Overlay prefix in CIDR notation
    pub net: String,

    pub dns: String,

    /// Bumped every time the network map changes
    pub serial: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSettings {
    /// Groups whose peers do not receive DNS management
    pub disabled_management_groups: Vec<String>,
}

/// Root aggregate for one tenant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Account {
    pub id: String,

    /// User that created the account
    pub created_by: String,
    pub created_at: Timestamp,

    pub domain: String,
    pub domain_category: DomainCategory,

    /// Whether this account is the canonical owner of its private domain
    pub is_domain_primary_account: bool,

    /// Setup keys keyed by key value
    pub setup_keys: HashMap<String, SetupKey>,

    pub network: Network,

    /// Peers keyed by ID. Legacy stores keyed this map by public key.
    pub peers: HashMap<String, Peer>,

    pub users: HashMap<String, User>,
    pub groups: HashMap<String, Group>,

    /// Ordered; rules keep their order inside each policy
    pub policies: Vec<Policy>,

    pub routes: HashMap<String, Route>,
    pub name_server_groups: HashMap<String, NameServerGroup>,
    pub dns_settings: DnsSettings,

    /// `None` only for accounts written before settings existed
    pub settings: Option<Settings>,
}

impl Account {
    pub fn new(id: impl Into<String>, created_by: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_by: created_by.into(),
            created_at: Timestamp::now(),
            domain: domain.into(),
            settings: Some(Settings::default()),
            ..Default::default()
        }
    }

    /// Whether the account should be reachable through the private-domain index
    pub fn owns_private_domain(&self) -> bool {
        self.is_domain_primary_account
            && self.domain_category == DomainCategory::Private
            && !self.domain.is_empty()
    }

    /// The built-in group that contains every peer
    pub fn group_all(&self) -> Option<&Group> {
        self.groups.values().find(|g| g.is_group_all())
    }

    pub fn find_peer_by_key(&self, key: &str) -> Option<&Peer> {
        self.peers.values().find(|p| p.key == key)
    }

    /// Find a setup key ignoring case
    pub fn find_setup_key(&self, key: &str) -> Option<&SetupKey> {
        self.setup_keys
            .values()
            .find(|k| k.key.eq_ignore_ascii_case(key))
    }

    /// Locate a token by ID across every user of the account
    pub fn find_user_by_token_id(&self, token_id: &str) -> Option<&User> {
        self.users.values().find(|u| u.pats.contains_key(token_id))
    }

    /// Make every keyed entity carry its map key as its identity.
    /// Both engines apply this before persisting.
    pub fn normalize_ids(&mut self) {
        for (key, setup_key) in self.setup_keys.iter_mut() {
            setup_key.key.clone_from(key);
        }
        for (id, peer) in self.peers.iter_mut() {
            peer.id.clone_from(id);
        }
        for (id, user) in self.users.iter_mut() {
            user.id.clone_from(id);
            for (token_id, pat) in user.pats.iter_mut() {
                pat.id.clone_from(token_id);
                pat.user_id.clone_from(id);
            }
        }
        for (id, group) in self.groups.iter_mut() {
            group.id.clone_from(id);
        }
        for (id, route) in self.routes.iter_mut() {
            route.id.clone_from(id);
        }
        for (id, nsg) in self.name_server_groups.iter_mut() {
            nsg.id.clone_from(id);
        }
    }

    /// Build a DNS label for `name` that no other peer of the account uses.
    pub fn unique_dns_label(&self, name: &str) -> String {
        let base = dns_label_from_name(name);
        let taken: HashSet<&str> = self
            .peers
            .values()
            .map(|p| p.dns_label.as_str())
            .filter(|l| !l.is_empty())
            .collect();

        if !taken.contains(base.as_str()) {
            return base;
        }

        let mut i = 1u32;
        loop {
            let suffix = format!("-{}", i);
            let mut candidate = base.clone();
            candidate.truncate(MAX_DNS_LABEL_LEN - suffix.len());
            candidate.push_str(&suffix);
            if !taken.contains(candidate.as_str()) {
                return candidate;
            }
            i += 1;
        }
    }
}

/// Turn a free-form peer name into a single DNS label.
///
/// Lower-cases, replaces anything outside `[a-z0-9-]` with `-`, trims
/// leading and trailing dashes and truncates to 63 bytes. Names with no
/// usable characters become `peer`.
pub fn dns_label_from_name(name: &str) -> String {
    let mapped: String = name
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();

    let mut label = mapped.trim_matches('-').to_string();
    label.truncate(MAX_DNS_LABEL_LEN);
    let label = label.trim_end_matches('-').to_string();

    if label.is_empty() {
        "peer".to_string()
    } else {
        label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::model::group::GROUP_ALL_NAME;
    use crate::core_store::model::user::PersonalAccessToken;

    #[test]
    fn test_settings_default_expiration() {
        let settings = Settings::default();
        assert!(settings.peer_login_expiration_enabled);
        assert_eq!(settings.peer_login_expiration, Duration::from_secs(86_400));
    }

    #[test]
    fn test_settings_serialize_humantime() {
        let json = serde_json::to_string(&Settings::default()).unwrap();
        assert!(json.contains("\"peer_login_expiration\":\"1day\""));

        let back: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Settings::default());
    }

    #[test]
    fn test_legacy_account_has_no_settings() {
        let account: Account = serde_json::from_str(r#"{"id":"acc1","domain":"example.com"}"#).unwrap();
        assert!(account.settings.is_none());
        assert!(account.peers.is_empty());
        assert!(account.policies.is_empty());
    }

    #[test]
    fn test_owns_private_domain() {
        let mut account = Account::new("acc1", "u1", "example.com");
        assert!(!account.owns_private_domain());

        account.domain_category = DomainCategory::Private;
        account.is_domain_primary_account = true;
        assert!(account.owns_private_domain());

        account.domain.clear();
        assert!(!account.owns_private_domain());
    }

    #[test]
    fn test_group_all_lookup() {
        let mut account = Account::new("acc1", "u1", "example.com");
        assert!(account.group_all().is_none());

        account
            .groups
            .insert("g1".to_string(), Group::new("g1", GROUP_ALL_NAME, vec![]));
        assert_eq!(account.group_all().map(|g| g.id.as_str()), Some("g1"));
    }

    #[test]
    fn test_find_setup_key_ignores_case() {
        let mut account = Account::new("acc1", "u1", "example.com");
        account.setup_keys.insert(
            "ABCD-1234".to_string(),
            SetupKey {
                id: "sk1".to_string(),
                key: "ABCD-1234".to_string(),
                ..Default::default()
            },
        );

        assert!(account.find_setup_key("abcd-1234").is_some());
        assert!(account.find_setup_key("other").is_none());
    }

    #[test]
    fn test_dns_label_from_name() {
        assert_eq!(dns_label_from_name("My Laptop"), "my-laptop");
        assert_eq!(dns_label_from_name("  --host_01.local "), "host-01-local");
        assert_eq!(dns_label_from_name("***"), "peer");
        assert_eq!(dns_label_from_name(&"a".repeat(80)).len(), 63);
    }

    #[test]
    fn test_unique_dns_label_appends_suffix() {
        let mut account = Account::new("acc1", "u1", "example.com");
        let mut peer = Peer::default();
        peer.dns_label = "laptop".to_string();
        account.peers.insert("p1".to_string(), peer.clone());

        assert_eq!(account.unique_dns_label("laptop"), "laptop-1");

        peer.dns_label = "laptop-1".to_string();
        account.peers.insert("p2".to_string(), peer);
        assert_eq!(account.unique_dns_label("Laptop"), "laptop-2");
        assert_eq!(account.unique_dns_label("desktop"), "desktop");
    }

    #[test]
    fn test_clone_is_deep() {
        let mut account = Account::new("acc1", "u1", "example.com");
        account
            .groups
            .insert("g1".to_string(), Group::new("g1", "devs", vec!["p1".to_string()]));

        let mut copy = account.clone();
        copy.groups.get_mut("g1").unwrap().peers.push("p2".to_string());

        assert_eq!(account.groups["g1"].peers.len(), 1);
    }

    #[test]
    fn test_normalize_ids_uses_map_keys() {
        let mut account = Account::new("acc1", "u1", "example.com");
        account.peers.insert("p1".to_string(), Peer::default());
        account.routes.insert("r1".to_string(), Route::default());
        account.name_server_groups.insert("ns1".to_string(), NameServerGroup::default());

        let mut user = User::default();
        user.pats.insert("t1".to_string(), PersonalAccessToken::default());
        account.users.insert("u1".to_string(), user);

        account.normalize_ids();

        assert_eq!(account.peers["p1"].id, "p1");
        assert_eq!(account.routes["r1"].id, "r1");
        assert_eq!(account.name_server_groups["ns1"].id, "ns1");
        assert_eq!(account.users["u1"].id, "u1");
        assert_eq!(account.users["u1"].pats["t1"].id, "t1");
        assert_eq!(account.users["u1"].pats["t1"].user_id, "u1");
        assert_eq!(account.find_user_by_token_id("t1").map(|u| u.id.as_str()), Some("u1"));
    }
}
