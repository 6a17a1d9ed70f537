//! Test fixtures for creating common test objects
//!
//! Provides builder patterns and factory functions for creating test data.

use crate::core_store::model::{
    Account, DomainCategory, Group, NameServer, NameServerGroup, NameServerType, Peer,
    PersonalAccessToken, Policy, PolicyRule, PolicyRuleProtocol, PolicyTrafficAction, Route,
    SetupKey, SetupKeyType, Timestamp, User, UserRole, GROUP_ALL_NAME,
};
use std::net::{IpAddr, Ipv4Addr};

/// Builder for account aggregates.
///
/// Every account gets an "All" group that tracks the peers added through
/// the builder. Peers receive distinct addresses from 100.64.0.0/10.
pub struct TestAccountBuilder {
    account: Account,
    next_host: u32,
}

impl TestAccountBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let mut account = Account::new(id.clone(), format!("{}-owner", id), "");
        account.created_at = Timestamp::from_millis(1_700_000_000_000);
        account.network.identifier = format!("net-{}", id);
        account.network.net = "100.64.0.0/10".to_string();

        let all = Group::new(format!("{}-all", id), GROUP_ALL_NAME, Vec::new());
        account.groups.insert(all.id.clone(), all);

        Self { account, next_host: 1 }
    }

    fn all_group_id(&self) -> String {
        format!("{}-all", self.account.id)
    }

    pub fn with_peer(mut self, id: &str, key: &str) -> Self {
        let host = self.next_host;
        self.next_host += 1;
        let ip = IpAddr::V4(Ipv4Addr::from(u32::from(Ipv4Addr::new(100, 64, 0, 0)) + host));

        let mut peer = Peer::new(id, key, ip);
        peer.name = format!("peer {}", id);
        peer.dns_label = self.account.unique_dns_label(&peer.name);
        peer.meta.hostname = format!("host-{}", id);
        peer.last_login = Timestamp::from_millis(1_700_000_000_000);

        let all = self.all_group_id();
        if let Some(group) = self.account.groups.get_mut(&all) {
            group.peers.push(id.to_string());
        }
        self.account.peers.insert(id.to_string(), peer);
        self
    }

    pub fn with_user(mut self, id: &str, role: UserRole) -> Self {
        let mut user = User::new(id, role);
        user.last_login = Timestamp::from_millis(1_700_000_000_000);
        self.account.users.insert(id.to_string(), user);
        self
    }

    /// Add a user holding one personal access token
    pub fn with_token(mut self, user_id: &str, token_id: &str, hashed_token: &str) -> Self {
        let mut user = self
            .account
            .users
            .remove(user_id)
            .unwrap_or_else(|| User::new(user_id, UserRole::User));
        user.pats.insert(token_id.to_string(), test_token(token_id, user_id, hashed_token));
        self.account.users.insert(user_id.to_string(), user);
        self
    }

    pub fn with_setup_key(mut self, id: &str, key: &str) -> Self {
        let setup_key = SetupKey {
            id: id.to_string(),
            key: key.to_string(),
            name: format!("key {}", id),
            key_type: SetupKeyType::Reusable,
            created_at: Timestamp::from_millis(1_700_000_000_000),
            auto_groups: vec![self.all_group_id()],
            ..Default::default()
        };
        self.account.setup_keys.insert(key.to_string(), setup_key);
        self
    }

    pub fn with_group(mut self, id: &str, name: &str, peers: &[&str]) -> Self {
        let group = Group::new(id, name, peers.iter().map(|p| p.to_string()).collect());
        self.account.groups.insert(id.to_string(), group);
        self
    }

    pub fn with_route(mut self, id: &str, network: &str, peer: &str) -> Self {
        let route = Route {
            id: id.to_string(),
            network: network.to_string(),
            net_id: format!("route-{}", id),
            peer: peer.to_string(),
            metric: 9999,
            enabled: true,
            groups: vec![self.all_group_id()],
            ..Default::default()
        };
        self.account.routes.insert(id.to_string(), route);
        self
    }

    /// Add an accept-all policy between the given groups
    pub fn with_policy(mut self, id: &str, sources: &[&str], destinations: &[&str]) -> Self {
        let policy = Policy {
            id: id.to_string(),
            name: format!("policy {}", id),
            enabled: true,
            rules: vec![PolicyRule {
                id: format!("{}-rule", id),
                policy_id: id.to_string(),
                name: format!("rule {}", id),
                enabled: true,
                action: PolicyTrafficAction::Accept,
                sources: sources.iter().map(|g| g.to_string()).collect(),
                destinations: destinations.iter().map(|g| g.to_string()).collect(),
                bidirectional: true,
                protocol: PolicyRuleProtocol::All,
                ..Default::default()
            }],
            ..Default::default()
        };
        self.account.policies.push(policy);
        self
    }

    pub fn with_name_server_group(mut self, id: &str, ip: IpAddr) -> Self {
        let nsg = NameServerGroup {
            id: id.to_string(),
            name: format!("dns {}", id),
            name_servers: vec![NameServer {
                ip,
                ns_type: NameServerType::Udp,
                port: 53,
            }],
            groups: vec![self.all_group_id()],
            primary: true,
            enabled: true,
            ..Default::default()
        };
        self.account.name_server_groups.insert(id.to_string(), nsg);
        self
    }

    /// Make the account the primary owner of a private domain
    pub fn with_private_domain(mut self, domain: &str) -> Self {
        self.account.domain = domain.to_string();
        self.account.domain_category = DomainCategory::Private;
        self.account.is_domain_primary_account = true;
        self
    }

    pub fn build(self) -> Account {
        self.account
    }
}

pub fn test_token(id: &str, user_id: &str, hashed_token: &str) -> PersonalAccessToken {
    PersonalAccessToken {
        id: id.to_string(),
        user_id: user_id.to_string(),
        name: format!("token {}", id),
        hashed_token: hashed_token.to_string(),
        expiration_date: Timestamp::from_millis(1_800_000_000_000),
        created_by: user_id.to_string(),
        created_at: Timestamp::from_millis(1_700_000_000_000),
        last_used: Timestamp::ZERO,
    }
}

/// Account with one of everything, used where a realistic aggregate matters
pub fn test_full_account(id: &str) -> Account {
    let p1 = format!("{}-p1", id);
    let dev = format!("{}-dev", id);
    let all = format!("{}-all", id);

    TestAccountBuilder::new(id)
        .with_peer(&p1, &format!("{}-key1", id))
        .with_peer(&format!("{}-p2", id), &format!("{}-key2", id))
        .with_user(&format!("{}-u1", id), UserRole::Owner)
        .with_token(&format!("{}-u2", id), &format!("{}-t1", id), &format!("{}-hash1", id))
        .with_setup_key(&format!("{}-sk1", id), &format!("{}-SETUP", id).to_uppercase())
        .with_group(&dev, "dev", &[p1.as_str()])
        .with_route(&format!("{}-r1", id), "10.10.0.0/16", &p1)
        .with_policy(&format!("{}-pol", id), &[dev.as_str()], &[all.as_str()])
        .with_name_server_group(&format!("{}-ns", id), IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)))
        .build()
}
