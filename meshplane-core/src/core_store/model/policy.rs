/*
    policy.rs - Access control policy model

    A policy owns an ordered list of rules. Each rule connects source
    groups to destination groups over a protocol and optional ports.
*/

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyTrafficAction {
    #[default]
    Accept,
    Drop,
}

impl PolicyTrafficAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyTrafficAction::Accept => "accept",
            PolicyTrafficAction::Drop => "drop",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "drop" => PolicyTrafficAction::Drop,
            _ => PolicyTrafficAction::Accept,
        }
    }
}

/// Protocol matched by a rule. `Unset` only appears in stores written
/// before the field existed and is upgraded to `All` on load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyRuleProtocol {
    #[default]
    #[serde(rename = "")]
    Unset,
    All,
    Tcp,
    Udp,
    Icmp,
}

impl PolicyRuleProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyRuleProtocol::Unset => "",
            PolicyRuleProtocol::All => "all",
            PolicyRuleProtocol::Tcp => "tcp",
            PolicyRuleProtocol::Udp => "udp",
            PolicyRuleProtocol::Icmp => "icmp",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "all" => PolicyRuleProtocol::All,
            "tcp" => PolicyRuleProtocol::Tcp,
            "udp" => PolicyRuleProtocol::Udp,
            "icmp" => PolicyRuleProtocol::Icmp,
            _ => PolicyRuleProtocol::Unset,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyRule {
    pub id: String,
    pub policy_id: String,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub action: PolicyTrafficAction,

    /// Destination group IDs
    pub destinations: Vec<String>,

    /// Source group IDs
    pub sources: Vec<String>,

    pub bidirectional: bool,
    pub protocol: PolicyRuleProtocol,
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub id: String,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub rules: Vec<PolicyRule>,
}

impl Policy {
    /// Bring rules written by older versions to the current representation.
    ///
    /// Returns true when any rule changed.
    pub fn upgrade_and_fix(&mut self) -> bool {
        let mut changed = false;
        for rule in &mut self.rules {
            if rule.protocol == PolicyRuleProtocol::Unset {
                rule.protocol = PolicyRuleProtocol::All;
                changed = true;
            }
            if rule.protocol == PolicyRuleProtocol::All && !rule.bidirectional {
                rule.bidirectional = true;
                changed = true;
            }
            if rule.policy_id.is_empty() {
                rule.policy_id = self.id.clone();
                changed = true;
            }
        }
        changed
    }

    /// Group IDs referenced by any rule, as source or destination
    pub fn rule_groups(&self) -> Vec<String> {
        let mut groups = Vec::new();
        for rule in &self.rules {
            groups.extend(rule.sources.iter().cloned());
            groups.extend(rule.destinations.iter().cloned());
        }
        groups.sort();
        groups.dedup();
        groups
    }
}
