/*
    file_migration.rs - Load-time migration pass for the file store

    Runs once every time the store file is loaded, before the store
    accepts calls. Each step detects data that is already in the current
    shape and leaves it alone, so running the pass twice is a no-op.

    Steps, in order:
    1. default settings
    2. setup key, peer key and peer ID indices
    3. user issuer backfill and token indices
    4. private domain index
    5. policy rule normalisation
    6. peer DNS labels
    7. group issuer backfill
    8. empty route group lists point at the "All" group
    9. peer identity: peers keyed by public key get a generated ID
*/

use super::file_store::FileState;
use crate::core_store::model::{generate_id, Account, Settings, Timestamp, ISSUED_API};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, error};

/// One migration step. Returns how many records it changed.
type Step = fn(&mut FileState) -> usize;

const STEPS: &[(&str, Step)] = &[
    ("default settings", default_settings),
    ("peer and setup key indices", rebuild_peer_and_key_indices),
    ("users and tokens", migrate_users_and_tokens),
    ("private domains", index_private_domains),
    ("policies", upgrade_policies),
    ("dns labels", backfill_dns_labels),
    ("group issuer", backfill_group_issuer),
    ("route groups", backfill_route_groups),
    ("peer identity", migrate_peer_ids),
];

/// Per-step change counts of one migration run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub changes: Vec<(&'static str, usize)>,
}

impl MigrationReport {
    pub fn total(&self) -> usize {
        self.changes.iter().map(|(_, n)| n).sum()
    }

    pub fn changed(&self, step: &str) -> usize {
        self.changes
            .iter()
            .find(|(name, _)| *name == step)
            .map_or(0, |(_, n)| *n)
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let changed: Vec<String> = self
            .changes
            .iter()
            .filter(|(_, n)| *n > 0)
            .map(|(name, n)| format!("{}={}", name, n))
            .collect();
        if changed.is_empty() {
            write!(f, "nothing to migrate")
        } else {
            write!(f, "{}", changed.join(", "))
        }
    }
}

/// Bring loaded state up to date and rebuild every index from account data.
pub(crate) fn migrate(state: &mut FileState) -> MigrationReport {
    // Indices are derived data, never trusted from a previous run
    state.clear_indices();

    let mut report = MigrationReport::default();
    for &(name, step) in STEPS {
        let changed = step(state);
        debug!("migration step '{}' changed {} records", name, changed);
        report.changes.push((name, changed));
    }
    report
}

/// Accounts written before settings existed predate login expiration, keep it off
fn default_settings(state: &mut FileState) -> usize {
    let mut changed = 0;
    for account in state.accounts.values_mut() {
        if account.settings.is_none() {
            account.settings = Some(Settings {
                peer_login_expiration_enabled: false,
                ..Settings::default()
            });
            changed += 1;
        }
    }
    changed
}

fn rebuild_peer_and_key_indices(state: &mut FileState) -> usize {
    let FileState {
        accounts,
        setup_key_to_account,
        peer_key_to_account,
        peer_id_to_account,
        ..
    } = state;

    for (account_id, account) in accounts.iter() {
        for key in account.setup_keys.values() {
            setup_key_to_account.insert(key.key.to_uppercase(), account_id.clone());
        }
        for peer in account.peers.values() {
            if !peer.key.is_empty() {
                peer_key_to_account.insert(peer.key.clone(), account_id.clone());
            }
            // Peers without an ID are indexed once the identity step assigns one
            if !peer.id.is_empty() {
                peer_id_to_account.insert(peer.id.clone(), account_id.clone());
            }
        }
    }
    0
}

fn migrate_users_and_tokens(state: &mut FileState) -> usize {
    let FileState {
        accounts,
        user_id_to_account,
        hashed_pat_to_token_id,
        token_id_to_user_id,
        ..
    } = state;

    let mut changed = 0;
    for (account_id, account) in accounts.iter_mut() {
        for user in account.users.values_mut() {
            user_id_to_account.insert(user.id.clone(), account_id.clone());
            if user.issued.is_empty() {
                user.issued = ISSUED_API.to_string();
                changed += 1;
            }
            for pat in user.pats.values() {
                token_id_to_user_id.insert(pat.id.clone(), user.id.clone());
                hashed_pat_to_token_id.insert(pat.hashed_token.clone(), pat.id.clone());
            }
        }
    }
    changed
}

fn index_private_domains(state: &mut FileState) -> usize {
    for (account_id, account) in state.accounts.iter() {
        if account.owns_private_domain() {
            state
                .private_domain_to_account
                .insert(account.domain.to_lowercase(), account_id.clone());
        }
    }
    0
}

fn upgrade_policies(state: &mut FileState) -> usize {
    state
        .accounts
        .values_mut()
        .flat_map(|account| account.policies.iter_mut())
        .filter_map(|policy| policy.upgrade_and_fix().then_some(()))
        .count()
}

fn backfill_dns_labels(state: &mut FileState) -> usize {
    let mut changed = 0;
    for account in state.accounts.values_mut() {
        changed += label_peers(account);
    }
    changed
}

/// Give every unlabeled peer of `account` a unique label. Peers are handled
/// in map-key order so the result does not depend on hash order.
fn label_peers(account: &mut Account) -> usize {
    let mut unlabeled: Vec<String> = account
        .peers
        .iter()
        .filter(|(_, peer)| peer.dns_label.is_empty())
        .map(|(key, _)| key.clone())
        .collect();
    unlabeled.sort();

    for key in &unlabeled {
        let name = account.peers.get(key).map(|p| p.name.clone()).unwrap_or_default();
        let label = account.unique_dns_label(&name);
        if let Some(peer) = account.peers.get_mut(key) {
            peer.dns_label = label;
        }
    }
    unlabeled.len()
}

fn backfill_group_issuer(state: &mut FileState) -> usize {
    let mut changed = 0;
    for group in state.accounts.values_mut().flat_map(|a| a.groups.values_mut()) {
        if group.issued.is_empty() {
            group.issued = ISSUED_API.to_string();
            changed += 1;
        }
    }
    changed
}

fn backfill_route_groups(state: &mut FileState) -> usize {
    let mut changed = 0;
    for (account_id, account) in state.accounts.iter_mut() {
        let all_group_id = match account.group_all() {
            Some(group) => group.id.clone(),
            None => {
                error!(
                    "unable to find the All group of account {}, skipping route group migration",
                    account_id
                );
                continue;
            }
        };

        for route in account.routes.values_mut() {
            if route.groups.is_empty() {
                route.groups = vec![all_group_id.clone()];
                changed += 1;
            }
        }
    }
    changed
}

/// Re-key peers stored under their public key and rewrite every reference to them.
fn migrate_peer_ids(state: &mut FileState) -> usize {
    let FileState {
        accounts,
        peer_id_to_account,
        ..
    } = state;

    let mut changed = 0;
    for (account_id, account) in accounts.iter_mut() {
        let now = Timestamp::now();
        for peer in account.peers.values_mut() {
            if peer.last_login.is_zero() {
                peer.last_login = now;
                changed += 1;
            }
        }

        // old map key -> new ID
        let mut renamed: HashMap<String, String> = HashMap::new();
        for (key, peer) in account.peers.iter_mut() {
            if peer.id.is_empty() {
                peer.id = generate_id();
                renamed.insert(key.clone(), peer.id.clone());
            }
        }
        if renamed.is_empty() {
            continue;
        }

        for (old_key, new_id) in &renamed {
            if let Some(peer) = account.peers.remove(old_key) {
                account.peers.insert(new_id.clone(), peer);
                peer_id_to_account.insert(new_id.clone(), account_id.clone());
            }
        }

        for group in account.groups.values_mut() {
            for member in group.peers.iter_mut() {
                if let Some(new_id) = renamed.get(member) {
                    *member = new_id.clone();
                }
            }
        }

        for route in account.routes.values_mut() {
            if let Some(new_id) = renamed.get(&route.peer) {
                route.peer = new_id.clone();
            }
        }

        changed += renamed.len();
    }
    changed
}
