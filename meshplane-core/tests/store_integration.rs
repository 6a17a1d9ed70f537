//! End-to-end store scenarios through the public API

use meshplane_core::config::StoreConfig;
use meshplane_core::model::{Account, Group, Peer, Policy, PolicyRule, PolicyRuleProtocol, Route, UserRole};
use meshplane_core::test_utils::fixtures::{test_full_account, TestAccountBuilder};
use meshplane_core::{open_store, FileStore, MetricsCollector, SqlStore, Store, StoreEngine};
use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Store file in the shape written before peers had IDs and before
/// settings, DNS labels and issuers existed
fn write_legacy_store(dir: &std::path::Path) {
    let mut legacy = Account {
        id: "legacy".to_string(),
        ..Default::default()
    };

    let mut peer = Peer::new("", "legacy-pub-key", "100.64.0.5".parse().unwrap());
    peer.name = "Office Laptop".to_string();
    legacy.peers.insert("legacy-pub-key".to_string(), peer);

    let mut all = Group::new("all", "All", vec!["legacy-pub-key".to_string()]);
    all.issued.clear();
    legacy.groups.insert("all".to_string(), all);

    legacy.routes.insert(
        "r1".to_string(),
        Route {
            id: "r1".to_string(),
            network: "10.0.0.0/8".to_string(),
            peer: "legacy-pub-key".to_string(),
            ..Default::default()
        },
    );
    legacy.policies.push(Policy {
        id: "pol".to_string(),
        rules: vec![PolicyRule {
            id: "rule".to_string(),
            protocol: PolicyRuleProtocol::Unset,
            ..Default::default()
        }],
        ..Default::default()
    });

    let mut accounts = HashMap::new();
    accounts.insert(legacy.id.clone(), legacy);
    let body = serde_json::json!({ "accounts": accounts, "installation_id": "legacy-install" });
    fs::write(dir.join("store.json"), serde_json::to_vec(&body).unwrap()).unwrap();
}

#[test]
fn test_legacy_store_is_migrated_on_open() {
    let dir = tempfile::tempdir().unwrap();
    write_legacy_store(dir.path());

    let store = FileStore::new(dir.path(), None).unwrap();
    let account = store.get_account_by_peer_pub_key("legacy-pub-key").unwrap();

    let (peer_id, peer) = account.peers.iter().next().unwrap();
    assert_ne!(peer_id, "legacy-pub-key");
    assert_eq!(&peer.id, peer_id);
    assert_eq!(peer.dns_label, "office-laptop");
    assert!(!peer.last_login.is_zero());

    assert_eq!(account.groups["all"].peers, vec![peer_id.clone()]);
    assert_eq!(account.groups["all"].issued, "api");
    assert_eq!(account.routes["r1"].peer, *peer_id);
    assert_eq!(account.routes["r1"].groups, vec!["all".to_string()]);

    let rule = &account.policies[0].rules[0];
    assert_eq!(rule.protocol, PolicyRuleProtocol::All);
    assert!(rule.bidirectional);

    let settings = account.settings.unwrap();
    assert!(!settings.peer_login_expiration_enabled);
    assert_eq!(settings.peer_login_expiration, Duration::from_secs(24 * 3600));

    assert_eq!(store.get_account_by_peer_id(peer_id).unwrap().id, "legacy");
    assert_eq!(store.get_installation_id().unwrap(), "legacy-install");
}

#[test]
fn test_migration_is_idempotent_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    write_legacy_store(dir.path());

    let first = FileStore::new(dir.path(), None).unwrap().get_account("legacy").unwrap();
    let on_disk = fs::read(dir.path().join("store.json")).unwrap();

    let second = FileStore::new(dir.path(), None).unwrap().get_account("legacy").unwrap();
    assert_eq!(first, second);
    assert_eq!(on_disk, fs::read(dir.path().join("store.json")).unwrap());
}

#[test]
fn test_account_lock_serializes_critical_sections() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(SqlStore::new(dir.path(), None).unwrap());
    let inside = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    let guard = store.acquire_account_write_lock("shared");
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    thread::yield_now();
                    inside.fetch_sub(1, Ordering::SeqCst);
                    guard.release();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
}

#[test]
fn test_concurrent_saves_of_distinct_accounts() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(SqlStore::new(dir.path(), None).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let store = store.clone();
            thread::spawn(move || {
                let id = format!("acc{}", i);
                let _guard = store.acquire_account_write_lock(&id);
                store.save_account(&test_full_account(&id)).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.get_all_accounts().unwrap().len(), 4);
}

#[test]
fn test_open_store_reports_metrics() {
    let dir = tempfile::tempdir().unwrap();
    let collector = Arc::new(MetricsCollector::new());
    let config = StoreConfig {
        engine: Some(StoreEngine::Sqlite),
        data_dir: dir.path().to_path_buf(),
        max_open_conns: Some(2),
        ..Default::default()
    };

    let store = open_store(&config, Some(collector.clone())).unwrap();
    store.save_account(&TestAccountBuilder::new("acc1").with_user("u1", UserRole::Owner).build()).unwrap();
    drop(store.acquire_global_lock());
    drop(store.acquire_account_read_lock("acc1"));

    let snapshot = collector.snapshot();
    assert_eq!(snapshot.persistence_count, 1);
    assert_eq!(snapshot.global_lock_count, 1);
    assert_eq!(snapshot.account_lock_count, 1);
}
