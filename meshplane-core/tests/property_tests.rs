//! Property tests for save/get behaviour of both engines

use meshplane_core::model::{Account, Peer, PeerStatus, Timestamp};
use meshplane_core::test_utils::fixtures::TestAccountBuilder;
use meshplane_core::{FileStore, SqlStore, Store};
use proptest::prelude::*;
use std::net::{IpAddr, Ipv4Addr};

fn account_strategy() -> impl Strategy<Value = Account> {
    (
        "[a-z]{1,12}",
        prop::collection::btree_set("[a-z0-9]{4,10}", 0..6),
        "[A-Za-z ]{0,20}",
        any::<bool>(),
    )
        .prop_map(|(id, peer_ids, name, connected)| {
            let mut account = TestAccountBuilder::new(&id).build();
            for (i, peer_id) in peer_ids.into_iter().enumerate() {
                let ip = IpAddr::V4(Ipv4Addr::new(100, 64, 1, i as u8 + 1));
                let mut peer = Peer::new(format!("{}-{}", id, peer_id), format!("key-{}-{}", id, peer_id), ip);
                peer.name = name.clone();
                peer.status = PeerStatus {
                    connected,
                    last_seen: Timestamp::from_millis(i as u64),
                    login_expired: false,
                };
                account.peers.insert(peer.id.clone(), peer);
            }
            account
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_file_store_round_trip(account in account_strategy()) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path(), None).unwrap();
        store.save_account(&account).unwrap();
        prop_assert_eq!(store.get_account(&account.id).unwrap(), account.clone());

        for peer in account.peers.values() {
            prop_assert_eq!(store.get_account_by_peer_pub_key(&peer.key).unwrap().id, account.id.clone());
        }
    }

    #[test]
    fn prop_sql_store_round_trip(account in account_strategy()) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqlStore::new(dir.path(), None).unwrap();
        store.save_account(&account).unwrap();
        prop_assert_eq!(store.get_account(&account.id).unwrap(), account.clone());

        for peer in account.peers.values() {
            prop_assert_eq!(store.get_account_by_peer_id(&peer.id).unwrap().id, account.id.clone());
        }
    }

    #[test]
    fn prop_mutating_a_copy_never_leaks(account in account_strategy(), new_name in "[a-z]{1,8}") {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path(), None).unwrap();
        store.save_account(&account).unwrap();

        let mut copy = store.get_account(&account.id).unwrap();
        copy.domain = new_name;
        copy.peers.clear();
        copy.groups.clear();

        prop_assert_eq!(store.get_account(&account.id).unwrap(), account);
    }
}
