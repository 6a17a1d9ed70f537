//! SQLite backed store
//!
//! Accounts are normalized into one table per entity. There are no
//! in-memory indices: every lookup queries the natural key column of
//! the relevant table. Saving an account deletes its rows and inserts
//! the whole aggregate again inside one IMMEDIATE transaction.

use super::engine::{Store, StoreEngine};
use super::errors::{StoreError, StoreResult};
use super::locks::{LockGuard, LockRegistry};
use super::sql_migrations;
use super::sql_schema::{self, TableSpec};
use crate::core_store::model::{
    Account, DnsSettings, DomainCategory, Group, NameServerGroup, Network, NetworkType, Peer,
    PeerStatus, PersonalAccessToken, Policy, PolicyRule, PolicyRuleProtocol, PolicyTrafficAction,
    Route, Settings, SetupKey, SetupKeyType, Timestamp, User, UserRole,
};
use crate::metrics::{StoreMetrics, Timer};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{named_params, params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// File name of the database inside the data directory
pub const SQLITE_FILE_NAME: &str = "store.db";

/// Connection settings
#[derive(Debug, Clone)]
pub struct SqlOptions {
    /// Pool size, one connection per core by default
    pub max_open_conns: usize,
    pub busy_timeout: Duration,
}

impl Default for SqlOptions {
    fn default() -> Self {
        Self {
            max_open_conns: num_cpus::get(),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Store backed by a SQLite database
pub struct SqlStore {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
    locks: LockRegistry,
    metrics: Option<Arc<dyn StoreMetrics>>,
}

impl SqlStore {
    pub fn new(data_dir: impl AsRef<Path>, metrics: Option<Arc<dyn StoreMetrics>>) -> StoreResult<Self> {
        Self::with_options(data_dir, SqlOptions::default(), metrics)
    }

    /// Open (or create) `store.db` in `data_dir`, run legacy migrations, then auto-schema.
    pub fn with_options(
        data_dir: impl AsRef<Path>,
        options: SqlOptions,
        metrics: Option<Arc<dyn StoreMetrics>>,
    ) -> StoreResult<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(SQLITE_FILE_NAME);

        let busy_timeout = options.busy_timeout;
        let manager = SqliteConnectionManager::file(&path).with_init(move |conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
            conn.busy_timeout(busy_timeout)
        });
        let pool = Pool::builder()
            .max_size(options.max_open_conns.max(1) as u32)
            .build(manager)?;

        sql_migrations::migrate(&pool)?;
        sql_schema::auto_migrate(&*pool.get()?)?;

        info!(
            "opened sqlite store {} with {} connections",
            path.display(),
            options.max_open_conns.max(1)
        );

        Ok(Self {
            pool,
            path,
            locks: LockRegistry::new(true, metrics.clone()),
            metrics,
        })
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> StoreResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn report_persistence(&self, timer: Timer) {
        let took = timer.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.count_persistence_duration(took);
        }
        debug!("took {:?} to persist to the sqlite store", took);
    }

    /// Resolve an account ID through a single-column lookup
    fn lookup_account_id(&self, sql: &str, key: &str, what: &str) -> StoreResult<String> {
        self.conn()?
            .query_row(sql, [key], |row| row.get(0))
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("{} {} not found", what, key)))
    }

    fn account_exists(conn: &Connection, account_id: &str) -> StoreResult<bool> {
        Ok(conn
            .query_row("SELECT 1 FROM accounts WHERE id = ?1", [account_id], |_| Ok(()))
            .optional()?
            .is_some())
    }

    /// NotFound for the account when it is missing, else for the entity
    fn missing(conn: &Connection, account_id: &str, what: &str, id: &str) -> StoreError {
        match Self::account_exists(conn, account_id) {
            Ok(false) => StoreError::account_not_found(account_id),
            Ok(true) => StoreError::NotFound(format!("{} {} not found", what, id)),
            Err(e) => e,
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> StoreResult<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a JSON text column. NULL and empty text decode to the default value.
fn json_col<T: DeserializeOwned + Default>(row: &Row, column: &str) -> rusqlite::Result<T> {
    match row.get::<_, Option<String>>(column)? {
        None => Ok(T::default()),
        Some(text) if text.is_empty() => Ok(T::default()),
        Some(text) => serde_json::from_str(&text).map_err(|e| {
            let idx = row.as_ref().column_index(column).unwrap_or_default();
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
        }),
    }
}

/// Read an INTEGER column holding an unsigned value. Negative values are
/// reported as out of range rather than clamped.
fn u64_col(row: &Row, column: &str) -> rusqlite::Result<u64> {
    let value: i64 = row.get(column)?;
    u64::try_from(value).map_err(|_| {
        let idx = row.as_ref().column_index(column).unwrap_or_default();
        rusqlite::Error::IntegralValueOutOfRange(idx, value)
    })
}

fn ts_col(row: &Row, column: &str) -> rusqlite::Result<Timestamp> {
    u64_col(row, column).map(Timestamp::from_millis)
}

/// SQLite integers are signed; values above `i64::MAX` cannot be stored.
fn to_sql_int(value: u64, what: &str) -> StoreResult<i64> {
    i64::try_from(value)
        .map_err(|_| StoreError::InvalidArgument(format!("{} {} does not fit a sqlite integer", what, value)))
}

fn millis(ts: Timestamp) -> StoreResult<i64> {
    to_sql_int(ts.as_millis(), "timestamp")
}

fn read_setup_key(row: &Row) -> rusqlite::Result<SetupKey> {
    Ok(SetupKey {
        id: row.get("id")?,
        key: row.get("key")?,
        name: row.get("name")?,
        key_type: SetupKeyType::parse(&row.get::<_, String>("key_type")?),
        created_at: ts_col(row, "created_at")?,
        expires_at: ts_col(row, "expires_at")?,
        updated_at: ts_col(row, "updated_at")?,
        revoked: row.get("revoked")?,
        used_times: row.get("used_times")?,
        last_used: ts_col(row, "last_used")?,
        auto_groups: json_col(row, "auto_groups")?,
        usage_limit: row.get("usage_limit")?,
        ephemeral: row.get("ephemeral")?,
    })
}

fn read_peer(row: &Row) -> rusqlite::Result<Peer> {
    let ip: Option<IpAddr> = json_col(row, "ip")?;
    Ok(Peer {
        id: row.get("id")?,
        key: row.get("key")?,
        setup_key: row.get("setup_key")?,
        ip: ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        meta: json_col(row, "meta")?,
        name: row.get("name")?,
        dns_label: row.get("dns_label")?,
        status: PeerStatus {
            last_seen: ts_col(row, "status_last_seen")?,
            connected: row.get("status_connected")?,
            login_expired: row.get("status_login_expired")?,
        },
        user_id: row.get("user_id")?,
        ssh_key: row.get("ssh_key")?,
        ssh_enabled: row.get("ssh_enabled")?,
        login_expiration_enabled: row.get("login_expiration_enabled")?,
        last_login: ts_col(row, "last_login")?,
        location: crate::core_store::model::Location {
            connection_ip: json_col(row, "location_connection_ip")?,
            country_code: row.get("location_country_code")?,
            city_name: row.get("location_city_name")?,
            geo_name_id: row.get("location_geo_name_id")?,
        },
    })
}

fn read_user(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get("id")?,
        role: UserRole::parse(&row.get::<_, String>("role")?),
        is_service_user: row.get("is_service_user")?,
        non_deletable: row.get("non_deletable")?,
        service_user_name: row.get("service_user_name")?,
        auto_groups: json_col(row, "auto_groups")?,
        blocked: row.get("blocked")?,
        last_login: ts_col(row, "last_login")?,
        issued: row.get("issued")?,
        pats: HashMap::new(),
    })
}

fn read_pat(row: &Row) -> rusqlite::Result<PersonalAccessToken> {
    Ok(PersonalAccessToken {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        name: row.get("name")?,
        hashed_token: row.get("hashed_token")?,
        expiration_date: ts_col(row, "expiration_date")?,
        created_by: row.get("created_by")?,
        created_at: ts_col(row, "created_at")?,
        last_used: ts_col(row, "last_used")?,
    })
}

fn read_group(row: &Row) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get("id")?,
        name: row.get("name")?,
        issued: row.get("issued")?,
        peers: json_col(row, "peers")?,
    })
}

fn read_policy(row: &Row) -> rusqlite::Result<Policy> {
    Ok(Policy {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        enabled: row.get("enabled")?,
        rules: Vec::new(),
    })
}

fn read_rule(row: &Row) -> rusqlite::Result<PolicyRule> {
    Ok(PolicyRule {
        id: row.get("id")?,
        policy_id: row.get("policy_id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        enabled: row.get("enabled")?,
        action: PolicyTrafficAction::parse(&row.get::<_, String>("action")?),
        destinations: json_col(row, "destinations")?,
        sources: json_col(row, "sources")?,
        bidirectional: row.get("bidirectional")?,
        protocol: PolicyRuleProtocol::parse(&row.get::<_, String>("protocol")?),
        ports: json_col(row, "ports")?,
    })
}

fn read_route(row: &Row) -> rusqlite::Result<Route> {
    Ok(Route {
        id: row.get("id")?,
        network: json_col(row, "network")?,
        net_id: row.get("net_id")?,
        description: row.get("description")?,
        peer: row.get("peer")?,
        peer_groups: json_col(row, "peer_groups")?,
        network_type: NetworkType::from_i64(row.get("network_type")?),
        masquerade: row.get("masquerade")?,
        metric: row.get("metric")?,
        enabled: row.get("enabled")?,
        groups: json_col(row, "groups")?,
    })
}

fn read_name_server_group(row: &Row) -> rusqlite::Result<NameServerGroup> {
    Ok(NameServerGroup {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        name_servers: json_col(row, "name_servers")?,
        groups: json_col(row, "groups")?,
        primary: row.get("is_primary")?,
        domains: json_col(row, "domains")?,
        enabled: row.get("enabled")?,
        search_domains_enabled: row.get("search_domains_enabled")?,
    })
}

/// Run `SELECT * FROM table WHERE <filter>` and map every row
fn select_where<T>(
    conn: &Connection,
    table: &TableSpec,
    filter: &str,
    key: &str,
    read: fn(&Row) -> rusqlite::Result<T>,
) -> StoreResult<Vec<T>> {
    let sql = format!("{} WHERE {}", table.select_sql(), filter);
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map([key], read)?.collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Materialize one account with every owned entity
fn load_account(conn: &Connection, account_id: &str) -> StoreResult<Account> {
    let sql = format!("{} WHERE id = ?1", sql_schema::ACCOUNTS.select_sql());
    let mut account = conn
        .query_row(&sql, [account_id], |row| {
            let settings: Option<Settings> = json_col(row, "settings")?;
            let dns_settings: DnsSettings = json_col(row, "dns_settings")?;
            Ok(Account {
                id: row.get("id")?,
                created_by: row.get("created_by")?,
                created_at: ts_col(row, "created_at")?,
                domain: row.get("domain")?,
                domain_category: DomainCategory::parse(&row.get::<_, String>("domain_category")?),
                is_domain_primary_account: row.get("is_domain_primary_account")?,
                network: Network {
                    identifier: row.get("network_identifier")?,
                    net: json_col(row, "network_net")?,
                    dns: row.get("network_dns")?,
                    serial: u64_col(row, "network_serial")?,
                },
                dns_settings,
                settings,
                ..Default::default()
            })
        })
        .optional()?
        .ok_or_else(|| StoreError::account_not_found(account_id))?;

    let by_account = "account_id = ?1";

    account.setup_keys = select_where(conn, &sql_schema::SETUP_KEYS, by_account, account_id, read_setup_key)?
        .into_iter()
        .map(|k| (k.key.clone(), k))
        .collect();

    account.peers = select_where(conn, &sql_schema::PEERS, by_account, account_id, read_peer)?
        .into_iter()
        .map(|p| (p.id.clone(), p))
        .collect();

    let mut users: HashMap<String, User> =
        select_where(conn, &sql_schema::USERS, by_account, account_id, read_user)?
            .into_iter()
            .map(|u| (u.id.clone(), u))
            .collect();
    let pats = select_where(
        conn,
        &sql_schema::PERSONAL_ACCESS_TOKENS,
        "user_id IN (SELECT id FROM users WHERE account_id = ?1)",
        account_id,
        read_pat,
    )?;
    for pat in pats {
        if let Some(user) = users.get_mut(&pat.user_id) {
            user.pats.insert(pat.id.clone(), pat);
        }
    }
    account.users = users;

    account.groups = select_where(conn, &sql_schema::GROUPS, by_account, account_id, read_group)?
        .into_iter()
        .map(|g| (g.id.clone(), g))
        .collect();

    // Rules are not reachable through the account, query them per policy
    let mut policies = select_where(
        conn,
        &sql_schema::POLICIES,
        "account_id = ?1 ORDER BY rowid",
        account_id,
        read_policy,
    )?;
    for policy in policies.iter_mut() {
        policy.rules = select_where(
            conn,
            &sql_schema::POLICY_RULES,
            "policy_id = ?1 ORDER BY rowid",
            &policy.id,
            read_rule,
        )?;
    }
    account.policies = policies;

    account.routes = select_where(conn, &sql_schema::ROUTES, by_account, account_id, read_route)?
        .into_iter()
        .map(|r| (r.id.clone(), r))
        .collect();

    account.name_server_groups = select_where(
        conn,
        &sql_schema::NAME_SERVER_GROUPS,
        by_account,
        account_id,
        read_name_server_group,
    )?
    .into_iter()
    .map(|n| (n.id.clone(), n))
    .collect();

    Ok(account)
}

fn load_user(conn: &Connection, user_id: &str) -> StoreResult<User> {
    let mut user = select_where(conn, &sql_schema::USERS, "id = ?1", user_id, read_user)?
        .into_iter()
        .next()
        .ok_or_else(|| StoreError::NotFound(format!("user {} not found", user_id)))?;

    for pat in select_where(
        conn,
        &sql_schema::PERSONAL_ACCESS_TOKENS,
        "user_id = ?1",
        user_id,
        read_pat,
    )? {
        user.pats.insert(pat.id.clone(), pat);
    }
    Ok(user)
}

/// Delete every row owned by the account. Policies and users go first so
/// their children are removed even on tables created without foreign keys.
fn delete_account_rows(conn: &Connection, account_id: &str) -> StoreResult<()> {
    conn.execute(
        "DELETE FROM policy_rules WHERE policy_id IN (SELECT id FROM policies WHERE account_id = ?1)",
        [account_id],
    )?;
    conn.execute("DELETE FROM policies WHERE account_id = ?1", [account_id])?;
    conn.execute(
        "DELETE FROM personal_access_tokens WHERE user_id IN (SELECT id FROM users WHERE account_id = ?1)",
        [account_id],
    )?;
    conn.execute("DELETE FROM users WHERE account_id = ?1", [account_id])?;
    for table in ["setup_keys", "peers", "\"groups\"", "routes", "name_server_groups"] {
        conn.execute(&format!("DELETE FROM {} WHERE account_id = ?1", table), [account_id])?;
    }
    conn.execute("DELETE FROM accounts WHERE id = ?1", [account_id])?;
    Ok(())
}

/// Insert the whole aggregate, taking over rows with the same ID
fn insert_account(conn: &Connection, account: &Account) -> StoreResult<()> {
    let account_id = account.id.as_str();

    let settings = account.settings.as_ref().map(to_json).transpose()?;
    conn.prepare_cached(&sql_schema::ACCOUNTS.upsert_sql())?.execute(named_params! {
        ":id": account_id,
        ":created_by": account.created_by,
        ":created_at": millis(account.created_at)?,
        ":domain": account.domain,
        ":domain_category": account.domain_category.as_str(),
        ":is_domain_primary_account": account.is_domain_primary_account,
        ":network_identifier": account.network.identifier,
        ":network_net": to_json(&account.network.net)?,
        ":network_dns": account.network.dns,
        ":network_serial": to_sql_int(account.network.serial, "network serial")?,
        ":dns_settings": to_json(&account.dns_settings)?,
        ":settings": settings,
    })?;

    let mut stmt = conn.prepare_cached(&sql_schema::SETUP_KEYS.upsert_sql())?;
    for key in account.setup_keys.values() {
        stmt.execute(named_params! {
            ":id": key.id,
            ":account_id": account_id,
            ":key": key.key,
            ":name": key.name,
            ":key_type": key.key_type.as_str(),
            ":created_at": millis(key.created_at)?,
            ":expires_at": millis(key.expires_at)?,
            ":updated_at": millis(key.updated_at)?,
            ":revoked": key.revoked,
            ":used_times": key.used_times,
            ":last_used": millis(key.last_used)?,
            ":auto_groups": to_json(&key.auto_groups)?,
            ":usage_limit": key.usage_limit,
            ":ephemeral": key.ephemeral,
        })?;
    }

    let mut stmt = conn.prepare_cached(&sql_schema::PEERS.upsert_sql())?;
    for peer in account.peers.values() {
        stmt.execute(named_params! {
            ":id": peer.id,
            ":account_id": account_id,
            ":key": peer.key,
            ":setup_key": peer.setup_key,
            ":ip": to_json(&peer.ip)?,
            ":meta": to_json(&peer.meta)?,
            ":name": peer.name,
            ":dns_label": peer.dns_label,
            ":status_last_seen": millis(peer.status.last_seen)?,
            ":status_connected": peer.status.connected,
            ":status_login_expired": peer.status.login_expired,
            ":user_id": peer.user_id,
            ":ssh_key": peer.ssh_key,
            ":ssh_enabled": peer.ssh_enabled,
            ":login_expiration_enabled": peer.login_expiration_enabled,
            ":last_login": millis(peer.last_login)?,
            ":location_connection_ip": to_json(&peer.location.connection_ip)?,
            ":location_country_code": peer.location.country_code,
            ":location_city_name": peer.location.city_name,
            ":location_geo_name_id": peer.location.geo_name_id,
        })?;
    }

    let mut user_stmt = conn.prepare_cached(&sql_schema::USERS.upsert_sql())?;
    let mut pat_stmt = conn.prepare_cached(&sql_schema::PERSONAL_ACCESS_TOKENS.upsert_sql())?;
    for user in account.users.values() {
        user_stmt.execute(named_params! {
            ":id": user.id,
            ":account_id": account_id,
            ":role": user.role.as_str(),
            ":is_service_user": user.is_service_user,
            ":non_deletable": user.non_deletable,
            ":service_user_name": user.service_user_name,
            ":auto_groups": to_json(&user.auto_groups)?,
            ":blocked": user.blocked,
            ":last_login": millis(user.last_login)?,
            ":issued": user.issued,
        })?;
        for pat in user.pats.values() {
            pat_stmt.execute(named_params! {
                ":id": pat.id,
                ":user_id": user.id,
                ":name": pat.name,
                ":hashed_token": pat.hashed_token,
                ":expiration_date": millis(pat.expiration_date)?,
                ":created_by": pat.created_by,
                ":created_at": millis(pat.created_at)?,
                ":last_used": millis(pat.last_used)?,
            })?;
        }
    }

    let mut stmt = conn.prepare_cached(&sql_schema::GROUPS.upsert_sql())?;
    for group in account.groups.values() {
        stmt.execute(named_params! {
            ":id": group.id,
            ":account_id": account_id,
            ":name": group.name,
            ":issued": group.issued,
            ":peers": to_json(&group.peers)?,
        })?;
    }

    let mut policy_stmt = conn.prepare_cached(&sql_schema::POLICIES.upsert_sql())?;
    let mut rule_stmt = conn.prepare_cached(&sql_schema::POLICY_RULES.upsert_sql())?;
    for policy in &account.policies {
        policy_stmt.execute(named_params! {
            ":id": policy.id,
            ":account_id": account_id,
            ":name": policy.name,
            ":description": policy.description,
            ":enabled": policy.enabled,
        })?;
        for rule in &policy.rules {
            rule_stmt.execute(named_params! {
                ":id": rule.id,
                ":policy_id": policy.id,
                ":name": rule.name,
                ":description": rule.description,
                ":enabled": rule.enabled,
                ":action": rule.action.as_str(),
                ":destinations": to_json(&rule.destinations)?,
                ":sources": to_json(&rule.sources)?,
                ":bidirectional": rule.bidirectional,
                ":protocol": rule.protocol.as_str(),
                ":ports": to_json(&rule.ports)?,
            })?;
        }
    }

    let mut stmt = conn.prepare_cached(&sql_schema::ROUTES.upsert_sql())?;
    for route in account.routes.values() {
        stmt.execute(named_params! {
            ":id": route.id,
            ":account_id": account_id,
            ":network": to_json(&route.network)?,
            ":net_id": route.net_id,
            ":description": route.description,
            ":peer": route.peer,
            ":peer_groups": to_json(&route.peer_groups)?,
            ":network_type": route.network_type.as_i64(),
            ":masquerade": route.masquerade,
            ":metric": route.metric,
            ":enabled": route.enabled,
            ":groups": to_json(&route.groups)?,
        })?;
    }

    let mut stmt = conn.prepare_cached(&sql_schema::NAME_SERVER_GROUPS.upsert_sql())?;
    for nsg in account.name_server_groups.values() {
        stmt.execute(named_params! {
            ":id": nsg.id,
            ":account_id": account_id,
            ":name": nsg.name,
            ":description": nsg.description,
            ":name_servers": to_json(&nsg.name_servers)?,
            ":groups": to_json(&nsg.groups)?,
            ":is_primary": nsg.primary,
            ":domains": to_json(&nsg.domains)?,
            ":enabled": nsg.enabled,
            ":search_domains_enabled": nsg.search_domains_enabled,
        })?;
    }

    Ok(())
}

impl Store for SqlStore {
    fn acquire_global_lock(&self) -> LockGuard {
        self.locks.acquire_global()
    }

    fn acquire_account_write_lock(&self, account_id: &str) -> LockGuard {
        self.locks.acquire_account_write(account_id)
    }

    fn acquire_account_read_lock(&self, account_id: &str) -> LockGuard {
        self.locks.acquire_account_read(account_id)
    }

    fn save_account(&self, account: &Account) -> StoreResult<()> {
        if account.id.is_empty() {
            return Err(StoreError::InvalidArgument("account id should not be empty".to_string()));
        }

        let mut account = account.clone();
        account.normalize_ids();

        let timer = Timer::start();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        delete_account_rows(&tx, &account.id)?;
        insert_account(&tx, &account)?;
        tx.commit()?;

        self.report_persistence(timer);
        Ok(())
    }

    fn delete_account(&self, account: &Account) -> StoreResult<()> {
        if account.id.is_empty() {
            return Err(StoreError::InvalidArgument("account id should not be empty".to_string()));
        }

        let timer = Timer::start();
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        delete_account_rows(&tx, &account.id)?;
        tx.commit()?;

        self.report_persistence(timer);
        Ok(())
    }

    fn get_account(&self, account_id: &str) -> StoreResult<Account> {
        let conn = self.conn()?;
        load_account(&conn, account_id)
    }

    fn get_all_accounts(&self) -> StoreResult<Vec<Account>> {
        let conn = self.conn()?;
        let ids: Vec<String> = conn
            .prepare("SELECT id FROM accounts ORDER BY id")?
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        ids.iter().map(|id| load_account(&conn, id)).collect()
    }

    fn get_account_by_user(&self, user_id: &str) -> StoreResult<Account> {
        let account_id =
            self.lookup_account_id("SELECT account_id FROM users WHERE id = ?1", user_id, "user")?;
        self.get_account(&account_id)
    }

    fn get_account_by_peer_id(&self, peer_id: &str) -> StoreResult<Account> {
        let account_id =
            self.lookup_account_id("SELECT account_id FROM peers WHERE id = ?1", peer_id, "peer")?;
        self.get_account(&account_id)
    }

    fn get_account_by_peer_pub_key(&self, peer_key: &str) -> StoreResult<Account> {
        let account_id = self.get_account_id_by_peer_pub_key(peer_key)?;
        self.get_account(&account_id)
    }

    fn get_account_id_by_peer_pub_key(&self, peer_key: &str) -> StoreResult<String> {
        self.lookup_account_id(
            "SELECT account_id FROM peers WHERE \"key\" = ?1 LIMIT 1",
            peer_key,
            "peer key",
        )
    }

    fn get_account_by_setup_key(&self, setup_key: &str) -> StoreResult<Account> {
        let account_id = self.lookup_account_id(
            "SELECT account_id FROM setup_keys WHERE \"key\" = ?1 COLLATE NOCASE LIMIT 1",
            setup_key,
            "setup key",
        )?;
        self.get_account(&account_id)
    }

    fn get_account_by_private_domain(&self, domain: &str) -> StoreResult<Account> {
        let account_id = self.lookup_account_id(
            "SELECT id FROM accounts
             WHERE domain = ?1 COLLATE NOCASE AND domain != ''
               AND is_domain_primary_account = 1 AND domain_category = 'private'
             LIMIT 1",
            domain,
            "private domain",
        )?;
        self.get_account(&account_id)
    }

    fn get_token_id_by_hashed_token(&self, hashed_token: &str) -> StoreResult<String> {
        self.conn()?
            .query_row(
                "SELECT id FROM personal_access_tokens WHERE hashed_token = ?1 LIMIT 1",
                [hashed_token],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("hashed token {} not found", hashed_token)))
    }

    fn get_user_by_token_id(&self, token_id: &str) -> StoreResult<User> {
        let conn = self.conn()?;
        let user_id: String = conn
            .query_row(
                "SELECT user_id FROM personal_access_tokens WHERE id = ?1",
                [token_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("token {} not found", token_id)))?;

        load_user(&conn, &user_id)
    }

    fn save_peer_status(&self, account_id: &str, peer_id: &str, status: PeerStatus) -> StoreResult<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE peers SET status_last_seen = ?1, status_connected = ?2, status_login_expired = ?3
             WHERE account_id = ?4 AND id = ?5",
            params![
                millis(status.last_seen)?,
                status.connected,
                status.login_expired,
                account_id,
                peer_id
            ],
        )?;
        if updated == 0 {
            return Err(Self::missing(&conn, account_id, "peer", peer_id));
        }
        Ok(())
    }

    fn save_peer_location(&self, account_id: &str, peer: &Peer) -> StoreResult<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE peers SET location_connection_ip = ?1, location_country_code = ?2,
                 location_city_name = ?3, location_geo_name_id = ?4
             WHERE account_id = ?5 AND id = ?6",
            params![
                to_json(&peer.location.connection_ip)?,
                peer.location.country_code,
                peer.location.city_name,
                peer.location.geo_name_id,
                account_id,
                peer.id
            ],
        )?;
        if updated == 0 {
            return Err(Self::missing(&conn, account_id, "peer", &peer.id));
        }
        Ok(())
    }

    fn save_user_last_login(&self, account_id: &str, user_id: &str, last_login: Timestamp) -> StoreResult<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE users SET last_login = ?1 WHERE account_id = ?2 AND id = ?3",
            params![millis(last_login)?, account_id, user_id],
        )?;
        if updated == 0 {
            return Err(Self::missing(&conn, account_id, "user", user_id));
        }
        Ok(())
    }

    fn save_installation_id(&self, installation_id: &str) -> StoreResult<()> {
        self.conn()?.execute(
            "INSERT INTO installations (id, installation_id) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET installation_id = excluded.installation_id",
            [installation_id],
        )?;
        Ok(())
    }

    fn get_installation_id(&self) -> StoreResult<String> {
        let id: Option<String> = self
            .conn()?
            .query_row("SELECT installation_id FROM installations WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        Ok(id.unwrap_or_default())
    }

    // Indices are computed by queries, nothing to delete
    fn delete_hashed_pat2token_id_index(&self, _hashed_token: &str) -> StoreResult<()> {
        Ok(())
    }

    fn delete_token_id2user_id_index(&self, _token_id: &str) -> StoreResult<()> {
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        self.conn()?.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        info!("closed sqlite store {}", self.path.display());
        Ok(())
    }

    fn store_engine(&self) -> StoreEngine {
        StoreEngine::Sqlite
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::model::PolicyRuleProtocol;
    use crate::core_store::store::ErrorKind;
    use crate::test_utils::fixtures::TestAccountBuilder;
    use tempfile::tempdir;

    fn open() -> (tempfile::TempDir, SqlStore) {
        let dir = tempdir().unwrap();
        let store = SqlStore::with_options(
            dir.path(),
            SqlOptions {
                max_open_conns: 2,
                ..Default::default()
            },
            None,
        )
        .unwrap();
        (dir, store)
    }

    #[test]
    fn test_policy_rule_order_preserved() {
        let (_dir, store) = open();
        let mut account = TestAccountBuilder::new("acc1").build();
        let mut policy = Policy {
            id: "pol1".to_string(),
            name: "ordered".to_string(),
            ..Default::default()
        };
        for i in (0..5).rev() {
            policy.rules.push(PolicyRule {
                id: format!("rule{}", i),
                policy_id: "pol1".to_string(),
                protocol: PolicyRuleProtocol::Tcp,
                ..Default::default()
            });
        }
        account.policies.push(policy.clone());
        store.save_account(&account).unwrap();

        let loaded = store.get_account("acc1").unwrap();
        let ids: Vec<_> = loaded.policies[0].rules.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec!["rule4", "rule3", "rule2", "rule1", "rule0"]);
    }

    #[test]
    fn test_resave_removes_dropped_rows() {
        let (_dir, store) = open();
        let mut account = TestAccountBuilder::new("acc1")
            .with_peer("p1", "key1")
            .with_peer("p2", "key2")
            .build();
        store.save_account(&account).unwrap();

        account.peers.remove("p2");
        store.save_account(&account).unwrap();

        let conn = store.conn().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM peers", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
        assert!(store.get_account_by_peer_id("p2").unwrap_err().is_not_found());
    }

    #[test]
    fn test_partial_update_is_durable() {
        let dir = tempdir().unwrap();
        {
            let store = SqlStore::new(dir.path(), None).unwrap();
            store.save_account(&TestAccountBuilder::new("acc1").with_peer("p1", "key1").build()).unwrap();
            store
                .save_peer_status(
                    "acc1",
                    "p1",
                    PeerStatus {
                        connected: true,
                        ..Default::default()
                    },
                )
                .unwrap();
        }

        let store = SqlStore::new(dir.path(), None).unwrap();
        assert!(store.get_account("acc1").unwrap().peers["p1"].status.connected);
    }

    #[test]
    fn test_missing_account_vs_missing_peer() {
        let (_dir, store) = open();
        store.save_account(&TestAccountBuilder::new("acc1").build()).unwrap();

        let err = store.save_peer_status("nope", "p1", PeerStatus::default()).unwrap_err();
        assert!(err.to_string().contains("account nope"));

        let err = store.save_peer_status("acc1", "p1", PeerStatus::default()).unwrap_err();
        assert!(err.to_string().contains("peer p1"));
    }

    #[test]
    fn test_installation_row_is_single() {
        let (_dir, store) = open();
        store.save_installation_id("a").unwrap();
        store.save_installation_id("b").unwrap();

        let conn = store.conn().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM installations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.get_installation_id().unwrap(), "b");
    }

    #[test]
    fn test_timestamp_beyond_sqlite_range_is_rejected() {
        let (_dir, store) = open();
        let account = TestAccountBuilder::new("acc1").with_user("u1", UserRole::User).build();
        store.save_account(&account).unwrap();

        let mut too_late = account.clone();
        too_late.users.get_mut("u1").unwrap().last_login = Timestamp::from_millis(u64::MAX);
        let err = store.save_account(&too_late).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = store
            .save_user_last_login("acc1", "u1", Timestamp::from_millis(u64::MAX))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        // The failed save leaves the stored aggregate untouched
        assert_eq!(store.get_account("acc1").unwrap(), account);

        let edge = Timestamp::from_millis(i64::MAX as u64);
        store.save_user_last_login("acc1", "u1", edge).unwrap();
        assert_eq!(store.get_account("acc1").unwrap().users["u1"].last_login, edge);
    }

    #[test]
    fn test_network_serial_overflow_is_rejected() {
        let (_dir, store) = open();
        let mut account = TestAccountBuilder::new("acc1").build();
        account.network.serial = u64::MAX;
        assert_eq!(store.save_account(&account).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert!(store.get_account("acc1").unwrap_err().is_not_found());
    }

    #[test]
    fn test_negative_stored_timestamp_is_not_clamped() {
        let (_dir, store) = open();
        store
            .save_account(&TestAccountBuilder::new("acc1").with_user("u1", UserRole::User).build())
            .unwrap();
        store
            .conn()
            .unwrap()
            .execute("UPDATE users SET last_login = -1 WHERE id = 'u1'", [])
            .unwrap();

        assert_eq!(store.get_account("acc1").unwrap_err().kind(), ErrorKind::Internal);
    }
}
