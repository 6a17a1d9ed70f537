//! Relational schema for the SQLite engine
//!
//! One table per entity, plus `installations` (single row with id 1)
//! and `schema_version`. Nested lists and structs are stored as JSON
//! text, timestamps as INTEGER milliseconds, booleans as INTEGER.
//!
//! [`auto_migrate`] brings any database up to these definitions: it
//! creates missing tables, adds missing columns and creates missing
//! indices. It never drops or rewrites existing data.

use super::errors::StoreResult;
use rusqlite::Connection;
use std::collections::HashSet;
use tracing::info;

pub(crate) struct Column {
    pub name: &'static str,
    pub decl: &'static str,
}

pub(crate) struct TableSpec {
    pub name: &'static str,
    pub columns: &'static [Column],
    /// Table-level constraints appended to CREATE TABLE
    pub constraints: &'static [&'static str],
}

pub(crate) struct IndexSpec {
    pub name: &'static str,
    pub unique: bool,
    pub table: &'static str,
    pub columns: &'static str,
}

const fn col(name: &'static str, decl: &'static str) -> Column {
    Column { name, decl }
}

const ACCOUNT_FK: &str = "FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE CASCADE";

pub(crate) const ACCOUNTS: TableSpec = TableSpec {
    name: "accounts",
    columns: &[
        col("id", "TEXT PRIMARY KEY"),
        col("created_by", "TEXT NOT NULL DEFAULT ''"),
        col("created_at", "INTEGER NOT NULL DEFAULT 0"),
        col("domain", "TEXT NOT NULL DEFAULT ''"),
        col("domain_category", "TEXT NOT NULL DEFAULT ''"),
        col("is_domain_primary_account", "INTEGER NOT NULL DEFAULT 0"),
        col("network_identifier", "TEXT NOT NULL DEFAULT ''"),
        col("network_net", "TEXT"),
        col("network_dns", "TEXT NOT NULL DEFAULT ''"),
        col("network_serial", "INTEGER NOT NULL DEFAULT 0"),
        col("dns_settings", "TEXT"),
        col("settings", "TEXT"),
    ],
    constraints: &[],
};

pub(crate) const SETUP_KEYS: TableSpec = TableSpec {
    name: "setup_keys",
    columns: &[
        col("id", "TEXT PRIMARY KEY"),
        col("account_id", "TEXT"),
        col("key", "TEXT NOT NULL DEFAULT ''"),
        col("name", "TEXT NOT NULL DEFAULT ''"),
        col("key_type", "TEXT NOT NULL DEFAULT ''"),
        col("created_at", "INTEGER NOT NULL DEFAULT 0"),
        col("expires_at", "INTEGER NOT NULL DEFAULT 0"),
        col("updated_at", "INTEGER NOT NULL DEFAULT 0"),
        col("revoked", "INTEGER NOT NULL DEFAULT 0"),
        col("used_times", "INTEGER NOT NULL DEFAULT 0"),
        col("last_used", "INTEGER NOT NULL DEFAULT 0"),
        col("auto_groups", "TEXT"),
        col("usage_limit", "INTEGER NOT NULL DEFAULT 0"),
        col("ephemeral", "INTEGER NOT NULL DEFAULT 0"),
    ],
    constraints: &[ACCOUNT_FK],
};

pub(crate) const PEERS: TableSpec = TableSpec {
    name: "peers",
    columns: &[
        col("id", "TEXT PRIMARY KEY"),
        col("account_id", "TEXT"),
        col("key", "TEXT NOT NULL DEFAULT ''"),
        col("setup_key", "TEXT NOT NULL DEFAULT ''"),
        col("ip", "TEXT"),
        col("meta", "TEXT"),
        col("name", "TEXT NOT NULL DEFAULT ''"),
        col("dns_label", "TEXT NOT NULL DEFAULT ''"),
        col("status_last_seen", "INTEGER NOT NULL DEFAULT 0"),
        col("status_connected", "INTEGER NOT NULL DEFAULT 0"),
        col("status_login_expired", "INTEGER NOT NULL DEFAULT 0"),
        col("user_id", "TEXT NOT NULL DEFAULT ''"),
        col("ssh_key", "TEXT NOT NULL DEFAULT ''"),
        col("ssh_enabled", "INTEGER NOT NULL DEFAULT 0"),
        col("login_expiration_enabled", "INTEGER NOT NULL DEFAULT 0"),
        col("last_login", "INTEGER NOT NULL DEFAULT 0"),
        col("location_connection_ip", "TEXT"),
        col("location_country_code", "TEXT NOT NULL DEFAULT ''"),
        col("location_city_name", "TEXT NOT NULL DEFAULT ''"),
        col("location_geo_name_id", "INTEGER NOT NULL DEFAULT 0"),
    ],
    constraints: &[ACCOUNT_FK],
};

pub(crate) const USERS: TableSpec = TableSpec {
    name: "users",
    columns: &[
        col("id", "TEXT PRIMARY KEY"),
        col("account_id", "TEXT"),
        col("role", "TEXT NOT NULL DEFAULT ''"),
        col("is_service_user", "INTEGER NOT NULL DEFAULT 0"),
        col("non_deletable", "INTEGER NOT NULL DEFAULT 0"),
        col("service_user_name", "TEXT NOT NULL DEFAULT ''"),
        col("auto_groups", "TEXT"),
        col("blocked", "INTEGER NOT NULL DEFAULT 0"),
        col("last_login", "INTEGER NOT NULL DEFAULT 0"),
        col("issued", "TEXT NOT NULL DEFAULT ''"),
    ],
    constraints: &[ACCOUNT_FK],
};

pub(crate) const PERSONAL_ACCESS_TOKENS: TableSpec = TableSpec {
    name: "personal_access_tokens",
    columns: &[
        col("id", "TEXT PRIMARY KEY"),
        col("user_id", "TEXT"),
        col("name", "TEXT NOT NULL DEFAULT ''"),
        col("hashed_token", "TEXT NOT NULL DEFAULT ''"),
        col("expiration_date", "INTEGER NOT NULL DEFAULT 0"),
        col("created_by", "TEXT NOT NULL DEFAULT ''"),
        col("created_at", "INTEGER NOT NULL DEFAULT 0"),
        col("last_used", "INTEGER NOT NULL DEFAULT 0"),
    ],
    constraints: &["FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE"],
};

pub(crate) const GROUPS: TableSpec = TableSpec {
    name: "groups",
    columns: &[
        col("id", "TEXT PRIMARY KEY"),
        col("account_id", "TEXT"),
        col("name", "TEXT NOT NULL DEFAULT ''"),
        col("issued", "TEXT NOT NULL DEFAULT ''"),
        col("peers", "TEXT"),
    ],
    constraints: &[ACCOUNT_FK],
};

pub(crate) const POLICIES: TableSpec = TableSpec {
    name: "policies",
    columns: &[
        col("id", "TEXT PRIMARY KEY"),
        col("account_id", "TEXT"),
        col("name", "TEXT NOT NULL DEFAULT ''"),
        col("description", "TEXT NOT NULL DEFAULT ''"),
        col("enabled", "INTEGER NOT NULL DEFAULT 0"),
    ],
    constraints: &[ACCOUNT_FK],
};

pub(crate) const POLICY_RULES: TableSpec = TableSpec {
    name: "policy_rules",
    columns: &[
        col("id", "TEXT PRIMARY KEY"),
        col("policy_id", "TEXT"),
        col("name", "TEXT NOT NULL DEFAULT ''"),
        col("description", "TEXT NOT NULL DEFAULT ''"),
        col("enabled", "INTEGER NOT NULL DEFAULT 0"),
        col("action", "TEXT NOT NULL DEFAULT ''"),
        col("destinations", "TEXT"),
        col("sources", "TEXT"),
        col("bidirectional", "INTEGER NOT NULL DEFAULT 0"),
        col("protocol", "TEXT NOT NULL DEFAULT ''"),
        col("ports", "TEXT"),
    ],
    constraints: &["FOREIGN KEY (policy_id) REFERENCES policies(id) ON DELETE CASCADE"],
};

pub(crate) const ROUTES: TableSpec = TableSpec {
    name: "routes",
    columns: &[
        col("id", "TEXT PRIMARY KEY"),
        col("account_id", "TEXT"),
        col("network", "TEXT"),
        col("net_id", "TEXT NOT NULL DEFAULT ''"),
        col("description", "TEXT NOT NULL DEFAULT ''"),
        col("peer", "TEXT NOT NULL DEFAULT ''"),
        col("peer_groups", "TEXT"),
        col("network_type", "INTEGER NOT NULL DEFAULT 0"),
        col("masquerade", "INTEGER NOT NULL DEFAULT 0"),
        col("metric", "INTEGER NOT NULL DEFAULT 0"),
        col("enabled", "INTEGER NOT NULL DEFAULT 0"),
        col("groups", "TEXT"),
    ],
    constraints: &[ACCOUNT_FK],
};

pub(crate) const NAME_SERVER_GROUPS: TableSpec = TableSpec {
    name: "name_server_groups",
    columns: &[
        col("id", "TEXT PRIMARY KEY"),
        col("account_id", "TEXT"),
        col("name", "TEXT NOT NULL DEFAULT ''"),
        col("description", "TEXT NOT NULL DEFAULT ''"),
        col("name_servers", "TEXT"),
        col("groups", "TEXT"),
        col("is_primary", "INTEGER NOT NULL DEFAULT 0"),
        col("domains", "TEXT"),
        col("enabled", "INTEGER NOT NULL DEFAULT 0"),
        col("search_domains_enabled", "INTEGER NOT NULL DEFAULT 0"),
    ],
    constraints: &[ACCOUNT_FK],
};

pub(crate) const INSTALLATIONS: TableSpec = TableSpec {
    name: "installations",
    columns: &[
        col("id", "INTEGER PRIMARY KEY"),
        col("installation_id", "TEXT NOT NULL DEFAULT ''"),
    ],
    constraints: &[],
};

/// Creation order respects foreign keys
pub(crate) const TABLES: &[&TableSpec] = &[
    &ACCOUNTS,
    &SETUP_KEYS,
    &PEERS,
    &USERS,
    &PERSONAL_ACCESS_TOKENS,
    &GROUPS,
    &POLICIES,
    &POLICY_RULES,
    &ROUTES,
    &NAME_SERVER_GROUPS,
    &INSTALLATIONS,
];

pub(crate) const PEERS_ACCOUNT_IP_INDEX: &str = "idx_peers_account_id_ip";

pub(crate) const INDICES: &[IndexSpec] = &[
    IndexSpec { name: "idx_setup_keys_account_id", unique: false, table: "setup_keys", columns: "account_id" },
    IndexSpec { name: "idx_setup_keys_key", unique: false, table: "setup_keys", columns: "key COLLATE NOCASE" },
    IndexSpec { name: "idx_peers_account_id", unique: false, table: "peers", columns: "account_id" },
    IndexSpec { name: "idx_peers_key", unique: false, table: "peers", columns: "key" },
    IndexSpec { name: PEERS_ACCOUNT_IP_INDEX, unique: true, table: "peers", columns: "account_id, ip" },
    IndexSpec { name: "idx_users_account_id", unique: false, table: "users", columns: "account_id" },
    IndexSpec { name: "idx_pats_user_id", unique: false, table: "personal_access_tokens", columns: "user_id" },
    IndexSpec { name: "idx_pats_hashed_token", unique: false, table: "personal_access_tokens", columns: "hashed_token" },
    IndexSpec { name: "idx_groups_account_id", unique: false, table: "groups", columns: "account_id" },
    IndexSpec { name: "idx_policies_account_id", unique: false, table: "policies", columns: "account_id" },
    IndexSpec { name: "idx_policy_rules_policy_id", unique: false, table: "policy_rules", columns: "policy_id" },
    IndexSpec { name: "idx_routes_account_id", unique: false, table: "routes", columns: "account_id" },
    IndexSpec { name: "idx_name_server_groups_account_id", unique: false, table: "name_server_groups", columns: "account_id" },
    IndexSpec { name: "idx_accounts_domain", unique: false, table: "accounts", columns: "domain COLLATE NOCASE" },
];

impl TableSpec {
    pub(crate) fn create_sql(&self) -> String {
        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("\"{}\" {}", c.name, c.decl))
            .collect();
        parts.extend(self.constraints.iter().map(|c| c.to_string()));
        format!("CREATE TABLE IF NOT EXISTS \"{}\" ({})", self.name, parts.join(", "))
    }

    /// Comma separated, quoted column list in declaration order
    pub(crate) fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| format!("\"{}\"", c.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// INSERT of every column, updating the existing row on an `id` conflict.
    /// Parameters are named after their column, e.g. `:account_id`.
    pub(crate) fn upsert_sql(&self) -> String {
        let placeholders: Vec<String> = self.columns.iter().map(|c| format!(":{}", c.name)).collect();
        let updates: Vec<String> = self
            .columns
            .iter()
            .filter(|c| c.name != "id")
            .map(|c| format!("\"{0}\" = excluded.\"{0}\"", c.name))
            .collect();
        format!(
            "INSERT INTO \"{}\" ({}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {}",
            self.name,
            self.column_list(),
            placeholders.join(", "),
            updates.join(", ")
        )
    }

    /// SELECT of every column in declaration order, to be followed by a WHERE clause
    pub(crate) fn select_sql(&self) -> String {
        format!("SELECT {} FROM \"{}\"", self.column_list(), self.name)
    }
}

impl IndexSpec {
    fn create_sql(&self) -> String {
        format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON \"{}\" ({})",
            if self.unique { "UNIQUE " } else { "" },
            self.name,
            self.table,
            self.columns
        )
    }
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> StoreResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub(crate) fn table_columns(conn: &Connection, table: &str) -> StoreResult<HashSet<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{}\")", table))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(columns)
}

pub(crate) fn column_exists(conn: &Connection, table: &str, column: &str) -> StoreResult<bool> {
    Ok(table_columns(conn, table)?.contains(column))
}

/// Create or extend tables and indices to match the definitions above.
pub(crate) fn auto_migrate(conn: &Connection) -> StoreResult<()> {
    for table in TABLES {
        if !table_exists(conn, table.name)? {
            conn.execute(&table.create_sql(), [])?;
            info!("created table {}", table.name);
            continue;
        }

        let existing = table_columns(conn, table.name)?;
        for column in table.columns.iter().filter(|c| !existing.contains(c.name)) {
            conn.execute(
                &format!(
                    "ALTER TABLE \"{}\" ADD COLUMN \"{}\" {}",
                    table.name, column.name, column.decl
                ),
                [],
            )?;
            info!("added column {}.{}", table.name, column.name);
        }
    }

    for index in INDICES {
        conn.execute(&index.create_sql(), [])?;
    }

    Ok(())
}
