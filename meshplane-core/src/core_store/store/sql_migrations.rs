//! Versioned migrations for legacy SQLite stores
//!
//! Older stores kept some columns as binary blobs: bincode-encoded
//! values, or raw 4/16 byte IP addresses. Each migration rewrites one of
//! those columns as JSON text. They run in version order before the
//! auto-schema pass and are tracked in the `schema_version` table.
//!
//! A migration is a no-op when its table or column does not exist yet or
//! when no row still holds a blob, so fresh databases simply record
//! every version as applied.

use super::errors::{StoreError, StoreResult};
use super::sql_schema::{column_exists, table_exists, PEERS_ACCOUNT_IP_INDEX};
use crate::core_store::model::Timestamp;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::info;

/// Migration descriptor
pub struct Migration {
    pub version: i32,
    pub description: &'static str,
    up: fn(&Connection) -> StoreResult<usize>,
}

/// All available migrations in order
pub fn get_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "accounts.network_net from bincode to JSON",
            up: |conn| migrate_bincode_column::<String>(conn, "accounts", "network_net"),
        },
        Migration {
            version: 2,
            description: "routes.network from bincode to JSON",
            up: |conn| migrate_bincode_column::<String>(conn, "routes", "network"),
        },
        Migration {
            version: 3,
            description: "routes.peer_groups from bincode to JSON",
            up: |conn| migrate_bincode_column::<Vec<String>>(conn, "routes", "peer_groups"),
        },
        Migration {
            version: 4,
            description: "peers.location_connection_ip from raw bytes to JSON",
            up: |conn| migrate_raw_ip_column(conn, "peers", "location_connection_ip"),
        },
        Migration {
            version: 5,
            description: "peers.ip from raw bytes to JSON",
            up: |conn| {
                // Recreated by the auto-schema pass
                conn.execute(&format!("DROP INDEX IF EXISTS {}", PEERS_ACCOUNT_IP_INDEX), [])?;
                migrate_raw_ip_column(conn, "peers", "ip")
            },
        },
    ]
}

/// Get the latest migration version available
pub fn get_latest_version() -> i32 {
    get_migrations().iter().map(|m| m.version).max().unwrap_or(0)
}

fn ensure_version_table(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;
    Ok(())
}

/// Get current schema version from database
pub fn get_current_version(conn: &Connection) -> StoreResult<i32> {
    ensure_version_table(conn)?;
    let version: Option<i32> = conn.query_row(
        "SELECT MAX(version) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version.unwrap_or(0))
}

/// Run all pending migrations, each in its own transaction
pub fn migrate(pool: &Pool<SqliteConnectionManager>) -> StoreResult<()> {
    let conn = pool.get()?;
    let current_version = get_current_version(&conn)?;

    for migration in get_migrations().into_iter().filter(|m| m.version > current_version) {
        let tx = conn.unchecked_transaction()?;

        let rewritten = (migration.up)(&tx)?;
        tx.execute(
            "INSERT INTO schema_version (version, description, applied_at) VALUES (?1, ?2, ?3)",
            params![
                migration.version,
                migration.description,
                Timestamp::now().as_millis() as i64
            ],
        )?;

        tx.commit()?;

        info!(
            "applied migration v{}: {} ({} rows rewritten)",
            migration.version, migration.description, rewritten
        );
    }

    Ok(())
}

/// Rows of `table` whose `column` still holds a blob, as (rowid, bytes)
fn blob_rows(conn: &Connection, table: &str, column: &str) -> StoreResult<Option<Vec<(i64, Vec<u8>)>>> {
    if !table_exists(conn, table)? || !column_exists(conn, table, column)? {
        return Ok(None);
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT rowid, \"{col}\" FROM \"{table}\" WHERE typeof(\"{col}\") = 'blob'",
        col = column,
        table = table
    ))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(rows))
}

fn update_json(conn: &Connection, table: &str, column: &str, rowid: i64, json: &str) -> StoreResult<()> {
    conn.execute(
        &format!("UPDATE \"{}\" SET \"{}\" = ?1 WHERE rowid = ?2", table, column),
        params![json, rowid],
    )?;
    Ok(())
}

fn migrate_bincode_column<T>(conn: &Connection, table: &str, column: &str) -> StoreResult<usize>
where
    T: DeserializeOwned + Serialize,
{
    let Some(rows) = blob_rows(conn, table, column)? else {
        return Ok(0);
    };

    for (rowid, blob) in &rows {
        let value: T = bincode::deserialize(blob).map_err(|e| {
            StoreError::Internal(format!("decode {}.{} row {}: {}", table, column, rowid, e))
        })?;
        update_json(conn, table, column, *rowid, &serde_json::to_string(&value)?)?;
    }
    Ok(rows.len())
}

/// Decode an IP address stored as raw bytes. IPv4-mapped IPv6 addresses
/// come back as IPv4, empty input as no address.
pub(crate) fn ip_from_raw(bytes: &[u8]) -> StoreResult<Option<IpAddr>> {
    match bytes.len() {
        0 => Ok(None),
        4 => {
            let octets: [u8; 4] = [bytes[0], bytes[1], bytes[2], bytes[3]];
            Ok(Some(IpAddr::V4(Ipv4Addr::from(octets))))
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            let v6 = Ipv6Addr::from(octets);
            Ok(Some(match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(v6),
            }))
        }
        n => Err(StoreError::Internal(format!("invalid IP address length {}", n))),
    }
}

fn migrate_raw_ip_column(conn: &Connection, table: &str, column: &str) -> StoreResult<usize> {
    let Some(rows) = blob_rows(conn, table, column)? else {
        return Ok(0);
    };

    for (rowid, blob) in &rows {
        let ip = ip_from_raw(blob)?;
        update_json(conn, table, column, *rowid, &serde_json::to_string(&ip)?)?;
    }
    Ok(rows.len())
}
