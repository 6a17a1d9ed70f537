/*
    Cross-engine tests for core_store

    Every contract test runs against both engines:
    - Save/get round trips and copy isolation
    - Secondary lookups and their consistency after delete
    - Partial updates and installation ID
    - Engine equivalence over the same operation sequence
*/


use crate::core_store::store::{FileStore, SqlOptions, SqlStore, Store};
use tempfile::TempDir;

/// One fresh store per engine, each in its own directory
pub fn fresh_stores() -> Vec<(TempDir, Box<dyn Store>)> {
    let file_dir = tempfile::tempdir().unwrap();
    let file: Box<dyn Store> = Box::new(FileStore::new(file_dir.path(), None).unwrap());

    let sql_dir = tempfile::tempdir().unwrap();
    let options = SqlOptions {
        max_open_conns: 4,
        ..Default::default()
    };
    let sql: Box<dyn Store> = Box::new(SqlStore::with_options(sql_dir.path(), options, None).unwrap());

    vec![(file_dir, file), (sql_dir, sql)]
}
