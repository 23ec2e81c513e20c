pub mod query;
pub mod schema;
pub mod writer;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

pub type DbPool = r2d2::Pool<SqliteConnectionManager>;

pub fn open_or_create<P: AsRef<Path>>(db_path: P) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    schema::apply_pragmas(&conn)?;
    schema::apply_schema(&conn)?;
    Ok(conn)
}

/// Pool of connections sharing the pragmas of [`open_or_create`]. The schema
/// is applied once, through the first connection.
pub fn create_pool<P: AsRef<Path>>(db_path: P, max_size: u32) -> Result<DbPool> {
    let path = db_path.as_ref();
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
    });
    let pool = r2d2::Pool::builder()
        .max_size(max_size.max(1))
        .connection_timeout(Duration::from_secs(10))
        .build(manager)
        .with_context(|| format!("failed to open database pool at {}", path.display()))?;
    let conn = pool.get()?;
    schema::apply_schema(&conn)?;
    Ok(pool)
}
