//! Pooled SQLite connections for the fact log.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

/// SQLite `synchronous` level applied to every pooled connection.
///
/// Under WAL, `Normal` can lose the most recent commits on power loss but
/// never corrupts the file. `Full` syncs the WAL on every commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncMode {
    Off,
    #[default]
    Normal,
    Full,
}

impl SyncMode {
    /// Numeric value SQLite reports from `PRAGMA synchronous`.
    pub fn level(self) -> i32 {
        match self {
            Self::Off => 0,
            Self::Normal => 1,
            Self::Full => 2,
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::Normal => "normal",
            Self::Full => "full",
        })
    }
}

#[derive(Debug, Error)]
#[error("unknown synchronous mode {0:?}, expected off, normal or full")]
pub struct ParseSyncModeError(String);

impl FromStr for SyncMode {
    type Err = ParseSyncModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "0" => Ok(Self::Off),
            "normal" | "1" => Ok(Self::Normal),
            "full" | "2" => Ok(Self::Full),
            _ => Err(ParseSyncModeError(s.to_owned())),
        }
    }
}

/// Per-connection and pool sizing knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// How long a connection waits on a locked database, in milliseconds.
    /// Publishers contend on the write lock, so this bounds publish latency
    /// under load before `SQLITE_BUSY` surfaces.
    pub busy_timeout_ms: u64,

    /// Upper bound on pooled connections. Each running catch-up or follow
    /// query holds one for the duration of its scan.
    pub pool_max_size: u32,

    pub synchronous: SyncMode,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
            synchronous: SyncMode::Normal,
        }
    }
}

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),
}

/// Switches `conn` to WAL and applies `settings`.
///
/// In-memory databases report `memory` as their journal mode and are
/// accepted as they are.
fn configure_connection(conn: &mut Connection, settings: DbRuntimeSettings) -> rusqlite::Result<()> {
    let journal_mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !journal_mode.eq_ignore_ascii_case("wal") && journal_mode != "memory" {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("journal mode stayed {journal_mode} instead of wal")),
        ));
    }
    conn.pragma_update(None, "synchronous", settings.synchronous.level())?;
    conn.busy_timeout(Duration::from_millis(settings.busy_timeout_ms))
}

/// Opens a pool of WAL connections to the database file at `db_path`.
///
/// Every pooled connection points at the same file, so `:memory:` is only
/// useful with `pool_max_size = 1`; tests use a temporary file instead.
///
/// # Errors
///
/// `PoolError::PoolInit` when the pool cannot fill its first connection,
/// including when a connection refuses WAL mode.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(move |conn| configure_connection(conn, settings));

    let pool = Pool::builder()
        .max_size(settings.pool_max_size)
        .build(manager)?;

    tracing::debug!(
        path = db_path,
        max_size = settings.pool_max_size,
        busy_timeout_ms = settings.busy_timeout_ms,
        synchronous = %settings.synchronous,
        "opened fact log connection pool"
    );
    Ok(pool)
}
