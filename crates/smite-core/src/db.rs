//! SQLite pool setup and the error type shared by storage code.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::info;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const FILE_POOL_SIZE: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A UNIQUE constraint rejected the write.
    #[error("Constraint violation: {0}")]
    Constraint(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Constraint(db.message().to_string())
            }
            _ => Self::Query(e.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DatabaseError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Self::Migration(e.to_string())
    }
}

/// Where a database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbLocation {
    File(PathBuf),
    /// Private in-memory database, gone when the pool is dropped.
    Memory,
}

impl DbLocation {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }
}

/// Open a pool with foreign keys enforced.
///
/// File databases get their parent directory created, WAL journaling and a
/// busy timeout. Memory databases use a single connection that is never
/// recycled, since a fresh in-memory connection starts empty.
pub async fn open_pool(location: &DbLocation) -> Result<Pool<Sqlite>, DatabaseError> {
    match location {
        DbLocation::File(path) => open_file(path).await,
        DbLocation::Memory => {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| DatabaseError::Connection(e.to_string()))?
                .foreign_keys(true);
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await
                .map_err(|e| DatabaseError::Connection(e.to_string()))
        }
    }
}

async fn open_file(path: &Path) -> Result<Pool<Sqlite>, DatabaseError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| DatabaseError::Io(format!("{}: {e}", parent.display())))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(FILE_POOL_SIZE)
        .connect_with(options)
        .await
        .map_err(|e| DatabaseError::Connection(format!("{}: {e}", path.display())))?;

    info!(path = %path.display(), "Database opened");
    Ok(pool)
}

/// Seconds since the Unix epoch.
#[allow(clippy::cast_possible_wrap)]
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
