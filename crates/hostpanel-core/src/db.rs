//! Shared registry database types and utilities.
//!
//! Provides `DatabaseError`, constraint-violation classification,
//! `unix_timestamp()`, and the pool helpers behind `define_database!`.

use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::error::ErrorKind;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::info;

/// Registry errors.
///
/// Constraint violations get their own variants so callers can tell a
/// duplicate name or a dangling reference apart from a broken query.
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

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Still referenced: {0}")]
    StillReferenced(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        Self::Query(e.to_string())
    }
}

/// Which integrity constraint a failed write tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    Unique,
    ForeignKey,
}

/// Classify a `sqlx` error as a constraint violation, if it is one.
///
/// Uses the driver's error kind first and falls back to the `SQLite`
/// message text for builds that only report the primary result code.
pub fn constraint_violation(e: &sqlx::Error) -> Option<Constraint> {
    let db_err = e.as_database_error()?;
    match db_err.kind() {
        ErrorKind::UniqueViolation => return Some(Constraint::Unique),
        ErrorKind::ForeignKeyViolation => return Some(Constraint::ForeignKey),
        _ => {}
    }
    let message = db_err.message();
    if message.contains("UNIQUE constraint failed") {
        Some(Constraint::Unique)
    } else if message.contains("FOREIGN KEY constraint failed") {
        Some(Constraint::ForeignKey)
    } else {
        None
    }
}

impl DatabaseError {
    /// Map a failed INSERT/UPDATE. `subject` names the row being written.
    pub fn on_write(e: sqlx::Error, subject: &str) -> Self {
        match constraint_violation(&e) {
            Some(Constraint::Unique) => Self::AlreadyExists(subject.to_string()),
            Some(Constraint::ForeignKey) => Self::InvalidReference(subject.to_string()),
            None => Self::from(e),
        }
    }

    /// Map a failed DELETE. A foreign-key failure here means another row
    /// still points at the one being removed.
    pub fn on_delete(e: sqlx::Error, subject: &str) -> Self {
        match constraint_violation(&e) {
            Some(Constraint::ForeignKey) => Self::StillReferenced(subject.to_string()),
            _ => Self::from(e),
        }
    }
}

/// Open (or create) a `SQLite` connection pool at the given file path.
///
/// Creates the parent directory if it does not exist, enables WAL journal
/// mode, foreign keys, and sets a 5-second busy timeout.
pub async fn open_pool(path: &Path) -> Result<Pool<Sqlite>, DatabaseError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io(e.to_string()))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))
        .map_err(|e| DatabaseError::Connection(e.to_string()))?
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;

    info!(path = %path.display(), "Registry opened");

    Ok(pool)
}

/// Open an in-memory `SQLite` connection pool (for testing).
pub async fn open_pool_in_memory() -> Result<Pool<Sqlite>, DatabaseError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|e| DatabaseError::Connection(e.to_string()))?
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;

    Ok(pool)
}

/// Returns the current time as a Unix timestamp (seconds since epoch).
#[allow(clippy::cast_possible_wrap)]
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Macro to define a `Database`-like struct with `open`, `open_in_memory`,
/// `run_migrations`, and `pool` methods.
///
/// Usage:
/// ```ignore
/// hostpanel_core::define_database!(Database, "Registry migrations complete");
/// ```
///
/// Migrations are embedded from the calling crate's `./migrations` directory.
#[macro_export]
macro_rules! define_database {
    ($name:ident, $migration_msg:expr) => {
        #[derive(Clone)]
        pub struct $name {
            pool: ::sqlx::Pool<::sqlx::Sqlite>,
        }

        impl $name {
            /// Open or create a database at the given path.
            pub async fn open(
                path: &::std::path::Path,
            ) -> ::std::result::Result<Self, $crate::db::DatabaseError> {
                let pool = $crate::db::open_pool(path).await?;
                let db = Self { pool };
                db.run_migrations().await?;
                Ok(db)
            }

            /// Open an in-memory database (for testing).
            pub async fn open_in_memory() -> ::std::result::Result<Self, $crate::db::DatabaseError>
            {
                let pool = $crate::db::open_pool_in_memory().await?;
                let db = Self { pool };
                db.run_migrations().await?;
                Ok(db)
            }

            async fn run_migrations(&self) -> ::std::result::Result<(), $crate::db::DatabaseError> {
                ::sqlx::migrate!("./migrations")
                    .run(&self.pool)
                    .await
                    .map_err(|e| $crate::db::DatabaseError::Migration(e.to_string()))?;

                ::tracing::info!($migration_msg);
                Ok(())
            }

            /// Get a reference to the connection pool.
            pub const fn pool(&self) -> &::sqlx::Pool<::sqlx::Sqlite> {
                &self.pool
            }
        }
    };
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn unix_timestamp_is_reasonable() {
        // After 2024-01-01
        assert!(unix_timestamp() > 1_704_067_200);
    }

    #[tokio::test]
    async fn classifies_unique_and_foreign_key_failures() {
        let pool = open_pool_in_memory().await.unwrap();
        sqlx::query("CREATE TABLE parent (id INTEGER PRIMARY KEY, name TEXT UNIQUE)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER NOT NULL REFERENCES parent(id))",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO parent (id, name) VALUES (1, 'a')")
            .execute(&pool)
            .await
            .unwrap();

        let dup = sqlx::query("INSERT INTO parent (name) VALUES ('a')")
            .execute(&pool)
            .await
            .unwrap_err();
        assert!(matches!(
            DatabaseError::on_write(dup, "parent a"),
            DatabaseError::AlreadyExists(_)
        ));

        let dangling = sqlx::query("INSERT INTO child (parent_id) VALUES (42)")
            .execute(&pool)
            .await
            .unwrap_err();
        assert!(matches!(
            DatabaseError::on_write(dangling, "child"),
            DatabaseError::InvalidReference(_)
        ));

        sqlx::query("INSERT INTO child (parent_id) VALUES (1)")
            .execute(&pool)
            .await
            .unwrap();
        let referenced = sqlx::query("DELETE FROM parent WHERE id = 1")
            .execute(&pool)
            .await
            .unwrap_err();
        assert!(matches!(
            DatabaseError::on_delete(referenced, "parent a"),
            DatabaseError::StillReferenced(_)
        ));
    }

    #[tokio::test]
    async fn open_pool_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("registry.db");
        let pool = open_pool(&path).await.unwrap();
        pool.close().await;
        assert!(path.exists());
    }
}
