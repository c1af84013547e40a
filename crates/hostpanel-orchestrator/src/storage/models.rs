//! Registry models.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::lifecycle::ProjectStatus;

/// Relational engine a database or user lives on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Engine {
    Mysql,
    Postgresql,
}

impl Engine {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mysql => "mysql",
            Self::Postgresql => "postgresql",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Self::Mysql),
            "postgresql" | "postgres" | "pgsql" => Ok(Self::Postgresql),
            other => Err(format!("unknown database engine: {other}")),
        }
    }
}

/// Application framework a project is deployed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Framework {
    Php,
    Laravel,
    Wordpress,
}

impl Framework {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Php => "php",
            Self::Laravel => "laravel",
            Self::Wordpress => "wordpress",
        }
    }

    /// Whether the site can be swapped to a static "suspended" page.
    pub const fn supports_suspend(self) -> bool {
        matches!(self, Self::Wordpress)
    }

    /// Subdirectories the runtime account must be able to write.
    pub const fn writable_dirs(self) -> &'static [&'static str] {
        match self {
            Self::Php => &[],
            Self::Laravel => &["storage", "bootstrap/cache"],
            Self::Wordpress => &["wp-content"],
        }
    }

    /// Whether the database reference is mandatory.
    pub const fn requires_database(self) -> bool {
        matches!(self, Self::Wordpress)
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Framework {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "php" => Ok(Self::Php),
            "laravel" => Ok(Self::Laravel),
            "wordpress" => Ok(Self::Wordpress),
            other => Err(format!("unknown framework: {other}")),
        }
    }
}

/// Reservation state of a database or user row.
///
/// `pending` rows are reserved but not yet created on the engine;
/// `dropping` rows are being removed from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RowState {
    Pending,
    Ready,
    Dropping,
}

impl RowState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Dropping => "dropping",
        }
    }
}

impl fmt::Display for RowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Domain {
    pub id: i64,
    pub domain: String,
    pub domain_provider: Option<String>,
    pub ssl_renewed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Database user record. The password never leaves the process in
/// serialized output.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DbUser {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    pub engine: Engine,
    pub state: RowState,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Provisioned database record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DatabaseRecord {
    pub id: i64,
    pub name: String,
    pub engine: Engine,
    pub user_id: i64,
    pub state: RowState,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Live engine statistics for a database. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub size_mb: f64,
    pub table_count: i64,
}

/// Project record, joined with its domain and database names.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Project {
    pub id: i64,
    pub project_name: String,
    pub domain_id: i64,
    pub domain: String,
    pub database_id: Option<i64>,
    pub database_name: Option<String>,
    pub database_engine: Option<Engine>,
    pub framework: Framework,
    pub root_directory: String,
    pub status: ProjectStatus,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}
