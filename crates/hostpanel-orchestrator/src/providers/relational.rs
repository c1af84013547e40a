//! MySQL/MariaDB and PostgreSQL administration over root connections.
//!
//! Engine DDL cannot take bind parameters for identifiers, so names are
//! validated against a strict pattern and quoted, and password literals
//! are escaped, before being spliced into statements.

use async_trait::async_trait;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use sqlx::{MySqlPool, PgPool, Row};
use tracing::{info, warn};

use super::{ProviderError, RelationalAdmin};
use crate::naming::validate_identifier;
use crate::storage::{DatabaseStats, Engine};

/// Longest identifier either engine accepts for users.
const MAX_USER_LEN: usize = 32;
const MAX_DB_LEN: usize = 63;

pub struct SqlAdmin {
    mysql_dsn: Option<String>,
    postgres_dsn: Option<String>,
}

impl SqlAdmin {
    pub const fn new(mysql_dsn: Option<String>, postgres_dsn: Option<String>) -> Self {
        Self {
            mysql_dsn,
            postgres_dsn,
        }
    }

    async fn mysql(&self) -> Result<MySqlPool, ProviderError> {
        let dsn = self.mysql_dsn.as_deref().ok_or_else(|| {
            ProviderError::Unsupported("no MySQL root DSN configured (engines.mysql_root_dsn)".into())
        })?;
        MySqlPoolOptions::new()
            .max_connections(1)
            .connect(dsn)
            .await
            .map_err(|e| engine_error(Engine::Mysql, &e))
    }

    async fn postgres(&self) -> Result<PgPool, ProviderError> {
        let dsn = self.postgres_dsn.as_deref().ok_or_else(|| {
            ProviderError::Unsupported(
                "no PostgreSQL root DSN configured (engines.postgres_root_dsn)".into(),
            )
        })?;
        PgPoolOptions::new()
            .max_connections(1)
            .connect(dsn)
            .await
            .map_err(|e| engine_error(Engine::Postgresql, &e))
    }
}

fn engine_error(engine: Engine, e: &sqlx::Error) -> ProviderError {
    ProviderError::Engine {
        engine,
        message: e.to_string(),
    }
}

fn checked(kind: &str, name: &str, max_len: usize) -> Result<(), ProviderError> {
    validate_identifier(kind, name, max_len).map_err(|e| ProviderError::Unsupported(e.to_string()))
}

/// Single-quoted SQL string literal.
fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

/// Standard SQL literal for PostgreSQL, where backslash is not special.
fn pg_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

async fn mysql_exec(pool: &MySqlPool, sql: &str) -> Result<(), ProviderError> {
    sqlx::query(sql)
        .execute(pool)
        .await
        .map_err(|e| engine_error(Engine::Mysql, &e))?;
    Ok(())
}

async fn pg_exec(pool: &PgPool, sql: &str) -> Result<(), ProviderError> {
    sqlx::query(sql)
        .execute(pool)
        .await
        .map_err(|e| engine_error(Engine::Postgresql, &e))?;
    Ok(())
}

/// Run the statements that follow a successful `CREATE DATABASE`. When
/// they fail, drop the new database before returning their error.
async fn finish_or_drop<F, D>(
    engine: Engine,
    name: &str,
    finish: F,
    drop: D,
) -> Result<(), ProviderError>
where
    F: Future<Output = Result<(), ProviderError>>,
    D: Future<Output = Result<(), ProviderError>>,
{
    let Err(e) = finish.await else {
        return Ok(());
    };
    warn!(%engine, name, error = %e, "grant failed, dropping the new database");
    if let Err(drop_err) = drop.await {
        warn!(%engine, name, error = %drop_err, "could not drop database after failed grant");
    }
    Err(e)
}

#[async_trait]
impl RelationalAdmin for SqlAdmin {
    async fn create_user(
        &self,
        engine: Engine,
        username: &str,
        password: &str,
    ) -> Result<(), ProviderError> {
        checked("username", username, MAX_USER_LEN)?;
        match engine {
            Engine::Mysql => {
                let pool = self.mysql().await?;
                mysql_exec(
                    &pool,
                    &format!(
                        "CREATE USER '{username}'@'%' IDENTIFIED BY {}",
                        literal(password)
                    ),
                )
                .await?;
                pool.close().await;
            }
            Engine::Postgresql => {
                let pool = self.postgres().await?;
                pg_exec(
                    &pool,
                    &format!(
                        "CREATE USER \"{username}\" WITH PASSWORD {}",
                        pg_literal(password)
                    ),
                )
                .await?;
                pool.close().await;
            }
        }
        info!(%engine, username, "created database user");
        Ok(())
    }

    async fn drop_user(&self, engine: Engine, username: &str) -> Result<(), ProviderError> {
        checked("username", username, MAX_USER_LEN)?;
        match engine {
            Engine::Mysql => {
                let pool = self.mysql().await?;
                mysql_exec(&pool, &format!("DROP USER IF EXISTS '{username}'@'%'")).await?;
                mysql_exec(&pool, "FLUSH PRIVILEGES").await?;
                pool.close().await;
            }
            Engine::Postgresql => {
                let pool = self.postgres().await?;
                pg_exec(&pool, &format!("DROP ROLE IF EXISTS \"{username}\"")).await?;
                pool.close().await;
            }
        }
        info!(%engine, username, "dropped database user");
        Ok(())
    }

    async fn create_database(
        &self,
        engine: Engine,
        name: &str,
        owner: &str,
    ) -> Result<(), ProviderError> {
        checked("database name", name, MAX_DB_LEN)?;
        checked("username", owner, MAX_USER_LEN)?;
        match engine {
            Engine::Mysql => {
                let pool = self.mysql().await?;
                mysql_exec(
                    &pool,
                    &format!(
                        "CREATE DATABASE `{name}` CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci"
                    ),
                )
                .await?;
                let grant = format!("GRANT ALL PRIVILEGES ON `{name}`.* TO '{owner}'@'%'");
                let undo = format!("DROP DATABASE IF EXISTS `{name}`");
                let granted = finish_or_drop(
                    engine,
                    name,
                    async {
                        mysql_exec(&pool, &grant).await?;
                        mysql_exec(&pool, "FLUSH PRIVILEGES").await
                    },
                    mysql_exec(&pool, &undo),
                )
                .await;
                pool.close().await;
                granted?;
            }
            Engine::Postgresql => {
                let pool = self.postgres().await?;
                pg_exec(
                    &pool,
                    &format!("CREATE DATABASE \"{name}\" ENCODING 'UTF8' OWNER \"{owner}\""),
                )
                .await?;
                let grant = format!("GRANT ALL PRIVILEGES ON DATABASE \"{name}\" TO \"{owner}\"");
                let undo = format!("DROP DATABASE IF EXISTS \"{name}\"");
                let granted =
                    finish_or_drop(engine, name, pg_exec(&pool, &grant), pg_exec(&pool, &undo))
                        .await;
                pool.close().await;
                granted?;
            }
        }
        info!(%engine, name, owner, "created database");
        Ok(())
    }

    async fn drop_database(
        &self,
        engine: Engine,
        name: &str,
        owner: &str,
    ) -> Result<(), ProviderError> {
        checked("database name", name, MAX_DB_LEN)?;
        checked("username", owner, MAX_USER_LEN)?;
        match engine {
            Engine::Mysql => {
                let pool = self.mysql().await?;
                let sessions: Vec<u64> = sqlx::query_scalar(
                    "SELECT ID FROM information_schema.PROCESSLIST WHERE DB = ?",
                )
                .bind(name)
                .fetch_all(&pool)
                .await
                .map_err(|e| engine_error(Engine::Mysql, &e))?;
                for id in sessions {
                    // The session may end on its own between listing and killing.
                    if let Err(e) = mysql_exec(&pool, &format!("KILL {id}")).await {
                        warn!(id, error = %e, "could not kill session");
                    }
                }
                mysql_exec(&pool, &format!("DROP DATABASE IF EXISTS `{name}`")).await?;
                if let Err(e) = mysql_exec(
                    &pool,
                    &format!("REVOKE ALL PRIVILEGES ON `{name}`.* FROM '{owner}'@'%'"),
                )
                .await
                {
                    warn!(error = %e, "revoke after drop failed");
                }
                pool.close().await;
            }
            Engine::Postgresql => {
                let pool = self.postgres().await?;
                sqlx::query(
                    "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                     WHERE datname = $1 AND pid <> pg_backend_pid()",
                )
                .bind(name)
                .execute(&pool)
                .await
                .map_err(|e| engine_error(Engine::Postgresql, &e))?;
                pg_exec(&pool, &format!("DROP DATABASE IF EXISTS \"{name}\"")).await?;
                pool.close().await;
            }
        }
        info!(%engine, name, "dropped database");
        Ok(())
    }

    async fn stats(&self, engine: Engine, name: &str) -> Result<DatabaseStats, ProviderError> {
        checked("database name", name, MAX_DB_LEN)?;
        match engine {
            Engine::Mysql => {
                let pool = self.mysql().await?;
                let row = sqlx::query(
                    "SELECT CAST(COALESCE(SUM(data_length + index_length), 0) AS SIGNED) AS bytes, \
                     COUNT(*) AS tables \
                     FROM information_schema.TABLES WHERE table_schema = ?",
                )
                .bind(name)
                .fetch_one(&pool)
                .await
                .map_err(|e| engine_error(Engine::Mysql, &e))?;
                pool.close().await;
                let bytes: i64 = row
                    .try_get("bytes")
                    .map_err(|e| engine_error(Engine::Mysql, &e))?;
                let tables: i64 = row
                    .try_get("tables")
                    .map_err(|e| engine_error(Engine::Mysql, &e))?;
                Ok(stats_from(bytes, tables))
            }
            Engine::Postgresql => {
                let pool = self.postgres().await?;
                let bytes: i64 = sqlx::query_scalar("SELECT pg_database_size($1)")
                    .bind(name)
                    .fetch_one(&pool)
                    .await
                    .map_err(|e| engine_error(Engine::Postgresql, &e))?;
                pool.close().await;
                // Table counts live in the target database's own catalog.
                let tables = self.postgres_table_count(name).await?;
                Ok(stats_from(bytes, tables))
            }
        }
    }
}

impl SqlAdmin {
    async fn postgres_table_count(&self, name: &str) -> Result<i64, ProviderError> {
        let dsn = self.postgres_dsn.as_deref().unwrap_or_default();
        let options: sqlx::postgres::PgConnectOptions = dsn
            .parse()
            .map_err(|e| engine_error(Engine::Postgresql, &e))?;
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(options.database(name))
            .await
            .map_err(|e| engine_error(Engine::Postgresql, &e))?;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.tables \
             WHERE table_schema NOT IN ('pg_catalog', 'information_schema')",
        )
        .fetch_one(&pool)
        .await
        .map_err(|e| engine_error(Engine::Postgresql, &e))?;
        pool.close().await;
        Ok(count)
    }
}

#[allow(clippy::cast_precision_loss)]
fn stats_from(bytes: i64, table_count: i64) -> DatabaseStats {
    DatabaseStats {
        size_mb: (bytes as f64 / 1024.0 / 1024.0 * 100.0).round() / 100.0,
        table_count,
    }
}
