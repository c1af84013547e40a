//! Database-user and database queries.
//!
//! Rows are written in two phases: `reserve_*` inserts a `pending` row (the
//! unique constraint is the authoritative duplicate check), the caller
//! mutates the engine, then marks the row `ready` with `set_*_state` or
//! deletes the reservation.

use hostpanel_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{DatabaseRecord, DbUser, Engine, RowState};

impl Database {
    // =========================================================================
    // Database user queries
    // =========================================================================

    /// Reserve a username on an engine.
    pub async fn reserve_db_user(
        &self,
        username: &str,
        password: &str,
        engine: Engine,
    ) -> Result<DbUser, DatabaseError> {
        let now = unix_timestamp();

        let id = sqlx::query(
            r"
            INSERT INTO db_users (username, password, engine, state, created_at, updated_at)
            VALUES (?, ?, ?, 'pending', ?, ?)
            ",
        )
        .bind(username)
        .bind(password)
        .bind(engine)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|e| DatabaseError::on_write(e, &format!("user {username}")))?
        .last_insert_rowid();

        self.get_db_user(id).await
    }

    /// Get a user by ID, whatever its state.
    pub async fn get_db_user(&self, id: i64) -> Result<DbUser, DatabaseError> {
        sqlx::query_as::<_, DbUser>("SELECT * FROM db_users WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("User {id}")))
    }

    /// Get a ready user by username.
    pub async fn get_db_user_by_name(
        &self,
        username: &str,
        engine: Engine,
    ) -> Result<DbUser, DatabaseError> {
        sqlx::query_as::<_, DbUser>(
            "SELECT * FROM db_users WHERE username = ? AND engine = ? AND state = 'ready'",
        )
        .bind(username)
        .bind(engine)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("User {username}")))
    }

    /// List ready users, optionally for one engine.
    pub async fn list_db_users(&self, engine: Option<Engine>) -> Result<Vec<DbUser>, DatabaseError> {
        let users = if let Some(engine) = engine {
            sqlx::query_as::<_, DbUser>(
                "SELECT * FROM db_users WHERE state = 'ready' AND engine = ? ORDER BY username",
            )
            .bind(engine)
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as::<_, DbUser>(
                "SELECT * FROM db_users WHERE state = 'ready' ORDER BY engine, username",
            )
            .fetch_all(self.pool())
            .await?
        };
        Ok(users)
    }

    /// Move a user row between states.
    pub async fn set_db_user_state(&self, id: i64, state: RowState) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE db_users SET state = ?, updated_at = ? WHERE id = ?")
            .bind(state)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("User {id}")));
        }
        Ok(())
    }

    /// Mark a ready user as `dropping` unless a database still references it.
    ///
    /// Returns `false` when the user is referenced or not ready.
    pub async fn begin_drop_db_user(&self, id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r"
            UPDATE db_users SET state = 'dropping', updated_at = ?
            WHERE id = ? AND state = 'ready'
              AND NOT EXISTS (SELECT 1 FROM databases WHERE user_id = ?)
            ",
        )
        .bind(unix_timestamp())
        .bind(id)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Number of databases owned by a user, in any state.
    pub async fn count_databases_for_user(&self, user_id: i64) -> Result<i64, DatabaseError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM databases WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }

    /// Delete a user row.
    pub async fn delete_db_user(&self, id: i64) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM db_users WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|e| DatabaseError::on_delete(e, &format!("user {id}")))?;
        Ok(())
    }

    // =========================================================================
    // Database queries
    // =========================================================================

    /// Reserve a database name on an engine for the given owner.
    ///
    /// The owner must be `ready`; a missing or dropping owner fails with
    /// `InvalidReference`.
    pub async fn reserve_database(
        &self,
        name: &str,
        engine: Engine,
        user_id: i64,
    ) -> Result<DatabaseRecord, DatabaseError> {
        let now = unix_timestamp();
        let subject = format!("database {name}");

        let result = sqlx::query(
            r"
            INSERT INTO databases (name, engine, user_id, state, created_at, updated_at)
            SELECT ?, ?, ?, 'pending', ?, ?
            WHERE EXISTS (SELECT 1 FROM db_users WHERE id = ? AND state = 'ready')
            ",
        )
        .bind(name)
        .bind(engine)
        .bind(user_id)
        .bind(now)
        .bind(now)
        .bind(user_id)
        .execute(self.pool())
        .await
        .map_err(|e| DatabaseError::on_write(e, &subject))?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::InvalidReference(subject));
        }
        self.get_database(result.last_insert_rowid()).await
    }

    /// Get a database by ID, whatever its state.
    pub async fn get_database(&self, id: i64) -> Result<DatabaseRecord, DatabaseError> {
        sqlx::query_as::<_, DatabaseRecord>("SELECT * FROM databases WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Database {id}")))
    }

    /// Get a ready database by name.
    pub async fn get_database_by_name(
        &self,
        name: &str,
        engine: Engine,
    ) -> Result<DatabaseRecord, DatabaseError> {
        sqlx::query_as::<_, DatabaseRecord>(
            "SELECT * FROM databases WHERE name = ? AND engine = ? AND state = 'ready'",
        )
        .bind(name)
        .bind(engine)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Database {name}")))
    }

    /// List ready databases, optionally for one engine.
    pub async fn list_databases(
        &self,
        engine: Option<Engine>,
    ) -> Result<Vec<DatabaseRecord>, DatabaseError> {
        let databases = if let Some(engine) = engine {
            sqlx::query_as::<_, DatabaseRecord>(
                "SELECT * FROM databases WHERE state = 'ready' AND engine = ? ORDER BY name",
            )
            .bind(engine)
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as::<_, DatabaseRecord>(
                "SELECT * FROM databases WHERE state = 'ready' ORDER BY engine, name",
            )
            .fetch_all(self.pool())
            .await?
        };
        Ok(databases)
    }

    /// Count rows with a given name on an engine, in any state.
    pub async fn count_databases_named(
        &self,
        name: &str,
        engine: Engine,
    ) -> Result<i64, DatabaseError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM databases WHERE name = ? AND engine = ?")
                .bind(name)
                .bind(engine)
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }

    /// Move a database row between states.
    pub async fn set_database_state(&self, id: i64, state: RowState) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE databases SET state = ?, updated_at = ? WHERE id = ?")
            .bind(state)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Database {id}")));
        }
        Ok(())
    }

    /// Mark a ready database as `dropping` unless a project still uses it.
    ///
    /// Returns `false` when the database is referenced or not ready.
    pub async fn begin_drop_database(&self, id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r"
            UPDATE databases SET state = 'dropping', updated_at = ?
            WHERE id = ? AND state = 'ready'
              AND NOT EXISTS (SELECT 1 FROM projects WHERE database_id = ?)
            ",
        )
        .bind(unix_timestamp())
        .bind(id)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Number of projects using a database.
    pub async fn count_projects_for_database(&self, database_id: i64) -> Result<i64, DatabaseError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM projects WHERE database_id = ?")
            .bind(database_id)
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }

    /// Delete a database row.
    pub async fn delete_database(&self, id: i64) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM databases WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|e| DatabaseError::on_delete(e, &format!("database {id}")))?;
        Ok(())
    }
}
