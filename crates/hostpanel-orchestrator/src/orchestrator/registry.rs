//! Domains, database users, and databases.
//!
//! Users and databases are created in two phases: reserve a `pending` row
//! (the unique constraint decides duplicates), mutate the engine, then
//! confirm the row as `ready`. A failed engine call releases the
//! reservation. A failed confirm drops what the engine just created, so
//! neither side is left holding something the other does not know about.

use tracing::{info, warn};

use super::{Orchestrator, Result};
use crate::error::OrchestratorError;
use crate::naming::{normalize_domain, validate_identifier};
use crate::providers::ProviderError;
use crate::storage::{
    DatabaseError, DatabaseRecord, DatabaseStats, DbUser, Domain, Engine, RowState,
};

const MAX_USERNAME_LEN: usize = 32;
const MAX_DATABASE_LEN: usize = 63;

/// An engine reporting that the object already exists.
fn engine_already_has(e: &ProviderError) -> bool {
    matches!(e, ProviderError::Engine { message, .. } if message.to_lowercase().contains("exist"))
}

impl Orchestrator {
    // =========================================================================
    // Domains
    // =========================================================================

    pub async fn create_domain(&self, domain: &str, provider: Option<&str>) -> Result<Domain> {
        let domain = normalize_domain(domain)?;
        let created = self.db.create_domain(&domain, provider).await?;
        info!(domain = %created.domain, "domain registered");
        Ok(created)
    }

    pub async fn list_domains(&self) -> Result<Vec<Domain>> {
        Ok(self.db.list_domains().await?)
    }

    pub async fn set_domain_provider(&self, domain: &str, provider: Option<&str>) -> Result<Domain> {
        let domain = normalize_domain(domain)?;
        Ok(self.db.set_domain_provider(&domain, provider).await?)
    }

    /// Remove a domain. Refused while a project uses it.
    pub async fn delete_domain(&self, domain: &str) -> Result<()> {
        let domain = normalize_domain(domain)?;
        self.db.delete_domain(&domain).await.map_err(|e| match e {
            DatabaseError::StillReferenced(_) => OrchestratorError::StillReferenced(format!(
                "domain {domain} is used by a project; delete the project first"
            )),
            other => other.into(),
        })?;
        info!(domain = %domain, "domain removed");
        Ok(())
    }

    // =========================================================================
    // Database users
    // =========================================================================

    pub async fn create_db_user(
        &self,
        username: &str,
        password: &str,
        engine: Engine,
    ) -> Result<DbUser> {
        validate_identifier("username", username, MAX_USERNAME_LEN)?;
        if password.is_empty() {
            return Err(OrchestratorError::Validation("password cannot be empty".into()));
        }

        let reserved = self
            .db
            .reserve_db_user(username, password, engine)
            .await
            .map_err(|e| match e {
                DatabaseError::AlreadyExists(_) => {
                    OrchestratorError::Conflict(format!("User {username} already exist"))
                }
                other => other.into(),
            })?;

        if let Err(e) = self
            .providers
            .relational
            .create_user(engine, username, password)
            .await
        {
            if engine_already_has(&e) {
                warn!(%engine, username, "user exists on the engine but not in the registry; leaving it untouched");
            }
            self.release_db_user(reserved.id).await;
            return Err(OrchestratorError::step("create-database-user", e));
        }

        if let Err(e) = self.db.set_db_user_state(reserved.id, RowState::Ready).await {
            warn!(%engine, username, error = %e, "confirm failed, dropping the engine user");
            if let Err(drop_err) = self.providers.relational.drop_user(engine, username).await {
                warn!(%engine, username, error = %drop_err, "could not drop engine user after failed confirm");
            }
            self.release_db_user(reserved.id).await;
            return Err(e.into());
        }

        info!(%engine, username, "database user created");
        Ok(self.db.get_db_user(reserved.id).await?)
    }

    async fn release_db_user(&self, id: i64) {
        if let Err(e) = self.db.delete_db_user(id).await {
            warn!(id, error = %e, "could not release user reservation");
        }
    }

    pub async fn list_db_users(&self, engine: Option<Engine>) -> Result<Vec<DbUser>> {
        Ok(self.db.list_db_users(engine).await?)
    }

    /// Drop a user from its engine and the registry. Refused while any
    /// database is owned by it.
    pub async fn delete_db_user(&self, username: &str, engine: Engine) -> Result<()> {
        let user = self.find_user(username, engine).await?;
        if !self.db.begin_drop_db_user(user.id).await? {
            if self.db.count_databases_for_user(user.id).await? > 0 {
                return Err(OrchestratorError::StillReferenced(format!(
                    "user {username} still owns databases"
                )));
            }
            return Err(OrchestratorError::Conflict(format!(
                "user {username} is being modified by another operation"
            )));
        }

        if let Err(e) = self.providers.relational.drop_user(engine, username).await {
            self.db.set_db_user_state(user.id, RowState::Ready).await?;
            return Err(OrchestratorError::step("drop-database-user", e));
        }
        self.db.delete_db_user(user.id).await?;
        info!(%engine, username, "database user removed");
        Ok(())
    }

    async fn find_user(&self, username: &str, engine: Engine) -> Result<DbUser> {
        self.db
            .get_db_user_by_name(username, engine)
            .await
            .map_err(|e| match e {
                DatabaseError::NotFound(_) => {
                    OrchestratorError::NotFound(format!("user {username} ({engine})"))
                }
                other => other.into(),
            })
    }

    // =========================================================================
    // Databases
    // =========================================================================

    /// Create a database owned by an existing user.
    ///
    /// A missing owner or a duplicate name is rejected before the engine
    /// is touched.
    pub async fn create_database(
        &self,
        name: &str,
        engine: Engine,
        owner: &str,
    ) -> Result<DatabaseRecord> {
        validate_identifier("database name", name, MAX_DATABASE_LEN)?;
        let user = self.find_user(owner, engine).await?;

        let reserved = self
            .db
            .reserve_database(name, engine, user.id)
            .await
            .map_err(|e| match e {
                DatabaseError::AlreadyExists(_) => {
                    OrchestratorError::Conflict(format!("Database {name} already exist"))
                }
                DatabaseError::InvalidReference(_) => OrchestratorError::InvalidReference(
                    format!("user {owner} ({engine}) is no longer available"),
                ),
                other => other.into(),
            })?;

        if let Err(e) = self
            .providers
            .relational
            .create_database(engine, name, owner)
            .await
        {
            if engine_already_has(&e) {
                warn!(%engine, name, "database exists on the engine but not in the registry; leaving it untouched");
            }
            self.release_database(reserved.id).await;
            return Err(OrchestratorError::step("create-database", e));
        }

        if let Err(e) = self.db.set_database_state(reserved.id, RowState::Ready).await {
            warn!(%engine, name, error = %e, "confirm failed, dropping the engine database");
            if let Err(drop_err) = self
                .providers
                .relational
                .drop_database(engine, name, owner)
                .await
            {
                warn!(%engine, name, error = %drop_err, "could not drop engine database after failed confirm");
            }
            self.release_database(reserved.id).await;
            return Err(e.into());
        }

        info!(%engine, name, owner, "database created");
        Ok(self.db.get_database(reserved.id).await?)
    }

    async fn release_database(&self, id: i64) {
        if let Err(e) = self.db.delete_database(id).await {
            warn!(id, error = %e, "could not release database reservation");
        }
    }

    pub async fn list_databases(&self, engine: Option<Engine>) -> Result<Vec<DatabaseRecord>> {
        Ok(self.db.list_databases(engine).await?)
    }

    async fn find_database(&self, name: &str, engine: Engine) -> Result<DatabaseRecord> {
        self.db
            .get_database_by_name(name, engine)
            .await
            .map_err(|e| match e {
                DatabaseError::NotFound(_) => {
                    OrchestratorError::NotFound(format!("database {name} ({engine})"))
                }
                other => other.into(),
            })
    }

    /// Drop a database from its engine and the registry. Refused while a
    /// project references it.
    pub async fn delete_database(&self, name: &str, engine: Engine) -> Result<()> {
        let record = self.find_database(name, engine).await?;
        if !self.db.begin_drop_database(record.id).await? {
            if self.db.count_projects_for_database(record.id).await? > 0 {
                return Err(OrchestratorError::StillReferenced(format!(
                    "database {name} is used by a project"
                )));
            }
            return Err(OrchestratorError::Conflict(format!(
                "database {name} is being modified by another operation"
            )));
        }

        let owner = self.db.get_db_user(record.user_id).await?;
        if let Err(e) = self
            .providers
            .relational
            .drop_database(engine, name, &owner.username)
            .await
        {
            self.db.set_database_state(record.id, RowState::Ready).await?;
            return Err(OrchestratorError::step("drop-database", e));
        }
        self.db.delete_database(record.id).await?;
        info!(%engine, name, "database removed");
        Ok(())
    }

    /// Live size and table count, read from the engine.
    pub async fn database_stats(&self, name: &str, engine: Engine) -> Result<DatabaseStats> {
        let record = self.find_database(name, engine).await?;
        self.providers
            .relational
            .stats(engine, &record.name)
            .await
            .map_err(|e| OrchestratorError::step("database-stats", e))
    }
}
