//! Project queries.

use hostpanel_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{Framework, Project};
use crate::lifecycle::ProjectStatus;

const PROJECT_SELECT: &str = r"
    SELECT p.id, p.project_name, p.domain_id, d.domain AS domain,
           p.database_id, db.name AS database_name, db.engine AS database_engine,
           p.framework, p.root_directory, p.status, p.last_error,
           p.created_at, p.updated_at
    FROM projects p
    JOIN domains d ON d.id = p.domain_id
    LEFT JOIN databases db ON db.id = p.database_id
";

/// Parameters for inserting a project row.
#[derive(Debug, Clone)]
pub struct NewProject<'a> {
    pub project_name: &'a str,
    pub domain_id: i64,
    pub database_id: Option<i64>,
    pub framework: Framework,
    pub root_directory: &'a str,
}

impl Database {
    /// Create a project in the `initialized` state.
    ///
    /// A second project for the same domain fails with `AlreadyExists`; a
    /// dangling domain id, or a database that is missing or not `ready`,
    /// fails with `InvalidReference`.
    pub async fn create_project(&self, params: &NewProject<'_>) -> Result<Project, DatabaseError> {
        let now = unix_timestamp();
        let subject = format!("project {}", params.project_name);

        // The database must be ready when the row lands, so a concurrent
        // drop that already marked it `dropping` cannot lose its reference.
        let result = sqlx::query(
            r"
            INSERT INTO projects
                (project_name, domain_id, database_id, framework, root_directory, status, created_at, updated_at)
            SELECT ?, ?, ?, ?, ?, ?, ?, ?
            WHERE ? IS NULL
               OR EXISTS (SELECT 1 FROM databases WHERE id = ? AND state = 'ready')
            ",
        )
        .bind(params.project_name)
        .bind(params.domain_id)
        .bind(params.database_id)
        .bind(params.framework)
        .bind(params.root_directory)
        .bind(ProjectStatus::Initialized)
        .bind(now)
        .bind(now)
        .bind(params.database_id)
        .bind(params.database_id)
        .execute(self.pool())
        .await
        .map_err(|e| DatabaseError::on_write(e, &subject))?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::InvalidReference(subject));
        }
        self.get_project(result.last_insert_rowid()).await
    }

    /// Get a project by ID.
    pub async fn get_project(&self, id: i64) -> Result<Project, DatabaseError> {
        sqlx::query_as::<_, Project>(&format!("{PROJECT_SELECT} WHERE p.id = ?"))
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Project {id}")))
    }

    /// Get the project deployed on a domain.
    pub async fn get_project_by_domain(&self, domain: &str) -> Result<Project, DatabaseError> {
        sqlx::query_as::<_, Project>(&format!("{PROJECT_SELECT} WHERE d.domain = ?"))
            .bind(domain)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Project for {domain}")))
    }

    /// List projects, optionally filtered by status.
    pub async fn list_projects(
        &self,
        status: Option<ProjectStatus>,
    ) -> Result<Vec<Project>, DatabaseError> {
        let projects = if let Some(status) = status {
            sqlx::query_as::<_, Project>(&format!(
                "{PROJECT_SELECT} WHERE p.status = ? ORDER BY d.domain"
            ))
            .bind(status)
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as::<_, Project>(&format!("{PROJECT_SELECT} ORDER BY d.domain"))
                .fetch_all(self.pool())
                .await?
        };
        Ok(projects)
    }

    /// Compare-and-set the project status.
    ///
    /// Only succeeds when the stored status still equals `from`, so two
    /// writers cannot both advance the same project. `last_error` replaces
    /// the stored error (pass `None` to clear it).
    pub async fn transition_project_status(
        &self,
        id: i64,
        from: ProjectStatus,
        to: ProjectStatus,
        last_error: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE projects SET status = ?, last_error = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(to)
        .bind(last_error)
        .bind(unix_timestamp())
        .bind(id)
        .bind(from)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Record an error without changing status.
    pub async fn set_project_error(&self, id: i64, last_error: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE projects SET last_error = ?, updated_at = ? WHERE id = ?")
            .bind(last_error)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Delete a project row.
    pub async fn delete_project(&self, id: i64) -> Result<(), DatabaseError> {
        let result = sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Project {id}")));
        }
        Ok(())
    }
}
