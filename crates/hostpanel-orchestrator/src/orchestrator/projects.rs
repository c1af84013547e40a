//! Project records and archive delivery.

use std::path::Path;

use tracing::{info, warn};

use super::{Orchestrator, Result};
use crate::error::OrchestratorError;
use crate::lifecycle::{LifecycleEvent, ProjectStatus};
use crate::naming::{SiteLayout, normalize_domain};
use crate::storage::{DatabaseError, Engine, Framework, NewProject, Project};

impl Orchestrator {
    /// Register a project on an existing domain, optionally bound to an
    /// existing database. Nothing on the host changes.
    pub async fn create_project(
        &self,
        domain: &str,
        framework: Framework,
        database: Option<(&str, Engine)>,
    ) -> Result<Project> {
        let domain = normalize_domain(domain)?;
        if framework.requires_database() && database.is_none() {
            return Err(OrchestratorError::Validation(format!(
                "{framework} projects need a database"
            )));
        }

        let domain_row = self
            .db
            .get_domain_by_name(&domain)
            .await
            .map_err(|e| missing_as_reference(e, format!("domain {domain} is not registered")))?;

        let database_id = match database {
            Some((name, engine)) => {
                let record = self
                    .db
                    .get_database_by_name(name, engine)
                    .await
                    .map_err(|e| {
                        missing_as_reference(e, format!("database {name} ({engine}) does not exist"))
                    })?;
                Some(record.id)
            }
            None => None,
        };

        let layout = SiteLayout::new(&self.config.paths, &domain, framework);
        let root = layout.root.to_string_lossy();
        let project = self
            .db
            .create_project(&NewProject {
                project_name: &layout.project_name,
                domain_id: domain_row.id,
                database_id,
                framework,
                root_directory: &root,
            })
            .await
            .map_err(|e| match e {
                DatabaseError::AlreadyExists(_) => OrchestratorError::Conflict(format!(
                    "a project already exists for {domain}"
                )),
                DatabaseError::InvalidReference(_) => OrchestratorError::InvalidReference(format!(
                    "domain {domain} or its database is no longer available"
                )),
                other => other.into(),
            })?;

        info!(project = %project.project_name, %framework, "project created");
        Ok(project)
    }

    pub async fn get_project(&self, id: i64) -> Result<Project> {
        Ok(self.db.get_project(id).await?)
    }

    pub async fn find_project(&self, domain: &str) -> Result<Project> {
        let domain = normalize_domain(domain)?;
        Ok(self.db.get_project_by_domain(&domain).await?)
    }

    pub async fn list_projects(&self, status: Option<ProjectStatus>) -> Result<Vec<Project>> {
        Ok(self.db.list_projects(status).await?)
    }

    /// Unpack a delivered archive into the project root and mark the
    /// files as received.
    ///
    /// A failed extraction keeps the status and records the error.
    pub async fn receive_archive(&self, id: i64, archive: &Path) -> Result<Project> {
        let project = self.db.get_project(id).await?;
        let _guard = self.locks.acquire(&project.domain).await;
        let project = self.db.get_project(id).await?;
        let next = project.status.apply(LifecycleEvent::FilesReceived)?;

        let layout = self.layout(&project);
        if let Err(e) = self
            .providers
            .files
            .extract_archive(archive, &layout.root)
            .await
        {
            let err = OrchestratorError::step("extract-archive", e);
            if let Err(record) = self.db.set_project_error(id, &err.to_string()).await {
                warn!(project = %project.project_name, error = %record, "could not record extraction failure");
            }
            return Err(err);
        }

        self.set_status(&project, next, None).await?;
        info!(project = %project.project_name, archive = %archive.display(), "files received");
        Ok(self.db.get_project(id).await?)
    }
}

fn missing_as_reference(e: DatabaseError, message: String) -> OrchestratorError {
    match e {
        DatabaseError::NotFound(_) => OrchestratorError::InvalidReference(message),
        other => other.into(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use hostpanel_core::PanelConfig;

    use super::*;
    use crate::error::ErrorKind;
    use crate::providers::fake::FakeHost;
    use crate::storage::Database;

    async fn setup() -> (Orchestrator, Arc<FakeHost>) {
        let host = FakeHost::new();
        let db = Database::open_in_memory().await.unwrap();
        let orch = Orchestrator::new(db, host.providers(), PanelConfig::default()).unwrap();
        (orch, host)
    }

    #[tokio::test]
    async fn project_needs_registered_domain() {
        let (orch, _host) = setup().await;
        let err = orch
            .create_project("shop.example.com", Framework::Php, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Reference);
        assert!(orch.list_projects(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn wordpress_requires_a_database() {
        let (orch, _host) = setup().await;
        orch.create_domain("shop.example.com", None).await.unwrap();
        let err = orch
            .create_project("shop.example.com", Framework::Wordpress, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = orch
            .create_project(
                "shop.example.com",
                Framework::Wordpress,
                Some(("missing_db", Engine::Mysql)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Reference);
    }

    #[tokio::test]
    async fn one_project_per_domain() {
        let (orch, _host) = setup().await;
        orch.create_domain("app.example.com", None).await.unwrap();
        let project = orch
            .create_project("app.example.com", Framework::Laravel, None)
            .await
            .unwrap();
        assert_eq!(project.project_name, "app_example_com");
        assert_eq!(project.status, ProjectStatus::Initialized);
        assert!(project.root_directory.ends_with("laravel/app_example_com"));

        let err = orch
            .create_project("app.example.com", Framework::Php, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn archive_moves_project_to_files_uploaded() {
        let (orch, host) = setup().await;
        orch.create_domain("app.example.com", None).await.unwrap();
        let project = orch
            .create_project("app.example.com", Framework::Php, None)
            .await
            .unwrap();
        host.put_archive("/tmp/site.zip", &[("index.php", "<?php echo 1;")]);

        let project = orch
            .receive_archive(project.id, Path::new("/tmp/site.zip"))
            .await
            .unwrap();
        assert_eq!(project.status, ProjectStatus::FilesUploaded);
        assert!(host.path_exists(&Path::new(&project.root_directory).join("index.php")));
    }

    #[tokio::test]
    async fn failed_extraction_keeps_status() {
        let (orch, _host) = setup().await;
        orch.create_domain("app.example.com", None).await.unwrap();
        let project = orch
            .create_project("app.example.com", Framework::Php, None)
            .await
            .unwrap();

        let err = orch
            .receive_archive(project.id, Path::new("/tmp/missing.zip"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalTool);
        let project = orch.get_project(project.id).await.unwrap();
        assert_eq!(project.status, ProjectStatus::Initialized);
        assert!(project.last_error.unwrap().contains("extract-archive"));
    }
}
