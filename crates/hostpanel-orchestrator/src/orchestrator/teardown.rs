//! Project deletion.

use serde::Serialize;
use tracing::{info, warn};

use super::{Orchestrator, Result};
use crate::error::OrchestratorError;
use crate::lifecycle::{LifecycleEvent, ProjectStatus};
use crate::planner::{self, SiteFacts};

/// What a completed teardown could not clean up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    /// Best-effort steps that failed or were skipped.
    pub warnings: Vec<String>,
}

impl Orchestrator {
    /// Remove every host artifact of a project, then its row.
    ///
    /// Teardown runs to the end even when steps fail. If a required step
    /// failed, the row stays `closed` with the failures recorded, and the
    /// call may be repeated. The domain and database are left alone.
    pub async fn delete(&self, id: i64) -> Result<TeardownReport> {
        let project = self.db.get_project(id).await?;
        let _guard = self.locks.acquire(&project.domain).await;
        let mut project = self.db.get_project(id).await?;

        if project.status != ProjectStatus::Closed {
            self.advance(&project, LifecycleEvent::Close, None).await?;
            project = self.db.get_project(id).await?;
        }

        let layout = self.layout(&project);
        let facts = match SiteFacts::gather(&self.providers, &layout).await {
            Ok(facts) => facts,
            Err(e) => {
                warn!(domain = %project.domain, error = %e, "could not inspect site, tearing down by name");
                SiteFacts::default()
            }
        };
        let plan = planner::plan_teardown(&layout, &facts);
        let outcome = self.executor.run_teardown(&plan).await;

        if !outcome.failures.is_empty() {
            let err = OrchestratorError::Teardown {
                domain: project.domain.clone(),
                failures: outcome.failures,
            };
            if let Err(e) = self.db.set_project_error(id, &err.to_string()).await {
                warn!(project = %project.project_name, error = %e, "could not record teardown failure");
            }
            return Err(err);
        }

        self.db.delete_project(id).await?;
        info!(
            project = %project.project_name,
            warnings = outcome.warnings.len(),
            "project deleted"
        );
        Ok(TeardownReport {
            warnings: outcome.warnings,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use hostpanel_core::PanelConfig;

    use super::*;
    use crate::error::ErrorKind;
    use crate::providers::fake::FakeHost;
    use crate::storage::{Database, Framework, Project};

    async fn running_php() -> (Orchestrator, Arc<FakeHost>, Project) {
        let host = FakeHost::new();
        let db = Database::open_in_memory().await.unwrap();
        let mut config = PanelConfig::default();
        config.timeouts.pool_settle_ms = 0;
        let orch = Orchestrator::new(db, host.providers(), config).unwrap();
        orch.create_domain("app.example.com", None).await.unwrap();
        let project = orch
            .create_project("app.example.com", Framework::Php, None)
            .await
            .unwrap();
        host.put_archive("/tmp/app.zip", &[("index.php", "<?php")]);
        orch.receive_archive(project.id, Path::new("/tmp/app.zip"))
            .await
            .unwrap();
        let project = orch.provision(project.id).await.unwrap();
        (orch, host, project)
    }

    #[tokio::test]
    async fn delete_removes_host_artifacts_and_row() {
        let (orch, host, project) = running_php().await;
        let report = orch.delete(project.id).await.unwrap();
        assert!(report.warnings.is_empty());

        assert!(host.vhost("app_example_com.conf").is_none());
        assert!(host.enabled_target("app_example_com.conf").is_none());
        assert!(host.pool("app.example.com").is_none());
        assert!(!host.has_certificate("app.example.com"));
        assert!(!host.path_exists(Path::new(&project.root_directory)));
        assert_eq!(orch.status(project.id).await.unwrap_err().kind(), ErrorKind::NotFound);
        // The domain outlives the project.
        assert_eq!(orch.list_domains().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn required_failure_keeps_the_row_and_certificate() {
        let (orch, host, project) = running_php().await;
        host.fail_once("remove-vhost", "Read-only file system");

        let err = orch.delete(project.id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Teardown { .. }));
        let kept = orch.get_project(project.id).await.unwrap();
        assert_eq!(kept.status, ProjectStatus::Closed);
        assert!(kept.last_error.unwrap().contains("Read-only file system"));
        assert!(host.has_certificate("app.example.com"));
        // Later steps still ran.
        assert!(!host.path_exists(Path::new(&project.root_directory)));

        orch.delete(project.id).await.unwrap();
        assert!(!host.has_certificate("app.example.com"));
    }

    #[tokio::test]
    async fn best_effort_failures_become_warnings() {
        let (orch, host, project) = running_php().await;
        host.fail("reload-proxy", "nginx.service is not active");

        let report = orch.delete(project.id).await.unwrap();
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].starts_with("reload-proxy"));
        assert_eq!(orch.status(project.id).await.unwrap_err().kind(), ErrorKind::NotFound);
    }
}
