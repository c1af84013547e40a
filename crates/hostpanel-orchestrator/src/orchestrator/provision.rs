//! Provisioning runs.

use hostpanel_core::db::unix_timestamp;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Orchestrator, Result};
use crate::error::OrchestratorError;
use crate::lifecycle::{LifecycleEvent, ProjectStatus};
use crate::planner::{self, SiteFacts};
use crate::storage::Project;

impl Orchestrator {
    /// Deploy a project: `files_uploaded` (or `error`) → `deploying` →
    /// `running`.
    ///
    /// A running project is returned unchanged. On failure the project is
    /// left in `error` with the failing step recorded; host changes already
    /// applied stay in place and a retry picks up from them.
    pub async fn provision(&self, id: i64) -> Result<Project> {
        self.provision_with_cancel(id, &CancellationToken::new())
            .await
    }

    /// [`Self::provision`] that stops between steps once `cancel` fires.
    pub async fn provision_with_cancel(
        &self,
        id: i64,
        cancel: &CancellationToken,
    ) -> Result<Project> {
        let project = self.db.get_project(id).await?;
        let _guard = self.locks.acquire(&project.domain).await;
        // Re-read under the lock; a queued run may have changed it.
        let project = self.db.get_project(id).await?;

        if project.status == ProjectStatus::Running {
            info!(project = %project.project_name, "already running");
            return Ok(project);
        }
        if project.status == ProjectStatus::Deploying {
            warn!(project = %project.project_name, "resuming an interrupted deployment");
        }

        self.advance(&project, LifecycleEvent::DeployStarted, None)
            .await?;
        let deploying = self.db.get_project(id).await?;

        match self.run_provision(&deploying, cancel).await {
            Ok(issued_certificate) => {
                self.advance(&deploying, LifecycleEvent::DeploySucceeded, None)
                    .await?;
                if issued_certificate {
                    if let Err(e) = self
                        .db
                        .record_ssl_renewal(&deploying.domain, unix_timestamp())
                        .await
                    {
                        warn!(domain = %deploying.domain, error = %e, "could not record certificate date");
                    }
                }
                info!(project = %deploying.project_name, "project running");
                Ok(self.db.get_project(id).await?)
            }
            Err(e) => {
                warn!(project = %deploying.project_name, error = %e, "provisioning failed");
                self.record_failure(&deploying, &e).await;
                Err(e)
            }
        }
    }

    /// Plan and execute; returns whether a certificate was issued.
    async fn run_provision(&self, project: &Project, cancel: &CancellationToken) -> Result<bool> {
        let layout = self.layout(project);
        let facts = SiteFacts::gather(&self.providers, &layout)
            .await
            .map_err(|e| OrchestratorError::step("inspect-site", e))?;
        let plan = planner::plan_provision(
            &layout,
            &facts,
            &self.plan_settings,
            self.providers.proxy.service(),
        );
        if let Some(choice) = plan.php {
            info!(
                project = %project.project_name,
                php = %choice.version,
                source = ?choice.source,
                "runtime selected"
            );
        }
        let report = self.executor.run(&plan, cancel).await?;
        Ok(report.was_applied("ensure-certificate"))
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
    use crate::storage::{Database, Framework};

    async fn uploaded_php_project() -> (Orchestrator, Arc<FakeHost>, Project) {
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
        let project = orch
            .receive_archive(project.id, Path::new("/tmp/app.zip"))
            .await
            .unwrap();
        (orch, host, project)
    }

    #[tokio::test]
    async fn provision_reaches_running_and_records_certificate() {
        let (orch, host, project) = uploaded_php_project().await;
        let project = orch.provision(project.id).await.unwrap();
        assert_eq!(project.status, ProjectStatus::Running);
        assert!(project.last_error.is_none());
        assert!(host.vhost("app_example_com.conf").unwrap().contains("listen 443 ssl"));

        let domain = orch.db().get_domain_by_name("app.example.com").await.unwrap();
        assert!(domain.ssl_renewed_at.is_some());
    }

    #[tokio::test]
    async fn provision_of_running_project_is_a_no_op() {
        let (orch, host, project) = uploaded_php_project().await;
        orch.provision(project.id).await.unwrap();
        host.clear_calls();
        let again = orch.provision(project.id).await.unwrap();
        assert_eq!(again.status, ProjectStatus::Running);
        assert!(host.calls().is_empty());
    }

    #[tokio::test]
    async fn failing_step_moves_project_to_error() {
        let (orch, host, project) = uploaded_php_project().await;
        host.fail("validate-proxy", "nginx: [emerg] unknown directive \"lisen\"");

        let err = orch.provision(project.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalTool);
        let project = orch.get_project(project.id).await.unwrap();
        assert_eq!(project.status, ProjectStatus::Error);
        let last_error = project.last_error.unwrap();
        assert!(last_error.contains("validate-proxy-config"));
        assert!(last_error.contains("unknown directive"));

        host.clear_failures();
        let project = orch.provision(project.id).await.unwrap();
        assert_eq!(project.status, ProjectStatus::Running);
        assert!(project.last_error.is_none());
    }

    #[tokio::test]
    async fn cancelled_run_is_left_in_error() {
        let (orch, _host, project) = uploaded_php_project().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orch
            .provision_with_cancel(project.id, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled { .. }));
        let project = orch.get_project(project.id).await.unwrap();
        assert_eq!(project.status, ProjectStatus::Error);
    }

    #[tokio::test]
    async fn initialized_project_cannot_be_provisioned() {
        let host = FakeHost::new();
        let db = Database::open_in_memory().await.unwrap();
        let orch = Orchestrator::new(db, host.providers(), PanelConfig::default()).unwrap();
        orch.create_domain("app.example.com", None).await.unwrap();
        let project = orch
            .create_project("app.example.com", Framework::Php, None)
            .await
            .unwrap();

        let err = orch.provision(project.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        assert!(host.calls().is_empty());
        assert_eq!(
            orch.get_project(project.id).await.unwrap().status,
            ProjectStatus::Initialized
        );
    }
}
