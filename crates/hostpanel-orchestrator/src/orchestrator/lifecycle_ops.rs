//! Suspend, restart, and status.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Orchestrator, Result};
use crate::error::OrchestratorError;
use crate::lifecycle::{LifecycleEvent, ProjectStatus};
use crate::planner::{self, Plan, SiteFacts};
use crate::storage::Project;

impl Orchestrator {
    /// Replace a running site with the static suspended page.
    ///
    /// Only sites that support suspension may be suspended. Suspending a
    /// suspended project does nothing.
    pub async fn suspend(&self, id: i64) -> Result<()> {
        let project = self.db.get_project(id).await?;
        if !project.framework.supports_suspend() {
            return Err(OrchestratorError::Unsupported {
                operation: "suspend",
                framework: project.framework,
            });
        }

        let _guard = self.locks.acquire(&project.domain).await;
        let project = self.db.get_project(id).await?;
        if project.status == ProjectStatus::Suspended {
            info!(project = %project.project_name, "already suspended");
            return Ok(());
        }
        let next = project.status.apply(LifecycleEvent::Suspend)?;

        let layout = self.layout(&project);
        let plan = planner::plan_suspend(&layout, &self.plan_settings);
        self.run_lifecycle_plan(&project, &plan, next).await?;
        info!(project = %project.project_name, "project suspended");
        Ok(())
    }

    /// Restart a running site in place, or bring a suspended one back.
    pub async fn restart(&self, id: i64) -> Result<()> {
        let project = self.db.get_project(id).await?;
        let _guard = self.locks.acquire(&project.domain).await;
        let project = self.db.get_project(id).await?;
        let next = project.status.apply(LifecycleEvent::Resume)?;

        let layout = self.layout(&project);
        let facts = match SiteFacts::gather(&self.providers, &layout).await {
            Ok(facts) => facts,
            Err(e) => {
                let err = OrchestratorError::step("inspect-site", e);
                self.record_failure(&project, &err).await;
                return Err(err);
            }
        };
        let proxy_service = self.providers.proxy.service();
        let plan = if project.status == ProjectStatus::Suspended {
            planner::plan_resume(&layout, &facts, &self.plan_settings, proxy_service)
        } else {
            planner::plan_restart(&layout, &facts, &self.plan_settings, proxy_service)
        };
        self.run_lifecycle_plan(&project, &plan, next).await?;
        info!(project = %project.project_name, operation = plan.operation, "project running");
        Ok(())
    }

    /// Current status of a project. A deleted project is not found.
    pub async fn status(&self, id: i64) -> Result<ProjectStatus> {
        Ok(self.db.get_project(id).await?.status)
    }

    /// Execute a short lifecycle plan, then store `next`. Failures move the
    /// project to `error`.
    async fn run_lifecycle_plan(
        &self,
        project: &Project,
        plan: &Plan,
        next: ProjectStatus,
    ) -> Result<()> {
        if let Err(e) = self.executor.run(plan, &CancellationToken::new()).await {
            warn!(project = %project.project_name, operation = plan.operation, error = %e, "lifecycle run failed");
            self.record_failure(project, &e).await;
            return Err(e);
        }
        self.set_status(project, next, None).await
    }
}
