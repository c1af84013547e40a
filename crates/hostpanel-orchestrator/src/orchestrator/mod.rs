//! The produced API: registry operations plus project provisioning and
//! lifecycle, each serialised per domain and recorded in the registry.

mod lifecycle_ops;
mod projects;
mod provision;
mod registry;
mod teardown;

use std::sync::Arc;

use hostpanel_core::PanelConfig;
use tracing::warn;

use crate::error::OrchestratorError;
use crate::executor::{Executor, ExecutorSettings};
use crate::lifecycle::{LifecycleEvent, ProjectStatus};
use crate::locks::DomainLocks;
use crate::naming::SiteLayout;
use crate::planner::PlanSettings;
use crate::providers::Providers;
use crate::storage::{Database, Project};

pub use teardown::TeardownReport;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Orchestrates registry rows and host state. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    db: Database,
    providers: Providers,
    executor: Executor,
    locks: DomainLocks,
    config: Arc<PanelConfig>,
    plan_settings: Arc<PlanSettings>,
}

impl Orchestrator {
    pub fn new(db: Database, providers: Providers, config: PanelConfig) -> Result<Self> {
        let plan_settings = PlanSettings::from_config(&config)?;
        let executor = Executor::new(
            providers.clone(),
            ExecutorSettings::from_timeouts(&config.timeouts),
        );
        Ok(Self {
            db,
            providers,
            executor,
            locks: DomainLocks::new(),
            config: Arc::new(config),
            plan_settings: Arc::new(plan_settings),
        })
    }

    pub const fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &PanelConfig {
        &self.config
    }

    fn layout(&self, project: &Project) -> SiteLayout {
        SiteLayout::new(&self.config.paths, &project.domain, project.framework)
    }

    /// Move `project` along `event`, compare-and-set against its current
    /// status. `last_error` replaces the stored error.
    async fn advance(
        &self,
        project: &Project,
        event: LifecycleEvent,
        last_error: Option<&str>,
    ) -> Result<ProjectStatus> {
        let next = project.status.apply(event)?;
        self.set_status(project, next, last_error).await?;
        Ok(next)
    }

    async fn set_status(
        &self,
        project: &Project,
        next: ProjectStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        if self
            .db
            .transition_project_status(project.id, project.status, next, last_error)
            .await?
        {
            return Ok(());
        }
        let found = self.db.get_project(project.id).await?.status;
        Err(OrchestratorError::StatusChanged {
            expected: project.status,
            found,
        })
    }

    /// Record a failed run: the project moves to `error` carrying the
    /// message. Registry failures here are logged, never masking `cause`.
    async fn record_failure(&self, project: &Project, cause: &OrchestratorError) {
        let message = cause.to_string();
        if let Err(e) = self
            .advance(project, LifecycleEvent::Failed, Some(&message))
            .await
        {
            warn!(project = %project.project_name, error = %e, "could not record failure");
        }
    }
}
