//! Orchestrator error taxonomy.

use thiserror::Error;

use crate::lifecycle::{ProjectStatus, TransitionError};
use crate::providers::ProviderError;
use crate::storage::{DatabaseError, Framework};

/// Errors returned by orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Malformed input, rejected before any mutation.
    #[error("invalid input: {0}")]
    Validation(String),

    /// A uniquely named resource already exists.
    #[error("{0}")]
    Conflict(String),

    /// A referenced domain, database, or user does not exist.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Removal refused because another record still points here.
    #[error("still in use: {0}")]
    StillReferenced(String),

    /// An external tool failed. Carries the tool's diagnostic text.
    #[error("step {step} failed: {source}")]
    Step {
        step: String,
        #[source]
        source: ProviderError,
    },

    #[error(transparent)]
    InvalidState(#[from] TransitionError),

    #[error("project status changed concurrently: expected {expected}, found {found}")]
    StatusChanged {
        expected: ProjectStatus,
        found: ProjectStatus,
    },

    #[error("{operation} is not supported for {framework} projects")]
    Unsupported {
        operation: &'static str,
        framework: Framework,
    },

    #[error("cancelled before step {next_step}")]
    Cancelled { next_step: String },

    /// Required teardown steps failed; the project row was kept.
    #[error("teardown of {domain} incomplete: {}", .failures.join("; "))]
    Teardown {
        domain: String,
        failures: Vec<String>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("registry error: {0}")]
    Registry(DatabaseError),
}

/// Coarse error class, for callers that map errors onto responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    Reference,
    NotFound,
    ExternalTool,
    State,
    Internal,
}

impl OrchestratorError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Unsupported { .. } => ErrorKind::Validation,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::InvalidReference(_) | Self::StillReferenced(_) => ErrorKind::Reference,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Step { .. } | Self::Teardown { .. } => ErrorKind::ExternalTool,
            Self::InvalidState(_) | Self::StatusChanged { .. } | Self::Cancelled { .. } => {
                ErrorKind::State
            }
            Self::Config(_) | Self::Registry(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn step(step: impl Into<String>, source: ProviderError) -> Self {
        Self::Step {
            step: step.into(),
            source,
        }
    }
}

impl From<DatabaseError> for OrchestratorError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => Self::NotFound(what),
            DatabaseError::AlreadyExists(what) => Self::Conflict(format!("{what} already exists")),
            DatabaseError::InvalidReference(what) => {
                Self::InvalidReference(format!("{what} references a missing record"))
            }
            DatabaseError::StillReferenced(what) => {
                Self::StillReferenced(format!("{what} is still referenced"))
            }
            other => Self::Registry(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleEvent;

    #[test]
    fn registry_constraint_errors_keep_their_kind() {
        let err = OrchestratorError::from(DatabaseError::AlreadyExists("domain a.example".into()));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.to_string(), "domain a.example already exists");

        let err = OrchestratorError::from(DatabaseError::InvalidReference("project x".into()));
        assert_eq!(err.kind(), ErrorKind::Reference);

        let err = OrchestratorError::from(DatabaseError::Query("disk I/O error".into()));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn state_errors_are_readable() {
        let err = OrchestratorError::from(TransitionError {
            from: ProjectStatus::Initialized,
            event: LifecycleEvent::Suspend,
        });
        assert_eq!(err.kind(), ErrorKind::State);
        assert_eq!(err.to_string(), "cannot suspend a project that is initialized");
    }

    #[test]
    fn step_errors_carry_tool_output() {
        let err = OrchestratorError::step(
            "validate-proxy-config",
            ProviderError::CommandFailed {
                command: "nginx -t".into(),
                code: Some(1),
                diagnostics: "unexpected \"}\" in /etc/nginx/sites-enabled/a.conf:12".into(),
            },
        );
        assert_eq!(err.kind(), ErrorKind::ExternalTool);
        let text = err.to_string();
        assert!(text.contains("validate-proxy-config"));
        assert!(text.contains("sites-enabled/a.conf:12"));
    }
}
