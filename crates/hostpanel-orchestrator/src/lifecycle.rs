//! Project lifecycle state machine.
//!
//! `ProjectStatus` is the stored state; `LifecycleEvent` is what happened.
//! `ProjectStatus::apply` is the only place transitions are decided.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stored lifecycle state of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ProjectStatus {
    Initialized,
    FilesUploaded,
    Deploying,
    Running,
    Suspended,
    Error,
    Closed,
}

/// Something that moves a project between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Application archive received and extracted.
    FilesReceived,
    /// Provisioning pipeline started.
    DeployStarted,
    /// Provisioning pipeline finished.
    DeploySucceeded,
    /// A step failed or the run was cancelled.
    Failed,
    Suspend,
    /// Restore from suspension, or restart in place.
    Resume,
    /// Teardown requested.
    Close,
}

/// A transition that the state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {} a project that is {}", .event.verb(), .from.label().to_lowercase())]
pub struct TransitionError {
    pub from: ProjectStatus,
    pub event: LifecycleEvent,
}

impl ProjectStatus {
    /// Next state after `event`, or an error if the edge does not exist.
    ///
    /// A project found in `Deploying` may start deploying again: the caller
    /// holds the per-domain lock, so no other run can own that state.
    pub const fn apply(self, event: LifecycleEvent) -> Result<Self, TransitionError> {
        use LifecycleEvent as E;
        use ProjectStatus as S;

        let next = match (self, event) {
            (S::Initialized | S::FilesUploaded | S::Error, E::FilesReceived) => S::FilesUploaded,
            (S::FilesUploaded | S::Error | S::Deploying, E::DeployStarted) => S::Deploying,
            (S::Deploying, E::DeploySucceeded) => S::Running,
            (S::Running | S::Suspended, E::Suspend) => S::Suspended,
            (S::Running | S::Suspended, E::Resume) => S::Running,
            (_, E::Close) => S::Closed,
            (S::Closed, E::Failed) => {
                return Err(TransitionError {
                    from: self,
                    event,
                });
            }
            (_, E::Failed) => S::Error,
            _ => {
                return Err(TransitionError {
                    from: self,
                    event,
                });
            }
        };
        Ok(next)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::FilesUploaded => "files_uploaded",
            Self::Deploying => "deploying",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Error => "error",
            Self::Closed => "closed",
        }
    }

    /// Operator-facing label.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Initialized => "Initialized",
            Self::FilesUploaded => "Files uploaded",
            Self::Deploying => "Deploying",
            Self::Running => "Running",
            Self::Suspended => "Suspended",
            Self::Error => "Error",
            Self::Closed => "Closed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialized" => Ok(Self::Initialized),
            "files_uploaded" => Ok(Self::FilesUploaded),
            "deploying" => Ok(Self::Deploying),
            "running" => Ok(Self::Running),
            "suspended" => Ok(Self::Suspended),
            "error" => Ok(Self::Error),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown project status: {other}")),
        }
    }
}

impl LifecycleEvent {
    pub const fn verb(self) -> &'static str {
        match self {
            Self::FilesReceived => "upload files to",
            Self::DeployStarted => "deploy",
            Self::DeploySucceeded => "finish deploying",
            Self::Failed => "fail",
            Self::Suspend => "suspend",
            Self::Resume => "restart",
            Self::Close => "delete",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use LifecycleEvent as E;
    use ProjectStatus as S;

    const ALL: [ProjectStatus; 7] = [
        S::Initialized,
        S::FilesUploaded,
        S::Deploying,
        S::Running,
        S::Suspended,
        S::Error,
        S::Closed,
    ];

    #[test]
    fn happy_path() {
        let s = S::Initialized.apply(E::FilesReceived).unwrap();
        let s = s.apply(E::DeployStarted).unwrap();
        let s = s.apply(E::DeploySucceeded).unwrap();
        assert_eq!(s, S::Running);
        let s = s.apply(E::Suspend).unwrap();
        assert_eq!(s, S::Suspended);
        assert_eq!(s.apply(E::Resume).unwrap(), S::Running);
    }

    #[test]
    fn cannot_skip_deployment() {
        assert!(S::Initialized.apply(E::DeployStarted).is_err());
        assert!(S::Initialized.apply(E::DeploySucceeded).is_err());
        assert!(S::FilesUploaded.apply(E::DeploySucceeded).is_err());
    }

    #[test]
    fn suspend_initialized_is_rejected_with_readable_message() {
        let err = S::Initialized.apply(E::Suspend).unwrap_err();
        assert_eq!(err.from, S::Initialized);
        assert_eq!(err.to_string(), "cannot suspend a project that is initialized");
    }

    #[test]
    fn error_only_recovers_through_redeploy_or_delete() {
        assert_eq!(S::Error.apply(E::DeployStarted).unwrap(), S::Deploying);
        assert_eq!(S::Error.apply(E::FilesReceived).unwrap(), S::FilesUploaded);
        assert_eq!(S::Error.apply(E::Close).unwrap(), S::Closed);
        assert!(S::Error.apply(E::Suspend).is_err());
        assert!(S::Error.apply(E::Resume).is_err());
    }

    #[test]
    fn every_state_can_close_and_fail_except_closed() {
        for s in ALL {
            assert_eq!(s.apply(E::Close).unwrap(), S::Closed);
            if s == S::Closed {
                assert!(s.apply(E::Failed).is_err());
            } else {
                assert_eq!(s.apply(E::Failed).unwrap(), S::Error);
            }
        }
    }

    #[test]
    fn closed_only_accepts_close() {
        for event in [
            E::FilesReceived,
            E::DeployStarted,
            E::DeploySucceeded,
            E::Suspend,
            E::Resume,
        ] {
            assert!(S::Closed.apply(event).is_err(), "{event:?}");
        }
        assert!(S::Closed.is_terminal());
    }

    #[test]
    fn interrupted_deploy_can_restart() {
        assert_eq!(S::Deploying.apply(E::DeployStarted).unwrap(), S::Deploying);
    }

    #[test]
    fn storage_codes_round_trip_and_labels_differ() {
        for s in ALL {
            assert_eq!(s.as_str().parse::<ProjectStatus>().unwrap(), s);
        }
        assert_eq!(S::FilesUploaded.as_str(), "files_uploaded");
        assert_eq!(S::FilesUploaded.label(), "Files uploaded");
        assert!("Running".parse::<ProjectStatus>().is_err());
    }
}
