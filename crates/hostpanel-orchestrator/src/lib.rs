//! hostpanel orchestrator library
//!
//! Drives hosted sites from registry record to running host state:
//! - `SQLite` registry of domains, database users, databases, projects
//! - Framework-aware provisioning plans and their executor
//! - Project lifecycle state machine with per-domain serialisation
//! - Capability providers over apt, systemd, nginx, php-fpm, certbot,
//!   and the MySQL/PostgreSQL engines

pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod locks;
pub mod naming;
pub mod orchestrator;
pub mod planner;
pub mod providers;
pub mod runtime;
pub mod storage;
pub mod templates;

pub use error::{ErrorKind, OrchestratorError};
pub use lifecycle::{LifecycleEvent, ProjectStatus};
pub use orchestrator::{Orchestrator, TeardownReport};
pub use providers::Providers;
pub use storage::{Database, Engine, Framework};
