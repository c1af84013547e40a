//! hostpanel core library
//!
//! Shared functionality for hostpanel components:
//! - Registry pool plumbing and constraint classification
//! - Configuration resolution and hierarchy
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod tracing_init;

pub use config::PanelConfig;
pub use error::{Error, Result};
