//! `SQLite` registry for hostpanel.
//!
//! Persists domains, database users, databases, and projects. Every write is
//! a single-row statement; uniqueness and referential integrity are enforced
//! by the schema and surface as distinct `DatabaseError` kinds.

mod db;
mod models;
mod queries_databases;
mod queries_domains;
mod queries_projects;

#[cfg(test)]
mod tests;

pub use db::{Database, DatabaseError};
pub use models::*;
pub use queries_projects::NewProject;
