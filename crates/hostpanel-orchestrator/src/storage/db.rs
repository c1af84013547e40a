//! Registry connection and initialization.

pub use hostpanel_core::db::DatabaseError;

hostpanel_core::define_database!(Database, "Registry migrations complete");
