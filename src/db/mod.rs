//! Database module: row models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: row decoding into domain types, plus report view models.
//! - `repo`: SQL-only functions over the SQLite pool.
//!
//! The repository API is re-exported at `crate::db::*`.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::StoredChangeSet;
