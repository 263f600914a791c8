//! Database module: view models and SQL repositories.
//!
//! - `model`: rows written or returned by repositories that are not domain types.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! The repository API is re-exported at `crate::db::*`.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::RunCompletion;
