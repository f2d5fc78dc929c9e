//! Database module: row models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: row and write models exchanged with the repositories.
//! - `repo`: SQL-only functions over the SQLite pool.
//!
//! Callers import from `gigwatch::db`; the repository API and the row models
//! are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{EventRow, EventWrite, ScrobbleRow};
