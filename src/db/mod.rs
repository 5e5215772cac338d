//! Database module for Wattrail.
//!
//! Provides SQLite storage with embedded migrations.

mod alerts;
mod models;
mod store;

pub use alerts::MalformedRule;
pub use models::*;
pub use store::*;

#[cfg(test)]
pub(crate) use store::tests as test_support;
