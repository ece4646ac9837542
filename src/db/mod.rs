//! Database module.
//!
//! Provides SQLite storage with embedded migrations.

mod models;
mod store;
mod value;

pub use models::*;
pub use store::*;
pub use value::*;

#[cfg(test)]
pub(crate) use store::tests as test_support;
