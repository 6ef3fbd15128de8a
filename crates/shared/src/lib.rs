#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Quotaflow Shared Types and Utilities
//!
//! Types and helpers shared by the billing library and the worker binary.

pub mod db;
pub mod rollback;
pub mod types;

pub use db::*;
pub use rollback::RollbackStack;
pub use types::*;
