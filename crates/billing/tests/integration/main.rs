//! Integration tests for the reconciliation engine
//!
//! The engine runs against the in-memory repository and identity adapter with
//! an in-process provider mock; no database or network is needed.
//!
//! ## Running Tests
//! ```bash
//! cargo test -p quotaflow-billing --test integration
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

mod support;

mod checkout_verification;
mod concurrency;
mod webhook_sync;
