#![forbid(unsafe_code)]

//! Durable job / monitor / log-retrieval ledger backed by SQLite.
//!
//! One row per scheduler job id. Rows are never deleted; every state change
//! goes through a guarded, single-job transaction.

mod ledger;

pub use ledger::*;
