//! Infrastructure layer: per-owner job scheduling, record store adapters,
//! execution history, external service clients and startup recovery.

pub mod history;
pub mod imagery;
pub mod jobs;
pub mod notify;
pub mod record_store;
pub mod recovery;

mod integration_tests;
