//! `cropwatch-core` - shared identifiers and the domain error model.
//!
//! Pure types only; nothing here touches a runtime, a database or the network.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{OwnerId, PoolId};
