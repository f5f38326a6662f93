//! Farm record store boundary.
//!
//! The scheduling subsystem needs very little from the business record store:
//! the list of live farms (for recovery), a farm's boundary and a place to put
//! fetched imagery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cropwatch_core::OwnerId;

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use in_memory::InMemoryFarmStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresFarmStore;

/// A `[longitude, latitude]` pair.
pub type Coordinate = [f64; 2];

/// The subset of a farm record the imagery job reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FarmRecord {
    pub id: OwnerId,
    /// Outer ring of the farm polygon, if one was drawn.
    pub boundary: Option<Vec<Coordinate>>,
}

/// A stored satellite photo reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FarmPhoto {
    pub farm_id: OwnerId,
    pub photo_url: String,
    pub taken_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("farm {0} not found")]
    NotFound(OwnerId),
    #[error("record store error in {operation}: {message}")]
    Backend { operation: &'static str, message: String },
}

impl StoreError {
    pub fn backend(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            operation,
            message: message.into(),
        }
    }
}

/// Persistent store of farms and their photos.
#[async_trait]
pub trait FarmStore: Send + Sync + 'static {
    /// Ids of all farms that are not deleted.
    async fn list_farm_ids(&self) -> Result<Vec<OwnerId>, StoreError>;

    /// `None` when the farm does not exist or was deleted.
    async fn get_farm(&self, farm_id: OwnerId) -> Result<Option<FarmRecord>, StoreError>;

    /// Store photos, ignoring ones already recorded for the same farm and URL.
    ///
    /// Returns how many were newly stored.
    async fn record_photos(&self, photos: &[FarmPhoto]) -> Result<usize, StoreError>;
}
