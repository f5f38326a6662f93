use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use cropwatch_core::OwnerId;

use super::{Coordinate, FarmPhoto, FarmRecord, FarmStore, StoreError};
use crate::jobs::lock;

#[derive(Debug, Default)]
struct State {
    farms: BTreeMap<OwnerId, FarmRecord>,
    deleted: HashSet<OwnerId>,
    photos: Vec<FarmPhoto>,
}

/// In-memory farm store for tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryFarmStore {
    state: Mutex<State>,
    fail_listing: AtomicBool,
    fail_writes: AtomicBool,
}

impl InMemoryFarmStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_farm(&self, farm_id: OwnerId, boundary: Option<Vec<Coordinate>>) {
        let mut state = lock(&self.state);
        state.deleted.remove(&farm_id);
        state.farms.insert(
            farm_id,
            FarmRecord {
                id: farm_id,
                boundary,
            },
        );
    }

    /// Soft delete, like `deleted_at` in the relational schema.
    pub fn delete_farm(&self, farm_id: OwnerId) {
        lock(&self.state).deleted.insert(farm_id);
    }

    pub fn photos(&self, farm_id: OwnerId) -> Vec<FarmPhoto> {
        lock(&self.state)
            .photos
            .iter()
            .filter(|p| p.farm_id == farm_id)
            .cloned()
            .collect()
    }

    /// Make `list_farm_ids` fail.
    pub fn set_fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// Make `record_photos` fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl FarmStore for InMemoryFarmStore {
    async fn list_farm_ids(&self) -> Result<Vec<OwnerId>, StoreError> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(StoreError::backend("list_farm_ids", "store unavailable"));
        }
        let state = lock(&self.state);
        Ok(state
            .farms
            .keys()
            .filter(|id| !state.deleted.contains(id))
            .copied()
            .collect())
    }

    async fn get_farm(&self, farm_id: OwnerId) -> Result<Option<FarmRecord>, StoreError> {
        let state = lock(&self.state);
        if state.deleted.contains(&farm_id) {
            return Ok(None);
        }
        Ok(state.farms.get(&farm_id).cloned())
    }

    async fn record_photos(&self, photos: &[FarmPhoto]) -> Result<usize, StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::backend("record_photos", "store unavailable"));
        }
        let mut state = lock(&self.state);
        let mut inserted = 0;
        for photo in photos {
            let exists = state
                .photos
                .iter()
                .any(|p| p.farm_id == photo.farm_id && p.photo_url == photo.photo_url);
            if !exists {
                state.photos.push(photo.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn photo(farm_id: OwnerId, url: &str) -> FarmPhoto {
        FarmPhoto {
            farm_id,
            photo_url: url.to_string(),
            taken_at: None,
        }
    }

    #[tokio::test]
    async fn deleted_farms_are_hidden() {
        let store = InMemoryFarmStore::new();
        let (a, b) = (OwnerId::new(), OwnerId::new());
        store.insert_farm(a, None);
        store.insert_farm(b, Some(vec![[30.0, -1.9], [30.1, -1.9], [30.1, -2.0]]));
        store.delete_farm(a);

        assert_eq!(store.list_farm_ids().await.unwrap(), vec![b]);
        assert!(store.get_farm(a).await.unwrap().is_none());
        assert!(store.get_farm(b).await.unwrap().unwrap().boundary.is_some());
    }

    #[tokio::test]
    async fn duplicate_photos_are_ignored() {
        let store = InMemoryFarmStore::new();
        let farm = OwnerId::new();

        let first = store
            .record_photos(&[photo(farm, "a.png"), photo(farm, "b.png")])
            .await
            .unwrap();
        let second = store
            .record_photos(&[photo(farm, "b.png"), photo(farm, "c.png")])
            .await
            .unwrap();

        assert_eq!((first, second), (2, 1));
        assert_eq!(store.photos(farm).len(), 3);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_backend_errors() {
        let store = InMemoryFarmStore::new();
        store.set_fail_listing(true);
        store.set_fail_writes(true);

        assert!(matches!(
            store.list_farm_ids().await,
            Err(StoreError::Backend { operation: "list_farm_ids", .. })
        ));
        assert!(store.record_photos(&[]).await.is_err());
    }
}
