//! Postgres-backed farm store.
//!
//! Expects the `farms` and `farm_photos` tables of the policy schema:
//!
//! | table | columns used |
//! |-------|--------------|
//! | `farms` | `id uuid`, `boundary jsonb` (GeoJSON polygon), `deleted_at timestamptz` |
//! | `farm_photos` | `id uuid`, `farm_id uuid`, `photo_url text`, `photo_type text`, `taken_at timestamptz`, unique `(farm_id, photo_url)` |

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use cropwatch_core::OwnerId;

use super::{Coordinate, FarmPhoto, FarmRecord, FarmStore, StoreError};

const PHOTO_TYPE_SATELLITE: &str = "satellite";

#[derive(Debug, Clone)]
pub struct PostgresFarmStore {
    pool: PgPool,
}

impl PostgresFarmStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Deserialize)]
struct GeoPolygon {
    coordinates: Vec<Vec<Coordinate>>,
}

/// Outer ring of a GeoJSON polygon; malformed geometry counts as no boundary.
fn outer_ring(geojson: Option<serde_json::Value>) -> Option<Vec<Coordinate>> {
    let polygon: GeoPolygon = serde_json::from_value(geojson?).ok()?;
    polygon.coordinates.into_iter().next()
}

#[async_trait]
impl FarmStore for PostgresFarmStore {
    #[instrument(skip(self), err)]
    async fn list_farm_ids(&self) -> Result<Vec<OwnerId>, StoreError> {
        let rows = sqlx::query("SELECT id FROM farms WHERE deleted_at IS NULL ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_farm_ids", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<Uuid, _>("id")
                    .map(OwnerId::from_uuid)
                    .map_err(|e| map_sqlx_error("list_farm_ids", e))
            })
            .collect()
    }

    #[instrument(skip(self), fields(farm_id = %farm_id), err)]
    async fn get_farm(&self, farm_id: OwnerId) -> Result<Option<FarmRecord>, StoreError> {
        let row = sqlx::query("SELECT id, boundary FROM farms WHERE id = $1 AND deleted_at IS NULL")
            .bind(farm_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_farm", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let boundary: Option<serde_json::Value> = row
            .try_get("boundary")
            .map_err(|e| map_sqlx_error("get_farm", e))?;

        Ok(Some(FarmRecord {
            id: farm_id,
            boundary: outer_ring(boundary),
        }))
    }

    #[instrument(skip(self, photos), fields(count = photos.len()), err)]
    async fn record_photos(&self, photos: &[FarmPhoto]) -> Result<usize, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut inserted = 0u64;
        for photo in photos {
            let result = sqlx::query(
                r#"
                INSERT INTO farm_photos (id, farm_id, photo_url, photo_type, taken_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (farm_id, photo_url) DO NOTHING
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(photo.farm_id.as_uuid())
            .bind(&photo.photo_url)
            .bind(PHOTO_TYPE_SATELLITE)
            .bind(photo.taken_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_photo", e))?;
            inserted += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(inserted as usize)
    }
}

pub(crate) fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::backend(
            operation,
            format!(
                "database error {}: {}",
                db_err.code().as_deref().unwrap_or("unknown"),
                db_err.message()
            ),
        ),
        sqlx::Error::PoolClosed => StoreError::backend(operation, "connection pool closed"),
        other => StoreError::backend(operation, other.to_string()),
    }
}
