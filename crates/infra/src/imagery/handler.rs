use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tracing::info;

use super::{ImageryProvider, ImageryRequest};
use crate::jobs::{HandlerError, ImageryParams, JobHandler, JobParams};
use crate::record_store::{FarmPhoto, FarmStore};

/// Handler for `farm-imagery` jobs.
///
/// Fetches imagery for the farm's boundary over the job's date window and
/// records one photo per image. Re-running the same window stores nothing new.
pub struct ImageryFetchHandler {
    provider: Arc<dyn ImageryProvider>,
    store: Arc<dyn FarmStore>,
    today: Option<NaiveDate>,
}

impl ImageryFetchHandler {
    pub fn new(provider: Arc<dyn ImageryProvider>, store: Arc<dyn FarmStore>) -> Self {
        Self {
            provider,
            store,
            today: None,
        }
    }

    /// Pin the day `"now"` resolves to.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Utc::now().date_naive())
    }

    async fn fetch(&self, params: &ImageryParams) -> Result<(), HandlerError> {
        let farm_id = params.farm_id;
        let farm = self
            .store
            .get_farm(farm_id)
            .await
            .map_err(|e| HandlerError::failed(e.to_string()))?
            .ok_or_else(|| HandlerError::invalid_params(format!("farm {farm_id} not found")))?;
        let boundary = farm
            .boundary
            .filter(|ring| !ring.is_empty())
            .ok_or_else(|| HandlerError::invalid_params(format!("farm {farm_id} has no boundary")))?;

        let (start_date, end_date) = params.resolve(self.today());
        info!(farm_id = %farm_id, %start_date, %end_date, "fetching satellite imagery");

        let images = self
            .provider
            .fetch(&ImageryRequest {
                boundary,
                start_date,
                end_date,
            })
            .await?;

        if images.is_empty() {
            info!(farm_id = %farm_id, "no imagery available for window");
            return Ok(());
        }

        let photos: Vec<FarmPhoto> = images
            .iter()
            .map(|img| FarmPhoto {
                farm_id,
                photo_url: img.url.clone(),
                taken_at: img
                    .acquisition_date
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|dt| dt.and_utc()),
            })
            .collect();

        let stored = self
            .store
            .record_photos(&photos)
            .await
            .map_err(|e| HandlerError::failed(format!("failed to save photos: {e}")))?;

        info!(
            farm_id = %farm_id,
            images = images.len(),
            stored,
            already_present = photos.len().saturating_sub(stored),
            "satellite imagery saved"
        );
        Ok(())
    }
}

#[async_trait]
impl JobHandler for ImageryFetchHandler {
    async fn handle(&self, params: JobParams) -> Result<(), HandlerError> {
        match params {
            JobParams::FarmImagery(p) => self.fetch(&p).await,
            other => Err(HandlerError::invalid_params(format!(
                "expected farm-imagery parameters, got {}",
                other.type_name()
            ))),
        }
    }
}

impl std::fmt::Debug for ImageryFetchHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageryFetchHandler")
            .field("today", &self.today)
            .finish_non_exhaustive()
    }
}
