//! Satellite imagery: the provider boundary, its HTTP client and the
//! `farm-imagery` job handler.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;

use crate::jobs::HandlerError;
use crate::record_store::Coordinate;

pub mod client;
pub mod handler;

pub use client::HttpImageryClient;
pub use handler::ImageryFetchHandler;

/// One imagery query: a polygon ring and an inclusive date window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageryRequest {
    pub boundary: Vec<Coordinate>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// A natural-color rendering of one acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatelliteImage {
    pub url: String,
    pub acquisition_date: Option<NaiveDate>,
}

#[derive(Debug, thiserror::Error)]
pub enum ImageryError {
    #[error("imagery request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("imagery service returned status {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("imagery service error: {0}")]
    Service(String),
    #[error("malformed imagery response: {0}")]
    Decode(String),
}

impl From<ImageryError> for HandlerError {
    fn from(err: ImageryError) -> Self {
        HandlerError::failed(err.to_string())
    }
}

/// Source of satellite imagery.
#[async_trait]
pub trait ImageryProvider: Send + Sync + 'static {
    async fn fetch(&self, request: &ImageryRequest) -> Result<Vec<SatelliteImage>, ImageryError>;
}
