use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{ImageryError, ImageryProvider, ImageryRequest, SatelliteImage};

const IMAGERY_PATH: &str = "/satellite/public/boundary/imagery";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// HTTP client for the satellite data service.
#[derive(Debug, Clone)]
pub struct HttpImageryClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpImageryClient {
    /// `timeout` bounds each request so a stuck call fails before the handler timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ImageryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, IMAGERY_PATH)
    }
}

#[async_trait]
impl ImageryProvider for HttpImageryClient {
    async fn fetch(&self, request: &ImageryRequest) -> Result<Vec<SatelliteImage>, ImageryError> {
        let coordinates = serde_json::to_string(&request.boundary)
            .map_err(|e| ImageryError::Decode(format!("boundary: {e}")))?;
        let start = request.start_date.format(DATE_FORMAT).to_string();
        let end = request.end_date.format(DATE_FORMAT).to_string();

        debug!(url = %self.endpoint(), start_date = %start, end_date = %end, "requesting imagery");
        let response = self
            .client
            .get(self.endpoint())
            .query(&[
                ("coordinates", coordinates.as_str()),
                ("start_date", start.as_str()),
                ("end_date", end.as_str()),
                ("max_cloud_cover", "100.0"),
            ])
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.bytes().await?;
        parse_response(status, &body)
    }
}

#[derive(Debug, Deserialize)]
struct ImageryResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    data: ResponseData,
    error: Option<ServiceError>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseData {
    #[serde(default)]
    images: Vec<ResponseImage>,
}

#[derive(Debug, Deserialize)]
struct ResponseImage {
    #[serde(default)]
    acquisition_date: String,
    #[serde(default)]
    visualization: Visualization,
}

#[derive(Debug, Default, Deserialize)]
struct Visualization {
    #[serde(default)]
    natural_color: NaturalColor,
}

#[derive(Debug, Default, Deserialize)]
struct NaturalColor {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {}", self.code, self.message)
    }
}

/// Interpret a service reply. Images without a URL are dropped.
fn parse_response(status: u16, body: &[u8]) -> Result<Vec<SatelliteImage>, ImageryError> {
    let parsed = serde_json::from_slice::<ImageryResponse>(body);

    if status != 200 {
        let detail = match parsed {
            Ok(ImageryResponse {
                error: Some(err), ..
            }) => err.to_string(),
            _ => String::from_utf8_lossy(body).chars().take(200).collect(),
        };
        return Err(ImageryError::Status { status, detail });
    }

    let response = parsed.map_err(|e| ImageryError::Decode(e.to_string()))?;
    if response.status != "success" {
        return Err(ImageryError::Service(match response.error {
            Some(err) => err.to_string(),
            None => format!("status={}", response.status),
        }));
    }

    Ok(response
        .data
        .images
        .into_iter()
        .filter_map(|img| {
            let url = img.visualization.natural_color.url;
            if url.is_empty() {
                return None;
            }
            let acquisition_date = if img.acquisition_date.is_empty() {
                None
            } else {
                NaiveDate::parse_from_str(&img.acquisition_date, DATE_FORMAT)
                    .inspect_err(|e| warn!(date = %img.acquisition_date, error = %e, "unparseable acquisition date"))
                    .ok()
            };
            Some(SatelliteImage {
                url,
                acquisition_date,
            })
        })
        .collect())
}
