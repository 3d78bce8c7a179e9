use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use urlencoding::encode;

/// Coordinate used when no geocoding credential is configured.
pub const DEFAULT_COORDINATES: Coordinates = Coordinates { lon: 0.0, lat: 0.0 };

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub lon: f64,
    pub lat: f64,
}

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("no geocoding results for `{0}`")]
    NoResults(String),
    #[error("geocoding service unavailable: {0}")]
    ServiceUnavailable(String),
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// One lookup, no retries. The first candidate wins.
    async fn geocode(&self, address: &str) -> Result<Coordinates, GeocodeError>;
}

#[derive(Debug, Clone)]
pub struct GeocoderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl GeocoderConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("GEOCODER_BASE_URL")
                .unwrap_or_else(|_| "https://api.tomtom.com".into()),
            api_key: std::env::var("TOMTOM_API_KEY")
                .ok()
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty()),
            timeout: Duration::from_secs(
                std::env::var("GEOCODE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .filter(|v| *v > 0)
                    .unwrap_or(5),
            ),
        }
    }
}

/// TomTom Search API geocoder.
pub struct TomTomGeocoder {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl TomTomGeocoder {
    pub fn new(config: GeocoderConfig) -> Self {
        Self {
            http: build_client(config.timeout),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    position: Position,
}

#[derive(Debug, Deserialize)]
struct Position {
    lat: f64,
    lon: f64,
}

#[async_trait]
impl Geocoder for TomTomGeocoder {
    async fn geocode(&self, address: &str) -> Result<Coordinates, GeocodeError> {
        let Some(key) = &self.api_key else {
            warn!(
                target = "wanderlust.geocode",
                "TOMTOM_API_KEY not set; using default coordinates"
            );
            return Ok(DEFAULT_COORDINATES);
        };
        let address = address.trim();
        if address.is_empty() {
            return Err(GeocodeError::NoResults(String::new()));
        }

        let url = format!("{}/search/2/geocode/{}.json", self.base_url, encode(address));
        let response = self
            .http
            .get(url)
            .query(&[("key", key.as_str()), ("limit", "1")])
            .send()
            .await
            .map_err(|err| GeocodeError::ServiceUnavailable(err.to_string()))?;

        if !response.status().is_success() {
            return Err(GeocodeError::ServiceUnavailable(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let payload: GeocodeResponse = response
            .json()
            .await
            .map_err(|err| GeocodeError::ServiceUnavailable(err.to_string()))?;

        let first = payload
            .results
            .into_iter()
            .next()
            .ok_or_else(|| GeocodeError::NoResults(address.to_string()))?;
        debug!(
            target = "wanderlust.geocode",
            address,
            lon = first.position.lon,
            lat = first.position.lat,
            "geocoded"
        );
        Ok(Coordinates {
            lon: first.position.lon,
            lat: first.position.lat,
        })
    }
}
