//! Client for the vendor device-management REST API.
//!
//! The inventory endpoint lists devices, the `streams` endpoints carry the
//! most recent and historical datapoints of a device's location stream.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::{
    dto::{Device, LocationSample, Metrics},
    util::{fits_nanos, parse_timestamp},
};

#[derive(Debug, Error)]
pub enum VendorError {
    #[error("Vendor API unavailable: {0}")]
    Unavailable(String),
    #[error("Vendor API rejected credentials: {0}")]
    AuthFailed(String),
}

impl From<reqwest::Error> for VendorError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                VendorError::AuthFailed(err.to_string())
            }
            _ => VendorError::Unavailable(err.to_string()),
        }
    }
}

pub type VendorResult<T> = Result<T, VendorError>;

/// Device metadata as listed by the vendor inventory.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceDescriptor {
    pub id: String,
    pub name: String,
    pub device_type: Option<String>,
    pub firmware: Option<String>,
}

impl From<&DeviceDescriptor> for Device {
    fn from(descriptor: &DeviceDescriptor) -> Self {
        Device {
            id: descriptor.id.clone(),
            name: Some(descriptor.name.clone()),
            device_type: descriptor.device_type.clone(),
            firmware: descriptor.firmware.clone(),
            ..Default::default()
        }
    }
}

/// One position report of a device.
#[derive(Clone, Debug, PartialEq)]
pub struct LocationSnapshot {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    pub accuracy: Option<f64>,
    pub metrics: Metrics,
}

impl LocationSnapshot {
    /// Finite coordinates on the globe and a timestamp the store can hold.
    pub fn is_plausible(&self) -> bool {
        valid_coordinates(self.latitude, self.longitude) && fits_nanos(&self.timestamp)
    }

    pub fn into_sample(self, device_id: &str, source: Option<String>) -> LocationSample {
        LocationSample {
            device_id: device_id.to_string(),
            latitude: self.latitude,
            longitude: self.longitude,
            timestamp: self.timestamp,
            accuracy: self.accuracy,
            source,
            metrics: self.metrics,
        }
    }
}

#[async_trait]
pub trait VendorApi: Send + Sync {
    async fn list_devices(&self) -> VendorResult<Vec<DeviceDescriptor>>;

    /// Most recent position of a device, `None` when it has never reported one.
    async fn current_location(&self, device_id: &str) -> VendorResult<Option<LocationSnapshot>>;

    /// Positions reported since `since` (or all retained ones), oldest first.
    async fn location_history(
        &self,
        device_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> VendorResult<Vec<LocationSnapshot>>;

    /// Label stored with samples obtained from this API.
    fn source(&self) -> Option<String> {
        None
    }
}

#[derive(Clone, Debug)]
pub struct VendorConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
    pub stream: String,
    pub page_size: u32,
    pub only_connected: bool,
}

#[derive(Clone)]
pub struct VendorClient {
    http: Client,
    base_url: Url,
    config: VendorConfig,
}

#[derive(Debug, Deserialize)]
struct Inventory<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct InventoryDevice {
    id: Option<String>,
    name: Option<String>,
    #[serde(rename = "type")]
    device_type: Option<String>,
    firmware_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Datapoint {
    timestamp: Option<String>,
    value: Option<Value>,
}

impl VendorClient {
    pub fn new(config: VendorConfig) -> VendorResult<Self> {
        let base_url = Url::parse(&config.base_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| {
                VendorError::Unavailable(format!("Invalid vendor base URL {}", config.base_url))
            })?;

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout.min(Duration::from_secs(10)))
            .default_headers(headers)
            .build()
            .map_err(|err| VendorError::Unavailable(format!("Cannot build HTTP client: {}", err)))?;

        Ok(VendorClient {
            http,
            base_url,
            config,
        })
    }

    /// Appends percent-encoded `segments` to the base URL path.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn get(&self, url: Url) -> RequestBuilder {
        self.http
            .get(url)
            .basic_auth(&self.config.username, Some(&self.config.password))
    }

    /// Sends the request; `Ok(None)` for 404, auth and other HTTP failures as errors.
    async fn send(&self, request: RequestBuilder) -> VendorResult<Option<Response>> {
        let response = request.send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        Ok(Some(response.error_for_status()?))
    }

    fn stream_url(&self, kind: &str, device_id: &str) -> Url {
        self.endpoint(&["ws", "v1", "streams", kind, device_id, &self.config.stream])
    }
}

#[async_trait]
impl VendorApi for VendorClient {
    async fn list_devices(&self) -> VendorResult<Vec<DeviceDescriptor>> {
        let mut request = self
            .get(self.endpoint(&["ws", "v1", "devices", "inventory"]))
            .query(&[("size", self.config.page_size.to_string())]);
        if self.config.only_connected {
            request = request.query(&[("query", "connection_status='connected'")]);
        }

        let Some(response) = self.send(request).await? else {
            return Err(VendorError::Unavailable("Device inventory not found".into()));
        };
        let inventory: Inventory<InventoryDevice> = response.json().await?;

        Ok(inventory
            .list
            .into_iter()
            .filter_map(|device| {
                let id = device.id.filter(|id| !id.is_empty())?;
                Some(DeviceDescriptor {
                    name: device.name.filter(|n| !n.is_empty()).unwrap_or_else(|| id.clone()),
                    id,
                    device_type: device.device_type,
                    firmware: device.firmware_version,
                })
            })
            .collect())
    }

    async fn current_location(&self, device_id: &str) -> VendorResult<Option<LocationSnapshot>> {
        let request = self.get(self.stream_url("inventory", device_id));

        let Some(response) = self.send(request).await? else {
            return Ok(None);
        };
        let datapoint: Datapoint = response.json().await?;

        Ok(parse_datapoint(&datapoint))
    }

    async fn location_history(
        &self,
        device_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> VendorResult<Vec<LocationSnapshot>> {
        let mut request = self
            .get(self.stream_url("history", device_id))
            .query(&[("size", self.config.page_size.to_string())]);
        if let Some(since) = since {
            request = request.query(&[("start_time", since.to_rfc3339())]);
        }

        let Some(response) = self.send(request).await? else {
            return Ok(Vec::new());
        };
        let history: Inventory<Datapoint> = response.json().await?;

        let mut snapshots: Vec<_> = history.list.iter().filter_map(parse_datapoint).collect();
        snapshots.sort_by_key(|snapshot| snapshot.timestamp);
        Ok(snapshots)
    }

    fn source(&self) -> Option<String> {
        Some(format!("stream:{}", self.config.stream))
    }
}

fn parse_datapoint(datapoint: &Datapoint) -> Option<LocationSnapshot> {
    let timestamp = datapoint.timestamp.as_deref().and_then(parse_timestamp);
    let position = datapoint.value.as_ref().and_then(parse_position);

    match (timestamp.filter(fits_nanos), position) {
        (Some(timestamp), Some(position)) => Some(LocationSnapshot {
            latitude: position.latitude,
            longitude: position.longitude,
            timestamp,
            accuracy: position.accuracy,
            metrics: position.metrics,
        }),
        _ => {
            debug!("Skipping datapoint without timestamp or coordinates: {:?}", datapoint);
            None
        }
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct ParsedPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
    pub metrics: Metrics,
}

fn valid_coordinates(latitude: f64, longitude: f64) -> bool {
    (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude)
}

const LATITUDE_KEYS: [&str; 2] = ["lat", "latitude"];
const LONGITUDE_KEYS: [&str; 3] = ["lon", "lng", "longitude"];

/// Reads a position from a stream value.
///
/// Accepts `{"lat": .., "lon": ..}` style objects (also `latitude`, `lng`,
/// `longitude`), the same object encoded as a JSON string, or `"lat,lon"`.
/// Remaining numeric fields of an object are returned as metrics. Positions
/// off the globe are rejected.
pub fn parse_position(value: &Value) -> Option<ParsedPosition> {
    parse_any_position(value)
        .filter(|position| valid_coordinates(position.latitude, position.longitude))
}

fn parse_any_position(value: &Value) -> Option<ParsedPosition> {
    match value {
        Value::Object(object) => {
            let latitude = LATITUDE_KEYS.iter().find_map(|key| object.get(*key).and_then(as_f64))?;
            let longitude = LONGITUDE_KEYS.iter().find_map(|key| object.get(*key).and_then(as_f64))?;

            let mut position = ParsedPosition {
                latitude,
                longitude,
                ..Default::default()
            };

            for (key, value) in object {
                let key = key.as_str();
                if LATITUDE_KEYS.contains(&key) || LONGITUDE_KEYS.contains(&key) {
                    continue;
                }
                let Some(number) = as_f64(value) else {
                    continue;
                };
                if key == "accuracy" {
                    position.accuracy = Some(number);
                } else {
                    position.metrics.insert(key.to_string(), number);
                }
            }

            Some(position)
        }
        Value::String(text) => {
            let text = text.trim();
            if text.starts_with('{') {
                if let Some(position) = serde_json::from_str::<Value>(text)
                    .ok()
                    .and_then(|inner| parse_position(&inner))
                {
                    return Some(position);
                }
            }

            let (lat, lon) = text.split_once(',')?;
            Some(ParsedPosition {
                latitude: lat.trim().parse().ok()?,
                longitude: lon.trim().parse().ok()?,
                ..Default::default()
            })
        }
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    };

    number.filter(|number: &f64| number.is_finite())
}
