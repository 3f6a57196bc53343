use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{sqlite::SqliteRow, FromRow, Row};
use std::collections::BTreeMap;
use tracing::warn;

use crate::util::from_nanos;

/// Metric name to value, e.g. `speed` or `altitude`.
pub type Metrics = BTreeMap<String, f64>;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Metrics::is_empty")]
    pub metrics: Metrics,
}

impl LocationSample {
    /// Whether `other` reports a different fix than this sample.
    pub fn differs_from(&self, other: &LocationSample) -> bool {
        self.timestamp != other.timestamp
            || self.latitude != other.latitude
            || self.longitude != other.longitude
    }
}

impl FromRow<'_, SqliteRow> for LocationSample {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let metrics = row.try_get::<Option<String>, _>("metrics")?;

        Ok(LocationSample {
            device_id: row.try_get("device_id")?,
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            timestamp: from_nanos(row.try_get("recorded_at")?),
            accuracy: row.try_get("accuracy")?,
            source: row.try_get("source")?,
            metrics: decode_metrics(metrics.as_deref()),
        })
    }
}

#[derive(Clone, Copy, Debug, FromRow)]
pub struct ReturningId {
    pub id: i64,
}

pub(crate) fn encode_metrics(metrics: &Metrics) -> Option<String> {
    if metrics.is_empty() {
        None
    } else {
        serde_json::to_string(metrics).ok()
    }
}

pub(crate) fn decode_metrics(raw: Option<&str>) -> Metrics {
    match raw {
        None => Metrics::new(),
        Some(raw) => serde_json::from_str(raw).unwrap_or_else(|err| {
            warn!("Ignoring unreadable metrics column: {}", err);
            Metrics::new()
        }),
    }
}
