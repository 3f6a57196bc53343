use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{sqlite::SqliteRow, FromRow, Row};

use super::location_sample::{decode_metrics, Metrics};
use crate::util::from_nanos;

/// A tracked unit as last reported by the vendor API.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub device_type: Option<String>,
    pub firmware: Option<String>,
    pub metrics: Metrics,
    pub last_seen: Option<DateTime<Utc>>,
}

impl FromRow<'_, SqliteRow> for Device {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let metrics = row.try_get::<Option<String>, _>("metrics")?;
        let last_seen = row.try_get::<Option<i64>, _>("last_seen")?;

        Ok(Device {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            device_type: row.try_get("device_type")?,
            firmware: row.try_get("firmware")?,
            metrics: decode_metrics(metrics.as_deref()),
            last_seen: last_seen.map(from_nanos),
        })
    }
}
