//! SQLite persistence for devices and their location history.
//!
//! Every write is a single statement, so rows are atomic on their own and a
//! poll cycle that is abandoned halfway leaves nothing half-written.

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use sqlx::{migrate::Migrator, sqlite::SqlitePoolOptions, Executor, SqlitePool};
use thiserror::Error;
use tracing::info;

use crate::{
    dto::{location_sample::encode_metrics, Device, LocationSample, ReturningId},
    util::{now_nanos, to_nanos, DB},
};

static MIGRATOR: Migrator = sqlx::migrate!(); // defaults to "./migrations"

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
    #[error("Store migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Inclusive time bounds for a history query; an absent bound is open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeWindow {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Start of range {from} is after its end {to}")]
pub struct InvalidWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Self, InvalidWindow> {
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                return Err(InvalidWindow { from, to });
            }
        }

        Ok(TimeWindow { from, to })
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.from
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.to
    }

    pub fn contains(&self, timestamp: &DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| *timestamp >= from)
            && self.to.map_or(true, |to| *timestamp <= to)
    }

    fn bounds_nanos(&self) -> (i64, i64) {
        (
            self.from.as_ref().map(to_nanos).unwrap_or(i64::MIN),
            self.to.as_ref().map(to_nanos).unwrap_or(i64::MAX),
        )
    }
}

/// Direction in which history is returned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum Order {
    /// Oldest first, the order used for replay.
    #[default]
    #[serde(rename = "asc")]
    Ascending,
    /// Newest first, so a limit keeps the most recent samples.
    #[serde(rename = "desc")]
    Descending,
}

/// Handle to the backing database; cheap to clone, all clones share one pool.
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    let statements = vec![
                        "PRAGMA foreign_keys=ON;",
                        "PRAGMA journal_mode = WAL;",
                        "PRAGMA synchronous = NORMAL;",
                        "PRAGMA busy_timeout = 15000;",
                    ];

                    for statement in statements {
                        conn.execute(statement).await?;
                    }

                    Ok(())
                })
            })
            .connect(database_url)
            .await?;

        info!("Connected to store at {}", database_url);
        Self::migrate(pool).await
    }

    /// A private in-memory database. The pool is pinned to one connection that
    /// never expires, since every SQLite memory connection is its own database.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    conn.execute("PRAGMA foreign_keys=ON;").await?;
                    Ok(())
                })
            })
            .connect("sqlite::memory:")
            .await?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> StoreResult<Self> {
        MIGRATOR.run(&pool).await?;
        Ok(Store { pool })
    }

    /// Inserts or refreshes a device. Metadata is always overwritten, metrics and
    /// `last_seen` only when the incoming record carries them.
    pub async fn upsert_device(&self, device: &Device) -> StoreResult<()> {
        let now = now_nanos();
        let metrics = encode_metrics(&device.metrics);
        let last_seen = device.last_seen.as_ref().map(to_nanos);

        sqlx::query(
            "INSERT INTO devices (id, name, device_type, firmware, metrics, last_seen, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                device_type = excluded.device_type,
                firmware = excluded.firmware,
                metrics = COALESCE(excluded.metrics, devices.metrics),
                last_seen = COALESCE(excluded.last_seen, devices.last_seen),
                updated_at = excluded.updated_at",
        )
        .bind(&device.id)
        .bind(&device.name)
        .bind(&device.device_type)
        .bind(&device.firmware)
        .bind(metrics)
        .bind(last_seen)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Records the metrics and time of the most recent fix of a device.
    pub async fn touch_device(&self, sample: &LocationSample) -> StoreResult<()> {
        sqlx::query(
            "UPDATE devices
            SET metrics = COALESCE(?1, metrics), last_seen = ?2, updated_at = ?3
            WHERE id = ?4",
        )
        .bind(encode_metrics(&sample.metrics))
        .bind(to_nanos(&sample.timestamp))
        .bind(now_nanos())
        .bind(&sample.device_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Appends one immutable history row and returns its id, or `None` when the
    /// device already has a row with the same time and coordinates.
    pub async fn append_sample(&self, sample: &LocationSample) -> StoreResult<Option<i64>> {
        let result = sqlx::query_as::<DB, ReturningId>(
            "INSERT INTO location_samples
                (device_id, latitude, longitude, recorded_at, accuracy, source, metrics, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            RETURNING id",
        )
        .bind(&sample.device_id)
        .bind(sample.latitude)
        .bind(sample.longitude)
        .bind(to_nanos(&sample.timestamp))
        .bind(sample.accuracy)
        .bind(&sample.source)
        .bind(encode_metrics(&sample.metrics))
        .bind(now_nanos())
        .fetch_optional(&self.pool)
        .await?;

        Ok(result.map(|row| row.id))
    }

    pub async fn latest_sample(&self, device_id: &str) -> StoreResult<Option<LocationSample>> {
        Ok(sqlx::query_as::<DB, LocationSample>(
            "SELECT * FROM location_samples
            WHERE device_id = ?
            ORDER BY recorded_at DESC, id DESC
            LIMIT 1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Samples of one device inside `window`, oldest first.
    ///
    /// Rows are pulled from the database as the stream is polled; calling this
    /// again starts a fresh query.
    pub fn history<'a>(
        &'a self,
        device_id: &'a str,
        window: &TimeWindow,
    ) -> BoxStream<'a, StoreResult<LocationSample>> {
        self.history_ordered(device_id, window, Order::Ascending)
    }

    pub fn history_ordered<'a>(
        &'a self,
        device_id: &'a str,
        window: &TimeWindow,
        order: Order,
    ) -> BoxStream<'a, StoreResult<LocationSample>> {
        let (from, to) = window.bounds_nanos();
        let sql = match order {
            Order::Ascending => {
                "SELECT * FROM location_samples
                WHERE device_id = ? AND recorded_at >= ? AND recorded_at <= ?
                ORDER BY recorded_at ASC, id ASC"
            }
            Order::Descending => {
                "SELECT * FROM location_samples
                WHERE device_id = ? AND recorded_at >= ? AND recorded_at <= ?
                ORDER BY recorded_at DESC, id DESC"
            }
        };

        sqlx::query_as::<DB, LocationSample>(sql)
            .bind(device_id)
            .bind(from)
            .bind(to)
            .fetch(&self.pool)
            .map_err(StoreError::from)
            .boxed()
    }

    /// At most `limit` samples of [`Store::history_ordered`].
    pub async fn history_page(
        &self,
        device_id: &str,
        window: &TimeWindow,
        order: Order,
        limit: usize,
    ) -> StoreResult<Vec<LocationSample>> {
        self.history_ordered(device_id, window, order)
            .take(limit)
            .try_collect()
            .await
    }

    pub async fn list_devices(&self) -> StoreResult<Vec<Device>> {
        Ok(
            sqlx::query_as::<DB, Device>("SELECT * FROM devices ORDER BY id")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn get_device(&self, device_id: &str) -> StoreResult<Option<Device>> {
        Ok(
            sqlx::query_as::<DB, Device>("SELECT * FROM devices WHERE id = ?")
                .bind(device_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    #[cfg(test)]
    pub async fn sample_count(&self) -> StoreResult<i64> {
        use sqlx::Row;

        Ok(sqlx::query("SELECT COUNT(*) AS count FROM location_samples")
            .fetch_one(&self.pool)
            .await?
            .try_get("count")?)
    }

    #[cfg(test)]
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::Metrics;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn device(id: &str) -> Device {
        Device {
            id: id.into(),
            name: Some(format!("Truck {}", id)),
            device_type: Some("TX64".into()),
            firmware: Some("24.3.1".into()),
            ..Default::default()
        }
    }

    fn sample(device_id: &str, lat: f64, lon: f64, secs: i64) -> LocationSample {
        LocationSample {
            device_id: device_id.into(),
            latitude: lat,
            longitude: lon,
            timestamp: at(secs),
            accuracy: Some(5.0),
            source: Some("stream:location".into()),
            metrics: Metrics::new(),
        }
    }

    async fn store_with(ids: &[&str]) -> Store {
        let store = Store::open_in_memory().await.unwrap();
        for id in ids {
            store.upsert_device(&device(id)).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_upsert_device_is_idempotent() {
        let store = store_with(&["A1"]).await;
        let before = store.list_devices().await.unwrap();

        store.upsert_device(&device("A1")).await.unwrap();
        let after = store.list_devices().await.unwrap();

        assert_eq!(after.len(), 1);
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_upsert_refreshes_metadata_and_keeps_metrics() {
        let store = store_with(&["A1"]).await;

        let mut metrics = Metrics::new();
        metrics.insert("speed".into(), 42.0);
        let mut fix = sample("A1", 37.0, -122.0, 100);
        fix.metrics = metrics.clone();
        store.touch_device(&fix).await.unwrap();

        let mut renamed = device("A1");
        renamed.firmware = Some("25.0.0".into());
        store.upsert_device(&renamed).await.unwrap();

        let stored = store.get_device("A1").await.unwrap().unwrap();
        assert_eq!(stored.firmware.as_deref(), Some("25.0.0"));
        assert_eq!(stored.metrics, metrics);
        assert_eq!(stored.last_seen, Some(at(100)));
    }

    #[tokio::test]
    async fn test_list_devices_ordered_by_id() {
        let store = store_with(&["C3", "A1", "B2"]).await;
        let ids: Vec<_> = store
            .list_devices()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["A1", "B2", "C3"]);
    }

    #[tokio::test]
    async fn test_sample_requires_known_device() {
        let store = store_with(&[]).await;
        let result = store.append_sample(&sample("ghost", 1.0, 2.0, 10)).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_latest_sample() {
        let store = store_with(&["A1", "B2"]).await;
        assert_eq!(store.latest_sample("A1").await.unwrap(), None);

        store.append_sample(&sample("A1", 1.0, 1.0, 100)).await.unwrap();
        store.append_sample(&sample("A1", 2.0, 2.0, 300)).await.unwrap();
        store.append_sample(&sample("A1", 3.0, 3.0, 200)).await.unwrap();
        store.append_sample(&sample("B2", 9.0, 9.0, 900)).await.unwrap();

        let latest = store.latest_sample("A1").await.unwrap().unwrap();
        assert_eq!(latest, sample("A1", 2.0, 2.0, 300));
    }

    #[tokio::test]
    async fn test_history_returns_appended_samples_in_order() {
        let store = store_with(&["A1", "B2"]).await;
        let appended = vec![
            sample("A1", 1.0, 1.0, 100),
            sample("A1", 1.5, 1.5, 100),
            sample("A1", 2.0, 2.0, 200),
            sample("A1", 3.0, 3.0, 300),
        ];
        for s in &appended {
            store.append_sample(s).await.unwrap();
        }
        store.append_sample(&sample("B2", 5.0, 5.0, 150)).await.unwrap();

        let all = store
            .history_page("A1", &TimeWindow::default(), Order::Ascending, usize::MAX)
            .await
            .unwrap();
        assert_eq!(all, appended);

        let window = TimeWindow::new(Some(at(100)), Some(at(200))).unwrap();
        let windowed = store.history_page("A1", &window, Order::Ascending, 1000).await.unwrap();
        assert_eq!(windowed, appended[..3].to_vec());

        let limited = store.history_page("A1", &window, Order::Ascending, 2).await.unwrap();
        assert_eq!(limited, appended[..2].to_vec());
    }

    #[tokio::test]
    async fn test_history_newest_first_keeps_recent_samples() {
        let store = store_with(&["A1"]).await;
        for secs in [100, 200, 300, 400] {
            store
                .append_sample(&sample("A1", 1.0, 1.0, secs))
                .await
                .unwrap();
        }

        let recent = store
            .history_page("A1", &TimeWindow::default(), Order::Descending, 2)
            .await
            .unwrap();
        let times: Vec<_> = recent.iter().map(|s| s.timestamp.timestamp()).collect();
        assert_eq!(times, vec![400, 300]);
    }

    #[tokio::test]
    async fn test_duplicate_sample_is_ignored() {
        let store = store_with(&["A1"]).await;
        let fix = sample("A1", 1.0, 1.0, 100);

        assert!(store.append_sample(&fix).await.unwrap().is_some());
        assert_eq!(store.append_sample(&fix).await.unwrap(), None);
        assert!(store
            .append_sample(&sample("A1", 1.5, 1.0, 100))
            .await
            .unwrap()
            .is_some());
        assert_eq!(store.sample_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_history_with_far_past_start() {
        let store = store_with(&["A1"]).await;
        store.append_sample(&sample("A1", 1.0, 1.0, 100)).await.unwrap();

        let window = TimeWindow::new(Some(at(-10_000_000_000)), None).unwrap();
        let samples = store
            .history_page("A1", &window, Order::Ascending, 10)
            .await
            .unwrap();
        assert_eq!(samples.len(), 1);
    }

    #[tokio::test]
    async fn test_history_is_restartable() {
        let store = store_with(&["A1"]).await;
        store.append_sample(&sample("A1", 1.0, 1.0, 100)).await.unwrap();

        let window = TimeWindow::default();
        let first: Vec<_> = store.history("A1", &window).try_collect().await.unwrap();
        store.append_sample(&sample("A1", 2.0, 2.0, 200)).await.unwrap();
        let second: Vec<_> = store.history("A1", &window).try_collect().await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn test_history_of_device_without_samples_is_empty() {
        let store = store_with(&["A1"]).await;
        let samples = store
            .history_page("A1", &TimeWindow::default(), Order::Ascending, 1000)
            .await
            .unwrap();
        assert!(samples.is_empty());
    }

    #[test]
    fn test_time_window_rejects_reversed_bounds() {
        assert_eq!(
            TimeWindow::new(Some(at(200)), Some(at(100))),
            Err(InvalidWindow {
                from: at(200),
                to: at(100)
            })
        );
        assert!(TimeWindow::new(Some(at(100)), Some(at(100))).is_ok());
        assert!(TimeWindow::new(None, Some(at(100))).is_ok());
    }

    #[test]
    fn test_time_window_contains() {
        let window = TimeWindow::new(Some(at(100)), Some(at(200))).unwrap();
        assert!(window.contains(&at(100)));
        assert!(window.contains(&at(200)));
        assert!(!window.contains(&at(99)));
        assert!(!window.contains(&at(201)));
        assert!(TimeWindow::default().contains(&at(0)));
    }

    #[tokio::test]
    async fn test_closed_store_is_unavailable() {
        let store = store_with(&["A1"]).await;
        store.close().await;
        assert!(matches!(
            store.list_devices().await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
