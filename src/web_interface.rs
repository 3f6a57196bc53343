use crate::{
    broadcaster::{Broadcaster, Listener},
    dto::{Device, LocationSample},
    poller::record_fix,
    store::{Order, Store, StoreError, TimeWindow},
    template::IndexTemplate,
    util::{
        config::{get_config, get_list},
        parse_timestamp,
        static_file::StaticFile,
        version, AppError,
    },
    vendor::{VendorApi, VendorError},
};
use async_stream::stream;
use axum::{
    extract::{FromRef, Path, Query, State},
    http::{header, HeaderValue, Method, StatusCode, Uri},
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, IntoResponse,
    },
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use geojson::{Feature, GeoJson, Geometry, JsonObject, JsonValue};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{convert::Infallible, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

const DEFAULT_HISTORY_LIMIT: usize = 1000;
const MAX_HISTORY_LIMIT: usize = 10_000;

#[derive(Clone)]
pub(crate) struct WebConfig {
    pub poll_interval_secs: u64,
    pub playback_backfill: bool,
}

// Define your application shared state
#[derive(Clone, FromRef)]
pub(crate) struct AppState {
    pub store: Store,
    pub broadcaster: Arc<Broadcaster>,
    pub vendor: Option<Arc<dyn VendorApi>>,
    pub web_config: WebConfig,
}

type ApiResult<T> = Result<T, AppError>;

async fn index(web_config: State<WebConfig>) -> impl IntoResponse {
    IndexTemplate {
        version: version().to_string(),
        poll_interval_secs: web_config.poll_interval_secs,
    }
}

#[derive(Serialize)]
struct DeviceList {
    count: usize,
    devices: Vec<Device>,
}

async fn list_devices(store: State<Store>) -> ApiResult<Json<DeviceList>> {
    let devices = store.list_devices().await?;

    Ok(Json(DeviceList {
        count: devices.len(),
        devices,
    }))
}

#[derive(Serialize)]
struct DeviceDetails {
    device: Device,
    latest: Option<LocationSample>,
}

async fn find_device(store: &Store, device_id: &str) -> ApiResult<Device> {
    store
        .get_device(device_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Unknown device {}", device_id)))
}

async fn device_details(
    store: State<Store>,
    Path((device_id,)): Path<(String,)>,
) -> ApiResult<Json<DeviceDetails>> {
    let device = find_device(&store, &device_id).await?;
    let latest = store.latest_sample(&device_id).await?;

    Ok(Json(DeviceDetails { device, latest }))
}

/// Query string of the playback endpoints. `step` and `speed` are replay hints
/// for the client and are returned unchanged.
#[derive(Debug, Default, Deserialize)]
struct PlaybackQuery {
    from: Option<String>,
    to: Option<String>,
    limit: Option<usize>,
    #[serde(default)]
    order: Order,
    step: Option<f64>,
    speed: Option<f64>,
}

impl PlaybackQuery {
    fn window(&self) -> ApiResult<TimeWindow> {
        let from = parse_bound("from", self.from.as_deref())?;
        let to = parse_bound("to", self.to.as_deref())?;

        TimeWindow::new(from, to).map_err(|err| AppError::BadRequest(err.to_string()))
    }

    fn limit(&self) -> ApiResult<usize> {
        match self.limit {
            None => Ok(DEFAULT_HISTORY_LIMIT),
            Some(0) => Err(AppError::BadRequest("limit must be at least 1".into())),
            Some(limit) => Ok(limit.min(MAX_HISTORY_LIMIT)),
        }
    }

    fn hints(&self) -> ApiResult<(Option<f64>, Option<f64>)> {
        for (name, value) in [("step", self.step), ("speed", self.speed)] {
            if value.is_some_and(|value| !(value.is_finite() && value > 0.0)) {
                return Err(AppError::BadRequest(format!("{} must be a positive number", name)));
            }
        }

        Ok((self.step, self.speed))
    }
}

fn parse_bound(name: &str, value: Option<&str>) -> ApiResult<Option<DateTime<Utc>>> {
    match value.map(str::trim).filter(|value| !value.is_empty()) {
        None => Ok(None),
        Some(value) => parse_timestamp(value).map(Some).ok_or_else(|| {
            AppError::BadRequest(format!(
                "Invalid {} '{}': expected RFC 3339 or Unix seconds",
                name, value
            ))
        }),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PlaybackResponse {
    device_id: String,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    order: Order,
    step: Option<f64>,
    speed: Option<f64>,
    count: usize,
    samples: Vec<LocationSample>,
}

/// Loads the samples of a playback window, asking the vendor for its history
/// when a bounded window has nothing stored locally.
async fn load_playback(
    state: &AppState,
    device_id: &str,
    window: &TimeWindow,
    order: Order,
    limit: usize,
) -> ApiResult<Vec<LocationSample>> {
    let samples = state
        .store
        .history_page(device_id, window, order, limit)
        .await?;

    if !samples.is_empty() || window.start().is_none() || !state.web_config.playback_backfill {
        return Ok(samples);
    }

    let Some(vendor) = state.vendor.as_deref() else {
        return Ok(samples);
    };

    if backfill(vendor, &state.store, device_id, window).await? == 0 {
        return Ok(samples);
    }

    Ok(state
        .store
        .history_page(device_id, window, order, limit)
        .await?)
}

async fn backfill(
    vendor: &dyn VendorApi,
    store: &Store,
    device_id: &str,
    window: &TimeWindow,
) -> Result<usize, StoreError> {
    let snapshots = match vendor.location_history(device_id, window.start()).await {
        Ok(snapshots) => snapshots,
        Err(err) => {
            warn!(device = device_id, "History backfill failed: {}", err);
            return Ok(0);
        }
    };

    let source = vendor.source();
    let mut written = 0;
    for snapshot in snapshots
        .into_iter()
        .filter(|snapshot| snapshot.is_plausible() && window.contains(&snapshot.timestamp))
    {
        let sample = snapshot.into_sample(device_id, source.clone());
        if store.append_sample(&sample).await?.is_some() {
            written += 1;
        }
    }

    if written > 0 {
        info!(device = device_id, written, "Backfilled history from vendor");
    }

    Ok(written)
}

async fn device_history(
    State(state): State<AppState>,
    Path((device_id,)): Path<(String,)>,
    Query(query): Query<PlaybackQuery>,
) -> ApiResult<Json<PlaybackResponse>> {
    let window = query.window()?;
    let limit = query.limit()?;
    let (step, speed) = query.hints()?;

    find_device(&state.store, &device_id).await?;
    let samples = load_playback(&state, &device_id, &window, query.order, limit).await?;

    Ok(Json(PlaybackResponse {
        device_id,
        from: window.start(),
        to: window.end(),
        order: query.order,
        step,
        speed,
        count: samples.len(),
        samples,
    }))
}

impl FromIterator<LocationSample> for Feature {
    fn from_iter<T: IntoIterator<Item = LocationSample>>(iter: T) -> Self {
        let samples = iter.into_iter().collect_vec();

        let line_string = samples
            .iter()
            .map(|sample| vec![sample.longitude, sample.latitude])
            .collect_vec();
        let geometry: Geometry = geojson::Value::LineString(line_string).into();

        let mut properties = JsonObject::new();
        properties.insert(
            "timestamps".to_string(),
            JsonValue::from(
                samples
                    .iter()
                    .map(|sample| sample.timestamp.to_rfc3339())
                    .collect_vec(),
            ),
        );
        if let Some(first) = samples.first() {
            properties.insert("deviceId".to_string(), JsonValue::from(first.device_id.clone()));
        }

        Feature {
            geometry: Some(geometry),
            properties: Some(properties),
            ..Default::default()
        }
    }
}

async fn device_track_geojson(
    State(state): State<AppState>,
    Path((device_id,)): Path<(String,)>,
    Query(query): Query<PlaybackQuery>,
) -> ApiResult<impl IntoResponse> {
    let window = query.window()?;
    let limit = query.limit()?;

    find_device(&state.store, &device_id).await?;
    let mut samples = load_playback(&state, &device_id, &window, query.order, limit).await?;
    // A track always runs forward in time.
    if query.order == Order::Descending {
        samples.reverse();
    }

    let res = GeoJson::Feature(samples.into_iter().collect()).to_string();

    Ok(([(header::CONTENT_TYPE, "application/geo+json")], res))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LiveLocation {
    stored: bool,
    #[serde(flatten)]
    sample: LocationSample,
}

/// Asks the vendor for the current position of a device and records it like a
/// poll cycle would. Devices the store has not seen yet are added.
async fn device_live(
    State(state): State<AppState>,
    Path((device_id,)): Path<(String,)>,
) -> ApiResult<Json<LiveLocation>> {
    let vendor = state
        .vendor
        .as_deref()
        .ok_or_else(|| VendorError::Unavailable("Vendor API is not configured".into()))?;

    let snapshot = vendor
        .current_location(&device_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No location reported for {}", device_id)))?;
    if !snapshot.is_plausible() {
        return Err(VendorError::Unavailable(format!(
            "Implausible position {},{} for {}",
            snapshot.latitude, snapshot.longitude, device_id
        ))
        .into());
    }

    if state.store.get_device(&device_id).await?.is_none() {
        state
            .store
            .upsert_device(&Device {
                id: device_id.clone(),
                ..Default::default()
            })
            .await?;
    }

    let sample = snapshot.into_sample(&device_id, vendor.source());
    let stored = record_fix(&state.store, &state.broadcaster, &sample).await?;

    Ok(Json(LiveLocation { stored, sample }))
}

#[derive(Debug, Default, Deserialize)]
struct StreamQuery {
    device_id: Option<String>,
}

fn location_stream(
    mut listener: Listener,
    device_id: Option<String>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream! {
        debug!(listener = listener.id(), "Stream client connected");

        while let Some(event) = listener.recv().await {
            if device_id.as_ref().is_some_and(|id| *id != event.device_id) {
                continue;
            }

            match Event::default().event("location").json_data(&event) {
                Ok(message) => yield Ok(message),
                Err(err) => error!("Cannot encode location event: {}", err),
            }
        }

        debug!(listener = listener.id(), "Listener closed by broadcaster");
    }
}

async fn sse_handler(
    broadcaster: State<Arc<Broadcaster>>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let listener = broadcaster.subscribe();

    Sse::new(location_stream(listener, query.device_id)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("alive"),
    )
}

async fn status(
    broadcaster: State<Arc<Broadcaster>>,
    web_config: State<WebConfig>,
) -> impl IntoResponse {
    Json(json!({
        "version": version(),
        "pollIntervalSecs": web_config.poll_interval_secs,
        "listeners": broadcaster.listener_count(),
    }))
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let origins = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect_vec();

    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::OPTIONS])
            .allow_headers(Any),
    )
}

pub(crate) fn router(state: AppState, cors_origins: &[String]) -> Router {
    let mut app = Router::new()
        .route("/", get(index))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/:device_id", get(device_details))
        .route("/api/devices/:device_id/history", get(device_history))
        .route("/api/devices/:device_id/track.geojson", get(device_track_geojson))
        .route("/api/devices/:device_id/live", get(device_live))
        .route("/api/stream", get(sse_handler))
        .route("/api/status", get(status))
        .route("/static/*file", get(static_handler))
        .fallback_service(get(not_found))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        // Create the application state
        .with_state(state);

    if let Some(cors) = cors_layer(cors_origins) {
        app = app.layer(cors);
    }

    app
}

pub async fn start_server(
    store: Store,
    broadcaster: Arc<Broadcaster>,
    vendor: Option<Arc<dyn VendorApi>>,
    http_addr: String,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let web_config = WebConfig {
        poll_interval_secs: get_config().get_int("poll_interval_secs")?.try_into()?,
        playback_backfill: get_config().get_bool("playback_backfill")?,
    };
    info!("Starting web server @ {}", http_addr);

    let app = router(
        AppState {
            store,
            broadcaster,
            vendor,
            web_config,
        },
        &get_list("cors_origins"),
    );

    let listener = TcpListener::bind(&http_addr).await?;
    info!("Listening on {}", &http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Web server stopped");
    Ok(())
}

async fn static_handler(uri: Uri) -> impl IntoResponse {
    let path = uri.path().trim_start_matches('/');

    StaticFile(path.strip_prefix("static/").unwrap_or(path).to_string())
}

// Finally, we use a fallback route for anything that didn't match.
async fn not_found() -> (StatusCode, Html<&'static str>) {
    (StatusCode::NOT_FOUND, Html("<h1>404</h1><p>Not Found</p>"))
}
