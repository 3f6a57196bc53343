use chrono::{DateTime, TimeZone, Utc};
use tracing::Level;
use tracing_subscriber::{
    fmt::writer::MakeWriterExt, layer::SubscriberExt, util::SubscriberInitExt,
};

pub mod api_error;
pub mod config;
pub mod static_file;
pub mod template;

pub use api_error::AppError;

pub type DB = sqlx::Sqlite;

pub fn setup_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::Layer::new()
                .with_writer(std::io::stdout.with_max_level(Level::INFO))
                .compact(),
        )
        .init();
}

/// Git description of the build, falling back to the crate version.
pub fn version() -> &'static str {
    option_env!("VERGEN_GIT_DESCRIBE").unwrap_or(env!("CARGO_PKG_VERSION"))
}

/// Timestamps are persisted as nanoseconds since the Unix epoch. Instants
/// outside that range saturate towards their own side of the epoch.
pub fn to_nanos(timestamp: &DateTime<Utc>) -> i64 {
    timestamp.timestamp_nanos_opt().unwrap_or(if timestamp.timestamp() < 0 {
        i64::MIN
    } else {
        i64::MAX
    })
}

/// Whether `timestamp` can be stored without saturating.
pub fn fits_nanos(timestamp: &DateTime<Utc>) -> bool {
    timestamp.timestamp_nanos_opt().is_some()
}

pub fn from_nanos(nanos: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}

pub fn now_nanos() -> i64 {
    to_nanos(&Utc::now())
}

/// Parses either an RFC 3339 timestamp or integer Unix seconds.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }

    value
        .parse::<i64>()
        .ok()
        .and_then(|seconds| Utc.timestamp_opt(seconds, 0).single())
}
