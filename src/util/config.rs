use anyhow::Result;
use std::sync::OnceLock;

use config::{Config, FileFormat};

pub fn get_config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();

    CONFIG.get_or_init(|| match build_config() {
        Ok(config) => config,
        Err(err) => panic!("Configuration error: {}", err),
    })
}

fn build_config() -> Result<Config> {
    Ok(Config::builder()
        .set_default("http_addr", "127.0.0.1:3000")?
        .set_default("database_url", "sqlite://fleetmap.db?mode=rwc")?
        .set_default("vendor_base_url", "https://remotemanager.digi.com")?
        .set_default("vendor_timeout_secs", 20)?
        .set_default("vendor_stream", "location")?
        .set_default("vendor_page_size", 1000)?
        .set_default("vendor_only_connected", false)?
        .set_default("poll_interval_secs", 3)?
        .set_default("poll_concurrency", 4)?
        .set_default("listener_buffer", 1000)?
        .set_default("cors_origins", "")?
        .set_default("playback_backfill", true)?
        .add_source(config::Environment::with_prefix("FLEETMAP"))
        .add_source(config::File::new("fleetmap.toml", FileFormat::Toml).required(false))
        .build()?)
}

/// Splits a comma separated setting, dropping empty entries.
pub fn get_list(key: &str) -> Vec<String> {
    get_config()
        .get_string(key)
        .map(|value| split_list(&value))
        .unwrap_or_default()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(String::from)
        .collect()
}
