use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use validator::Validate;

use crate::controller::decision::DecisionTuning;
use crate::hardware::HardwareMode;
use crate::simulation::ThermalParameters;

/// Environment variables read as secrets, usually from `.env`.
const SECRET_KEYS: [&str; 5] = [
    "AMBIENT_WEATHER_API_KEY",
    "AMBIENT_WEATHER_APP_KEY",
    "SHELLY_CLOUD_SERVER",
    "SHELLY_CLOUD_AUTH_KEY",
    "MOTION_GATEWAY_KEY",
];

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub controller: ControllerConfig,
    #[validate(nested)]
    pub model: ModelConfig,
    pub decision: DecisionTuning,
    /// Hours without success before a device alerts; 0 alerts on the first failure.
    #[serde(default)]
    pub alerts: HashMap<String, f64>,
    pub devices: DevicesConfig,
    pub location: LocationConfig,
    #[serde(skip)]
    pub secrets: Secrets,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ControllerConfig {
    #[validate(range(min = 1))]
    pub poll_interval_seconds: u64,
    pub retry_delay_seconds: u64,
    #[validate(range(min = 1))]
    pub attempt_timeout_seconds: u64,
    pub http_connect_timeout_seconds: u64,
    pub http_read_timeout_seconds: u64,
    pub hardware_mode: HardwareMode,
    /// Without an HVAC unit the mode is never carried between cycles and the
    /// model runs with HVAC off.
    #[serde(default)]
    pub hvac_installed: bool,
    /// SQLite database file. Without it, or without the `db` feature, history is
    /// kept in memory only.
    pub db_path: Option<String>,
}

impl ControllerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_seconds)
    }

    pub fn http_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.http_connect_timeout_seconds)
    }

    pub fn http_read_timeout(&self) -> Duration {
        Duration::from_secs(self.http_read_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ModelConfig {
    #[validate(range(min = 1, max = 3600))]
    pub step_seconds: u32,
    #[validate(range(min = 1, max = 48))]
    pub horizon_hours: u32,
    #[validate(nested)]
    #[serde(default)]
    pub params: ThermalParameters,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DevicesConfig {
    pub shelly_ht_device_id: String,
    pub shelly_ht_topic_prefix: String,
    pub push_stale_seconds: i64,
    /// `host:port` for the line-oriented push bridge, disabled when absent.
    pub push_bridge_addr: Option<String>,
    pub shelly_relay_host: String,
    pub shelly_3em_host: String,
    pub kasa_circ_fans_host: String,
    pub ambient_weather_base_url: String,
    pub open_meteo_base_url: String,
    #[serde(default)]
    pub forecast_hours: Option<usize>,
    /// Motion Blinds gateway; shades are unavailable without it.
    #[serde(default)]
    pub shades_gateway_host: Option<String>,
    #[serde(default)]
    pub shades_east_macs: Vec<String>,
    #[serde(default)]
    pub shades_west_macs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationConfig {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Secrets {
    pub ambient_weather_api_key: Option<String>,
    pub ambient_weather_app_key: Option<String>,
    pub shelly_cloud_server: Option<String>,
    pub shelly_cloud_auth_key: Option<String>,
    pub motion_gateway_key: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file("config/default.toml"))
                .merge(Env::prefixed("GREENHOUSE__").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let mut config: Config = figment.extract().context("invalid configuration")?;
        config.validate().context("configuration out of range")?;
        config.secrets = Figment::from(Env::raw().only(&SECRET_KEYS))
            .extract()
            .context("invalid secrets")?;
        Ok(config)
    }

    pub fn alert_threshold(&self, device: &str) -> Option<f64> {
        self.alerts.get(device).copied()
    }
}
