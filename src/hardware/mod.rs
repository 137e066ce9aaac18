//! Device adapters.
//!
//! Each physical device sits behind a small async trait so the controller can be
//! run against real hardware on the LAN or against simulated devices. Adapters
//! return `anyhow::Result`; retries, fallbacks and health tracking are handled by
//! the caller through [`crate::resilience::RetryExecutor`].

pub mod ambient;
pub mod factory;
pub mod kasa;
pub mod motion;
pub mod push_cache;
pub mod shelly;
pub mod simulated;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::domain::{IndoorReading, PowerReading, ShadePosition, StationReading, SwitchReading};
use crate::forecast::ForecastSource;

pub use factory::{DeviceFactory, HardwareMode};
pub use push_cache::PushCache;

/// Names under which devices are tracked for health and alert thresholds.
pub mod names {
    pub const INDOOR: &str = "shelly_ht";
    pub const STATION: &str = "ambient_weather";
    pub const FORECAST: &str = "open_meteo";
    pub const EXHAUST_FAN: &str = "shelly_relay";
    pub const CIRC_FANS: &str = "kasa_circ_fans";
    pub const SHADES: &str = "shades";
    pub const POWER_METER: &str = "shelly_3em";
}

/// Device-level errors
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("{device} returned HTTP {status}")]
    Http { device: &'static str, status: u16 },
    #[error("{device} reported failure: {reason}")]
    Rejected { device: &'static str, reason: String },
    #[error("{device} response missing {field}")]
    MissingField {
        device: &'static str,
        field: &'static str,
    },
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

/// One of the two independently driven roof shade groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ShadeGroup {
    East,
    West,
}

/// Indoor temperature/humidity sensor
#[async_trait]
pub trait IndoorSensor: Send + Sync {
    async fn read(&self) -> Result<IndoorReading>;
}

/// Local outdoor weather station
#[async_trait]
pub trait WeatherStation: Send + Sync {
    async fn read(&self) -> Result<StationReading>;
}

/// Relay or smart plug
#[async_trait]
pub trait Switch: Send + Sync {
    async fn read(&self) -> Result<SwitchReading>;
    async fn turn_on(&self) -> Result<()>;
    async fn turn_off(&self) -> Result<()>;

    async fn set(&self, on: bool) -> Result<()> {
        if on {
            self.turn_on().await
        } else {
            self.turn_off().await
        }
    }
}

/// Roof shades, driven per group
#[async_trait]
pub trait ShadeGroups: Send + Sync {
    async fn open(&self, group: ShadeGroup) -> Result<()>;
    async fn close(&self, group: ShadeGroup) -> Result<()>;
    /// Current position of each group, `None` when it cannot be determined.
    async fn read(&self) -> Result<(Option<ShadePosition>, Option<ShadePosition>)>;

    async fn set(&self, group: ShadeGroup, position: ShadePosition) -> Result<()> {
        match position {
            ShadePosition::Open => self.open(group).await,
            ShadePosition::Closed => self.close(group).await,
        }
    }
}

/// Two-phase energy meter
#[async_trait]
pub trait PowerMeter: Send + Sync {
    async fn read(&self) -> Result<PowerReading>;
}

/// HTTP client shared by the LAN and cloud adapters.
pub fn http_client(connect_timeout: Duration, timeout: Duration) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(timeout)
        .user_agent(concat!("greenhouse-controller/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

/// Every device the controller talks to, constructed once at startup.
#[derive(Clone)]
pub struct Devices {
    pub indoor: Arc<dyn IndoorSensor>,
    pub station: Arc<dyn WeatherStation>,
    pub forecast: Arc<dyn ForecastSource>,
    pub exhaust_fan: Arc<dyn Switch>,
    pub circ_fans: Arc<dyn Switch>,
    pub shades: Arc<dyn ShadeGroups>,
    pub power_meter: Arc<dyn PowerMeter>,
}
