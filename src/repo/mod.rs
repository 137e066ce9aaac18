//! Persistence of cycle history and dashboard inputs.
//!
//! The controller only appends history and queries three things back: the last
//! committed actuator state, the active overrides and the setpoints. Overrides and
//! setpoints are written by the dashboard; the write methods exist so tests and
//! tooling can seed them.

pub mod memory;
#[cfg(feature = "db")]
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::domain::{
    ActuatorState, CorrectedForecast, EnergyDelta, Forecast, GreenhouseState, Override,
    PowerReading, Setpoints,
};
use crate::simulation::Trajectory;

pub use memory::MemoryStore;
#[cfg(feature = "db")]
pub use sqlite::SqliteStore;

/// Predicted versus measured indoor temperature, one poll interval apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelAccuracy {
    pub timestamp: DateTime<Utc>,
    pub predicted_temp_f: f64,
    pub actual_temp_f: f64,
    pub error_f: f64,
    pub horizon_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub timestamp: DateTime<Utc>,
    pub device: String,
    pub consecutive_failures: u32,
    pub hours_since_success: Option<f64>,
    pub message: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    async fn record_startup(&self, at: DateTime<Utc>, version: &str) -> Result<()>;
    async fn update_heartbeat(&self, at: DateTime<Utc>) -> Result<()>;
    async fn record_sensor_state(&self, state: &GreenhouseState) -> Result<()>;
    async fn record_forecast(
        &self,
        fetched_at: DateTime<Utc>,
        raw: &Forecast,
        corrected: &CorrectedForecast,
    ) -> Result<()>;
    /// `label` names the actuator hypothesis the trajectory was simulated under.
    async fn record_trajectory(
        &self,
        created_at: DateTime<Utc>,
        label: &str,
        trajectory: &Trajectory,
    ) -> Result<()>;
    async fn record_power(
        &self,
        at: DateTime<Utc>,
        reading: &PowerReading,
        delta: &EnergyDelta,
    ) -> Result<()>;
    async fn record_model_accuracy(&self, record: &ModelAccuracy) -> Result<()>;
    async fn record_alert(&self, alert: &AlertRecord) -> Result<()>;

    /// Actuator state of the most recent recorded cycle.
    async fn last_actuator_state(&self) -> Result<Option<ActuatorState>>;
    async fn active_overrides(&self, now: DateTime<Utc>) -> Result<Vec<Override>>;
    async fn setpoints(&self) -> Result<Option<Setpoints>>;

    async fn insert_override(&self, entry: &Override) -> Result<()>;
    async fn set_setpoints(&self, setpoints: Setpoints, at: DateTime<Utc>) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Opens the configured store: SQLite when a database path is set and the `db`
/// feature is enabled, memory otherwise.
pub async fn open(cfg: &Config) -> Result<Arc<dyn Store>> {
    #[cfg(feature = "db")]
    {
        if let Some(path) = &cfg.controller.db_path {
            let store = SqliteStore::connect(path).await?;
            info!(path = %path, "using SQLite store");
            return Ok(Arc::new(store));
        }
    }

    #[cfg(not(feature = "db"))]
    if cfg.controller.db_path.is_some() {
        tracing::warn!("db_path set but built without the `db` feature, history is not persisted");
    }

    info!("using in-memory store");
    Ok(Arc::new(MemoryStore::new()))
}
