use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{AlertRecord, ModelAccuracy, Store};
use crate::domain::{
    ActuatorState, CorrectedForecast, EnergyDelta, Forecast, GreenhouseState, Override,
    PowerReading, Setpoints,
};
use crate::simulation::Trajectory;

#[derive(Debug, Clone)]
pub struct StoredForecast {
    pub fetched_at: DateTime<Utc>,
    pub raw: Forecast,
    pub corrected: CorrectedForecast,
}

#[derive(Debug, Clone)]
pub struct StoredTrajectory {
    pub created_at: DateTime<Utc>,
    pub label: String,
    pub trajectory: Trajectory,
}

#[derive(Debug, Clone)]
pub struct StoredPower {
    pub at: DateTime<Utc>,
    pub reading: PowerReading,
    pub delta: EnergyDelta,
}

#[derive(Debug, Default)]
struct Tables {
    startups: Vec<(DateTime<Utc>, String)>,
    heartbeat: Option<DateTime<Utc>>,
    states: Vec<GreenhouseState>,
    forecasts: Vec<StoredForecast>,
    trajectories: Vec<StoredTrajectory>,
    power: Vec<StoredPower>,
    accuracy: Vec<ModelAccuracy>,
    alerts: Vec<AlertRecord>,
    overrides: Vec<Override>,
    setpoints: Option<Setpoints>,
}

/// Process-local store. History is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn states(&self) -> Vec<GreenhouseState> {
        self.tables.lock().states.clone()
    }

    pub fn forecasts(&self) -> Vec<StoredForecast> {
        self.tables.lock().forecasts.clone()
    }

    pub fn trajectories(&self) -> Vec<StoredTrajectory> {
        self.tables.lock().trajectories.clone()
    }

    pub fn power(&self) -> Vec<StoredPower> {
        self.tables.lock().power.clone()
    }

    pub fn accuracy(&self) -> Vec<ModelAccuracy> {
        self.tables.lock().accuracy.clone()
    }

    pub fn alerts(&self) -> Vec<AlertRecord> {
        self.tables.lock().alerts.clone()
    }

    pub fn heartbeat(&self) -> Option<DateTime<Utc>> {
        self.tables.lock().heartbeat
    }

    pub fn startups(&self) -> usize {
        self.tables.lock().startups.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn record_startup(&self, at: DateTime<Utc>, version: &str) -> Result<()> {
        self.tables.lock().startups.push((at, version.to_string()));
        Ok(())
    }

    async fn update_heartbeat(&self, at: DateTime<Utc>) -> Result<()> {
        self.tables.lock().heartbeat = Some(at);
        Ok(())
    }

    async fn record_sensor_state(&self, state: &GreenhouseState) -> Result<()> {
        self.tables.lock().states.push(state.clone());
        Ok(())
    }

    async fn record_forecast(
        &self,
        fetched_at: DateTime<Utc>,
        raw: &Forecast,
        corrected: &CorrectedForecast,
    ) -> Result<()> {
        self.tables.lock().forecasts.push(StoredForecast {
            fetched_at,
            raw: raw.clone(),
            corrected: corrected.clone(),
        });
        Ok(())
    }

    async fn record_trajectory(
        &self,
        created_at: DateTime<Utc>,
        label: &str,
        trajectory: &Trajectory,
    ) -> Result<()> {
        self.tables.lock().trajectories.push(StoredTrajectory {
            created_at,
            label: label.to_string(),
            trajectory: trajectory.clone(),
        });
        Ok(())
    }

    async fn record_power(
        &self,
        at: DateTime<Utc>,
        reading: &PowerReading,
        delta: &EnergyDelta,
    ) -> Result<()> {
        self.tables.lock().power.push(StoredPower {
            at,
            reading: *reading,
            delta: *delta,
        });
        Ok(())
    }

    async fn record_model_accuracy(&self, record: &ModelAccuracy) -> Result<()> {
        self.tables.lock().accuracy.push(record.clone());
        Ok(())
    }

    async fn record_alert(&self, alert: &AlertRecord) -> Result<()> {
        self.tables.lock().alerts.push(alert.clone());
        Ok(())
    }

    async fn last_actuator_state(&self) -> Result<Option<ActuatorState>> {
        Ok(self.tables.lock().states.last().map(GreenhouseState::actuators))
    }

    async fn active_overrides(&self, now: DateTime<Utc>) -> Result<Vec<Override>> {
        Ok(self
            .tables
            .lock()
            .overrides
            .iter()
            .filter(|o| o.is_active(now))
            .cloned()
            .collect())
    }

    async fn setpoints(&self) -> Result<Option<Setpoints>> {
        Ok(self.tables.lock().setpoints)
    }

    async fn insert_override(&self, entry: &Override) -> Result<()> {
        self.tables.lock().overrides.push(entry.clone());
        Ok(())
    }

    async fn set_setpoints(&self, setpoints: Setpoints, _at: DateTime<Utc>) -> Result<()> {
        self.tables.lock().setpoints = Some(setpoints);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
