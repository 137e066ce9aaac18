//! Control cycle orchestration.
//!
//! One cycle: read sensors → restore last committed actuator state → apply
//! overrides → correct forecast → simulate → decide → execute → persist. Cycles
//! never overlap; the loop sleeps for what is left of the poll interval.

pub mod decision;
pub mod execute;
pub mod overrides;

use chrono::{DateTime, Utc};
use futures::{FutureExt, TryFutureExt};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, ModelConfig};
use crate::domain::{
    ActuatorState, CorrectedForecast, Decisions, EnergyDelta, Forecast, GreenhouseState, HvacMode,
    PowerReading, Setpoints, StationReading,
};
use crate::forecast;
use crate::hardware::{names, Devices};
use crate::repo::{AlertRecord, ModelAccuracy, Store};
use crate::resilience::{HealthRegistry, RetryExecutor};
use crate::simulation::{simulate, Trajectory};

pub use decision::{DecisionEngine, DecisionTuning};
pub use execute::execute;
pub use overrides::apply_overrides;

/// Trajectories are persisted at every fifth sample.
const TRAJECTORY_DOWNSAMPLE: usize = 5;

/// Values carried from one cycle to the next.
#[derive(Debug, Default)]
struct CycleMemory {
    /// Air temperature predicted one poll interval ahead by the previous cycle.
    prediction_f: Option<f64>,
    last_power: Option<PowerReading>,
}

/// What a cycle decided and ended with.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    /// State as persisted, reflecting every command that was sent.
    pub state: GreenhouseState,
    pub decisions: Decisions,
    pub forecast: Option<CorrectedForecast>,
    pub trajectory: Option<Trajectory>,
}

pub struct GreenhouseController {
    devices: Devices,
    store: Arc<dyn Store>,
    retry: RetryExecutor,
    engine: DecisionEngine,
    model: ModelConfig,
    poll_interval: Duration,
    hvac_installed: bool,
    memory: Mutex<CycleMemory>,
}

impl GreenhouseController {
    pub fn new(
        cfg: &Config,
        devices: Devices,
        store: Arc<dyn Store>,
        registry: Arc<HealthRegistry>,
    ) -> Self {
        Self {
            devices,
            store,
            retry: RetryExecutor::new(
                registry,
                cfg.controller.retry_delay(),
                cfg.controller.attempt_timeout(),
            ),
            engine: DecisionEngine::new(cfg.decision.clone()),
            model: cfg.model.clone(),
            poll_interval: cfg.controller.poll_interval(),
            hvac_installed: cfg.controller.hvac_installed,
            memory: Mutex::new(CycleMemory::default()),
        }
    }

    pub fn registry(&self) -> &Arc<HealthRegistry> {
        self.retry.registry()
    }

    /// Runs cycles until `shutdown` is cancelled. Errors and panics inside a cycle
    /// are logged and the next cycle runs as scheduled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval_s = self.poll_interval.as_secs(), "entering control loop");
        loop {
            let started = tokio::time::Instant::now();

            let cycle = AssertUnwindSafe(self.run_cycle(Utc::now())).catch_unwind();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = cycle => {
                    if let Err(panic) = result {
                        error!(panic = panic_message(&*panic), "control cycle panicked");
                    }
                }
            }

            let remaining = self.poll_interval.saturating_sub(started.elapsed());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(remaining) => {}
            }
        }
        info!("control loop stopped");
    }

    /// One control cycle at `now`.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleOutcome {
        let mut state = GreenhouseState::new(now);
        let station = self.read_sensors(&mut state).await;

        match self.store.last_actuator_state().await {
            Ok(Some(committed)) => state.restore_actuators(committed),
            Ok(None) => info!("no committed actuator state, starting from defaults"),
            Err(e) => warn!(error = %e, "could not restore actuator state, using defaults"),
        }
        if !self.hvac_installed {
            // only a live override may set a mode; nothing holds it between cycles
            state.hvac_mode = HvacMode::Off;
        }

        self.track_accuracy(&state, now).await;

        let setpoints = match self.store.setpoints().await {
            Ok(sp) => sp.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "could not load setpoints, using defaults");
                Setpoints::default()
            }
        };
        let active = self.store.active_overrides(now).await.unwrap_or_else(|e| {
            warn!(error = %e, "could not load overrides");
            Vec::new()
        });
        let overridden = apply_overrides(&mut state, &active);

        let corrected = self.corrected_forecast(station.as_ref(), now).await;
        if let Some(corrected) = &corrected {
            fill_outdoor_from_forecast(&mut state, &corrected.forecast, now);
        }

        let mut decisions = Decisions::new();
        let mut trajectory = None;
        match (&corrected, state.indoor_temp_f) {
            (Some(corrected), Some(_)) => {
                let prediction = self.predict(&state, &corrected.forecast, now).await;
                if let Some((current, shades_open)) = prediction {
                    decisions = self.engine.decide(
                        &state,
                        &current,
                        &shades_open,
                        setpoints,
                        &overridden,
                        &corrected.forecast,
                        now,
                    );
                    info!(
                        decisions = ?decisions,
                        heat_f = setpoints.heat_f,
                        cool_f = setpoints.cool_f,
                        overridden = overridden.len(),
                        "control decisions"
                    );
                    execute(&decisions, &mut state, &self.devices, self.registry()).await;
                    trajectory = Some(current);
                }
            }
            (None, _) => warn!("no forecast available, skipping model prediction"),
            (_, None) => warn!("no indoor temperature available, skipping model prediction"),
        }

        persist("sensor state", self.store.record_sensor_state(&state).await);
        self.meter_power(now).await;
        self.raise_alerts(now).await;
        persist("heartbeat", self.store.update_heartbeat(now).await);

        info!(
            indoor_f = state.indoor_temp_f,
            outdoor_f = state.outdoor_temp_f,
            solar_wm2 = state.solar_irradiance_wm2,
            shades_east = %state.shades_east,
            shades_west = %state.shades_west,
            fan_on = state.fan_on,
            "cycle complete"
        );

        CycleOutcome {
            state,
            decisions,
            forecast: corrected,
            trajectory,
        }
    }

    /// Fills the sensor fields of `state` and returns the station reading, if any,
    /// for bias correction.
    async fn read_sensors(&self, state: &mut GreenhouseState) -> Option<StationReading> {
        let d = &self.devices;

        let (indoor, fallback) = self
            .retry
            .with_retry(|| d.indoor.read().map_ok(Some), None, names::INDOOR)
            .await;
        if let Some(indoor) = indoor {
            state.indoor_temp_f = indoor.temp_f;
            state.indoor_humidity = indoor.humidity;
        }
        if fallback {
            warn!(device = names::INDOOR, "using fallback for indoor sensor");
        }

        let (station, fallback) = self
            .retry
            .with_retry(|| d.station.read().map_ok(Some), None, names::STATION)
            .await;
        let station = station.filter(|s| !s.is_empty());
        if let Some(s) = &station {
            state.outdoor_temp_f = s.outdoor_temp_f;
            state.outdoor_humidity = s.outdoor_humidity;
            state.solar_irradiance_wm2 = s.solar_irradiance_wm2;
            state.wind_speed_mph = s.wind_speed_mph;
        }
        if fallback {
            warn!(device = names::STATION, "using fallback for weather station");
        }

        let (circ, fallback) = self
            .retry
            .with_retry(|| d.circ_fans.read().map_ok(Some), None, names::CIRC_FANS)
            .await;
        if let Some(circ) = circ {
            state.circ_fans_on = circ.on;
        }
        if fallback {
            warn!(device = names::CIRC_FANS, "using fallback for circulating fans");
        }

        station
    }

    async fn track_accuracy(&self, state: &GreenhouseState, now: DateTime<Utc>) {
        let predicted = self.memory.lock().prediction_f.take();
        let (Some(predicted), Some(actual)) = (predicted, state.indoor_temp_f) else {
            return;
        };
        let record = ModelAccuracy {
            timestamp: now,
            predicted_temp_f: predicted,
            actual_temp_f: actual,
            error_f: predicted - actual,
            horizon_minutes: (self.poll_interval.as_secs() / 60) as u32,
        };
        info!(
            predicted_f = record.predicted_temp_f,
            actual_f = record.actual_temp_f,
            error_f = record.error_f,
            "model accuracy"
        );
        persist("model accuracy", self.store.record_model_accuracy(&record).await);
    }

    async fn corrected_forecast(
        &self,
        station: Option<&StationReading>,
        now: DateTime<Utc>,
    ) -> Option<CorrectedForecast> {
        let source = &self.devices.forecast;
        let (raw, fallback) = self
            .retry
            .with_retry(|| source.fetch().map_ok(Some), None, names::FORECAST)
            .await;
        let Some(raw) = raw else {
            error!("no forecast available, neither current nor cached");
            return None;
        };
        if fallback {
            warn!("using cached forecast data");
        }

        let corrected = forecast::correct(&raw, station, now);
        persist("forecast", self.store.record_forecast(now, &raw, &corrected).await);
        Some(corrected)
    }

    /// Simulates the current actuator state and the shades-open hypothesis, and
    /// remembers the prediction one poll interval ahead.
    async fn predict(
        &self,
        state: &GreenhouseState,
        forecast: &Forecast,
        now: DateTime<Utc>,
    ) -> Option<(Trajectory, Trajectory)> {
        let horizon = chrono::Duration::hours(i64::from(self.model.horizon_hours));
        let step = chrono::Duration::seconds(i64::from(self.model.step_seconds));
        let run = |actuators: ActuatorState| {
            simulate(state, &self.model.params, forecast, actuators, horizon, step, now)
        };

        let actuators = self.modelled_actuators(state);
        let runs = (run(actuators), run(actuators.with_shades_open()));
        let (current, shades_open) = match runs {
            (Ok(current), Ok(shades_open)) => (current, shades_open),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "thermal simulation failed");
                return None;
            }
        };

        let steps_per_hour = current.steps_in(60);
        info!(
            in_1h_f = current.air_temp_at(steps_per_hour),
            in_3h_f = current.air_temp_at(3 * steps_per_hour),
            "model prediction"
        );

        let poll_steps = (self.poll_interval.as_secs() / u64::from(self.model.step_seconds)) as usize;
        self.memory.lock().prediction_f = current.air_temp_at(poll_steps);

        persist(
            "trajectory",
            self.store
                .record_trajectory(now, "current", &current.downsample(TRAJECTORY_DOWNSAMPLE))
                .await,
        );
        persist(
            "trajectory",
            self.store
                .record_trajectory(now, "shades_open", &shades_open.downsample(TRAJECTORY_DOWNSAMPLE))
                .await,
        );
        Some((current, shades_open))
    }

    /// Actuators as the model sees them. A requested HVAC mode adds no heat while
    /// no unit is installed.
    fn modelled_actuators(&self, state: &GreenhouseState) -> ActuatorState {
        let mut actuators = state.actuators();
        if !self.hvac_installed {
            actuators.hvac_mode = HvacMode::Off;
        }
        actuators
    }

    async fn meter_power(&self, now: DateTime<Utc>) {
        let meter = &self.devices.power_meter;
        let (reading, fallback) = self
            .retry
            .with_retry(|| meter.read().map_ok(Some), None, names::POWER_METER)
            .await;
        if fallback {
            warn!(device = names::POWER_METER, "using fallback for power meter");
        }
        let Some(reading) = reading else {
            return;
        };

        let previous = self.memory.lock().last_power.replace(reading);
        let delta = previous
            .map(|prev| EnergyDelta::between(&prev, &reading))
            .unwrap_or_default();
        info!(
            phase_a_kw = reading.phase_a.power_kw,
            phase_b_kw = reading.phase_b.power_kw,
            total_kw = reading.total_power_kw,
            "power"
        );
        persist("power", self.store.record_power(now, &reading, &delta).await);
    }

    async fn raise_alerts(&self, now: DateTime<Utc>) {
        let registry = self.registry();
        for health in registry.due_alerts(now) {
            let hours = health.hours_since_success(now);
            let hours_since_success = hours.is_finite().then_some(hours);
            let message = match hours_since_success {
                Some(h) => format!(
                    "{} failing: {} consecutive failures, last success {:.1} h ago",
                    health.name, health.consecutive_failures, h
                ),
                None => format!(
                    "{} failing: {} consecutive failures, never succeeded",
                    health.name, health.consecutive_failures
                ),
            };
            error!(
                device = %health.name,
                consecutive_failures = health.consecutive_failures,
                threshold_h = registry.threshold(&health.name),
                "device alert"
            );
            let record = AlertRecord {
                timestamp: now,
                device: health.name.clone(),
                consecutive_failures: health.consecutive_failures,
                hours_since_success,
                message,
            };
            persist("alert", self.store.record_alert(&record).await);
            registry.mark_alerted(&health.name);
        }
    }
}

/// Station fallback: takes outdoor conditions from the forecast's current hour
/// when the station gave nothing.
fn fill_outdoor_from_forecast(state: &mut GreenhouseState, hourly: &Forecast, now: DateTime<Utc>) {
    if state.outdoor_temp_f.is_some() {
        return;
    }
    let Some(current) = forecast::current_conditions(hourly, now) else {
        return;
    };
    state.outdoor_temp_f = current.outdoor_temp_f;
    state.outdoor_humidity = state.outdoor_humidity.or(current.outdoor_humidity);
    state.solar_irradiance_wm2 = state.solar_irradiance_wm2.or(current.solar_irradiance_wm2);
    state.wind_speed_mph = state.wind_speed_mph.or(current.wind_speed_mph);
    info!("filled outdoor conditions from forecast");
}

fn persist(what: &str, result: anyhow::Result<()>) {
    if let Err(e) = result {
        warn!(record = what, error = %e, "store write failed");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Runs the control loop on its own task until `shutdown` is cancelled.
pub fn spawn_controller(controller: Arc<GreenhouseController>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move { controller.run(shutdown).await })
}
