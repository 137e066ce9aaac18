//! # Simulated Greenhouse
//!
//! A virtual greenhouse for development and testing without hardware. One
//! [`SimulatedGreenhouse`] holds the synthetic outdoor weather, the indoor
//! thermal state and the actuator positions; the simulated devices are thin views
//! onto it, so commanding the fan really does cool the simulated air.
//!
//! Indoor air is advanced with the same two-node model the controller predicts
//! with, lazily, whenever a device is read or commanded.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Timelike, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::f64::consts::PI;
use std::sync::Arc;

use super::{
    names, DeviceError, Devices, IndoorSensor, PowerMeter, ShadeGroup, ShadeGroups, Switch, WeatherStation,
};
use crate::domain::{
    ActuatorState, Forecast, IndoorReading, PhaseReading, PowerReading, ShadePosition,
    StationReading, SwitchReading,
};
use crate::forecast::ForecastSource;
use crate::simulation::{c_to_f, f_to_c, GreenhouseThermalModel, StepInputs, ThermalNodes, ThermalParameters};

const STEP_SECONDS: i64 = 60;

/// Clear-sky diurnal weather for a given longitude.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticWeather {
    pub longitude_deg: f64,
    pub mean_temp_f: f64,
    pub temp_swing_f: f64,
    pub peak_irradiance_wm2: f64,
    pub wind_mph: f64,
}

impl Default for SyntheticWeather {
    fn default() -> Self {
        Self {
            longitude_deg: -122.9037,
            mean_temp_f: 62.0,
            temp_swing_f: 12.0,
            peak_irradiance_wm2: 850.0,
            wind_mph: 3.0,
        }
    }
}

impl SyntheticWeather {
    fn solar_hour(&self, at: DateTime<Utc>) -> f64 {
        let utc_hours = at.hour() as f64 + at.minute() as f64 / 60.0 + at.second() as f64 / 3600.0;
        (utc_hours + self.longitude_deg / 15.0).rem_euclid(24.0)
    }

    /// Temperature peaks mid-afternoon solar time.
    pub fn temperature_f(&self, at: DateTime<Utc>) -> f64 {
        let h = self.solar_hour(at);
        self.mean_temp_f + self.temp_swing_f * (2.0 * PI * (h - 9.0) / 24.0).sin()
    }

    pub fn irradiance_wm2(&self, at: DateTime<Utc>) -> f64 {
        let h = self.solar_hour(at);
        (self.peak_irradiance_wm2 * (PI * (h - 6.0) / 12.0).sin()).max(0.0)
    }

    pub fn is_day(&self, at: DateTime<Utc>) -> bool {
        (6.0..18.0).contains(&self.solar_hour(at))
    }

    pub fn humidity(&self, at: DateTime<Utc>) -> f64 {
        (70.0 - 1.5 * (self.temperature_f(at) - self.mean_temp_f)).clamp(5.0, 100.0)
    }

    fn inputs(&self, at: DateTime<Utc>) -> StepInputs {
        StepInputs {
            outdoor_temp_c: f_to_c(self.temperature_f(at)),
            solar_wm2: self.irradiance_wm2(at),
            wind_mph: self.wind_mph,
        }
    }
}

#[derive(Debug)]
struct SimState {
    nodes: ThermalNodes,
    clock: DateTime<Utc>,
    actuators: ActuatorState,
    circ_fans_on: bool,
    energy_kwh: f64,
    offline: HashSet<String>,
}

/// Shared state behind the simulated devices.
#[derive(Debug)]
pub struct SimulatedGreenhouse {
    params: ThermalParameters,
    weather: SyntheticWeather,
    state: Mutex<SimState>,
}

impl SimulatedGreenhouse {
    pub fn new(params: ThermalParameters, weather: SyntheticWeather, start: DateTime<Utc>) -> Self {
        let outdoor_c = f_to_c(weather.temperature_f(start));
        Self {
            params,
            weather,
            state: Mutex::new(SimState {
                nodes: ThermalNodes {
                    air_c: outdoor_c,
                    mass_c: outdoor_c,
                },
                clock: start,
                actuators: ActuatorState::default(),
                circ_fans_on: false,
                energy_kwh: 0.0,
                offline: HashSet::new(),
            }),
        }
    }

    pub fn weather(&self) -> &SyntheticWeather {
        &self.weather
    }

    /// Integrates the indoor nodes up to `now` under the current actuators.
    pub fn advance_to(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        let model = GreenhouseThermalModel::new(&self.params, state.actuators);
        while state.clock < now {
            let dt = (now - state.clock).min(Duration::seconds(STEP_SECONDS));
            let dt_s = dt.num_milliseconds() as f64 / 1000.0;
            let inputs = self.weather.inputs(state.clock);
            let mut nodes = state.nodes;
            model.step(&mut nodes, inputs, dt_s);
            state.nodes = nodes;
            let load_kw = self.load_kw(&state);
            state.energy_kwh += load_kw * dt_s / 3600.0;
            state.clock += dt;
        }
    }

    pub fn indoor_temp_f(&self) -> f64 {
        c_to_f(self.state.lock().nodes.air_c)
    }

    /// Forces both nodes to `temp_f`.
    pub fn set_indoor_temp_f(&self, temp_f: f64) {
        let mut state = self.state.lock();
        state.nodes = ThermalNodes {
            air_c: f_to_c(temp_f),
            mass_c: f_to_c(temp_f),
        };
    }

    pub fn actuators(&self) -> ActuatorState {
        self.state.lock().actuators
    }

    /// Makes every read and command of `device` fail until cleared.
    pub fn set_offline(&self, device: &str, offline: bool) {
        let mut state = self.state.lock();
        if offline {
            state.offline.insert(device.to_string());
        } else {
            state.offline.remove(device);
        }
    }

    fn check_online(&self, device: &'static str) -> Result<()> {
        if self.state.lock().offline.contains(device) {
            return Err(DeviceError::Rejected {
                device,
                reason: "simulated outage".to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn load_kw(&self, state: &SimState) -> f64 {
        let fan = if state.actuators.fan_on { 0.35 } else { 0.0 };
        let circ = if state.circ_fans_on { 0.12 } else { 0.0 };
        0.05 + fan + circ
    }

    fn update(&self, f: impl FnOnce(&mut SimState)) {
        self.advance_to(Utc::now());
        f(&mut *self.state.lock());
    }
}

pub struct SimulatedIndoorSensor(pub Arc<SimulatedGreenhouse>);

#[async_trait]
impl IndoorSensor for SimulatedIndoorSensor {
    async fn read(&self) -> Result<IndoorReading> {
        self.0.check_online(names::INDOOR)?;
        self.0.advance_to(Utc::now());
        let temp_f = self.0.indoor_temp_f();
        Ok(IndoorReading {
            temp_f: Some((temp_f * 10.0).round() / 10.0),
            humidity: Some(self.0.weather.humidity(Utc::now())),
            battery_percent: Some(100.0),
        })
    }
}

pub struct SimulatedWeatherStation(pub Arc<SimulatedGreenhouse>);

#[async_trait]
impl WeatherStation for SimulatedWeatherStation {
    async fn read(&self) -> Result<StationReading> {
        self.0.check_online(names::STATION)?;
        let now = Utc::now();
        let w = &self.0.weather;
        Ok(StationReading {
            outdoor_temp_f: Some(w.temperature_f(now)),
            outdoor_humidity: Some(w.humidity(now)),
            solar_irradiance_wm2: Some(w.irradiance_wm2(now)),
            wind_speed_mph: Some(w.wind_mph),
        })
    }
}

/// Hourly forecast sampled from the synthetic weather, starting at the current hour.
pub struct SimulatedForecast {
    greenhouse: Arc<SimulatedGreenhouse>,
    hours: usize,
}

impl SimulatedForecast {
    pub fn new(greenhouse: Arc<SimulatedGreenhouse>, hours: usize) -> Self {
        Self { greenhouse, hours }
    }
}

#[async_trait]
impl ForecastSource for SimulatedForecast {
    async fn fetch(&self) -> Result<Forecast> {
        self.greenhouse.check_online(names::FORECAST)?;
        let w = &self.greenhouse.weather;
        let start = Utc::now().duration_trunc(Duration::hours(1))?;
        let times: Vec<_> = (0..self.hours)
            .map(|i| start + Duration::hours(i as i64))
            .collect();
        Ok(Forecast {
            time: times.iter().map(|t| t.naive_utc()).collect(),
            temperature_f: times.iter().map(|t| w.temperature_f(*t)).collect(),
            humidity: times.iter().map(|t| w.humidity(*t)).collect(),
            solar_irradiance_wm2: times.iter().map(|t| w.irradiance_wm2(*t)).collect(),
            wind_speed_mph: vec![w.wind_mph; self.hours],
            is_day: times.iter().map(|t| w.is_day(*t)).collect(),
        })
    }
}

/// Which relay a [`SimulatedSwitch`] drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedRelay {
    ExhaustFan,
    CirculationFans,
}

pub struct SimulatedSwitch {
    greenhouse: Arc<SimulatedGreenhouse>,
    relay: SimulatedRelay,
}

impl SimulatedSwitch {
    pub fn new(greenhouse: Arc<SimulatedGreenhouse>, relay: SimulatedRelay) -> Self {
        Self { greenhouse, relay }
    }

    fn device(&self) -> &'static str {
        match self.relay {
            SimulatedRelay::ExhaustFan => names::EXHAUST_FAN,
            SimulatedRelay::CirculationFans => names::CIRC_FANS,
        }
    }

    fn set_state(&self, on: bool) -> Result<()> {
        self.greenhouse.check_online(self.device())?;
        let relay = self.relay;
        self.greenhouse.update(|s| match relay {
            SimulatedRelay::ExhaustFan => s.actuators.fan_on = on,
            SimulatedRelay::CirculationFans => s.circ_fans_on = on,
        });
        Ok(())
    }
}

#[async_trait]
impl Switch for SimulatedSwitch {
    async fn read(&self) -> Result<SwitchReading> {
        self.greenhouse.check_online(self.device())?;
        let state = self.greenhouse.state.lock();
        let on = match self.relay {
            SimulatedRelay::ExhaustFan => state.actuators.fan_on,
            SimulatedRelay::CirculationFans => state.circ_fans_on,
        };
        Ok(SwitchReading { on })
    }

    async fn turn_on(&self) -> Result<()> {
        self.set_state(true)
    }

    async fn turn_off(&self) -> Result<()> {
        self.set_state(false)
    }
}

pub struct SimulatedShades(pub Arc<SimulatedGreenhouse>);

impl SimulatedShades {
    fn move_group(&self, group: ShadeGroup, position: ShadePosition) -> Result<()> {
        self.0.check_online(names::SHADES)?;
        self.0.update(|s| match group {
            ShadeGroup::East => s.actuators.shades_east = position,
            ShadeGroup::West => s.actuators.shades_west = position,
        });
        Ok(())
    }
}

#[async_trait]
impl ShadeGroups for SimulatedShades {
    async fn open(&self, group: ShadeGroup) -> Result<()> {
        self.move_group(group, ShadePosition::Open)
    }

    async fn close(&self, group: ShadeGroup) -> Result<()> {
        self.move_group(group, ShadePosition::Closed)
    }

    async fn read(&self) -> Result<(Option<ShadePosition>, Option<ShadePosition>)> {
        self.0.check_online(names::SHADES)?;
        let a = self.0.actuators();
        Ok((Some(a.shades_east), Some(a.shades_west)))
    }
}

pub struct SimulatedPowerMeter(pub Arc<SimulatedGreenhouse>);

#[async_trait]
impl PowerMeter for SimulatedPowerMeter {
    async fn read(&self) -> Result<PowerReading> {
        self.0.check_online(names::POWER_METER)?;
        self.0.advance_to(Utc::now());
        let state = self.0.state.lock();
        let load_kw = self.0.load_kw(&state);
        let phase = |share: f64| PhaseReading {
            power_kw: Some(load_kw * share),
            current_a: Some(load_kw * share * 1000.0 / 120.0),
            voltage_v: Some(120.0),
            total_kwh: Some(state.energy_kwh * share),
        };
        Ok(PowerReading {
            phase_a: phase(0.5),
            phase_b: phase(0.5),
            total_power_kw: load_kw,
        })
    }
}

/// Full device set backed by one simulated greenhouse.
pub fn devices(greenhouse: Arc<SimulatedGreenhouse>, forecast_hours: usize) -> Devices {
    Devices {
        indoor: Arc::new(SimulatedIndoorSensor(greenhouse.clone())),
        station: Arc::new(SimulatedWeatherStation(greenhouse.clone())),
        forecast: Arc::new(SimulatedForecast::new(greenhouse.clone(), forecast_hours)),
        exhaust_fan: Arc::new(SimulatedSwitch::new(greenhouse.clone(), SimulatedRelay::ExhaustFan)),
        circ_fans: Arc::new(SimulatedSwitch::new(
            greenhouse.clone(),
            SimulatedRelay::CirculationFans,
        )),
        shades: Arc::new(SimulatedShades(greenhouse.clone())),
        power_meter: Arc::new(SimulatedPowerMeter(greenhouse)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn greenhouse(start: DateTime<Utc>) -> Arc<SimulatedGreenhouse> {
        Arc::new(SimulatedGreenhouse::new(
            ThermalParameters::default(),
            SyntheticWeather::default(),
            start,
        ))
    }

    #[test]
    fn test_synthetic_weather_shape() {
        let w = SyntheticWeather::default();
        // 21:00 UTC is early afternoon at -122.9°.
        let afternoon = Utc.with_ymd_and_hms(2026, 7, 1, 21, 0, 0).unwrap();
        let night = Utc.with_ymd_and_hms(2026, 7, 1, 10, 0, 0).unwrap();
        assert!(w.is_day(afternoon));
        assert!(!w.is_day(night));
        assert!(w.irradiance_wm2(afternoon) > 500.0);
        assert_eq!(w.irradiance_wm2(night), 0.0);
        assert!(w.temperature_f(afternoon) > w.temperature_f(night));
    }

    #[test]
    fn test_sun_heats_and_fan_cools() {
        let start = Utc.with_ymd_and_hms(2026, 7, 1, 19, 0, 0).unwrap();
        let sunny = greenhouse(start);
        sunny.advance_to(start + Duration::hours(1));
        let warm = sunny.indoor_temp_f();
        assert!(warm > sunny.weather().temperature_f(start));

        let vented = greenhouse(start);
        vented.state.lock().actuators.fan_on = true;
        vented.advance_to(start + Duration::hours(1));
        assert!(vented.indoor_temp_f() < warm);
    }

    #[tokio::test]
    async fn test_devices_share_state() {
        let gh = greenhouse(Utc::now());
        let fan = SimulatedSwitch::new(gh.clone(), SimulatedRelay::ExhaustFan);
        let shades = SimulatedShades(gh.clone());

        fan.turn_on().await.unwrap();
        shades.set(ShadeGroup::West, ShadePosition::Closed).await.unwrap();

        assert!(fan.read().await.unwrap().on);
        assert!(gh.actuators().fan_on);
        assert_eq!(
            shades.read().await.unwrap(),
            (Some(ShadePosition::Open), Some(ShadePosition::Closed))
        );
    }

    #[tokio::test]
    async fn test_offline_device_fails() {
        let gh = greenhouse(Utc::now());
        let sensor = SimulatedIndoorSensor(gh.clone());
        gh.set_offline("shelly_ht", true);
        assert!(sensor.read().await.is_err());
        gh.set_offline("shelly_ht", false);
        assert!(sensor.read().await.unwrap().temp_f.is_some());
    }

    #[tokio::test]
    async fn test_forecast_is_hourly_from_current_hour() {
        let gh = greenhouse(Utc::now());
        let forecast = SimulatedForecast::new(gh, 48).fetch().await.unwrap();
        assert_eq!(forecast.len(), 48);
        assert!(forecast.current_hour_index(Utc::now()).is_some());
        assert!(forecast.solar_irradiance_wm2.iter().all(|v| *v >= 0.0));
    }
}
