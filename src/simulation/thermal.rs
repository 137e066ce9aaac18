use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

use crate::domain::{ActuatorState, Forecast, GreenhouseState, HvacMode};

/// Volumetric heat capacity of air, ρ·c_p (J/m³/K).
const AIR_RHO_CP: f64 = 1.2 * 1006.0;

#[derive(Debug, Error, PartialEq)]
pub enum SimulationError {
    #[error("no indoor temperature to initialise the model")]
    MissingIndoorTemperature,
    #[error("forecast has no hourly values")]
    EmptyForecast,
    #[error("integration step must be positive")]
    InvalidStep,
}

/// Physical constants of the greenhouse envelope and contents.
///
/// Defaults describe a 29' x 14.75' single-pane glass house with a concrete
/// perimeter and gravel beds, sharing its north gable with an unheated shed.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ThermalParameters {
    #[validate(range(exclusive_min = 0.0))]
    pub floor_area_m2: f64,
    #[validate(range(exclusive_min = 0.0))]
    pub roof_east_area_m2: f64,
    #[validate(range(exclusive_min = 0.0))]
    pub roof_west_area_m2: f64,
    /// Glazing transmittance for global irradiance.
    #[validate(range(min = 0.0, max = 1.0))]
    pub cover_transmittance: f64,
    /// U-value of the outdoor-exposed envelope (W/m²/K).
    #[validate(range(min = 0.0))]
    pub envelope_u_w_per_m2k: f64,
    #[validate(range(min = 0.0))]
    pub envelope_area_m2: f64,
    /// Wall shared with an unconditioned buffer space.
    #[validate(range(min = 0.0))]
    pub shared_wall_area_m2: f64,
    /// Loss reduction of the shared wall relative to an exposed one.
    #[validate(range(min = 0.0, exclusive_max = 1.0))]
    pub shared_wall_u_factor: f64,
    /// Air node heat capacity (J/K).
    #[validate(range(exclusive_min = 0.0))]
    pub air_heat_capacity_j_per_k: f64,
    /// Thermal mass node heat capacity (J/K).
    #[validate(range(exclusive_min = 0.0))]
    pub mass_heat_capacity_j_per_k: f64,
    /// Share of transmitted solar absorbed directly by the mass.
    #[validate(range(min = 0.0, max = 1.0))]
    pub mass_solar_fraction: f64,
    /// Air to mass coupling (W/K).
    #[validate(range(min = 0.0))]
    pub ground_coupling_w_per_k: f64,
    /// Exhaust fan flow when running (m³/s).
    #[validate(range(min = 0.0))]
    pub fan_flow_m3_per_s: f64,
    #[validate(range(min = 0.0))]
    pub hvac_capacity_w: f64,
}

impl Default for ThermalParameters {
    fn default() -> Self {
        Self {
            floor_area_m2: 39.74,
            roof_east_area_m2: 24.8,
            roof_west_area_m2: 24.8,
            cover_transmittance: 0.82,
            envelope_u_w_per_m2k: 5.8,
            envelope_area_m2: 104.7,
            shared_wall_area_m2: 14.2,
            shared_wall_u_factor: 0.5,
            air_heat_capacity_j_per_k: 151_200.0,
            mass_heat_capacity_j_per_k: 10_000_000.0,
            mass_solar_fraction: 0.40,
            ground_coupling_w_per_k: 150.0,
            fan_flow_m3_per_s: 0.944,
            hvac_capacity_w: 5275.0,
        }
    }
}

impl ThermalParameters {
    /// Envelope conductance including the buffered shared wall (W/K).
    pub fn ua_total(&self) -> f64 {
        let exposed = self.envelope_u_w_per_m2k * self.envelope_area_m2;
        let shared =
            self.envelope_u_w_per_m2k * self.shared_wall_area_m2 * self.shared_wall_u_factor;
        exposed + shared
    }

    /// Transmitted solar power (W) for a given irradiance and shade state.
    pub fn solar_gain_w(&self, irradiance_wm2: f64, actuators: &ActuatorState) -> f64 {
        let roof = self.roof_east_area_m2 + self.roof_west_area_m2;
        let roof_fraction = roof / (roof + self.floor_area_m2);
        let east_share = self.roof_east_area_m2 / roof;
        let west_share = 1.0 - east_share;

        let roof_open = east_share * (1.0 - actuators.shades_east.shading_factor())
            + west_share * (1.0 - actuators.shades_west.shading_factor());

        irradiance_wm2
            * self.cover_transmittance
            * self.floor_area_m2
            * (roof_fraction * roof_open + (1.0 - roof_fraction))
    }

    fn hvac_w(&self, mode: HvacMode) -> f64 {
        match mode {
            HvacMode::Heat => self.hvac_capacity_w,
            HvacMode::Cool => -self.hvac_capacity_w,
            HvacMode::Off | HvacMode::Auto => 0.0,
        }
    }
}

/// Parameters and actuator hypothesis a trajectory was produced with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub c_air: f64,
    pub c_mass: f64,
    pub ua_total: f64,
    pub cover_transmittance: f64,
    pub floor_area_m2: f64,
    pub mass_solar_fraction: f64,
    pub ground_coupling_w_per_k: f64,
    pub shade_east: f64,
    pub shade_west: f64,
    pub fan_on: bool,
    pub fan_flow_m3_per_s: f64,
    pub hvac_mode: HvacMode,
    pub hvac_capacity_w: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub time: DateTime<Utc>,
    pub air_temp_f: f64,
    pub mass_temp_f: f64,
}

/// Output of one simulator run: sample 0 is the initial state, then one sample per
/// integration step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub step_seconds: u32,
    pub points: Vec<TrajectoryPoint>,
    pub params: ModelSnapshot,
}

impl Trajectory {
    /// Integration steps covering `minutes`.
    pub fn steps_in(&self, minutes: u32) -> usize {
        (minutes as usize * 60) / self.step_seconds.max(1) as usize
    }

    fn horizon_air(&self, steps: usize) -> Option<impl Iterator<Item = f64> + '_> {
        let h = steps.min(self.points.len().saturating_sub(1));
        (h >= 1).then(|| self.points[1..=h].iter().map(|p| p.air_temp_f))
    }

    /// Highest predicted air temperature over the next `steps`, initial sample excluded.
    pub fn predicted_max(&self, steps: usize) -> Option<f64> {
        self.horizon_air(steps)?.reduce(f64::max)
    }

    pub fn predicted_min(&self, steps: usize) -> Option<f64> {
        self.horizon_air(steps)?.reduce(f64::min)
    }

    /// Air temperature `step` samples ahead, if simulated that far.
    pub fn air_temp_at(&self, step: usize) -> Option<f64> {
        self.points.get(step).map(|p| p.air_temp_f)
    }

    pub fn downsample(&self, every: usize) -> Trajectory {
        let every = every.max(1);
        Trajectory {
            step_seconds: self.step_seconds * every as u32,
            points: self.points.iter().step_by(every).copied().collect(),
            params: self.params.clone(),
        }
    }
}

/// Outdoor driving conditions for one integration step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepInputs {
    pub outdoor_temp_c: f64,
    pub solar_wm2: f64,
    pub wind_mph: f64,
}

/// Resamples hourly forecast values to per-step resolution, starting at the hour
/// that contains `now`.
pub fn resample_forecast(
    forecast: &Forecast,
    steps: usize,
    step_seconds: u32,
    now: DateTime<Utc>,
) -> Vec<StepInputs> {
    let hour_offset = forecast
        .time
        .first()
        .map(|first| {
            let elapsed = (now.naive_utc() - *first).num_seconds() as f64 / 3600.0;
            elapsed.max(0.0).floor() as usize
        })
        .unwrap_or(0);

    (0..steps)
        .map(|i| {
            let hour_float = (i as f64 * step_seconds as f64) / 3600.0;
            let idx = hour_float.floor() as usize + hour_offset;
            let frac = hour_float.fract();
            StepInputs {
                outdoor_temp_c: f_to_c(sample(&forecast.temperature_f, idx, frac, 70.0)),
                solar_wm2: sample(&forecast.solar_irradiance_wm2, idx, frac, 0.0).max(0.0),
                wind_mph: sample(&forecast.wind_speed_mph, idx, frac, 0.0).max(0.0),
            }
        })
        .collect()
}

fn sample(values: &[f64], idx: usize, frac: f64, default: f64) -> f64 {
    match values.len() {
        0 => default,
        n if idx + 1 < n => values[idx] + (values[idx + 1] - values[idx]) * frac,
        n if idx < n => values[idx],
        n => values[n - 1],
    }
}

/// Temperatures of the two nodes (°C).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThermalNodes {
    pub air_c: f64,
    pub mass_c: f64,
}

/// Two-node lumped-capacitance greenhouse model.
///
/// Physics:
/// - C_air · dT_air/dt = Q_solar·(1−f) − UA·(T_air−T_out) − ρc_p·V̇·(T_air−T_out) − U_g·(T_air−T_mass) + Q_hvac
/// - C_mass · dT_mass/dt = Q_solar·f + U_g·(T_air−T_mass)
pub struct GreenhouseThermalModel<'a> {
    params: &'a ThermalParameters,
    actuators: ActuatorState,
    ua_total: f64,
}

impl<'a> GreenhouseThermalModel<'a> {
    pub fn new(params: &'a ThermalParameters, actuators: ActuatorState) -> Self {
        Self {
            params,
            actuators,
            ua_total: params.ua_total(),
        }
    }

    /// Advances both nodes by one explicit Euler step.
    pub fn step(&self, nodes: &mut ThermalNodes, inputs: StepInputs, dt_seconds: f64) {
        let p = self.params;

        let q_solar = p.solar_gain_w(inputs.solar_wm2, &self.actuators);
        let q_solar_air = q_solar * (1.0 - p.mass_solar_fraction);
        let q_solar_mass = q_solar * p.mass_solar_fraction;

        let q_envelope = self.ua_total * (nodes.air_c - inputs.outdoor_temp_c);
        let fan_flow = if self.actuators.fan_on {
            p.fan_flow_m3_per_s
        } else {
            0.0
        };
        let q_vent = AIR_RHO_CP * fan_flow * (nodes.air_c - inputs.outdoor_temp_c);
        let q_ground = p.ground_coupling_w_per_k * (nodes.air_c - nodes.mass_c);
        let q_hvac = p.hvac_w(self.actuators.hvac_mode);

        nodes.air_c += (q_solar_air - q_envelope - q_vent - q_ground + q_hvac)
            / p.air_heat_capacity_j_per_k
            * dt_seconds;

        // Mass sees the freshly updated air temperature.
        let q_ground_mass = p.ground_coupling_w_per_k * (nodes.air_c - nodes.mass_c);
        nodes.mass_c +=
            (q_solar_mass + q_ground_mass) / p.mass_heat_capacity_j_per_k * dt_seconds;
    }

    fn snapshot(&self) -> ModelSnapshot {
        let p = self.params;
        ModelSnapshot {
            c_air: p.air_heat_capacity_j_per_k,
            c_mass: p.mass_heat_capacity_j_per_k,
            ua_total: self.ua_total,
            cover_transmittance: p.cover_transmittance,
            floor_area_m2: p.floor_area_m2,
            mass_solar_fraction: p.mass_solar_fraction,
            ground_coupling_w_per_k: p.ground_coupling_w_per_k,
            shade_east: self.actuators.shades_east.shading_factor(),
            shade_west: self.actuators.shades_west.shading_factor(),
            fan_on: self.actuators.fan_on,
            fan_flow_m3_per_s: if self.actuators.fan_on {
                p.fan_flow_m3_per_s
            } else {
                0.0
            },
            hvac_mode: self.actuators.hvac_mode,
            hvac_capacity_w: p.hvac_capacity_w,
        }
    }
}

/// Forward-integrates the model from the current state over `horizon`.
///
/// `actuators` is the actuator hypothesis for this run and may differ from the
/// state's own fields. `now` anchors the forecast alignment, so identical inputs
/// always produce identical trajectories.
pub fn simulate(
    initial: &GreenhouseState,
    params: &ThermalParameters,
    forecast: &Forecast,
    actuators: ActuatorState,
    horizon: Duration,
    step: Duration,
    now: DateTime<Utc>,
) -> Result<Trajectory, SimulationError> {
    let indoor_f = initial
        .indoor_temp_f
        .ok_or(SimulationError::MissingIndoorTemperature)?;
    if forecast.is_empty() {
        return Err(SimulationError::EmptyForecast);
    }
    let step_seconds = u32::try_from(step.num_seconds())
        .ok()
        .filter(|s| *s > 0)
        .ok_or(SimulationError::InvalidStep)?;
    let steps = (horizon.num_seconds().max(0) / step_seconds as i64) as usize;
    let dt = step_seconds as f64;

    let model = GreenhouseThermalModel::new(params, actuators);
    let inputs = resample_forecast(forecast, steps, step_seconds, now);

    let start_c = f_to_c(indoor_f);
    // No separate mass sensor: assume equilibrium with the air at start.
    let mut nodes = ThermalNodes {
        air_c: start_c,
        mass_c: start_c,
    };

    let mut points = Vec::with_capacity(steps + 1);
    points.push(TrajectoryPoint {
        time: now,
        air_temp_f: indoor_f,
        mass_temp_f: indoor_f,
    });

    for (i, input) in inputs.into_iter().enumerate() {
        model.step(&mut nodes, input, dt);
        points.push(TrajectoryPoint {
            time: now + Duration::seconds((i as i64 + 1) * step_seconds as i64),
            air_temp_f: c_to_f(nodes.air_c),
            mass_temp_f: c_to_f(nodes.mass_c),
        });
    }

    Ok(Trajectory {
        step_seconds,
        points,
        params: model.snapshot(),
    })
}

pub fn f_to_c(f: f64) -> f64 {
    (f - 32.0) * 5.0 / 9.0
}

pub fn c_to_f(c: f64) -> f64 {
    c * 9.0 / 5.0 + 32.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ShadePosition;
    use chrono::{NaiveDateTime, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 15, 18, 0, 0).unwrap()
    }

    fn flat_forecast(start: NaiveDateTime, hours: usize, temp_f: f64, solar: f64) -> Forecast {
        Forecast {
            time: (0..hours)
                .map(|i| start + Duration::hours(i as i64))
                .collect(),
            temperature_f: vec![temp_f; hours],
            humidity: vec![50.0; hours],
            solar_irradiance_wm2: vec![solar; hours],
            wind_speed_mph: vec![0.0; hours],
            is_day: vec![true; hours],
        }
    }

    fn state_at(indoor_f: f64) -> GreenhouseState {
        let mut state = GreenhouseState::new(now());
        state.indoor_temp_f = Some(indoor_f);
        state
    }

    fn run(state: &GreenhouseState, forecast: &Forecast, actuators: ActuatorState) -> Trajectory {
        simulate(
            state,
            &ThermalParameters::default(),
            forecast,
            actuators,
            Duration::hours(6),
            Duration::seconds(60),
            now(),
        )
        .unwrap()
    }

    #[test]
    fn test_no_drift_at_equilibrium() {
        let forecast = flat_forecast(now().naive_utc(), 8, 75.0, 0.0);
        let trajectory = run(&state_at(75.0), &forecast, ActuatorState::default());

        assert_eq!(trajectory.points.len(), 361);
        for p in &trajectory.points {
            assert!((p.air_temp_f - 75.0).abs() < 1e-9);
            assert!((p.mass_temp_f - 75.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_cools_toward_outdoor() {
        let forecast = flat_forecast(now().naive_utc(), 8, 50.0, 0.0);
        let trajectory = run(&state_at(75.0), &forecast, ActuatorState::default());

        let last = trajectory.points.last().unwrap();
        assert!(last.air_temp_f < 75.0);
        assert!(last.air_temp_f > 50.0);
        // Mass lags the air and releases stored heat.
        assert!(last.mass_temp_f > last.air_temp_f);
    }

    #[test]
    fn test_closed_shades_reduce_peak() {
        let forecast = flat_forecast(now().naive_utc(), 8, 70.0, 800.0);
        let open = run(&state_at(70.0), &forecast, ActuatorState::default());
        let closed = run(
            &state_at(70.0),
            &forecast,
            ActuatorState {
                shades_east: ShadePosition::Closed,
                shades_west: ShadePosition::Closed,
                ..Default::default()
            },
        );

        let steps = open.steps_in(120);
        assert!(closed.predicted_max(steps).unwrap() < open.predicted_max(steps).unwrap());
        assert!(open.predicted_max(steps).unwrap() > 70.0);
    }

    #[test]
    fn test_fan_pulls_toward_outdoor() {
        let forecast = flat_forecast(now().naive_utc(), 8, 60.0, 0.0);
        let still = run(&state_at(85.0), &forecast, ActuatorState::default());
        let vented = run(
            &state_at(85.0),
            &forecast,
            ActuatorState {
                fan_on: true,
                ..Default::default()
            },
        );
        assert!(vented.air_temp_at(30).unwrap() < still.air_temp_at(30).unwrap());
        assert!(vented.params.fan_on);
        assert!(!still.params.fan_on);
        assert_eq!(still.params.fan_flow_m3_per_s, 0.0);
    }

    #[test]
    fn test_hvac_heat_and_cool() {
        let forecast = flat_forecast(now().naive_utc(), 8, 70.0, 0.0);
        let heat = run(
            &state_at(70.0),
            &forecast,
            ActuatorState {
                hvac_mode: HvacMode::Heat,
                ..Default::default()
            },
        );
        let cool = run(
            &state_at(70.0),
            &forecast,
            ActuatorState {
                hvac_mode: HvacMode::Cool,
                ..Default::default()
            },
        );
        assert!(heat.air_temp_at(10).unwrap() > 70.0);
        assert!(cool.air_temp_at(10).unwrap() < 70.0);
    }

    #[test]
    fn test_forecast_alignment_skips_elapsed_hours() {
        // Forecast starts 3h before now: first 3 hours are hot, the rest mild.
        let start = now().naive_utc() - Duration::hours(3);
        let mut forecast = flat_forecast(start, 10, 60.0, 0.0);
        for t in forecast.temperature_f.iter_mut().take(3) {
            *t = 100.0;
        }
        let inputs = resample_forecast(&forecast, 120, 60, now());
        assert!((inputs[0].outdoor_temp_c - f_to_c(60.0)).abs() < 1e-9);
    }

    #[test]
    fn test_resample_interpolates_and_holds_last() {
        let mut forecast = flat_forecast(now().naive_utc(), 2, 60.0, 0.0);
        forecast.temperature_f = vec![60.0, 70.0];
        let inputs = resample_forecast(&forecast, 180, 60, now());

        assert!((inputs[30].outdoor_temp_c - f_to_c(65.0)).abs() < 1e-9);
        assert!((inputs[60].outdoor_temp_c - f_to_c(70.0)).abs() < 1e-9);
        assert!((inputs[179].outdoor_temp_c - f_to_c(70.0)).abs() < 1e-9);
    }

    #[test]
    fn test_stale_forecast_holds_last_value() {
        let start = now().naive_utc() - Duration::hours(48);
        let mut forecast = flat_forecast(start, 24, 60.0, 0.0);
        *forecast.temperature_f.last_mut().unwrap() = 55.0;
        let inputs = resample_forecast(&forecast, 10, 60, now());
        assert!(inputs
            .iter()
            .all(|i| (i.outdoor_temp_c - f_to_c(55.0)).abs() < 1e-9));
    }

    #[test]
    fn test_deterministic() {
        let forecast = flat_forecast(now().naive_utc(), 8, 65.0, 400.0);
        let a = run(&state_at(72.0), &forecast, ActuatorState::default());
        let b = run(&state_at(72.0), &forecast, ActuatorState::default());
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_inputs() {
        let forecast = flat_forecast(now().naive_utc(), 8, 65.0, 0.0);
        let params = ThermalParameters::default();
        let no_indoor = GreenhouseState::new(now());
        assert_eq!(
            simulate(
                &no_indoor,
                &params,
                &forecast,
                ActuatorState::default(),
                Duration::hours(1),
                Duration::seconds(60),
                now()
            ),
            Err(SimulationError::MissingIndoorTemperature)
        );
        assert_eq!(
            simulate(
                &state_at(70.0),
                &params,
                &Forecast::default(),
                ActuatorState::default(),
                Duration::hours(1),
                Duration::seconds(60),
                now()
            ),
            Err(SimulationError::EmptyForecast)
        );
    }

    #[test]
    fn test_horizon_statistics_exclude_initial_sample() {
        let forecast = flat_forecast(now().naive_utc(), 8, 50.0, 0.0);
        let trajectory = run(&state_at(75.0), &forecast, ActuatorState::default());
        let steps = trajectory.steps_in(120);
        assert_eq!(steps, 120);
        assert!(trajectory.predicted_max(steps).unwrap() < 75.0);

        let coarse = trajectory.downsample(5);
        assert_eq!(coarse.points.len(), 73);
        assert_eq!(coarse.step_seconds, 300);
    }

    #[test]
    fn test_default_parameters_validate() {
        assert!(ThermalParameters::default().validate().is_ok());
        let bad = ThermalParameters {
            cover_transmittance: 1.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
