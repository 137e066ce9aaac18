//! Rule-based control decisions.
//!
//! Priority: shades → exhaust fans → HVAC.
//!
//! Shades are deployed predictively from the simulated trajectory. Exhaust fans are
//! reactive and only run when outdoor air is cool enough to help. HVAC is
//! predictive, the last resort, and decision-only until an actuator exists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::domain::{
    Actuator, Command, Decisions, Forecast, GreenhouseState, HvacMode, Setpoints, ShadePosition,
};
use crate::simulation::Trajectory;

/// Margins of the decision rules. Calibration values, loaded from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTuning {
    /// Window of the trajectory examined for peaks and troughs.
    pub prediction_horizon_minutes: u32,
    /// Open shades when sunset is at most this far away.
    pub sunset_lead_minutes: u32,
    /// Indoor must be this far below the cool setpoint before shades re-open.
    pub shade_open_margin_f: f64,
    /// Outdoor must be this much cooler than indoor for the fans to help.
    pub fan_effectiveness_delta_f: f64,
    /// Fans stop once indoor is this far below the cool setpoint.
    pub fan_stop_margin_f: f64,
}

impl Default for DecisionTuning {
    fn default() -> Self {
        Self {
            prediction_horizon_minutes: 120,
            sunset_lead_minutes: 60,
            shade_open_margin_f: 5.0,
            fan_effectiveness_delta_f: 5.0,
            fan_stop_margin_f: 2.0,
        }
    }
}

/// Minutes until the next day→night transition in the forecast's day flags at or
/// after `now`, or `None` when no such transition is in the forecast window.
pub fn minutes_to_sunset(forecast: &Forecast, now: DateTime<Utc>) -> Option<f64> {
    let now = now.naive_utc();
    (1..forecast.is_day.len().min(forecast.time.len()))
        .filter(|&i| forecast.is_day[i - 1] && !forecast.is_day[i])
        .map(|i| (forecast.time[i] - now).num_seconds() as f64 / 60.0)
        .find(|minutes| *minutes >= 0.0)
}

#[derive(Debug, Clone, Default)]
pub struct DecisionEngine {
    tuning: DecisionTuning,
}

impl DecisionEngine {
    pub fn new(tuning: DecisionTuning) -> Self {
        Self { tuning }
    }

    pub fn tuning(&self) -> &DecisionTuning {
        &self.tuning
    }

    /// Desired state of every actuator not in `overridden`.
    ///
    /// `current` is the trajectory under the present actuator state, `shades_open`
    /// the trajectory with both shade groups forced open. Actuators without an entry
    /// in the result hold their current state.
    #[allow(clippy::too_many_arguments)]
    pub fn decide(
        &self,
        state: &GreenhouseState,
        current: &Trajectory,
        shades_open: &Trajectory,
        setpoints: Setpoints,
        overridden: &HashSet<Actuator>,
        forecast: &Forecast,
        now: DateTime<Utc>,
    ) -> Decisions {
        let t = &self.tuning;
        let mut decisions = Decisions::new();

        let horizon = current.steps_in(t.prediction_horizon_minutes);
        let pred_max = current.predicted_max(horizon);
        let pred_min = current.predicted_min(horizon);
        let pred_max_open =
            shades_open.predicted_max(shades_open.steps_in(t.prediction_horizon_minutes));
        let sunset_lead = f64::from(t.sunset_lead_minutes);
        let near_sunset =
            minutes_to_sunset(forecast, now).is_some_and(|m| (0.0..=sunset_lead).contains(&m));

        let actual = state.indoor_temp_f;
        let fans_effective = match (actual, state.outdoor_temp_f) {
            (Some(indoor), Some(outdoor)) => outdoor < indoor - t.fan_effectiveness_delta_f,
            _ => false,
        };
        let will_overheat = pred_max.is_some_and(|m| m > setpoints.cool_f);

        // Shades
        for actuator in [Actuator::ShadesEast, Actuator::ShadesWest] {
            if overridden.contains(&actuator) {
                continue;
            }
            let safe_to_open = pred_max_open.is_some_and(|m| m < setpoints.cool_f)
                && actual.is_some_and(|a| a < setpoints.cool_f - t.shade_open_margin_f);

            if will_overheat {
                decisions.insert(actuator, Command::Shade(ShadePosition::Closed));
            } else if near_sunset || safe_to_open {
                decisions.insert(actuator, Command::Shade(ShadePosition::Open));
            }
        }

        let Some(actual) = actual else {
            return decisions;
        };

        // Exhaust fans
        if !overridden.contains(&Actuator::Fan) {
            if actual > setpoints.cool_f && fans_effective {
                decisions.insert(Actuator::Fan, Command::Fan(true));
            } else if actual < setpoints.cool_f - t.fan_stop_margin_f || !fans_effective {
                decisions.insert(Actuator::Fan, Command::Fan(false));
            }
        }

        // HVAC: never cool while the fans run
        if !overridden.contains(&Actuator::Hvac) {
            let fan_commanded = match decisions.get(&Actuator::Fan) {
                Some(Command::Fan(on)) => *on,
                _ => state.fan_on,
            };
            let mode = if pred_min.is_some_and(|m| m < setpoints.heat_f) {
                HvacMode::Heat
            } else if will_overheat && !fans_effective && !fan_commanded {
                HvacMode::Cool
            } else {
                HvacMode::Off
            };
            decisions.insert(Actuator::Hvac, Command::Hvac(mode));
        }

        decisions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::{ModelSnapshot, TrajectoryPoint};
    use chrono::{Duration, TimeZone};
    use rstest::rstest;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 10, 16, 0, 0).unwrap()
    }

    fn snapshot() -> ModelSnapshot {
        ModelSnapshot {
            c_air: 1.0,
            c_mass: 1.0,
            ua_total: 1.0,
            cover_transmittance: 1.0,
            floor_area_m2: 1.0,
            mass_solar_fraction: 0.0,
            ground_coupling_w_per_k: 0.0,
            shade_east: 0.0,
            shade_west: 0.0,
            fan_on: false,
            fan_flow_m3_per_s: 0.0,
            hvac_mode: HvacMode::Off,
            hvac_capacity_w: 0.0,
        }
    }

    /// Constant trajectory at `initial` then `level` for six hours of minutes.
    fn flat(initial: f64, level: f64) -> Trajectory {
        let points = (0..=360)
            .map(|i| TrajectoryPoint {
                time: now() + Duration::minutes(i),
                air_temp_f: if i == 0 { initial } else { level },
                mass_temp_f: initial,
            })
            .collect();
        Trajectory {
            step_seconds: 60,
            points,
            params: snapshot(),
        }
    }

    /// Day all forecast long unless `sunset_in_hours` places a day→night flip.
    fn forecast(sunset_in_hours: Option<usize>) -> Forecast {
        let start = now().naive_utc();
        let n = 24;
        Forecast {
            time: (0..n).map(|i| start + Duration::hours(i as i64)).collect(),
            temperature_f: vec![70.0; n],
            humidity: vec![50.0; n],
            solar_irradiance_wm2: vec![500.0; n],
            wind_speed_mph: vec![2.0; n],
            is_day: (0..n).map(|i| sunset_in_hours.map_or(true, |s| i < s)).collect(),
        }
    }

    fn state(indoor: f64, outdoor: f64) -> GreenhouseState {
        let mut s = GreenhouseState::new(now());
        s.indoor_temp_f = Some(indoor);
        s.outdoor_temp_f = Some(outdoor);
        s
    }

    fn setpoints(cool: f64) -> Setpoints {
        Setpoints {
            heat_f: 55.0,
            cool_f: cool,
        }
    }

    fn decide(
        state: &GreenhouseState,
        current: &Trajectory,
        open: &Trajectory,
        cool: f64,
        overridden: &[Actuator],
        forecast: &Forecast,
    ) -> Decisions {
        DecisionEngine::default().decide(
            state,
            current,
            open,
            setpoints(cool),
            &overridden.iter().copied().collect(),
            forecast,
            now(),
        )
    }

    #[test]
    fn test_close_beats_sunset_and_safe_open() {
        // Sunset within the hour and the open trajectory is safe, but the current
        // one overheats.
        let decisions = decide(
            &state(70.0, 60.0),
            &flat(70.0, 85.0),
            &flat(70.0, 60.0),
            80.0,
            &[],
            &forecast(Some(1)),
        );
        assert_eq!(
            decisions.get(&Actuator::ShadesEast),
            Some(&Command::Shade(ShadePosition::Closed))
        );
        assert_eq!(
            decisions.get(&Actuator::ShadesWest),
            Some(&Command::Shade(ShadePosition::Closed))
        );
    }

    #[test]
    fn test_near_sunset_opens() {
        let decisions = decide(
            &state(78.0, 70.0),
            &flat(78.0, 79.0),
            &flat(78.0, 82.0),
            80.0,
            &[],
            &forecast(Some(1)),
        );
        assert_eq!(
            decisions.get(&Actuator::ShadesEast),
            Some(&Command::Shade(ShadePosition::Open))
        );
    }

    #[test]
    fn test_safe_to_open_requires_margin() {
        // Open trajectory is safe but indoor is only 2°F below the setpoint.
        let held = decide(
            &state(78.0, 70.0),
            &flat(78.0, 79.0),
            &flat(78.0, 79.5),
            80.0,
            &[],
            &forecast(None),
        );
        assert!(!held.contains_key(&Actuator::ShadesEast));
        assert!(!held.contains_key(&Actuator::ShadesWest));

        let opened = decide(
            &state(72.0, 70.0),
            &flat(72.0, 74.0),
            &flat(72.0, 79.5),
            80.0,
            &[],
            &forecast(None),
        );
        assert_eq!(
            opened.get(&Actuator::ShadesWest),
            Some(&Command::Shade(ShadePosition::Open))
        );
    }

    #[test]
    fn test_peak_beyond_horizon_is_ignored() {
        let mut current = flat(70.0, 75.0);
        for p in current.points.iter_mut().skip(200) {
            p.air_temp_f = 95.0;
        }
        let decisions = decide(
            &state(70.0, 60.0),
            &current,
            &flat(70.0, 75.0),
            80.0,
            &[],
            &forecast(None),
        );
        assert_eq!(
            decisions.get(&Actuator::ShadesEast),
            Some(&Command::Shade(ShadePosition::Open))
        );
    }

    #[rstest]
    #[case(85.0, 60.0, Some(true))]
    #[case(85.0, 83.0, Some(false))]
    #[case(76.0, 60.0, Some(false))]
    #[case(79.0, 60.0, None)]
    fn test_fan_rules(#[case] indoor: f64, #[case] outdoor: f64, #[case] expected: Option<bool>) {
        let decisions = decide(
            &state(indoor, outdoor),
            &flat(indoor, indoor),
            &flat(indoor, indoor),
            80.0,
            &[],
            &forecast(None),
        );
        assert_eq!(
            decisions.get(&Actuator::Fan).copied(),
            expected.map(Command::Fan)
        );
    }

    #[test]
    fn test_overridden_actuators_are_never_emitted() {
        let all = [
            Actuator::ShadesEast,
            Actuator::ShadesWest,
            Actuator::Fan,
            Actuator::Hvac,
        ];
        for mask in 0..16u8 {
            let overridden: Vec<_> = all
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, a)| *a)
                .collect();
            let decisions = decide(
                &state(85.0, 60.0),
                &flat(85.0, 90.0),
                &flat(85.0, 88.0),
                80.0,
                &overridden,
                &forecast(None),
            );
            for actuator in &overridden {
                assert!(!decisions.contains_key(actuator));
            }
            assert_eq!(decisions.len(), all.len() - overridden.len());
        }
    }

    #[test]
    fn test_hvac_heat_when_predicted_cold() {
        let decisions = decide(
            &state(58.0, 40.0),
            &flat(58.0, 50.0),
            &flat(58.0, 50.0),
            80.0,
            &[],
            &forecast(None),
        );
        assert_eq!(
            decisions.get(&Actuator::Hvac),
            Some(&Command::Hvac(HvacMode::Heat))
        );
    }

    #[test]
    fn test_hvac_cool_only_when_fans_cannot_help() {
        // Outdoor too warm for the fans: HVAC cools.
        let hot_outside = decide(
            &state(84.0, 82.0),
            &flat(84.0, 88.0),
            &flat(84.0, 90.0),
            80.0,
            &[],
            &forecast(None),
        );
        assert_eq!(hot_outside.get(&Actuator::Fan), Some(&Command::Fan(false)));
        assert_eq!(
            hot_outside.get(&Actuator::Hvac),
            Some(&Command::Hvac(HvacMode::Cool))
        );

        // Cool outside: fans run, HVAC stays off.
        let cool_outside = decide(
            &state(84.0, 60.0),
            &flat(84.0, 88.0),
            &flat(84.0, 90.0),
            80.0,
            &[],
            &forecast(None),
        );
        assert_eq!(cool_outside.get(&Actuator::Fan), Some(&Command::Fan(true)));
        assert_eq!(
            cool_outside.get(&Actuator::Hvac),
            Some(&Command::Hvac(HvacMode::Off))
        );
    }

    #[test]
    fn test_hvac_cool_blocked_by_running_fan_under_override() {
        let mut s = state(84.0, 82.0);
        s.fan_on = true;
        let decisions = decide(
            &s,
            &flat(84.0, 88.0),
            &flat(84.0, 90.0),
            80.0,
            &[Actuator::Fan],
            &forecast(None),
        );
        assert_eq!(
            decisions.get(&Actuator::Hvac),
            Some(&Command::Hvac(HvacMode::Off))
        );
    }

    #[test]
    fn test_no_indoor_reading_only_shades() {
        let mut s = state(70.0, 60.0);
        s.indoor_temp_f = None;
        let decisions = decide(
            &s,
            &flat(70.0, 85.0),
            &flat(70.0, 85.0),
            80.0,
            &[],
            &forecast(None),
        );
        assert!(!decisions.contains_key(&Actuator::Fan));
        assert!(!decisions.contains_key(&Actuator::Hvac));
        assert_eq!(
            decisions.get(&Actuator::ShadesEast),
            Some(&Command::Shade(ShadePosition::Closed))
        );
    }

    #[test]
    fn test_minutes_to_sunset() {
        assert_eq!(minutes_to_sunset(&forecast(Some(3)), now()), Some(180.0));
        assert_eq!(minutes_to_sunset(&forecast(None), now()), None);
        // A transition already behind us does not count.
        assert_eq!(
            minutes_to_sunset(&forecast(Some(1)), now() + Duration::hours(2)),
            None
        );
    }
}
