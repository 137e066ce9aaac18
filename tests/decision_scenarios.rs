//! Decision scenarios across the simulator and the rule engine.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashSet;

use greenhouse_controller::controller::DecisionEngine;
use greenhouse_controller::domain::{
    Actuator, Command, Forecast, GreenhouseState, HvacMode, Setpoints, ShadePosition,
};
use greenhouse_controller::simulation::{simulate, ThermalParameters, Trajectory, TrajectoryPoint};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 7, 14, 17, 0, 0).unwrap()
}

/// Hot, sunny afternoon with sunset three hours out.
fn afternoon_forecast() -> Forecast {
    let start = now().naive_utc();
    let n = 12;
    Forecast {
        time: (0..n).map(|i| start + Duration::hours(i as i64)).collect(),
        temperature_f: vec![90.0; n],
        humidity: vec![30.0; n],
        solar_irradiance_wm2: (0..n).map(|i| if i < 3 { 800.0 } else { 0.0 }).collect(),
        wind_speed_mph: vec![3.0; n],
        is_day: (0..n).map(|i| i < 3).collect(),
    }
}

fn indoor(temp_f: f64) -> GreenhouseState {
    let mut state = GreenhouseState::new(now());
    state.indoor_temp_f = Some(temp_f);
    state.outdoor_temp_f = Some(90.0);
    state
}

fn setpoints() -> Setpoints {
    Setpoints {
        heat_f: 60.0,
        cool_f: 82.0,
    }
}

/// 78°F now, rising linearly to 86°F over two hours, flat afterwards.
fn rising_trajectory() -> Trajectory {
    let template = simulate(
        &indoor(78.0),
        &ThermalParameters::default(),
        &afternoon_forecast(),
        indoor(78.0).actuators(),
        Duration::hours(6),
        Duration::seconds(60),
        now(),
    )
    .unwrap();
    let points = (0..=360)
        .map(|i| {
            let air = 78.0 + 8.0 * (f64::from(i.min(120)) / 120.0);
            TrajectoryPoint {
                time: now() + Duration::minutes(i64::from(i)),
                air_temp_f: air,
                mass_temp_f: 78.0,
            }
        })
        .collect();
    Trajectory {
        points,
        ..template
    }
}

#[test]
fn test_rising_afternoon_closes_both_shades() {
    let state = indoor(78.0);
    let current = rising_trajectory();
    let decisions = DecisionEngine::default().decide(
        &state,
        &current,
        &current,
        setpoints(),
        &HashSet::new(),
        &afternoon_forecast(),
        now(),
    );

    for shade in [Actuator::ShadesEast, Actuator::ShadesWest] {
        assert_eq!(
            decisions.get(&shade),
            Some(&Command::Shade(ShadePosition::Closed))
        );
    }
}

#[test]
fn test_simulated_hot_afternoon_closes_shades_and_cools() {
    let state = indoor(78.0);
    let forecast = afternoon_forecast();
    let run = |actuators| {
        simulate(
            &state,
            &ThermalParameters::default(),
            &forecast,
            actuators,
            Duration::hours(6),
            Duration::seconds(60),
            now(),
        )
        .unwrap()
    };
    let current = run(state.actuators());
    let shades_open = run(state.actuators().with_shades_open());
    assert!(current.predicted_max(current.steps_in(120)).unwrap() > 82.0);

    let decisions = DecisionEngine::default().decide(
        &state,
        &current,
        &shades_open,
        setpoints(),
        &HashSet::new(),
        &forecast,
        now(),
    );

    assert_eq!(
        decisions.get(&Actuator::ShadesEast),
        Some(&Command::Shade(ShadePosition::Closed))
    );
    // 90°F outside: the fans cannot help, so HVAC is asked to cool.
    assert_eq!(decisions.get(&Actuator::Fan), Some(&Command::Fan(false)));
    assert_eq!(
        decisions.get(&Actuator::Hvac),
        Some(&Command::Hvac(HvacMode::Cool))
    );
}

#[test]
fn test_overridden_shade_left_alone() {
    let state = indoor(78.0);
    let current = rising_trajectory();
    let overridden = HashSet::from([Actuator::ShadesWest]);
    let decisions = DecisionEngine::default().decide(
        &state,
        &current,
        &current,
        setpoints(),
        &overridden,
        &afternoon_forecast(),
        now(),
    );

    assert!(!decisions.contains_key(&Actuator::ShadesWest));
    assert_eq!(
        decisions.get(&Actuator::ShadesEast),
        Some(&Command::Shade(ShadePosition::Closed))
    );
}
