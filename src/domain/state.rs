use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Position of a shade group. Groups are commanded as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ShadePosition {
    Open,
    Closed,
}

impl ShadePosition {
    /// Fraction of solar gain blocked on the roof face: 1.0 closed, 0.0 open.
    pub fn shading_factor(self) -> f64 {
        match self {
            ShadePosition::Open => 0.0,
            ShadePosition::Closed => 1.0,
        }
    }
}

impl Default for ShadePosition {
    fn default() -> Self {
        ShadePosition::Open
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HvacMode {
    Off,
    Heat,
    Cool,
    Auto,
}

impl Default for HvacMode {
    fn default() -> Self {
        HvacMode::Off
    }
}

/// Commandable part of the greenhouse, as last committed or as hypothesised for a
/// simulator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActuatorState {
    pub shades_east: ShadePosition,
    pub shades_west: ShadePosition,
    pub fan_on: bool,
    pub hvac_mode: HvacMode,
}

impl ActuatorState {
    pub fn with_shades_open(self) -> Self {
        Self {
            shades_east: ShadePosition::Open,
            shades_west: ShadePosition::Open,
            ..self
        }
    }
}

/// Working record of one control cycle.
///
/// Created fresh every cycle, seeded with the actuator state committed by the
/// previous cycle, then filled from sensors, overrides and executed commands before
/// being persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GreenhouseState {
    pub timestamp: DateTime<Utc>,
    pub indoor_temp_f: Option<f64>,
    pub indoor_humidity: Option<f64>,
    pub outdoor_temp_f: Option<f64>,
    pub outdoor_humidity: Option<f64>,
    pub solar_irradiance_wm2: Option<f64>,
    pub wind_speed_mph: Option<f64>,
    pub shades_east: ShadePosition,
    pub shades_west: ShadePosition,
    pub fan_on: bool,
    pub circ_fans_on: bool,
    pub hvac_mode: HvacMode,
    pub hvac_setpoint_f: Option<f64>,
}

impl GreenhouseState {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            indoor_temp_f: None,
            indoor_humidity: None,
            outdoor_temp_f: None,
            outdoor_humidity: None,
            solar_irradiance_wm2: None,
            wind_speed_mph: None,
            shades_east: ShadePosition::Open,
            shades_west: ShadePosition::Open,
            fan_on: false,
            circ_fans_on: false,
            hvac_mode: HvacMode::Off,
            hvac_setpoint_f: None,
        }
    }

    pub fn actuators(&self) -> ActuatorState {
        ActuatorState {
            shades_east: self.shades_east,
            shades_west: self.shades_west,
            fan_on: self.fan_on,
            hvac_mode: self.hvac_mode,
        }
    }

    pub fn restore_actuators(&mut self, committed: ActuatorState) {
        self.shades_east = committed.shades_east;
        self.shades_west = committed.shades_west;
        self.fan_on = committed.fan_on;
        self.hvac_mode = committed.hvac_mode;
    }
}
