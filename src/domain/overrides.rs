use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

use super::{GreenhouseState, HvacMode, ShadePosition};

/// Controllable actuator, named the way the dashboard and the store name it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Actuator {
    ShadesEast,
    ShadesWest,
    Fan,
    Hvac,
}

/// Desired state for one actuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Shade(ShadePosition),
    Fan(bool),
    Hvac(HvacMode),
}

/// Per-actuator output of the decision engine. Actuators without an entry hold
/// their current state.
pub type Decisions = BTreeMap<Actuator, Command>;

#[derive(Debug, Error, PartialEq)]
pub enum OverrideError {
    #[error("unknown actuator in override: {0}")]
    UnknownActuator(String),
    #[error("malformed override payload for {actuator}: {reason}")]
    MalformedCommand { actuator: Actuator, reason: String },
}

/// Time-bounded manual command created by the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Override {
    pub actuator: String,
    pub command: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_source() -> String {
    "dashboard".to_string()
}

impl Override {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now && self.cancelled_at.is_none()
    }

    pub fn actuator(&self) -> Result<Actuator, OverrideError> {
        self.actuator
            .parse()
            .map_err(|_| OverrideError::UnknownActuator(self.actuator.clone()))
    }

    /// Typed command carried by the payload:
    /// shades `{"position": "open"|"closed"}`, fan `{"on": bool}`,
    /// hvac `{"mode": "off"|"heat"|"cool"|"auto"}`.
    pub fn command(&self) -> Result<(Actuator, Command), OverrideError> {
        let actuator = self.actuator()?;
        let malformed = |reason: &str| OverrideError::MalformedCommand {
            actuator,
            reason: reason.to_string(),
        };

        let command = match actuator {
            Actuator::ShadesEast | Actuator::ShadesWest => {
                let position = self
                    .command
                    .get("position")
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed("missing string field `position`"))?;
                Command::Shade(
                    position
                        .parse()
                        .map_err(|_| malformed("position must be open or closed"))?,
                )
            }
            Actuator::Fan => Command::Fan(
                self.command
                    .get("on")
                    .and_then(Value::as_bool)
                    .ok_or_else(|| malformed("missing boolean field `on`"))?,
            ),
            Actuator::Hvac => {
                let mode = self
                    .command
                    .get("mode")
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed("missing string field `mode`"))?;
                Command::Hvac(mode.parse().map_err(|_| malformed("unknown hvac mode"))?)
            }
        };
        Ok((actuator, command))
    }
}

/// Writes a command into the matching state field. Mismatched pairs are ignored.
pub fn apply_command(state: &mut GreenhouseState, actuator: Actuator, command: Command) {
    match (actuator, command) {
        (Actuator::ShadesEast, Command::Shade(p)) => state.shades_east = p,
        (Actuator::ShadesWest, Command::Shade(p)) => state.shades_west = p,
        (Actuator::Fan, Command::Fan(on)) => state.fan_on = on,
        (Actuator::Hvac, Command::Hvac(mode)) => state.hvac_mode = mode,
        _ => {}
    }
}

/// Heat and cool thresholds in °F.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Setpoints {
    pub heat_f: f64,
    pub cool_f: f64,
}

impl Default for Setpoints {
    fn default() -> Self {
        Self {
            heat_f: 60.0,
            cool_f: 80.0,
        }
    }
}
