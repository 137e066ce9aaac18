use anyhow::Result;
use tracing::{error, info};

use crate::domain::{Actuator, Command, Decisions, GreenhouseState, HvacMode};
use crate::hardware::{names, Devices, ShadeGroup};
use crate::resilience::HealthRegistry;

/// Sends the commands in `decisions` that differ from `state`.
///
/// The state field is updated only after the device accepts the command, so the
/// persisted state reflects what was actually commanded. Each actuator is handled
/// on its own; a failure is logged and recorded against the device's health and
/// the remaining actuators still run. HVAC decisions are logged, never sent.
pub async fn execute(
    decisions: &Decisions,
    state: &mut GreenhouseState,
    devices: &Devices,
    registry: &HealthRegistry,
) {
    for (&actuator, &desired) in decisions {
        let (device, outcome) = match (actuator, desired) {
            (Actuator::ShadesEast, Command::Shade(position)) => {
                if position == state.shades_east {
                    continue;
                }
                let outcome = devices.shades.set(ShadeGroup::East, position).await;
                if outcome.is_ok() {
                    state.shades_east = position;
                }
                (names::SHADES, outcome)
            }
            (Actuator::ShadesWest, Command::Shade(position)) => {
                if position == state.shades_west {
                    continue;
                }
                let outcome = devices.shades.set(ShadeGroup::West, position).await;
                if outcome.is_ok() {
                    state.shades_west = position;
                }
                (names::SHADES, outcome)
            }
            (Actuator::Fan, Command::Fan(on)) => {
                if on == state.fan_on {
                    continue;
                }
                let outcome = devices.exhaust_fan.set(on).await;
                if outcome.is_ok() {
                    state.fan_on = on;
                }
                (names::EXHAUST_FAN, outcome)
            }
            (Actuator::Hvac, Command::Hvac(mode)) => {
                if mode != HvacMode::Off {
                    info!(actuator = %actuator, mode = %mode, "hvac decision not executed, no actuator");
                }
                continue;
            }
            (actuator, command) => {
                error!(actuator = %actuator, ?command, "command does not fit actuator");
                continue;
            }
        };

        report(registry, actuator, desired, device, outcome);
    }
}

fn report(registry: &HealthRegistry, actuator: Actuator, desired: Command, device: &str, outcome: Result<()>) {
    match outcome {
        Ok(()) => {
            registry.record_success(device, None);
            info!(actuator = %actuator, command = ?desired, "command sent");
        }
        Err(e) => {
            registry.record_failure(device);
            error!(actuator = %actuator, device, error = %e, "command failed");
        }
    }
}
