use std::collections::HashSet;
use tracing::{info, warn};

use crate::domain::{apply_command, Actuator, GreenhouseState, Override};

/// Writes every parseable override into `state` and returns the actuators the
/// decision engine must leave alone.
///
/// Overrides with an unknown actuator or a malformed payload are logged and
/// skipped. A later override for the same actuator wins.
pub fn apply_overrides(state: &mut GreenhouseState, overrides: &[Override]) -> HashSet<Actuator> {
    let mut overridden = HashSet::new();
    for entry in overrides {
        match entry.command() {
            Ok((actuator, command)) => {
                apply_command(state, actuator, command);
                overridden.insert(actuator);
                info!(
                    actuator = %actuator,
                    source = %entry.source,
                    expires_at = %entry.expires_at,
                    "manual override active"
                );
            }
            Err(e) => warn!(error = %e, "ignoring override"),
        }
    }
    overridden
}
