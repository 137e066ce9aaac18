use serde::{Deserialize, Serialize};

/// Indoor air reading from the battery-powered temperature/humidity sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndoorReading {
    pub temp_f: Option<f64>,
    pub humidity: Option<f64>,
    pub battery_percent: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchReading {
    pub on: bool,
}

/// One metered phase. All fields absent when the meter flags the channel invalid.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PhaseReading {
    pub power_kw: Option<f64>,
    pub current_a: Option<f64>,
    pub voltage_v: Option<f64>,
    pub total_kwh: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PowerReading {
    pub phase_a: PhaseReading,
    pub phase_b: PhaseReading,
    pub total_power_kw: f64,
}

/// Energy used per phase since the previous reading.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EnergyDelta {
    pub phase_a_kwh: Option<f64>,
    pub phase_b_kwh: Option<f64>,
}

impl EnergyDelta {
    /// Difference of cumulative totals. A negative difference means the meter was
    /// reset, so the phase is left empty.
    pub fn between(previous: &PowerReading, current: &PowerReading) -> Self {
        fn delta(prev: Option<f64>, cur: Option<f64>) -> Option<f64> {
            let d = cur? - prev?;
            (d >= 0.0).then_some(d)
        }
        Self {
            phase_a_kwh: delta(previous.phase_a.total_kwh, current.phase_a.total_kwh),
            phase_b_kwh: delta(previous.phase_b.total_kwh, current.phase_b.total_kwh),
        }
    }
}
