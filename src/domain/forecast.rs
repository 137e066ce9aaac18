use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumIter, IntoEnumIterator};

/// Correctable forecast channel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Channel {
    TemperatureF,
    Humidity,
    SolarIrradianceWm2,
    WindSpeedMph,
}

impl Channel {
    /// Channels that are physically bounded below by zero.
    pub fn non_negative(self) -> bool {
        !matches!(self, Channel::TemperatureF)
    }
}

/// Hourly forecast. All arrays are aligned by index with `time`, which holds naive
/// UTC hour stamps.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Forecast {
    pub time: Vec<NaiveDateTime>,
    pub temperature_f: Vec<f64>,
    pub humidity: Vec<f64>,
    pub solar_irradiance_wm2: Vec<f64>,
    pub wind_speed_mph: Vec<f64>,
    pub is_day: Vec<bool>,
}

impl Forecast {
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty() || self.temperature_f.is_empty()
    }

    pub fn channel(&self, channel: Channel) -> &[f64] {
        match channel {
            Channel::TemperatureF => &self.temperature_f,
            Channel::Humidity => &self.humidity,
            Channel::SolarIrradianceWm2 => &self.solar_irradiance_wm2,
            Channel::WindSpeedMph => &self.wind_speed_mph,
        }
    }

    pub fn channel_mut(&mut self, channel: Channel) -> &mut Vec<f64> {
        match channel {
            Channel::TemperatureF => &mut self.temperature_f,
            Channel::Humidity => &mut self.humidity,
            Channel::SolarIrradianceWm2 => &mut self.solar_irradiance_wm2,
            Channel::WindSpeedMph => &mut self.wind_speed_mph,
        }
    }

    /// Index of the entry stamped with the hour containing `now`.
    pub fn current_hour_index(&self, now: DateTime<Utc>) -> Option<usize> {
        let hour = now
            .naive_utc()
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))?;
        self.time.iter().position(|t| *t == hour)
    }
}

/// Outdoor conditions measured by the local station. Any channel may be missing.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StationReading {
    pub outdoor_temp_f: Option<f64>,
    pub outdoor_humidity: Option<f64>,
    pub solar_irradiance_wm2: Option<f64>,
    pub wind_speed_mph: Option<f64>,
}

impl StationReading {
    pub fn value(&self, channel: Channel) -> Option<f64> {
        match channel {
            Channel::TemperatureF => self.outdoor_temp_f,
            Channel::Humidity => self.outdoor_humidity,
            Channel::SolarIrradianceWm2 => self.solar_irradiance_wm2,
            Channel::WindSpeedMph => self.wind_speed_mph,
        }
    }

    pub fn is_empty(&self) -> bool {
        Channel::iter().all(|c| self.value(c).is_none())
    }
}

/// Forecast after bias correction, together with the deltas that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectedForecast {
    pub forecast: Forecast,
    pub deltas: BTreeMap<Channel, f64>,
    /// Current-hour index the deltas were anchored at; `None` when uncorrected.
    pub anchor_index: Option<usize>,
}

impl CorrectedForecast {
    pub fn uncorrected(forecast: Forecast) -> Self {
        Self {
            forecast,
            deltas: BTreeMap::new(),
            anchor_index: None,
        }
    }

    pub fn is_corrected(&self) -> bool {
        self.anchor_index.is_some()
    }
}
