use chrono::{DateTime, Utc};
use strum::IntoEnumIterator;
use tracing::{info, warn};

use crate::domain::{Channel, CorrectedForecast, Forecast, StationReading};

/// Flat-delta bias correction of a public forecast against the local station.
///
/// For every channel present in both the station reading and the forecast's
/// current hour, the difference `station − forecast` is added to every entry from
/// the current hour onward. Humidity, solar and wind are clamped at zero after the
/// shift. Without a station reading, or when the current hour is not in the
/// forecast, the raw forecast is returned unchanged.
pub fn correct(
    raw: &Forecast,
    station: Option<&StationReading>,
    now: DateTime<Utc>,
) -> CorrectedForecast {
    let Some(station) = station else {
        info!("no station data for bias correction, using raw forecast");
        return CorrectedForecast::uncorrected(raw.clone());
    };

    let Some(idx) = raw.current_hour_index(now) else {
        warn!(
            now = %now.format("%Y-%m-%dT%H:00"),
            "current hour not found in forecast times, skipping bias correction"
        );
        return CorrectedForecast::uncorrected(raw.clone());
    };

    let mut corrected = CorrectedForecast {
        forecast: raw.clone(),
        deltas: Default::default(),
        anchor_index: Some(idx),
    };

    for channel in Channel::iter() {
        let (Some(actual), Some(predicted)) =
            (station.value(channel), raw.channel(channel).get(idx).copied())
        else {
            continue;
        };
        let delta = actual - predicted;
        for value in corrected.forecast.channel_mut(channel).iter_mut().skip(idx) {
            *value += delta;
            if channel.non_negative() {
                *value = value.max(0.0);
            }
        }
        corrected.deltas.insert(channel, delta);
    }

    info!(deltas = ?corrected.deltas, anchor_index = idx, "bias correction applied");
    corrected
}

/// Current-hour forecast values, used in place of the station when it is down.
pub fn current_conditions(forecast: &Forecast, now: DateTime<Utc>) -> Option<StationReading> {
    let Some(idx) = forecast.current_hour_index(now) else {
        warn!("current hour not found in forecast for fallback conditions");
        return None;
    };
    Some(StationReading {
        outdoor_temp_f: forecast.temperature_f.get(idx).copied(),
        outdoor_humidity: forecast.humidity.get(idx).copied(),
        solar_irradiance_wm2: forecast.solar_irradiance_wm2.get(idx).copied(),
        wind_speed_mph: forecast.wind_speed_mph.get(idx).copied(),
    })
}
