//! Hourly weather forecast from Open-Meteo.
//!
//! Temperatures are requested in °F and wind in mph so the forecast is in the same
//! units as the local station. Global horizontal irradiance is the sum of direct and
//! diffuse radiation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use super::ForecastSource;
use crate::domain::Forecast;

const HOURLY_FIELDS: &str =
    "temperature_2m,relative_humidity_2m,direct_radiation,diffuse_radiation,wind_speed_10m,weather_code,is_day";

/// Open-Meteo API client
pub struct OpenMeteoClient {
    client: Client,
    base_url: String,
    latitude: f64,
    longitude: f64,
    forecast_days: u32,
}

impl OpenMeteoClient {
    pub fn new(base_url: String, latitude: f64, longitude: f64, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url,
            latitude,
            longitude,
            forecast_days: 2,
        })
    }

    pub fn with_forecast_days(mut self, days: u32) -> Self {
        self.forecast_days = days.max(1);
        self
    }

    fn parse(response: OpenMeteoResponse) -> Result<Forecast> {
        let hourly = response.hourly;
        let time = hourly
            .time
            .iter()
            .map(|t| {
                NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M")
                    .with_context(|| format!("bad forecast timestamp {t}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let solar = hourly
            .direct_radiation
            .iter()
            .zip(&hourly.diffuse_radiation)
            .map(|(direct, diffuse)| Some(direct.unwrap_or(0.0) + diffuse.unwrap_or(0.0)))
            .collect::<Vec<_>>();

        Ok(Forecast {
            temperature_f: fill_gaps(&hourly.temperature_2m, 70.0),
            humidity: fill_gaps(&hourly.relative_humidity_2m, 50.0),
            solar_irradiance_wm2: fill_gaps(&solar, 0.0),
            wind_speed_mph: fill_gaps(&hourly.wind_speed_10m, 0.0),
            is_day: hourly
                .is_day
                .iter()
                .map(|d| d.unwrap_or(0) == 1)
                .collect(),
            time,
        })
    }
}

/// Replaces missing hours with the previous known value; leading gaps take the
/// first known value, an all-empty series takes `default`.
fn fill_gaps(values: &[Option<f64>], default: f64) -> Vec<f64> {
    let first = values.iter().flatten().next().copied().unwrap_or(default);
    let mut last = first;
    values
        .iter()
        .map(|v| {
            if let Some(v) = v {
                last = *v;
            }
            last
        })
        .collect()
}

#[async_trait]
impl ForecastSource for OpenMeteoClient {
    async fn fetch(&self) -> Result<Forecast> {
        debug!(url = %self.base_url, "fetching forecast from Open-Meteo");
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("latitude", self.latitude.to_string()),
                ("longitude", self.longitude.to_string()),
                ("hourly", HOURLY_FIELDS.to_string()),
                ("temperature_unit", "fahrenheit".to_string()),
                ("wind_speed_unit", "mph".to_string()),
                ("forecast_days", self.forecast_days.to_string()),
                ("timezone", "UTC".to_string()),
            ])
            .send()
            .await
            .context("Failed to send request to Open-Meteo")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Open-Meteo API error: {status}");
        }

        let body: OpenMeteoResponse = response
            .json()
            .await
            .context("Failed to parse Open-Meteo response")?;
        let forecast = Self::parse(body)?;
        info!(hours = forecast.len(), "fetched forecast from Open-Meteo");
        Ok(forecast)
    }
}

#[derive(Debug, Deserialize)]
struct OpenMeteoResponse {
    hourly: OpenMeteoHourly,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoHourly {
    time: Vec<String>,
    temperature_2m: Vec<Option<f64>>,
    relative_humidity_2m: Vec<Option<f64>>,
    direct_radiation: Vec<Option<f64>>,
    diffuse_radiation: Vec<Option<f64>>,
    wind_speed_10m: Vec<Option<f64>>,
    #[serde(default)]
    is_day: Vec<Option<u8>>,
}
