use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{names, DeviceError, WeatherStation};
use crate::domain::StationReading;

/// AmbientWeather.net REST client for the local outdoor station.
pub struct AmbientWeatherStation {
    client: Client,
    base_url: String,
    api_key: String,
    application_key: String,
}

impl AmbientWeatherStation {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        application_key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            application_key: application_key.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AmbientDevice {
    #[serde(rename = "lastData", default)]
    last_data: LastData,
}

#[derive(Debug, Default, Deserialize)]
struct LastData {
    tempf: Option<f64>,
    humidity: Option<f64>,
    solarradiation: Option<f64>,
    windspeedmph: Option<f64>,
}

#[async_trait]
impl WeatherStation for AmbientWeatherStation {
    async fn read(&self) -> Result<StationReading> {
        let resp = self
            .client
            .get(&self.base_url)
            .query(&[
                ("apiKey", self.api_key.as_str()),
                ("applicationKey", self.application_key.as_str()),
            ])
            .send()
            .await
            .context("AmbientWeather request failed")?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DeviceError::Http {
                device: names::STATION,
                status: status.as_u16(),
            }
            .into());
        }

        let devices: Vec<AmbientDevice> =
            resp.json().await.context("AmbientWeather parse failed")?;
        // First station's most recent report
        let data = devices
            .into_iter()
            .next()
            .ok_or(DeviceError::MissingField {
                device: names::STATION,
                field: "devices[0]",
            })?
            .last_data;

        debug!(tempf = ?data.tempf, solar = ?data.solarradiation, "station reading");
        Ok(StationReading {
            outdoor_temp_f: data.tempf,
            outdoor_humidity: data.humidity,
            solar_irradiance_wm2: data.solarradiation,
            wind_speed_mph: data.windspeedmph,
        })
    }
}
