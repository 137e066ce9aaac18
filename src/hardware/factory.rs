use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use super::ambient::AmbientWeatherStation;
use super::kasa::{KasaSwitch, KASA_PORT};
use super::motion::{MotionGateway, MOTION_PORT};
use super::shelly::{CloudCredentials, Shelly3Em, ShellyHt, ShellyRelay};
use super::{http_client, DeviceError, Devices, PushCache, ShadeGroup, ShadeGroups};
use crate::config::Config;
use crate::domain::ShadePosition;
use crate::forecast::OpenMeteoClient;

/// Hardware mode configuration
///
/// Simulated devices are only compiled in with the `sim` feature, so a build
/// without it cannot silently run against a virtual greenhouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareMode {
    /// Virtual greenhouse driven by synthetic weather
    #[cfg(feature = "sim")]
    Simulated,
    /// Real devices on the LAN and cloud APIs
    Network,
}

/// Factory for the device set
pub struct DeviceFactory<'a> {
    config: &'a Config,
    push_cache: Arc<PushCache>,
}

impl<'a> DeviceFactory<'a> {
    pub fn new(config: &'a Config, push_cache: Arc<PushCache>) -> Self {
        Self { config, push_cache }
    }

    pub fn create(&self) -> Result<Devices> {
        match self.config.controller.hardware_mode {
            #[cfg(feature = "sim")]
            HardwareMode::Simulated => Ok(self.create_simulated()),
            HardwareMode::Network => self.create_network(),
        }
    }

    #[cfg(feature = "sim")]
    fn create_simulated(&self) -> Devices {
        use super::simulated::{devices, SimulatedGreenhouse, SyntheticWeather};

        let weather = SyntheticWeather {
            longitude_deg: self.config.location.longitude,
            ..SyntheticWeather::default()
        };
        let greenhouse = Arc::new(SimulatedGreenhouse::new(
            self.config.model.params.clone(),
            weather,
            chrono::Utc::now(),
        ));
        info!("using simulated greenhouse");
        devices(greenhouse, self.config.devices.forecast_hours.unwrap_or(48))
    }

    fn create_network(&self) -> Result<Devices> {
        let c = &self.config.controller;
        let d = &self.config.devices;
        let secrets = &self.config.secrets;
        let client = http_client(c.http_connect_timeout(), c.http_read_timeout())?;

        let cloud = match (&secrets.shelly_cloud_server, &secrets.shelly_cloud_auth_key) {
            (Some(server), Some(auth_key)) => Some(CloudCredentials {
                server: server.clone(),
                auth_key: auth_key.clone(),
            }),
            _ => {
                warn!("Shelly Cloud credentials not set, indoor sensor relies on pushed data only");
                None
            }
        };

        let api_key = secrets
            .ambient_weather_api_key
            .clone()
            .context("AMBIENT_WEATHER_API_KEY must be set")?;
        let app_key = secrets
            .ambient_weather_app_key
            .clone()
            .context("AMBIENT_WEATHER_APP_KEY must be set")?;

        let shades: Arc<dyn ShadeGroups> =
            match (&d.shades_gateway_host, &secrets.motion_gateway_key) {
                (Some(host), Some(key)) => Arc::new(MotionGateway::new(
                    format!("{host}:{MOTION_PORT}"),
                    key.clone(),
                    &d.shades_east_macs,
                    &d.shades_west_macs,
                    c.http_read_timeout(),
                )?),
                _ => {
                    warn!("shade gateway host or MOTION_GATEWAY_KEY not set, shade commands will fail");
                    Arc::new(UnavailableShades)
                }
            };

        let mut forecast = OpenMeteoClient::new(
            d.open_meteo_base_url.clone(),
            self.config.location.latitude,
            self.config.location.longitude,
            c.http_read_timeout(),
        )?;
        if let Some(hours) = d.forecast_hours {
            forecast = forecast.with_forecast_days(hours.div_ceil(24) as u32);
        }

        Ok(Devices {
            indoor: Arc::new(ShellyHt::new(
                client.clone(),
                d.shelly_ht_device_id.clone(),
                self.push_cache.clone(),
                cloud,
            )),
            station: Arc::new(AmbientWeatherStation::new(
                client.clone(),
                d.ambient_weather_base_url.clone(),
                api_key,
                app_key,
            )),
            forecast: Arc::new(forecast),
            exhaust_fan: Arc::new(ShellyRelay::new(
                client.clone(),
                format!("http://{}", d.shelly_relay_host),
                "exhaust_fan",
            )),
            circ_fans: Arc::new(KasaSwitch::new(
                format!("{}:{}", d.kasa_circ_fans_host, KASA_PORT),
                c.http_read_timeout(),
                "circ_fans",
            )),
            shades,
            power_meter: Arc::new(Shelly3Em::new(client, format!("http://{}", d.shelly_3em_host))),
        })
    }
}

/// Stand-in when no shade gateway is configured. Every call fails, so the shade
/// device health alerts instead of the controller assuming the shades moved.
pub struct UnavailableShades;

#[async_trait]
impl ShadeGroups for UnavailableShades {
    async fn open(&self, _group: ShadeGroup) -> Result<()> {
        Err(DeviceError::NotConfigured("shade gateway").into())
    }

    async fn close(&self, _group: ShadeGroup) -> Result<()> {
        Err(DeviceError::NotConfigured("shade gateway").into())
    }

    async fn read(&self) -> Result<(Option<ShadePosition>, Option<ShadePosition>)> {
        Err(DeviceError::NotConfigured("shade gateway").into())
    }
}
