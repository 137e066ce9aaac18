//! Shelly devices: the H&T indoor sensor, the Plus 1 PM exhaust fan relay and the
//! 3EM power meter.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use super::{names, DeviceError, IndoorSensor, PowerMeter, PushCache, Switch};
use crate::domain::{IndoorReading, PhaseReading, PowerReading, SwitchReading};

/// Credentials for the Shelly Cloud status endpoint.
#[derive(Debug, Clone)]
pub struct CloudCredentials {
    pub server: String,
    pub auth_key: String,
}

/// H&T Gen3. Uses pushed readings while they are fresh, the cloud API otherwise.
pub struct ShellyHt {
    client: Client,
    device_id: String,
    cache: Arc<PushCache>,
    cloud: Option<CloudCredentials>,
}

impl ShellyHt {
    pub fn new(
        client: Client,
        device_id: impl Into<String>,
        cache: Arc<PushCache>,
        cloud: Option<CloudCredentials>,
    ) -> Self {
        Self {
            client,
            device_id: device_id.into(),
            cache,
            cloud,
        }
    }

    async fn read_cloud(&self) -> Result<IndoorReading> {
        let cloud = self
            .cloud
            .as_ref()
            .ok_or(DeviceError::NotConfigured("Shelly Cloud credentials"))?;

        let resp = self
            .client
            .post(format!("{}/device/status", cloud.server.trim_end_matches('/')))
            .form(&[("id", self.device_id.as_str()), ("auth_key", cloud.auth_key.as_str())])
            .send()
            .await
            .context("Shelly Cloud request failed")?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DeviceError::Http {
                device: "shelly_cloud",
                status: status.as_u16(),
            }
            .into());
        }

        let body: CloudResponse = resp.json().await.context("Shelly Cloud parse failed")?;
        if !body.isok {
            return Err(DeviceError::Rejected {
                device: "shelly_cloud",
                reason: "isok=false".to_string(),
            }
            .into());
        }
        let status = body.data.map(|d| d.device_status).unwrap_or_default();

        let reading = IndoorReading {
            temp_f: status.temperature.and_then(|t| t.t_f).map(|t| (t * 10.0).round() / 10.0),
            humidity: status.humidity.and_then(|h| h.rh),
            battery_percent: status.devicepower.and_then(|p| p.battery).and_then(|b| b.percent),
        };
        info!(temp_f = ?reading.temp_f, humidity = ?reading.humidity, "cloud indoor reading");
        Ok(reading)
    }
}

#[async_trait]
impl IndoorSensor for ShellyHt {
    async fn read(&self) -> Result<IndoorReading> {
        if let Some(reading) = self.cache.fresh_reading(Utc::now()) {
            return Ok(reading);
        }
        self.read_cloud().await
    }
}

#[derive(Debug, Deserialize)]
struct CloudResponse {
    isok: bool,
    data: Option<CloudData>,
}

#[derive(Debug, Deserialize)]
struct CloudData {
    #[serde(default)]
    device_status: CloudDeviceStatus,
}

#[derive(Debug, Default, Deserialize)]
struct CloudDeviceStatus {
    #[serde(rename = "temperature:0")]
    temperature: Option<CloudTemperature>,
    #[serde(rename = "humidity:0")]
    humidity: Option<CloudHumidity>,
    #[serde(rename = "devicepower:0")]
    devicepower: Option<CloudDevicePower>,
}

#[derive(Debug, Deserialize)]
struct CloudTemperature {
    #[serde(rename = "tF")]
    t_f: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CloudHumidity {
    rh: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CloudDevicePower {
    battery: Option<CloudBattery>,
}

#[derive(Debug, Deserialize)]
struct CloudBattery {
    percent: Option<f64>,
}

/// Plus 1 PM relay over the local Gen2 RPC API.
pub struct ShellyRelay {
    client: Client,
    base_url: String,
    name: String,
}

impl ShellyRelay {
    /// `base_url` is the device root, e.g. `http://192.168.2.104`.
    pub fn new(client: Client, base_url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            name: name.into(),
        }
    }

    async fn rpc(&self, method: &str, params: &[(&str, &str)]) -> Result<reqwest::Response> {
        let resp = self
            .client
            .get(format!("{}/rpc/{}", self.base_url, method))
            .query(params)
            .send()
            .await
            .with_context(|| format!("{} {} failed", self.name, method))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DeviceError::Http {
                device: names::EXHAUST_FAN,
                status: status.as_u16(),
            }
            .into());
        }
        Ok(resp)
    }
}

#[derive(Debug, Deserialize)]
struct SwitchStatus {
    #[serde(default)]
    output: bool,
}

#[async_trait]
impl Switch for ShellyRelay {
    async fn read(&self) -> Result<SwitchReading> {
        let status: SwitchStatus = self
            .rpc("Switch.GetStatus", &[("id", "0")])
            .await?
            .json()
            .await
            .context("relay status parse failed")?;
        Ok(SwitchReading { on: status.output })
    }

    async fn turn_on(&self) -> Result<()> {
        self.rpc("Switch.Set", &[("id", "0"), ("on", "true")]).await?;
        info!(device = %self.name, "turned on");
        Ok(())
    }

    async fn turn_off(&self) -> Result<()> {
        self.rpc("Switch.Set", &[("id", "0"), ("on", "false")]).await?;
        info!(device = %self.name, "turned off");
        Ok(())
    }
}

/// 3EM meter over the Gen1 status endpoint. Phases A and B are the first two
/// channels; the third is unused on a split-phase service.
pub struct Shelly3Em {
    client: Client,
    base_url: String,
}

impl Shelly3Em {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MeterStatus {
    emeters: Vec<EmeterChannel>,
    #[serde(default)]
    total_power: f64,
}

#[derive(Debug, Deserialize)]
struct EmeterChannel {
    #[serde(default)]
    is_valid: bool,
    power: f64,
    current: f64,
    voltage: f64,
    /// Cumulative energy in Wh.
    total: f64,
}

impl EmeterChannel {
    fn to_phase(&self) -> PhaseReading {
        if !self.is_valid {
            return PhaseReading::default();
        }
        PhaseReading {
            power_kw: Some(self.power / 1000.0),
            current_a: Some(self.current),
            voltage_v: Some(self.voltage),
            total_kwh: Some(self.total / 1000.0),
        }
    }
}

#[async_trait]
impl PowerMeter for Shelly3Em {
    async fn read(&self) -> Result<PowerReading> {
        let resp = self
            .client
            .get(format!("{}/status", self.base_url))
            .send()
            .await
            .context("3EM status request failed")?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DeviceError::Http {
                device: names::POWER_METER,
                status: status.as_u16(),
            }
            .into());
        }
        let body: MeterStatus = resp.json().await.context("3EM status parse failed")?;
        let [a, b, ..] = body.emeters.as_slice() else {
            return Err(DeviceError::MissingField {
                device: names::POWER_METER,
                field: "emeters[0..2]",
            }
            .into());
        };
        Ok(PowerReading {
            phase_a: a.to_phase(),
            phase_b: b.to_phase(),
            total_power_kw: body.total_power / 1000.0,
        })
    }
}
