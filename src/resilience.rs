//! # Device Health and Resilient Reads
//!
//! Every external read goes through [`RetryExecutor::with_retry`]: one attempt, a
//! fixed delay, one more attempt, then the device's last known good value or the
//! caller's fallback. The outcome is recorded in a [`HealthRegistry`] shared by the
//! whole process, which also decides when a device has been failing long enough to
//! raise an alert.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Health bookkeeping for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceHealth {
    pub name: String,
    pub last_success: Option<DateTime<Utc>>,
    pub last_value: Option<Value>,
    pub consecutive_failures: u32,
    pub alert_sent: bool,
}

impl DeviceHealth {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last_success: None,
            last_value: None,
            consecutive_failures: 0,
            alert_sent: false,
        }
    }

    pub fn record_success_at(&mut self, value: Option<Value>, at: DateTime<Utc>) {
        self.last_success = Some(at);
        if value.is_some() {
            self.last_value = value;
        }
        self.consecutive_failures = 0;
        self.alert_sent = false;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
    }

    /// Hours since the last success; infinite if the device never succeeded.
    pub fn hours_since_success(&self, now: DateTime<Utc>) -> f64 {
        match self.last_success {
            Some(at) => (now - at).num_milliseconds() as f64 / 3_600_000.0,
            None => f64::INFINITY,
        }
    }

    /// Alert rule for one failure episode.
    ///
    /// A zero threshold alerts on the first failure; a nonzero one once the
    /// device has gone that many hours without success. Devices without a
    /// threshold never alert.
    pub fn should_alert(&self, threshold_hours: Option<f64>, now: DateTime<Utc>) -> bool {
        let Some(threshold) = threshold_hours else {
            return false;
        };
        if self.alert_sent {
            return false;
        }
        if threshold == 0.0 {
            return self.consecutive_failures > 0;
        }
        self.hours_since_success(now) >= threshold
    }
}

/// Process-wide registry of device health, constructed once at startup and shared.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    devices: Mutex<HashMap<String, DeviceHealth>>,
    thresholds: HashMap<String, f64>,
}

impl HealthRegistry {
    pub fn new(thresholds: HashMap<String, f64>) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            thresholds,
        }
    }

    pub fn get(&self, device: &str) -> DeviceHealth {
        self.devices
            .lock()
            .get(device)
            .cloned()
            .unwrap_or_else(|| DeviceHealth::new(device))
    }

    pub fn snapshot(&self) -> Vec<DeviceHealth> {
        let mut all: Vec<_> = self.devices.lock().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn record_success(&self, device: &str, value: Option<Value>) {
        self.devices
            .lock()
            .entry(device.to_string())
            .or_insert_with(|| DeviceHealth::new(device))
            .record_success_at(value, Utc::now());
    }

    pub fn record_failure(&self, device: &str) {
        self.devices
            .lock()
            .entry(device.to_string())
            .or_insert_with(|| DeviceHealth::new(device))
            .record_failure();
    }

    /// Last successful value of `device`, if one exists and has the requested shape.
    pub fn last_value<T: DeserializeOwned>(&self, device: &str) -> Option<T> {
        let value = self.devices.lock().get(device)?.last_value.clone()?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(device, error = %e, "stored value has unexpected shape");
                None
            }
        }
    }

    /// Devices that should raise an alert now. Devices never called are skipped.
    pub fn due_alerts(&self, now: DateTime<Utc>) -> Vec<DeviceHealth> {
        let mut due: Vec<_> = self
            .devices
            .lock()
            .values()
            .filter(|health| health.should_alert(self.threshold(&health.name), now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.name.cmp(&b.name));
        due
    }

    pub fn mark_alerted(&self, device: &str) {
        self.devices
            .lock()
            .entry(device.to_string())
            .or_insert_with(|| DeviceHealth::new(device))
            .alert_sent = true;
    }

    pub fn threshold(&self, device: &str) -> Option<f64> {
        self.thresholds.get(device).copied()
    }
}

/// Bounded retry with fallback around fallible device reads.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    registry: Arc<HealthRegistry>,
    retry_delay: Duration,
    attempt_timeout: Duration,
}

impl RetryExecutor {
    pub fn new(registry: Arc<HealthRegistry>, retry_delay: Duration, attempt_timeout: Duration) -> Self {
        Self {
            registry,
            retry_delay,
            attempt_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<HealthRegistry> {
        &self.registry
    }

    /// Calls `read` at most twice. Returns `(value, used_fallback)`.
    ///
    /// On success the value is stored as the device's last known good value. After
    /// two failures the last known good value is returned if there is one,
    /// otherwise `fallback`.
    pub async fn with_retry<T, F, Fut>(&self, mut read: F, fallback: T, device: &str) -> (T, bool)
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        for attempt in 1..=2 {
            let outcome = match tokio::time::timeout(self.attempt_timeout, read()).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("timed out after {:?}", self.attempt_timeout)),
            };

            match outcome {
                Ok(value) => {
                    let stored = serde_json::to_value(&value)
                        .map_err(|e| warn!(device, error = %e, "value not storable"))
                        .ok();
                    self.registry.record_success(device, stored);
                    return (value, false);
                }
                Err(e) if attempt == 1 => {
                    warn!(device, error = %e, delay_s = self.retry_delay.as_secs_f64(), "attempt 1 failed, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    error!(device, error = %e, "attempt 2 failed, using fallback");
                }
            }
        }

        self.registry.record_failure(device);

        if let Some(last) = self.registry.last_value::<T>(device) {
            info!(device, "using last known good value");
            return (last, true);
        }
        info!(device, "no previous value, using provided fallback");
        (fallback, true)
    }
}
