//! Cache of readings pushed by the indoor sensor.
//!
//! The sensor sleeps between readings and publishes its status when it wakes.
//! Published messages reach the cache over an mpsc channel; a line-oriented TCP
//! bridge is provided so the output of a broker subscriber such as
//! `mosquitto_sub -v` can be piped straight into the controller.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::IndoorReading;

/// One published message.
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    pub topic: String,
    pub payload: String,
}

impl PushMessage {
    /// Parses a `topic payload` line as printed by `mosquitto_sub -v`.
    pub fn from_line(line: &str) -> Option<Self> {
        let (topic, payload) = line.trim().split_once(' ')?;
        Some(Self {
            topic: topic.to_string(),
            payload: payload.trim().to_string(),
        })
    }
}

#[derive(Debug, Default)]
struct Cached {
    temp_f: Option<f64>,
    humidity: Option<f64>,
    battery_percent: Option<f64>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct TemperatureStatus {
    #[serde(rename = "tF")]
    t_f: Option<f64>,
}

#[derive(Deserialize)]
struct HumidityStatus {
    rh: Option<f64>,
}

#[derive(Deserialize)]
struct DevicePowerStatus {
    battery: Option<BatteryStatus>,
}

#[derive(Deserialize)]
struct BatteryStatus {
    percent: Option<f64>,
}

/// Latest pushed indoor values, shared between the listener task and the sensor
/// adapter.
#[derive(Debug)]
pub struct PushCache {
    topic_prefix: String,
    stale_after: Duration,
    inner: Mutex<Cached>,
}

impl PushCache {
    pub fn new(topic_prefix: impl Into<String>, stale_after: Duration) -> Self {
        Self {
            topic_prefix: topic_prefix.into(),
            stale_after,
            inner: Mutex::new(Cached::default()),
        }
    }

    /// Status topics the sensor publishes to.
    pub fn topics(&self) -> Vec<String> {
        ["temperature:0", "humidity:0", "devicepower:0"]
            .iter()
            .map(|component| format!("{}/status/{}", self.topic_prefix, component))
            .collect()
    }

    pub fn ingest(&self, topic: &str, payload: &str) {
        self.ingest_at(topic, payload, Utc::now());
    }

    /// Updates the cache from one message. Unknown topics and malformed payloads
    /// are logged and dropped.
    pub fn ingest_at(&self, topic: &str, payload: &str, at: DateTime<Utc>) {
        let Some(component) = topic
            .strip_prefix(&self.topic_prefix)
            .and_then(|rest| rest.strip_prefix("/status/"))
        else {
            debug!(topic, "ignoring message for another device");
            return;
        };

        let mut cached = self.inner.lock();
        let parsed = match component {
            "temperature:0" => serde_json::from_str::<TemperatureStatus>(payload).map(|s| {
                cached.temp_f = s.t_f.map(|t| (t * 10.0).round() / 10.0);
                info!(temp_f = ?cached.temp_f, "push: indoor temperature");
            }),
            "humidity:0" => serde_json::from_str::<HumidityStatus>(payload).map(|s| {
                cached.humidity = s.rh;
                info!(humidity = ?cached.humidity, "push: indoor humidity");
            }),
            "devicepower:0" => serde_json::from_str::<DevicePowerStatus>(payload).map(|s| {
                cached.battery_percent = s.battery.and_then(|b| b.percent);
            }),
            _ => {
                debug!(topic, "ignoring unrelated status component");
                return;
            }
        };

        match parsed {
            Ok(()) => cached.updated_at = Some(at),
            Err(e) => warn!(topic, error = %e, "failed to parse pushed payload"),
        }
    }

    /// Cached reading if it is fresh and carries a temperature.
    pub fn fresh_reading(&self, now: DateTime<Utc>) -> Option<IndoorReading> {
        let cached = self.inner.lock();
        let updated_at = cached.updated_at?;
        let age = now - updated_at;
        if age >= self.stale_after || cached.temp_f.is_none() {
            info!(age_s = age.num_seconds(), "pushed data stale or incomplete");
            return None;
        }
        debug!(age_s = age.num_seconds(), "using pushed indoor data");
        Some(IndoorReading {
            temp_f: cached.temp_f,
            humidity: cached.humidity,
            battery_percent: cached.battery_percent,
        })
    }
}

/// Feeds messages from `rx` into `cache` until the channel closes or `cancel`
/// fires.
pub fn spawn_listener(
    mut rx: mpsc::Receiver<PushMessage>,
    cache: Arc<PushCache>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => cache.ingest(&msg.topic, &msg.payload),
                    None => break,
                },
            }
        }
        debug!("push listener stopped");
    })
}

/// Accepts TCP connections on `addr` and forwards every `topic payload` line to
/// `tx`.
pub async fn spawn_line_bridge(
    addr: SocketAddr,
    tx: mpsc::Sender<PushMessage>,
    cancel: CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "push bridge listening");

    Ok(tokio::spawn(async move {
        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "push bridge accept failed");
                        continue;
                    }
                },
            };
            debug!(%peer, "push bridge connection");

            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stream).lines();
                loop {
                    let line = tokio::select! {
                        _ = cancel.cancelled() => break,
                        line = lines.next_line() => line,
                    };
                    match line {
                        Ok(Some(line)) => {
                            if let Some(msg) = PushMessage::from_line(&line) {
                                if tx.send(msg).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(%peer, error = %e, "push bridge read failed");
                            break;
                        }
                    }
                }
            });
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    const PREFIX: &str = "shellyhtg3-e4b323311d58";

    fn cache() -> PushCache {
        PushCache::new(PREFIX, Duration::seconds(600))
    }

    #[test]
    fn test_topics() {
        assert_eq!(
            cache().topics(),
            vec![
                format!("{PREFIX}/status/temperature:0"),
                format!("{PREFIX}/status/humidity:0"),
                format!("{PREFIX}/status/devicepower:0"),
            ]
        );
    }

    #[test]
    fn test_ingest_and_read() {
        let cache = cache();
        let now = Utc::now();
        cache.ingest_at(&format!("{PREFIX}/status/temperature:0"), r#"{"id":0,"tC":22.1,"tF":71.78}"#, now);
        cache.ingest_at(&format!("{PREFIX}/status/humidity:0"), r#"{"id":0,"rh":48.2}"#, now);
        cache.ingest_at(
            &format!("{PREFIX}/status/devicepower:0"),
            r#"{"id":0,"battery":{"V":5.9,"percent":87}}"#,
            now,
        );

        let reading = cache.fresh_reading(now).unwrap();
        assert_eq!(reading.temp_f, Some(71.8));
        assert_eq!(reading.humidity, Some(48.2));
        assert_eq!(reading.battery_percent, Some(87.0));
    }

    #[test]
    fn test_stale_or_missing_temperature() {
        let cache = cache();
        let now = Utc::now();
        cache.ingest_at(&format!("{PREFIX}/status/humidity:0"), r#"{"rh":50}"#, now);
        assert!(cache.fresh_reading(now).is_none());

        cache.ingest_at(&format!("{PREFIX}/status/temperature:0"), r#"{"tF":70.0}"#, now);
        assert!(cache.fresh_reading(now + Duration::seconds(599)).is_some());
        assert!(cache.fresh_reading(now + Duration::seconds(600)).is_none());
    }

    #[test]
    fn test_malformed_and_foreign_messages_ignored() {
        let cache = cache();
        let now = Utc::now();
        cache.ingest_at(&format!("{PREFIX}/status/temperature:0"), "not json", now);
        cache.ingest_at("other-device/status/temperature:0", r#"{"tF":99.0}"#, now);
        assert!(cache.fresh_reading(now).is_none());
    }

    #[test]
    fn test_line_parsing() {
        let msg = PushMessage::from_line("a/status/humidity:0 {\"rh\": 40}\n").unwrap();
        assert_eq!(msg.topic, "a/status/humidity:0");
        assert_eq!(msg.payload, "{\"rh\": 40}");
        assert!(PushMessage::from_line("no-payload").is_none());
    }

    #[tokio::test]
    async fn test_listener_feeds_cache() {
        let cache = Arc::new(cache());
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = spawn_listener(rx, cache.clone(), cancel.clone());

        tx.send(PushMessage {
            topic: format!("{PREFIX}/status/temperature:0"),
            payload: r#"{"tF":65.0}"#.to_string(),
        })
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(cache.fresh_reading(Utc::now()).unwrap().temp_f, Some(65.0));
    }

    #[tokio::test]
    async fn test_line_bridge_forwards_messages() {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);
        // Bind to an ephemeral port first to learn a free address.
        let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = placeholder.local_addr().unwrap();
        drop(placeholder);

        let _bridge = spawn_line_bridge(addr, tx, cancel.clone()).await.unwrap();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("{PREFIX}/status/humidity:0 {{\"rh\":41}}\n").as_bytes())
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, format!("{PREFIX}/status/humidity:0"));
        assert_eq!(msg.payload, "{\"rh\":41}");
        cancel.cancel();
    }
}
