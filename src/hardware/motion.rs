//! Motion Blinds gateway over its local UDP protocol.
//!
//! Requests are JSON datagrams sent to port 32100 and answered on the same socket.
//! Write commands carry an access token: the session token from `GetDeviceList`
//! encrypted with the 16-character app key (one AES-128 block), as upper-case hex.
//! Shades are addressed in east and west MAC groups.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{info, warn};

use super::{names, DeviceError, ShadeGroup, ShadeGroups};
use crate::domain::ShadePosition;

pub const MOTION_PORT: u16 = 32100;
const KEY_LEN: usize = 16;
const OPERATION_CLOSE: u8 = 0;
const OPERATION_OPEN: u8 = 1;
/// 0 is fully open, 100 fully closed; group averages within this of either end count.
const POSITION_TOLERANCE: f64 = 10.0;
const MAX_DATAGRAM: usize = 8 * 1024;

/// AES-128 of a single block, upper-case hex.
fn encrypt_block(key: &[u8], block: &[u8]) -> Result<String> {
    let cipher = Aes128::new_from_slice(key).map_err(|_| anyhow!("key must be {KEY_LEN} bytes"))?;
    if block.len() != KEY_LEN {
        return Err(DeviceError::Rejected {
            device: names::SHADES,
            reason: format!("token of {} bytes", block.len()),
        }
        .into());
    }
    let mut block = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut block);
    Ok(hex::encode_upper(block))
}

pub fn access_token(key: &str, token: &str) -> Result<String> {
    encrypt_block(key.as_bytes(), token.as_bytes())
}

/// Open, closed, or `None` for a partial or unknown group position.
pub fn group_position(positions: &[f64]) -> Option<ShadePosition> {
    if positions.is_empty() {
        return None;
    }
    let avg = positions.iter().sum::<f64>() / positions.len() as f64;
    if avg <= POSITION_TOLERANCE {
        Some(ShadePosition::Open)
    } else if avg >= 100.0 - POSITION_TOLERANCE {
        Some(ShadePosition::Closed)
    } else {
        None
    }
}

fn message_id() -> String {
    Utc::now().format("%Y%m%d%H%M%S%3f").to_string()
}

#[derive(Debug, Deserialize)]
struct DeviceListAck {
    token: String,
    #[serde(default)]
    data: Vec<DeviceEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceEntry {
    mac: String,
    device_type: String,
}

struct Session {
    access_token: String,
    /// MAC to device type, for every device behind the gateway.
    devices: HashMap<String, String>,
}

pub struct MotionGateway {
    addr: String,
    key: String,
    east: Vec<String>,
    west: Vec<String>,
    timeout: Duration,
}

impl MotionGateway {
    /// `addr` is `host:port`; use [`MOTION_PORT`] for a real gateway.
    pub fn new(
        addr: impl Into<String>,
        key: impl Into<String>,
        east_macs: &[String],
        west_macs: &[String],
        timeout: Duration,
    ) -> Result<Self> {
        let key = key.into();
        if key.len() != KEY_LEN {
            anyhow::bail!("MOTION_GATEWAY_KEY must be {KEY_LEN} characters, got {}", key.len());
        }
        let lower = |macs: &[String]| -> Vec<String> { macs.iter().map(|m| m.to_lowercase()).collect() };
        Ok(Self {
            addr: addr.into(),
            key,
            east: lower(east_macs),
            west: lower(west_macs),
            timeout,
        })
    }

    fn macs(&self, group: ShadeGroup) -> &[String] {
        match group {
            ShadeGroup::East => &self.east,
            ShadeGroup::West => &self.west,
        }
    }

    async fn request(&self, request: Value, ack: &str, mac: Option<&str>) -> Result<Value> {
        tokio::time::timeout(self.timeout, self.exchange(request, ack, mac))
            .await
            .with_context(|| format!("shade gateway {} timed out", self.addr))?
    }

    /// Sends one datagram and waits for the matching acknowledgement. Heartbeats and
    /// replies for other devices are skipped.
    async fn exchange(&self, request: Value, ack: &str, mac: Option<&str>) -> Result<Value> {
        let socket = UdpSocket::bind("0.0.0.0:0").await.context("bind UDP socket")?;
        socket
            .send_to(request.to_string().as_bytes(), &self.addr)
            .await
            .with_context(|| format!("send to {} failed", self.addr))?;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, _) = socket.recv_from(&mut buf).await.context("receive from gateway")?;
            let reply: Value = match serde_json::from_slice(&buf[..len]) {
                Ok(v) => v,
                Err(e) => {
                    warn!(device = names::SHADES, error = %e, "ignoring malformed datagram");
                    continue;
                }
            };
            if reply["msgType"] != ack {
                continue;
            }
            if mac.is_some_and(|mac| reply["mac"].as_str() != Some(mac)) {
                continue;
            }
            if let Some(result) = reply.get("actionResult").and_then(Value::as_str) {
                return Err(DeviceError::Rejected {
                    device: names::SHADES,
                    reason: result.to_string(),
                }
                .into());
            }
            return Ok(reply);
        }
    }

    async fn session(&self) -> Result<Session> {
        let reply = self
            .request(
                json!({"msgType": "GetDeviceList", "msgID": message_id()}),
                "GetDeviceListAck",
                None,
            )
            .await?;
        let list: DeviceListAck =
            serde_json::from_value(reply).context("unexpected device list from gateway")?;
        Ok(Session {
            access_token: access_token(&self.key, &list.token)?,
            devices: list
                .data
                .into_iter()
                .map(|d| (d.mac.to_lowercase(), d.device_type))
                .collect(),
        })
    }

    /// Configured shades of `group` known to the gateway, with their device types.
    fn blinds<'a>(&'a self, session: &'a Session, group: ShadeGroup) -> Result<Vec<(&'a str, &'a str)>> {
        let found: Vec<_> = self
            .macs(group)
            .iter()
            .filter_map(|mac| match session.devices.get(mac) {
                Some(device_type) => Some((mac.as_str(), device_type.as_str())),
                None => {
                    warn!(device = names::SHADES, mac = %mac, %group, "shade not in gateway device list");
                    None
                }
            })
            .collect();
        if found.is_empty() {
            return Err(DeviceError::Rejected {
                device: names::SHADES,
                reason: format!("no {group} shades on gateway"),
            }
            .into());
        }
        Ok(found)
    }

    async fn operate(&self, group: ShadeGroup, operation: u8) -> Result<()> {
        let session = self.session().await?;
        let blinds = self.blinds(&session, group)?;

        let mut failed = 0;
        for &(mac, device_type) in &blinds {
            let request = json!({
                "msgType": "WriteDevice",
                "mac": mac,
                "deviceType": device_type,
                "AccessToken": session.access_token,
                "msgID": message_id(),
                "data": {"operation": operation},
            });
            if let Err(e) = self.request(request, "WriteDeviceAck", Some(mac)).await {
                warn!(device = names::SHADES, mac, error = %e, "shade command failed");
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(DeviceError::Rejected {
                device: names::SHADES,
                reason: format!("{failed} of {} {group} shades failed", blinds.len()),
            }
            .into());
        }
        info!(device = names::SHADES, %group, operation, shades = blinds.len(), "shades commanded");
        Ok(())
    }

    async fn read_group(&self, session: &Session, group: ShadeGroup) -> Option<ShadePosition> {
        let blinds = self.blinds(session, group).ok()?;
        let mut positions = Vec::with_capacity(blinds.len());
        for (mac, device_type) in blinds {
            let request = json!({
                "msgType": "ReadDevice",
                "mac": mac,
                "deviceType": device_type,
                "msgID": message_id(),
            });
            match self.request(request, "ReadDeviceAck", Some(mac)).await {
                Ok(reply) => positions.extend(reply["data"]["currentPosition"].as_f64()),
                Err(e) => warn!(device = names::SHADES, mac, error = %e, "shade read failed"),
            }
        }
        group_position(&positions)
    }
}

#[async_trait]
impl ShadeGroups for MotionGateway {
    async fn open(&self, group: ShadeGroup) -> Result<()> {
        self.operate(group, OPERATION_OPEN).await
    }

    async fn close(&self, group: ShadeGroup) -> Result<()> {
        self.operate(group, OPERATION_CLOSE).await
    }

    async fn read(&self) -> Result<(Option<ShadePosition>, Option<ShadePosition>)> {
        let session = self.session().await?;
        Ok((
            self.read_group(&session, ShadeGroup::East).await,
            self.read_group(&session, ShadeGroup::West).await,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    const KEY: &str = "74ae544c-d16e-4c";
    const TOKEN: &str = "12345678abcdefgh";

    #[test]
    fn test_aes_known_answer() {
        let key: Vec<u8> = (0u8..16).collect();
        let plain = hex::decode("00112233445566778899aabbccddeeff").unwrap();
        assert_eq!(
            encrypt_block(&key, &plain).unwrap(),
            "69C4E0D86A7B0430D8CDB78070B4C55A"
        );
    }

    #[test]
    fn test_group_position_thresholds() {
        assert_eq!(group_position(&[0.0, 10.0]), Some(ShadePosition::Open));
        assert_eq!(group_position(&[100.0, 90.0]), Some(ShadePosition::Closed));
        assert_eq!(group_position(&[50.0]), None);
        assert_eq!(group_position(&[]), None);
    }

    #[test]
    fn test_key_length_checked() {
        assert!(MotionGateway::new("127.0.0.1:1", "short", &[], &[], Duration::from_secs(1)).is_err());
    }

    /// Answers like a gateway holding `positions` (MAC to position) and records every
    /// request it receives.
    async fn fake_gateway(positions: &[(&str, f64)]) -> (String, Arc<Mutex<Vec<Value>>>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap().to_string();
        let received = Arc::new(Mutex::new(Vec::new()));
        let positions: HashMap<String, f64> =
            positions.iter().map(|(m, p)| (m.to_string(), *p)).collect();

        let log = received.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
                let request: Value = serde_json::from_slice(&buf[..len]).unwrap();
                log.lock().push(request.clone());
                let mac = request["mac"].as_str().unwrap_or_default().to_string();
                let reply = match request["msgType"].as_str() {
                    Some("GetDeviceList") => json!({
                        "msgType": "GetDeviceListAck",
                        "mac": "f0f5bd000000",
                        "deviceType": "02000002",
                        "token": TOKEN,
                        "data": positions
                            .keys()
                            .map(|m| json!({"mac": m, "deviceType": "10000000"}))
                            .collect::<Vec<_>>(),
                    }),
                    Some("WriteDevice") if request["AccessToken"] != access_token(KEY, TOKEN).unwrap() => {
                        json!({"msgType": "WriteDeviceAck", "mac": mac, "actionResult": "AccessToken error"})
                    }
                    Some("WriteDevice") => json!({
                        "msgType": "WriteDeviceAck",
                        "mac": mac,
                        "data": {"currentPosition": positions.get(&mac).copied().unwrap_or(0.0)},
                    }),
                    Some("ReadDevice") => json!({
                        "msgType": "ReadDeviceAck",
                        "mac": mac,
                        "data": {"currentPosition": positions.get(&mac).copied().unwrap_or(0.0)},
                    }),
                    _ => continue,
                };
                // a heartbeat first, which the client must skip
                let heartbeat = json!({"msgType": "Heartbeat", "mac": "f0f5bd000000"});
                socket.send_to(heartbeat.to_string().as_bytes(), peer).await.unwrap();
                socket.send_to(reply.to_string().as_bytes(), peer).await.unwrap();
            }
        });
        (addr, received)
    }

    fn gateway(addr: String, key: &str) -> MotionGateway {
        MotionGateway::new(
            addr,
            key,
            &["AA01".to_string(), "aa02".to_string(), "aa09".to_string()],
            &["bb01".to_string()],
            Duration::from_secs(2),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_close_writes_to_every_known_east_shade() {
        let (addr, received) = fake_gateway(&[("aa01", 0.0), ("aa02", 0.0), ("bb01", 0.0)]).await;

        gateway(addr, KEY).close(ShadeGroup::East).await.unwrap();

        let writes: Vec<_> = received
            .lock()
            .iter()
            .filter(|r| r["msgType"] == "WriteDevice")
            .cloned()
            .collect();
        let mut macs: Vec<_> = writes.iter().filter_map(|w| w["mac"].as_str()).collect();
        macs.sort_unstable();
        assert_eq!(macs, ["aa01", "aa02"], "unknown aa09 skipped, west untouched");
        assert!(writes.iter().all(|w| w["data"]["operation"] == OPERATION_CLOSE));
        assert!(writes
            .iter()
            .all(|w| w["AccessToken"] == access_token(KEY, TOKEN).unwrap()));
    }

    #[tokio::test]
    async fn test_wrong_key_is_rejected() {
        let (addr, _received) = fake_gateway(&[("aa01", 0.0)]).await;
        let err = gateway(addr, "0000000000000000")
            .open(ShadeGroup::East)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("1 of 1 east shades failed"));
    }

    #[tokio::test]
    async fn test_group_without_known_shades_fails() {
        let (addr, _received) = fake_gateway(&[("aa01", 0.0)]).await;
        assert!(gateway(addr, KEY).open(ShadeGroup::West).await.is_err());
    }

    #[tokio::test]
    async fn test_read_averages_group_positions() {
        let (addr, _received) =
            fake_gateway(&[("aa01", 100.0), ("aa02", 95.0), ("bb01", 40.0)]).await;
        let (east, west) = gateway(addr, KEY).read().await.unwrap();
        assert_eq!(east, Some(ShadePosition::Closed));
        assert_eq!(west, None, "partial position");
    }

    #[tokio::test]
    async fn test_silent_gateway_times_out() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap().to_string();
        let east = ["aa01".to_string()];
        let gateway =
            MotionGateway::new(addr, KEY, &east, &[], Duration::from_millis(200)).unwrap();
        assert!(gateway.close(ShadeGroup::East).await.is_err());
        drop(socket);
    }
}
