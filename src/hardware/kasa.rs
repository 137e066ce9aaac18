//! Kasa smart switch over the local protocol on TCP port 9999.
//!
//! Frames are a 4-byte big-endian length followed by JSON encrypted with an XOR
//! autokey cipher seeded with 171.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::info;

use super::{DeviceError, Switch};
use crate::domain::SwitchReading;

pub const KASA_PORT: u16 = 9999;
const XOR_KEY: u8 = 171;
/// Responses larger than this are treated as corrupt.
const MAX_FRAME: usize = 64 * 1024;

pub fn encrypt(plain: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(plain.len() + 4);
    out.extend_from_slice(&(plain.len() as u32).to_be_bytes());
    let mut key = XOR_KEY;
    for b in plain {
        key ^= b;
        out.push(key);
    }
    out
}

pub fn decrypt(cipher: &[u8]) -> Vec<u8> {
    let mut key = XOR_KEY;
    cipher
        .iter()
        .map(|&b| {
            let plain = key ^ b;
            key = b;
            plain
        })
        .collect()
}

pub struct KasaSwitch {
    addr: String,
    timeout: Duration,
    name: String,
}

impl KasaSwitch {
    /// `addr` is `host:port`; use [`KASA_PORT`] for real devices.
    pub fn new(addr: impl Into<String>, timeout: Duration, name: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            name: name.into(),
        }
    }

    async fn query(&self, request: Value) -> Result<Value> {
        tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .with_context(|| format!("{} timed out", self.name))?
    }

    async fn exchange(&self, request: Value) -> Result<Value> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("connect to {} failed", self.addr))?;
        stream.write_all(&encrypt(request.to_string().as_bytes())).await?;

        let mut header = [0u8; 4];
        stream
            .read_exact(&mut header)
            .await
            .context("connection closed before header")?;
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME {
            return Err(DeviceError::Rejected {
                device: "kasa",
                reason: format!("frame of {len} bytes"),
            }
            .into());
        }
        let mut body = vec![0u8; len];
        stream
            .read_exact(&mut body)
            .await
            .context("connection closed before response")?;

        serde_json::from_slice(&decrypt(&body)).context("kasa response is not JSON")
    }

    async fn set_relay(&self, state: u8) -> Result<()> {
        let resp = self
            .query(json!({"system": {"set_relay_state": {"state": state}}}))
            .await?;
        let err_code = resp["system"]["set_relay_state"]["err_code"].as_i64().unwrap_or(0);
        if err_code != 0 {
            return Err(DeviceError::Rejected {
                device: "kasa",
                reason: format!("err_code {err_code}"),
            }
            .into());
        }
        info!(device = %self.name, on = state == 1, "relay set");
        Ok(())
    }
}

#[async_trait]
impl Switch for KasaSwitch {
    async fn read(&self) -> Result<SwitchReading> {
        let resp = self.query(json!({"system": {"get_sysinfo": {}}})).await?;
        let relay_state = resp["system"]["get_sysinfo"]["relay_state"]
            .as_u64()
            .ok_or(DeviceError::MissingField {
                device: "kasa",
                field: "relay_state",
            })?;
        Ok(SwitchReading {
            on: relay_state != 0,
        })
    }

    async fn turn_on(&self) -> Result<()> {
        self.set_relay(1).await
    }

    async fn turn_off(&self) -> Result<()> {
        self.set_relay(0).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_cipher_known_bytes() {
        let frame = encrypt(b"{}");
        assert_eq!(&frame[..4], &[0, 0, 0, 2]);
        // '{' = 0x7b, 0x7b ^ 0xab = 0xd0; '}' = 0x7d, 0x7d ^ 0xd0 = 0xad
        assert_eq!(&frame[4..], &[0xd0, 0xad]);
        assert_eq!(decrypt(&frame[4..]), b"{}");
    }

    /// Serves one request, replying with `reply`, and returns the decoded request.
    async fn fake_device(reply: Value) -> (String, tokio::task::JoinHandle<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut header = [0u8; 4];
            socket.read_exact(&mut header).await.unwrap();
            let mut body = vec![0u8; u32::from_be_bytes(header) as usize];
            socket.read_exact(&mut body).await.unwrap();
            socket
                .write_all(&encrypt(reply.to_string().as_bytes()))
                .await
                .unwrap();
            serde_json::from_slice(&decrypt(&body)).unwrap()
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_read_relay_state() {
        let (addr, device) =
            fake_device(json!({"system": {"get_sysinfo": {"relay_state": 1, "alias": "fans"}}})).await;
        let switch = KasaSwitch::new(addr, Duration::from_secs(2), "kasa_circ_fans");
        assert!(switch.read().await.unwrap().on);
        assert_eq!(device.await.unwrap(), json!({"system": {"get_sysinfo": {}}}));
    }

    #[tokio::test]
    async fn test_turn_off_sends_state_zero() {
        let (addr, device) =
            fake_device(json!({"system": {"set_relay_state": {"err_code": 0}}})).await;
        let switch = KasaSwitch::new(addr, Duration::from_secs(2), "kasa_circ_fans");
        switch.turn_off().await.unwrap();
        assert_eq!(
            device.await.unwrap(),
            json!({"system": {"set_relay_state": {"state": 0}}})
        );
    }

    #[tokio::test]
    async fn test_device_error_code() {
        let (addr, _device) =
            fake_device(json!({"system": {"set_relay_state": {"err_code": -1}}})).await;
        let switch = KasaSwitch::new(addr, Duration::from_secs(2), "kasa_circ_fans");
        assert!(switch.turn_on().await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_device() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let switch = KasaSwitch::new(addr, Duration::from_millis(500), "kasa_circ_fans");
        assert!(switch.read().await.is_err());
    }
}
