use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    event::{Address, WriteType},
    registrar::NotifyMode,
    stack::{ConnParams, ScanParams},
};

pub const SPP_SERVICE_UUID: u16 = 0xffe0;
pub const DEFAULT_TARGET: Address = Address([0x98, 0xda, 0x20, 0x04, 0x43, 0xa4]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub path: String,
    pub baud: u32,
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            path: "/dev/ttyUSB0".to_string(),
            baud: 115200,
            flow_control: FlowControl::Hardware,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The only peer the session will connect to.
    pub target: Address,
    pub service_uuid: u16,
    pub local_mtu: u16,
    pub scan: ScanParams,
    pub connection: ConnParams,
    pub notify_mode: NotifyMode,
    pub write_type: WriteType,
    pub registration_pacing_ms: u64,
    pub registration_queue: usize,
    pub outbound_queue: usize,
    pub serial: SerialConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            target: DEFAULT_TARGET,
            service_uuid: SPP_SERVICE_UUID,
            local_mtu: 512,
            scan: ScanParams::default(),
            connection: ConnParams::default(),
            notify_mode: if cfg!(feature = "reliable") {
                NotifyMode::Indicate
            } else {
                NotifyMode::Notify
            },
            write_type: if cfg!(feature = "throughput") {
                WriteType::WithoutResponse
            } else {
                WriteType::WithResponse
            },
            registration_pacing_ms: 100,
            registration_queue: 10,
            outbound_queue: 10,
            serial: SerialConfig::default(),
        }
    }
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = tokio::fs::read(path.as_ref())
            .await
            .with_context(|| format!("failed to read config file {}", path.as_ref().display()))?;
        Self::from_slice(&file)
    }

    pub fn from_slice(b: &[u8]) -> Result<Self> {
        serde_json::from_slice(b).context("failed to parse config")
    }

    pub fn registration_pacing(&self) -> Duration {
        Duration::from_millis(self.registration_pacing_ms)
    }
}
