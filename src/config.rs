use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

use crate::port::{
    Parity, TransportMode, DEFAULT_FRAME_CAPACITY, DEFAULT_LISTEN_BACKLOG, DEFAULT_TCP_PORT,
};

/// Modbus-TCP listener settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Port shared by every TCP instance
    pub port: u16,
    /// Idle time in milliseconds before a client is dropped; 0 disables it
    pub keepalive_ms: u64,
    /// Number of listen socket slots in the shared pool
    pub pool_slots: usize,
    /// Pending connections queued by each listen socket
    pub backlog: i32,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_TCP_PORT,
            keepalive_ms: 0,
            pool_slots: 4,
            backlog: DEFAULT_LISTEN_BACKLOG,
        }
    }
}

impl TcpConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }
}

/// Serial line settings for RTU/ASCII
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`
    pub device: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            baud_rate: 19_200,
            data_bits: 8,
            parity: Parity::Even,
        }
    }
}

/// Root configuration of the `mbport` server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub mode: TransportMode,
    /// Modbus unit (slave) identifier answered by every instance
    pub unit_id: u8,
    /// Number of TCP instances sharing the listen port
    pub instances: usize,
    /// Frame buffer size of each instance in bytes
    pub frame_capacity: usize,
    pub tcp: TcpConfig,
    pub serial: SerialConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::Tcp,
            unit_id: 1,
            instances: 1,
            frame_capacity: DEFAULT_FRAME_CAPACITY,
            tcp: TcpConfig::default(),
            serial: SerialConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Reads a configuration file; `.json` files are parsed as JSON,
    /// everything else as TOML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            Self::from_json(&content)
        } else {
            Self::from_toml(&content)
        };
        config.with_context(|| format!("Failed to parse configuration file {}", path.display()))
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Rejects settings the port layer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.instances == 0 {
            return Err(anyhow!("instances must be at least 1"));
        }
        if self.frame_capacity < crate::port::MBAP_HEADER_LEN + 1 {
            return Err(anyhow!(
                "frame_capacity {} cannot hold a Modbus frame",
                self.frame_capacity
            ));
        }
        match self.mode {
            TransportMode::Tcp if self.tcp.pool_slots == 0 => {
                Err(anyhow!("tcp.pool_slots must be at least 1"))
            }
            TransportMode::Tcp if self.tcp.backlog < 1 => {
                Err(anyhow!("tcp.backlog must be at least 1"))
            }
            TransportMode::Rtu | TransportMode::Ascii if self.serial.device.is_empty() => {
                Err(anyhow!("serial.device is required in {} mode", self.mode))
            }
            TransportMode::Rtu | TransportMode::Ascii if self.instances != 1 => {
                Err(anyhow!("a serial line is served by exactly one instance"))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = ServerConfig::from_toml("instances = 3\n[tcp]\nport = 1502\n").unwrap();
        assert_eq!(config.instances, 3);
        assert_eq!(config.tcp.port, 1502);
        assert_eq!(config.tcp.pool_slots, 4);
        assert_eq!(config.tcp.backlog, DEFAULT_LISTEN_BACKLOG);
        assert_eq!(config.mode, TransportMode::Tcp);
        assert_eq!(config.frame_capacity, 263);
        config.validate().unwrap();
    }

    #[test]
    fn serial_config_from_json() {
        let json = r#"{
            "mode": "rtu",
            "unit_id": 17,
            "serial": { "device": "/dev/ttyUSB0", "baud_rate": 9600, "parity": "none" }
        }"#;
        let config = ServerConfig::from_json(json).unwrap();
        assert_eq!(config.mode, TransportMode::Rtu);
        assert_eq!(config.unit_id, 17);
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.serial.parity, Parity::None);
        assert_eq!(config.serial.data_bits, 8);
        config.validate().unwrap();
    }

    #[test]
    fn file_format_follows_extension() {
        let mut toml_file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(toml_file, "unit_id = 5\n[tcp]\nkeepalive_ms = 2500").unwrap();
        let config = ServerConfig::from_file(toml_file.path()).unwrap();
        assert_eq!(config.unit_id, 5);
        assert_eq!(config.tcp.keepalive(), Duration::from_millis(2500));

        let mut json_file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(json_file, "{}", config.to_json().unwrap()).unwrap();
        assert_eq!(ServerConfig::from_file(json_file.path()).unwrap(), config);
    }

    #[test]
    fn printed_toml_parses_back() {
        let config = ServerConfig::default();
        let text = config.to_toml().unwrap();
        assert_eq!(ServerConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn validation_catches_unusable_settings() {
        let config = ServerConfig {
            instances: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            mode: TransportMode::Rtu,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            frame_capacity: 7,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.tcp.backlog = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ServerConfig::from_file(dir.path().join("absent.toml")).is_err());
    }
}
