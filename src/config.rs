use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::server::AREA_CAPACITY;
use crate::{Error, Result, DEFAULT_PORT};

/// A resolved driver settings record.
///
/// How the record is obtained (INI/TOML file, environment, a flow tool sending JSON) is the
/// caller's concern: every field carries a default, so a partial document deserializes into a
/// complete record.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Modbus server options
    #[serde(default)]
    pub modbus: ModbusConfig,
    /// Memory area sizes and the initial point value
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Watchdog options
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    /// Device identification, reported in logs at engine start
    #[serde(default)]
    pub device: DeviceConfig,
}

impl Config {
    /// Validates the record. Called by the manager on every start, before the engine is
    /// constructed.
    pub fn validate(&self) -> Result<()> {
        for (key, count) in [
            ("hr_count", self.memory.hr_count),
            ("ir_count", self.memory.ir_count),
            ("coil_count", self.memory.coil_count),
            ("di_count", self.memory.di_count),
        ] {
            if usize::from(count) > AREA_CAPACITY {
                return Err(Error::invalid_data(format!(
                    "{} = {} exceeds the area capacity ({})",
                    key, count, AREA_CAPACITY
                )));
            }
        }
        if !(i32::from(i16::MIN)..=i32::from(u16::MAX)).contains(&self.memory.default_value) {
            return Err(Error::OutOfRange(self.memory.default_value.into()));
        }
        if self.modbus.timeout == 0 {
            return Err(Error::invalid_data("timeout must be at least 1 second"));
        }
        if self.watchdog.interval_seconds == 0 {
            return Err(Error::invalid_data(
                "watchdog interval must be at least 1 second",
            ));
        }
        if self.modbus.max_clients == 0 {
            return Err(Error::invalid_data("max_clients must be nonzero"));
        }
        Ok(())
    }
}

/// Modbus server options
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// Listen address
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,
    /// The served slave id
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    /// Per-request timeout, seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Concurrent client connection ceiling
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
}

impl ModbusConfig {
    /// The listen address in `host:port` form
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
    /// Per-request timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            unit_id: default_unit_id(),
            timeout: default_timeout(),
            max_clients: default_max_clients(),
        }
    }
}

/// Memory area sizes. Addresses of each area are zero-based `0..count`.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Holding register (HR) count
    #[serde(default = "default_hr_count")]
    pub hr_count: u16,
    /// Coil (CO) count
    #[serde(default)]
    pub coil_count: u16,
    /// Discrete input (DI) count
    #[serde(default)]
    pub di_count: u16,
    /// Input register (IR) count
    #[serde(default)]
    pub ir_count: u16,
    /// The initial value for all points
    #[serde(default)]
    pub default_value: i32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            hr_count: default_hr_count(),
            coil_count: 0,
            di_count: 0,
            ir_count: 0,
            default_value: 0,
        }
    }
}

/// Watchdog options
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Arm the watchdog after a successful start
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Poll period, seconds
    #[serde(default = "default_watchdog_interval")]
    pub interval_seconds: u64,
    /// Restart attempt ceiling, 0 = unbounded
    #[serde(default = "default_watchdog_retries")]
    pub max_retries: u32,
}

impl WatchdogConfig {
    /// Poll period as a [`Duration`]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_watchdog_interval(),
            max_retries: default_watchdog_retries(),
        }
    }
}

/// Device identification
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Vendor name
    #[serde(default = "default_vendor_name")]
    pub vendor_name: String,
    /// Product code
    #[serde(default = "default_product_code")]
    pub product_code: String,
    /// Vendor URL
    #[serde(default = "default_vendor_url")]
    pub vendor_url: String,
    /// Product name
    #[serde(default = "default_product_name")]
    pub product_name: String,
    /// Revision
    #[serde(default = "default_revision")]
    pub revision: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            vendor_name: default_vendor_name(),
            product_code: default_product_code(),
            vendor_url: default_vendor_url(),
            product_name: default_product_name(),
            revision: default_revision(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_unit_id() -> u8 {
    1
}

fn default_timeout() -> u64 {
    5
}

fn default_max_clients() -> usize {
    16
}

fn default_hr_count() -> u16 {
    100
}

fn default_true() -> bool {
    true
}

fn default_watchdog_interval() -> u64 {
    10
}

fn default_watchdog_retries() -> u32 {
    5
}

fn default_vendor_name() -> String {
    "Generic Vendor".to_owned()
}

fn default_product_code() -> String {
    "GEN".to_owned()
}

fn default_vendor_url() -> String {
    "http://localhost".to_owned()
}

fn default_product_name() -> String {
    "Modbus Driver".to_owned()
}

fn default_revision() -> String {
    "1.0.0".to_owned()
}

#[cfg(test)]
mod test {
    use super::Config;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        insta::assert_snapshot!(config.modbus.listen_addr(), @"0.0.0.0:5020");
        insta::assert_snapshot!(config.modbus.unit_id, @"1");
        insta::assert_snapshot!(config.memory.hr_count, @"100");
        insta::assert_snapshot!(config.watchdog.interval_seconds, @"10");
        insta::assert_snapshot!(config.watchdog.max_retries, @"5");
        assert!(config.watchdog.enabled);
        assert_eq!(config.memory.coil_count, 0);
        assert_eq!(config.memory.default_value, 0);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_document() {
        let config: Config =
            serde_json::from_str(r#"{"modbus": {"port": 15020}, "memory": {"hr_count": 10}}"#)
                .unwrap();
        assert_eq!(config.modbus.port, 15020);
        assert_eq!(config.modbus.host, "0.0.0.0");
        assert_eq!(config.memory.hr_count, 10);
        assert_eq!(config.memory.ir_count, 0);
        assert!(config.watchdog.enabled);
        // an empty document resolves to the full default record
        let empty: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, Config::default());
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        config.memory.default_value = 70_000;
        assert!(config.validate().is_err());
        config.memory.default_value = -1;
        config.validate().unwrap();
        config.modbus.timeout = 0;
        assert!(config.validate().is_err());
        config.modbus.timeout = 5;
        config.watchdog.interval_seconds = 0;
        assert!(config.validate().is_err());
    }
}
