use std::{collections::HashSet, time::Duration};

use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};
use strum::{Display as StrumDisplay, EnumString};

use crate::api::{
    orchestrator::OrchestratorSettings, scheduler::ExchangeSettings,
};
use crate::protocol::telemetry::CellVoltageLimits;

/// Most packs a Seplos master can chain on one bus.
pub const MAX_PACKS_PER_BUS: usize = 16;

/// What happens when a bus transport fails after startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, StrumDisplay, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum TransportFailurePolicy {
    /// Stop every bus and exit with an error
    #[default]
    Exit,
    /// Stop only the failed bus
    StopBus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, StrumDisplay, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    #[serde(alias = "warning")]
    #[strum(to_string = "warn", serialize = "warning")]
    Warn,
    Error,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

/// One physical bus and the packs chained on it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Serial device path or `tcp://host:port`
    pub transport: String,
    /// Explicit baud rate; derived from the pack count when absent
    #[serde(default)]
    pub baud_rate: Option<u32>,
    /// Address of the first pack (the master)
    #[serde(default)]
    pub first_address: u8,
    pub pack_count: u8,
}

impl BusConfig {
    /// Packs on one bus run at 19200 baud; chained packs drop to 9600.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
            .unwrap_or(if self.pack_count > 1 { 9600 } else { 19200 })
    }

    pub fn addresses(&self) -> Vec<u8> {
        (0..self.pack_count as u16)
            .map(|offset| self.first_address as u16 + offset)
            .filter_map(|address| u8::try_from(address).ok())
            .collect()
    }
}

/// Broker connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Root of every state and availability topic
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

/// Home-automation auto discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_discovery_prefix")]
    pub prefix: String,
    /// Present charging current and power as negative values
    #[serde(default = "default_true")]
    pub invert_charge_measurements: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: default_discovery_prefix(),
            invert_charge_measurements: true,
        }
    }
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_topic() -> String {
    "seplos".to_string()
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

fn default_min_cell_voltage() -> f64 {
    2.5
}

fn default_max_cell_voltage() -> f64 {
    3.65
}

fn default_response_timeout_ms() -> u64 {
    500
}

fn default_max_attempts() -> u32 {
    5
}

fn default_settle_delay_ms() -> u64 {
    1000
}

fn default_queue_capacity() -> usize {
    64
}

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub buses: Vec<BusConfig>,
    #[serde(default = "default_min_cell_voltage")]
    pub min_cell_voltage: f64,
    #[serde(default = "default_max_cell_voltage")]
    pub max_cell_voltage: f64,
    /// Seconds between cycles; 0 polls back to back
    #[serde(default)]
    pub update_interval_secs: u64,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Quiet time between exchanges on one bus
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub publish_queue_capacity: usize,
    #[serde(default)]
    pub transport_failure: TransportFailurePolicy,
    #[serde(default)]
    pub log_level: LogLevel,
    /// Stop after this many cycles per bus
    #[serde(default)]
    pub max_cycles: Option<u64>,
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// `stdout` or `file:<path>`; replaces the broker when set
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Display, Error)]
pub enum ConfigError {
    #[display("no bus configured")]
    NoBus,
    #[display("bus {transport}: pack count {count} outside 1..={max}")]
    PackCount {
        transport: String,
        count: u8,
        max: usize,
    },
    #[display("bus {transport}: addresses from {first} for {count} packs exceed 255")]
    AddressRange {
        transport: String,
        first: u8,
        count: u8,
    },
    #[display("transport {transport} is configured twice")]
    DuplicateTransport { transport: String },
    #[display("pack address {address} on {transport} is already used by another bus")]
    DuplicateAddress { transport: String, address: u8 },
    #[display("cell voltage limits must satisfy 0 < min ({min}) < max ({max})")]
    CellVoltageLimits { min: f64, max: f64 },
    #[display("{field} must be at least 1")]
    Zero { field: &'static str },
    #[display("{field} must not be empty")]
    Empty { field: &'static str },
    #[display("no publish sink: configure mqtt or output")]
    NoSink,
}

impl BridgeConfig {
    /// Parse configuration from a JSON string
    pub fn from_json(json_str: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json_str)
    }

    /// Read configuration from a file
    pub fn from_file(file_path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(file_path)?;
        Ok(Self::from_json(&content)?)
    }

    /// Convert to a JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Check every cross-field rule. Called once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buses.is_empty() {
            return Err(ConfigError::NoBus);
        }
        let mut transports = HashSet::new();
        // Topics and discovery ids are keyed by address alone.
        let mut addresses = HashSet::new();
        for bus in &self.buses {
            if bus.transport.trim().is_empty() {
                return Err(ConfigError::Empty {
                    field: "bus transport",
                });
            }
            if !transports.insert(bus.transport.as_str()) {
                return Err(ConfigError::DuplicateTransport {
                    transport: bus.transport.clone(),
                });
            }
            if bus.pack_count == 0 || bus.pack_count as usize > MAX_PACKS_PER_BUS {
                return Err(ConfigError::PackCount {
                    transport: bus.transport.clone(),
                    count: bus.pack_count,
                    max: MAX_PACKS_PER_BUS,
                });
            }
            if bus.addresses().len() != bus.pack_count as usize {
                return Err(ConfigError::AddressRange {
                    transport: bus.transport.clone(),
                    first: bus.first_address,
                    count: bus.pack_count,
                });
            }
            let repeated = bus.addresses().into_iter().find(|a| !addresses.insert(*a));
            if let Some(address) = repeated {
                return Err(ConfigError::DuplicateAddress {
                    transport: bus.transport.clone(),
                    address,
                });
            }
        }

        if !(self.min_cell_voltage > 0.0 && self.min_cell_voltage < self.max_cell_voltage) {
            return Err(ConfigError::CellVoltageLimits {
                min: self.min_cell_voltage,
                max: self.max_cell_voltage,
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero {
                field: "max_attempts",
            });
        }
        if self.response_timeout_ms == 0 {
            return Err(ConfigError::Zero {
                field: "response_timeout_ms",
            });
        }
        if self.publish_queue_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "publish_queue_capacity",
            });
        }

        match (&self.mqtt, &self.output) {
            (None, None) => return Err(ConfigError::NoSink),
            (Some(mqtt), None) => {
                if mqtt.host.trim().is_empty() {
                    return Err(ConfigError::Empty { field: "mqtt host" });
                }
                if mqtt.topic.trim().is_empty() {
                    return Err(ConfigError::Empty {
                        field: "mqtt topic",
                    });
                }
                if self.discovery.enabled && self.discovery.prefix.trim().is_empty() {
                    return Err(ConfigError::Empty {
                        field: "discovery prefix",
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn limits(&self) -> CellVoltageLimits {
        CellVoltageLimits {
            min: self.min_cell_voltage,
            max: self.max_cell_voltage,
        }
    }

    pub fn exchange_settings(&self) -> ExchangeSettings {
        ExchangeSettings {
            max_attempts: self.max_attempts,
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
        }
    }

    pub fn orchestrator_settings(&self, bus: &BusConfig) -> OrchestratorSettings {
        OrchestratorSettings {
            addresses: bus.addresses(),
            limits: self.limits(),
            update_interval: Duration::from_secs(self.update_interval_secs),
            max_cycles: self.max_cycles,
        }
    }

    /// Total packs across every bus.
    pub fn pack_count(&self) -> usize {
        self.buses.iter().map(|bus| bus.pack_count as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> BridgeConfig {
        BridgeConfig::from_json(
            r#"{
                "buses": [{ "transport": "/dev/ttyUSB0", "pack_count": 2 }],
                "mqtt": { "host": "broker.local" }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults_follow_deployment_conventions() {
        let config = minimal();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_cell_voltage, 2.5);
        assert_eq!(config.max_cell_voltage, 3.65);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.update_interval_secs, 0);
        assert_eq!(config.transport_failure, TransportFailurePolicy::Exit);
        assert_eq!(config.log_level, LogLevel::Info);

        let mqtt = config.mqtt.as_ref().unwrap();
        assert_eq!(mqtt.port, 1883);
        assert_eq!(mqtt.topic, "seplos");
        assert!(config.discovery.enabled);
        assert_eq!(config.discovery.prefix, "homeassistant");

        let bus = &config.buses[0];
        assert_eq!(bus.baud_rate(), 9600);
        assert_eq!(bus.addresses(), vec![0, 1]);
    }

    #[test]
    fn test_single_pack_bus_runs_faster() {
        let bus = BusConfig {
            transport: "tcp://10.0.0.5:8899".into(),
            baud_rate: None,
            first_address: 1,
            pack_count: 1,
        };
        assert_eq!(bus.baud_rate(), 19200);
        assert_eq!(bus.addresses(), vec![1]);
    }

    #[test]
    fn test_config_round_trip() {
        let mut config = minimal();
        config.buses.push(BusConfig {
            transport: "tcp://10.0.0.5:8899".into(),
            baud_rate: Some(19200),
            first_address: 2,
            pack_count: 3,
        });
        config.transport_failure = TransportFailurePolicy::StopBus;
        let parsed = BridgeConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.pack_count(), 5);
    }

    #[test]
    fn test_validation_rules() {
        let mut config = minimal();
        config.buses[0].pack_count = 0;
        assert!(matches!(config.validate(), Err(ConfigError::PackCount { .. })));

        let mut config = minimal();
        config.buses[0].first_address = 250;
        config.buses[0].pack_count = 10;
        assert!(matches!(config.validate(), Err(ConfigError::AddressRange { .. })));

        let mut config = minimal();
        config.buses.push(config.buses[0].clone());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateTransport { .. })
        ));

        let mut config = minimal();
        config.min_cell_voltage = 3.7;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CellVoltageLimits { .. })
        ));

        let mut config = minimal();
        config.max_attempts = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "max_attempts"
            })
        );

        let mut config = minimal();
        config.mqtt = None;
        assert_eq!(config.validate(), Err(ConfigError::NoSink));
        config.output = Some("stdout".into());
        assert!(config.validate().is_ok());

        let mut config = minimal();
        config.buses.clear();
        assert_eq!(config.validate(), Err(ConfigError::NoBus));
    }

    #[test]
    fn test_addresses_must_be_unique_across_buses() {
        let mut config = minimal();
        config.buses.push(BusConfig {
            transport: "tcp://10.0.0.5:8899".into(),
            baud_rate: None,
            first_address: 1,
            pack_count: 2,
        });
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateAddress {
                transport: "tcp://10.0.0.5:8899".into(),
                address: 1,
            })
        );

        config.buses[1].first_address = 2;
        assert!(config.validate().is_ok());
        let packs: Vec<u8> = config.buses.iter().flat_map(BusConfig::addresses).collect();
        assert_eq!(packs, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_policy_and_level_parsing() {
        assert_eq!(
            "stop_bus".parse::<TransportFailurePolicy>().unwrap(),
            TransportFailurePolicy::StopBus
        );
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::Warn.to_string(), "warn");
        assert_eq!(
            log::LevelFilter::from(LogLevel::Warn),
            log::LevelFilter::Warn
        );
    }
}
