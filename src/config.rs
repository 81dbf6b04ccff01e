use std::path::Path;
use std::time::Duration;

use mac_address::MacAddress;
use serde_derive::Deserialize;

use crate::error::ConfigError;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub logging: Option<LoggingConfig>,
    pub tracking: Option<TrackingConfig>,
    pub broker: Option<BrokerConfig>,
    pub report: Option<ReportConfig>,
    pub devices: Option<Vec<DeviceConfig>>,
}

impl AppConfig {
    /// Loads a TOML config, or JSON when the file name ends in `.json`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        if path.extension().is_some_and(|ext| ext == "json") {
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(toml::de::from_str(&contents)?)
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct LoggingConfig {
    pub level: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct TrackingConfig {
    /// Only neighbors attached to this interface are considered on refresh.
    pub interface: Option<String>,
    pub refresh_interval_seconds: Option<u64>,
    pub idle_timeout_seconds: Option<u64>,
    pub dial_timeout_seconds: Option<u64>,
    pub sample_interval_seconds: Option<u64>,
    pub topic_prefix: Option<String>,
}

impl TrackingConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds.unwrap_or(10).max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds.unwrap_or(300))
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_seconds.unwrap_or(5).max(1))
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_seconds.unwrap_or(5).max(1))
    }

    pub fn topic_prefix(&self) -> &str {
        self.topic_prefix.as_deref().unwrap_or("/home")
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct BrokerConfig {
    pub port: Option<u16>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ReportConfig {
    pub interval_seconds: Option<u64>,
}

impl ReportConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.unwrap_or(10).max(1))
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct DeviceConfig {
    pub address: MacAddress,
    pub name: Option<String>,
    pub methods: Vec<MethodConfig>,
}

/// One way of detecting device activity, tagged by `type`.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MethodConfig {
    Ping {
        interval_seconds: Option<u64>,
    },
    Syn {
        port: u16,
        interval_seconds: Option<u64>,
    },
    Pcap {
        dev: String,
    },
}

impl MethodConfig {
    pub fn tag(&self) -> &'static str {
        match self {
            MethodConfig::Ping { .. } => "ping",
            MethodConfig::Syn { .. } => "syn",
            MethodConfig::Pcap { .. } => "pcap",
        }
    }
}
