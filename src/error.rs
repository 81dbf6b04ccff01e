use std::num::ParseFloatError;

use mac_address::MacAddress;
use thiserror::Error;

/// Why a single neighbor table line was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseReason {
    #[error("expected 6 fields, found {0}")]
    FieldCount(usize),

    #[error("invalid IP address")]
    InvalidIp,

    #[error("invalid hardware type")]
    InvalidHardwareType,

    #[error("invalid flags")]
    InvalidFlags,

    #[error("invalid hardware address")]
    InvalidHardwareAddress,
}

#[derive(Error, Debug)]
pub enum NeighborError {
    #[error("failed to parse neighbor table line {line} ({content:?}): {reason}")]
    Parse {
        line: usize,
        content: String,
        reason: ParseReason,
    },

    #[error("no neighbor entry for {0}")]
    NotFound(MacAddress),

    #[error("failed to read neighbor table: {0}")]
    Io(#[from] std::io::Error),

    #[error("neighbor command failed: {0}")]
    Command(String),
}

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe cancelled")]
    Cancelled,

    #[error("probe I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Fatal(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid {method} method: {reason}")]
    InvalidMethod {
        method: &'static str,
        reason: &'static str,
    },

    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug, PartialEq)]
pub enum DecodeError {
    #[error("datagram is not valid UTF-8")]
    NotUtf8,

    #[error("invalid telemetry key-value pair {0:?}")]
    InvalidPair(String),

    #[error("invalid telemetry value in {pair:?}: {source}")]
    InvalidValue {
        pair: String,
        source: ParseFloatError,
    },
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("broker socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("broker queue closed")]
    Closed,

    #[error("broker task failed: {0}")]
    Task(String),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("device {mac} rejected: {source}")]
    Registration { mac: MacAddress, source: ConfigError },

    #[error("presence tracker is not running")]
    Stopped,
}
