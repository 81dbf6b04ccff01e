use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mac_address::MacAddress;
use tokio_util::sync::CancellationToken;

use crate::config::MethodConfig;
use crate::error::{ConfigError, ProbeError};

pub mod capture;
pub mod filter;
pub mod ping;
pub mod syn;

pub use capture::CaptureProbe;
pub use ping::PingProbe;
pub use syn::SynProbe;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// The resolved device a probe is aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub mac: MacAddress,
    pub ip: IpAddr,
}

/// Receives evidence of life from a running probe.
pub trait ActivityRecorder: Send + Sync {
    fn record(&self);
}

/// A liveness detection technique.
///
/// `run` keeps probing until `cancel` fires or a fatal error occurs, so it
/// only ever returns an error. Cancellation surfaces as
/// [`ProbeError::Cancelled`].
#[async_trait]
pub trait Probe: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(
        &self,
        target: Target,
        cancel: CancellationToken,
        activity: Arc<dyn ActivityRecorder>,
    ) -> Result<Infallible, ProbeError>;
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeSettings {
    /// Upper bound on a single TCP connect.
    pub dial_timeout: Duration,
}

/// Builds the probe for one configured method, rejecting bad arguments
/// before anything is started.
pub fn build(method: &MethodConfig, settings: &ProbeSettings) -> Result<Arc<dyn Probe>, ConfigError> {
    match method {
        MethodConfig::Ping { interval_seconds } => {
            let interval = interval(method, *interval_seconds)?;
            Ok(Arc::new(PingProbe::new(interval)))
        }
        MethodConfig::Syn {
            port,
            interval_seconds,
        } => {
            if *port == 0 {
                return Err(ConfigError::InvalidMethod {
                    method: method.tag(),
                    reason: "port must be non-zero",
                });
            }
            let interval = interval(method, *interval_seconds)?;
            Ok(Arc::new(SynProbe::new(*port, interval, settings.dial_timeout)))
        }
        MethodConfig::Pcap { dev } => {
            if dev.trim().is_empty() {
                return Err(ConfigError::InvalidMethod {
                    method: method.tag(),
                    reason: "capture device name is empty",
                });
            }
            Ok(Arc::new(CaptureProbe::new(dev.clone())))
        }
    }
}

fn interval(method: &MethodConfig, seconds: Option<u64>) -> Result<Duration, ConfigError> {
    match seconds {
        None => Ok(DEFAULT_INTERVAL),
        Some(0) => Err(ConfigError::InvalidMethod {
            method: method.tag(),
            reason: "interval must be non-zero",
        }),
        Some(seconds) => Ok(Duration::from_secs(seconds)),
    }
}
