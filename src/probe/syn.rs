use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{ActivityRecorder, Probe, Target};
use crate::error::ProbeError;

/// Opens (and immediately closes) a TCP connection every interval. Only a
/// completed handshake counts as activity.
pub struct SynProbe {
    port: u16,
    interval: Duration,
    dial_timeout: Duration,
}

impl SynProbe {
    pub fn new(port: u16, interval: Duration, dial_timeout: Duration) -> Self {
        SynProbe {
            port,
            interval,
            dial_timeout,
        }
    }

    async fn execute(&self, addr: SocketAddr) -> Result<(), ProbeError> {
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                ProbeError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect timed out after {:?}", self.dial_timeout),
                ))
            })??;
        drop(stream);

        Ok(())
    }
}

#[async_trait]
impl Probe for SynProbe {
    fn name(&self) -> &'static str {
        "syn"
    }

    async fn run(
        &self,
        target: Target,
        cancel: CancellationToken,
        activity: Arc<dyn ActivityRecorder>,
    ) -> Result<Infallible, ProbeError> {
        let addr = SocketAddr::new(target.ip, self.port);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
                result = self.execute(addr) => result,
            };

            match result {
                Ok(()) => {
                    debug!("connected to {}", addr);
                    activity.record();
                }
                Err(e) => warn!("failed to connect to {}: {}", addr, e),
            }
        }
    }
}
