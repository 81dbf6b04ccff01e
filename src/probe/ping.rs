use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use log::{debug, warn};
use surge_ping::{Client, Config, ICMP, PingIdentifier, PingSequence, SurgeError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{ActivityRecorder, Probe, Target};
use crate::error::ProbeError;

const PAYLOAD: [u8; 56] = [0; 56];

/// Sends an ICMP echo request every interval. Every reply counts as activity;
/// a lost echo is simply not reported.
pub struct PingProbe {
    interval: Duration,
}

impl PingProbe {
    pub fn new(interval: Duration) -> Self {
        PingProbe { interval }
    }
}

#[async_trait]
impl Probe for PingProbe {
    fn name(&self) -> &'static str {
        "ping"
    }

    async fn run(
        &self,
        target: Target,
        cancel: CancellationToken,
        activity: Arc<dyn ActivityRecorder>,
    ) -> Result<Infallible, ProbeError> {
        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }

        let kind = if target.ip.is_ipv4() { ICMP::V4 } else { ICMP::V6 };
        let client = Client::new(&Config::builder().kind(kind).build())
            .map_err(|e| ProbeError::Fatal(format!("failed to open ICMP socket: {e}")))?;

        let mut pinger = client.pinger(target.ip, PingIdentifier(ping_id())).await;
        pinger.timeout(self.interval);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut seq: u16 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
                _ = ticker.tick() => {}
            }

            let reply = tokio::select! {
                _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
                reply = pinger.ping(PingSequence(seq), &PAYLOAD) => reply,
            };
            seq = seq.wrapping_add(1);

            observe(target.ip, reply, activity.as_ref());
        }
    }
}

/// Only a reply is activity. Lost echoes and send errors leave the probe
/// running.
fn observe<P>(ip: IpAddr, reply: Result<(P, Duration), SurgeError>, activity: &dyn ActivityRecorder) {
    match reply {
        Ok((_, rtt)) => {
            debug!("echo reply from {} in {:?}", ip, rtt);
            activity.record();
        }
        Err(SurgeError::Timeout { .. }) => {
            debug!("no echo reply from {}", ip);
        }
        Err(e) => {
            warn!("failed to ping {}: {}", ip, e);
        }
    }
}

fn ping_id() -> u16 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    ((nanos % 0xFFFF) as u16).wrapping_add(1)
}
