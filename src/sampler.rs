use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use mac_address::MacAddress;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::broker::MemoryBroker;
use crate::config::DeviceConfig;
use crate::error::BrokerError;
use crate::messages::DevicePresence;
use crate::telemetry::TelemetryStore;
use crate::tracker::PresenceTracker;

/// Periodically publishes every device's presence (1.0 / 0.0) through the
/// memory broker.
pub struct LivenessSampler {
    tracker: PresenceTracker,
    memory: Arc<MemoryBroker>,
    /// Hardware address, display label and topic per device.
    devices: Vec<(MacAddress, String, String)>,
    interval: Duration,
}

impl LivenessSampler {
    pub fn new(
        tracker: PresenceTracker,
        memory: Arc<MemoryBroker>,
        devices: &[DeviceConfig],
        topic_prefix: &str,
        interval: Duration,
    ) -> Self {
        let devices = devices
            .iter()
            .map(|device| (device.address, label(device), topic(topic_prefix, device.address)))
            .collect();

        LivenessSampler {
            tracker,
            memory,
            devices,
            interval,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<(), BrokerError> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => self.sample().await?,
            }
        }
    }

    async fn sample(&self) -> Result<(), BrokerError> {
        for (mac, label, topic) in &self.devices {
            let presence = DevicePresence::from(self.tracker.is_up(*mac));
            debug!("{} is {:?}", label, presence);
            self.memory.add(topic.clone(), presence.value()).await?;
        }

        Ok(())
    }
}

/// Logs the whole store every interval.
pub async fn report(store: Arc<TelemetryStore>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately and the store is still empty.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                debug!("reporting {} telemetries", store.len());
                let mut telemetries = store.read("/");
                telemetries.sort_by(|a, b| a.topic.cmp(&b.topic));

                for (id, telemetry) in telemetries.iter().enumerate() {
                    info!("[{}] {}: {:.2}", id, telemetry.topic, telemetry.value);
                }
            }
        }
    }
}

/// `<prefix>/<mac>`. Keyed on the hardware address so no two devices share
/// a topic.
fn topic(prefix: &str, mac: MacAddress) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), mac.to_string().to_lowercase())
}

/// Name for log lines, falling back to the hardware address.
pub fn label(device: &DeviceConfig) -> String {
    match &device.name {
        Some(name) => format!("{} ({})", name, device.address),
        None => device.address.to_string(),
    }
}
