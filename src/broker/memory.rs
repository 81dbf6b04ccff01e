use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::Broker;
use crate::error::BrokerError;
use crate::telemetry::{Telemetry, TelemetryStore};

const QUEUE_SIZE: usize = 128;

/// In-process queue letting local producers publish without touching the
/// store directly.
pub struct MemoryBroker {
    tx: mpsc::Sender<Telemetry>,
    rx: Mutex<mpsc::Receiver<Telemetry>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_SIZE);
        MemoryBroker {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Enqueues a value, waiting while the queue is full.
    pub async fn add(&self, topic: impl Into<String>, value: f64) -> Result<(), BrokerError> {
        self.tx
            .send(Telemetry::new(topic, value))
            .await
            .map_err(|_| BrokerError::Closed)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn run(&self, cancel: CancellationToken, store: Arc<TelemetryStore>) -> Result<(), BrokerError> {
        let mut rx = self.rx.lock().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                telemetry = rx.recv() => {
                    let Some(telemetry) = telemetry else {
                        return Err(BrokerError::Closed);
                    };

                    let mut batch = vec![telemetry];
                    while let Ok(telemetry) = rx.try_recv() {
                        batch.push(telemetry);
                    }
                    store.put_multi(batch);
                }
            }
        }
    }
}
