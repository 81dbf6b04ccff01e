use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::BrokerError;
use crate::telemetry::TelemetryStore;

pub mod memory;
pub mod udp;

pub use memory::MemoryBroker;
pub use udp::UdpBroker;

/// A source of telemetry feeding the shared store.
///
/// `run` returns `Ok(())` once cancelled; any error is fatal for the hub.
#[async_trait]
pub trait Broker: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, cancel: CancellationToken, store: Arc<TelemetryStore>) -> Result<(), BrokerError>;
}

/// Runs every broker against one store.
pub struct Hub {
    store: Arc<TelemetryStore>,
    brokers: Vec<Arc<dyn Broker>>,
}

impl Hub {
    pub fn new() -> Self {
        Hub {
            store: Arc::new(TelemetryStore::new()),
            brokers: Vec::new(),
        }
    }

    pub fn telemetries(&self) -> Arc<TelemetryStore> {
        self.store.clone()
    }

    pub fn add_broker(&mut self, broker: Arc<dyn Broker>) {
        self.brokers.push(broker);
    }

    /// Runs all brokers concurrently. The first failure cancels the rest and
    /// is returned once they have stopped.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), BrokerError> {
        let cancel = cancel.child_token();
        let mut brokers = JoinSet::new();

        for broker in &self.brokers {
            let broker = broker.clone();
            let store = self.store.clone();
            let cancel = cancel.clone();

            brokers.spawn(async move {
                info!("running {} broker", broker.name());
                let result = broker.run(cancel, store).await;
                info!("stopped {} broker", broker.name());
                result
            });
        }

        let mut result = Ok(());
        while let Some(joined) = brokers.join_next().await {
            let outcome = joined
                .map_err(|e| BrokerError::Task(e.to_string()))
                .and_then(|outcome| outcome);

            if let Err(e) = outcome {
                if result.is_ok() {
                    cancel.cancel();
                    result = Err(e);
                } else {
                    warn!("broker failed during shutdown: {}", e);
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;

    struct FailingBroker;

    #[async_trait]
    impl Broker for FailingBroker {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn run(&self, _: CancellationToken, _: Arc<TelemetryStore>) -> Result<(), BrokerError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(BrokerError::Closed)
        }
    }

    #[derive(Default)]
    struct IdleBroker {
        cancelled: AtomicBool,
    }

    #[async_trait]
    impl Broker for IdleBroker {
        fn name(&self) -> &'static str {
            "idle"
        }

        async fn run(&self, cancel: CancellationToken, _: Arc<TelemetryStore>) -> Result<(), BrokerError> {
            cancel.cancelled().await;
            self.cancelled.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failure_cancels_siblings() {
        let idle = Arc::new(IdleBroker::default());
        let mut hub = Hub::new();
        hub.add_broker(idle.clone());
        hub.add_broker(Arc::new(FailingBroker));

        let root = CancellationToken::new();
        let result = tokio::time::timeout(Duration::from_secs(5), hub.run(root.clone()))
            .await
            .unwrap();

        assert!(matches!(result, Err(BrokerError::Closed)));
        assert!(idle.cancelled.load(Ordering::SeqCst));
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_stops_cleanly() {
        let mut hub = Hub::new();
        hub.add_broker(Arc::new(IdleBroker::default()));
        hub.add_broker(Arc::new(IdleBroker::default()));

        let root = CancellationToken::new();
        root.cancel();

        assert!(hub.run(root).await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_broker_feeds_store() {
        let memory = Arc::new(MemoryBroker::new());
        let mut hub = Hub::new();
        hub.add_broker(memory.clone());
        let store = hub.telemetries();

        let cancel = CancellationToken::new();
        let running = tokio::spawn({
            let cancel = cancel.clone();
            async move { hub.run(cancel).await }
        });

        memory.add("/home/d0:d2:b0:9c:f7:7d", 1.0).await.unwrap();

        let mut value = None;
        for _ in 0..50 {
            if let Some(t) = store.read("/home").pop() {
                value = Some(t.value);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(value, Some(1.0));

        cancel.cancel();
        assert!(running.await.unwrap().is_ok());
    }
}
