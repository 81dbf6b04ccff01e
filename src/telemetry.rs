use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::SystemTime;

pub type Topic = String;

#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    pub topic: Topic,
    pub value: f64,
    /// When the value was received. Assigned on our side, never by the
    /// sender, to avoid clock skew.
    pub timestamp: SystemTime,
}

impl Telemetry {
    pub fn new(topic: impl Into<Topic>, value: f64) -> Self {
        Telemetry {
            topic: topic.into(),
            value,
            timestamp: SystemTime::now(),
        }
    }
}

/// Latest value per topic. No history is kept.
#[derive(Debug, Default)]
pub struct TelemetryStore {
    telemetries: RwLock<HashMap<Topic, Telemetry>>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every entry whose topic starts with `prefix`; an empty prefix
    /// or `/` returns everything. Order is unspecified.
    pub fn read(&self, prefix: &str) -> Vec<Telemetry> {
        let telemetries = self.telemetries.read().unwrap_or_else(PoisonError::into_inner);

        let everything = prefix.is_empty() || prefix == "/";
        telemetries
            .values()
            .filter(|telemetry| everything || telemetry.topic.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Upserts a batch under one write lock, stamping each entry with the
    /// time of the call.
    pub fn put_multi(&self, batch: Vec<Telemetry>) {
        let now = SystemTime::now();
        let mut telemetries = self.telemetries.write().unwrap_or_else(PoisonError::into_inner);

        for mut telemetry in batch {
            telemetry.timestamp = now;
            telemetries.insert(telemetry.topic.clone(), telemetry);
        }
    }

    pub fn len(&self) -> usize {
        self.telemetries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_by_prefix() {
        let store = TelemetryStore::new();
        store.put_multi(vec![
            Telemetry::new("/home/a", 1.0),
            Telemetry::new("/home/b", 0.0),
            Telemetry::new("/office/c", 21.5),
        ]);

        let mut topics: Vec<_> = store.read("/home").into_iter().map(|t| t.topic).collect();
        topics.sort();
        assert_eq!(topics, vec!["/home/a", "/home/b"]);

        assert_eq!(store.read("/").len(), 3);
        assert_eq!(store.read("").len(), 3);
        assert!(store.read("/garage").is_empty());
    }

    #[test]
    fn test_last_write_wins() {
        let store = TelemetryStore::new();
        store.put_multi(vec![Telemetry::new("temp", 21.5)]);
        let first = store.read("temp")[0].timestamp;

        store.put_multi(vec![Telemetry::new("temp", 22.0), Telemetry::new("humidity", 47.0)]);

        let temp = store.read("temp");
        assert_eq!(temp.len(), 1);
        assert_eq!(temp[0].value, 22.0);
        assert!(temp[0].timestamp >= first);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_root_prefix_includes_bare_topics() {
        let store = TelemetryStore::new();
        store.put_multi(vec![Telemetry::new("temp", 21.5), Telemetry::new("/home/a", 1.0)]);

        assert_eq!(store.read("/").len(), 2);
        assert_eq!(store.read("/home").len(), 1);
    }
}
