use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant, SystemTime};

use log::{debug, info, warn};
use mac_address::MacAddress;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::MethodConfig;
use crate::error::{EngineError, ProbeError};
use crate::messages::TrackerEvent;
use crate::neighbor::NeighborResolver;
use crate::probe::{self, ActivityRecorder, Probe, ProbeSettings, Target};

const EVENT_QUEUE_SIZE: usize = 128;

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    /// Only neighbors on this interface are considered.
    pub interface: Option<String>,
    pub refresh_interval: Duration,
    pub idle_timeout: Duration,
    pub probe: ProbeSettings,
}

#[derive(Debug)]
struct DeviceActivity {
    ip: Option<IpAddr>,
    /// Reported wall clock time of the latest activity.
    last_seen: Option<SystemTime>,
    /// Monotonic twin of `last_seen`, used for liveness.
    last_active: Option<Instant>,
    generation: u64,
}

/// Per-device liveness shared between the control loop, the probes and
/// readers.
///
/// Only the control loop changes addresses and generations. Probes only
/// touch `last_seen`, and only while their generation is current.
#[derive(Debug, Default)]
pub struct ActivityMap {
    devices: RwLock<HashMap<MacAddress, DeviceActivity>>,
}

impl ActivityMap {
    pub fn last_seen(&self, mac: MacAddress) -> Option<SystemTime> {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        devices.get(&mac).and_then(|device| device.last_seen)
    }

    fn active_within(&self, mac: MacAddress, idle_timeout: Duration) -> bool {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        devices
            .get(&mac)
            .and_then(|device| device.last_active)
            .is_some_and(|last_active| last_active.elapsed() < idle_timeout)
    }

    fn address(&self, mac: MacAddress) -> Option<IpAddr> {
        let devices = self.devices.read().unwrap_or_else(PoisonError::into_inner);
        devices.get(&mac).and_then(|device| device.ip)
    }

    /// Supersedes the current generation, forgetting its activity.
    fn begin_generation(&self, mac: MacAddress, ip: Option<IpAddr>) -> u64 {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        let device = devices.entry(mac).or_insert(DeviceActivity {
            ip: None,
            last_seen: None,
            last_active: None,
            generation: 0,
        });

        device.generation += 1;
        device.ip = ip;
        device.last_seen = None;
        device.last_active = None;
        device.generation
    }

    /// Returns false when `generation` has been superseded.
    fn touch(&self, mac: MacAddress, generation: u64) -> bool {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        match devices.get_mut(&mac) {
            Some(device) if device.generation == generation => {
                device.last_seen = Some(SystemTime::now());
                device.last_active = Some(Instant::now());
                true
            }
            _ => false,
        }
    }
}

/// Activity recorder handed to the probes of one generation.
struct GenerationRecorder {
    mac: MacAddress,
    generation: u64,
    activity: Arc<ActivityMap>,
}

impl ActivityRecorder for GenerationRecorder {
    fn record(&self) {
        if !self.activity.touch(self.mac, self.generation) {
            debug!("dropped stale activity for {} (generation {})", self.mac, self.generation);
        }
    }
}

/// The running probes of one device generation.
struct DeviceWatcher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl DeviceWatcher {
    /// Starts the probes once `previous` (the superseded generation) has
    /// fully stopped.
    fn spawn(
        target: Target,
        generation: u64,
        probes: Vec<Arc<dyn Probe>>,
        cancel: CancellationToken,
        activity: Arc<ActivityMap>,
        previous: Option<JoinHandle<()>>,
    ) -> Self {
        let recorder = Arc::new(GenerationRecorder {
            mac: target.mac,
            generation,
            activity,
        });

        let handle = tokio::spawn(watch(target, probes, cancel.clone(), recorder, previous));

        DeviceWatcher { cancel, handle }
    }

    fn retire(self) -> JoinHandle<()> {
        self.cancel.cancel();
        self.handle
    }
}

async fn watch(
    target: Target,
    probes: Vec<Arc<dyn Probe>>,
    cancel: CancellationToken,
    recorder: Arc<GenerationRecorder>,
    previous: Option<JoinHandle<()>>,
) {
    if let Some(previous) = previous {
        if let Err(e) = previous.await {
            warn!("previous watcher for {} failed: {}", target.mac, e);
        }
    }
    if cancel.is_cancelled() {
        return;
    }

    info!("watching for {} at {}", target.mac, target.ip);

    let mut running = JoinSet::new();
    for probe in probes {
        let cancel = cancel.clone();
        let recorder: Arc<dyn ActivityRecorder> = recorder.clone();

        running.spawn(async move {
            let result = probe.run(target, cancel, recorder).await;
            (probe.name(), result)
        });
    }

    while let Some(joined) = running.join_next().await {
        match joined {
            Ok((_, Ok(never))) => match never {},
            Ok((name, Err(ProbeError::Cancelled))) => {
                debug!("{} probe for {} cancelled", name, target.mac);
            }
            Ok((name, Err(e))) => warn!("{} probe for {} stopped: {}", name, target.mac, e),
            Err(e) => warn!("probe task for {} failed: {}", target.mac, e),
        }
    }

    info!("stopped watching for {}", target.mac);
}

/// Handle used to register devices and query their liveness. Cheap to clone
/// and safe to use from any task.
#[derive(Clone)]
pub struct PresenceTracker {
    events: mpsc::Sender<TrackerEvent>,
    activity: Arc<ActivityMap>,
    idle_timeout: Duration,
    probe_settings: ProbeSettings,
}

impl PresenceTracker {
    pub fn new(resolver: NeighborResolver, settings: TrackerSettings) -> (Self, TrackerLoop) {
        let (events, rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let activity = Arc::new(ActivityMap::default());

        let tracker = PresenceTracker {
            events,
            activity: activity.clone(),
            idle_timeout: settings.idle_timeout,
            probe_settings: settings.probe,
        };

        let control = TrackerLoop {
            events: rx,
            resolver,
            activity,
            interface: settings.interface,
            refresh_interval: settings.refresh_interval,
            registrations: HashMap::new(),
            watchers: HashMap::new(),
            retired: HashMap::new(),
        };

        (tracker, control)
    }

    /// Registers a device, replacing any previous registration. Every
    /// method is validated before anything is queued. Waits while the event
    /// queue is full.
    pub async fn register(&self, mac: MacAddress, methods: &[MethodConfig]) -> Result<(), EngineError> {
        let probes = methods
            .iter()
            .map(|method| probe::build(method, &self.probe_settings))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| EngineError::Registration { mac, source })?;

        self.register_probes(mac, probes).await
    }

    pub async fn register_probes(&self, mac: MacAddress, probes: Vec<Arc<dyn Probe>>) -> Result<(), EngineError> {
        self.events
            .send(TrackerEvent::Register { mac, probes })
            .await
            .map_err(|_| EngineError::Stopped)
    }

    /// Measured on the monotonic clock, so wall clock steps do not change
    /// the answer.
    pub fn is_up(&self, mac: MacAddress) -> bool {
        self.activity.active_within(mac, self.idle_timeout)
    }

    /// `None` until the device's current generation reports activity.
    pub fn last_seen(&self, mac: MacAddress) -> Option<SystemTime> {
        self.activity.last_seen(mac)
    }
}

/// The single control loop serializing registrations and address refreshes.
pub struct TrackerLoop {
    events: mpsc::Receiver<TrackerEvent>,
    resolver: NeighborResolver,
    activity: Arc<ActivityMap>,
    interface: Option<String>,
    refresh_interval: Duration,
    registrations: HashMap<MacAddress, Vec<Arc<dyn Probe>>>,
    watchers: HashMap<MacAddress, DeviceWatcher>,
    /// Cancelled generations not yet awaited by a successor.
    retired: HashMap<MacAddress, JoinHandle<()>>,
}

impl TrackerLoop {
    /// Runs until `cancel` fires, then waits for every watcher to stop.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.refresh(&cancel).await,
                event = self.events.recv(), if events_open => match event {
                    Some(TrackerEvent::Register { mac, probes }) => self.register(mac, probes),
                    None => {
                        debug!("all tracker handles dropped");
                        events_open = false;
                    }
                },
            }
        }

        self.shutdown().await;
    }

    fn register(&mut self, mac: MacAddress, probes: Vec<Arc<dyn Probe>>) {
        info!("registered {} with {} methods", mac, probes.len());

        self.retire(mac);
        self.activity.begin_generation(mac, None);
        self.registrations.insert(mac, probes);
    }

    async fn refresh(&mut self, cancel: &CancellationToken) {
        debug!("updating neighbor cache");

        let records = match self.resolver.scan(self.interface.as_deref()).await {
            Ok(records) => records,
            Err(e) => {
                warn!("failed to scan for devices: {}", e);
                return;
            }
        };

        let mut seen = HashSet::new();
        for record in records {
            let mac = record.hardware_address;
            if !self.registrations.contains_key(&mac) || !seen.insert(mac) {
                continue;
            }

            match self.activity.address(mac) {
                Some(ip) if ip == record.ip => continue,
                Some(ip) => info!("updated IP address for {}: {} -> {}", mac, ip, record.ip),
                None => info!("resolved {} to {}", mac, record.ip),
            }

            self.spawn_generation(Target { mac, ip: record.ip }, cancel);
        }

        self.retired.retain(|_, handle| !handle.is_finished());
    }

    fn spawn_generation(&mut self, target: Target, cancel: &CancellationToken) {
        self.retire(target.mac);

        let generation = self.activity.begin_generation(target.mac, Some(target.ip));
        let probes = self.registrations.get(&target.mac).cloned().unwrap_or_default();
        let previous = self.retired.remove(&target.mac);

        let watcher = DeviceWatcher::spawn(
            target,
            generation,
            probes,
            cancel.child_token(),
            self.activity.clone(),
            previous,
        );
        self.watchers.insert(target.mac, watcher);
    }

    fn retire(&mut self, mac: MacAddress) {
        if let Some(watcher) = self.watchers.remove(&mac) {
            self.retired.insert(mac, watcher.retire());
        }
    }

    async fn shutdown(&mut self) {
        let handles: Vec<_> = self
            .watchers
            .drain()
            .map(|(_, watcher)| watcher.retire())
            .chain(self.retired.drain().map(|(_, handle)| handle))
            .collect();

        info!("stopping {} watchers", handles.len());
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!("watcher failed during shutdown: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use async_trait::async_trait;
    use std::convert::Infallible;

    use super::*;
    use crate::neighbor::parse_hardware_address;
    use crate::neighbor::tests::{FakeTable, record};

    const PHONE: &str = "d0:d2:b0:9c:f7:7d";

    /// Runs until cancelled, remembering every start.
    #[derive(Default)]
    struct FakeProbe {
        started: Mutex<Vec<(Target, Arc<dyn ActivityRecorder>)>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl FakeProbe {
        fn starts(&self) -> usize {
            self.started.lock().unwrap().len()
        }

        fn latest(&self) -> (Target, Arc<dyn ActivityRecorder>) {
            self.started.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl Probe for FakeProbe {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn run(
            &self,
            target: Target,
            cancel: CancellationToken,
            activity: Arc<dyn ActivityRecorder>,
        ) -> Result<Infallible, ProbeError> {
            self.started.lock().unwrap().push((target, activity));
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);

            cancel.cancelled().await;

            self.running.fetch_sub(1, Ordering::SeqCst);
            Err(ProbeError::Cancelled)
        }
    }

    struct BrokenProbe;

    #[async_trait]
    impl Probe for BrokenProbe {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn run(
            &self,
            _: Target,
            _: CancellationToken,
            _: Arc<dyn ActivityRecorder>,
        ) -> Result<Infallible, ProbeError> {
            Err(ProbeError::Fatal("capture device vanished".to_string()))
        }
    }

    fn mac() -> MacAddress {
        parse_hardware_address(PHONE).unwrap()
    }

    fn start(table: Arc<FakeTable>, idle_timeout: Duration) -> (PresenceTracker, CancellationToken, JoinHandle<()>) {
        let settings = TrackerSettings {
            interface: None,
            refresh_interval: Duration::from_millis(20),
            idle_timeout,
            probe: ProbeSettings {
                dial_timeout: Duration::from_secs(1),
            },
        };
        let (tracker, control) = PresenceTracker::new(NeighborResolver::new(table), settings);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(control.run(cancel.clone()));

        (tracker, cancel, handle)
    }

    async fn eventually(what: &str, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_up_after_first_activity() {
        let table = Arc::new(FakeTable::default());
        table.set(vec![record(PHONE, [192, 168, 1, 43], "br0")]);
        let (tracker, cancel, handle) = start(table, Duration::from_secs(300));

        let probe = Arc::new(FakeProbe::default());
        tracker.register_probes(mac(), vec![probe.clone() as Arc<dyn Probe>]).await.unwrap();
        eventually("probe start", || probe.starts() == 1).await;

        let (target, recorder) = probe.latest();
        assert_eq!(target.ip, "192.168.1.43".parse::<IpAddr>().unwrap());
        assert!(!tracker.is_up(mac()));
        assert_eq!(tracker.last_seen(mac()), None);

        recorder.record();
        assert!(tracker.is_up(mac()));
        assert!(tracker.last_seen(mac()).is_some());

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(probe.running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let table = Arc::new(FakeTable::default());
        table.set(vec![record(PHONE, [192, 168, 1, 43], "br0")]);
        let (tracker, cancel, handle) = start(table, Duration::from_millis(50));

        let probe = Arc::new(FakeProbe::default());
        tracker.register_probes(mac(), vec![probe.clone() as Arc<dyn Probe>]).await.unwrap();
        eventually("probe start", || probe.starts() == 1).await;

        probe.latest().1.record();
        assert!(tracker.is_up(mac()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!tracker.is_up(mac()));
        assert!(tracker.last_seen(mac()).is_some());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_liveness_ignores_wall_clock() {
        let table = Arc::new(FakeTable::default());
        let (tracker, cancel, handle) = start(table, Duration::from_millis(50));

        // Wall clock stepped back after the last activity.
        let seen = SystemTime::now() + Duration::from_secs(3600);
        tracker.activity.devices.write().unwrap().insert(
            mac(),
            DeviceActivity {
                ip: None,
                last_seen: Some(seen),
                last_active: Some(Instant::now()),
                generation: 1,
            },
        );
        assert!(tracker.is_up(mac()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!tracker.is_up(mac()));
        assert_eq!(tracker.last_seen(mac()), Some(seen));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_address_change_replaces_generation() {
        let table = Arc::new(FakeTable::default());
        table.set(vec![record(PHONE, [192, 168, 1, 43], "br0")]);
        let (tracker, cancel, handle) = start(table.clone(), Duration::from_secs(300));

        let probe = Arc::new(FakeProbe::default());
        tracker.register_probes(mac(), vec![probe.clone() as Arc<dyn Probe>]).await.unwrap();
        eventually("first generation", || probe.starts() == 1).await;
        let (_, stale) = probe.latest();
        stale.record();
        assert!(tracker.is_up(mac()));

        table.set(vec![record(PHONE, [192, 168, 1, 44], "br0")]);
        eventually("second generation", || probe.starts() == 2).await;

        let (target, current) = probe.latest();
        assert_eq!(target.ip, "192.168.1.44".parse::<IpAddr>().unwrap());
        assert_eq!(probe.max_running.load(Ordering::SeqCst), 1);
        assert!(!tracker.is_up(mac()));

        // A late callback from the cancelled generation is ignored.
        stale.record();
        assert_eq!(tracker.last_seen(mac()), None);

        current.record();
        assert!(tracker.is_up(mac()));

        // Same address again: nothing changes.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(probe.starts(), 2);
        assert_eq!(probe.running.load(Ordering::SeqCst), 1);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(probe.running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reregistration_discards_generation() {
        let table = Arc::new(FakeTable::default());
        table.set(vec![record(PHONE, [192, 168, 1, 43], "br0")]);
        let (tracker, cancel, handle) = start(table, Duration::from_secs(300));

        let first = Arc::new(FakeProbe::default());
        tracker.register_probes(mac(), vec![first.clone() as Arc<dyn Probe>]).await.unwrap();
        eventually("first generation", || first.starts() == 1).await;
        let (_, stale) = first.latest();
        stale.record();
        assert!(tracker.is_up(mac()));

        let second = Arc::new(FakeProbe::default());
        tracker.register_probes(mac(), vec![second.clone() as Arc<dyn Probe>]).await.unwrap();
        eventually("old probes cancelled", || first.running.load(Ordering::SeqCst) == 0).await;
        eventually("new generation", || second.starts() == 1).await;

        stale.record();
        assert!(!tracker.is_up(mac()));

        second.latest().1.record();
        assert!(tracker.is_up(mac()));
        assert_eq!(first.starts(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_probe_leaves_siblings_running() {
        let table = Arc::new(FakeTable::default());
        table.set(vec![record(PHONE, [192, 168, 1, 43], "br0")]);
        let (tracker, cancel, handle) = start(table, Duration::from_secs(300));

        let probe = Arc::new(FakeProbe::default());
        tracker
            .register_probes(mac(), vec![Arc::new(BrokenProbe) as Arc<dyn Probe>, probe.clone()])
            .await
            .unwrap();
        eventually("probe start", || probe.starts() == 1).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(probe.running.load(Ordering::SeqCst), 1);

        probe.latest().1.record();
        assert!(tracker.is_up(mac()));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_watchers() {
        let table = Arc::new(FakeTable::default());
        table.set(vec![record(PHONE, [192, 168, 1, 43], "br0")]);
        let (tracker, cancel, handle) = start(table.clone(), Duration::from_secs(300));

        let probe = Arc::new(FakeProbe::default());
        tracker.register_probes(mac(), vec![probe.clone() as Arc<dyn Probe>]).await.unwrap();
        eventually("probe start", || probe.starts() == 1).await;

        *table.fail.lock().unwrap() = true;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(probe.starts(), 1);
        assert_eq!(probe.running.load(Ordering::SeqCst), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unresolved_and_unregistered_devices() {
        let table = Arc::new(FakeTable::default());
        table.set(vec![record("a4:d9:31:d0:38:e9", [192, 168, 1, 32], "br0")]);
        let (tracker, cancel, handle) = start(table, Duration::from_secs(300));

        let probe = Arc::new(FakeProbe::default());
        tracker.register_probes(mac(), vec![probe.clone() as Arc<dyn Probe>]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(probe.starts(), 0);
        assert!(!tracker.is_up(mac()));
        assert!(!tracker.is_up(parse_hardware_address("a4:d9:31:d0:38:e9").unwrap()));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_register_rejects_bad_methods() {
        let table = Arc::new(FakeTable::default());
        let (tracker, cancel, handle) = start(table, Duration::from_secs(300));

        let methods = [
            MethodConfig::Pcap { dev: "br0".to_string() },
            MethodConfig::Ping {
                interval_seconds: Some(0),
            },
        ];
        let err = tracker.register(mac(), &methods).await.unwrap_err();
        assert!(matches!(err, EngineError::Registration { .. }), "{err}");

        cancel.cancel();
        handle.await.unwrap();

        let err = tracker.register(mac(), &methods[..1]).await.unwrap_err();
        assert!(matches!(err, EngineError::Stopped));
    }
}
