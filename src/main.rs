use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

mod broker;
mod config;
mod error;
mod messages;
mod neighbor;
mod probe;
mod sampler;
mod telemetry;
mod tracker;

use broker::{Hub, MemoryBroker, UdpBroker};
use config::{AppConfig, LoggingConfig};
use error::NeighborError;
use neighbor::NeighborResolver;
use probe::ProbeSettings;
use sampler::LivenessSampler;
use tracker::{PresenceTracker, TrackerSettings};

const DEFAULT_BROKER_PORT: u16 = 9000;

/// Network device presence tracker and telemetry broker.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Load configuration from FILE (TOML, or JSON with a .json extension).
    #[arg(short, long, value_name = "FILE", default_value = "/etc/presence-rs/config.toml")]
    config: PathBuf,
}

fn init_logging(config: Option<&LoggingConfig>) {
    let level = config.and_then(|c| c.level.as_deref()).unwrap_or("info");

    let mut builder = pretty_env_logger::formatted_builder();
    builder.parse_filters(level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = AppConfig::load(&args.config)?;
    init_logging(config.logging.as_ref());

    let tracking = config.tracking.clone().unwrap_or_default();
    let devices = config.devices.clone().unwrap_or_default();
    let port = config
        .broker
        .as_ref()
        .and_then(|b| b.port)
        .unwrap_or(DEFAULT_BROKER_PORT);

    info!("initialized presence-rs, tracking {} devices", devices.len());

    let cancel = CancellationToken::new();
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    let resolver = NeighborResolver::new(neighbor::platform_table(tracking.interface.as_deref()));
    for device in &devices {
        let label = sampler::label(device);
        match resolver.locate(device.address).await {
            Ok(records) => {
                let ips: Vec<_> = records.iter().map(|record| record.ip.to_string()).collect();
                info!("{} currently at {}", label, ips.join(", "));
            }
            Err(NeighborError::NotFound(_)) => info!("{} not in the neighbor table yet", label),
            Err(e) => warn!("failed to look up {}: {}", label, e),
        }
    }

    let (tracker, control) = PresenceTracker::new(
        resolver,
        TrackerSettings {
            interface: tracking.interface.clone(),
            refresh_interval: tracking.refresh_interval(),
            idle_timeout: tracking.idle_timeout(),
            probe: ProbeSettings {
                dial_timeout: tracking.dial_timeout(),
            },
        },
    );
    tasks.spawn({
        let cancel = cancel.clone();
        async move {
            control.run(cancel).await;
            Ok(())
        }
    });

    for device in &devices {
        if let Err(e) = tracker.register(device.address, &device.methods).await {
            cancel.cancel();
            while tasks.join_next().await.is_some() {}
            return Err(e.into());
        }
    }

    let memory = Arc::new(MemoryBroker::new());
    let mut hub = Hub::new();
    hub.add_broker(memory.clone());
    match UdpBroker::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await {
        Ok(udp) => hub.add_broker(Arc::new(udp)),
        Err(e) => {
            cancel.cancel();
            while tasks.join_next().await.is_some() {}
            return Err(e.into());
        }
    }
    let store = hub.telemetries();

    tasks.spawn({
        let cancel = cancel.clone();
        async move { hub.run(cancel).await.map_err(anyhow::Error::from) }
    });

    let sampler = LivenessSampler::new(
        tracker,
        memory,
        &devices,
        tracking.topic_prefix(),
        tracking.sample_interval(),
    );
    tasks.spawn({
        let cancel = cancel.clone();
        async move { sampler.run(cancel).await.map_err(anyhow::Error::from) }
    });

    let report_interval = config.report.clone().unwrap_or_default().interval();
    tasks.spawn({
        let cancel = cancel.clone();
        async move {
            sampler::report(store, report_interval, cancel).await;
            Ok(())
        }
    });

    tasks.spawn({
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = shutdown_signal() => {
                    result?;
                    info!("received shutdown signal");
                }
            }
            Ok::<_, anyhow::Error>(())
        }
    });

    // Every task runs until cancelled, so the first one to finish brings the
    // rest down with it.
    let mut result = Ok(());
    while let Some(joined) = tasks.join_next().await {
        cancel.cancel();

        let outcome = joined.map_err(anyhow::Error::from).and_then(|outcome| outcome);
        if let Err(e) = outcome {
            error!("{:#}", e);
            if result.is_ok() {
                result = Err(e);
            }
        }
    }

    info!("stopped presence-rs");
    result
}
