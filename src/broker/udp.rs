use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::Broker;
use crate::error::{BrokerError, DecodeError};
use crate::telemetry::{Telemetry, TelemetryStore};

/// Largest UDP payload, so a datagram is never truncated on receive.
const MAX_DATAGRAM: usize = 65_536;

/// Decodes a `<topic>=<value>;...` datagram. A single bad pair rejects the
/// whole datagram.
pub fn decode(datagram: &[u8]) -> Result<Vec<Telemetry>, DecodeError> {
    let text = std::str::from_utf8(datagram).map_err(|_| DecodeError::NotUtf8)?;

    let mut batch = Vec::new();
    for pair in text.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }

        let mut parts = pair.split('=');
        let (Some(topic), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(DecodeError::InvalidPair(pair.to_string()));
        };

        if topic.is_empty() || value.is_empty() {
            return Err(DecodeError::InvalidPair(pair.to_string()));
        }

        let value = value.parse::<f64>().map_err(|source| DecodeError::InvalidValue {
            pair: pair.to_string(),
            source,
        })?;

        batch.push(Telemetry::new(topic, value));
    }

    Ok(batch)
}

/// Receives telemetry datagrams from remote sources.
pub struct UdpBroker {
    socket: UdpSocket,
}

impl UdpBroker {
    pub async fn bind(addr: SocketAddr) -> Result<Self, BrokerError> {
        let socket = UdpSocket::bind(addr).await.map_err(|source| BrokerError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        Ok(UdpBroker { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BrokerError> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl Broker for UdpBroker {
    fn name(&self) -> &'static str {
        "udp"
    }

    /// Only a socket error ends the listener; bad datagrams are dropped.
    async fn run(&self, cancel: CancellationToken, store: Arc<TelemetryStore>) -> Result<(), BrokerError> {
        info!("listening for telemetry on {}", self.local_addr()?);
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (len, peer) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                received = self.socket.recv_from(&mut buf) => received?,
            };
            debug!("received {} bytes from {}", len, peer);

            match decode(&buf[..len]) {
                Ok(batch) => store.put_multi(batch),
                Err(e) => warn!("failed to parse datagram from {}: {}", peer, e),
            }
        }
    }
}
