use std::convert::Infallible;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use pnet::datalink::{self, Channel, DataLinkReceiver};
use tokio_util::sync::CancellationToken;

use super::filter::FilterProgram;
use super::{ActivityRecorder, Probe, Target};
use crate::error::ProbeError;

/// How long a blocking read may wait before cancellation is checked again.
const READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Passively watches an interface for frames sent to or from the device.
///
/// The capture handle lives on a blocking thread and is closed when the
/// probe returns.
pub struct CaptureProbe {
    dev: String,
}

impl CaptureProbe {
    pub fn new(dev: String) -> Self {
        CaptureProbe { dev }
    }
}

#[async_trait]
impl Probe for CaptureProbe {
    fn name(&self) -> &'static str {
        "pcap"
    }

    async fn run(
        &self,
        target: Target,
        cancel: CancellationToken,
        activity: Arc<dyn ActivityRecorder>,
    ) -> Result<Infallible, ProbeError> {
        let dev = self.dev.clone();
        let filter = FilterProgram::compile(target.mac);

        tokio::task::spawn_blocking(move || {
            let mut rx = open(&dev)?;
            debug!("opened capture on {} for {}", dev, target.mac);
            capture(rx.as_mut(), &filter, &cancel, activity.as_ref(), &dev)
        })
        .await
        .map_err(|e| ProbeError::Fatal(format!("capture task failed: {e}")))?
    }
}

fn open(dev: &str) -> Result<Box<dyn DataLinkReceiver>, ProbeError> {
    let interface = datalink::interfaces()
        .into_iter()
        .find(|interface| interface.name == dev)
        .ok_or_else(|| ProbeError::Fatal(format!("capture device {dev} not found")))?;

    let config = datalink::Config {
        read_timeout: Some(READ_TIMEOUT),
        ..Default::default()
    };

    match datalink::channel(&interface, config) {
        Ok(Channel::Ethernet(_, rx)) => Ok(rx),
        Ok(_) => Err(ProbeError::Fatal(format!(
            "unsupported channel type on {dev}"
        ))),
        Err(e) => Err(ProbeError::Fatal(format!(
            "failed to open capture on {dev}: {e}"
        ))),
    }
}

/// Reads frames until cancelled. An open capture never runs dry while
/// alive, so any other read failure ends the probe.
fn capture(
    rx: &mut dyn DataLinkReceiver,
    filter: &FilterProgram,
    cancel: &CancellationToken,
    activity: &dyn ActivityRecorder,
    dev: &str,
) -> Result<Infallible, ProbeError> {
    loop {
        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }

        match rx.next() {
            Ok(frame) => {
                if filter.matches(frame) {
                    debug!("captured {} byte frame on {}", frame.len(), dev);
                    activity.record();
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
            Err(_) if cancel.is_cancelled() => return Err(ProbeError::Cancelled),
            Err(e) => {
                return Err(ProbeError::Fatal(format!(
                    "unexpected end of packets on {dev}: {e}"
                )));
            }
        }
    }
}
