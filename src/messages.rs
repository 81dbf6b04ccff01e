use std::sync::Arc;

use mac_address::MacAddress;

use crate::probe::Probe;

/// Requests consumed by the tracker's control loop.
pub enum TrackerEvent {
    Register {
        mac: MacAddress,
        probes: Vec<Arc<dyn Probe>>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DevicePresence {
    Present,
    Absent,
}

impl DevicePresence {
    /// Telemetry encoding of the presence state.
    pub fn value(self) -> f64 {
        match self {
            DevicePresence::Present => 1.0,
            DevicePresence::Absent => 0.0,
        }
    }
}

impl From<bool> for DevicePresence {
    fn from(is_up: bool) -> Self {
        if is_up {
            DevicePresence::Present
        } else {
            DevicePresence::Absent
        }
    }
}
