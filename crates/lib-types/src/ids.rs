//! Identifiers for devices, streams and proxied buffers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a sink device in the runtime configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device{}", self.0)
    }
}

/// An ordered execution context on a sink device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    /// Device the stream belongs to.
    pub device: DeviceId,
    /// Stream index within the device.
    pub index: u32,
}

impl StreamId {
    /// Create a stream identifier.
    pub fn new(device: u32, index: u32) -> Self {
        Self {
            device: DeviceId(device),
            index,
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/stream{}", self.device, self.index)
    }
}

/// Handle to a registered address proxy.
///
/// The generation distinguishes successive registrations that reuse the same
/// slot, so a handle kept past `unregister` can never resolve to a newer
/// buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyHandle {
    slot: u32,
    generation: u32,
}

impl ProxyHandle {
    /// Build a handle from its parts.
    pub fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    /// Slot index in the proxy table.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Registration generation of the slot.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proxy#{}.{}", self.slot, self.generation)
    }
}
