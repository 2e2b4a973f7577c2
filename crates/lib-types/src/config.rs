//! Runtime configuration.

use crate::limits::RETURN_SIZE_LIMIT;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration consumed by runtime initialization.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Sink devices to bring up, in device-id order.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    /// Largest result blob capacity a caller may declare, in bytes.
    #[serde(default = "default_max_result_size")]
    pub max_result_size: u16,

    /// How long finalization waits for in-flight calls before proceeding.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_max_result_size() -> u16 { RETURN_SIZE_LIMIT }
fn default_drain_timeout_ms() -> u64 { 5_000 }

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            max_result_size: default_max_result_size(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl RuntimeConfig {
    /// Configuration with a single in-process device.
    pub fn single_device(streams: u32) -> Self {
        Self {
            devices: vec![DeviceConfig::new("host", streams)],
            ..Default::default()
        }
    }

    /// Drain timeout as a `Duration`.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Total number of streams across all devices.
    pub fn total_streams(&self) -> usize {
        self.devices.iter().map(|d| d.streams as usize).sum()
    }
}

/// A single sink device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Human-readable device name.
    pub name: String,

    /// Shared libraries exporting sink functions, searched in order.
    #[serde(default)]
    pub libraries: Vec<PathBuf>,

    /// Number of streams (worker contexts) on this device.
    #[serde(default = "default_streams")]
    pub streams: u32,
}

fn default_streams() -> u32 { 1 }

impl DeviceConfig {
    /// Device with no libraries and the given stream count.
    pub fn new(name: impl Into<String>, streams: u32) -> Self {
        Self {
            name: name.into(),
            libraries: Vec::new(),
            streams,
        }
    }

    /// Add a sink library to search.
    pub fn with_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.libraries.push(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert!(config.devices.is_empty());
        assert_eq!(config.max_result_size, 64);
        assert_eq!(config.drain_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_total_streams() {
        let mut config = RuntimeConfig::single_device(2);
        config.devices.push(DeviceConfig::new("card1", 3).with_library("libsink.so"));
        assert_eq!(config.total_streams(), 5);
        assert_eq!(config.devices[1].libraries.len(), 1);
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: RuntimeConfig = serde_json::from_str(
            r#"{ "devices": [ { "name": "card0", "libraries": ["libsink.so"] } ] }"#,
        )
        .unwrap();
        assert_eq!(config.devices[0].streams, 1);
        assert_eq!(config.max_result_size, RETURN_SIZE_LIMIT);
        assert_eq!(config.drain_timeout_ms, 5_000);
    }
}
