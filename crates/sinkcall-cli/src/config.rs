//! Runtime configuration loading and validation.

use anyhow::{Context, Result};
use lib_types::RuntimeConfig;
use std::path::Path;

/// Load runtime configuration from a TOML or JSON file.
pub fn load_config(path: &Path) -> Result<RuntimeConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: RuntimeConfig = if path.extension().map_or(false, |e| e == "json") {
        serde_json::from_str(&content)
            .with_context(|| "Failed to parse config as JSON")?
    } else {
        // Assume TOML
        toml::from_str(&content)
            .with_context(|| "Failed to parse config as TOML")?
    };

    validate_config(&config)?;

    Ok(config)
}

/// Validate configuration beyond what the runtime checks itself.
pub fn validate_config(config: &RuntimeConfig) -> Result<()> {
    lib_dispatch::runtime::validate_config(config)?;

    for device in &config.devices {
        for library in &device.libraries {
            if !library.exists() {
                anyhow::bail!(
                    "Library for device '{}' not found: {:?}",
                    device.name,
                    library
                );
            }
        }
    }

    if config.drain_timeout_ms == 0 {
        tracing::warn!("drain_timeout_ms is 0, finalize will not wait for in-flight calls");
    }

    Ok(())
}
