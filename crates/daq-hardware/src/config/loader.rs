//! Configuration loading for hardware files.
//!
//! # Usage
//!
//! ```rust,ignore
//! use daq_hardware::config::loader::load_hardware_config;
//! use std::path::Path;
//!
//! let config = load_hardware_config(Path::new("config/hardware.toml"))?;
//! ```
//!
//! Values from the file can be overridden with `DAQ_HARDWARE_`-prefixed
//! environment variables; nested keys are separated with `__`. Array
//! entries cannot be addressed one by one, so per-device overrides go
//! through the `[defaults]` table:
//!
//! ```text
//! DAQ_HARDWARE_DEFAULTS__TIMEOUT_MS=250
//! ```

use super::schema::HardwareConfig;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "DAQ_HARDWARE_";

/// Error types for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    /// File not found
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

/// Load a hardware configuration from a TOML file merged with environment
/// overrides.
///
/// Checks that every device has a non-empty, unique `id` and a driver
/// `type`. Driver-specific settings are checked later by the factories.
pub fn load_hardware_config(path: &Path) -> Result<HardwareConfig> {
    if !path.exists() {
        return Err(ConfigLoadError::NotFound(path.display().to_string()).into());
    }

    debug!("Loading hardware config from: {}", path.display());

    let config: HardwareConfig = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    validate_hardware_config(&config)?;

    info!(
        devices = config.devices.len(),
        "Loaded hardware config from {}",
        path.display()
    );
    Ok(config)
}

/// Structural checks shared by file and in-memory configurations.
pub fn validate_hardware_config(config: &HardwareConfig) -> Result<()> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for (i, device) in config.devices.iter().enumerate() {
        if device.id.trim().is_empty() {
            errors.push(format!("devices[{}]: id must not be empty", i));
        } else if !seen.insert(device.id.as_str()) {
            errors.push(format!("devices[{}]: duplicate id '{}'", i, device.id));
        }
        if device.driver_type().is_none() {
            errors.push(format!(
                "devices[{}] ('{}'): driver table has no string 'type'",
                i, device.id
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigLoadError::ValidationError(errors.join("; ")).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_valid_config() {
        let file = write_config(
            r#"
            [[devices]]
            id = "sipm_b"
            name = "SiPM channel B"
            [devices.driver]
            type = "thorlabs_pda"
            model = "PDA40"
            "#,
        );

        let config = load_hardware_config(file.path()).unwrap();
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].driver_type(), Some("thorlabs_pda"));
    }

    #[test]
    fn test_env_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "hardware.toml",
                r#"
                [defaults]
                timeout_ms = 1000

                [[devices]]
                id = "pmt_a"
                name = "PMT channel A"
                [devices.driver]
                type = "thorlabs_pmt2100_serial"
                port = 3
                "#,
            )?;
            jail.set_env("DAQ_HARDWARE_DEFAULTS__TIMEOUT_MS", "250");

            let config =
                load_hardware_config(Path::new("hardware.toml")).map_err(|e| e.to_string())?;
            let driver = config.devices[0].driver_value_with(&config.defaults);
            assert_eq!(driver["timeout_ms"].as_integer(), Some(250));
            assert_eq!(driver["port"].as_integer(), Some(3));
            Ok(())
        });
    }

    #[test]
    fn test_missing_file() {
        let err = load_hardware_config(Path::new("/nonexistent/hardware.toml")).unwrap_err();
        assert!(err.downcast_ref::<ConfigLoadError>().is_some());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let file = write_config(
            r#"
            [[devices]]
            id = "a"
            name = "A"
            [devices.driver]
            type = "thorlabs_pda"
            model = "PDA40"

            [[devices]]
            id = "a"
            name = "A again"
            [devices.driver]
            type = "thorlabs_pda"
            model = "PDA44"
            "#,
        );

        let err = load_hardware_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("duplicate id 'a'"));
    }

    #[test]
    fn test_missing_driver_type_rejected() {
        let file = write_config(
            r#"
            [[devices]]
            id = "a"
            name = "A"
            [devices.driver]
            model = "PDA40"
            "#,
        );

        assert!(load_hardware_config(file.path()).is_err());
    }
}
