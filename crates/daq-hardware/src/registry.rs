//! Device Registry for Runtime Hardware Management
//!
//! The registry is the managing collection for detector channels. It:
//!
//! - holds the driver factories, keyed by the TOML `type` string
//! - builds detectors from `[devices.driver]` tables through those factories
//! - assigns each detector the lowest free channel index
//! - closes a detector's transport when it is removed or on shutdown
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      DeviceRegistry                             │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │ 0: pmt_a     │  │ 1: sipm_b    │  │ 2: pmt_c     │  ...      │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    Detector capability                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  PdaDriver | Pmt2100Driver (serial) | Pmt2100Driver (VISA)      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use daq_hardware::{register_all_factories, DeviceRegistry};
//!
//! let registry = DeviceRegistry::new();
//! register_all_factories(&registry);
//!
//! let config: toml::Value = toml::from_str(r#"model = "PDA40""#)?;
//! let index = registry
//!     .register_from_toml("sipm_b", "SiPM channel B", "thorlabs_pda", config)
//!     .await?;
//!
//! let sipm = registry.get_detector("sipm_b").unwrap();
//! println!("channel {index}: {}", sipm.bandwidth().await?);
//! ```

use crate::config::{validate_hardware_config, HardwareConfig};
use anyhow::{anyhow, bail, Context, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use daq_core::capabilities::{DeviceCategory, Detector};
use daq_core::driver::{Capability, DeviceMetadata, DriverFactory};
use daq_core::limits::SHUTDOWN_TIMEOUT;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Unique identifier for a device
pub type DeviceId = String;

/// A detector held by the registry.
struct RegisteredDevice {
    name: String,
    driver_type: String,
    index: usize,
    category: DeviceCategory,
    capabilities: Vec<Capability>,
    metadata: DeviceMetadata,
    detector: Arc<dyn Detector>,
}

/// Summary of a registered device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    /// Unique identifier
    pub id: DeviceId,
    /// Human-readable name
    pub name: String,
    /// Driver type name (e.g., "thorlabs_pda")
    pub driver_type: String,
    /// Assigned channel index
    pub index: usize,
    /// Device category
    pub category: DeviceCategory,
    /// Capabilities this device supports
    pub capabilities: Vec<Capability>,
    /// Descriptive metadata
    pub metadata: DeviceMetadata,
}

/// Factory summary for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct FactoryInfo {
    /// TOML `type` string
    pub driver_type: String,
    /// Human-readable name
    pub name: String,
    /// Capabilities the factory can provide
    pub capabilities: Vec<Capability>,
}

/// A device from a configuration file that could not be registered.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationFailure {
    /// Device identifier from the configuration
    pub device_id: String,
    /// Driver type from the configuration
    pub driver_type: String,
    /// Error chain rendered as text
    pub error: String,
}

/// Central registry of detector channels.
pub struct DeviceRegistry {
    devices: DashMap<DeviceId, RegisteredDevice>,
    factories: DashMap<String, Box<dyn DriverFactory>>,
    indices: Mutex<BTreeSet<usize>>,
    registration_failures: Mutex<Vec<RegistrationFailure>>,
}

impl DeviceRegistry {
    /// Create a new empty device registry
    pub fn new() -> Self {
        Self {
            devices: DashMap::new(),
            factories: DashMap::new(),
            indices: Mutex::new(BTreeSet::new()),
            registration_failures: Mutex::new(Vec::new()),
        }
    }

    // =========================================================================
    // Driver Factory Management
    // =========================================================================

    /// Register a driver factory for its driver type.
    ///
    /// Returns the factory previously registered under the same type, if any.
    pub fn register_factory(
        &self,
        factory: Box<dyn DriverFactory>,
    ) -> Option<Box<dyn DriverFactory>> {
        let driver_type = factory.driver_type().to_string();
        info!(
            driver_type = %driver_type,
            name = %factory.name(),
            capabilities = ?factory.capabilities(),
            "Registering driver factory"
        );
        self.factories.insert(driver_type, factory)
    }

    /// Check if a factory is registered for a driver type.
    pub fn has_factory(&self, driver_type: &str) -> bool {
        self.factories.contains_key(driver_type)
    }

    /// List all registered factory driver types, sorted.
    pub fn list_factories(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .factories
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        types.sort();
        types
    }

    /// Get factory information for introspection.
    pub fn factory_info(&self, driver_type: &str) -> Option<FactoryInfo> {
        self.factories.get(driver_type).map(|entry| {
            let factory = entry.value();
            FactoryInfo {
                driver_type: factory.driver_type().to_string(),
                name: factory.name().to_string(),
                capabilities: factory.capabilities().to_vec(),
            }
        })
    }

    // =========================================================================
    // Device Registration
    // =========================================================================

    /// Build a detector through the factory for `driver_type` and register it.
    ///
    /// Returns the channel index assigned to the detector.
    ///
    /// # Errors
    /// Returns error if:
    /// - Device ID is already registered
    /// - No factory is registered for the driver_type
    /// - Configuration validation fails
    /// - Driver build fails (transport could not be opened)
    /// - The factory returned no detector
    pub async fn register_from_toml(
        &self,
        device_id: &str,
        device_name: &str,
        driver_type: &str,
        config: toml::Value,
    ) -> Result<usize> {
        if self.devices.contains_key(device_id) {
            bail!("Device '{}' is already registered", device_id);
        }

        // Release the factory map guard before awaiting the build.
        let build = {
            let factory = self.factories.get(driver_type).ok_or_else(|| {
                anyhow!(
                    "No factory registered for driver_type '{}'. Available factories: {:?}",
                    driver_type,
                    self.list_factories()
                )
            })?;

            factory.validate(&config).with_context(|| {
                format!(
                    "Configuration validation failed for device '{}' ({})",
                    device_id, driver_type
                )
            })?;

            factory.build(config)
        };

        info!(
            device_id = %device_id,
            device_name = %device_name,
            driver_type = %driver_type,
            "Building device from factory"
        );

        let components = build.await.with_context(|| {
            format!(
                "Factory build failed for device '{}' ({})",
                device_id, driver_type
            )
        })?;

        let capabilities = components.capabilities();
        let detector = components.detector.ok_or_else(|| {
            anyhow!(
                "Factory '{}' returned no detector for device '{}'",
                driver_type,
                device_id
            )
        })?;

        let assigned = match self.devices.entry(device_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let index = self.claim_index();
                detector.set_index(index);
                debug!(
                    device_id = %device_id,
                    index,
                    capabilities = ?capabilities,
                    "Assigned channel index"
                );
                slot.insert(RegisteredDevice {
                    name: device_name.to_string(),
                    driver_type: driver_type.to_string(),
                    index,
                    category: components.category.unwrap_or_default(),
                    capabilities,
                    metadata: components.metadata,
                    detector: Arc::clone(&detector),
                });
                Some(index)
            }
        };

        match assigned {
            Some(index) => {
                info!(device_id = %device_id, index, "Device registered successfully");
                Ok(index)
            }
            None => {
                // Registered concurrently while this one was building.
                if let Err(e) = detector.close().await {
                    warn!(device_id = %device_id, error = %e, "Failed to close duplicate device");
                }
                bail!("Device '{}' is already registered", device_id)
            }
        }
    }

    /// Remove a device and close its transport.
    ///
    /// Returns `Ok(false)` if no device has this ID. The device is removed
    /// and its index freed even if closing the transport fails.
    pub async fn unregister(&self, id: &str) -> Result<bool> {
        let Some((_, device)) = self.devices.remove(id) else {
            return Ok(false);
        };
        self.release_index(device.index);
        info!(device_id = %id, index = device.index, "Unregistering device");

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, device.detector.close()).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => {
                warn!(device_id = %id, error = %e, "Failed to close device transport");
                Err(e).with_context(|| format!("Failed to close device '{}'", id))
            }
            Err(_) => {
                warn!(device_id = %id, "Timed out closing device transport");
                bail!("Timed out closing device '{}'", id)
            }
        }
    }

    /// Unregister every device, closing all transports.
    ///
    /// Keeps going after a failure and reports all failures at the end.
    pub async fn shutdown_all(&self) -> Result<()> {
        let device_ids: Vec<String> = self
            .devices
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut errors = Vec::new();
        for id in device_ids {
            if let Err(e) = self.unregister(&id).await {
                errors.push(format!("{:#}", e));
            }
        }

        if errors.is_empty() {
            info!("All devices shut down");
            Ok(())
        } else {
            warn!(failures = errors.len(), "Device shutdown completed with failures");
            bail!("Device shutdown failed:\n  - {}", errors.join("\n  - "))
        }
    }

    fn claim_index(&self) -> usize {
        let mut used = self.indices.lock();
        let index = (0..=used.len())
            .find(|i| !used.contains(i))
            .unwrap_or(used.len());
        used.insert(index);
        index
    }

    fn release_index(&self, index: usize) {
        self.indices.lock().remove(&index);
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Get a device's detector by ID.
    pub fn get_detector(&self, id: &str) -> Option<Arc<dyn Detector>> {
        self.devices.get(id).map(|d| Arc::clone(&d.detector))
    }

    /// Get the detector on a channel index.
    pub fn get_by_index(&self, index: usize) -> Option<Arc<dyn Detector>> {
        self.devices
            .iter()
            .find(|entry| entry.index == index)
            .map(|entry| Arc::clone(&entry.detector))
    }

    /// List all registered devices, ordered by channel index.
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        let mut devices: Vec<DeviceInfo> = self
            .devices
            .iter()
            .map(|entry| DeviceInfo {
                id: entry.key().clone(),
                name: entry.name.clone(),
                driver_type: entry.driver_type.clone(),
                index: entry.index,
                category: entry.category,
                capabilities: entry.capabilities.clone(),
                metadata: entry.metadata.clone(),
            })
            .collect();
        devices.sort_by_key(|d| d.index);
        devices
    }

    /// Check if a device is registered
    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    /// Get count of registered devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Devices from a configuration file that failed to register.
    pub fn registration_failures(&self) -> Vec<RegistrationFailure> {
        self.registration_failures.lock().clone()
    }

    fn record_registration_failure(&self, failure: RegistrationFailure) {
        warn!(
            device_id = %failure.device_id,
            driver_type = %failure.driver_type,
            error = %failure.error,
            "Device registration failed"
        );
        self.registration_failures.lock().push(failure);
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Factory Registration
// =============================================================================

/// Register every Thorlabs detector factory compiled into this build.
pub fn register_all_factories(registry: &DeviceRegistry) {
    daq_driver_thorlabs::link();
    registry.register_factory(Box::new(daq_driver_thorlabs::PdaFactory));
    registry.register_factory(Box::new(daq_driver_thorlabs::Pmt2100SerialFactory));
    #[cfg(feature = "visa")]
    registry.register_factory(Box::new(daq_driver_thorlabs::Pmt2100VisaFactory));
}

// =============================================================================
// Hardware Configuration File Support
// =============================================================================

/// Create a DeviceRegistry from a hardware configuration.
///
/// Structural problems (missing or duplicate IDs, missing driver types)
/// fail the whole call. A device whose driver cannot be built is skipped,
/// logged and recorded in [`DeviceRegistry::registration_failures`], so one
/// unplugged instrument does not take down the others.
pub async fn create_registry_from_config(config: &HardwareConfig) -> Result<DeviceRegistry> {
    validate_hardware_config(config)?;

    let registry = DeviceRegistry::new();
    register_all_factories(&registry);

    let mut success_count = 0;
    for device_config in &config.devices {
        let driver_type = device_config.driver_type().unwrap_or_default();

        let result = registry
            .register_from_toml(
                &device_config.id,
                &device_config.name,
                driver_type,
                device_config.driver_value_with(&config.defaults),
            )
            .await;

        match result {
            Ok(_) => success_count += 1,
            Err(e) => registry.record_registration_failure(RegistrationFailure {
                device_id: device_config.id.clone(),
                driver_type: driver_type.to_string(),
                error: format!("{:#}", e),
            }),
        }
    }

    let failure_count = config.devices.len() - success_count;
    if failure_count > 0 {
        warn!(
            success_count,
            failure_count,
            "Device registration completed with failures"
        );
    } else {
        info!(success_count, "All devices registered successfully");
    }

    Ok(registry)
}

/// Load a hardware configuration file and create a DeviceRegistry.
pub async fn create_registry_from_file(path: &std::path::Path) -> Result<DeviceRegistry> {
    let config = crate::config::load_hardware_config(path)?;
    create_registry_from_config(&config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_free_index() {
        let registry = DeviceRegistry::new();
        assert_eq!(registry.claim_index(), 0);
        assert_eq!(registry.claim_index(), 1);
        assert_eq!(registry.claim_index(), 2);
        registry.release_index(1);
        assert_eq!(registry.claim_index(), 1);
        assert_eq!(registry.claim_index(), 3);
    }

    #[test]
    fn test_all_factories_registered() {
        let registry = DeviceRegistry::new();
        register_all_factories(&registry);
        assert!(registry.has_factory("thorlabs_pda"));
        assert!(registry.has_factory("thorlabs_pmt2100_serial"));
        assert_eq!(
            registry.factory_info("thorlabs_pda").unwrap().capabilities,
            vec![Capability::Detector]
        );
    }

    #[tokio::test]
    async fn test_unknown_driver_type() {
        let registry = DeviceRegistry::new();
        register_all_factories(&registry);

        let err = registry
            .register_from_toml("x", "X", "nonexistent", toml::Value::Table(toml::Table::new()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No factory registered"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_validation_error_keeps_driver_class() {
        let registry = DeviceRegistry::new();
        register_all_factories(&registry);

        let config: toml::Value = toml::from_str(r#"model = "DET10A""#).unwrap();
        let err = registry
            .register_from_toml("det", "DET", "thorlabs_pda", config)
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<daq_core::error::DaqError>(),
            Some(daq_core::error::DaqError::Configuration(_))
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_missing_device() {
        let registry = DeviceRegistry::new();
        assert!(!registry.unregister("nope").await.unwrap());
    }
}
