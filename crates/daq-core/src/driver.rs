//! Driver Factory and Component Types
//!
//! This module provides the plugin API for dynamically registered drivers.
//! Drivers implement [`DriverFactory`] and are registered with the
//! `DeviceRegistry` at startup via explicit `registry.register_factory(factory)`
//! calls.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Composition Root                        │
//! │  registry.register_factory(PdaFactory);                         │
//! │  registry.register_factory(Pmt2100SerialFactory);               │
//! └─────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        DeviceRegistry                           │
//! │  factories: DashMap<driver_type, Box<dyn DriverFactory>>        │
//! │  devices: DashMap<device_id, RegisteredDevice>                  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    DriverFactory::build()                       │
//! │  Parses TOML config, opens the transport, returns components    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use crate::capabilities::{DeviceCategory, Detector};
use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Capability Enum (Runtime Introspection)
// =============================================================================

/// Runtime capability flags for device introspection.
///
/// Derived from a detector's control table, so listings can tell a
/// fixed-function module from a fully adjustable controller without calling
/// into the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Implements [`crate::capabilities::Detector`]
    Detector,

    /// Output / high voltage can be switched from software
    EnableControl,

    /// Gain control voltage can be set from software
    GainControl,

    /// Analog bandwidth can be selected from software
    BandwidthControl,
}

impl Capability {
    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Detector => "Detector",
            Self::EnableControl => "Enable Control",
            Self::GainControl => "Gain Control",
            Self::BandwidthControl => "Bandwidth Control",
        }
    }
}

// =============================================================================
// Device Components
// =============================================================================

/// What a factory hands back to the registry.
#[derive(Default)]
pub struct DeviceComponents {
    /// Device category for grouping
    pub category: Option<DeviceCategory>,

    /// Detector implementation
    pub detector: Option<Arc<dyn Detector>>,

    /// Descriptive metadata
    pub metadata: DeviceMetadata,
}

impl DeviceComponents {
    /// Create empty components
    pub fn new() -> Self {
        Self::default()
    }

    /// Capabilities provided by the contained trait objects.
    pub fn capabilities(&self) -> Vec<Capability> {
        let Some(detector) = &self.detector else {
            return Vec::new();
        };

        let controls = detector.controls();
        let mut caps = vec![Capability::Detector];
        if controls.enabled.is_writable() {
            caps.push(Capability::EnableControl);
        }
        if controls.gain.is_writable() {
            caps.push(Capability::GainControl);
        }
        if controls.bandwidth.is_writable() {
            caps.push(Capability::BandwidthControl);
        }
        caps
    }

    /// Set device category
    pub fn with_category(mut self, category: DeviceCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// Set Detector implementation
    pub fn with_detector(mut self, d: Arc<dyn Detector>) -> Self {
        self.detector = Some(d);
        self
    }

    /// Set device metadata
    pub fn with_metadata(mut self, metadata: DeviceMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

// =============================================================================
// Device Metadata
// =============================================================================

/// Information about a device that isn't captured by the trait object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceMetadata {
    /// Vendor name
    pub vendor: Option<String>,

    /// Model number (e.g. "PDA40", "PMT2100")
    pub model: Option<String>,

    /// Transport description (serial port, VISA resource)
    pub transport: Option<String>,

    /// Identification string reported by the instrument (`*IDN?`)
    pub identity: Option<String>,
}

// =============================================================================
// Driver Factory Trait
// =============================================================================

/// Trait for driver factories that create device instances.
///
/// Each driver crate implements this trait to register itself with the
/// DeviceRegistry. The factory is responsible for:
///
/// 1. Declaring what driver type it handles (matching TOML `type` field)
/// 2. Validating configuration before instantiation
/// 3. Asynchronously creating the driver and returning components
///
/// Factories are registered once and must not hold mutable state across
/// builds.
pub trait DriverFactory: Send + Sync + 'static {
    /// Driver type name used in TOML config `type` field.
    ///
    /// ```toml
    /// [devices.driver]
    /// type = "thorlabs_pda"  # matches driver_type() returning "thorlabs_pda"
    /// ```
    fn driver_type(&self) -> &'static str;

    /// Human-readable name for documentation and error messages.
    fn name(&self) -> &'static str;

    /// Capabilities this driver type can provide.
    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    /// Validate configuration without touching hardware.
    ///
    /// `config` is the `[devices.driver]` table.
    fn validate(&self, config: &toml::Value) -> Result<()>;

    /// Parse the configuration, open the transport and return components.
    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>>;
}
