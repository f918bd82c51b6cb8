//! Device registry and hardware configuration for Thorlabs detectors.
//!
//! - [`registry`]: the managing collection that builds detectors through
//!   driver factories, assigns channel indices and closes transports
//! - [`config`]: `[[devices]]` hardware files loaded with figment

pub use daq_core::capabilities;
pub mod config;
pub mod registry;

pub use config::{load_hardware_config, DeviceConfig, HardwareConfig};
pub use registry::{
    create_registry_from_config, create_registry_from_file, register_all_factories, DeviceInfo,
    DeviceRegistry, FactoryInfo, RegistrationFailure,
};
