//! Hardware configuration.
//!
//! - **Schema** ([`schema`]): `[[devices]]` entries with `id`, `name` and a
//!   `[devices.driver]` table whose `type` selects a driver factory
//! - **Loader** ([`loader`]): figment-based loading with environment
//!   overrides of `[defaults]` and structural validation
//!
//! # Example Configuration
//!
//! ```toml
//! [[devices]]
//! id = "pmt_a"
//! name = "PMT channel A"
//! [devices.driver]
//! type = "thorlabs_pmt2100_serial"
//! port = 3           # or "/dev/ttyUSB0"
//! timeout_ms = 1000
//! bandwidth = "2.5 MHz"
//!
//! [[devices]]
//! id = "sipm_b"
//! name = "SiPM channel B"
//! [devices.driver]
//! type = "thorlabs_pda"
//! model = "PDA40"
//! ```

pub mod loader;
pub mod schema;

pub use loader::{load_hardware_config, validate_hardware_config, ConfigLoadError};
pub use schema::{DeviceConfig, HardwareConfig};
