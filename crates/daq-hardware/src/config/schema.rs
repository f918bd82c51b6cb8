//! Hardware configuration file schema.

use serde::{Deserialize, Serialize};

/// Hardware configuration loaded from a TOML file
///
/// ```toml
/// [defaults]
/// timeout_ms = 500
/// ```
///
/// Keys in `[defaults]` are added to every device's driver table that does
/// not set them itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Driver settings shared by all devices
    #[serde(default)]
    pub defaults: toml::Table,
    /// Devices to register, in file order
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// One `[[devices]]` entry.
///
/// ```toml
/// [[devices]]
/// id = "pmt_a"
/// name = "PMT channel A"
/// [devices.driver]
/// type = "thorlabs_pmt2100_serial"
/// port = 3
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique identifier
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Driver table; `type` selects the factory, the rest is factory-specific
    pub driver: toml::Table,
}

impl DeviceConfig {
    /// Value of the driver table's `type` key.
    pub fn driver_type(&self) -> Option<&str> {
        self.driver.get("type").and_then(|v| v.as_str())
    }

    /// Driver table as a TOML value, as handed to factories.
    pub fn driver_value(&self) -> toml::Value {
        toml::Value::Table(self.driver.clone())
    }

    /// Driver table with `defaults` filled in for keys it leaves unset.
    ///
    /// `type` is never taken from the defaults.
    pub fn driver_value_with(&self, defaults: &toml::Table) -> toml::Value {
        let mut table = self.driver.clone();
        for (key, value) in defaults {
            if key != "type" && !table.contains_key(key) {
                table.insert(key.clone(), value.clone());
            }
        }
        toml::Value::Table(table)
    }
}
