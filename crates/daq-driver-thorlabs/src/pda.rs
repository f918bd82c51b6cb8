//! Thorlabs PDA4X / PDA40 SiPM Detector Modules
//!
//! Fixed-function amplified SiPM modules. There is no data connection:
//! power switches the module on, gain (PDA40 only) is set with a rotary
//! switch on the housing, and the bandwidth is set by the pulse response.
//!
//! The driver therefore only describes the modules. Reads return constants
//! and every write fails with [`DaqError::OperationNotSupported`].
//!
//! Bandwidth: the measured single-photon pulse is about 4.5 ns FWHM. For a
//! Gaussian pulse the 3 dB cutoff is `0.44 / FWHM`, roughly 98 MHz, which
//! Thorlabs quotes as 100 MHz.

use anyhow::{Context, Result};
use daq_core::capabilities::{
    ChannelIndex, Control, DeviceCategory, Detector, DetectorControls, GainRange,
};
use daq_core::driver::{Capability, DeviceComponents, DeviceMetadata, DriverFactory};
use daq_core::error::{AppResult, DaqError};
use daq_core::units::{Frequency, Time, ValueRange};
use futures::future::BoxFuture;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

/// Nominal analog bandwidth of both module families.
pub const PDA_BANDWIDTH: Frequency = Frequency::from_hertz(100_000_000.0);

/// Measured single-photon pulse width (FWHM).
pub const PDA_PULSE_FWHM: Time = Time::from_seconds(4.5e-9);

/// Positions of the PDA40 rotary gain switch.
pub const PDA40_GAIN_POSITIONS: ValueRange<u8> = ValueRange::new(0, 9);

static PDA4X_CONTROLS: DetectorControls = DetectorControls {
    enabled: Control::Fixed(true),
    gain: Control::Unsupported,
    gain_range: None,
    bandwidth: Control::Fixed(PDA_BANDWIDTH),
};

static PDA40_CONTROLS: DetectorControls = DetectorControls {
    enabled: Control::Fixed(true),
    gain: Control::Unsupported,
    gain_range: Some(GainRange::Positions(PDA40_GAIN_POSITIONS)),
    bandwidth: Control::Fixed(PDA_BANDWIDTH),
};

/// Module family, which decides the control table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdaFamily {
    /// Fixed-gain PDA4x modules
    Pda4x,
    /// PDA40 with a manual gain switch
    Pda40,
}

impl PdaFamily {
    /// Family of a model number such as `"PDA44"` or `"PDA40"`.
    ///
    /// Matching ignores case and surrounding whitespace.
    pub fn from_model(model: &str) -> AppResult<Self> {
        let normalized = model.trim().to_ascii_uppercase();
        if normalized.starts_with("PDA40") {
            Ok(Self::Pda40)
        } else if normalized.starts_with("PDA4") {
            Ok(Self::Pda4x)
        } else {
            Err(DaqError::Configuration(format!(
                "'{}' is not a PDA4x or PDA40 model number",
                model
            )))
        }
    }

    fn controls(self) -> &'static DetectorControls {
        match self {
            Self::Pda4x => &PDA4X_CONTROLS,
            Self::Pda40 => &PDA40_CONTROLS,
        }
    }
}

/// Driver for a PDA4x or PDA40 module.
#[derive(Debug)]
pub struct PdaDriver {
    model: String,
    family: PdaFamily,
    index: ChannelIndex,
}

impl PdaDriver {
    /// Create a driver for the given model number.
    ///
    /// # Errors
    /// [`DaqError::Configuration`] if the model number is not a PDA4x/PDA40.
    pub fn new(model_number: &str) -> AppResult<Self> {
        let family = PdaFamily::from_model(model_number)?;
        Ok(Self {
            model: model_number.trim().to_string(),
            family,
            index: ChannelIndex::new(),
        })
    }

    /// Module family.
    pub fn family(&self) -> PdaFamily {
        self.family
    }
}

impl Detector for PdaDriver {
    fn model(&self) -> &str {
        &self.model
    }

    fn controls(&self) -> &DetectorControls {
        self.family.controls()
    }

    fn channel(&self) -> &ChannelIndex {
        &self.index
    }
}

// =============================================================================
// PdaFactory
// =============================================================================

/// Configuration for a PDA module
#[derive(Debug, Clone, Deserialize)]
pub struct PdaConfig {
    /// Model number, e.g. "PDA44" or "PDA40"
    pub model: String,
}

/// Factory for PDA4x / PDA40 modules.
pub struct PdaFactory;

static PDA_CAPABILITIES: &[Capability] = &[Capability::Detector];

impl DriverFactory for PdaFactory {
    fn driver_type(&self) -> &'static str {
        "thorlabs_pda"
    }

    fn name(&self) -> &'static str {
        "Thorlabs PDA4x/PDA40 SiPM Module"
    }

    fn capabilities(&self) -> &'static [Capability] {
        PDA_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: PdaConfig = config.clone().try_into()?;
        PdaFamily::from_model(&cfg.model)?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: PdaConfig = config.try_into().context("Invalid PDA config")?;
            let driver = PdaDriver::new(&cfg.model)?;
            info!(model = %cfg.model, family = ?driver.family(), "PDA module configured");

            let model = driver.model().to_string();
            Ok(DeviceComponents::new()
                .with_category(DeviceCategory::Detector)
                .with_detector(Arc::new(driver))
                .with_metadata(DeviceMetadata {
                    vendor: Some("Thorlabs".to_string()),
                    model: Some(model),
                    ..Default::default()
                }))
        })
    }
}
