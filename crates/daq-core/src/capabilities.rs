//! Detector Capability
//!
//! Photodetector front-ends share a tiny property surface: a high-voltage
//! enable, a gain setting, a gain range and an analog bandwidth. How much of
//! that surface a given model exposes varies a lot. A fixed-function SiPM
//! module has nothing adjustable, while a PMT controller accepts every
//! property over SCPI.
//!
//! Rather than hiding those differences behind runtime "not supported"
//! checks scattered across drivers, each detector publishes a
//! [`DetectorControls`] table. Every property is a [`Control`]:
//!
//! - `Fixed(value)`: reads return the constant, writes fail
//! - `Adjustable(constraint)`: reads and writes go to the instrument, and
//!   writes are validated against the [`Constraint`] first
//! - `Unsupported`: reads and writes both fail
//!
//! The default methods of [`Detector`] are written entirely in terms of that
//! table, so a fixed-function driver only has to describe its controls.
//!
//! # Example
//!
//! ```rust,ignore
//! use daq_core::capabilities::Detector;
//!
//! async fn report(det: &dyn Detector) -> daq_core::error::AppResult<()> {
//!     println!("{} enabled={}", det.model(), det.enabled().await?);
//!     if det.controls().bandwidth.is_writable() {
//!         det.set_bandwidth("2.5 MHz".parse().unwrap()).await?;
//!     }
//!     println!("bandwidth {}", det.bandwidth().await?);
//!     Ok(())
//! }
//! ```

use crate::error::{AppResult, DaqError};
use crate::units::{Frequency, ValueRange, Voltage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

// =============================================================================
// Device Category
// =============================================================================

/// Device category for grouping in listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCategory {
    /// Photodetectors (SiPM modules, PMT controllers)
    Detector,
    /// Devices that don't fit other categories
    #[default]
    Other,
}

impl DeviceCategory {
    /// Human-readable label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Detector => "Detectors",
            Self::Other => "Other",
        }
    }
}

// =============================================================================
// Control Shapes
// =============================================================================

/// Allowed values for an adjustable property.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constraint<T: 'static> {
    /// Any value is forwarded to the instrument
    Any,
    /// Value must lie in the inclusive range
    Range(ValueRange<T>),
    /// Value must equal one of the listed settings exactly
    OneOf(&'static [T]),
}

impl<T> Constraint<T>
where
    T: Copy + PartialOrd + fmt::Display + 'static,
{
    /// Validate `value` for the property `name`.
    pub fn check(&self, name: &str, value: T) -> AppResult<()> {
        match self {
            Self::Any => Ok(()),
            Self::Range(range) if range.contains(value) => Ok(()),
            Self::Range(range) => Err(DaqError::ValueOutOfRange {
                name: name.to_string(),
                value: value.to_string(),
                allowed: range.to_string(),
            }),
            Self::OneOf(allowed) if allowed.iter().any(|a| *a == value) => Ok(()),
            Self::OneOf(allowed) => Err(DaqError::InvalidChoice {
                name: name.to_string(),
                value: value.to_string(),
                allowed: allowed
                    .iter()
                    .map(|a| a.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }
}

/// How a single detector property behaves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Control<T: 'static> {
    /// Constant set by the hardware; writes are rejected
    Fixed(T),
    /// Read from and written to the instrument
    Adjustable(Constraint<T>),
    /// Not available on this model
    Unsupported,
}

impl<T> Control<T>
where
    T: Copy + PartialOrd + fmt::Display + 'static,
{
    /// True unless the property is unsupported.
    pub fn is_readable(&self) -> bool {
        !matches!(self, Self::Unsupported)
    }

    /// True only for adjustable properties.
    pub fn is_writable(&self) -> bool {
        matches!(self, Self::Adjustable(_))
    }

    /// The constant of a fixed property.
    pub fn fixed_value(&self) -> Option<T> {
        match self {
            Self::Fixed(v) => Some(*v),
            _ => None,
        }
    }

    /// Read a property without touching hardware.
    ///
    /// Succeeds only for `Fixed`; adjustable properties must be read from
    /// the instrument by the driver.
    pub fn read_fixed(&self, name: &str, model: &str) -> AppResult<T> {
        match self {
            Self::Fixed(v) => Ok(*v),
            Self::Adjustable(_) => Err(DaqError::OperationNotSupported(format!(
                "{model} driver does not implement reading {name}"
            ))),
            Self::Unsupported => Err(DaqError::OperationNotSupported(format!(
                "{model} has no {name} readout"
            ))),
        }
    }

    /// Validate a proposed write before anything reaches the transport.
    pub fn validate_write(&self, name: &str, model: &str, value: T) -> AppResult<()> {
        match self {
            Self::Fixed(v) => Err(DaqError::OperationNotSupported(format!(
                "{model} {name} is fixed at {v}"
            ))),
            Self::Unsupported => Err(DaqError::OperationNotSupported(format!(
                "{model} does not support setting {name}"
            ))),
            Self::Adjustable(constraint) => constraint.check(name, value),
        }
    }
}

/// Gain range reported by a detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GainRange {
    /// Control voltage interval (PMT high-voltage gain input)
    Voltage(ValueRange<Voltage>),
    /// Positions of a manual rotary gain switch
    Positions(ValueRange<u8>),
}

impl fmt::Display for GainRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Voltage(range) => fmt::Display::fmt(range, f),
            Self::Positions(range) => write!(f, "positions {}", range),
        }
    }
}

/// Per-model description of the detector property surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorControls {
    /// High-voltage / output enable
    pub enabled: Control<bool>,
    /// Gain control voltage
    pub gain: Control<Voltage>,
    /// Reported gain range, if the model has one
    pub gain_range: Option<GainRange>,
    /// Analog bandwidth
    pub bandwidth: Control<Frequency>,
}

// =============================================================================
// Channel Index
// =============================================================================

const UNASSIGNED: usize = usize::MAX;

/// Channel slot assigned by the managing registry.
///
/// Starts unassigned. Drivers never assign it themselves.
#[derive(Debug)]
pub struct ChannelIndex(AtomicUsize);

impl ChannelIndex {
    /// Create an unassigned index.
    pub const fn new() -> Self {
        Self(AtomicUsize::new(UNASSIGNED))
    }

    /// Assigned index, if any.
    pub fn get(&self) -> Option<usize> {
        match self.0.load(Ordering::Acquire) {
            UNASSIGNED => None,
            index => Some(index),
        }
    }

    /// Assign an index.
    pub fn set(&self, index: usize) {
        self.0.store(index, Ordering::Release);
    }

    /// Return to the unassigned state.
    pub fn clear(&self) {
        self.0.store(UNASSIGNED, Ordering::Release);
    }
}

impl Default for ChannelIndex {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Detector Capability
// =============================================================================

/// Capability: Photodetector Control
///
/// One handle per physical channel. The handle owns its transport for its
/// whole lifetime and releases it on [`close`](Detector::close) or drop.
///
/// # Contract
/// - Setters validate against [`DetectorControls`] before any transport write
/// - Each call finishes its full request/response exchange before returning
/// - After `close()`, operations that need the transport fail with
///   [`DaqError::SerialPortNotConnected`]
///
/// # Default Implementation
///
/// Every property method has a default derived from [`Detector::controls`].
/// Fixed properties return their constant, and everything else fails with
/// [`DaqError::OperationNotSupported`]. Drivers with adjustable properties
/// override the matching getters and setters.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Model identifier, as configured or reported by the device.
    fn model(&self) -> &str;

    /// Property surface of this model.
    fn controls(&self) -> &DetectorControls;

    /// Storage for the registry-assigned channel index.
    fn channel(&self) -> &ChannelIndex;

    /// Channel index, `None` until registered.
    fn index(&self) -> Option<usize> {
        self.channel().get()
    }

    /// Called by the managing registry when the detector is added.
    fn set_index(&self, index: usize) {
        self.channel().set(index);
    }

    /// Whether the detector output (PMT high voltage) is on.
    async fn enabled(&self) -> AppResult<bool> {
        self.controls().enabled.read_fixed("enabled", self.model())
    }

    /// Switch the detector output on or off.
    async fn set_enabled(&self, enabled: bool) -> AppResult<()> {
        self.controls()
            .enabled
            .validate_write("enabled", self.model(), enabled)?;
        Err(DaqError::OperationNotSupported(format!(
            "{} driver does not implement setting enabled",
            self.model()
        )))
    }

    /// Current gain control voltage.
    async fn gain(&self) -> AppResult<Voltage> {
        self.controls().gain.read_fixed("gain", self.model())
    }

    /// Set the gain control voltage.
    async fn set_gain(&self, gain: Voltage) -> AppResult<()> {
        self.controls()
            .gain
            .validate_write("gain", self.model(), gain)?;
        Err(DaqError::OperationNotSupported(format!(
            "{} driver does not implement setting gain",
            self.model()
        )))
    }

    /// Gain range, for models that report one.
    fn gain_range(&self) -> AppResult<GainRange> {
        self.controls().gain_range.ok_or_else(|| {
            DaqError::OperationNotSupported(format!("{} has no gain range", self.model()))
        })
    }

    /// Current analog bandwidth (3 dB low-pass corner).
    async fn bandwidth(&self) -> AppResult<Frequency> {
        self.controls().bandwidth.read_fixed("bandwidth", self.model())
    }

    /// Select the analog bandwidth.
    async fn set_bandwidth(&self, bandwidth: Frequency) -> AppResult<()> {
        self.controls()
            .bandwidth
            .validate_write("bandwidth", self.model(), bandwidth)?;
        Err(DaqError::OperationNotSupported(format!(
            "{} driver does not implement setting bandwidth",
            self.model()
        )))
    }

    /// Release the transport. Later transport operations fail.
    ///
    /// Returns `Ok(())` for detectors without a transport.
    async fn close(&self) -> AppResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static BANDWIDTHS: [Frequency; 2] = [
        Frequency::from_hertz(80_000_000.0),
        Frequency::from_hertz(2_500_000.0),
    ];

    const CONTROLS: DetectorControls = DetectorControls {
        enabled: Control::Fixed(true),
        gain: Control::Unsupported,
        gain_range: None,
        bandwidth: Control::Fixed(Frequency::from_hertz(100_000_000.0)),
    };

    struct FixedDetector {
        index: ChannelIndex,
    }

    impl Detector for FixedDetector {
        fn model(&self) -> &str {
            "TEST1"
        }

        fn controls(&self) -> &DetectorControls {
            &CONTROLS
        }

        fn channel(&self) -> &ChannelIndex {
            &self.index
        }
    }

    #[test]
    fn test_range_constraint() {
        let c = Constraint::Range(ValueRange::new(
            Voltage::from_volts(0.5),
            Voltage::from_volts(1.0),
        ));
        assert!(c.check("gain", Voltage::from_volts(0.75)).is_ok());
        let err = c.check("gain", Voltage::from_volts(1.5)).unwrap_err();
        assert!(matches!(err, DaqError::ValueOutOfRange { .. }));
        assert!(err.to_string().contains("[500 mV, 1 V]"));
    }

    #[test]
    fn test_one_of_constraint_is_exact() {
        let c = Constraint::OneOf(&BANDWIDTHS);
        assert!(c.check("bandwidth", Frequency::from_megahertz(2.5)).is_ok());
        let err = c
            .check("bandwidth", Frequency::from_hertz(2_500_001.0))
            .unwrap_err();
        assert!(matches!(err, DaqError::InvalidChoice { .. }));
        assert!(err.to_string().contains("80 MHz, 2.5 MHz"));
    }

    #[test]
    fn test_fixed_control_rejects_writes() {
        let c: Control<bool> = Control::Fixed(true);
        assert_eq!(c.fixed_value(), Some(true));
        assert!(c.is_readable());
        assert!(!c.is_writable());
        assert!(matches!(
            c.validate_write("enabled", "TEST1", true),
            Err(DaqError::OperationNotSupported(_))
        ));
    }

    #[test]
    fn test_channel_index_starts_unassigned() {
        let idx = ChannelIndex::new();
        assert_eq!(idx.get(), None);
        idx.set(3);
        assert_eq!(idx.get(), Some(3));
        idx.clear();
        assert_eq!(idx.get(), None);
    }

    #[tokio::test]
    async fn test_default_methods_follow_controls() {
        let det = FixedDetector {
            index: ChannelIndex::new(),
        };

        assert!(det.enabled().await.unwrap());
        assert_eq!(
            det.bandwidth().await.unwrap(),
            Frequency::from_megahertz(100.0)
        );
        assert!(matches!(
            det.gain().await,
            Err(DaqError::OperationNotSupported(_))
        ));
        assert!(matches!(
            det.set_enabled(false).await,
            Err(DaqError::OperationNotSupported(_))
        ));
        assert!(matches!(
            det.set_gain(Voltage::from_volts(0.75)).await,
            Err(DaqError::OperationNotSupported(_))
        ));
        assert!(matches!(
            det.set_bandwidth(Frequency::from_megahertz(100.0)).await,
            Err(DaqError::OperationNotSupported(_))
        ));
        assert!(det.gain_range().is_err());
        assert!(det.close().await.is_ok());
    }

    #[test]
    fn test_index_defaults_use_channel() {
        let det = FixedDetector {
            index: ChannelIndex::new(),
        };
        assert_eq!(det.index(), None);
        det.set_index(1);
        assert_eq!(det.index(), Some(1));
    }
}
