//! `daq-core`
//!
//! Core trait definitions and types for the Thorlabs detector drivers.
//!
//! ## Key Types
//!
//! - [`Detector`](capabilities::Detector): the capability every photodetector driver implements
//! - [`Control`](capabilities::Control): fixed / adjustable / unsupported property shapes
//! - [`Frequency`](units::Frequency), [`Voltage`](units::Voltage), [`Time`](units::Time): typed quantities
//! - [`DaqError`](error::DaqError): error taxonomy shared by all drivers
//! - [`DriverFactory`](driver::DriverFactory): plugin API used by the device registry
//!
//! ## Example
//!
//! ```rust
//! use daq_core::units::{Frequency, Time};
//!
//! // 3 dB cutoff of a 4.5 ns Gaussian pulse
//! let cutoff = Frequency::gaussian_cutoff(Time::from_nanoseconds(4.5));
//! assert!((cutoff.megahertz() - 97.8).abs() < 0.1);
//! ```

pub mod capabilities;
pub mod driver;
pub mod error;
pub mod limits;
pub mod serial;
pub mod units;

pub use capabilities::{
    ChannelIndex, Constraint, Control, DeviceCategory, Detector, DetectorControls, GainRange,
};
pub use error::{AppResult, DaqError};
pub use units::{Frequency, Time, ValueRange, Voltage};
