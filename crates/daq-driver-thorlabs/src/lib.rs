//! Thorlabs photodetector drivers.
//!
//! This crate provides drivers for Thorlabs detectors, including:
//! - PDA4x / PDA40 SiPM modules (fixed function, no data connection)
//! - PMT2100 photomultiplier controller over serial
//! - PMT2100 over VISA/USB (feature `visa`)
//!
//! # Usage
//!
//! Add to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! daq-driver-thorlabs = { path = "../daq-driver-thorlabs" }
//! ```
//!
//! Register the factories with your device registry:
//!
//! ```rust,ignore
//! use daq_driver_thorlabs::{PdaFactory, Pmt2100SerialFactory};
//!
//! registry.register_factory(Box::new(PdaFactory));
//! registry.register_factory(Box::new(Pmt2100SerialFactory));
//! ```

pub mod commands;
pub mod mock;
mod pda;
mod pmt2100;
pub mod scpi;
pub mod visa;

pub use pda::{PdaConfig, PdaDriver, PdaFactory, PdaFamily, PDA40_GAIN_POSITIONS, PDA_BANDWIDTH};
pub use pmt2100::{
    Pmt2100Driver, Pmt2100InitialSettings, Pmt2100SerialConfig, Pmt2100SerialFactory,
    Pmt2100VisaConfig, PMT2100_BANDWIDTHS, PMT2100_GAIN_RANGE, PMT2100_MODEL,
};
#[cfg(feature = "visa")]
pub use pmt2100::Pmt2100VisaFactory;
pub use scpi::{PortSpec, ScpiTransport, SerialScpi};
pub use visa::VisaResource;

/// Force the linker to include this crate.
///
/// Call this function from main() to ensure the driver factories are
/// linked into the final binary and not stripped by the linker.
#[inline(never)]
pub fn link() {
    std::hint::black_box(std::any::TypeId::of::<PdaFactory>());
    std::hint::black_box(std::any::TypeId::of::<Pmt2100SerialFactory>());
}
