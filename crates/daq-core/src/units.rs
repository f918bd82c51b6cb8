//! Physical quantities exchanged with detectors.
//!
//! Instruments answer with bare numbers in base units (`"0.75"`,
//! `"8.000000E+07"`), while configuration files and log lines read better
//! with SI prefixes (`"750 mV"`, `"80 MHz"`). The quantity types here accept
//! both forms and always store the value in base units, so equality and
//! ordering are plain value comparisons.
//!
//! # Example
//!
//! ```rust
//! use daq_core::units::{Frequency, ValueRange, Voltage};
//!
//! let bw: Frequency = "2.5 MHz".parse().unwrap();
//! assert_eq!(bw, Frequency::from_hertz(2_500_000.0));
//! assert_eq!(bw.to_string(), "2.5 MHz");
//!
//! let gain: Voltage = "0.75".parse().unwrap();
//! let range = ValueRange::new(Voltage::from_volts(0.5), Voltage::from_volts(1.0));
//! assert!(range.contains(gain));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a quantity string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitParseError {
    /// Input was empty or whitespace
    #[error("empty quantity string")]
    Empty,
    /// Input did not begin with a number
    #[error("'{0}' does not start with a number")]
    MissingNumber(String),
    /// Unit suffix does not belong to this quantity
    #[error("unit '{unit}' is not a {expected} unit")]
    WrongUnit {
        /// Suffix that was found
        unit: String,
        /// Quantity kind that was expected
        expected: &'static str,
    },
    /// Parsed value was NaN or infinite
    #[error("'{0}' is not a finite value")]
    NotFinite(String),
}

/// SI prefixes understood by the parser, with their power of ten.
const PREFIXES: &[(&str, i32)] = &[
    ("p", -12),
    ("n", -9),
    ("u", -6),
    ("µ", -6),
    ("m", -3),
    ("", 0),
    ("k", 3),
    ("M", 6),
    ("G", 9),
];

/// Multiply by 10^exponent using exact powers of ten.
fn scale(value: f64, exponent: i32) -> f64 {
    if exponent >= 0 {
        value * 10f64.powi(exponent)
    } else {
        value / 10f64.powi(-exponent)
    }
}

fn parse_quantity(input: &str, symbol: &str, kind: &'static str) -> Result<f64, UnitParseError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(UnitParseError::Empty);
    }

    let (value, unit) = match s.parse::<f64>() {
        Ok(v) => (v, ""),
        Err(_) => {
            // Longest leading slice that is a number; the remainder is the unit.
            let split = s
                .char_indices()
                .map(|(i, _)| i)
                .skip(1)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .find(|&i| s[..i].trim_end().parse::<f64>().is_ok())
                .ok_or_else(|| UnitParseError::MissingNumber(s.to_string()))?;
            let value = s[..split]
                .trim_end()
                .parse::<f64>()
                .map_err(|_| UnitParseError::MissingNumber(s.to_string()))?;
            (value, s[split..].trim())
        }
    };

    if !value.is_finite() {
        return Err(UnitParseError::NotFinite(s.to_string()));
    }

    if unit.is_empty() {
        return Ok(value);
    }

    let exponent = unit
        .strip_suffix(symbol)
        .and_then(|prefix| PREFIXES.iter().find(|(p, _)| *p == prefix))
        .map(|(_, e)| *e)
        .ok_or_else(|| UnitParseError::WrongUnit {
            unit: unit.to_string(),
            expected: kind,
        })?;

    Ok(scale(value, exponent))
}

fn format_quantity(f: &mut fmt::Formatter<'_>, value: f64, symbol: &str) -> fmt::Result {
    if value == 0.0 || !value.is_finite() {
        return write!(f, "{} {}", value, symbol);
    }

    let mut exponent = ((value.abs().log10() / 3.0).floor() as i32 * 3).clamp(-12, 9);
    let mut mantissa = scale(value, -exponent);
    if mantissa.abs() >= 1000.0 && exponent < 9 {
        exponent += 3;
        mantissa = scale(value, -exponent);
    } else if mantissa.abs() < 1.0 && exponent > -12 {
        exponent -= 3;
        mantissa = scale(value, -exponent);
    }

    let prefix = match exponent {
        -12 => "p",
        -9 => "n",
        -6 => "µ",
        -3 => "m",
        3 => "k",
        6 => "M",
        9 => "G",
        _ => "",
    };

    let digits = format!("{:.6}", mantissa);
    let digits = digits.trim_end_matches('0').trim_end_matches('.');
    write!(f, "{} {}{}", digits, prefix, symbol)
}

macro_rules! quantity {
    (
        $(#[$meta:meta])*
        $name:ident, symbol = $symbol:literal, kind = $kind:literal,
        base = $from_base:ident / $base:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(f64);

        impl $name {
            #[doc = concat!("Create from a value in ", $symbol, ".")]
            pub const fn $from_base(value: f64) -> Self {
                Self(value)
            }

            #[doc = concat!("Value in ", $symbol, ".")]
            pub fn $base(&self) -> f64 {
                self.0
            }
        }

        impl FromStr for $name {
            type Err = UnitParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_quantity(s, $symbol, $kind).map(Self)
            }
        }

        impl TryFrom<String> for $name {
            type Error = UnitParseError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }

        impl From<$name> for String {
            fn from(q: $name) -> Self {
                q.to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                format_quantity(f, self.0, $symbol)
            }
        }
    };
}

quantity!(
    /// Frequency in hertz.
    Frequency, symbol = "Hz", kind = "frequency", base = from_hertz / hertz
);

quantity!(
    /// Electric potential in volts.
    Voltage, symbol = "V", kind = "voltage", base = from_volts / volts
);

quantity!(
    /// Duration in seconds.
    Time, symbol = "s", kind = "time", base = from_seconds / seconds
);

impl Frequency {
    /// Create from a value in kHz.
    pub fn from_kilohertz(khz: f64) -> Self {
        Self(scale(khz, 3))
    }

    /// Create from a value in MHz.
    pub fn from_megahertz(mhz: f64) -> Self {
        Self(scale(mhz, 6))
    }

    /// Value in MHz.
    pub fn megahertz(&self) -> f64 {
        scale(self.0, -6)
    }

    /// 3 dB cutoff of a Gaussian pulse with the given full width at half
    /// maximum (time-bandwidth product 0.44).
    pub fn gaussian_cutoff(fwhm: Time) -> Self {
        Self(0.44 / fwhm.seconds())
    }
}

impl Voltage {
    /// Create from a value in mV.
    pub fn from_millivolts(mv: f64) -> Self {
        Self(scale(mv, -3))
    }
}

impl Time {
    /// Create from a value in ns.
    pub fn from_nanoseconds(ns: f64) -> Self {
        Self(scale(ns, -9))
    }
}

// =============================================================================
// Value Range
// =============================================================================

/// Inclusive `[min, max]` interval used to validate a proposed setting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange<T> {
    min: T,
    max: T,
}

impl<T> ValueRange<T> {
    /// Create a range. Callers are expected to pass `min <= max`.
    pub const fn new(min: T, max: T) -> Self {
        Self { min, max }
    }
}

impl<T: PartialOrd + Copy> ValueRange<T> {
    /// Lower bound (inclusive).
    pub fn min(&self) -> T {
        self.min
    }

    /// Upper bound (inclusive).
    pub fn max(&self) -> T {
        self.max
    }

    /// True when `min <= value <= max`. Unordered values (NaN) are outside.
    pub fn contains(&self, value: T) -> bool {
        self.min <= value && value <= self.max
    }
}

impl<T: fmt::Display> fmt::Display for ValueRange<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}
