//! PMT2100 SCPI command tables.
//!
//! The controller accepts both long-form (`:FUNCtion:ON`) and short-form
//! (`:FUNC:ON`) mnemonics. The serial driver speaks long form and always
//! addresses the `PMT` function; the VISA driver speaks short form and
//! addresses whichever sensor head `SENS:DET?` reported.
//!
//! Templates are rendered with `strfmt`, using `{target}` for the function
//! target and `{value}` for a setting in base units (volts, hertz).

use daq_core::error::{AppResult, DaqError};
use std::collections::HashMap;
use strfmt::strfmt;

/// Which function the on/off/state commands address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionTarget {
    /// Fixed mnemonic
    Fixed(&'static str),
    /// Sensor head reported by the instrument at connect time
    DetectedHead,
}

/// One transport's SCPI vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSet {
    /// Name used in log lines
    pub name: &'static str,
    /// Function target for HV on/off/state
    pub target: FunctionTarget,
    /// HV on
    pub function_on: &'static str,
    /// HV off
    pub function_off: &'static str,
    /// HV state query, answers `1` when on
    pub function_state: &'static str,
    /// Select the gain channel before amplitude commands
    pub select_gain: &'static str,
    /// Set amplitude of the selected channel
    pub set_amplitude: &'static str,
    /// Query amplitude of the selected channel
    pub query_amplitude: &'static str,
    /// Set low-pass corner frequency
    pub set_lowpass: &'static str,
    /// Query low-pass corner frequency
    pub query_lowpass: &'static str,
    /// Identification query
    pub identify: &'static str,
    /// Status byte query
    pub status_byte: &'static str,
    /// Installed sensor head query
    pub sensor_head: Option<&'static str>,
}

/// Long-form vocabulary used over the serial port.
pub static SERIAL_COMMANDS: CommandSet = CommandSet {
    name: "serial",
    target: FunctionTarget::Fixed("PMT"),
    function_on: ":FUNCtion:ON {target}",
    function_off: ":FUNCtion:OFF {target}",
    function_state: ":FUNCtion:STATe? {target}",
    select_gain: ":SELect GAIN",
    set_amplitude: ":VOLTage:LEVel:IMMediate:AMPlitude {value}",
    query_amplitude: ":VOLTage:LEVel:IMMediate:AMPlitude?",
    set_lowpass: ":SENSe:FILTer:LPASs:FREQuency {value}",
    query_lowpass: ":SENSe:FILTer:LPASs:FREQuency?",
    identify: "*IDN?",
    status_byte: "*STB?",
    sensor_head: None,
};

/// Short-form vocabulary used over VISA/USB.
pub static VISA_COMMANDS: CommandSet = CommandSet {
    name: "visa",
    target: FunctionTarget::DetectedHead,
    function_on: ":FUNC:ON {target}",
    function_off: ":FUNC:OFF {target}",
    function_state: ":FUNC:STAT? {target}",
    select_gain: ":SEL GAIN",
    set_amplitude: ":VOLT:LEV:IMM:AMPL {value}",
    query_amplitude: ":VOLT:LEV:IMM:AMPL?",
    set_lowpass: ":SENS:FILT:LPAS:FREQ {value}",
    query_lowpass: ":SENS:FILT:LPAS:FREQ?",
    identify: "*IDN?",
    status_byte: "*STB?",
    sensor_head: Some("SENS:DET?"),
};

impl CommandSet {
    /// Render an on/off command for `target`.
    pub fn power(&self, on: bool, target: &str) -> AppResult<String> {
        let template = if on {
            self.function_on
        } else {
            self.function_off
        };
        render(template, "target", target)
    }

    /// Render the HV state query for `target`.
    pub fn state_query(&self, target: &str) -> AppResult<String> {
        render(self.function_state, "target", target)
    }

    /// Render the amplitude setter for a value in volts.
    pub fn amplitude(&self, volts: f64) -> AppResult<String> {
        render(self.set_amplitude, "value", &volts.to_string())
    }

    /// Render the low-pass setter for a value in hertz.
    pub fn lowpass(&self, hertz: f64) -> AppResult<String> {
        render(self.set_lowpass, "value", &hertz.to_string())
    }
}

fn render(template: &str, key: &str, value: &str) -> AppResult<String> {
    let mut fmt_context = HashMap::new();
    fmt_context.insert(key.to_string(), value.to_string());
    strfmt(template, &fmt_context).map_err(|e| {
        DaqError::Configuration(format!("Failed to format command '{}': {}", template, e))
    })
}
