//! Thorlabs PMT2100 Photomultiplier Controller Driver
//!
//! Protocol Overview:
//! - Format: SCPI, one ASCII line per command, `\n` terminated
//! - Serial: 115200 baud, 8N1, long-form mnemonics, function target `PMT`
//! - VISA/USB: short-form mnemonics, function target is the installed sensor
//!   head reported by `SENS:DET?`
//! - Gain: control voltage of the selected `GAIN` channel, 0.5 V to 1 V
//! - Bandwidth: low-pass corner of 80 MHz, 2.5 MHz or 250 kHz
//!
//! One driver type serves both transports; only the [`ScpiTransport`] and
//! the [`CommandSet`] differ.
//!
//! # Usage
//!
//! ```rust,ignore
//! use daq_driver_thorlabs::{Pmt2100Driver, PortSpec};
//! use daq_core::capabilities::Detector;
//!
//! let pmt = Pmt2100Driver::connect_serial(&PortSpec::Number(3), Duration::from_secs(1)).await?;
//! pmt.set_gain(Voltage::from_volts(0.75)).await?;
//! pmt.set_enabled(true).await?;
//! ```

use crate::commands::{CommandSet, FunctionTarget, SERIAL_COMMANDS};
use crate::scpi::{PortSpec, ScpiTransport, SerialScpi};
use crate::visa::{VisaResource, PMT2100_PRODUCT_ID, THORLABS_VENDOR_ID};
use anyhow::{Context, Result};
use async_trait::async_trait;
use daq_core::capabilities::{
    ChannelIndex, Constraint, Control, DeviceCategory, Detector, DetectorControls, GainRange,
};
use daq_core::driver::{Capability, DeviceComponents, DeviceMetadata, DriverFactory};
use daq_core::error::{AppResult, DaqError};
use daq_core::limits::DEFAULT_READ_TIMEOUT;
use daq_core::units::{Frequency, ValueRange, Voltage};
use futures::future::BoxFuture;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Model identifier reported through [`Detector::model`].
pub const PMT2100_MODEL: &str = "PMT2100";

/// Allowed gain control voltage.
pub const PMT2100_GAIN_RANGE: ValueRange<Voltage> =
    ValueRange::new(Voltage::from_volts(0.5), Voltage::from_volts(1.0));

/// Selectable low-pass corner frequencies.
pub const PMT2100_BANDWIDTHS: [Frequency; 3] = [
    Frequency::from_hertz(80_000_000.0),
    Frequency::from_hertz(2_500_000.0),
    Frequency::from_hertz(250_000.0),
];

static PMT2100_CONTROLS: DetectorControls = DetectorControls {
    enabled: Control::Adjustable(Constraint::Any),
    gain: Control::Adjustable(Constraint::Range(PMT2100_GAIN_RANGE)),
    gain_range: Some(GainRange::Voltage(PMT2100_GAIN_RANGE)),
    bandwidth: Control::Adjustable(Constraint::OneOf(&PMT2100_BANDWIDTHS)),
};

// =============================================================================
// Pmt2100Driver
// =============================================================================

/// Driver for the Thorlabs PMT2100 controller.
///
/// Owns its transport exclusively. Dropping the driver drops the transport,
/// which releases the port or VISA session.
pub struct Pmt2100Driver {
    transport: Box<dyn ScpiTransport>,
    commands: &'static CommandSet,
    target: String,
    sensor_head: Option<String>,
    index: ChannelIndex,
}

impl Pmt2100Driver {
    /// Open a serial port and return a driver using long-form commands.
    pub async fn connect_serial(port: &PortSpec, read_timeout: Duration) -> AppResult<Self> {
        let transport = SerialScpi::open(port, read_timeout).await?;
        Self::with_transport(Box::new(transport), &SERIAL_COMMANDS).await
    }

    /// Open a VISA session and return a driver using short-form commands
    /// addressed to the detected sensor head.
    #[cfg(feature = "visa")]
    pub async fn connect_visa(resource: &VisaResource, read_timeout: Duration) -> AppResult<Self> {
        let transport = crate::visa::VisaScpi::open(resource, read_timeout).await?;
        Self::with_transport(Box::new(transport), &crate::commands::VISA_COMMANDS).await
    }

    /// Build a driver over any transport.
    ///
    /// When the command set targets the detected sensor head, the head is
    /// queried here and cached.
    ///
    /// # Errors
    /// - [`DaqError::Timeout`] if the sensor-head query gets no answer
    /// - [`DaqError::Instrument`] if the answer is empty
    pub async fn with_transport(
        transport: Box<dyn ScpiTransport>,
        commands: &'static CommandSet,
    ) -> AppResult<Self> {
        let (target, sensor_head) = match (commands.target, commands.sensor_head) {
            (FunctionTarget::Fixed(target), _) => (target.to_string(), None),
            (FunctionTarget::DetectedHead, Some(query)) => {
                let head = transport.query(query).await?;
                if head.is_empty() {
                    return Err(DaqError::Instrument(format!(
                        "No sensor head reported by {}",
                        transport.resource()
                    )));
                }
                (head.clone(), Some(head))
            }
            (FunctionTarget::DetectedHead, None) => {
                return Err(DaqError::Configuration(format!(
                    "{} command set targets the sensor head but has no query for it",
                    commands.name
                )));
            }
        };

        info!(
            resource = transport.resource(),
            commands = commands.name,
            target = %target,
            "PMT2100 connected"
        );

        Ok(Self {
            transport,
            commands,
            target,
            sensor_head,
            index: ChannelIndex::new(),
        })
    }

    /// Raw, trimmed `*IDN?` response.
    #[instrument(skip(self), err)]
    pub async fn identify(&self) -> AppResult<String> {
        self.transport.query(self.commands.identify).await
    }

    /// IEEE 488.2 status byte.
    #[instrument(skip(self), err)]
    pub async fn status_byte(&self) -> AppResult<u8> {
        self.query_parsed(self.commands.status_byte, |s| {
            s.trim_start_matches('+').parse::<u8>().map_err(|e| e.to_string())
        })
        .await
    }

    /// Sensor head detected at connect time (VISA only).
    pub fn sensor_head(&self) -> Option<&str> {
        self.sensor_head.as_deref()
    }

    /// Where the transport is connected.
    pub fn resource(&self) -> &str {
        self.transport.resource()
    }

    async fn query_parsed<T, F>(&self, command: &str, parse: F) -> AppResult<T>
    where
        F: FnOnce(&str) -> std::result::Result<T, String>,
    {
        let response = self.transport.query(command).await?;
        parse(&response).map_err(|reason| DaqError::ResponseParse {
            command: command.to_string(),
            response,
            reason,
        })
    }
}

fn parse_quantity<T>(s: &str) -> std::result::Result<T, String>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    s.parse::<T>().map_err(|e| e.to_string())
}

#[async_trait]
impl Detector for Pmt2100Driver {
    fn model(&self) -> &str {
        PMT2100_MODEL
    }

    fn controls(&self) -> &DetectorControls {
        &PMT2100_CONTROLS
    }

    fn channel(&self) -> &ChannelIndex {
        &self.index
    }

    #[instrument(skip(self), err)]
    async fn enabled(&self) -> AppResult<bool> {
        let command = self.commands.state_query(&self.target)?;
        let response = self.transport.query(&command).await?;
        Ok(response == "1")
    }

    #[instrument(skip(self), err)]
    async fn set_enabled(&self, enabled: bool) -> AppResult<()> {
        PMT2100_CONTROLS
            .enabled
            .validate_write("enabled", PMT2100_MODEL, enabled)?;
        let command = self.commands.power(enabled, &self.target)?;
        self.transport.write(&command).await
    }

    #[instrument(skip(self), err)]
    async fn gain(&self) -> AppResult<Voltage> {
        self.transport.write(self.commands.select_gain).await?;
        self.query_parsed(self.commands.query_amplitude, parse_quantity::<Voltage>)
            .await
    }

    #[instrument(skip(self), err)]
    async fn set_gain(&self, gain: Voltage) -> AppResult<()> {
        PMT2100_CONTROLS
            .gain
            .validate_write("gain", PMT2100_MODEL, gain)?;
        let command = self.commands.amplitude(gain.volts())?;
        self.transport.write(self.commands.select_gain).await?;
        self.transport.write(&command).await
    }

    #[instrument(skip(self), err)]
    async fn bandwidth(&self) -> AppResult<Frequency> {
        self.query_parsed(self.commands.query_lowpass, parse_quantity::<Frequency>)
            .await
    }

    #[instrument(skip(self), err)]
    async fn set_bandwidth(&self, bandwidth: Frequency) -> AppResult<()> {
        PMT2100_CONTROLS
            .bandwidth
            .validate_write("bandwidth", PMT2100_MODEL, bandwidth)?;
        let command = self.commands.lowpass(bandwidth.hertz())?;
        self.transport.write(&command).await
    }

    async fn close(&self) -> AppResult<()> {
        self.transport.close().await
    }
}

// =============================================================================
// Factories
// =============================================================================

fn default_timeout_ms() -> u64 {
    u64::try_from(DEFAULT_READ_TIMEOUT.as_millis()).unwrap_or(1000)
}

/// Settings applied right after connecting.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pmt2100InitialSettings {
    /// Gain control voltage, e.g. `"0.75 V"`
    #[serde(default)]
    pub gain: Option<Voltage>,
    /// Low-pass corner, e.g. `"2.5 MHz"`
    #[serde(default)]
    pub bandwidth: Option<Frequency>,
    /// Switch the high voltage on or off
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl Pmt2100InitialSettings {
    fn validate(&self) -> Result<()> {
        if let Some(gain) = self.gain {
            PMT2100_CONTROLS
                .gain
                .validate_write("gain", PMT2100_MODEL, gain)?;
        }
        if let Some(bandwidth) = self.bandwidth {
            PMT2100_CONTROLS
                .bandwidth
                .validate_write("bandwidth", PMT2100_MODEL, bandwidth)?;
        }
        Ok(())
    }

    async fn apply(&self, driver: &Pmt2100Driver) -> Result<()> {
        if let Some(gain) = self.gain {
            driver.set_gain(gain).await.context("PMT2100: failed to set initial gain")?;
        }
        if let Some(bandwidth) = self.bandwidth {
            driver
                .set_bandwidth(bandwidth)
                .await
                .context("PMT2100: failed to set initial bandwidth")?;
        }
        if let Some(enabled) = self.enabled {
            driver
                .set_enabled(enabled)
                .await
                .context("PMT2100: failed to set initial enable state")?;
        }
        Ok(())
    }
}

async fn finish_build(driver: Pmt2100Driver, initial: &Pmt2100InitialSettings) -> Result<DeviceComponents> {
    if let Err(e) = initial.apply(&driver).await {
        if let Err(close_err) = driver.close().await {
            warn!(
                resource = driver.resource(),
                error = %close_err,
                "Failed to close PMT2100 transport after setup error"
            );
        }
        return Err(e);
    }

    let identity = driver.identify().await.ok();
    let transport = driver.resource().to_string();
    let driver: Arc<dyn Detector> = Arc::new(driver);

    Ok(DeviceComponents::new()
        .with_category(DeviceCategory::Detector)
        .with_detector(driver)
        .with_metadata(DeviceMetadata {
            vendor: Some("Thorlabs".to_string()),
            model: Some(PMT2100_MODEL.to_string()),
            transport: Some(transport),
            identity,
        }))
}

static PMT2100_CAPABILITIES: &[Capability] = &[
    Capability::Detector,
    Capability::EnableControl,
    Capability::GainControl,
    Capability::BandwidthControl,
];

/// Configuration for the serial PMT2100 driver
#[derive(Debug, Clone, Deserialize)]
pub struct Pmt2100SerialConfig {
    /// Port path or COM port number
    pub port: PortSpec,
    /// Response timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Optional settings applied after connecting
    #[serde(flatten)]
    pub initial: Pmt2100InitialSettings,
}

/// Factory for PMT2100 controllers on a serial port.
pub struct Pmt2100SerialFactory;

impl DriverFactory for Pmt2100SerialFactory {
    fn driver_type(&self) -> &'static str {
        "thorlabs_pmt2100_serial"
    }

    fn name(&self) -> &'static str {
        "Thorlabs PMT2100 Controller (serial)"
    }

    fn capabilities(&self) -> &'static [Capability] {
        PMT2100_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: Pmt2100SerialConfig = config.clone().try_into()?;
        if cfg.timeout_ms == 0 {
            anyhow::bail!("timeout_ms must be greater than zero");
        }
        cfg.initial.validate()
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: Pmt2100SerialConfig =
                config.try_into().context("Invalid PMT2100 serial config")?;

            let driver =
                Pmt2100Driver::connect_serial(&cfg.port, Duration::from_millis(cfg.timeout_ms))
                    .await
                    .with_context(|| format!("PMT2100: failed to connect on {}", cfg.port))?;

            finish_build(driver, &cfg.initial).await
        })
    }
}

fn default_vendor_id() -> u16 {
    THORLABS_VENDOR_ID
}

fn default_product_id() -> u16 {
    PMT2100_PRODUCT_ID
}

/// Configuration for the VISA PMT2100 driver
#[derive(Debug, Clone, Deserialize)]
pub struct Pmt2100VisaConfig {
    /// Instrument serial number
    pub serial_number: String,
    /// USB vendor ID override
    #[serde(default = "default_vendor_id")]
    pub vendor_id: u16,
    /// USB product ID override
    #[serde(default = "default_product_id")]
    pub product_id: u16,
    /// Response timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Optional settings applied after connecting
    #[serde(flatten)]
    pub initial: Pmt2100InitialSettings,
}

impl Pmt2100VisaConfig {
    /// VISA resource addressed by this configuration.
    pub fn resource(&self) -> VisaResource {
        VisaResource {
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            serial_number: self.serial_number.clone(),
        }
    }
}

/// Factory for PMT2100 controllers over VISA/USB.
#[cfg(feature = "visa")]
pub struct Pmt2100VisaFactory;

#[cfg(feature = "visa")]
impl DriverFactory for Pmt2100VisaFactory {
    fn driver_type(&self) -> &'static str {
        "thorlabs_pmt2100_visa"
    }

    fn name(&self) -> &'static str {
        "Thorlabs PMT2100 Controller (VISA)"
    }

    fn capabilities(&self) -> &'static [Capability] {
        PMT2100_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: Pmt2100VisaConfig = config.clone().try_into()?;
        cfg.resource().validate()?;
        if cfg.timeout_ms == 0 {
            anyhow::bail!("timeout_ms must be greater than zero");
        }
        cfg.initial.validate()
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: Pmt2100VisaConfig =
                config.try_into().context("Invalid PMT2100 VISA config")?;
            let resource = cfg.resource();

            let driver = Pmt2100Driver::connect_visa(&resource, Duration::from_millis(cfg.timeout_ms))
                .await
                .with_context(|| format!("PMT2100: failed to connect to {}", resource))?;

            finish_build(driver, &cfg.initial).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::VISA_COMMANDS;
    use crate::mock::MockScpiTransport;

    async fn serial_driver(mock: MockScpiTransport) -> Pmt2100Driver {
        Pmt2100Driver::with_transport(Box::new(mock), &SERIAL_COMMANDS)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_gain_readback() {
        let mock = MockScpiTransport::new().respond(":VOLTage:LEVel:IMMediate:AMPlitude?", "0.75");
        let sent = mock.sent_log();
        let pmt = serial_driver(mock).await;

        assert_eq!(pmt.gain().await.unwrap(), Voltage::from_volts(0.75));
        assert_eq!(
            *sent.lock(),
            vec![
                ":SELect GAIN".to_string(),
                ":VOLTage:LEVel:IMMediate:AMPlitude?".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_gain_out_of_range_writes_nothing() {
        let mock = MockScpiTransport::new();
        let sent = mock.sent_log();
        let pmt = serial_driver(mock).await;

        for volts in [0.49, 1.5, -1.0] {
            let err = pmt.set_gain(Voltage::from_volts(volts)).await.unwrap_err();
            assert!(matches!(err, DaqError::ValueOutOfRange { .. }));
            assert!(err.to_string().contains("[500 mV, 1 V]"));
        }
        assert!(sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_set_gain_selects_then_writes() {
        let mock = MockScpiTransport::new();
        let sent = mock.sent_log();
        let pmt = serial_driver(mock).await;

        pmt.set_gain(Voltage::from_volts(0.8)).await.unwrap();
        assert_eq!(
            *sent.lock(),
            vec![
                ":SELect GAIN".to_string(),
                ":VOLTage:LEVel:IMMediate:AMPlitude 0.8".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_bandwidth_choices() {
        let mock = MockScpiTransport::new();
        let sent = mock.sent_log();
        let pmt = serial_driver(mock).await;

        let err = pmt
            .set_bandwidth(Frequency::from_megahertz(10.0))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::InvalidChoice { .. }));
        assert!(sent.lock().is_empty());

        pmt.set_bandwidth(Frequency::from_kilohertz(250.0))
            .await
            .unwrap();
        assert_eq!(
            *sent.lock(),
            vec![":SENSe:FILTer:LPASs:FREQuency 250000".to_string()]
        );
    }

    #[tokio::test]
    async fn test_enabled_only_on_exact_one() {
        for (answer, expected) in [("1", true), ("0", false), ("ON", false), ("", false)] {
            let mock = MockScpiTransport::new().respond(":FUNCtion:STATe? PMT", answer);
            let pmt = serial_driver(mock).await;
            assert_eq!(pmt.enabled().await.unwrap(), expected, "answer {:?}", answer);
        }
    }

    #[tokio::test]
    async fn test_status_byte_parses() {
        let mock = MockScpiTransport::new()
            .respond("*STB?", "+16")
            .respond("*STB?", "junk");
        let pmt = serial_driver(mock).await;

        assert_eq!(pmt.status_byte().await.unwrap(), 16);
        assert!(matches!(
            pmt.status_byte().await,
            Err(DaqError::ResponseParse { .. })
        ));
    }

    #[tokio::test]
    async fn test_visa_targets_detected_head() {
        let mock = MockScpiTransport::new()
            .respond("SENS:DET?", "PMT2101")
            .respond(":SENS:FILT:LPAS:FREQ?", "8.000000E+07");
        let sent = mock.sent_log();
        let pmt = Pmt2100Driver::with_transport(Box::new(mock), &VISA_COMMANDS)
            .await
            .unwrap();

        assert_eq!(pmt.sensor_head(), Some("PMT2101"));
        pmt.set_enabled(true).await.unwrap();
        assert_eq!(
            pmt.bandwidth().await.unwrap(),
            Frequency::from_megahertz(80.0)
        );
        pmt.set_bandwidth(Frequency::from_megahertz(2.5))
            .await
            .unwrap();

        let sent = sent.lock();
        assert_eq!(sent[1], ":FUNC:ON PMT2101");
        assert_eq!(sent[3], ":SENS:FILT:LPAS:FREQ 2500000");
    }

    #[tokio::test]
    async fn test_visa_empty_head_is_instrument_error() {
        let mock = MockScpiTransport::new().respond("SENS:DET?", "");
        let result = Pmt2100Driver::with_transport(Box::new(mock), &VISA_COMMANDS).await;
        assert!(matches!(result, Err(DaqError::Instrument(_))));
    }

    #[tokio::test]
    async fn test_close_releases_transport() {
        let mock = MockScpiTransport::new().respond("*IDN?", "Thorlabs,PMT2100,M001,1.0");
        let closed = mock.closed_flag();
        let pmt = serial_driver(mock).await;

        assert_eq!(pmt.identify().await.unwrap(), "Thorlabs,PMT2100,M001,1.0");
        pmt.close().await.unwrap();
        assert!(*closed.lock());
        assert!(matches!(
            pmt.identify().await,
            Err(DaqError::SerialPortNotConnected)
        ));
    }

    #[tokio::test]
    async fn test_failed_setup_closes_transport() {
        let mock = MockScpiTransport::new()
            .fail(":VOLTage:LEVel:IMMediate:AMPlitude 0.75")
            .fail_close();
        let closed = mock.closed_flag();
        let pmt = serial_driver(mock).await;

        let initial = Pmt2100InitialSettings {
            gain: Some(Voltage::from_volts(0.75)),
            ..Default::default()
        };
        let err = match finish_build(pmt, &initial).await {
            Ok(_) => panic!("setup failure should fail the build"),
            Err(e) => e,
        };

        assert!(format!("{err:#}").contains("failed to set initial gain"));
        assert!(*closed.lock());
    }

    #[test]
    fn test_serial_factory_validate() {
        let factory = Pmt2100SerialFactory;

        let ok: toml::Value = toml::from_str(
            r#"
            port = 3
            gain = "0.75 V"
            bandwidth = "2.5 MHz"
            "#,
        )
        .unwrap();
        assert!(factory.validate(&ok).is_ok());

        let bad_gain: toml::Value = toml::from_str(
            r#"
            port = "/dev/ttyUSB0"
            gain = "2 V"
            "#,
        )
        .unwrap();
        assert!(factory.validate(&bad_gain).is_err());

        let missing_port: toml::Value = toml::from_str("timeout_ms = 100").unwrap();
        assert!(factory.validate(&missing_port).is_err());
    }

    #[test]
    fn test_visa_config_defaults() {
        let cfg: Pmt2100VisaConfig = toml::Value::try_into(
            toml::from_str::<toml::Value>(r#"serial_number = "M00412345""#).unwrap(),
        )
        .unwrap();
        assert_eq!(cfg.timeout_ms, 1000);
        assert_eq!(
            cfg.resource().to_string(),
            "USB0::0x1313::0x80B0::M00412345::0::INSTR"
        );
    }
}
