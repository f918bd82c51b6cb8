//! PMT2100 driver over a fake serial line.
//!
//! A `tokio::io::duplex` pair stands in for the port. The far end runs a
//! small instrument model that answers the long-form command set.

use std::time::Duration;

use daq_core::capabilities::Detector;
use daq_core::error::DaqError;
use daq_core::units::{Frequency, Voltage};
use daq_driver_thorlabs::commands::SERIAL_COMMANDS;
use daq_driver_thorlabs::{Pmt2100Driver, ScpiTransport, SerialScpi};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Minimal PMT2100 model: keeps HV state, gain and low-pass settings and
/// reports every received line on `seen`. `*IDN?` is answered after
/// `idn_delay`.
async fn run_instrument(
    device: DuplexStream,
    seen: mpsc::UnboundedSender<String>,
    idn_delay: Duration,
) {
    let mut reader = BufReader::new(device);
    let mut hv_on = false;
    let mut gain = "0.5".to_string();
    let mut lowpass = "80000000".to_string();

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = line.trim().to_string();
        let _ = seen.send(line.clone());

        let reply = match line.as_str() {
            "*IDN?" => {
                tokio::time::sleep(idn_delay).await;
                Some("Thorlabs,PMT2100,M00412345,1.2.0".to_string())
            }
            "*STB?" => Some("0".to_string()),
            ":FUNCtion:ON PMT" => {
                hv_on = true;
                None
            }
            ":FUNCtion:OFF PMT" => {
                hv_on = false;
                None
            }
            ":FUNCtion:STATe? PMT" => Some(if hv_on { "1" } else { "0" }.to_string()),
            ":VOLTage:LEVel:IMMediate:AMPlitude?" => Some(gain.clone()),
            ":SENSe:FILTer:LPASs:FREQuency?" => Some(lowpass.clone()),
            ":SELect GAIN" => None,
            "*HANG?" => continue,
            other => {
                if let Some(v) = other.strip_prefix(":VOLTage:LEVel:IMMediate:AMPlitude ") {
                    gain = v.to_string();
                } else if let Some(v) = other.strip_prefix(":SENSe:FILTer:LPASs:FREQuency ") {
                    lowpass = v.to_string();
                }
                None
            }
        };

        if let Some(reply) = reply {
            let framed = format!("{}\r\n", reply);
            if reader.get_mut().write_all(framed.as_bytes()).await.is_err() {
                break;
            }
        }
    }
}

async fn connect() -> (Pmt2100Driver, mpsc::UnboundedReceiver<String>) {
    connect_with(Duration::ZERO, Duration::from_millis(200)).await
}

async fn connect_with(
    idn_delay: Duration,
    read_timeout: Duration,
) -> (Pmt2100Driver, mpsc::UnboundedReceiver<String>) {
    init_tracing();
    let (host, device) = tokio::io::duplex(1024);
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_instrument(device, tx, idn_delay));

    let transport = SerialScpi::from_stream(Box::new(host), "duplex", read_timeout);
    let driver = Pmt2100Driver::with_transport(Box::new(transport), &SERIAL_COMMANDS)
        .await
        .unwrap();
    (driver, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Ok(line) = rx.try_recv() {
        lines.push(line);
    }
    lines
}

#[tokio::test]
async fn identify_and_status() {
    let (pmt, _rx) = connect().await;

    assert_eq!(
        pmt.identify().await.unwrap(),
        "Thorlabs,PMT2100,M00412345,1.2.0"
    );
    assert_eq!(pmt.status_byte().await.unwrap(), 0);
    assert_eq!(pmt.sensor_head(), None);
}

#[tokio::test]
async fn high_voltage_round_trip() {
    let (pmt, _rx) = connect().await;

    assert!(!pmt.enabled().await.unwrap());
    pmt.set_enabled(true).await.unwrap();
    assert!(pmt.enabled().await.unwrap());
    pmt.set_enabled(false).await.unwrap();
    assert!(!pmt.enabled().await.unwrap());
}

#[tokio::test]
async fn gain_is_validated_before_sending() {
    let (pmt, mut rx) = connect().await;

    let err = pmt.set_gain(Voltage::from_volts(1.5)).await.unwrap_err();
    assert!(err.is_value_error());

    pmt.set_gain(Voltage::from_volts(0.75)).await.unwrap();
    assert_eq!(pmt.gain().await.unwrap(), Voltage::from_volts(0.75));

    let lines = drain(&mut rx);
    assert_eq!(
        lines,
        vec![
            ":SELect GAIN",
            ":VOLTage:LEVel:IMMediate:AMPlitude 0.75",
            ":SELect GAIN",
            ":VOLTage:LEVel:IMMediate:AMPlitude?",
        ]
    );
}

#[tokio::test]
async fn bandwidth_selection() {
    let (pmt, _rx) = connect().await;

    assert_eq!(
        pmt.bandwidth().await.unwrap(),
        Frequency::from_megahertz(80.0)
    );
    pmt.set_bandwidth(Frequency::from_kilohertz(250.0))
        .await
        .unwrap();
    assert_eq!(
        pmt.bandwidth().await.unwrap(),
        Frequency::from_kilohertz(250.0)
    );

    assert!(matches!(
        pmt.set_bandwidth(Frequency::from_megahertz(100.0)).await,
        Err(DaqError::InvalidChoice { .. })
    ));
}

#[tokio::test]
async fn close_then_use_is_not_connected() {
    let (pmt, _rx) = connect().await;

    pmt.close().await.unwrap();
    assert!(matches!(
        pmt.enabled().await,
        Err(DaqError::SerialPortNotConnected)
    ));
}

#[tokio::test]
async fn missing_answer_times_out() {
    init_tracing();
    let (host, device) = tokio::io::duplex(1024);
    let (tx, _rx) = mpsc::unbounded_channel();
    tokio::spawn(run_instrument(device, tx, Duration::ZERO));

    let transport = SerialScpi::from_stream(Box::new(host), "duplex", Duration::from_millis(50));

    // The model swallows this query without answering.
    let err = transport.query("*HANG?").await.unwrap_err();
    assert!(matches!(err, DaqError::Timeout(ref cmd) if cmd == "*HANG?"));

    assert_eq!(transport.query("*STB?").await.unwrap(), "0");
}

#[tokio::test]
async fn late_identity_does_not_shift_later_answers() {
    let (pmt, _rx) = connect_with(Duration::from_millis(150), Duration::from_millis(100)).await;

    assert!(matches!(
        pmt.identify().await,
        Err(DaqError::Timeout(ref cmd)) if cmd == "*IDN?"
    ));

    pmt.set_enabled(true).await.unwrap();
    assert!(pmt.enabled().await.unwrap());
    pmt.set_enabled(false).await.unwrap();
    assert!(!pmt.enabled().await.unwrap());
}
