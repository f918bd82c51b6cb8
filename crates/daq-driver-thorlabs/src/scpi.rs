//! SCPI line transports.
//!
//! The PMT2100 driver talks to the controller through [`ScpiTransport`],
//! which knows nothing about the command vocabulary. Each exchange is one
//! `\n`-terminated ASCII line out and, for queries, one line back.
//!
//! Implementations:
//! - [`SerialScpi`]: serial port (or any async byte stream, for tests)
//! - `VisaScpi`: VISA/USB resource (feature `visa`)
//! - [`MockScpiTransport`](crate::mock::MockScpiTransport): scripted, for tests

use async_trait::async_trait;
use daq_core::error::{AppResult, DaqError};
use daq_core::limits::{DRAIN_WINDOW, MAX_RESPONSE_LINE};
use daq_core::serial::{drain_serial_buffer, open_serial_async, read_line_limited, DynSerial};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// PMT2100 serial line rate (8N1).
pub const PMT2100_BAUD_RATE: u32 = 115_200;

/// Line-oriented SCPI transport.
///
/// # Contract
/// - `write` sends one line and returns without reading
/// - `query` sends one line and returns the next response line, trimmed
/// - after `close`, `write` and `query` fail with
///   [`DaqError::SerialPortNotConnected`]; `close` itself is idempotent
#[async_trait]
pub trait ScpiTransport: Send + Sync {
    /// Where the transport is connected (port path, VISA resource).
    fn resource(&self) -> &str;

    /// Send one command line.
    async fn write(&self, command: &str) -> AppResult<()>;

    /// Send one query line and read one response line.
    async fn query(&self, command: &str) -> AppResult<String>;

    /// Release the underlying port or session.
    async fn close(&self) -> AppResult<()>;
}

// =============================================================================
// Port Specification
// =============================================================================

/// Serial port as written in configuration: a path or a COM port number.
///
/// ```toml
/// port = 3               # COM3
/// port = "/dev/ttyUSB0"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    /// Windows COM port number
    Number(u8),
    /// Device path or port name
    Path(String),
}

impl PortSpec {
    /// Name passed to the OS when opening the port.
    pub fn path(&self) -> String {
        match self {
            Self::Number(n) => format!("COM{n}"),
            Self::Path(p) => p.clone(),
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

// =============================================================================
// Serial Transport
// =============================================================================

/// Open port plus the resynchronization flag for its input side.
struct SerialLine {
    reader: BufReader<DynSerial>,
    /// Set when a query gave up before consuming its whole answer; a late
    /// or partial reply may still be in flight.
    stale: bool,
}

impl SerialLine {
    /// Drop whatever input belongs to an earlier exchange.
    ///
    /// Buffered bytes are always discarded. After a timeout or an oversized
    /// answer the stream is also drained for one read timeout, so the late
    /// reply cannot be taken as the answer to the next query.
    async fn resync(&mut self, window: Duration, resource: &str) {
        let buffered = self.reader.buffer().len();
        if buffered > 0 {
            debug!(port = %resource, bytes = buffered, "Clearing buffered input");
            self.reader.consume(buffered);
        }

        if self.stale {
            let discarded = drain_serial_buffer(self.reader.get_mut(), window).await;
            debug!(port = %resource, discarded, "Drained input after incomplete exchange");
            self.stale = false;
        }
    }
}

/// SCPI over an async byte stream.
///
/// The stream sits behind a mutex so that a write and the read of its
/// response are never interleaved with another exchange. Closing takes the
/// stream out of the mutex; dropping the transport drops the stream, which
/// closes the port.
pub struct SerialScpi {
    port: Mutex<Option<SerialLine>>,
    resource: String,
    timeout: Duration,
}

impl SerialScpi {
    /// Open a serial port at 115200 baud, 8N1.
    ///
    /// Stale bytes left in the input buffer are discarded.
    ///
    /// # Errors
    /// [`DaqError::ConnectionFailed`] if the port cannot be opened.
    pub async fn open(port: &PortSpec, read_timeout: Duration) -> AppResult<Self> {
        let path = port.path();
        let mut stream = open_serial_async(&path, PMT2100_BAUD_RATE, "PMT2100").await?;

        let discarded = drain_serial_buffer(&mut stream, DRAIN_WINDOW).await;
        if discarded > 0 {
            debug!(port = %path, discarded, "Discarded stale bytes after open");
        }

        info!(port = %path, baud = PMT2100_BAUD_RATE, "Opened serial SCPI transport");
        Ok(Self::from_stream(Box::new(stream), path, read_timeout))
    }

    /// Wrap an already-open stream (a `tokio::io::duplex` end in tests).
    pub fn from_stream(stream: DynSerial, resource: impl Into<String>, read_timeout: Duration) -> Self {
        Self {
            port: Mutex::new(Some(SerialLine {
                reader: BufReader::new(stream),
                stale: false,
            })),
            resource: resource.into(),
            timeout: read_timeout,
        }
    }

    async fn send(reader: &mut BufReader<DynSerial>, command: &str) -> AppResult<()> {
        let line = format!("{}\n", command);
        reader.get_mut().write_all(line.as_bytes()).await?;
        reader.get_mut().flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ScpiTransport for SerialScpi {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn write(&self, command: &str) -> AppResult<()> {
        let mut guard = self.port.lock().await;
        let line = guard.as_mut().ok_or(DaqError::SerialPortNotConnected)?;

        debug!(port = %self.resource, command, "SCPI write");
        Self::send(&mut line.reader, command).await
    }

    async fn query(&self, command: &str) -> AppResult<String> {
        let mut guard = self.port.lock().await;
        let line = guard.as_mut().ok_or(DaqError::SerialPortNotConnected)?;

        line.resync(self.timeout.max(DRAIN_WINDOW), &self.resource)
            .await;

        debug!(port = %self.resource, command, "SCPI query");
        Self::send(&mut line.reader, command).await?;

        let read = read_line_limited(&mut line.reader, MAX_RESPONSE_LINE);
        let response = match timeout(self.timeout, read).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                if matches!(e, DaqError::ResponseTooLarge { .. }) {
                    line.stale = true;
                }
                return Err(e);
            }
            Err(_) => {
                line.stale = true;
                warn!(port = %self.resource, command, "No response before read timeout");
                return Err(DaqError::Timeout(command.to_string()));
            }
        };

        debug!(port = %self.resource, response = %response, "SCPI response");
        Ok(response)
    }

    async fn close(&self) -> AppResult<()> {
        let Some(mut line) = self.port.lock().await.take() else {
            return Ok(());
        };

        if let Err(e) = line.reader.get_mut().shutdown().await {
            warn!(port = %self.resource, error = %e, "Error shutting down serial port");
        }
        info!(port = %self.resource, "Closed serial SCPI transport");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_spec_from_config() {
        #[derive(Deserialize)]
        struct Cfg {
            port: PortSpec,
        }

        let numbered: Cfg = toml::from_str("port = 3").unwrap();
        assert_eq!(numbered.port, PortSpec::Number(3));
        assert_eq!(numbered.port.path(), "COM3");

        let named: Cfg = toml::from_str(r#"port = "/dev/ttyUSB0""#).unwrap();
        assert_eq!(named.port.path(), "/dev/ttyUSB0");
    }

    #[tokio::test]
    async fn test_query_writes_line_and_reads_answer() {
        let (host, device) = tokio::io::duplex(256);
        let scpi = SerialScpi::from_stream(Box::new(host), "duplex", Duration::from_millis(500));

        let instrument = tokio::spawn(async move {
            let mut reader = BufReader::new(device);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            reader.get_mut().write_all(b"0.75\r\n").await.unwrap();
            line
        });

        let answer = scpi
            .query(":VOLTage:LEVel:IMMediate:AMPlitude?")
            .await
            .unwrap();
        assert_eq!(answer, "0.75");
        assert_eq!(
            instrument.await.unwrap(),
            ":VOLTage:LEVel:IMMediate:AMPlitude?\n"
        );
    }

    #[tokio::test]
    async fn test_silent_device_times_out() {
        let (host, _device) = tokio::io::duplex(256);
        let scpi = SerialScpi::from_stream(Box::new(host), "duplex", Duration::from_millis(50));

        let err = scpi.query("*IDN?").await.unwrap_err();
        assert!(matches!(err, DaqError::Timeout(cmd) if cmd == "*IDN?"));
    }

    #[tokio::test]
    async fn test_late_reply_is_not_taken_by_next_query() {
        let (host, device) = tokio::io::duplex(256);
        let scpi = SerialScpi::from_stream(Box::new(host), "duplex", Duration::from_millis(100));

        tokio::spawn(async move {
            let mut reader = BufReader::new(device);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            tokio::time::sleep(Duration::from_millis(150)).await;
            reader
                .get_mut()
                .write_all(b"Thorlabs,PMT2100,M00412345,1.2.0\r\n")
                .await
                .unwrap();

            line.clear();
            reader.read_line(&mut line).await.unwrap();
            reader.get_mut().write_all(b"16\r\n").await.unwrap();
        });

        assert!(matches!(
            scpi.query("*IDN?").await,
            Err(DaqError::Timeout(_))
        ));
        assert_eq!(scpi.query("*STB?").await.unwrap(), "16");
    }

    #[tokio::test]
    async fn test_oversized_reply_is_discarded() {
        let (host, device) = tokio::io::duplex(256);
        let scpi = SerialScpi::from_stream(Box::new(host), "duplex", Duration::from_millis(100));

        tokio::spawn(async move {
            let mut reader = BufReader::new(device);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let mut flood = vec![b'x'; MAX_RESPONSE_LINE + 500];
            flood.push(b'\n');
            reader.get_mut().write_all(&flood).await.unwrap();

            line.clear();
            reader.read_line(&mut line).await.unwrap();
            reader.get_mut().write_all(b"1\r\n").await.unwrap();
        });

        assert!(matches!(
            scpi.query("*IDN?").await,
            Err(DaqError::ResponseTooLarge { .. })
        ));
        assert_eq!(scpi.query(":FUNCtion:STATe? PMT").await.unwrap(), "1");
    }

    #[tokio::test]
    async fn test_closed_transport_is_not_connected() {
        let (host, _device) = tokio::io::duplex(256);
        let scpi = SerialScpi::from_stream(Box::new(host), "duplex", Duration::from_millis(50));

        scpi.close().await.unwrap();
        scpi.close().await.unwrap();
        assert!(matches!(
            scpi.write(":SELect GAIN").await,
            Err(DaqError::SerialPortNotConnected)
        ));
        assert!(matches!(
            scpi.query("*STB?").await,
            Err(DaqError::SerialPortNotConnected)
        ));
    }
}
