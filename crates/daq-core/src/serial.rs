//! Serial Port Abstractions for Driver Crates
//!
//! Shared types and utilities for line-oriented async serial communication.
//!
//! # Types
//!
//! - [`SerialPortIO`]: Trait alias combining AsyncRead + AsyncWrite for serial ports
//! - [`DynSerial`]: Type-erased boxed serial port
//!
//! # Utilities
//!
//! - [`open_serial_async`]: Open a serial port with spawn_blocking (`serial` feature)
//! - [`drain_serial_buffer`]: Drain stale data from a serial port
//! - [`read_line_limited`]: Read one `\n`-terminated line with a size cap
//! - [`decode_ascii`]: Decode a response line, dropping non-ASCII bytes
//!
//! # Example
//!
//! ```rust,ignore
//! use daq_core::serial::{open_serial_async, read_line_limited};
//! use tokio::io::{AsyncWriteExt, BufReader};
//!
//! let port = open_serial_async("/dev/ttyUSB0", 115_200, "PMT2100").await?;
//! let mut reader = BufReader::new(port);
//! reader.get_mut().write_all(b"*IDN?\n").await?;
//! let idn = read_line_limited(&mut reader, 4096).await?;
//! ```

use crate::error::{AppResult, DaqError};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, warn};

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port. This includes:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

// =============================================================================
// Serial Port Utilities
// =============================================================================

/// Open a serial port asynchronously using spawn_blocking.
///
/// Standard settings are applied: 8N1, no flow control. On failure the
/// error message lists the ports the OS currently reports, which is usually
/// the quickest way to spot a wrong port name.
///
/// # Errors
///
/// Returns [`DaqError::ConnectionFailed`] if the port cannot be opened.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> AppResult<tokio_serial::SerialStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                let available = tokio_serial::available_ports()
                    .map(|ports| {
                        ports
                            .into_iter()
                            .map(|p| p.port_name)
                            .collect::<Vec<_>>()
                            .join(", ")
                    })
                    .unwrap_or_default();
                DaqError::ConnectionFailed(format!(
                    "Failed to open {} serial port {}: {} (available: [{}])",
                    device_name_owned, port_path_owned, e, available
                ))
            })
    })
    .await
    .map_err(|e| {
        DaqError::ConnectionFailed(format!("spawn_blocking for serial port opening failed: {e}"))
    })?
}

/// Drain stale data from a serial port buffer.
///
/// Reads and discards until nothing arrives within `window`. Returns the
/// number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, window: Duration) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + window;
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(e)) => {
                warn!(error = %e, "I/O error while draining serial buffer");
                break;
            }
            Err(_) => break,
        }
    }

    if total_discarded > 0 {
        debug!(bytes = total_discarded, "Discarded stale serial input");
    }
    total_discarded
}

/// Read one `\n`-terminated line of at most `max_bytes` bytes.
///
/// The returned string is decoded with [`decode_ascii`].
///
/// # Errors
///
/// - [`DaqError::SerialUnexpectedEof`] if the stream ends before a newline
/// - [`DaqError::ResponseTooLarge`] if no newline arrives within `max_bytes`
pub async fn read_line_limited<R>(reader: &mut R, max_bytes: usize) -> AppResult<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = u64::try_from(max_bytes).unwrap_or(u64::MAX).saturating_add(1);
    let n = (&mut *reader)
        .take(limit)
        .read_until(b'\n', &mut buf)
        .await?;

    if n == 0 {
        return Err(DaqError::SerialUnexpectedEof);
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() > max_bytes {
            return Err(DaqError::ResponseTooLarge {
                bytes: buf.len(),
                max_bytes,
            });
        }
        return Err(DaqError::SerialUnexpectedEof);
    }

    Ok(decode_ascii(&buf))
}

/// Decode a response line as ASCII, dropping bytes outside the ASCII range,
/// then trim surrounding whitespace (including the line terminator).
pub fn decode_ascii(bytes: &[u8]) -> String {
    let text: String = bytes
        .iter()
        .filter(|b| b.is_ascii())
        .map(|&b| char::from(b))
        .collect();
    text.trim().to_string()
}
