//! VISA/USB addressing and transport.
//!
//! [`VisaResource`] builds the USB resource string and is always available.
//! [`VisaScpi`] needs a system VISA library and is compiled only with the
//! `visa` feature.
//!
//! visa-rs calls are blocking, so every exchange runs on the blocking pool
//! under a `parking_lot` mutex and is bounded by the configured read timeout.

use daq_core::error::{AppResult, DaqError};
use daq_core::serial::decode_ascii;
use std::fmt;
use std::io::Read;

/// Thorlabs USB vendor ID.
pub const THORLABS_VENDOR_ID: u16 = 0x1313;

/// USB product ID of the PMT2100 controller.
pub const PMT2100_PRODUCT_ID: u16 = 0x80B0;

/// USB instrument address: `USB0::<vendor>::<product>::<serial>::0::INSTR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisaResource {
    /// USB vendor ID
    pub vendor_id: u16,
    /// USB product ID
    pub product_id: u16,
    /// Instrument serial number
    pub serial_number: String,
}

impl VisaResource {
    /// PMT2100 resource with the default Thorlabs IDs.
    pub fn pmt2100(serial_number: impl Into<String>) -> Self {
        Self {
            vendor_id: THORLABS_VENDOR_ID,
            product_id: PMT2100_PRODUCT_ID,
            serial_number: serial_number.into(),
        }
    }

    /// Reject serial numbers that would produce a malformed resource string.
    pub fn validate(&self) -> AppResult<()> {
        let serial = self.serial_number.trim();
        if serial.is_empty() {
            return Err(DaqError::Configuration(
                "VISA serial number must not be empty".to_string(),
            ));
        }
        if serial.contains("::") || serial.chars().any(char::is_whitespace) {
            return Err(DaqError::Configuration(format!(
                "VISA serial number '{}' contains '::' or whitespace",
                self.serial_number
            )));
        }
        Ok(())
    }
}

impl fmt::Display for VisaResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "USB0::0x{:04X}::0x{:04X}::{}::0::INSTR",
            self.vendor_id, self.product_id, self.serial_number
        )
    }
}

/// Read one response with a single read call.
///
/// A VISA read returns at the END indicator, at the termination character
/// or when the buffer is full, so one call yields one complete answer. A
/// full buffer means the answer did not fit.
#[cfg_attr(not(feature = "visa"), allow(dead_code))]
fn read_response<R: Read>(mut reader: R, max_bytes: usize) -> AppResult<String> {
    let mut buf = vec![0u8; max_bytes.saturating_add(1)];
    let n = reader.read(&mut buf)?;
    if n == 0 {
        return Err(DaqError::SerialUnexpectedEof);
    }
    if n > max_bytes {
        return Err(DaqError::ResponseTooLarge {
            bytes: n,
            max_bytes,
        });
    }
    Ok(decode_ascii(&buf[..n]))
}

#[cfg(feature = "visa")]
pub use session::VisaScpi;

#[cfg(feature = "visa")]
mod session {
    use super::VisaResource;
    use crate::scpi::ScpiTransport;
    use async_trait::async_trait;
    use daq_core::error::{AppResult, DaqError};
    use daq_core::limits::MAX_RESPONSE_LINE;
    use super::read_response;
    use parking_lot::Mutex;
    use std::ffi::CString;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::task::spawn_blocking;
    use tokio::time::timeout;
    use tracing::{debug, info, warn};
    use visa_rs::prelude::*;

    /// Open instrument plus the resource manager that owns it.
    ///
    /// Field order matters: the instrument must be closed before the
    /// resource manager.
    struct VisaSession {
        instr: Instrument,
        _rm: DefaultRM,
    }

    /// SCPI over a VISA instrument session.
    pub struct VisaScpi {
        session: Arc<Mutex<Option<VisaSession>>>,
        /// Set when a query gave up before its answer was consumed
        stale: Arc<AtomicBool>,
        resource: String,
        timeout: Duration,
    }

    impl VisaScpi {
        /// Open a VISA session to `resource`.
        ///
        /// # Errors
        /// [`DaqError::ConnectionFailed`] if the resource manager or the
        /// instrument cannot be opened.
        pub async fn open(resource: &VisaResource, read_timeout: Duration) -> AppResult<Self> {
            resource.validate()?;
            let name = resource.to_string();
            let name_owned = name.clone();

            let session = spawn_blocking(move || -> AppResult<VisaSession> {
                let rm = DefaultRM::new().map_err(|e| {
                    DaqError::ConnectionFailed(format!("VISA resource manager unavailable: {e}"))
                })?;
                let res = CString::new(name_owned.clone()).map_err(|e| {
                    DaqError::Configuration(format!("Invalid VISA resource '{name_owned}': {e}"))
                })?;
                let instr = rm
                    .open(&res.into(), AccessMode::NO_LOCK, read_timeout)
                    .map_err(|e| {
                        DaqError::ConnectionFailed(format!("Failed to open {name_owned}: {e}"))
                    })?;
                Ok(VisaSession { instr, _rm: rm })
            })
            .await
            .map_err(|e| {
                DaqError::ConnectionFailed(format!("spawn_blocking for VISA open failed: {e}"))
            })??;

            info!(resource = %name, "Opened VISA SCPI transport");
            Ok(Self {
                session: Arc::new(Mutex::new(Some(session))),
                stale: Arc::new(AtomicBool::new(false)),
                resource: name,
                timeout: read_timeout,
            })
        }

        async fn exchange(&self, command: &str, read_response: bool) -> AppResult<String> {
            let session = Arc::clone(&self.session);
            let stale = Arc::clone(&self.stale);
            let line = format!("{command}\n");

            let task = spawn_blocking(move || -> AppResult<String> {
                let mut guard = session.lock();
                let s = guard.as_mut().ok_or(DaqError::SerialPortNotConnected)?;
                if stale.swap(false, Ordering::AcqRel) {
                    // Device clear flushes the output queue holding a late reply.
                    s.instr.clear().map_err(|e| {
                        DaqError::Instrument(format!("VISA device clear failed: {e}"))
                    })?;
                }
                s.instr.write_all(line.as_bytes())?;
                if !read_response {
                    return Ok(String::new());
                }
                let response = read_response(&s.instr, MAX_RESPONSE_LINE);
                if matches!(response, Err(DaqError::ResponseTooLarge { .. })) {
                    stale.store(true, Ordering::Release);
                }
                response
            });

            match timeout(self.timeout, task).await {
                Ok(joined) => joined
                    .map_err(|e| DaqError::Instrument(format!("VISA I/O task failed: {e}")))?,
                Err(_) => {
                    self.stale.store(true, Ordering::Release);
                    warn!(resource = %self.resource, command, "No response before read timeout");
                    Err(DaqError::Timeout(command.to_string()))
                }
            }
        }
    }

    #[async_trait]
    impl ScpiTransport for VisaScpi {
        fn resource(&self) -> &str {
            &self.resource
        }

        async fn write(&self, command: &str) -> AppResult<()> {
            debug!(resource = %self.resource, command, "SCPI write");
            self.exchange(command, false).await.map(|_| ())
        }

        async fn query(&self, command: &str) -> AppResult<String> {
            debug!(resource = %self.resource, command, "SCPI query");
            let response = self.exchange(command, true).await?;
            debug!(resource = %self.resource, response = %response, "SCPI response");
            Ok(response)
        }

        async fn close(&self) -> AppResult<()> {
            let session = Arc::clone(&self.session);
            let released = spawn_blocking(move || session.lock().take().is_some())
                .await
                .map_err(|e| DaqError::Instrument(format!("VISA close task failed: {e}")))?;
            if released {
                info!(resource = %self.resource, "Closed VISA SCPI transport");
            }
            Ok(())
        }
    }
}
