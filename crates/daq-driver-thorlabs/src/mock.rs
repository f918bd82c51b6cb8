//! Scriptable SCPI transport for tests.
//!
//! Records every line sent and answers queries from a per-command script.
//! A query with no scripted answer behaves like a silent instrument and
//! fails with [`DaqError::Timeout`].
//!
//! ```rust
//! use daq_driver_thorlabs::mock::MockScpiTransport;
//!
//! let mock = MockScpiTransport::new()
//!     .respond(":VOLTage:LEVel:IMMediate:AMPlitude?", "0.75");
//! let log = mock.sent_log();
//! ```

use async_trait::async_trait;
use daq_core::error::{AppResult, DaqError};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::scpi::ScpiTransport;

/// Shared view of the lines a mock has sent.
pub type SentLog = Arc<Mutex<Vec<String>>>;

/// In-memory [`ScpiTransport`].
#[derive(Default)]
pub struct MockScpiTransport {
    responses: Mutex<HashMap<String, VecDeque<String>>>,
    failing: Mutex<HashSet<String>>,
    close_fails: bool,
    sent: SentLog,
    closed: Arc<Mutex<bool>>,
}

impl MockScpiTransport {
    /// Create a mock with no scripted answers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an answer for `command`. Answers for the same command are
    /// returned in order; the last one repeats.
    pub fn respond(self, command: &str, response: &str) -> Self {
        self.responses
            .lock()
            .entry(command.to_string())
            .or_default()
            .push_back(response.to_string());
        self
    }

    /// Make every write or query of `command` fail with an instrument error.
    pub fn fail(self, command: &str) -> Self {
        self.failing.lock().insert(command.to_string());
        self
    }

    /// Make `close` report an error after releasing the transport.
    pub fn fail_close(mut self) -> Self {
        self.close_fails = true;
        self
    }

    /// Handle to the lines sent so far; stays valid after the mock is moved
    /// into a driver.
    pub fn sent_log(&self) -> SentLog {
        Arc::clone(&self.sent)
    }

    /// Handle reporting whether `close` was called.
    pub fn closed_flag(&self) -> Arc<Mutex<bool>> {
        Arc::clone(&self.closed)
    }

    fn ensure_open(&self) -> AppResult<()> {
        if *self.closed.lock() {
            return Err(DaqError::SerialPortNotConnected);
        }
        Ok(())
    }

    fn check_failure(&self, command: &str) -> AppResult<()> {
        if self.failing.lock().contains(command) {
            return Err(DaqError::Instrument(format!("scripted failure for '{command}'")));
        }
        Ok(())
    }
}

#[async_trait]
impl ScpiTransport for MockScpiTransport {
    fn resource(&self) -> &str {
        "mock"
    }

    async fn write(&self, command: &str) -> AppResult<()> {
        self.ensure_open()?;
        self.sent.lock().push(command.to_string());
        self.check_failure(command)
    }

    async fn query(&self, command: &str) -> AppResult<String> {
        self.ensure_open()?;
        self.sent.lock().push(command.to_string());
        self.check_failure(command)?;

        let mut responses = self.responses.lock();
        let queue = responses
            .get_mut(command)
            .ok_or_else(|| DaqError::Timeout(command.to_string()))?;
        let answer = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        answer.ok_or_else(|| DaqError::Timeout(command.to_string()))
    }

    async fn close(&self) -> AppResult<()> {
        *self.closed.lock() = true;
        if self.close_fails {
            return Err(DaqError::Instrument("scripted close failure".to_string()));
        }
        Ok(())
    }
}
