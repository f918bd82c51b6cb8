//! Shared hard limits and default timeouts.
//!
//! Centralizing these keeps the serial and VISA transports consistent and
//! gives configuration defaults a single source.

use std::time::Duration;

// =============================================================================
// Timeout Constants
// =============================================================================

/// Default read timeout for one SCPI response line (1 second).
///
/// Drivers accept a configured override; this is used when none is given.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout for releasing a transport during registry teardown (2 seconds).
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Window used to discard stale bytes after opening a serial port.
pub const DRAIN_WINDOW: Duration = Duration::from_millis(50);

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum accepted length of one response line in bytes (default: 4KB).
///
/// Every SCPI answer this workspace understands fits in a few dozen bytes;
/// anything longer means the line is not framed the way we expect.
pub const MAX_RESPONSE_LINE: usize = 4 * 1024;
