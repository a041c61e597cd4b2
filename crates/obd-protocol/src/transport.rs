//! Transport contract between the diagnostics core and an OBD-II adapter.
//!
//! A [`ObdConnector`] opens handles; a handle ([`ObdTransport`]) may come back
//! not connected, which is a clean failure rather than an error. Errors are
//! reserved for the transport itself misbehaving (port busy, I/O failure).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ObdError;

/// Baud rates tried by default, most common first
pub const DEFAULT_BAUD_RATES: [u32; 4] = [38400, 9600, 115200, 57600];

/// Default per-attempt timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A (speed, timeout) pair used when attempting to open a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkParameters {
    /// Serial baud rate
    pub baud_rate: u32,
    /// Bound on each wait for an adapter answer
    pub timeout: Duration,
}

impl LinkParameters {
    /// Create a new parameter pair
    pub fn new(baud_rate: u32, timeout: Duration) -> Self {
        Self { baud_rate, timeout }
    }

    /// Build an ordered fallback ladder sharing one timeout
    pub fn ladder(baud_rates: &[u32], timeout: Duration) -> Vec<Self> {
        baud_rates
            .iter()
            .map(|&baud_rate| Self::new(baud_rate, timeout))
            .collect()
    }
}

impl Default for LinkParameters {
    fn default() -> Self {
        Self::new(DEFAULT_BAUD_RATES[0], DEFAULT_TIMEOUT)
    }
}

/// Answer to a stored trouble code request.
///
/// `value` is `None` when the adapter produced nothing usable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DtcResponse {
    /// (code, description) pairs in the order the ECUs reported them
    pub value: Option<Vec<(String, String)>>,
}

impl DtcResponse {
    /// Response carrying the given codes
    pub fn codes(value: Vec<(String, String)>) -> Self {
        Self { value: Some(value) }
    }

    /// Response with no usable value
    pub fn none() -> Self {
        Self { value: None }
    }
}

/// Acknowledgement of a clear request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearResponse {
    successful: bool,
}

impl ClearResponse {
    /// Wrap the adapter's acknowledgement
    pub fn new(successful: bool) -> Self {
        Self { successful }
    }

    /// Whether the vehicle acknowledged the clear
    pub fn is_successful(&self) -> bool {
        self.successful
    }
}

/// An open (or attempted) adapter handle
pub trait ObdTransport: Send {
    /// Whether a live link to the vehicle exists
    fn is_connected(&self) -> bool;

    /// Identity of the serial endpoint in use
    fn port_name(&self) -> String;

    /// Read stored diagnostic trouble codes (Mode 03)
    fn read_dtc(&mut self) -> Result<DtcResponse, ObdError>;

    /// Clear stored diagnostic trouble codes (Mode 04)
    fn clear_dtc(&mut self) -> Result<ClearResponse, ObdError>;

    /// Release the underlying port
    fn close(&mut self) -> Result<(), ObdError>;
}

/// Opens adapter handles
pub trait ObdConnector: Send + Sync {
    /// Let the transport pick an endpoint on its own
    fn auto_connect(&self, params: &LinkParameters) -> Result<Box<dyn ObdTransport>, ObdError>;

    /// Open a specific endpoint
    fn connect(
        &self,
        port: &str,
        params: &LinkParameters,
    ) -> Result<Box<dyn ObdTransport>, ObdError>;
}
