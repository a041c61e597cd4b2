//! Session Handle
//!
//! A live diagnostic connection. The session owns its transport; closing is
//! idempotent, never fails from the caller's point of view, and also happens
//! on drop.

use chrono::{DateTime, Utc};
use obd_protocol::{LinkParameters, ObdTransport};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::discovery::Endpoint;
use crate::error::DiagError;

/// A stored trouble code and its description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TroubleCode {
    /// Five-character code, e.g. "P0171"
    pub code: String,
    /// Description, empty when unknown
    pub description: String,
}

/// Outcome of a read. An empty list means no faults are stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticResult {
    /// Codes in the order the vehicle reported them
    pub codes: Vec<TroubleCode>,
    /// When the read completed
    pub read_at: DateTime<Utc>,
}

impl DiagnosticResult {
    /// Build a result from transport pairs
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        Self {
            codes: pairs
                .into_iter()
                .map(|(code, description)| TroubleCode { code, description })
                .collect(),
            read_at: Utc::now(),
        }
    }

    /// True when the vehicle reported no faults
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Number of codes
    pub fn len(&self) -> usize {
        self.codes.len()
    }
}

/// Outcome of a clear
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearOutcome {
    /// Whether the vehicle acknowledged the clear
    pub success: bool,
}

/// One established diagnostic connection
pub struct Session {
    transport: Box<dyn ObdTransport>,
    endpoint: Option<Endpoint>,
    params: LinkParameters,
    closed: bool,
}

impl Session {
    /// Wrap a transport that reported connected
    pub(crate) fn new(
        transport: Box<dyn ObdTransport>,
        endpoint: Option<Endpoint>,
        params: LinkParameters,
    ) -> Self {
        Self {
            transport,
            endpoint,
            params,
            closed: false,
        }
    }

    /// True iff the transport reports a live link
    pub fn is_connected(&self) -> bool {
        !self.closed && self.transport.is_connected()
    }

    /// Endpoint in use; `None` unless connected
    pub fn port_name(&self) -> Option<String> {
        self.is_connected().then(|| self.transport.port_name())
    }

    /// Parameters that produced this session
    pub fn link_parameters(&self) -> LinkParameters {
        self.params
    }

    /// Read stored trouble codes
    pub fn read_trouble_codes(&mut self) -> Result<DiagnosticResult, DiagError> {
        if self.closed {
            return Err(DiagError::NotConnected);
        }
        let response = self
            .transport
            .read_dtc()
            .map_err(|e| DiagError::Query(e.to_string()))?;

        // A missing value is reported as "no faults"
        let result = DiagnosticResult::from_pairs(response.value.unwrap_or_default());
        info!("Read {} trouble codes", result.len());
        Ok(result)
    }

    /// Clear stored trouble codes. A completed call may still report failure.
    pub fn clear_trouble_codes(&mut self) -> Result<ClearOutcome, DiagError> {
        if self.closed {
            return Err(DiagError::NotConnected);
        }
        let response = self
            .transport
            .clear_dtc()
            .map_err(|e| DiagError::Query(e.to_string()))?;

        let outcome = ClearOutcome {
            success: response.is_successful(),
        };
        info!("Clear trouble codes acknowledged: {}", outcome.success);
        Ok(outcome)
    }

    /// Close the transport. Safe to call more than once; failures are logged
    /// and discarded.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let device = self.endpoint.as_ref().map_or("auto", |e| e.device.as_str());
        debug!("Closing session on {} at {} baud", device, self.params.baud_rate);
        if let Err(e) = self.transport.close() {
            warn!("Ignoring error while closing session: {}", e);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.endpoint)
            .field("params", &self.params)
            .field("closed", &self.closed)
            .finish()
    }
}
