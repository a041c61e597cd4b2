//! Connection Negotiator
//!
//! Walks an ordered ladder of link parameters until one yields a live
//! session. The first entry is the usual default; later entries are only
//! tried after a clean "not connected" answer. Every failed handle is closed
//! before the next attempt, so at most one transport is open at a time.

use obd_protocol::{LinkParameters, ObdConnector, ObdError, ObdTransport};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::discovery::Endpoint;
use crate::error::DiagError;
use crate::session::Session;

/// Establishes sessions through an [`ObdConnector`]
#[derive(Clone)]
pub struct Negotiator {
    connector: Arc<dyn ObdConnector>,
}

impl Negotiator {
    /// Create a negotiator over the given connector
    pub fn new(connector: Arc<dyn ObdConnector>) -> Self {
        Self { connector }
    }

    fn attempt(
        &self,
        endpoint: Option<&Endpoint>,
        params: &LinkParameters,
    ) -> Result<Box<dyn ObdTransport>, ObdError> {
        match endpoint {
            Some(endpoint) => self.connector.connect(&endpoint.device, params),
            None => self.connector.auto_connect(params),
        }
    }

    /// Open a session on `endpoint` (or an auto-selected one), trying
    /// `params` in order.
    ///
    /// A raise on the first entry aborts with [`DiagError::Transport`]. A
    /// raise on a fallback entry is logged and the ladder continues; if the
    /// ladder then runs out, the last raise is reported instead of
    /// [`DiagError::NoDeviceFound`].
    pub fn connect(
        &self,
        endpoint: Option<&Endpoint>,
        params: &[LinkParameters],
    ) -> Result<Session, DiagError> {
        let target = endpoint.map_or("auto", |e| e.device.as_str());
        let Some((first, fallbacks)) = params.split_first() else {
            warn!("No link parameters to try on {}", target);
            return Err(DiagError::NoDeviceFound);
        };

        info!("Connecting to {} at {} baud", target, first.baud_rate);
        let transport = self
            .attempt(endpoint, first)
            .map_err(|e| DiagError::Transport(e.to_string()))?;
        if let Some(session) = accept(transport, endpoint, first) {
            return Ok(session);
        }

        let mut last_raise = None;
        for params in fallbacks {
            info!("Retrying {} at {} baud", target, params.baud_rate);
            match self.attempt(endpoint, params) {
                Ok(transport) => {
                    if let Some(session) = accept(transport, endpoint, params) {
                        return Ok(session);
                    }
                }
                Err(e) => {
                    warn!("Attempt at {} baud failed: {}", params.baud_rate, e);
                    last_raise = Some(e.to_string());
                }
            }
        }

        match last_raise {
            Some(detail) => Err(DiagError::Transport(detail)),
            None => {
                info!("No vehicle answered on {}", target);
                Err(DiagError::NoDeviceFound)
            }
        }
    }
}

/// Wrap a connected handle in a session, or close it and return `None`
fn accept(
    mut transport: Box<dyn ObdTransport>,
    endpoint: Option<&Endpoint>,
    params: &LinkParameters,
) -> Option<Session> {
    if transport.is_connected() {
        info!(
            "Connected on {} at {} baud",
            transport.port_name(),
            params.baud_rate
        );
        return Some(Session::new(transport, endpoint.cloned(), *params));
    }

    debug!("Not connected at {} baud, closing handle", params.baud_rate);
    if let Err(e) = transport.close() {
        warn!("Ignoring error while closing failed attempt: {}", e);
    }
    None
}
