//! Port Discovery
//!
//! Lists serial endpoints and keeps the ones that look like OBD-II adapters.
//! When nothing matches, every endpoint is returned so no hardware is hidden.

use obd_protocol::{PortInfo, PortLister};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::DiagError;

/// Description keywords of common USB-serial bridges and OBD adapters
pub const ADAPTER_KEYWORDS: [&str; 6] = ["usb", "serial", "ch340", "ftdi", "cp210", "obd"];

/// A candidate serial connection point
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Device path or name
    pub device: String,
    /// Human-readable description
    pub description: String,
}

impl Endpoint {
    /// Create an endpoint
    pub fn new(device: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            description: description.into(),
        }
    }
}

impl From<PortInfo> for Endpoint {
    fn from(port: PortInfo) -> Self {
        Self {
            device: port.device,
            description: port.description,
        }
    }
}

/// Result of one scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Endpoints to offer, in OS enumeration order
    pub endpoints: Vec<Endpoint>,
    /// True when no endpoint matched and the full list was returned instead
    pub fell_back: bool,
}

/// Keep endpoints whose description contains any keyword, ignoring case.
///
/// `keywords` are expected in lower case.
pub fn filter_endpoints(endpoints: &[Endpoint], keywords: &[String]) -> Vec<Endpoint> {
    endpoints
        .iter()
        .filter(|endpoint| {
            let description = endpoint.description.to_lowercase();
            keywords.iter().any(|k| description.contains(k.as_str()))
        })
        .cloned()
        .collect()
}

/// Scans serial ports for likely adapters
pub struct PortDiscovery {
    lister: Arc<dyn PortLister>,
    keywords: Vec<String>,
}

impl PortDiscovery {
    /// Discovery with the default keyword set
    pub fn new(lister: Arc<dyn PortLister>) -> Self {
        let keywords = ADAPTER_KEYWORDS.iter().map(|k| k.to_string()).collect();
        Self::with_keywords(lister, keywords)
    }

    /// Discovery with a custom keyword set
    pub fn with_keywords(lister: Arc<dyn PortLister>, keywords: Vec<String>) -> Self {
        let keywords = keywords.into_iter().map(|k| k.to_lowercase()).collect();
        Self { lister, keywords }
    }

    /// Likely adapters, or every endpoint when none match
    pub fn discover(&self) -> Result<Vec<Endpoint>, DiagError> {
        self.discover_report().map(|report| report.endpoints)
    }

    /// Like [`discover`](Self::discover), but also reports whether the
    /// unfiltered fallback was used
    pub fn discover_report(&self) -> Result<DiscoveryReport, DiagError> {
        let all: Vec<Endpoint> = self
            .lister
            .list_ports()
            .map_err(|e| DiagError::Enumeration(e.to_string()))?
            .into_iter()
            .map(Endpoint::from)
            .collect();

        let matched = filter_endpoints(&all, &self.keywords);
        debug!("{} of {} ports look like adapters", matched.len(), all.len());

        if matched.is_empty() && !all.is_empty() {
            info!("No adapter-like ports matched, showing all {}", all.len());
            return Ok(DiscoveryReport {
                endpoints: all,
                fell_back: true,
            });
        }

        Ok(DiscoveryReport {
            endpoints: matched,
            fell_back: false,
        })
    }
}
