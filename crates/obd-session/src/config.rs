//! Session configuration

use obd_protocol::{LinkParameters, ObdProtocol, DEFAULT_BAUD_RATES};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::discovery::ADAPTER_KEYWORDS;

/// Settings that cannot produce a connection attempt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Empty baud rate ladder
    #[error("no baud rates configured")]
    NoBaudRates,
    /// A zero entry in the ladder
    #[error("baud rate must be non-zero")]
    ZeroBaudRate,
    /// Zero timeout
    #[error("timeout must be non-zero")]
    ZeroTimeout,
}

/// Configuration for discovery and negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Baud rates to try, in priority order (default: 38400, 9600, 115200, 57600)
    pub baud_rates: Vec<u32>,
    /// Per-attempt timeout in seconds (default: 30)
    pub timeout_secs: u64,
    /// OBD protocol requested from the adapter
    pub protocol: ObdProtocol,
    /// Description keywords that mark a port as a likely adapter
    pub adapter_keywords: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            baud_rates: DEFAULT_BAUD_RATES.to_vec(),
            timeout_secs: 30,
            protocol: ObdProtocol::Auto,
            adapter_keywords: ADAPTER_KEYWORDS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl SessionConfig {
    /// Reject settings that cannot produce a connection attempt
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.baud_rates.is_empty() {
            return Err(ConfigError::NoBaudRates);
        }
        if self.baud_rates.contains(&0) {
            return Err(ConfigError::ZeroBaudRate);
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    /// Per-attempt timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The ordered fallback ladder handed to the negotiator
    pub fn link_parameters(&self) -> Vec<LinkParameters> {
        LinkParameters::ladder(&self.baud_rates, self.timeout())
    }
}
