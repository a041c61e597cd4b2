//! OBD-II Protocol Implementation
//!
//! This crate provides blocking serial communication with ELM327-compatible
//! OBD-II adapters behind a small transport contract ([`ObdConnector`] and
//! [`ObdTransport`]), serial port enumeration, and a scriptable mock adapter.

mod client;
pub mod dtc;
mod error;
pub mod mock;
mod ports;
mod protocol;
mod transport;

pub use client::{Elm327Connector, ObdClient};
pub use error::ObdError;
pub use ports::{PortInfo, PortLister, SystemPorts};
pub use protocol::ObdProtocol;
pub use transport::{
    ClearResponse, DtcResponse, LinkParameters, ObdConnector, ObdTransport, DEFAULT_BAUD_RATES,
    DEFAULT_TIMEOUT,
};

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
}
