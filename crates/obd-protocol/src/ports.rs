//! Serial port enumeration

use serde::{Deserialize, Serialize};
use serialport::{SerialPortInfo, SerialPortType};
use tracing::debug;

use crate::error::ObdError;

/// A serial port as reported by the operating system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    /// Device path or name (e.g. "/dev/ttyUSB0" or "COM3")
    pub device: String,
    /// Human-readable description
    pub description: String,
}

impl PortInfo {
    /// Create a port entry
    pub fn new(device: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            description: description.into(),
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let description = match info.port_type {
            SerialPortType::UsbPort(usb) => {
                let label = usb.product.or(usb.manufacturer);
                match label {
                    Some(label) if label.to_lowercase().contains("usb") => label,
                    Some(label) => format!("{} (USB)", label),
                    None => format!("USB Serial Device {:04x}:{:04x}", usb.vid, usb.pid),
                }
            }
            SerialPortType::BluetoothPort => "Bluetooth serial port".to_string(),
            SerialPortType::PciPort => "PCI serial port".to_string(),
            SerialPortType::Unknown => "n/a".to_string(),
        };

        Self {
            device: info.port_name,
            description,
        }
    }
}

/// Source of serial port listings
pub trait PortLister: Send + Sync {
    /// List every serial port, in the order the OS reports them
    fn list_ports(&self) -> Result<Vec<PortInfo>, ObdError>;
}

/// Lists the ports present on this machine
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPorts;

impl PortLister for SystemPorts {
    fn list_ports(&self) -> Result<Vec<PortInfo>, ObdError> {
        let ports = serialport::available_ports()
            .map_err(|e| ObdError::Enumeration(e.to_string()))?;
        debug!("OS reported {} serial ports", ports.len());
        Ok(ports.into_iter().map(PortInfo::from).collect())
    }
}
