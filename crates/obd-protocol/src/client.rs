//! OBD-II Client for ELM327 Adapters
//!
//! Blocking serial communication with ELM327-compatible adapters. Every call
//! may wait up to the configured timeout, so callers run it off any
//! interactive thread.

use serialport::{ClearBuffer, SerialPort};
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::dtc;
use crate::error::ObdError;
use crate::mode;
use crate::ports::{PortLister, SystemPorts};
use crate::protocol::ObdProtocol;
use crate::transport::{ClearResponse, DtcResponse, LinkParameters, ObdConnector, ObdTransport};

/// Read granularity while waiting for the prompt
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Prompt the ELM327 prints when it is ready for the next command
const PROMPT: u8 = b'>';

/// Answers meaning the adapter is alive but the vehicle did not respond
const NOT_CONNECTED_ANSWERS: [&str; 3] = ["UNABLE TO CONNECT", "NO DATA", "ERROR"];

/// OBD-II client for communicating with ELM327-compatible adapters
pub struct ObdClient {
    /// Serial port device path (e.g., "/dev/ttyUSB0" or "COM3"), empty if none
    device: String,
    /// Open serial port, if any
    port: Option<Box<dyn SerialPort>>,
    /// Protocol requested at initialization, then the one the adapter settled on
    protocol: ObdProtocol,
    /// Command timeout
    timeout: Duration,
    /// Whether the vehicle answered during initialization
    connected: bool,
}

impl ObdClient {
    /// Open `device` and initialize the adapter.
    ///
    /// Fails only if the port itself cannot be used. A silent adapter or a
    /// vehicle that does not answer gives back a client that reports
    /// not connected.
    pub fn open(
        device: &str,
        params: &LinkParameters,
        protocol: ObdProtocol,
    ) -> Result<Self, ObdError> {
        info!("Opening OBD adapter on {} at {} baud", device, params.baud_rate);

        let port = serialport::new(device, params.baud_rate)
            .timeout(POLL_INTERVAL)
            .open()?;
        Self::with_port(device, port, params.timeout, protocol)
    }

    /// Initialize an adapter behind an already opened port
    pub fn with_port(
        device: &str,
        port: Box<dyn SerialPort>,
        timeout: Duration,
        protocol: ObdProtocol,
    ) -> Result<Self, ObdError> {
        port.clear(ClearBuffer::All)?;

        let mut client = Self {
            device: device.to_string(),
            port: Some(port),
            protocol,
            timeout,
            connected: false,
        };
        client.connected = client.initialize()?;
        Ok(client)
    }

    /// A client that never reached an adapter
    pub fn disconnected() -> Self {
        Self {
            device: String::new(),
            port: None,
            protocol: ObdProtocol::Auto,
            timeout: Duration::ZERO,
            connected: false,
        }
    }

    /// Initialize the ELM327 adapter and check that the vehicle answers
    fn initialize(&mut self) -> Result<bool, ObdError> {
        let commands = ["ATZ", "ATE0", "ATL0", "ATS0", self.protocol.to_elm_command()];
        for cmd in commands {
            match self.send_command(cmd) {
                Ok(_) => {}
                Err(ObdError::Timeout(ms)) => {
                    debug!("Adapter on {} silent after {} ({}ms)", self.device, cmd, ms);
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }

        let answer = match self.send_command(&format!("{:02X}00", mode::CURRENT_DATA)) {
            Ok(answer) => answer,
            Err(ObdError::Timeout(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if !is_positive(&answer, &positive_prefix(mode::CURRENT_DATA)) {
            info!("Vehicle did not answer on {}: {}", self.device, answer.trim());
            return Ok(false);
        }

        if let Ok(answer) = self.send_command("ATDPN") {
            if let Some(protocol) = ObdProtocol::from_elm_number(&answer) {
                self.protocol = protocol;
            }
        }
        info!("OBD adapter on {} connected using {:?}", self.device, self.protocol);
        Ok(true)
    }

    /// Send one command and collect the answer up to the prompt
    fn send_command(&mut self, cmd: &str) -> Result<String, ObdError> {
        let timeout = self.timeout;
        let port = self.port.as_mut().ok_or(ObdError::AdapterNotResponding)?;

        debug!("-> {}", cmd);
        port.write_all(format!("{}\r", cmd).as_bytes())?;
        port.flush()?;

        let deadline = Instant::now() + timeout;
        let mut answer = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match port.read(&mut buf) {
                Ok(n) => {
                    answer.extend_from_slice(&buf[..n]);
                    if answer.contains(&PROMPT) {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                return Err(ObdError::Timeout(timeout.as_millis() as u64));
            }
        }

        // Drop the echoed command line, present until ATE0 takes effect
        let raw = String::from_utf8_lossy(&answer).replace(PROMPT as char, "");
        let text = raw
            .split(['\r', '\n'])
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .skip_while(|line| *line == cmd)
            .collect::<Vec<_>>()
            .join("\r");
        debug!("<- {}", text);
        Ok(text)
    }
}

impl ObdTransport for ObdClient {
    fn is_connected(&self) -> bool {
        self.connected && self.port.is_some()
    }

    fn port_name(&self) -> String {
        self.device.clone()
    }

    fn read_dtc(&mut self) -> Result<DtcResponse, ObdError> {
        if !self.is_connected() {
            return Err(ObdError::VehicleNotConnected);
        }
        let answer = self.send_command(&format!("{:02X}", mode::READ_DTC))?;
        if answer.to_uppercase().contains("NO DATA") {
            return Ok(DtcResponse::codes(Vec::new()));
        }
        match dtc::parse_mode03(&answer, self.protocol.is_can()) {
            Some(codes) => Ok(DtcResponse::codes(codes)),
            None => Err(ObdError::InvalidResponse(answer)),
        }
    }

    fn clear_dtc(&mut self) -> Result<ClearResponse, ObdError> {
        if !self.is_connected() {
            return Err(ObdError::VehicleNotConnected);
        }
        let answer = self.send_command(&format!("{:02X}", mode::CLEAR_DTC))?;
        Ok(ClearResponse::new(is_positive(&answer, &positive_prefix(mode::CLEAR_DTC))))
    }

    fn close(&mut self) -> Result<(), ObdError> {
        if let Some(port) = self.port.take() {
            info!("Closing OBD adapter on {}", self.device);
            drop(port);
        }
        self.connected = false;
        Ok(())
    }
}

/// Positive responses echo the mode with bit 6 set
fn positive_prefix(service: u8) -> String {
    format!("{:02X}", service | 0x40)
}

/// Whether an answer carries the expected positive response prefix
fn is_positive(answer: &str, prefix: &str) -> bool {
    let upper = answer.to_uppercase();
    if NOT_CONNECTED_ANSWERS.iter().any(|bad| upper.contains(bad)) {
        return false;
    }
    upper
        .split(['\r', '\n'])
        .filter(|line| !dtc::is_status_line(line))
        .map(|line| line.replace(' ', ""))
        .any(|line| line.starts_with(prefix) || line.contains(&format!(":{}", prefix)))
}

/// Opens [`ObdClient`]s on real serial ports
pub struct Elm327Connector {
    protocol: ObdProtocol,
    ports: Box<dyn PortLister>,
}

impl Elm327Connector {
    /// Connector that scans the system's serial ports when auto-connecting
    pub fn new(protocol: ObdProtocol) -> Self {
        Self::with_lister(protocol, Box::new(SystemPorts))
    }

    /// Connector with a custom port source for auto-connect
    pub fn with_lister(protocol: ObdProtocol, ports: Box<dyn PortLister>) -> Self {
        Self { protocol, ports }
    }
}

impl ObdConnector for Elm327Connector {
    fn auto_connect(&self, params: &LinkParameters) -> Result<Box<dyn ObdTransport>, ObdError> {
        for port in self.ports.list_ports()? {
            match ObdClient::open(&port.device, params, self.protocol) {
                Ok(client) => {
                    if let Some(found) = keep_if_connected(client) {
                        return Ok(found);
                    }
                }
                Err(e) => warn!("Skipping {} during auto-connect: {}", port.device, e),
            }
        }
        info!("Auto-connect found no adapter at {} baud", params.baud_rate);
        Ok(Box::new(ObdClient::disconnected()))
    }

    fn connect(
        &self,
        port: &str,
        params: &LinkParameters,
    ) -> Result<Box<dyn ObdTransport>, ObdError> {
        Ok(Box::new(ObdClient::open(port, params, self.protocol)?))
    }
}

/// Keep a connected client, close and drop one that is not
fn keep_if_connected(mut client: ObdClient) -> Option<Box<dyn ObdTransport>> {
    if client.is_connected() {
        return Some(Box::new(client));
    }
    if let Err(e) = client.close() {
        warn!("Ignoring error while closing {}: {}", client.device, e);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedPort;
    use crate::ports::PortInfo;

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn client(port: &ScriptedPort, protocol: ObdProtocol) -> ObdClient {
        ObdClient::with_port("scripted", port.boxed(), TIMEOUT, protocol).unwrap()
    }

    fn codes(client: &mut ObdClient) -> Vec<String> {
        let response = client.read_dtc().unwrap();
        response.value.unwrap().into_iter().map(|(code, _)| code).collect()
    }

    struct NoPorts;

    impl PortLister for NoPorts {
        fn list_ports(&self) -> Result<Vec<PortInfo>, ObdError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_disconnected_client() {
        let mut client = ObdClient::disconnected();
        assert!(!client.is_connected());
        assert!(matches!(client.read_dtc(), Err(ObdError::VehicleNotConnected)));
        assert!(matches!(client.clear_dtc(), Err(ObdError::VehicleNotConnected)));
        assert!(client.close().is_ok());
        assert!(client.close().is_ok());
    }

    #[test]
    fn test_positive_answers() {
        assert!(is_positive("41 00 BE 3F A8 13", "41"));
        assert!(is_positive("SEARCHING...\r4100BE3FA813", "41"));
        assert!(is_positive("44", "44"));
        assert!(is_positive("7E8 0:44", "44"));
        assert!(!is_positive("UNABLE TO CONNECT", "41"));
        assert!(!is_positive("NO DATA", "44"));
        assert!(!is_positive("?", "44"));
        assert!(is_positive("BUS INIT: ...OK\r41 00 BE 3F A8 13", "41"));
        assert!(!is_positive("BUS INIT: ...ERROR", "41"));
        assert!(!is_positive("BUS INIT: ...OK", "41"));
    }

    #[test]
    fn test_initialization_sequence() {
        let port = ScriptedPort::new();
        let client = client(&port, ObdProtocol::Auto);

        assert!(client.is_connected());
        assert_eq!(client.port_name(), "scripted");
        assert_eq!(
            port.commands(),
            vec!["ATZ", "ATE0", "ATL0", "ATS0", "ATSP0", "0100", "ATDPN"]
        );
    }

    #[test]
    fn test_silent_adapter_is_not_connected() {
        let port = ScriptedPort::new();
        port.silence();
        let mut client = client(&port, ObdProtocol::Auto);

        assert!(!client.is_connected());
        assert_eq!(port.commands(), vec!["ATZ"]);
        assert!(matches!(client.read_dtc(), Err(ObdError::VehicleNotConnected)));
    }

    #[test]
    fn test_unable_to_connect_is_not_connected() {
        let port = ScriptedPort::new();
        port.answer("0100", "SEARCHING...\rUNABLE TO CONNECT");
        let client = client(&port, ObdProtocol::Auto);

        assert!(!client.is_connected());
        assert!(!port.commands().contains(&"ATDPN".to_string()));
    }

    #[test]
    fn test_kline_bus_init_connects() {
        let port = ScriptedPort::new();
        port.answer("0100", "BUS INIT: ...OK\r41 00 BE 3F A8 13");
        port.answer("ATDPN", "3");
        port.answer("03", "BUS INIT: ...OK\r43 01 71 00 00 00 00");
        let mut client = client(&port, ObdProtocol::Iso9141_2);

        assert!(client.is_connected());
        assert!(port.commands().contains(&"ATSP3".to_string()));
        assert_eq!(codes(&mut client), vec!["P0171"]);
    }

    #[test]
    fn test_detected_protocol_selects_decoding() {
        // Same bytes, count byte on CAN only
        let port = ScriptedPort::new();
        port.answer("03", "43 01 01 71");
        let mut can = client(&port, ObdProtocol::Auto);
        assert_eq!(can.protocol, ObdProtocol::Iso15765_4Can11bit500);
        assert_eq!(codes(&mut can), vec!["P0171"]);

        let port = ScriptedPort::new();
        port.answer("ATDPN", "A3");
        port.answer("03", "43 01 01 71");
        let mut legacy = client(&port, ObdProtocol::Auto);
        assert_eq!(legacy.protocol, ObdProtocol::Iso9141_2);
        assert_eq!(codes(&mut legacy), vec!["P0101"]);
    }

    #[test]
    fn test_echo_is_stripped() {
        let port = ScriptedPort::new();
        port.keep_echo();
        port.answer("ATDPN", "3");
        port.answer("03", "43 01 03 00 00 00 00");
        let mut client = client(&port, ObdProtocol::Auto);

        assert!(client.is_connected());
        assert_eq!(codes(&mut client), vec!["P0103"]);
    }

    #[test]
    fn test_read_dtc_answers() {
        let port = ScriptedPort::new();
        let mut client = client(&port, ObdProtocol::Auto);
        assert_eq!(codes(&mut client), Vec::<String>::new());

        for answer in ["CAN ERROR", "?", "BUS INIT: ...ERROR", "STOPPED"] {
            port.answer("03", answer);
            assert!(
                matches!(client.read_dtc(), Err(ObdError::InvalidResponse(_))),
                "{} should be rejected",
                answer
            );
        }
    }

    #[test]
    fn test_clear_acknowledgement() {
        let port = ScriptedPort::new();
        let mut client = client(&port, ObdProtocol::Auto);

        port.answer("04", "44");
        assert!(client.clear_dtc().unwrap().is_successful());
        port.answer("04", "?");
        assert!(!client.clear_dtc().unwrap().is_successful());

        client.close().unwrap();
        assert!(!client.is_connected());
    }

    #[test]
    fn test_auto_connect_without_ports() {
        let connector = Elm327Connector::with_lister(ObdProtocol::Auto, Box::new(NoPorts));
        let transport = connector.auto_connect(&LinkParameters::default()).unwrap();
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_auto_connect_skips_silent_adapter() {
        let silent = ScriptedPort::new();
        silent.silence();
        assert!(keep_if_connected(client(&silent, ObdProtocol::Auto)).is_none());

        let live = ScriptedPort::new();
        let kept = keep_if_connected(client(&live, ObdProtocol::Auto)).unwrap();
        assert!(kept.is_connected());
    }

    #[test]
    fn test_connect_to_missing_port_fails() {
        let connector = Elm327Connector::new(ObdProtocol::Auto);
        let params = LinkParameters::new(38400, Duration::from_millis(100));
        assert!(connector.connect("/dev/does-not-exist-obd", &params).is_err());
    }
}
