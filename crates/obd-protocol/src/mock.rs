//! Mock OBD-II adapter for testing and demo mode (no hardware required)
//!
//! The connector's behavior is scripted per baud rate, and every connect and
//! close call is recorded so tests can check how a caller drove it.
//! [`ScriptedPort`] sits one level lower and stands in for the serial port
//! under a real [`crate::ObdClient`].

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::ObdError;
use crate::ports::{PortInfo, PortLister};
use crate::transport::{ClearResponse, DtcResponse, LinkParameters, ObdConnector, ObdTransport};

/// Port name reported by auto-connected mock handles
pub const MOCK_PORT: &str = "mock";

/// How a connect attempt at a given baud rate turns out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    /// A live session forms
    Connected,
    /// The adapter answers but no session forms
    NotConnected,
    /// The attempt raises
    Fail(String),
}

/// A call observed by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// `connect`/`auto_connect`; `port` is `None` for auto-connect
    Connect { port: Option<String>, baud_rate: u32 },
    /// `close` on a handle
    Close { port: String },
    /// `read_dtc`
    ReadDtc,
    /// `clear_dtc`
    ClearDtc,
}

#[derive(Debug)]
struct MockState {
    outcomes: HashMap<u32, MockOutcome>,
    default_outcome: MockOutcome,
    dtc: Result<DtcResponse, String>,
    clear: Result<bool, String>,
    close_error: Option<String>,
    calls: Vec<MockCall>,
    open_handles: usize,
}

/// Scriptable connector. Clones share the same script and call log.
#[derive(Debug, Clone)]
pub struct MockAdapter {
    state: Arc<Mutex<MockState>>,
}

impl MockAdapter {
    /// Create a mock where every baud rate connects and no codes are stored
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                outcomes: HashMap::new(),
                default_outcome: MockOutcome::Connected,
                dtc: Ok(DtcResponse::codes(Vec::new())),
                clear: Ok(true),
                close_error: None,
                calls: Vec::new(),
                open_handles: 0,
            })),
        }
    }

    /// Demo vehicle with a couple of stored codes
    pub fn demo() -> Self {
        info!("Creating mock OBD adapter for demo mode");
        let mock = Self::new();
        mock.set_dtc(DtcResponse::codes(vec![
            ("P0171".to_string(), "System Too Lean (Bank 1)".to_string()),
            ("P0401".to_string(), "Exhaust Gas Recirculation Flow Insufficient Detected".to_string()),
        ]));
        mock
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // Poisoning is ignored so the call log survives a panicking worker
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Script the outcome for one baud rate
    pub fn set_outcome(&self, baud_rate: u32, outcome: MockOutcome) {
        self.lock().outcomes.insert(baud_rate, outcome);
    }

    /// Script the outcome for baud rates without their own entry
    pub fn set_default_outcome(&self, outcome: MockOutcome) {
        self.lock().default_outcome = outcome;
    }

    /// Script the answer to `read_dtc`
    pub fn set_dtc(&self, response: DtcResponse) {
        self.lock().dtc = Ok(response);
    }

    /// Make `read_dtc` raise
    pub fn fail_dtc(&self, detail: &str) {
        self.lock().dtc = Err(detail.to_string());
    }

    /// Script the acknowledgement of `clear_dtc`
    pub fn set_clear(&self, successful: bool) {
        self.lock().clear = Ok(successful);
    }

    /// Make `clear_dtc` raise
    pub fn fail_clear(&self, detail: &str) {
        self.lock().clear = Err(detail.to_string());
    }

    /// Make `close` raise (after releasing the handle)
    pub fn fail_close(&self, detail: &str) {
        self.lock().close_error = Some(detail.to_string());
    }

    /// Every call observed so far
    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Baud rates of connect attempts, in order
    pub fn connect_attempts(&self) -> Vec<u32> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                MockCall::Connect { baud_rate, .. } => Some(*baud_rate),
                _ => None,
            })
            .collect()
    }

    /// Number of close calls
    pub fn close_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| matches!(call, MockCall::Close { .. }))
            .count()
    }

    /// Handles opened and not yet closed
    pub fn open_handles(&self) -> usize {
        self.lock().open_handles
    }

    fn open(&self, port: Option<&str>, params: &LinkParameters) -> Result<Box<dyn ObdTransport>, ObdError> {
        let mut state = self.lock();
        state.calls.push(MockCall::Connect {
            port: port.map(str::to_string),
            baud_rate: params.baud_rate,
        });

        let outcome = state
            .outcomes
            .get(&params.baud_rate)
            .unwrap_or(&state.default_outcome)
            .clone();
        debug!("Mock connect at {} baud: {:?}", params.baud_rate, outcome);

        let connected = match outcome {
            MockOutcome::Connected => true,
            MockOutcome::NotConnected => false,
            MockOutcome::Fail(detail) => return Err(ObdError::SerialError(detail)),
        };
        state.open_handles += 1;
        drop(state);

        Ok(Box::new(MockTransport {
            adapter: self.clone(),
            port: port.unwrap_or(MOCK_PORT).to_string(),
            connected,
            open: true,
        }))
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ObdConnector for MockAdapter {
    fn auto_connect(&self, params: &LinkParameters) -> Result<Box<dyn ObdTransport>, ObdError> {
        self.open(None, params)
    }

    fn connect(
        &self,
        port: &str,
        params: &LinkParameters,
    ) -> Result<Box<dyn ObdTransport>, ObdError> {
        self.open(Some(port), params)
    }
}

/// Handle produced by [`MockAdapter`]
#[derive(Debug)]
pub struct MockTransport {
    adapter: MockAdapter,
    port: String,
    connected: bool,
    open: bool,
}

impl ObdTransport for MockTransport {
    fn is_connected(&self) -> bool {
        self.open && self.connected
    }

    fn port_name(&self) -> String {
        self.port.clone()
    }

    fn read_dtc(&mut self) -> Result<DtcResponse, ObdError> {
        let mut state = self.adapter.lock();
        state.calls.push(MockCall::ReadDtc);
        state.dtc.clone().map_err(ObdError::InvalidResponse)
    }

    fn clear_dtc(&mut self) -> Result<ClearResponse, ObdError> {
        let mut state = self.adapter.lock();
        state.calls.push(MockCall::ClearDtc);
        state
            .clear
            .clone()
            .map(ClearResponse::new)
            .map_err(ObdError::InvalidResponse)
    }

    fn close(&mut self) -> Result<(), ObdError> {
        let mut state = self.adapter.lock();
        state.calls.push(MockCall::Close {
            port: self.port.clone(),
        });
        if self.open {
            self.open = false;
            state.open_handles = state.open_handles.saturating_sub(1);
        }
        match &state.close_error {
            Some(detail) => Err(ObdError::SerialError(detail.clone())),
            None => Ok(()),
        }
    }
}

/// Fixed port listing, or a scripted enumeration failure
#[derive(Debug, Clone)]
pub struct MockPorts {
    ports: Result<Vec<PortInfo>, String>,
}

impl MockPorts {
    /// Listing that returns `ports` in order
    pub fn new(ports: Vec<PortInfo>) -> Self {
        Self { ports: Ok(ports) }
    }

    /// Listing that always fails
    pub fn failing(detail: &str) -> Self {
        Self {
            ports: Err(detail.to_string()),
        }
    }

    /// Ports a demo session pretends to see
    pub fn demo() -> Self {
        Self::new(vec![
            PortInfo::new("/dev/ttyUSB0", "FT232R USB UART"),
            PortInfo::new("/dev/ttyS0", "n/a"),
        ])
    }
}

impl PortLister for MockPorts {
    fn list_ports(&self) -> Result<Vec<PortInfo>, ObdError> {
        self.ports.clone().map_err(ObdError::Enumeration)
    }
}

#[derive(Debug)]
struct PortState {
    answers: HashMap<String, String>,
    silent: bool,
    echo: bool,
    keep_echo: bool,
    input: Vec<u8>,
    output: Vec<u8>,
    commands: Vec<String>,
}

/// An in-memory serial port that answers like an ELM327.
///
/// Commands are answered from a script; unscripted `AT` commands answer
/// `OK` and anything else `NO DATA`. Echo is on until `ATE0`. Clones share
/// the same script and command log.
#[derive(Debug, Clone)]
pub struct ScriptedPort {
    state: Arc<Mutex<PortState>>,
}

impl ScriptedPort {
    /// Adapter on a CAN vehicle that answers `0100`
    pub fn new() -> Self {
        let answers = [
            ("ATZ", "ELM327 v1.5"),
            ("0100", "41 00 BE 3F A8 13"),
            ("ATDPN", "A6"),
        ]
        .into_iter()
        .map(|(cmd, reply)| (cmd.to_string(), reply.to_string()))
        .collect();

        Self {
            state: Arc::new(Mutex::new(PortState {
                answers,
                silent: false,
                echo: true,
                keep_echo: false,
                input: Vec::new(),
                output: Vec::new(),
                commands: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PortState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Script the answer to `cmd`
    pub fn answer(&self, cmd: &str, reply: &str) {
        self.lock().answers.insert(cmd.to_string(), reply.to_string());
    }

    /// Never answer anything
    pub fn silence(&self) {
        self.lock().silent = true;
    }

    /// Keep echoing commands after `ATE0`, as some clones do
    pub fn keep_echo(&self) {
        self.lock().keep_echo = true;
    }

    /// Commands received so far
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Boxed clone, ready for [`crate::ObdClient::with_port`]
    pub fn boxed(&self) -> Box<dyn SerialPort> {
        Box::new(self.clone())
    }
}

impl Default for ScriptedPort {
    fn default() -> Self {
        Self::new()
    }
}

impl PortState {
    fn receive(&mut self, cmd: String) {
        self.commands.push(cmd.clone());
        if self.silent {
            return;
        }
        let reply = match self.answers.get(&cmd) {
            Some(reply) => reply.clone(),
            None if cmd.starts_with("AT") => "OK".to_string(),
            None => "NO DATA".to_string(),
        };
        if self.echo {
            self.output.extend_from_slice(format!("{}\r", cmd).as_bytes());
        }
        self.output
            .extend_from_slice(format!("{}\r\r>", reply).as_bytes());
        if cmd == "ATE0" && !self.keep_echo {
            self.echo = false;
        }
    }
}

impl Write for ScriptedPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        for &byte in buf {
            if byte == b'\r' {
                let cmd = String::from_utf8_lossy(&state.input).trim().to_string();
                state.input.clear();
                state.receive(cmd);
            } else {
                state.input.push(byte);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for ScriptedPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if state.output.is_empty() {
            drop(state);
            std::thread::sleep(Duration::from_millis(1));
            return Err(io::ErrorKind::TimedOut.into());
        }
        let n = buf.len().min(state.output.len());
        buf[..n].copy_from_slice(&state.output[..n]);
        state.output.drain(..n);
        Ok(n)
    }
}

impl SerialPort for ScriptedPort {
    fn name(&self) -> Option<String> {
        Some("scripted".to_string())
    }

    fn baud_rate(&self) -> serialport::Result<u32> {
        Ok(38400)
    }

    fn data_bits(&self) -> serialport::Result<DataBits> {
        Ok(DataBits::Eight)
    }

    fn flow_control(&self) -> serialport::Result<FlowControl> {
        Ok(FlowControl::None)
    }

    fn parity(&self) -> serialport::Result<Parity> {
        Ok(Parity::None)
    }

    fn stop_bits(&self) -> serialport::Result<StopBits> {
        Ok(StopBits::One)
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(1)
    }

    fn set_baud_rate(&mut self, _baud_rate: u32) -> serialport::Result<()> {
        Ok(())
    }

    fn set_data_bits(&mut self, _data_bits: DataBits) -> serialport::Result<()> {
        Ok(())
    }

    fn set_flow_control(&mut self, _flow_control: FlowControl) -> serialport::Result<()> {
        Ok(())
    }

    fn set_parity(&mut self, _parity: Parity) -> serialport::Result<()> {
        Ok(())
    }

    fn set_stop_bits(&mut self, _stop_bits: StopBits) -> serialport::Result<()> {
        Ok(())
    }

    fn set_timeout(&mut self, _timeout: Duration) -> serialport::Result<()> {
        Ok(())
    }

    fn write_request_to_send(&mut self, _level: bool) -> serialport::Result<()> {
        Ok(())
    }

    fn write_data_terminal_ready(&mut self, _level: bool) -> serialport::Result<()> {
        Ok(())
    }

    fn read_clear_to_send(&mut self) -> serialport::Result<bool> {
        Ok(true)
    }

    fn read_data_set_ready(&mut self) -> serialport::Result<bool> {
        Ok(true)
    }

    fn read_ring_indicator(&mut self) -> serialport::Result<bool> {
        Ok(false)
    }

    fn read_carrier_detect(&mut self) -> serialport::Result<bool> {
        Ok(true)
    }

    fn bytes_to_read(&self) -> serialport::Result<u32> {
        Ok(self.lock().output.len() as u32)
    }

    fn bytes_to_write(&self) -> serialport::Result<u32> {
        Ok(0)
    }

    fn clear(&self, _buffer_to_clear: ClearBuffer) -> serialport::Result<()> {
        let mut state = self.lock();
        state.input.clear();
        state.output.clear();
        Ok(())
    }

    fn try_clone(&self) -> serialport::Result<Box<dyn SerialPort>> {
        Ok(self.boxed())
    }

    fn set_break(&self) -> serialport::Result<()> {
        Ok(())
    }

    fn clear_break(&self) -> serialport::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_outcomes() {
        let mock = MockAdapter::new();
        mock.set_default_outcome(MockOutcome::NotConnected);
        mock.set_outcome(115200, MockOutcome::Connected);
        mock.set_outcome(9600, MockOutcome::Fail("busy".to_string()));

        let slow = mock.connect("/dev/ttyUSB0", &LinkParameters::default()).unwrap();
        assert!(!slow.is_connected());

        let fast = mock
            .connect("/dev/ttyUSB0", &LinkParameters::new(115200, Default::default()))
            .unwrap();
        assert!(fast.is_connected());
        assert_eq!(fast.port_name(), "/dev/ttyUSB0");

        assert!(mock
            .connect("/dev/ttyUSB0", &LinkParameters::new(9600, Default::default()))
            .is_err());
        assert_eq!(mock.connect_attempts(), vec![38400, 115200, 9600]);
        assert_eq!(mock.open_handles(), 2);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mock = MockAdapter::new();
        let mut transport = mock.auto_connect(&LinkParameters::default()).unwrap();
        assert_eq!(transport.port_name(), MOCK_PORT);

        transport.close().unwrap();
        transport.close().unwrap();
        assert!(!transport.is_connected());
        assert_eq!(mock.close_count(), 2);
        assert_eq!(mock.open_handles(), 0);
    }

    #[test]
    fn test_scripted_queries() {
        let mock = MockAdapter::demo();
        let mut transport = mock.auto_connect(&LinkParameters::default()).unwrap();
        let codes = transport.read_dtc().unwrap().value.unwrap();
        assert_eq!(codes[0].0, "P0171");

        mock.set_clear(false);
        assert!(!transport.clear_dtc().unwrap().is_successful());

        mock.fail_dtc("bus error");
        assert!(transport.read_dtc().is_err());
    }

    #[test]
    fn test_scripted_port_echo() {
        let mut port = ScriptedPort::new();
        port.write_all(b"ATE0\r").unwrap();
        let mut buf = [0u8; 64];
        let n = port.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ATE0\rOK\r\r>");

        port.write_all(b"03\r").unwrap();
        let n = port.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"NO DATA\r\r>");
        assert_eq!(port.commands(), vec!["ATE0", "03"]);
    }

    #[test]
    fn test_mock_ports() {
        assert_eq!(MockPorts::demo().list_ports().unwrap().len(), 2);
        assert!(matches!(
            MockPorts::failing("denied").list_ports(),
            Err(ObdError::Enumeration(_))
        ));
    }
}
