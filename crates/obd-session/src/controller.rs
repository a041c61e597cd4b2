//! Diagnostics Controller
//!
//! Control-thread owner of the session. Front ends send [`Command`]s and
//! feed every [`TaskReport`] from the executor back through
//! [`DiagnosticsController::apply`]; the controller answers with
//! [`UiEvent`]s to render. The session is lent by value to at most one
//! worker at a time and comes back with the report.

use obd_protocol::LinkParameters;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::discovery::Endpoint;
use crate::error::DiagError;
use crate::executor::{CommandExecutor, CommandTask, Completions, TaskHandle, TaskId, TaskKind, TaskReport};
use crate::negotiator::Negotiator;
use crate::session::{ClearOutcome, DiagnosticResult, Session};

/// User-initiated actions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open a session on the endpoint, or auto-select when `None`
    Connect(Option<Endpoint>),
    /// Close and reopen using the last selected endpoint
    Reconnect,
    /// Read stored trouble codes
    ReadCodes,
    /// Clear stored trouble codes
    ClearCodes,
    /// Close the session
    Disconnect,
}

/// Successful result of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum OperationOutcome {
    /// A session is live
    Connected { port_name: Option<String> },
    /// Codes read from the vehicle
    Codes(DiagnosticResult),
    /// Clear acknowledgement
    Cleared(ClearOutcome),
}

/// Notifications for the front end
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    /// Connection state changed
    ConnectionChanged {
        connected: bool,
        port_name: Option<String>,
    },
    /// A task finished
    OperationResult {
        kind: TaskKind,
        outcome: Result<OperationOutcome, DiagError>,
    },
}

/// Report type produced by the controller's executor
pub type SessionReport = TaskReport<OperationOutcome, Session>;

/// What a request started
#[derive(Debug, Default)]
pub struct Dispatch {
    /// The submitted task, if the command needed one
    pub task: Option<TaskHandle>,
    /// Events to render right away
    pub events: Vec<UiEvent>,
}

/// Owns the session slot and serializes access to it
pub struct DiagnosticsController {
    negotiator: Negotiator,
    executor: CommandExecutor<OperationOutcome, Session>,
    params: Vec<LinkParameters>,
    session: Option<Session>,
    link: Option<String>,
    last_endpoint: Option<Endpoint>,
    in_flight: Option<(TaskId, TaskKind)>,
}

impl DiagnosticsController {
    /// Create a controller and the channel its reports arrive on
    pub fn new(
        negotiator: Negotiator,
        params: Vec<LinkParameters>,
    ) -> (Self, Completions<OperationOutcome, Session>) {
        info!("Creating diagnostics controller with {} link parameter sets", params.len());
        let (executor, completions) = CommandExecutor::channel();
        let controller = Self {
            negotiator,
            executor,
            params,
            session: None,
            link: None,
            last_endpoint: None,
            in_flight: None,
        };
        (controller, completions)
    }

    /// Whether a session is believed live
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Port of the live session
    pub fn port_name(&self) -> Option<&str> {
        self.link.as_deref()
    }

    /// Tag of the running task, if any
    pub fn busy_with(&self) -> Option<TaskKind> {
        self.in_flight.map(|(_, kind)| kind)
    }

    /// Start `command`. Fails with [`DiagError::Busy`] while a task runs and
    /// with [`DiagError::NotConnected`] for queries without a session.
    pub fn request(&mut self, command: Command) -> Result<Dispatch, DiagError> {
        if let Some((id, kind)) = self.in_flight {
            debug!("Refusing {:?}, {} task {} still running", command, kind, id);
            return Err(DiagError::Busy);
        }

        match command {
            Command::Connect(endpoint) => {
                self.last_endpoint = endpoint.clone();
                Ok(self.start_connect(TaskKind::Connect, endpoint))
            }
            Command::Reconnect => {
                let endpoint = self.last_endpoint.clone();
                Ok(self.start_connect(TaskKind::Reconnect, endpoint))
            }
            Command::ReadCodes => {
                let session = self.session.take().ok_or(DiagError::NotConnected)?;
                let task = CommandTask::with_lease(TaskKind::Read, Some(session), |lease| {
                    let session = lease.as_mut().ok_or(DiagError::NotConnected)?;
                    session.read_trouble_codes().map(OperationOutcome::Codes)
                });
                Ok(self.dispatch(task, Vec::new()))
            }
            Command::ClearCodes => {
                let session = self.session.take().ok_or(DiagError::NotConnected)?;
                let task = CommandTask::with_lease(TaskKind::Clear, Some(session), |lease| {
                    let session = lease.as_mut().ok_or(DiagError::NotConnected)?;
                    session.clear_trouble_codes().map(OperationOutcome::Cleared)
                });
                Ok(self.dispatch(task, Vec::new()))
            }
            Command::Disconnect => Ok(Dispatch {
                task: None,
                events: self.close_session(),
            }),
        }
    }

    fn start_connect(&mut self, kind: TaskKind, endpoint: Option<Endpoint>) -> Dispatch {
        let previous = self.session.take();
        let mut events = Vec::new();
        if self.link.take().is_some() {
            events.push(UiEvent::ConnectionChanged {
                connected: false,
                port_name: None,
            });
        }

        let negotiator = self.negotiator.clone();
        let params = self.params.clone();
        let task = CommandTask::with_lease(kind, previous, move |lease: &mut Option<Session>| {
            if let Some(mut old) = lease.take() {
                old.close();
            }
            let session = negotiator.connect(endpoint.as_ref(), &params)?;
            let port_name = session.port_name();
            *lease = Some(session);
            Ok(OperationOutcome::Connected { port_name })
        });
        self.dispatch(task, events)
    }

    fn dispatch(
        &mut self,
        task: CommandTask<OperationOutcome, Session>,
        events: Vec<UiEvent>,
    ) -> Dispatch {
        let handle = self.executor.submit(task);
        self.in_flight = Some((handle.id(), handle.kind()));
        Dispatch {
            task: Some(handle),
            events,
        }
    }

    /// Apply a finished task on the control thread
    pub fn apply(&mut self, report: SessionReport) -> Vec<UiEvent> {
        let TaskReport {
            id,
            kind,
            outcome,
            lease,
        } = report;

        if self.in_flight.map(|(current, _)| current) != Some(id) {
            // Late result from an abandoned task; its session closes on drop
            warn!("Ignoring stale result of {} task {}", kind, id);
            return Vec::new();
        }
        self.in_flight = None;
        self.session = lease;

        let mut events = Vec::new();
        match kind {
            TaskKind::Connect | TaskKind::Reconnect => {
                self.link = self.session.as_ref().and_then(Session::port_name);
                events.push(UiEvent::ConnectionChanged {
                    connected: self.link.is_some(),
                    port_name: self.link.clone(),
                });
            }
            TaskKind::Read | TaskKind::Clear => {
                if self.session.is_none() && self.link.take().is_some() {
                    warn!("Session lost during {} task {}", kind, id);
                    events.push(UiEvent::ConnectionChanged {
                        connected: false,
                        port_name: None,
                    });
                }
            }
        }

        if let Err(e) = &outcome {
            info!("{} task {} failed: {}", kind, id, e);
        }
        events.push(UiEvent::OperationResult { kind, outcome });
        events
    }

    fn close_session(&mut self) -> Vec<UiEvent> {
        let Some(mut session) = self.session.take() else {
            return Vec::new();
        };
        info!("Disconnecting");
        session.close();
        self.link = None;
        vec![UiEvent::ConnectionChanged {
            connected: false,
            port_name: None,
        }]
    }

    /// Wait for the running task to hand its session back, then shut down.
    /// Returns the events of that last task.
    pub async fn finish(
        &mut self,
        completions: &mut Completions<OperationOutcome, Session>,
    ) -> Vec<UiEvent> {
        let mut events = Vec::new();
        while let Some((id, kind)) = self.in_flight {
            debug!("Waiting for {} task {} before shutting down", kind, id);
            match completions.next().await {
                Some(report) => events.extend(self.apply(report)),
                None => break,
            }
        }
        self.shutdown();
        events
    }

    /// Close the session held by the controller. A session lent to a
    /// running worker is closed when its report is dropped; use
    /// [`DiagnosticsController::finish`] to wait for it instead.
    pub fn shutdown(&mut self) {
        self.close_session();
        self.in_flight = None;
    }
}

impl Drop for DiagnosticsController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::mock::{MockAdapter, MockCall, MockOutcome, MOCK_PORT};
    use obd_protocol::{
        ClearResponse, DtcResponse, ObdConnector, ObdError, ObdTransport, DEFAULT_BAUD_RATES,
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn controller(
        connector: Arc<dyn ObdConnector>,
    ) -> (DiagnosticsController, Completions<OperationOutcome, Session>) {
        let params = LinkParameters::ladder(&DEFAULT_BAUD_RATES, Duration::from_secs(1));
        DiagnosticsController::new(Negotiator::new(connector), params)
    }

    async fn run(
        controller: &mut DiagnosticsController,
        completions: &mut Completions<OperationOutcome, Session>,
        command: Command,
    ) -> Vec<UiEvent> {
        let mut events = controller.request(command).unwrap().events;
        let report = completions.next().await.unwrap();
        events.extend(controller.apply(report));
        events
    }

    #[tokio::test]
    async fn test_connect_and_read() {
        let mock = MockAdapter::demo();
        let (mut controller, mut completions) = controller(Arc::new(mock.clone()));

        let events = run(&mut controller, &mut completions, Command::Connect(None)).await;
        assert_eq!(
            events[0],
            UiEvent::ConnectionChanged {
                connected: true,
                port_name: Some(MOCK_PORT.to_string()),
            }
        );
        assert!(controller.is_connected());

        let events = run(&mut controller, &mut completions, Command::ReadCodes).await;
        match &events[..] {
            [UiEvent::OperationResult {
                kind: TaskKind::Read,
                outcome: Ok(OperationOutcome::Codes(result)),
            }] => {
                assert_eq!(result.codes[0].code, "P0171");
                assert_eq!(result.len(), 2);
            }
            other => panic!("unexpected events: {:?}", other),
        }
        assert!(controller.is_connected());
    }

    #[tokio::test]
    async fn test_queries_need_a_session() {
        let (mut controller, _completions) = controller(Arc::new(MockAdapter::new()));
        assert_eq!(
            controller.request(Command::ReadCodes).unwrap_err(),
            DiagError::NotConnected
        );
        assert_eq!(
            controller.request(Command::ClearCodes).unwrap_err(),
            DiagError::NotConnected
        );
        assert!(controller.busy_with().is_none());
    }

    #[tokio::test]
    async fn test_busy_while_task_runs() {
        let (mut controller, mut completions) = controller(Arc::new(MockAdapter::new()));
        controller.request(Command::Connect(None)).unwrap();
        assert_eq!(controller.busy_with(), Some(TaskKind::Connect));
        assert_eq!(
            controller.request(Command::Disconnect).unwrap_err(),
            DiagError::Busy
        );

        let report = completions.next().await.unwrap();
        controller.apply(report);
        assert!(controller.busy_with().is_none());
    }

    #[tokio::test]
    async fn test_failed_connect_reports_no_device() {
        let mock = MockAdapter::new();
        mock.set_default_outcome(MockOutcome::NotConnected);
        let (mut controller, mut completions) = controller(Arc::new(mock.clone()));

        let events = run(&mut controller, &mut completions, Command::Connect(None)).await;
        assert_eq!(
            events,
            vec![
                UiEvent::ConnectionChanged {
                    connected: false,
                    port_name: None,
                },
                UiEvent::OperationResult {
                    kind: TaskKind::Connect,
                    outcome: Err(DiagError::NoDeviceFound),
                },
            ]
        );
        assert!(!controller.is_connected());
        assert_eq!(mock.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_failed_clear_keeps_session_and_disconnect_closes() {
        let mock = MockAdapter::new();
        mock.fail_clear("bus error");
        let (mut controller, mut completions) = controller(Arc::new(mock.clone()));
        run(&mut controller, &mut completions, Command::Connect(None)).await;

        let events = run(&mut controller, &mut completions, Command::ClearCodes).await;
        assert!(matches!(
            &events[..],
            [UiEvent::OperationResult {
                kind: TaskKind::Clear,
                outcome: Err(DiagError::Query(_)),
            }]
        ));
        assert!(controller.is_connected());

        let dispatch = controller.request(Command::Disconnect).unwrap();
        assert!(dispatch.task.is_none());
        assert_eq!(
            dispatch.events,
            vec![UiEvent::ConnectionChanged {
                connected: false,
                port_name: None,
            }]
        );
        assert_eq!(mock.close_count(), 1);
        assert_eq!(mock.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_closes_old_session_first() {
        let mock = MockAdapter::new();
        let (mut controller, mut completions) = controller(Arc::new(mock.clone()));
        let endpoint = Endpoint::new("/dev/ttyUSB0", "FTDI");
        run(&mut controller, &mut completions, Command::Connect(Some(endpoint))).await;

        let dispatch = controller.request(Command::Reconnect).unwrap();
        assert_eq!(
            dispatch.events,
            vec![UiEvent::ConnectionChanged {
                connected: false,
                port_name: None,
            }]
        );
        let report = completions.next().await.unwrap();
        controller.apply(report);

        let port = Some("/dev/ttyUSB0".to_string());
        assert_eq!(
            mock.calls(),
            vec![
                MockCall::Connect {
                    port: port.clone(),
                    baud_rate: 38400,
                },
                MockCall::Close {
                    port: "/dev/ttyUSB0".to_string(),
                },
                MockCall::Connect {
                    port,
                    baud_rate: 38400,
                },
            ]
        );
        assert_eq!(controller.port_name(), Some("/dev/ttyUSB0"));
        assert_eq!(mock.open_handles(), 1);
    }

    #[tokio::test]
    async fn test_drop_closes_session() {
        let mock = MockAdapter::new();
        {
            let (mut controller, mut completions) = controller(Arc::new(mock.clone()));
            run(&mut controller, &mut completions, Command::Connect(None)).await;
            assert_eq!(mock.open_handles(), 1);
        }
        assert_eq!(mock.open_handles(), 0);
        assert_eq!(mock.close_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_report_is_ignored() {
        let (mut controller, _completions) = controller(Arc::new(MockAdapter::new()));
        let events = controller.apply(TaskReport {
            id: TaskId(999),
            kind: TaskKind::Read,
            outcome: Err(DiagError::NotConnected),
            lease: None,
        });
        assert!(events.is_empty());
    }

    /// Transport whose reads take a while
    struct SlowTransport {
        closed: Arc<AtomicBool>,
    }

    impl ObdTransport for SlowTransport {
        fn is_connected(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        fn port_name(&self) -> String {
            "ttySLOW".to_string()
        }

        fn read_dtc(&mut self) -> Result<DtcResponse, ObdError> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(DtcResponse::codes(Vec::new()))
        }

        fn clear_dtc(&mut self) -> Result<ClearResponse, ObdError> {
            Ok(ClearResponse::new(true))
        }

        fn close(&mut self) -> Result<(), ObdError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct SlowConnector {
        closed: Arc<AtomicBool>,
    }

    impl ObdConnector for SlowConnector {
        fn auto_connect(&self, _: &LinkParameters) -> Result<Box<dyn ObdTransport>, ObdError> {
            Ok(Box::new(SlowTransport {
                closed: self.closed.clone(),
            }))
        }

        fn connect(&self, _: &str, _: &LinkParameters) -> Result<Box<dyn ObdTransport>, ObdError> {
            self.auto_connect(&LinkParameters::default())
        }
    }

    #[tokio::test]
    async fn test_finish_waits_for_lent_session() {
        let closed = Arc::new(AtomicBool::new(false));
        let connector = SlowConnector {
            closed: closed.clone(),
        };
        let (mut controller, mut completions) = controller(Arc::new(connector));
        run(&mut controller, &mut completions, Command::Connect(None)).await;

        controller.request(Command::ReadCodes).unwrap();
        assert_eq!(controller.busy_with(), Some(TaskKind::Read));

        let events = controller.finish(&mut completions).await;
        assert!(matches!(
            events.last(),
            Some(UiEvent::OperationResult {
                kind: TaskKind::Read,
                outcome: Ok(OperationOutcome::Codes(_)),
            })
        ));
        assert!(closed.load(Ordering::SeqCst));
        assert!(!controller.is_connected());
        assert!(controller.busy_with().is_none());
    }

    #[tokio::test]
    async fn test_finish_when_idle_closes_session() {
        let mock = MockAdapter::new();
        let (mut controller, mut completions) = controller(Arc::new(mock.clone()));
        run(&mut controller, &mut completions, Command::Connect(None)).await;

        assert!(controller.finish(&mut completions).await.is_empty());
        assert_eq!(mock.open_handles(), 0);
    }

    struct PanickingConnector;

    struct PanickingTransport;

    impl ObdTransport for PanickingTransport {
        fn is_connected(&self) -> bool {
            true
        }

        fn port_name(&self) -> String {
            "ttyPANIC".to_string()
        }

        fn read_dtc(&mut self) -> Result<DtcResponse, ObdError> {
            panic!("driver fault")
        }

        fn clear_dtc(&mut self) -> Result<ClearResponse, ObdError> {
            Ok(ClearResponse::new(true))
        }

        fn close(&mut self) -> Result<(), ObdError> {
            Ok(())
        }
    }

    impl ObdConnector for PanickingConnector {
        fn auto_connect(&self, _: &LinkParameters) -> Result<Box<dyn ObdTransport>, ObdError> {
            Ok(Box::new(PanickingTransport))
        }

        fn connect(&self, _: &str, _: &LinkParameters) -> Result<Box<dyn ObdTransport>, ObdError> {
            Ok(Box::new(PanickingTransport))
        }
    }

    #[tokio::test]
    async fn test_panicking_read_reports_disconnected() {
        let (mut controller, mut completions) = controller(Arc::new(PanickingConnector));
        run(&mut controller, &mut completions, Command::Connect(None)).await;
        assert!(controller.is_connected());

        let events = run(&mut controller, &mut completions, Command::ReadCodes).await;
        assert_eq!(
            events[0],
            UiEvent::ConnectionChanged {
                connected: false,
                port_name: None,
            }
        );
        match &events[1] {
            UiEvent::OperationResult {
                kind: TaskKind::Read,
                outcome: Err(DiagError::Query(detail)),
            } => assert!(detail.contains("driver fault")),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!controller.is_connected());
        assert_eq!(
            controller.request(Command::ReadCodes).unwrap_err(),
            DiagError::NotConnected
        );
    }
}
