//! Text rendering of controller events

use obd_session::{
    DiagError, DiagnosticResult, DiscoveryReport, ErrorCategory, OperationOutcome, TaskKind, UiEvent,
};
use std::fmt::Write;

/// One user-facing message per failure category
pub fn error_message(error: &DiagError, kind: Option<TaskKind>) -> String {
    match error.category(kind) {
        ErrorCategory::NotConnected => "Not connected. Connect to a vehicle first.".to_string(),
        ErrorCategory::NoPorts => format!("No serial ports available. {}", error),
        ErrorCategory::ConnectionFailed => match error {
            DiagError::NoDeviceFound => {
                "Connection failed. Check that the ignition is on and the adapter and cable are seated."
                    .to_string()
            }
            other => format!("Connection failed. {}", other),
        },
        ErrorCategory::ReadError => format!("Could not read trouble codes. {}", error),
        ErrorCategory::ClearError => format!("Could not clear trouble codes. {}", error),
        ErrorCategory::Busy => "Please wait, the previous operation is still running.".to_string(),
    }
}

/// Trouble code listing
pub fn render_codes(result: &DiagnosticResult) -> String {
    if result.is_empty() {
        return "No trouble codes detected.".to_string();
    }
    let mut out = format!("{} trouble code(s) found:", result.len());
    for code in &result.codes {
        let description = if code.description.is_empty() {
            "Unknown code"
        } else {
            code.description.as_str()
        };
        let _ = write!(out, "\n  {}  {}", code.code, description);
    }
    out
}

/// Numbered port list for selection
pub fn render_ports(report: &DiscoveryReport) -> String {
    if report.endpoints.is_empty() {
        return "No serial ports found.".to_string();
    }
    let mut out = String::new();
    if report.fell_back {
        out.push_str("No adapter-like ports matched, showing all ports:");
    } else {
        out.push_str("Available ports:");
    }
    for (index, endpoint) in report.endpoints.iter().enumerate() {
        let _ = write!(out, "\n  {}) {} - {}", index + 1, endpoint.device, endpoint.description);
    }
    out
}

/// Message for one controller event
pub fn render_event(event: &UiEvent) -> String {
    match event {
        UiEvent::ConnectionChanged {
            connected: true,
            port_name,
        } => format!(
            "Connected to vehicle on {}.",
            port_name.as_deref().unwrap_or("unknown port")
        ),
        UiEvent::ConnectionChanged { connected: false, .. } => "Disconnected.".to_string(),
        UiEvent::OperationResult { kind, outcome } => match outcome {
            Ok(OperationOutcome::Connected { .. }) => format!("{} finished.", title(*kind)),
            Ok(OperationOutcome::Codes(result)) => render_codes(result),
            Ok(OperationOutcome::Cleared(outcome)) if outcome.success => {
                "Trouble codes cleared.".to_string()
            }
            Ok(OperationOutcome::Cleared(_)) => {
                "The vehicle did not confirm the clear. Codes may still be stored.".to_string()
            }
            Err(e) => error_message(e, Some(*kind)),
        },
    }
}

/// Progress line shown when a task starts
pub fn render_started(kind: TaskKind) -> String {
    match kind {
        TaskKind::Connect => "Connecting...".to_string(),
        TaskKind::Reconnect => "Reconnecting...".to_string(),
        TaskKind::Read => "Reading trouble codes...".to_string(),
        TaskKind::Clear => "Clearing trouble codes...".to_string(),
    }
}

fn title(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::Connect => "Connect",
        TaskKind::Reconnect => "Reconnect",
        TaskKind::Read => "Read",
        TaskKind::Clear => "Clear",
    }
}
