//! OBD-II Diagnostics Session Manager
//!
//! Finds likely adapters, negotiates a working link speed, and runs trouble
//! code reads and clears on worker threads while a single control thread
//! owns the session and all state derived from it.

mod config;
mod controller;
mod discovery;
mod error;
mod executor;
mod negotiator;
mod session;

pub use config::{ConfigError, SessionConfig};
pub use controller::{Command, DiagnosticsController, Dispatch, OperationOutcome, SessionReport, UiEvent};
pub use discovery::{filter_endpoints, DiscoveryReport, Endpoint, PortDiscovery, ADAPTER_KEYWORDS};
pub use error::{DiagError, ErrorCategory};
pub use executor::{
    CommandExecutor, CommandTask, Completions, TaskHandle, TaskId, TaskKind, TaskReport, TaskState,
};
pub use negotiator::Negotiator;
pub use session::{ClearOutcome, DiagnosticResult, Session, TroubleCode};
