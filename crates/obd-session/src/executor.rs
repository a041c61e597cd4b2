//! Async Command Executor
//!
//! Runs blocking adapter work on one short-lived thread per task and hands
//! each result back over an unbounded single-consumer channel. The control
//! thread drains [`Completions`] and is the only place state changes.
//!
//! A task may carry a lease: a value lent to the worker for the duration of
//! the task and returned with the report. The controller uses it to move the
//! session to the worker and back without sharing it.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::DiagError;

/// Operation tag carried by every task and report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Open a session
    Connect,
    /// Read stored trouble codes
    Read,
    /// Clear stored trouble codes
    Clear,
    /// Close the current session and open a new one
    Reconnect,
}

impl TaskKind {
    fn panic_error(self, detail: String) -> DiagError {
        match self {
            TaskKind::Connect | TaskKind::Reconnect => DiagError::Transport(detail),
            TaskKind::Read | TaskKind::Clear => DiagError::Query(detail),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Connect => "connect",
            TaskKind::Read => "read",
            TaskKind::Clear => "clear",
            TaskKind::Reconnect => "reconnect",
        };
        f.write_str(name)
    }
}

/// Identifier assigned at submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a task: `Idle -> Running -> {Succeeded, Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Submitted, worker not started yet
    Idle = 0,
    /// Worker is running
    Running = 1,
    /// Worker returned a value
    Succeeded = 2,
    /// Worker returned an error or panicked
    Failed = 3,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TaskState::Running,
            2 => TaskState::Succeeded,
            3 => TaskState::Failed,
            _ => TaskState::Idle,
        }
    }

    /// True once the worker has finished
    pub fn is_finished(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

type Work<T, L> = Box<dyn FnOnce(&mut Option<L>) -> Result<T, DiagError> + Send + 'static>;

/// A unit of work for the executor
pub struct CommandTask<T, L = ()> {
    kind: TaskKind,
    lease: Option<L>,
    work: Work<T, L>,
}

impl<T> CommandTask<T, ()> {
    /// Task without a lease
    pub fn new<F>(kind: TaskKind, work: F) -> Self
    where
        F: FnOnce() -> Result<T, DiagError> + Send + 'static,
    {
        Self {
            kind,
            lease: None,
            work: Box::new(move |_| work()),
        }
    }
}

impl<T, L> CommandTask<T, L> {
    /// Task that borrows `lease` for its duration. The worker may take,
    /// replace or keep the value; whatever is left is returned in the report.
    pub fn with_lease<F>(kind: TaskKind, lease: Option<L>, work: F) -> Self
    where
        F: FnOnce(&mut Option<L>) -> Result<T, DiagError> + Send + 'static,
    {
        Self {
            kind,
            lease,
            work: Box::new(work),
        }
    }

    /// Operation tag
    pub fn kind(&self) -> TaskKind {
        self.kind
    }
}

/// Delivered exactly once per submitted task
#[derive(Debug)]
pub struct TaskReport<T, L = ()> {
    /// Task identifier
    pub id: TaskId,
    /// Operation tag
    pub kind: TaskKind,
    /// What the worker produced
    pub outcome: Result<T, DiagError>,
    /// The lease, unless the worker panicked
    pub lease: Option<L>,
}

/// Returned by [`CommandExecutor::submit`]
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    kind: TaskKind,
    state: Arc<AtomicU8>,
}

impl TaskHandle {
    /// Task identifier
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Operation tag
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Current lifecycle state
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Spawns workers; cheap to clone
pub struct CommandExecutor<T, L = ()> {
    next_id: Arc<AtomicU64>,
    sender: mpsc::UnboundedSender<TaskReport<T, L>>,
}

impl<T, L> Clone for CommandExecutor<T, L> {
    fn clone(&self) -> Self {
        Self {
            next_id: Arc::clone(&self.next_id),
            sender: self.sender.clone(),
        }
    }
}

/// Receiving side of the result channel
pub struct Completions<T, L = ()> {
    receiver: mpsc::UnboundedReceiver<TaskReport<T, L>>,
}

impl<T, L> CommandExecutor<T, L>
where
    T: Send + 'static,
    L: Send + 'static,
{
    /// Create an executor and the single consumer of its results
    pub fn channel() -> (Self, Completions<T, L>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let executor = Self {
            next_id: Arc::new(AtomicU64::new(1)),
            sender,
        };
        (executor, Completions { receiver })
    }

    /// Start `task` on its own thread and return immediately
    pub fn submit(&self, task: CommandTask<T, L>) -> TaskHandle {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let kind = task.kind;
        let state = Arc::new(AtomicU8::new(TaskState::Idle as u8));
        let handle = TaskHandle {
            id,
            kind,
            state: Arc::clone(&state),
        };

        debug!("Submitting {} task {}", kind, id);
        let sender = self.sender.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("obd-task-{}", id.0))
            .spawn(move || {
                let report = run(id, task, &state);
                if sender.send(report).is_err() {
                    debug!("Result of task {} dropped, no consumer", id);
                }
            });

        if let Err(e) = spawned {
            error!("Could not spawn worker for task {}: {}", id, e);
            handle.state.store(TaskState::Failed as u8, Ordering::Release);
            let report = TaskReport {
                id,
                kind,
                outcome: Err(kind.panic_error(format!("could not start worker: {}", e))),
                lease: None,
            };
            if self.sender.send(report).is_err() {
                debug!("Result of task {} dropped, no consumer", id);
            }
        }

        handle
    }
}

fn run<T, L>(id: TaskId, task: CommandTask<T, L>, state: &AtomicU8) -> TaskReport<T, L> {
    let CommandTask {
        kind,
        mut lease,
        work,
    } = task;
    state.store(TaskState::Running as u8, Ordering::Release);

    let caught = panic::catch_unwind(AssertUnwindSafe(|| work(&mut lease)));
    let (outcome, lease) = match caught {
        Ok(outcome) => (outcome, lease),
        Err(payload) => {
            let detail = panic_detail(payload.as_ref());
            error!("{} task {} panicked: {}", kind, id, detail);
            // The lease may be half-updated; dropping it releases the port
            drop(lease);
            (Err(kind.panic_error(format!("worker panicked: {}", detail))), None)
        }
    };

    let finished = if outcome.is_ok() {
        TaskState::Succeeded
    } else {
        TaskState::Failed
    };
    state.store(finished as u8, Ordering::Release);
    debug!("{} task {} finished: {:?}", kind, id, finished);

    TaskReport {
        id,
        kind,
        outcome,
        lease,
    }
}

fn panic_detail(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<T, L> Completions<T, L> {
    /// Wait for the next report. `None` once every executor clone is gone
    /// and the channel is drained.
    pub async fn next(&mut self) -> Option<TaskReport<T, L>> {
        self.receiver.recv().await
    }

    /// Take a report if one is ready, without waiting
    pub fn try_next(&mut self) -> Option<TaskReport<T, L>> {
        self.receiver.try_recv().ok()
    }

    /// Block the current thread until the next report.
    ///
    /// Must not be called from inside an async runtime.
    pub fn blocking_next(&mut self) -> Option<TaskReport<T, L>> {
        self.receiver.blocking_recv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_result_is_delivered_once() {
        let (executor, mut completions) = CommandExecutor::<u32>::channel();
        let handle = executor.submit(CommandTask::new(TaskKind::Read, || Ok(7)));
        drop(executor);

        let report = completions.next().await.unwrap();
        assert_eq!(report.id, handle.id());
        assert_eq!(report.kind, TaskKind::Read);
        assert_eq!(report.outcome, Ok(7));
        assert_eq!(handle.state(), TaskState::Succeeded);

        assert!(completions.next().await.is_none());
    }

    #[tokio::test]
    async fn test_error_becomes_failed_report() {
        let (executor, mut completions) = CommandExecutor::<u32>::channel();
        let handle = executor.submit(CommandTask::new(TaskKind::Connect, || {
            Err(DiagError::NoDeviceFound)
        }));

        let report = completions.next().await.unwrap();
        assert_eq!(report.outcome, Err(DiagError::NoDeviceFound));
        assert_eq!(handle.state(), TaskState::Failed);
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let (executor, mut completions) = CommandExecutor::<u32>::channel();
        executor.submit(CommandTask::new(TaskKind::Clear, || panic!("adapter vanished")));

        let report = completions.next().await.unwrap();
        match report.outcome {
            Err(DiagError::Query(detail)) => assert!(detail.contains("adapter vanished")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panic_in_connect_is_transport_error() {
        let (executor, mut completions) = CommandExecutor::<u32>::channel();
        executor.submit(CommandTask::new(TaskKind::Reconnect, || {
            panic!("{}", String::from("driver fault"))
        }));

        let report = completions.next().await.unwrap();
        assert!(matches!(report.outcome, Err(DiagError::Transport(ref d)) if d.contains("driver fault")));
    }

    #[tokio::test]
    async fn test_lease_round_trip() {
        let (executor, mut completions) = CommandExecutor::<usize, Vec<u8>>::channel();
        executor.submit(CommandTask::with_lease(
            TaskKind::Read,
            Some(vec![1, 2]),
            |lease: &mut Option<Vec<u8>>| {
                let buffer = lease.as_mut().ok_or(DiagError::NotConnected)?;
                buffer.push(3);
                Ok(buffer.len())
            },
        ));

        let report = completions.next().await.unwrap();
        assert_eq!(report.outcome, Ok(3));
        assert_eq!(report.lease, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_panic_drops_lease() {
        struct Tracked(std_mpsc::Sender<()>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                let _ = self.0.send(());
            }
        }

        let (dropped_tx, dropped_rx) = std_mpsc::channel();
        let (executor, mut completions) = CommandExecutor::<(), Tracked>::channel();
        executor.submit(CommandTask::with_lease(
            TaskKind::Read,
            Some(Tracked(dropped_tx)),
            |_lease: &mut Option<Tracked>| panic!("boom"),
        ));

        let report = completions.next().await.unwrap();
        assert!(report.outcome.is_err());
        assert!(report.lease.is_none());
        assert!(dropped_rx.recv_timeout(Duration::from_secs(1)).is_ok());
    }

    #[tokio::test]
    async fn test_results_arrive_in_completion_order() {
        let (executor, mut completions) = CommandExecutor::<&'static str>::channel();
        let (release_tx, release_rx) = std_mpsc::channel::<()>();

        executor.submit(CommandTask::new(TaskKind::Connect, move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
            Ok("slow")
        }));
        executor.submit(CommandTask::new(TaskKind::Read, || Ok("fast")));

        let first = completions.next().await.unwrap();
        assert_eq!(first.outcome, Ok("fast"));
        release_tx.send(()).unwrap();
        let second = completions.next().await.unwrap();
        assert_eq!(second.outcome, Ok("slow"));
    }

    #[tokio::test]
    async fn test_submit_does_not_block() {
        let (executor, mut completions) = CommandExecutor::<()>::channel();
        let (release_tx, release_rx) = std_mpsc::channel::<()>();

        let handle = executor.submit(CommandTask::new(TaskKind::Connect, move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
            Ok(())
        }));
        assert!(!handle.state().is_finished());
        assert!(completions.try_next().is_none());

        release_tx.send(()).unwrap();
        completions.next().await.unwrap();
        assert!(handle.state().is_finished());
    }

    #[test]
    fn test_blocking_consumer() {
        let (executor, mut completions) = CommandExecutor::<u8>::channel();
        let first = executor.submit(CommandTask::new(TaskKind::Read, || Ok(1)));
        let second = executor.submit(CommandTask::new(TaskKind::Read, || Ok(2)));
        assert_ne!(first.id(), second.id());

        let mut values = vec![
            completions.blocking_next().unwrap().outcome.unwrap(),
            completions.blocking_next().unwrap().outcome.unwrap(),
        ];
        values.sort();
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn test_late_result_without_consumer_is_dropped() {
        let (executor, completions) = CommandExecutor::<u8>::channel();
        drop(completions);
        let handle = executor.submit(CommandTask::new(TaskKind::Read, || Ok(1)));
        for _ in 0..100 {
            if handle.state().is_finished() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handle.state(), TaskState::Succeeded);
    }
}
