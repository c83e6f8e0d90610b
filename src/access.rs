//! Handles for commands queued against a session.
//!
//! An [`AccessHandle`] is created when a command is submitted with
//! [`crate::session::Session::access`]. The command runs later, on whichever
//! thread drains the session's queue while holding its lock. The handle lets
//! the submitter wait for the outcome or cancel the command before it starts.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::error::{panic_to_error, AccessError, SessionError};
use crate::lock::{verify_no_other_session_locked, SessionLock};
use crate::ui::UiId;

/// A unit of work to run while holding a session lock.
pub type Command = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Externally visible progress of an access task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether the task can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

enum TaskState {
    Pending,
    Running,
    Done,
    Failed(Arc<anyhow::Error>),
    Cancelled,
}

impl TaskState {
    fn status(&self) -> TaskStatus {
        match self {
            TaskState::Pending => TaskStatus::Pending,
            TaskState::Running => TaskStatus::Running,
            TaskState::Done => TaskStatus::Done,
            TaskState::Failed(_) => TaskStatus::Failed,
            TaskState::Cancelled => TaskStatus::Cancelled,
        }
    }

    fn outcome(&self) -> Option<Result<(), AccessError>> {
        match self {
            TaskState::Done => Some(Ok(())),
            TaskState::Failed(err) => Some(Err(AccessError::Failed(err.clone()))),
            TaskState::Cancelled => Some(Err(AccessError::Cancelled)),
            TaskState::Pending | TaskState::Running => None,
        }
    }
}

struct TaskInner {
    id: u64,
    lock: Arc<SessionLock>,
    ui: Option<UiId>,
    state: Mutex<TaskState>,
    finished: Condvar,
    command: Mutex<Option<Command>>,
}

/// Completion and cancellation handle for a queued command.
#[derive(Clone)]
pub struct AccessHandle {
    inner: Arc<TaskInner>,
}

impl std::fmt::Debug for AccessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessHandle")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .field("ui", &self.inner.ui)
            .finish()
    }
}

impl AccessHandle {
    pub(crate) fn new(lock: Arc<SessionLock>, command: Command, ui: Option<UiId>) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
                lock,
                ui,
                state: Mutex::new(TaskState::Pending),
                finished: Condvar::new(),
                command: Mutex::new(Some(command)),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The UI this task was submitted through, if any.
    pub fn ui(&self) -> Option<UiId> {
        self.inner.ui
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.state.lock().status()
    }

    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == TaskStatus::Cancelled
    }

    /// Cancel the task if it has not started yet.
    ///
    /// Returns `true` if the task is now cancelled. A task that is already
    /// running or finished is left alone and `false` is returned.
    pub fn cancel(&self) -> bool {
        let mut state = self.inner.state.lock();
        if !matches!(*state, TaskState::Pending) {
            return false;
        }
        *state = TaskState::Cancelled;
        drop(state);
        self.inner.command.lock().take();
        self.inner.finished.notify_all();
        tracing::debug!(task = self.inner.id, "access task cancelled");
        true
    }

    /// Block until the task finishes.
    ///
    /// Fails with [`SessionError::DeadlockRisk`] instead of blocking when the
    /// calling thread holds another session's lock, or holds this session's
    /// lock while the task is still unfinished (the task could never run).
    pub fn get(&self) -> Result<(), AccessError> {
        self.wait(None)
    }

    /// Like [`AccessHandle::get`] but gives up after `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Result<(), AccessError> {
        self.wait(Some(Instant::now() + timeout))
    }

    fn wait(&self, deadline: Option<Instant>) -> Result<(), AccessError> {
        verify_no_other_session_locked(&self.inner.lock)?;
        let holds_own_lock = self.inner.lock.is_held_by_current_thread();

        let mut state = self.inner.state.lock();
        loop {
            if let Some(outcome) = state.outcome() {
                return outcome;
            }
            if holds_own_lock {
                return Err(SessionError::DeadlockRisk.into());
            }
            match deadline {
                Some(deadline) => {
                    if self.inner.finished.wait_until(&mut state, deadline).timed_out() {
                        return state.outcome().unwrap_or(Err(AccessError::Timeout));
                    }
                }
                None => self.inner.finished.wait(&mut state),
            }
        }
    }

    /// Execute the command if it is still pending.
    ///
    /// Must be called with the session lock held. Returns the failure, if
    /// any, so the caller can route it to an error handler.
    pub(crate) fn run(&self) -> Option<Arc<anyhow::Error>> {
        {
            let mut state = self.inner.state.lock();
            if !matches!(*state, TaskState::Pending) {
                return None;
            }
            *state = TaskState::Running;
        }

        let command = self.inner.command.lock().take();
        let outcome = match command {
            Some(command) => catch_unwind(AssertUnwindSafe(command))
                .unwrap_or_else(|payload| Err(panic_to_error(payload))),
            None => Ok(()),
        };

        let (next, failure) = match outcome {
            Ok(()) => (TaskState::Done, None),
            Err(err) => {
                let err = Arc::new(err);
                (TaskState::Failed(err.clone()), Some(err))
            }
        };
        *self.inner.state.lock() = next;
        self.inner.finished.notify_all();
        failure
    }
}
