use std::sync::Arc;

use crate::session::SessionState;
use crate::ui::UiId;

/// Message used when session state is touched without holding its lock.
pub const SESSION_NOT_LOCKED_MESSAGE: &str =
    "Cannot access state in a session without locking it first";

/// Errors raised by the session runtime itself.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// Session state was read or written by a thread that does not hold the
    /// session lock.
    #[error("{0}")]
    LockNotHeld(&'static str),
    /// No session exists for the request, or the transport session was
    /// invalidated while it was being used.
    #[error("session expired")]
    SessionExpired,
    /// The current thread holds the lock of another session and attempted a
    /// blocking acquisition of this one.
    #[error(
        "can't access session while another session is locked by the same thread; \
         this restriction avoids cross-session deadlocks"
    )]
    DeadlockRisk,
    #[error("UI is detached from its session")]
    UiDetached,
    #[error("session is closed")]
    Closed,
    #[error("invalid session state change {from:?} -> {to:?}")]
    InvalidStateTransition { from: SessionState, to: SessionState },
    #[error("push is not enabled for UI {0}")]
    PushDisabled(UiId),
    #[error("push to UI {ui} failed: {error}")]
    PushFailed { ui: UiId, error: Arc<anyhow::Error> },
}

/// Errors surfaced by an access task handle.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AccessError {
    #[error("access task was cancelled")]
    Cancelled,
    #[error("access task failed: {0}")]
    Failed(Arc<anyhow::Error>),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("timed out waiting for access task")]
    Timeout,
}

impl AccessError {
    /// Returns the captured command failure, if this error carries one.
    pub fn failure(&self) -> Option<&anyhow::Error> {
        match self {
            AccessError::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// A failure routed to a session's [`ErrorHandler`].
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub error: Arc<anyhow::Error>,
    /// The UI the failing work was targeting, when known.
    pub ui: Option<UiId>,
}

impl ErrorEvent {
    pub fn new(error: Arc<anyhow::Error>) -> Self {
        Self { error, ui: None }
    }

    pub fn for_ui(error: Arc<anyhow::Error>, ui: UiId) -> Self {
        Self { error, ui: Some(ui) }
    }
}

/// Receives failures that nobody else is positioned to handle: queued
/// commands, listeners and request handlers.
pub trait ErrorHandler: Send + Sync {
    fn error(&self, event: &ErrorEvent);
}

/// Logs every error through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrorHandler;

impl ErrorHandler for DefaultErrorHandler {
    fn error(&self, event: &ErrorEvent) {
        match event.ui {
            Some(ui) => tracing::error!(ui, error = %event.error, "unhandled error in session"),
            None => tracing::error!(error = %event.error, "unhandled error in session"),
        }
    }
}

impl<F> ErrorHandler for F
where
    F: Fn(&ErrorEvent) + Send + Sync,
{
    fn error(&self, event: &ErrorEvent) {
        self(event)
    }
}

/// Convert a caught panic payload into an error value.
pub(crate) fn panic_to_error(payload: Box<dyn std::any::Any + Send>) -> anyhow::Error {
    let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    anyhow::anyhow!("panicked: {message}")
}
