//! The per-client session and its lock discipline.
//!
//! A [`Session`] owns the mutable state of one connected client: lifecycle
//! state, attributes, locale, error handler and the UIs it hosts. All of it
//! may only be touched by the thread holding the session lock. In strict mode
//! a violation returns [`SessionError::LockNotHeld`]; in production mode the
//! check is a debug assertion only.
//!
//! Work submitted from other threads goes through the access queue. It is
//! drained, in submission order, whenever the lock is released for the last
//! time by its holder.

use std::any::{type_name, Any};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::access::{AccessHandle, Command};
use crate::error::{
    panic_to_error, AccessError, DefaultErrorHandler, ErrorEvent, ErrorHandler, SessionError,
    SESSION_NOT_LOCKED_MESSAGE,
};
use crate::lock::{verify_no_other_session_locked, SessionLock};
use crate::transport::{Attribute, TransportSession};
use crate::ui::{PushMode, Ui, UiId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a session. Only `Open -> Closing -> Closed` is legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

impl SessionState {
    pub fn can_move_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Open, SessionState::Closing) | (SessionState::Closing, SessionState::Closed)
        )
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created { session: SessionId },
    Closing { session: SessionId },
    Destroyed { session: SessionId },
    UiCreated { session: SessionId, ui: UiId },
    UiClosed { session: SessionId, ui: UiId },
    UiRemoved { session: SessionId, ui: UiId },
}

struct SessionData {
    state: SessionState,
    attributes: HashMap<String, Attribute>,
    locale: String,
    error_handler: Arc<dyn ErrorHandler>,
    uis: BTreeMap<UiId, Ui>,
    next_ui_id: UiId,
    last_request: Instant,
    last_request_duration: Option<Duration>,
    cumulative_request_duration: Duration,
}

pub(crate) struct SessionInner {
    id: SessionId,
    push_id: String,
    lock: Arc<SessionLock>,
    strict: bool,
    pending: Mutex<VecDeque<AccessHandle>>,
    transport: RwLock<Option<TransportSession>>,
    events: broadcast::Sender<SessionEvent>,
    data: Mutex<SessionData>,
}

/// A client session. Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("lock", &self.inner.lock.id())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Session {}

/// Releases the session lock when dropped, running the queue drain if this
/// was the outermost hold.
#[must_use = "the session is unlocked as soon as the guard is dropped"]
pub struct SessionGuard {
    session: Session,
}

impl SessionGuard {
    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Err(e) = self.session.unlock() {
            tracing::error!(session = %self.session.id(), error = %e, "failed to release session lock");
        }
    }
}

impl Session {
    pub(crate) fn new(
        lock: Arc<SessionLock>,
        strict: bool,
        locale: String,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let session = Self {
            inner: Arc::new(SessionInner {
                id: SessionId::new(),
                push_id: Uuid::new_v4().to_string(),
                lock,
                strict,
                pending: Mutex::new(VecDeque::new()),
                transport: RwLock::new(None),
                events,
                data: Mutex::new(SessionData {
                    state: SessionState::Open,
                    attributes: HashMap::new(),
                    locale,
                    error_handler: Arc::new(DefaultErrorHandler),
                    uis: BTreeMap::new(),
                    next_ui_id: 0,
                    last_request: Instant::now(),
                    last_request_duration: None,
                    cumulative_request_duration: Duration::ZERO,
                }),
            }),
        };
        session.emit(SessionEvent::Created { session: session.id() });
        session
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Identifier used by push connections to find this session.
    pub fn push_id(&self) -> &str {
        &self.inner.push_id
    }

    pub fn lock_instance(&self) -> &Arc<SessionLock> {
        &self.inner.lock
    }

    /// Whether lock violations are reported as errors instead of debug assertions.
    pub fn is_strict(&self) -> bool {
        self.inner.strict
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.inner.events.send(event);
    }

    // ---- locking ----

    /// Block until the current thread holds the session lock.
    pub fn lock(&self) {
        self.inner.lock.lock();
    }

    pub fn try_lock(&self) -> bool {
        self.inner.lock.try_lock()
    }

    /// Release one hold on the session lock.
    ///
    /// The outermost release first runs every queued access task and pushes
    /// pending changes of UIs in automatic push mode. Anything queued after
    /// that but before the lock is actually freed is purged right after.
    pub fn unlock(&self) -> Result<(), SessionError> {
        self.inner.lock.check_held()?;
        let ultimate = self.inner.lock.hold_count() == 1;
        if ultimate {
            self.run_pending_access_tasks();
            self.push_automatic_uis();
        }
        self.inner.lock.unlock()?;
        if ultimate && self.pending_access_count() > 0 {
            self.ensure_access_queue_purged();
        }
        Ok(())
    }

    /// Acquire the lock and return a guard that releases it on drop.
    pub fn lock_guard(&self) -> SessionGuard {
        self.lock();
        SessionGuard {
            session: self.clone(),
        }
    }

    /// Run `f` with the session locked. The lock is released on every exit
    /// path, unwinding included.
    pub fn with_lock<R>(&self, f: impl FnOnce(&Session) -> R) -> R {
        let guard = self.lock_guard();
        f(guard.session())
    }

    pub fn has_lock(&self) -> bool {
        self.inner.lock.is_held_by_current_thread()
    }

    /// Verify the calling thread holds the session lock.
    pub fn check_has_lock(&self) -> Result<(), SessionError> {
        if self.inner.strict {
            return self.inner.lock.check_held();
        }
        debug_assert!(self.has_lock(), "{}", SESSION_NOT_LOCKED_MESSAGE);
        Ok(())
    }

    // ---- access queue ----

    /// Queue `command` to run while holding this session's lock.
    ///
    /// Runs before this call returns if the lock is free. Otherwise it runs
    /// when the current holder releases the lock.
    pub fn access<F>(&self, command: F) -> AccessHandle
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.submit(Box::new(command), None)
    }

    pub(crate) fn submit(&self, command: Command, ui: Option<UiId>) -> AccessHandle {
        let handle = AccessHandle::new(self.inner.lock.clone(), command, ui);
        self.inner.pending.lock().push_back(handle.clone());
        tracing::trace!(session = %self.id(), task = handle.id(), "access task queued");
        self.ensure_access_queue_purged();
        handle
    }

    /// Lock the session, run `command`, then unlock.
    ///
    /// Fails with [`SessionError::DeadlockRisk`] without blocking if the
    /// calling thread holds another session's lock.
    pub fn access_synchronously<F>(&self, command: F) -> Result<(), AccessError>
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        verify_no_other_session_locked(&self.inner.lock)?;
        let _guard = self.lock_guard();
        catch_unwind(AssertUnwindSafe(command))
            .unwrap_or_else(|payload| Err(panic_to_error(payload)))
            .map_err(|e| AccessError::Failed(Arc::new(e)))
    }

    /// Drain the queue if nobody else holds the lock.
    pub fn ensure_access_queue_purged(&self) {
        if self.inner.lock.try_lock() {
            if let Err(e) = self.unlock() {
                tracing::error!(session = %self.id(), error = %e, "failed to unlock after purging access queue");
            }
        }
    }

    /// Run every queued task in FIFO order. The caller must hold the lock.
    ///
    /// Cancelled tasks are skipped. Failures are recorded on the handle and
    /// reported to the session error handler; they never stop the drain.
    pub fn run_pending_access_tasks(&self) {
        if !self.has_lock() {
            debug_assert!(false, "{}", SESSION_NOT_LOCKED_MESSAGE);
            return;
        }
        let mut ran = 0usize;
        loop {
            let next = self.inner.pending.lock().pop_front();
            let Some(handle) = next else { break };
            if handle.is_cancelled() {
                continue;
            }
            if let Some(error) = handle.run() {
                let event = match handle.ui() {
                    Some(ui) => ErrorEvent::for_ui(error, ui),
                    None => ErrorEvent::new(error),
                };
                self.report_error(&event);
            }
            ran += 1;
        }
        if ran > 0 {
            tracing::debug!(session = %self.id(), tasks = ran, "drained access queue");
        }
    }

    pub fn pending_access_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Route `event` to the session error handler, shielding the caller from
    /// a panicking handler.
    pub(crate) fn report_error(&self, event: &ErrorEvent) {
        let handler = self.inner.data.lock().error_handler.clone();
        if catch_unwind(AssertUnwindSafe(|| handler.error(event))).is_err() {
            tracing::error!(session = %self.id(), error = %event.error, "error handler panicked");
        }
    }

    fn push_automatic_uis(&self) {
        let uis: Vec<Ui> = self.inner.data.lock().uis.values().cloned().collect();
        for ui in uis {
            if ui.peek_push_mode() != PushMode::Automatic {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| ui.flush_changes())) {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    let event = ErrorEvent::for_ui(Arc::new(e.into()), ui.id());
                    self.report_error(&event);
                }
                Err(payload) => {
                    let event = ErrorEvent::for_ui(Arc::new(panic_to_error(payload)), ui.id());
                    self.report_error(&event);
                }
            }
        }
    }

    // ---- lifecycle ----

    pub fn state(&self) -> Result<SessionState, SessionError> {
        self.check_has_lock()?;
        Ok(self.inner.data.lock().state)
    }

    /// Mark the session as closing. It is destroyed by the next cleanup pass.
    pub fn close(&self) -> Result<(), SessionError> {
        self.check_has_lock()?;
        let mut data = self.inner.data.lock();
        match data.state {
            SessionState::Open => data.state = SessionState::Closing,
            SessionState::Closing => return Ok(()),
            SessionState::Closed => return Err(SessionError::Closed),
        }
        drop(data);
        tracing::info!(session = %self.id(), "session closing");
        self.emit(SessionEvent::Closing { session: self.id() });
        Ok(())
    }

    pub(crate) fn set_state(&self, next: SessionState) -> Result<(), SessionError> {
        self.check_has_lock()?;
        let mut data = self.inner.data.lock();
        let from = data.state;
        if !from.can_move_to(next) {
            debug_assert!(false, "invalid session state change {from:?} -> {next:?}");
            return Err(SessionError::InvalidStateTransition { from, to: next });
        }
        data.state = next;
        drop(data);
        if next == SessionState::Closing {
            self.emit(SessionEvent::Closing { session: self.id() });
        }
        Ok(())
    }

    // ---- attributes ----

    pub fn attribute(&self, name: &str) -> Result<Option<Attribute>, SessionError> {
        self.check_has_lock()?;
        Ok(self.inner.data.lock().attributes.get(name).cloned())
    }

    /// Look up a named attribute and downcast it. A value of another type reads as absent.
    pub fn attribute_as<T: Any + Send + Sync>(&self, name: &str) -> Result<Option<Arc<T>>, SessionError> {
        Ok(self.attribute(name)?.and_then(|value| value.downcast::<T>().ok()))
    }

    /// Store `value` under `name`, returning the previous value.
    pub fn set_attribute<T: Any + Send + Sync>(
        &self,
        name: &str,
        value: T,
    ) -> Result<Option<Attribute>, SessionError> {
        self.check_has_lock()?;
        Ok(self.inner.data.lock().attributes.insert(name.to_string(), Arc::new(value)))
    }

    pub fn remove_attribute(&self, name: &str) -> Result<Option<Attribute>, SessionError> {
        self.check_has_lock()?;
        Ok(self.inner.data.lock().attributes.remove(name))
    }

    /// Typed attributes are keyed by their type name.
    pub fn get<T: Any + Send + Sync>(&self) -> Result<Option<Arc<T>>, SessionError> {
        self.attribute_as::<T>(type_name::<T>())
    }

    pub fn set<T: Any + Send + Sync>(&self, value: T) -> Result<(), SessionError> {
        self.set_attribute(type_name::<T>(), value).map(|_| ())
    }

    pub fn remove<T: Any + Send + Sync>(&self) -> Result<Option<Arc<T>>, SessionError> {
        Ok(self
            .remove_attribute(type_name::<T>())?
            .and_then(|value| value.downcast::<T>().ok()))
    }

    pub fn attribute_names(&self) -> Result<Vec<String>, SessionError> {
        self.check_has_lock()?;
        let mut names: Vec<String> = self.inner.data.lock().attributes.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    // ---- locale and error handling ----

    pub fn locale(&self) -> Result<String, SessionError> {
        self.check_has_lock()?;
        Ok(self.inner.data.lock().locale.clone())
    }

    /// Change the session locale and propagate it to every UI.
    pub fn set_locale(&self, locale: impl Into<String>) -> Result<(), SessionError> {
        self.check_has_lock()?;
        let locale = locale.into();
        let uis: Vec<Ui> = {
            let mut data = self.inner.data.lock();
            data.locale = locale.clone();
            data.uis.values().cloned().collect()
        };
        for ui in uis {
            ui.set_locale(locale.clone())?;
        }
        Ok(())
    }

    pub fn error_handler(&self) -> Result<Arc<dyn ErrorHandler>, SessionError> {
        self.check_has_lock()?;
        Ok(self.inner.data.lock().error_handler.clone())
    }

    pub fn set_error_handler(&self, handler: impl ErrorHandler + 'static) -> Result<(), SessionError> {
        self.check_has_lock()?;
        self.inner.data.lock().error_handler = Arc::new(handler);
        Ok(())
    }

    // ---- UIs ----

    /// All UIs of the session, ordered by id.
    pub fn uis(&self) -> Result<Vec<Ui>, SessionError> {
        self.check_has_lock()?;
        Ok(self.inner.data.lock().uis.values().cloned().collect())
    }

    pub fn ui(&self, id: UiId) -> Result<Option<Ui>, SessionError> {
        self.check_has_lock()?;
        Ok(self.inner.data.lock().uis.get(&id).cloned())
    }

    /// Create a UI in this session. Only open sessions accept new UIs.
    pub fn create_ui(&self, push_mode: PushMode) -> Result<Ui, SessionError> {
        self.check_has_lock()?;
        let ui = {
            let mut data = self.inner.data.lock();
            if data.state != SessionState::Open {
                return Err(SessionError::Closed);
            }
            let id = data.next_ui_id;
            data.next_ui_id += 1;
            let ui = Ui::new(id, Arc::downgrade(&self.inner), push_mode, data.locale.clone());
            data.uis.insert(id, ui.clone());
            ui
        };
        tracing::debug!(session = %self.id(), ui = ui.id(), ?push_mode, "UI created");
        self.emit(SessionEvent::UiCreated { session: self.id(), ui: ui.id() });
        Ok(ui)
    }

    /// Remove a UI and detach it from the session.
    pub fn remove_ui(&self, id: UiId) -> Result<Option<Ui>, SessionError> {
        self.check_has_lock()?;
        let removed = self.inner.data.lock().uis.remove(&id);
        if let Some(ui) = &removed {
            ui.detach();
            tracing::debug!(session = %self.id(), ui = id, "UI removed");
            self.emit(SessionEvent::UiRemoved { session: self.id(), ui: id });
        }
        Ok(removed)
    }

    // ---- request bookkeeping ----

    pub fn last_request_timestamp(&self) -> Result<Instant, SessionError> {
        self.check_has_lock()?;
        Ok(self.inner.data.lock().last_request)
    }

    pub fn set_last_request_timestamp(&self, at: Instant) -> Result<(), SessionError> {
        self.check_has_lock()?;
        self.inner.data.lock().last_request = at;
        Ok(())
    }

    pub fn last_request_duration(&self) -> Result<Option<Duration>, SessionError> {
        self.check_has_lock()?;
        Ok(self.inner.data.lock().last_request_duration)
    }

    /// Record how long the last request took and add it to the running total.
    pub fn set_last_request_duration(&self, duration: Duration) -> Result<(), SessionError> {
        self.check_has_lock()?;
        let mut data = self.inner.data.lock();
        data.last_request_duration = Some(duration);
        data.cumulative_request_duration += duration;
        Ok(())
    }

    pub fn cumulative_request_duration(&self) -> Result<Duration, SessionError> {
        self.check_has_lock()?;
        Ok(self.inner.data.lock().cumulative_request_duration)
    }

    // ---- transport binding ----

    /// The transport session this session is stored in, if still bound.
    pub fn transport(&self) -> Option<TransportSession> {
        self.inner.transport.read().clone()
    }

    pub(crate) fn bind_transport(&self, transport: TransportSession) {
        *self.inner.transport.write() = Some(transport);
    }

    pub(crate) fn detach_transport(&self) -> Option<TransportSession> {
        self.inner.transport.write().take()
    }

    // ---- lock-free views for liveness checks and diagnostics ----

    pub(crate) fn peek_state(&self) -> SessionState {
        self.inner.data.lock().state
    }

    pub(crate) fn peek_last_request(&self) -> Instant {
        self.inner.data.lock().last_request
    }

    pub(crate) fn peek_uis(&self) -> Vec<Ui> {
        self.inner.data.lock().uis.values().cloned().collect()
    }
}
