//! Request orchestration and session lifecycle management.
//!
//! [`SessionService`] resolves the session for each request, runs the
//! handler chain with the session locked, and afterwards sweeps inactive UIs
//! and sessions. It also reacts to transport sessions being invalidated,
//! either explicitly or by the background reaper.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::access::AccessHandle;
use crate::config::RuntimeConfig;
use crate::error::{panic_to_error, AccessError, ErrorEvent, SessionError};
use crate::liveness::LivenessPolicy;
use crate::lock::{LockRegistry, SessionLock};
use crate::request::{
    negotiate_locale, HeartbeatHandler, InitHandler, PushConnectionFactory, Request, RequestHandler,
    Response, ResponseStatus, CLOSE_APPLICATION_PARAMETER, RESTART_APPLICATION_PARAMETER,
};
use crate::session::{Session, SessionEvent, SessionId, SessionState};
use crate::transport::{TransportSession, TransportSessionId, TransportStore};
use crate::ui::{PushConnection, PushMode, Ui, UiId};

/// Runs after a session has been created, with its lock held.
pub type SessionInitListener = Arc<dyn Fn(&Session, &Request) -> anyhow::Result<()> + Send + Sync>;
/// Runs while a session is destroyed, with its lock held.
pub type SessionDestroyListener = Arc<dyn Fn(&Session) -> anyhow::Result<()> + Send + Sync>;

/// Registration handle returned when adding a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

enum Lookup {
    Found(Session),
    /// The session was closed at the client's request; the request ends here.
    Closed(Session),
}

struct ServiceInner {
    config: RuntimeConfig,
    transports: TransportStore,
    locks: LockRegistry,
    liveness: LivenessPolicy,
    session_attribute: String,
    handlers: RwLock<Vec<Arc<dyn RequestHandler>>>,
    init_listeners: RwLock<Vec<(ListenerId, SessionInitListener)>>,
    destroy_listeners: RwLock<Vec<(ListenerId, SessionDestroyListener)>>,
    next_listener_id: AtomicU64,
    push_factory: Arc<RwLock<Option<PushConnectionFactory>>>,
    events_tx: broadcast::Sender<SessionEvent>,
}

/// Entry point for requests and owner of the session lifecycle.
#[derive(Clone)]
pub struct SessionService {
    inner: Arc<ServiceInner>,
}

impl SessionService {
    pub fn new(config: RuntimeConfig) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        let push_factory = Arc::new(RwLock::new(None));
        let handlers: Vec<Arc<dyn RequestHandler>> = vec![
            Arc::new(HeartbeatHandler),
            Arc::new(InitHandler::new(config.default_push_mode, push_factory.clone())),
        ];
        Self {
            inner: Arc::new(ServiceInner {
                transports: TransportStore::new(config.max_inactive_interval_secs),
                locks: LockRegistry::new(&config.service_name),
                liveness: LivenessPolicy::from_config(&config),
                session_attribute: format!("{}.session", config.service_name),
                handlers: RwLock::new(handlers),
                init_listeners: RwLock::new(Vec::new()),
                destroy_listeners: RwLock::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                push_factory,
                events_tx,
                config,
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn liveness(&self) -> &LivenessPolicy {
        &self.inner.liveness
    }

    pub fn transports(&self) -> &TransportStore {
        &self.inner.transports
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.inner.locks
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events_tx.subscribe()
    }

    // ---- registration ----

    /// Append a handler after the built-in heartbeat and init handlers.
    pub fn add_request_handler(&self, handler: impl RequestHandler + 'static) {
        self.inner.handlers.write().push(Arc::new(handler));
    }

    pub fn set_push_connection_factory<F>(&self, factory: F)
    where
        F: Fn(&Session, &Ui) -> Option<Arc<dyn PushConnection>> + Send + Sync + 'static,
    {
        *self.inner.push_factory.write() = Some(Arc::new(factory));
    }

    fn next_listener_id(&self) -> ListenerId {
        ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn add_session_init_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Session, &Request) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_listener_id();
        self.inner.init_listeners.write().push((id, Arc::new(listener)));
        id
    }

    pub fn remove_session_init_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.init_listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn add_session_destroy_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Session) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_listener_id();
        self.inner.destroy_listeners.write().push((id, Arc::new(listener)));
        id
    }

    pub fn remove_session_destroy_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.destroy_listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    // ---- request handling ----

    /// Handle one request end to end.
    ///
    /// Never fails: expiry, unhandled requests and handler errors all turn
    /// into a response. The session lock is released on every path.
    pub fn handle_request(&self, request: &Request) -> Response {
        let started = Instant::now();
        let mut response = Response::default();

        let session = match self.find_session(request, &mut response) {
            Ok(Some(session)) => session,
            Ok(None) => return response,
            Err(SessionError::SessionExpired) => {
                self.handle_session_expired(request, &mut response);
                return response;
            }
            Err(e) => {
                self.handle_exception_during_request(None, &mut response, e.into());
                return response;
            }
        };

        match self.dispatch(&session, request, &mut response) {
            Ok(true) => {}
            Ok(false) => response.set(
                ResponseStatus::NotFound,
                "Request was not handled by any registered handler.",
            ),
            Err(e) if is_session_expired(&e) => self.handle_session_expired(request, &mut response),
            Err(e) => self.handle_exception_during_request(Some(&session), &mut response, e),
        }

        self.request_end(&session, started);
        response
    }

    /// Resolve the session for `request`, creating one if the request allows it.
    ///
    /// Lookup and creation happen with the session lock held so concurrent
    /// first requests agree on a single session. Returns `None` when the
    /// request asked to close the session.
    pub fn find_session(&self, request: &Request, response: &mut Response) -> Result<Option<Session>, SessionError> {
        let can_create = request.kind.can_create_session();
        let known = request.transport.and_then(|id| self.inner.transports.get(id));
        let transport = match known {
            Some(transport) => transport,
            None if can_create => self.inner.transports.create(),
            None => return Err(SessionError::SessionExpired),
        };
        transport.touch();
        response.transport = Some(transport.id());

        // Tasks queued on the bound session while we waited must not be
        // stranded when the lock is released without a drain below.
        let bound = self.load_session(&transport).ok().flatten();
        let lock = match self.inner.locks.lock_session(&transport) {
            Ok(lock) => lock,
            Err(e) => {
                if let Some(session) = &bound {
                    session.ensure_access_queue_purged();
                }
                return Err(e);
            }
        };
        let found = self.find_or_create_locked(&transport, &lock, request, can_create);
        let released = match &found {
            Ok(Lookup::Found(session)) | Ok(Lookup::Closed(session)) => session.unlock(),
            Err(_) => {
                let released = lock.unlock().map(|_| ());
                if let Some(session) = &bound {
                    session.ensure_access_queue_purged();
                }
                released
            }
        };
        if let Err(e) = released {
            tracing::error!(transport = %transport.id(), error = %e, "failed to release session lock after lookup");
        }

        match found? {
            Lookup::Found(session) => Ok(Some(session)),
            Lookup::Closed(_) => Ok(None),
        }
    }

    fn find_or_create_locked(
        &self,
        transport: &TransportSession,
        lock: &Arc<SessionLock>,
        request: &Request,
        can_create: bool,
    ) -> Result<Lookup, SessionError> {
        debug_assert!(lock.is_held_by_current_thread());

        if let Some(existing) = self.load_session(transport)? {
            if request.has_parameter(CLOSE_APPLICATION_PARAMETER) {
                self.close_session_now(&existing);
                return Ok(Lookup::Closed(existing));
            }
            if request.has_parameter(RESTART_APPLICATION_PARAMETER) {
                self.close_session_now(&existing);
                existing.run_pending_access_tasks();
                return self.create_and_register(transport, lock, request).map(Lookup::Found);
            }
            return Ok(Lookup::Found(existing));
        }

        if can_create {
            self.create_and_register(transport, lock, request).map(Lookup::Found)
        } else {
            Err(SessionError::SessionExpired)
        }
    }

    fn create_and_register(
        &self,
        transport: &TransportSession,
        lock: &Arc<SessionLock>,
        request: &Request,
    ) -> Result<Session, SessionError> {
        let config = &self.inner.config;
        let locale = negotiate_locale(&request.locales, &config.provided_locales)
            .unwrap_or_else(|| config.default_locale.clone());
        let session = Session::new(
            lock.clone(),
            !config.production_mode,
            locale,
            self.inner.events_tx.clone(),
        );
        transport.set_attribute(&self.inner.session_attribute, Arc::new(session.clone()))?;
        session.bind_transport(transport.clone());
        tracing::info!(session = %session.id(), transport = %transport.id(), "session created");

        let listeners = self.inner.init_listeners.read().clone();
        for (_, listener) in listeners {
            run_listener(&session, || listener(&session, request));
        }
        Ok(session)
    }

    fn load_session(&self, transport: &TransportSession) -> Result<Option<Session>, SessionError> {
        Ok(transport
            .typed_attribute::<Session>(&self.inner.session_attribute)?
            .map(|session| (*session).clone()))
    }

    /// The session stored in a transport session, if any.
    pub fn session_for(&self, transport: TransportSessionId) -> Option<Session> {
        let transport = self.inner.transports.get(transport)?;
        self.load_session(&transport).ok().flatten()
    }

    /// Every session currently bound to a live transport session.
    pub fn sessions(&self) -> Vec<Session> {
        self.inner
            .transports
            .all()
            .iter()
            .filter_map(|t| self.load_session(t).ok().flatten())
            .collect()
    }

    fn dispatch(&self, session: &Session, request: &Request, response: &mut Response) -> anyhow::Result<bool> {
        let _guard = session.lock_guard();
        if session.state()? == SessionState::Closed {
            return Err(SessionError::SessionExpired.into());
        }
        if !request.kind.is_heartbeat() {
            session.set_last_request_timestamp(Instant::now())?;
        }

        let handlers = self.inner.handlers.read().clone();
        for handler in handlers {
            let handled = catch_unwind(AssertUnwindSafe(|| handler.handle(session, request, response)))
                .unwrap_or_else(|payload| Err(panic_to_error(payload)))?;
            if handled {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn handle_exception_during_request(
        &self,
        session: Option<&Session>,
        response: &mut Response,
        error: anyhow::Error,
    ) {
        let error = Arc::new(error);
        match session {
            Some(session) => {
                let _guard = session.lock_guard();
                session.report_error(&ErrorEvent::new(error));
            }
            None => tracing::error!(error = %error, "request failed before a session was resolved"),
        }
        response.set(ResponseStatus::InternalError, "Internal error");
    }

    fn handle_session_expired(&self, request: &Request, response: &mut Response) {
        tracing::debug!(transport = ?request.transport, "session expired");
        let handlers = self.inner.handlers.read().clone();
        for handler in handlers {
            let handled = catch_unwind(AssertUnwindSafe(|| handler.handle_session_expired(request, response)))
                .unwrap_or_else(|payload| {
                    tracing::error!(error = %panic_to_error(payload), "session expired handler panicked");
                    false
                });
            if handled {
                return;
            }
        }
        response.set(ResponseStatus::SessionExpired, "Session expired");
    }

    fn request_end(&self, session: &Session, started: Instant) {
        let _guard = session.lock_guard();
        if let Err(e) = self.cleanup_session(session) {
            tracing::warn!(session = %session.id(), error = %e, "session cleanup failed");
        }
        if let Err(e) = session.set_last_request_duration(started.elapsed()) {
            tracing::warn!(session = %session.id(), error = %e, "failed to record request duration");
        }
    }

    // ---- liveness sweep ----

    /// End-of-request sweep. The caller must hold the session lock.
    ///
    /// For an active session, closes inactive UIs and removes closed ones.
    /// An inactive session is closed, unbound from its transport session and
    /// queued for destruction.
    pub fn cleanup_session(&self, session: &Session) -> Result<(), SessionError> {
        if self.inner.liveness.is_session_active(session) {
            self.close_inactive_uis(session)?;
            self.remove_closed_uis(session)?;
            return Ok(());
        }

        if session.state()? == SessionState::Open {
            session.close()?;
            tracing::debug!(session = %session.id(), "closing inactive session");
        }
        if session.transport().is_some() {
            self.remove_session(session);
        }
        self.fire_session_destroy(session);
        Ok(())
    }

    fn close_inactive_uis(&self, session: &Session) -> Result<(), SessionError> {
        for ui in session.uis()? {
            if !ui.is_closing() && !self.inner.liveness.is_ui_active(&ui) {
                tracing::debug!(session = %session.id(), ui = ui.id(), "closing inactive UI");
                ui.close()?;
            }
        }
        Ok(())
    }

    fn remove_closed_uis(&self, session: &Session) -> Result<(), SessionError> {
        for ui in session.uis()? {
            if ui.is_closing() {
                session.remove_ui(ui.id())?;
            }
        }
        Ok(())
    }

    /// Unbind `session` from its transport session.
    pub fn remove_session(&self, session: &Session) {
        let Some(transport) = session.detach_transport() else {
            return;
        };
        match self.load_session(&transport) {
            Ok(Some(stored)) if stored == *session => {
                let _ = transport.remove_attribute(&self.inner.session_attribute);
            }
            _ => {}
        }
    }

    fn close_session_now(&self, session: &Session) {
        self.remove_session(session);
        if let Err(e) = self.destroy_locked(session) {
            session.report_error(&ErrorEvent::new(Arc::new(e)));
        }
    }

    /// Queue destruction of `session` on its access queue.
    ///
    /// Destruction closes the session, closes and removes every UI, runs the
    /// destroy listeners and finally marks the session closed. It happens at
    /// most once.
    pub fn fire_session_destroy(&self, session: &Session) -> AccessHandle {
        let service = self.clone();
        let target = session.clone();
        session.access(move || service.destroy_locked(&target))
    }

    fn destroy_locked(&self, session: &Session) -> anyhow::Result<()> {
        let state = session.state()?;
        if state == SessionState::Closed {
            return Ok(());
        }
        if state == SessionState::Open {
            session.close()?;
        }
        for ui in session.uis()? {
            if !ui.is_closing() {
                ui.close()?;
            }
            session.remove_ui(ui.id())?;
        }

        let listeners = self.inner.destroy_listeners.read().clone();
        for (_, listener) in listeners {
            run_listener(session, || listener(session));
        }

        session.set_state(SessionState::Closed)?;
        tracing::info!(session = %session.id(), "session destroyed");
        session.emit(SessionEvent::Destroyed { session: session.id() });
        Ok(())
    }

    // ---- transport session lifecycle ----

    /// Invalidate a transport session as the container would.
    ///
    /// If the calling thread is inside a request holding the bound session's
    /// lock, the session is only closed and the end-of-request cleanup
    /// destroys it. Otherwise destruction is queued right away.
    pub fn invalidate_transport_session(&self, id: TransportSessionId) -> bool {
        let Some(transport) = self.inner.transports.remove(id) else {
            return false;
        };
        let attributes = transport.invalidate();
        let bound = attributes
            .get(&self.inner.session_attribute)
            .cloned()
            .and_then(|value| value.downcast::<Session>().ok());
        if let Some(session) = bound {
            self.session_unbound(&session);
        }
        true
    }

    fn session_unbound(&self, session: &Session) {
        session.detach_transport();
        if session.has_lock() {
            match session.close() {
                Ok(()) | Err(SessionError::Closed) => {}
                Err(e) => tracing::warn!(session = %session.id(), error = %e, "failed to close unbound session"),
            }
        } else {
            self.fire_session_destroy(session);
        }
    }

    /// Invalidate every transport session idle past its inactivity limit.
    pub fn expire_transport_sessions(&self, now: Instant) -> usize {
        let expired = self.inner.transports.expired(now);
        let mut count = 0;
        for transport in expired {
            if self.invalidate_transport_session(transport.id()) {
                count += 1;
            }
        }
        if count > 0 {
            tracing::info!(count, "expired idle transport sessions");
        }
        count
    }

    // ---- out-of-band access ----

    /// Run `f` with `session` locked; released on every exit path.
    pub fn with_session_locked<R>(&self, session: &Session, f: impl FnOnce(&Session) -> R) -> R {
        session.with_lock(f)
    }

    pub fn submit_access<F>(&self, session: &Session, command: F) -> AccessHandle
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        session.access(command)
    }

    pub fn access_synchronously<F>(&self, session: &Session, command: F) -> Result<(), AccessError>
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        session.access_synchronously(command)
    }

    pub fn ensure_access_queue_purged(&self, session: &Session) {
        session.ensure_access_queue_purged();
    }

    pub fn is_session_active(&self, session: &Session) -> bool {
        self.inner.liveness.is_session_active(session)
    }

    pub fn is_ui_active(&self, ui: &Ui) -> bool {
        self.inner.liveness.is_ui_active(ui)
    }

    // ---- diagnostics ----

    /// Summary of all sessions, gathered without taking any session lock.
    pub fn snapshot(&self) -> ServiceSnapshot {
        let now = Instant::now();
        let transports = self.inner.transports.all();
        let sessions = transports
            .iter()
            .filter_map(|t| {
                let session = self.load_session(t).ok().flatten()?;
                Some(self.session_snapshot(&session, t.id(), now))
            })
            .collect();
        ServiceSnapshot {
            transport_sessions: transports.len(),
            sessions,
        }
    }

    fn session_snapshot(&self, session: &Session, transport: TransportSessionId, now: Instant) -> SessionSnapshot {
        let lock = session.lock_instance();
        let uis = session
            .peek_uis()
            .iter()
            .map(|ui| UiSnapshot {
                id: ui.id(),
                closing: ui.is_closing(),
                active: self.inner.liveness.is_ui_active_at(ui, now),
                push_mode: ui.peek_push_mode(),
                since_heartbeat_ms: now.saturating_duration_since(ui.last_heartbeat()).as_millis() as u64,
            })
            .collect();
        SessionSnapshot {
            id: session.id(),
            transport,
            state: session.peek_state(),
            active: self.inner.liveness.is_session_active_at(session, now),
            locked: lock.is_locked(),
            queued_threads: lock.queue_length(),
            pending_access: session.pending_access_count(),
            since_request_ms: now.saturating_duration_since(session.peek_last_request()).as_millis() as u64,
            uis,
        }
    }
}

fn is_session_expired(error: &anyhow::Error) -> bool {
    matches!(error.downcast_ref::<SessionError>(), Some(SessionError::SessionExpired))
}

/// Run a listener, routing failures and panics to the session error handler.
fn run_listener(session: &Session, listener: impl FnOnce() -> anyhow::Result<()>) {
    let outcome = catch_unwind(AssertUnwindSafe(listener)).unwrap_or_else(|payload| Err(panic_to_error(payload)));
    if let Err(e) = outcome {
        session.report_error(&ErrorEvent::new(Arc::new(e)));
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub transport_sessions: usize,
    pub sessions: Vec<SessionSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub transport: TransportSessionId,
    pub state: SessionState,
    pub active: bool,
    pub locked: bool,
    pub queued_threads: usize,
    pub pending_access: usize,
    pub since_request_ms: u64,
    pub uis: Vec<UiSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UiSnapshot {
    pub id: UiId,
    pub closing: bool,
    pub active: bool,
    pub push_mode: PushMode,
    pub since_heartbeat_ms: u64,
}
