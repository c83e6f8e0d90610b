//! UI instances hosted by a session.
//!
//! A [`Ui`] is one browser window or tab. It never outlives its session: the
//! session holds the only strong reference to it, and the UI points back
//! through a weak reference that is cleared when the UI is removed.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::access::AccessHandle;
use crate::error::{AccessError, SessionError};
use crate::session::{Session, SessionEvent, SessionInner};

/// Identifier of a UI, unique within its session.
pub type UiId = u32;

/// How pending changes reach the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushMode {
    /// Changes travel only with responses to client requests.
    #[default]
    Disabled,
    /// Application code calls [`Ui::push`] explicitly.
    Manual,
    /// Changes are pushed every time the session lock is fully released.
    Automatic,
}

impl PushMode {
    pub fn is_enabled(self) -> bool {
        self != PushMode::Disabled
    }
}

/// Server-to-client channel used to deliver pushed changes.
pub trait PushConnection: Send + Sync {
    fn push(&self, ui: UiId, changes: &[String]) -> anyhow::Result<()>;

    /// Called when the UI is detached from its session.
    fn disconnect(&self) {}
}

struct UiData {
    push_mode: PushMode,
    connection: Option<Arc<dyn PushConnection>>,
    pending_changes: Vec<String>,
    locale: String,
}

struct UiInner {
    id: UiId,
    session: RwLock<Weak<SessionInner>>,
    closing: AtomicBool,
    last_heartbeat: Mutex<Instant>,
    data: Mutex<UiData>,
}

#[derive(Clone)]
pub struct Ui {
    inner: Arc<UiInner>,
}

impl fmt::Debug for Ui {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ui")
            .field("id", &self.inner.id)
            .field("closing", &self.is_closing())
            .field("attached", &self.is_attached())
            .finish_non_exhaustive()
    }
}

impl Ui {
    pub(crate) fn new(id: UiId, session: Weak<SessionInner>, push_mode: PushMode, locale: String) -> Self {
        Self {
            inner: Arc::new(UiInner {
                id,
                session: RwLock::new(session),
                closing: AtomicBool::new(false),
                last_heartbeat: Mutex::new(Instant::now()),
                data: Mutex::new(UiData {
                    push_mode,
                    connection: None,
                    pending_changes: Vec::new(),
                    locale,
                }),
            }),
        }
    }

    pub fn id(&self) -> UiId {
        self.inner.id
    }

    /// The owning session, or `None` once the UI has been removed.
    pub fn session(&self) -> Option<Session> {
        self.inner.session.read().upgrade().map(|inner| Session { inner })
    }

    pub fn is_attached(&self) -> bool {
        self.inner.session.read().strong_count() > 0
    }

    fn locked_session(&self) -> Result<Session, SessionError> {
        let session = self.session().ok_or(SessionError::UiDetached)?;
        session.check_has_lock()?;
        Ok(session)
    }

    /// Readable without the session lock so liveness checks can run anywhere.
    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// Readable without the session lock so liveness checks can run anywhere.
    pub fn last_heartbeat(&self) -> Instant {
        *self.inner.last_heartbeat.lock()
    }

    pub fn set_last_heartbeat(&self, at: Instant) -> Result<(), SessionError> {
        self.locked_session()?;
        *self.inner.last_heartbeat.lock() = at;
        Ok(())
    }

    /// Record a heartbeat received now.
    pub fn heartbeat(&self) -> Result<(), SessionError> {
        self.set_last_heartbeat(Instant::now())
    }

    /// Mark the UI as closing. It is removed by the next cleanup pass.
    pub fn close(&self) -> Result<(), SessionError> {
        let session = self.locked_session()?;
        if !self.inner.closing.swap(true, Ordering::AcqRel) {
            tracing::debug!(session = %session.id(), ui = self.id(), "UI closing");
            session.emit(SessionEvent::UiClosed {
                session: session.id(),
                ui: self.id(),
            });
        }
        Ok(())
    }

    pub fn push_mode(&self) -> Result<PushMode, SessionError> {
        self.locked_session()?;
        Ok(self.inner.data.lock().push_mode)
    }

    pub fn set_push_mode(&self, mode: PushMode) -> Result<(), SessionError> {
        self.locked_session()?;
        self.inner.data.lock().push_mode = mode;
        Ok(())
    }

    pub(crate) fn peek_push_mode(&self) -> PushMode {
        self.inner.data.lock().push_mode
    }

    pub fn set_push_connection(&self, connection: Option<Arc<dyn PushConnection>>) -> Result<(), SessionError> {
        self.locked_session()?;
        self.inner.data.lock().connection = connection;
        Ok(())
    }

    pub fn has_push_connection(&self) -> bool {
        self.inner.data.lock().connection.is_some()
    }

    pub fn locale(&self) -> Result<String, SessionError> {
        self.locked_session()?;
        Ok(self.inner.data.lock().locale.clone())
    }

    pub fn set_locale(&self, locale: impl Into<String>) -> Result<(), SessionError> {
        self.locked_session()?;
        self.inner.data.lock().locale = locale.into();
        Ok(())
    }

    /// Record a change that has to reach the client.
    pub fn mark_changed(&self, change: impl Into<String>) -> Result<(), SessionError> {
        self.locked_session()?;
        self.inner.data.lock().pending_changes.push(change.into());
        Ok(())
    }

    pub fn pending_changes(&self) -> Result<Vec<String>, SessionError> {
        self.locked_session()?;
        Ok(self.inner.data.lock().pending_changes.clone())
    }

    pub fn is_dirty(&self) -> bool {
        !self.inner.data.lock().pending_changes.is_empty()
    }

    /// Push pending changes to the client right away.
    ///
    /// Push must be enabled and the session lock held. Queued access tasks
    /// run first so their changes go out in the same push. Returns whether
    /// anything was sent.
    pub fn push(&self) -> Result<bool, SessionError> {
        let session = self.locked_session()?;
        if !self.peek_push_mode().is_enabled() {
            return Err(SessionError::PushDisabled(self.id()));
        }
        session.run_pending_access_tasks();
        self.flush_changes()
    }

    /// Send pending changes over the push connection, if there is one.
    ///
    /// Without a connection the changes stay pending until one is attached.
    pub(crate) fn flush_changes(&self) -> Result<bool, SessionError> {
        let (connection, changes) = {
            let mut data = self.inner.data.lock();
            let Some(connection) = data.connection.clone() else {
                return Ok(false);
            };
            if data.pending_changes.is_empty() {
                return Ok(false);
            }
            (connection, std::mem::take(&mut data.pending_changes))
        };
        tracing::trace!(ui = self.id(), changes = changes.len(), "pushing changes");
        connection.push(self.id(), &changes).map_err(|e| SessionError::PushFailed {
            ui: self.id(),
            error: Arc::new(e),
        })?;
        Ok(true)
    }

    /// Queue `command` on the owning session.
    ///
    /// The command fails with [`SessionError::UiDetached`] if the UI has left
    /// its session by the time it runs. Failures reach the session error
    /// handler tagged with this UI's id.
    pub fn access<F>(&self, command: F) -> Result<AccessHandle, SessionError>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let session = self.session().ok_or(SessionError::UiDetached)?;
        let ui = self.clone();
        let wrapped = move || {
            if !ui.is_attached() {
                return Err(SessionError::UiDetached.into());
            }
            command()
        };
        Ok(session.submit(Box::new(wrapped), Some(self.id())))
    }

    /// Lock the owning session and run `command` on the calling thread.
    pub fn access_synchronously<F>(&self, command: F) -> Result<(), AccessError>
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        let session = self.session().ok_or(SessionError::UiDetached)?;
        session.access_synchronously(|| {
            if !self.is_attached() {
                return Err(SessionError::UiDetached.into());
            }
            command()
        })
    }

    /// Sever the link to the session and drop the push connection.
    pub(crate) fn detach(&self) {
        *self.inner.session.write() = Weak::new();
        let connection = self.inner.data.lock().connection.take();
        if let Some(connection) = connection {
            connection.disconnect();
        }
    }
}
