//! Transport-level sessions: the container session the runtime is layered on.
//!
//! A [`TransportSession`] is what an HTTP layer would keep per cookie. It
//! carries a concurrent attribute map (the session lock and the bound
//! [`crate::session::Session`] live there), an inactivity limit, and an
//! invalidated flag. Once invalidated every attribute access fails with
//! [`SessionError::SessionExpired`].

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SessionError;

/// Value stored in a transport session attribute.
pub type Attribute = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportSessionId(Uuid);

impl TransportSessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransportSessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransportSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

struct TransportInner {
    id: TransportSessionId,
    created_at: Instant,
    last_accessed: Mutex<Instant>,
    /// Seconds; negative means the session never times out.
    max_inactive_interval: AtomicI64,
    invalidated: AtomicBool,
    attributes: RwLock<HashMap<String, Attribute>>,
}

/// A container-level session shared by every request carrying its id.
#[derive(Clone)]
pub struct TransportSession {
    inner: Arc<TransportInner>,
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("id", &self.inner.id)
            .field("invalidated", &self.is_invalidated())
            .finish_non_exhaustive()
    }
}

impl TransportSession {
    pub fn new(max_inactive_interval_secs: i64) -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(TransportInner {
                id: TransportSessionId::new(),
                created_at: now,
                last_accessed: Mutex::new(now),
                max_inactive_interval: AtomicI64::new(max_inactive_interval_secs),
                invalidated: AtomicBool::new(false),
                attributes: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn id(&self) -> TransportSessionId {
        self.inner.id
    }

    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    pub fn last_accessed(&self) -> Instant {
        *self.inner.last_accessed.lock()
    }

    /// Record that a request used this session.
    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    pub fn touch_at(&self, at: Instant) {
        *self.inner.last_accessed.lock() = at;
    }

    /// Maximum idle time in seconds; negative disables the timeout.
    pub fn max_inactive_interval(&self) -> i64 {
        self.inner.max_inactive_interval.load(Ordering::Acquire)
    }

    pub fn set_max_inactive_interval(&self, secs: i64) {
        self.inner.max_inactive_interval.store(secs, Ordering::Release);
    }

    /// The idle timeout as a duration, `None` when it never fires.
    pub fn max_inactive_duration(&self) -> Option<Duration> {
        let secs = self.max_inactive_interval();
        (secs >= 0).then(|| Duration::from_secs(secs as u64))
    }

    /// Whether the session has been idle for longer than its inactivity limit.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        match self.max_inactive_duration() {
            Some(limit) => now.saturating_duration_since(self.last_accessed()) >= limit,
            None => false,
        }
    }

    pub fn is_invalidated(&self) -> bool {
        self.inner.invalidated.load(Ordering::Acquire)
    }

    /// Invalidate the session, returning the attributes it held.
    ///
    /// Only the first call returns attributes; later calls return an empty map.
    pub fn invalidate(&self) -> HashMap<String, Attribute> {
        let mut attributes = self.inner.attributes.write();
        if self.inner.invalidated.swap(true, Ordering::AcqRel) {
            return HashMap::new();
        }
        tracing::debug!(transport = %self.inner.id, "transport session invalidated");
        std::mem::take(&mut *attributes)
    }

    fn check_valid(&self) -> Result<(), SessionError> {
        if self.is_invalidated() {
            Err(SessionError::SessionExpired)
        } else {
            Ok(())
        }
    }

    pub fn attribute(&self, name: &str) -> Result<Option<Attribute>, SessionError> {
        let attributes = self.inner.attributes.read();
        self.check_valid()?;
        Ok(attributes.get(name).cloned())
    }

    /// Look up an attribute and downcast it to `T`. A value of another type
    /// reads as absent.
    pub fn typed_attribute<T: Any + Send + Sync>(&self, name: &str) -> Result<Option<Arc<T>>, SessionError> {
        Ok(self
            .attribute(name)?
            .and_then(|value| value.downcast::<T>().ok()))
    }

    pub fn set_attribute<T: Any + Send + Sync>(&self, name: &str, value: Arc<T>) -> Result<(), SessionError> {
        let mut attributes = self.inner.attributes.write();
        self.check_valid()?;
        attributes.insert(name.to_string(), value);
        Ok(())
    }

    pub fn remove_attribute(&self, name: &str) -> Result<Option<Attribute>, SessionError> {
        let mut attributes = self.inner.attributes.write();
        self.check_valid()?;
        Ok(attributes.remove(name))
    }

    pub fn attribute_names(&self) -> Result<Vec<String>, SessionError> {
        let attributes = self.inner.attributes.read();
        self.check_valid()?;
        Ok(attributes.keys().cloned().collect())
    }
}

/// All live transport sessions, keyed by id.
pub struct TransportStore {
    sessions: RwLock<HashMap<TransportSessionId, TransportSession>>,
    default_max_inactive_interval: i64,
}

impl TransportStore {
    pub fn new(default_max_inactive_interval: i64) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            default_max_inactive_interval,
        }
    }

    /// Create and register a fresh transport session.
    pub fn create(&self) -> TransportSession {
        let session = TransportSession::new(self.default_max_inactive_interval);
        self.sessions.write().insert(session.id(), session.clone());
        tracing::debug!(transport = %session.id(), "transport session created");
        session
    }

    pub fn get(&self, id: TransportSessionId) -> Option<TransportSession> {
        self.sessions.read().get(&id).cloned()
    }

    pub fn remove(&self, id: TransportSessionId) -> Option<TransportSession> {
        self.sessions.write().remove(&id)
    }

    /// Snapshot of every registered session.
    pub fn all(&self) -> Vec<TransportSession> {
        self.sessions.read().values().cloned().collect()
    }

    /// Sessions whose inactivity limit has passed at `now`.
    pub fn expired(&self, now: Instant) -> Vec<TransportSession> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.is_expired_at(now))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
