//! Reentrant per-session lock and the registry that hands it out.
//!
//! A [`SessionLock`] is owned by one thread at a time and may be re-acquired
//! by that thread. It counts blocked waiters so the liveness monitor can
//! defer eviction while someone is queued for the session, and reports the
//! hold count so the outermost release can be told apart from nested ones.
//!
//! Locks are stored as an attribute of the transport session they guard, so
//! they exist before the session object itself has been created. The
//! [`LockRegistry`] creates them with double-checked locking behind a
//! registry-wide creation mutex.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::error::{SessionError, SESSION_NOT_LOCKED_MESSAGE};
use crate::transport::TransportSession;

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Ids of every session lock the current thread holds at least once.
    static HELD_LOCKS: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    holds: usize,
    waiters: usize,
}

/// A reentrant mutual-exclusion lock guarding one session.
#[derive(Debug)]
pub struct SessionLock {
    id: u64,
    state: Mutex<LockState>,
    released: Condvar,
}

impl Default for SessionLock {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLock {
    pub fn new() -> Self {
        Self {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
        }
    }

    /// Process-unique id of this lock.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until the lock is held by the current thread.
    pub fn lock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner == Some(me) {
            state.holds += 1;
            return;
        }
        state.waiters += 1;
        while state.owner.is_some() {
            self.released.wait(&mut state);
        }
        state.waiters -= 1;
        state.owner = Some(me);
        state.holds = 1;
        drop(state);
        HELD_LOCKS.with(|held| held.borrow_mut().push(self.id));
    }

    /// Acquire the lock only if it is free or already held by this thread.
    /// Never blocks.
    pub fn try_lock(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        match state.owner {
            Some(owner) if owner == me => {
                state.holds += 1;
                true
            }
            Some(_) => false,
            None => {
                state.owner = Some(me);
                state.holds = 1;
                drop(state);
                HELD_LOCKS.with(|held| held.borrow_mut().push(self.id));
                true
            }
        }
    }

    /// Release one hold. Returns `true` if this call freed the lock.
    pub fn unlock(&self) -> Result<bool, SessionError> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            return Err(SessionError::LockNotHeld(
                "Trying to unlock the session but it has not been locked by this thread",
            ));
        }
        state.holds -= 1;
        if state.holds > 0 {
            return Ok(false);
        }
        state.owner = None;
        drop(state);
        HELD_LOCKS.with(|held| held.borrow_mut().retain(|id| *id != self.id));
        self.released.notify_one();
        Ok(true)
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    /// Number of holds the current thread has on this lock (0 if it doesn't own it).
    pub fn hold_count(&self) -> usize {
        let state = self.state.lock();
        if state.owner == Some(thread::current().id()) {
            state.holds
        } else {
            0
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// Whether any thread is blocked in [`SessionLock::lock`] waiting for this lock.
    pub fn has_queued_threads(&self) -> bool {
        self.state.lock().waiters > 0
    }

    pub fn queue_length(&self) -> usize {
        self.state.lock().waiters
    }

    pub(crate) fn check_held(&self) -> Result<(), SessionError> {
        if self.is_held_by_current_thread() {
            Ok(())
        } else {
            Err(SessionError::LockNotHeld(SESSION_NOT_LOCKED_MESSAGE))
        }
    }
}

/// Whether the current thread holds any session lock other than `lock_id`.
pub fn holds_other_session_lock(lock_id: u64) -> bool {
    HELD_LOCKS.with(|held| held.borrow().iter().any(|id| *id != lock_id))
}

/// Number of distinct session locks held by the current thread.
pub fn held_lock_count() -> usize {
    HELD_LOCKS.with(|held| held.borrow().len())
}

/// Fail with [`SessionError::DeadlockRisk`] if the current thread holds the
/// lock of a session other than the one guarded by `lock`.
pub fn verify_no_other_session_locked(lock: &SessionLock) -> Result<(), SessionError> {
    if holds_other_session_lock(lock.id()) {
        tracing::warn!(lock = lock.id(), "refusing cross-session lock acquisition");
        return Err(SessionError::DeadlockRisk);
    }
    Ok(())
}

/// Hands out the single lock associated with each transport session.
pub struct LockRegistry {
    attribute_name: String,
    creation: Mutex<()>,
}

impl LockRegistry {
    pub fn new(service_name: &str) -> Self {
        Self {
            attribute_name: format!("{service_name}.lock"),
            creation: Mutex::new(()),
        }
    }

    /// Name of the transport-session attribute the lock is stored under.
    pub fn attribute_name(&self) -> &str {
        &self.attribute_name
    }

    /// Look up the lock for `transport` without creating one.
    pub fn get(&self, transport: &TransportSession) -> Result<Option<Arc<SessionLock>>, SessionError> {
        transport.typed_attribute::<SessionLock>(&self.attribute_name)
    }

    /// Return the lock for `transport`, creating it on first use.
    ///
    /// Concurrent first callers for the same transport session always agree
    /// on a single lock instance.
    pub fn get_or_create(&self, transport: &TransportSession) -> Result<Arc<SessionLock>, SessionError> {
        if let Some(lock) = self.get(transport)? {
            return Ok(lock);
        }
        let _creating = self.creation.lock();
        if let Some(lock) = self.get(transport)? {
            return Ok(lock);
        }
        let lock = Arc::new(SessionLock::new());
        self.set(transport, lock.clone())?;
        tracing::debug!(transport = %transport.id(), lock = lock.id(), "created session lock");
        Ok(lock)
    }

    fn set(&self, transport: &TransportSession, lock: Arc<SessionLock>) -> Result<(), SessionError> {
        let current = self.get(transport)?;
        debug_assert!(
            current.as_ref().map_or(true, |c| Arc::ptr_eq(c, &lock)),
            "changing the lock for a session is not allowed"
        );
        if current.is_some() {
            return Ok(());
        }
        transport.set_attribute(&self.attribute_name, lock)
    }

    /// Acquire the lock of `transport`, blocking as needed.
    ///
    /// Fails with [`SessionError::SessionExpired`] if the transport session
    /// was invalidated before or while waiting for the lock.
    pub fn lock_session(&self, transport: &TransportSession) -> Result<Arc<SessionLock>, SessionError> {
        let lock = self
            .get_or_create(transport)
            .map_err(|_| SessionError::SessionExpired)?;
        lock.lock();
        if transport.is_invalidated() {
            if let Err(e) = lock.unlock() {
                tracing::error!(transport = %transport.id(), error = %e, "failed to release lock of invalidated session");
            }
            return Err(SessionError::SessionExpired);
        }
        Ok(lock)
    }

    pub fn unlock_session(&self, transport: &TransportSession) -> Result<bool, SessionError> {
        let lock = self
            .get(transport)
            .ok()
            .flatten()
            .ok_or(SessionError::LockNotHeld(SESSION_NOT_LOCKED_MESSAGE))?;
        lock.unlock()
    }
}
