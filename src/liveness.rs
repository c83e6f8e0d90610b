//! Rules deciding whether UIs and sessions are still in use.
//!
//! All checks read only lock-free views of session and UI state, so they can
//! run for diagnostics from any thread.

use std::time::{Duration, Instant};

use crate::config::RuntimeConfig;
use crate::session::{Session, SessionState};
use crate::ui::Ui;

/// Default number of missed heartbeats (plus slack) before a UI is considered gone.
pub const DEFAULT_HEARTBEAT_TOLERANCE: f64 = 3.1;

#[derive(Debug, Clone, PartialEq)]
pub struct LivenessPolicy {
    /// Seconds between client heartbeats; zero or less disables UI expiry.
    pub heartbeat_interval_secs: i64,
    pub heartbeat_tolerance: f64,
    /// Close sessions that receive only heartbeats for longer than their
    /// transport session's inactivity limit.
    pub close_idle_sessions: bool,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 300,
            heartbeat_tolerance: DEFAULT_HEARTBEAT_TOLERANCE,
            close_idle_sessions: false,
        }
    }
}

impl LivenessPolicy {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            heartbeat_interval_secs: config.heartbeat_interval_secs,
            heartbeat_tolerance: config.heartbeat_tolerance,
            close_idle_sessions: config.close_idle_sessions,
        }
    }

    /// Time without heartbeats after which a UI is inactive, truncated to
    /// whole seconds. `None` when heartbeats are disabled.
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        if self.heartbeat_interval_secs <= 0 {
            return None;
        }
        let secs = (self.heartbeat_interval_secs as f64 * self.heartbeat_tolerance) as i64;
        Some(Duration::from_secs(secs.max(0) as u64))
    }

    /// Idle limit for `session`, taken from its transport session.
    /// `None` when idle closing is off, the session is unbound or the limit is negative.
    pub fn idle_timeout(&self, session: &Session) -> Option<Duration> {
        if !self.close_idle_sessions {
            return None;
        }
        session.transport()?.max_inactive_duration()
    }

    pub fn is_ui_active(&self, ui: &Ui) -> bool {
        self.is_ui_active_at(ui, Instant::now())
    }

    /// A UI is active unless it is closing, or its heartbeat timed out while
    /// nobody is waiting for the session lock. A UI whose session has no
    /// owner any more is inactive too.
    pub fn is_ui_active_at(&self, ui: &Ui, now: Instant) -> bool {
        if ui.is_closing() {
            return false;
        }
        let Some(session) = ui.session() else {
            return false;
        };
        let Some(timeout) = self.heartbeat_timeout() else {
            return true;
        };
        let timed_out = now.saturating_duration_since(ui.last_heartbeat()) >= timeout;
        !timed_out || session.lock_instance().has_queued_threads()
    }

    pub fn is_session_active(&self, session: &Session) -> bool {
        self.is_session_active_at(session, Instant::now())
    }

    pub fn is_session_active_at(&self, session: &Session, now: Instant) -> bool {
        if session.peek_state() != SessionState::Open || session.transport().is_none() {
            return false;
        }
        match self.idle_timeout(session) {
            Some(limit) => now.saturating_duration_since(session.peek_last_request()) < limit,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::SessionLock;
    use crate::transport::TransportSession;
    use crate::ui::PushMode;
    use std::sync::Arc;
    use tokio::sync::broadcast;

    fn bound_session(max_inactive: i64) -> Session {
        let (tx, _) = broadcast::channel(4);
        let session = Session::new(Arc::new(SessionLock::new()), true, "en".into(), tx);
        session.bind_transport(TransportSession::new(max_inactive));
        session
    }

    fn policy(interval: i64, close_idle: bool) -> LivenessPolicy {
        LivenessPolicy {
            heartbeat_interval_secs: interval,
            heartbeat_tolerance: DEFAULT_HEARTBEAT_TOLERANCE,
            close_idle_sessions: close_idle,
        }
    }

    #[test]
    fn heartbeat_timeout_scales_and_truncates() {
        assert_eq!(policy(300, false).heartbeat_timeout(), Some(Duration::from_secs(930)));
        assert_eq!(policy(10, false).heartbeat_timeout(), Some(Duration::from_secs(31)));
        assert_eq!(policy(0, false).heartbeat_timeout(), None);
        assert_eq!(policy(-5, false).heartbeat_timeout(), None);
    }

    #[test]
    fn ui_expires_after_missed_heartbeats() {
        let session = bound_session(1800);
        let ui = session.with_lock(|s| s.create_ui(PushMode::Disabled).unwrap());
        let p = policy(10, false);
        let beat = ui.last_heartbeat();
        assert!(p.is_ui_active_at(&ui, beat + Duration::from_secs(30)));
        assert!(!p.is_ui_active_at(&ui, beat + Duration::from_secs(31)));
        assert!(policy(0, false).is_ui_active_at(&ui, beat + Duration::from_secs(100_000)));
    }

    #[test]
    fn closing_ui_is_inactive() {
        let session = bound_session(1800);
        let ui = session.with_lock(|s| {
            let ui = s.create_ui(PushMode::Disabled).unwrap();
            ui.close().unwrap();
            ui
        });
        assert!(!policy(0, false).is_ui_active(&ui));
    }

    #[test]
    fn session_idle_timeout_respects_switch() {
        let session = bound_session(60);
        let last = session.peek_last_request();
        let later = last + Duration::from_secs(61);
        assert!(policy(300, false).is_session_active_at(&session, later));
        assert!(!policy(300, true).is_session_active_at(&session, later));
        assert!(policy(300, true).is_session_active_at(&session, last + Duration::from_secs(59)));
    }

    #[test]
    fn unbound_or_closing_session_is_inactive() {
        let session = bound_session(60);
        session.detach_transport();
        assert!(!policy(300, false).is_session_active(&session));

        let session = bound_session(60);
        session.with_lock(|s| s.close().unwrap());
        assert!(!policy(300, false).is_session_active(&session));
    }

    #[test]
    fn negative_max_inactive_never_expires() {
        let session = bound_session(-1);
        let far = session.peek_last_request() + Duration::from_secs(1_000_000);
        assert!(policy(300, true).is_session_active_at(&session, far));
    }
}
