#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use session_runtime::{
    ErrorEvent, PushConnection, Request, RuntimeConfig, Session, SessionService, UiId,
};

/// A service with default configuration.
pub fn service() -> SessionService {
    SessionService::new(RuntimeConfig::default())
}

/// A service built from a modified default configuration.
pub fn service_with(configure: impl FnOnce(&mut RuntimeConfig)) -> SessionService {
    let mut config = RuntimeConfig::default();
    configure(&mut config);
    SessionService::new(config)
}

/// Bootstrap a client: send an init request and return its session and UI id.
pub fn bootstrap(service: &SessionService) -> (Session, UiId) {
    let response = service.handle_request(&Request::init());
    assert!(response.is_ok(), "bootstrap failed: {response:?}");
    let transport = response.transport.expect("init response carries a transport id");
    let ui = response.body.parse().expect("init response carries the UI id");
    let session = service.session_for(transport).expect("session stored in transport");
    (session, ui)
}

/// Install an error handler that records every reported error message.
pub fn record_errors(session: &Session) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    session.with_lock(|s| {
        s.set_error_handler(move |event: &ErrorEvent| sink.lock().push(event.error.to_string()))
            .unwrap()
    });
    seen
}

/// Push connection that remembers everything pushed through it.
#[derive(Default)]
pub struct RecordingPush {
    pub pushed: Mutex<Vec<(UiId, Vec<String>)>>,
}

impl PushConnection for RecordingPush {
    fn push(&self, ui: UiId, changes: &[String]) -> anyhow::Result<()> {
        self.pushed.lock().push((ui, changes.to_vec()));
        Ok(())
    }
}

impl RecordingPush {
    pub fn all_changes(&self) -> Vec<String> {
        self.pushed.lock().iter().flat_map(|(_, c)| c.iter().cloned()).collect()
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}
