//! Requests, responses and the handler chain they flow through.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::session::Session;
use crate::transport::TransportSessionId;
use crate::ui::{PushConnection, PushMode, Ui, UiId};

/// Request parameter asking to close the session and stop.
pub const CLOSE_APPLICATION_PARAMETER: &str = "closeApplication";
/// Request parameter asking to replace the session with a fresh one.
pub const RESTART_APPLICATION_PARAMETER: &str = "restartApplication";

/// What a request is for. Only the distinctions the runtime acts on are modelled.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RequestKind {
    /// Bootstrap of a new UI.
    #[default]
    Init,
    /// Client-to-server round trip for an existing UI.
    Uidl { ui: UiId },
    /// Keep-alive for an existing UI.
    Heartbeat { ui: UiId },
    /// Anything else, identified by path.
    Other(String),
}

impl RequestKind {
    /// Whether a missing session may be created for this request. UIDL and
    /// heartbeat requests always refer to an existing session.
    pub fn can_create_session(&self) -> bool {
        matches!(self, RequestKind::Init | RequestKind::Other(_))
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, RequestKind::Heartbeat { .. })
    }

    pub fn ui(&self) -> Option<UiId> {
        match self {
            RequestKind::Uidl { ui } | RequestKind::Heartbeat { ui } => Some(*ui),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Request {
    /// Transport session the client presented, if any.
    pub transport: Option<TransportSessionId>,
    pub kind: RequestKind,
    pub parameters: HashMap<String, String>,
    /// Client locale preferences, most preferred first (e.g. `fi-FI`).
    pub locales: Vec<String>,
}

impl Request {
    pub fn new(kind: RequestKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    pub fn init() -> Self {
        Self::new(RequestKind::Init)
    }

    pub fn uidl(transport: TransportSessionId, ui: UiId) -> Self {
        Self::new(RequestKind::Uidl { ui }).with_transport(transport)
    }

    pub fn heartbeat(transport: TransportSessionId, ui: UiId) -> Self {
        Self::new(RequestKind::Heartbeat { ui }).with_transport(transport)
    }

    pub fn with_transport(mut self, transport: TransportSessionId) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_locales<I, S>(mut self, locales: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.locales = locales.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    #[default]
    Ok,
    /// No handler accepted the request.
    NotFound,
    /// The UI addressed by the request no longer exists.
    Gone,
    /// The session behind the request has expired.
    SessionExpired,
    InternalError,
}

impl ResponseStatus {
    /// HTTP status code an adapter would send.
    pub fn code(self) -> u16 {
        match self {
            ResponseStatus::Ok => 200,
            ResponseStatus::NotFound => 404,
            ResponseStatus::Gone | ResponseStatus::SessionExpired => 410,
            ResponseStatus::InternalError => 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Response {
    pub status: ResponseStatus,
    pub body: String,
    /// Transport session the client should present on later requests.
    pub transport: Option<TransportSessionId>,
}

impl Response {
    pub fn set(&mut self, status: ResponseStatus, body: impl Into<String>) {
        self.status = status;
        self.body = body.into();
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}

/// A link in the request handler chain.
///
/// Handlers run in registration order with the session lock held. The first
/// one returning `true` ends the chain.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, session: &Session, request: &Request, response: &mut Response) -> anyhow::Result<bool>;

    /// Write a custom response for a request whose session has expired.
    /// Returns `true` if the response was written.
    fn handle_session_expired(&self, _request: &Request, _response: &mut Response) -> bool {
        false
    }
}

impl<F> RequestHandler for F
where
    F: Fn(&Session, &Request, &mut Response) -> anyhow::Result<bool> + Send + Sync,
{
    fn handle(&self, session: &Session, request: &Request, response: &mut Response) -> anyhow::Result<bool> {
        self(session, request, response)
    }
}

/// Creates the push connection for a newly created UI.
pub type PushConnectionFactory =
    Arc<dyn Fn(&Session, &Ui) -> Option<Arc<dyn PushConnection>> + Send + Sync>;

/// Refreshes UI heartbeats.
///
/// Heartbeat requests end here. UIDL requests count as a heartbeat too but
/// continue down the chain.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeartbeatHandler;

impl RequestHandler for HeartbeatHandler {
    fn handle(&self, session: &Session, request: &Request, response: &mut Response) -> anyhow::Result<bool> {
        match request.kind {
            RequestKind::Heartbeat { ui } => {
                match session.ui(ui)? {
                    Some(target) => target.heartbeat()?,
                    None => response.set(ResponseStatus::Gone, format!("UI {ui} not found")),
                }
                Ok(true)
            }
            RequestKind::Uidl { ui } => {
                if let Some(target) = session.ui(ui)? {
                    target.heartbeat()?;
                }
                Ok(false)
            }
            _ => Ok(false),
        }
    }
}

/// Creates a UI for bootstrap requests and answers with its id.
pub struct InitHandler {
    push_mode: PushMode,
    push_factory: Arc<RwLock<Option<PushConnectionFactory>>>,
}

impl InitHandler {
    pub fn new(push_mode: PushMode, push_factory: Arc<RwLock<Option<PushConnectionFactory>>>) -> Self {
        Self { push_mode, push_factory }
    }
}

impl RequestHandler for InitHandler {
    fn handle(&self, session: &Session, request: &Request, response: &mut Response) -> anyhow::Result<bool> {
        if request.kind != RequestKind::Init {
            return Ok(false);
        }
        let ui = session.create_ui(self.push_mode)?;
        let factory = self.push_factory.read().clone();
        if let Some(factory) = factory {
            if let Some(connection) = factory(session, &ui) {
                ui.set_push_connection(Some(connection))?;
            }
        }
        ui.heartbeat()?;
        response.set(ResponseStatus::Ok, ui.id().to_string());
        Ok(true)
    }
}

fn normalize(tag: &str) -> String {
    tag.replace('_', "-").to_ascii_lowercase()
}

fn language(tag: &str) -> &str {
    tag.split(['-', '_']).next().unwrap_or(tag)
}

/// Pick the session locale for a client.
///
/// With a single provided locale that one wins. Otherwise the first exact
/// match (case-insensitive, `-` and `_` equivalent) among the client's
/// preferences, then the first language match, then the first provided
/// locale. Returns `None` when nothing is provided.
pub fn negotiate_locale(requested: &[String], provided: &[String]) -> Option<String> {
    if provided.len() == 1 {
        return provided.first().cloned();
    }
    let exact = requested.iter().find_map(|wanted| {
        let wanted = normalize(wanted);
        provided.iter().find(|p| normalize(p) == wanted)
    });
    if let Some(found) = exact {
        return Some(found.clone());
    }

    let by_language = requested.iter().find_map(|wanted| {
        let wanted = language(wanted).to_ascii_lowercase();
        provided
            .iter()
            .find(|p| language(p).eq_ignore_ascii_case(&wanted))
    });
    by_language.or_else(|| provided.first()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn only_init_and_other_requests_create_sessions() {
        assert!(RequestKind::Init.can_create_session());
        assert!(RequestKind::Other("/files".into()).can_create_session());
        assert!(!RequestKind::Uidl { ui: 0 }.can_create_session());
        assert!(!RequestKind::Heartbeat { ui: 0 }.can_create_session());
    }

    #[test]
    fn status_codes() {
        assert_eq!(ResponseStatus::Ok.code(), 200);
        assert_eq!(ResponseStatus::NotFound.code(), 404);
        assert_eq!(ResponseStatus::SessionExpired.code(), 410);
        assert_eq!(ResponseStatus::InternalError.code(), 500);
    }

    #[test]
    fn request_builders() {
        let id = TransportSessionId::new();
        let req = Request::heartbeat(id, 3).with_parameter(CLOSE_APPLICATION_PARAMETER, "");
        assert_eq!(req.transport, Some(id));
        assert_eq!(req.kind.ui(), Some(3));
        assert!(req.kind.is_heartbeat());
        assert!(req.has_parameter(CLOSE_APPLICATION_PARAMETER));
        assert!(!req.has_parameter(RESTART_APPLICATION_PARAMETER));
    }

    #[test]
    fn locale_exact_match_wins() {
        let provided = strings(&["en-US", "fi-FI", "de-DE"]);
        let requested = strings(&["fi_fi", "en-US"]);
        assert_eq!(negotiate_locale(&requested, &provided).as_deref(), Some("fi-FI"));
    }

    #[test]
    fn locale_falls_back_to_language_then_first() {
        let provided = strings(&["en-US", "fi-FI"]);
        assert_eq!(
            negotiate_locale(&strings(&["sv-SE", "fi-SE"]), &provided).as_deref(),
            Some("fi-FI")
        );
        assert_eq!(negotiate_locale(&strings(&["ja-JP"]), &provided).as_deref(), Some("en-US"));
        assert_eq!(negotiate_locale(&[], &provided).as_deref(), Some("en-US"));
    }

    #[test]
    fn locale_single_or_none_provided() {
        assert_eq!(
            negotiate_locale(&strings(&["fi-FI"]), &strings(&["de-DE"])).as_deref(),
            Some("de-DE")
        );
        assert_eq!(negotiate_locale(&strings(&["fi-FI"]), &[]), None);
    }
}
