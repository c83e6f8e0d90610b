//! Server-side session runtime.
//!
//! Each connected client is represented by a [`session::Session`] that only
//! one thread may touch at a time. Requests go through
//! [`service::SessionService::handle_request`], which runs the handler chain
//! with the session lock held. Work from other threads is submitted with
//! [`session::Session::access`] and runs when the lock is next released.
//! A liveness sweep at the end of every request reclaims UIs and sessions
//! whose clients went away.

pub mod access;
pub mod config;
pub mod error;
pub mod liveness;
pub mod lock;
pub mod reaper;
pub mod request;
pub mod service;
pub mod session;
pub mod transport;
pub mod ui;

pub use access::{AccessHandle, TaskStatus};
pub use config::RuntimeConfig;
pub use error::{AccessError, ErrorEvent, ErrorHandler, SessionError};
pub use request::{Request, RequestHandler, RequestKind, Response, ResponseStatus};
pub use service::SessionService;
pub use session::{Session, SessionEvent, SessionState};
pub use ui::{PushConnection, PushMode, Ui, UiId};
