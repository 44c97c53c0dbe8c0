//! The remote session seam: what the adapter needs from a Matrix client.
//!
//! A [`RemoteSession`] performs the network calls; events it observes while
//! syncing are pushed onto the `mpsc` queue handed to
//! [`SessionConnector::connect`] and drained by the adapter in order.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::events::SessionEvent;
use crate::config::MatrixConfig;

/// Error codes that mean the access token is no longer usable.
const AUTH_ERRCODES: &[&str] = &["M_UNKNOWN_TOKEN", "M_FORBIDDEN", "M_UNAUTHORIZED"];

/// Errors from a remote session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Transport-level failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with an error response.
    #[error("server error {status} {errcode}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Matrix `errcode`, e.g. `M_FORBIDDEN`.
        errcode: String,
        /// Human-readable `error` field.
        message: String,
        /// Server-initiated logout that keeps the device.
        soft_logout: bool,
    },

    /// A response body could not be decoded.
    #[error("failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),

    /// Reading or writing the local store failed.
    #[error("store error: {0}")]
    Store(#[from] std::io::Error),

    /// The homeserver URL cannot be used as an API base.
    #[error("invalid homeserver URL: {0}")]
    InvalidHomeserver(String),

    /// `stop_sync` was requested while a sync was pending.
    #[error("sync cancelled")]
    Cancelled,

    /// The session has been closed.
    #[error("session closed")]
    Closed,
}

impl SessionError {
    /// Whether this error means the credentials need rotating.
    ///
    /// True for unknown-token, forbidden and unauthorized error codes, and
    /// for any server-initiated logout.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            Self::Api {
                errcode,
                soft_logout,
                ..
            } => *soft_logout || AUTH_ERRCODES.contains(&errcode.as_str()),
            _ => false,
        }
    }
}

/// Log a failed sync, join or send response at the right severity.
///
/// Authentication failures need an operator (the token must be rotated), so
/// they are logged as errors. Everything else is left to the sync loop's
/// retry and logged low. Neither is fatal.
pub fn report_response_error(context: &str, err: &SessionError) {
    if err.is_auth_failure() {
        error!(
            context,
            error = %err,
            "Matrix authentication failed; the access token may need rotating"
        );
    } else if matches!(err, SessionError::Cancelled) {
        debug!(context, "request cancelled");
    } else {
        warn!(context, error = %err, "Matrix request failed");
    }
}

/// Network operations the adapter drives.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Restore persisted sync state from the store directory.
    async fn load_store(&self) -> Result<(), SessionError>;

    /// Long-poll once. Returns when the cursor advances, the timeout
    /// elapses, or [`stop_sync`](Self::stop_sync) is requested.
    ///
    /// `full_state` asks the server for complete room state.
    async fn sync(&self, timeout: Duration, full_state: bool) -> Result<(), SessionError>;

    /// Ask a pending or future [`sync`](Self::sync) to return promptly.
    fn stop_sync(&self);

    /// Send a room event.
    async fn send(
        &self,
        room_id: &str,
        message_type: &str,
        content: Value,
        ignore_unverified_devices: bool,
    ) -> Result<(), SessionError>;

    /// Set the bot's typing notice in a room.
    async fn set_typing(
        &self,
        room_id: &str,
        typing: bool,
        timeout: Duration,
    ) -> Result<(), SessionError>;

    /// Join a room.
    async fn join(&self, room_id: &str) -> Result<(), SessionError>;

    /// Release connection resources.
    async fn close(&self);
}

/// Opens [`RemoteSession`]s.
pub trait SessionConnector: Send + Sync {
    /// Open a session for `config`, persisting state under `store_dir` and
    /// pushing observed events onto `events`.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be constructed (e.g. a
    /// malformed homeserver URL).
    fn connect(
        &self,
        config: &MatrixConfig,
        store_dir: &Path,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Arc<dyn RemoteSession>, SessionError>;
}
