//! Best-effort typing notices.
//!
//! Typing notices are cosmetic. A failure to set one must never abort
//! message processing or delivery, so [`TypingCoordinator::set_typing`]
//! discards the error after logging it at debug level.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::session::{RemoteSession, SessionError};

/// How long the server should show a typing notice before expiring it.
pub const TYPING_NOTICE_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Sets and clears the bot's typing notice on a session.
#[derive(Clone)]
pub struct TypingCoordinator {
    session: Arc<dyn RemoteSession>,
}

impl TypingCoordinator {
    /// Wrap a session.
    pub fn new(session: Arc<dyn RemoteSession>) -> Self {
        Self { session }
    }

    /// Set the typing notice, reporting failure to the caller.
    pub async fn try_set_typing(&self, room_id: &str, typing: bool) -> Result<(), SessionError> {
        self.session
            .set_typing(room_id, typing, TYPING_NOTICE_TIMEOUT)
            .await
    }

    /// Set the typing notice, ignoring failure.
    pub async fn set_typing(&self, room_id: &str, typing: bool) {
        if let Err(e) = self.try_set_typing(room_id, typing).await {
            debug!(room_id, typing, error = %e, "failed to update typing notice");
        }
    }
}

impl std::fmt::Debug for TypingCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypingCoordinator").finish_non_exhaustive()
    }
}
