//! Background sync loop and its shutdown protocol.
//!
//! States: `Idle -> Running -> Stopping -> Stopped`. While running, the loop
//! long-polls the session; transient failures sleep a fixed backoff and
//! retry. `stop` first asks the session to end its poll, waits up to a grace
//! period for the task to return on its own, and only then aborts it. The
//! task is always awaited to completion before `stop` returns, so the caller
//! can release the session afterwards.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::session::{report_response_error, RemoteSession, SessionError};

/// Server-side long-poll timeout for each sync request.
pub const SYNC_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Pause between a failed sync and the next attempt.
pub const SYNC_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Lifecycle state of a [`SyncLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Never started.
    Idle,
    /// Background task is polling.
    Running,
    /// Task has been asked to stop, or has stopped and resources are not yet released.
    Stopping,
    /// Task finished and resources released.
    Stopped,
}

/// How a call to [`SyncLoop::stop`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// There was no task to stop.
    NotRunning,
    /// The task returned within the grace period.
    Graceful,
    /// The grace period elapsed and the task was aborted.
    Forced,
}

/// Owner of the background sync task.
#[derive(Debug)]
pub struct SyncLoop {
    state: SyncState,
    stop_tx: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl Default for SyncLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncLoop {
    /// A loop in the `Idle` state.
    pub fn new() -> Self {
        Self {
            state: SyncState::Idle,
            stop_tx: None,
            handle: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Whether a background task is active.
    pub fn is_running(&self) -> bool {
        self.state == SyncState::Running
    }

    /// Spawn the polling task. No-op if already running.
    ///
    /// `full_state_first` requests complete room state on the first
    /// successful poll, used after restoring a persisted cursor.
    pub fn start(&mut self, session: Arc<dyn RemoteSession>, full_state_first: bool) {
        if self.handle.is_some() {
            warn!("sync loop already running");
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        self.handle = Some(tokio::spawn(run_sync_loop(
            session,
            stop_rx,
            full_state_first,
        )));
        self.stop_tx = Some(stop_tx);
        self.state = SyncState::Running;
    }

    /// Stop the task, waiting up to `grace` before aborting it.
    ///
    /// Always awaits the task to completion. Leaves the loop in `Stopping`
    /// until [`mark_stopped`](Self::mark_stopped) records that the caller
    /// has released the session.
    pub async fn stop(&mut self, session: &dyn RemoteSession, grace: Duration) -> StopOutcome {
        let Some(mut handle) = self.handle.take() else {
            return StopOutcome::NotRunning;
        };
        self.state = SyncState::Stopping;

        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        session.stop_sync();

        match tokio::time::timeout(grace, &mut handle).await {
            Ok(joined) => {
                if let Err(e) = joined {
                    warn!(error = %e, "sync task ended abnormally");
                }
                debug!("sync loop stopped within grace period");
                StopOutcome::Graceful
            }
            Err(_) => {
                warn!(
                    grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                    "sync loop did not stop in time, cancelling"
                );
                handle.abort();
                match handle.await {
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => warn!(error = %e, "sync task ended abnormally"),
                    Ok(()) => {}
                }
                StopOutcome::Forced
            }
        }
    }

    /// Record that session resources have been released.
    pub fn mark_stopped(&mut self) {
        if self.handle.is_none() {
            self.state = SyncState::Stopped;
        }
    }
}

/// Poll until told to stop.
async fn run_sync_loop(
    session: Arc<dyn RemoteSession>,
    mut stop_rx: watch::Receiver<bool>,
    mut full_state: bool,
) {
    info!(full_state, "Matrix sync loop started");

    loop {
        if *stop_rx.borrow() {
            break;
        }

        match session.sync(SYNC_TIMEOUT, full_state).await {
            Ok(()) => full_state = false,
            Err(SessionError::Cancelled) => {
                debug!("sync cancelled");
                break;
            }
            Err(e) => {
                report_response_error("sync", &e);
                tokio::select! {
                    () = tokio::time::sleep(SYNC_RETRY_BACKOFF) => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }
    }

    info!("Matrix sync loop stopped");
}
