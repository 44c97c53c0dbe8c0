//! Matrix channel adapter.
//!
//! [`MatrixChannel::start`] opens a [`RemoteSession`], spawns one task that
//! drains the session's event queue in order and one [`SyncLoop`] task that
//! drives the long-poll. Inbound messages pass the self-message guard and the
//! admission policy, switch the typing notice on, and are published to the
//! bus. [`MatrixChannel::send`] clears the typing notice after every send
//! attempt, successful or not.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{InboundMessage, InboundSink, OutboundMessage};
use crate::channels::{is_sender_allowed, Channel, ChannelError};
use crate::config::MatrixConfig;
use crate::markdown::{render_html, Renderer};

pub mod client;
pub mod events;
pub mod policy;
pub mod session;
pub mod sync;
pub mod typing;

use self::events::{InboundEvent, RoomInfo, RoomInvite, SessionEvent};
use self::policy::{should_process, AdmissionCheck};
use self::session::{report_response_error, RemoteSession, SessionConnector};
use self::sync::{StopOutcome, SyncLoop, SyncState};
use self::typing::TypingCoordinator;

/// Channel tag for routing.
pub const CHANNEL_NAME: &str = "matrix";

/// `format` value for HTML message bodies.
pub const MATRIX_HTML_FORMAT: &str = "org.matrix.custom.html";

/// Event type for room messages.
pub const ROOM_MESSAGE_TYPE: &str = "m.room.message";

/// Metadata key holding the room display name.
pub const ROOM_METADATA_KEY: &str = "room";

/// Buffer between the session and the event consumer.
const EVENT_QUEUE_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Inbound handling
// ---------------------------------------------------------------------------

/// Handles events pushed by the session: admission, typing, bus publish,
/// and auto-join on invite.
#[derive(Clone)]
pub struct InboundHandler {
    config: Arc<MatrixConfig>,
    session: Arc<dyn RemoteSession>,
    typing: TypingCoordinator,
    inbound: Arc<dyn InboundSink>,
    admission: AdmissionCheck,
}

impl std::fmt::Debug for InboundHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundHandler")
            .field("user_id", &self.config.user_id)
            .finish_non_exhaustive()
    }
}

impl InboundHandler {
    /// Build a handler using the default admission policy.
    pub fn new(
        config: Arc<MatrixConfig>,
        session: Arc<dyn RemoteSession>,
        inbound: Arc<dyn InboundSink>,
    ) -> Self {
        Self::with_admission(config, session, inbound, should_process)
    }

    /// Build a handler with a substitute admission check.
    pub fn with_admission(
        config: Arc<MatrixConfig>,
        session: Arc<dyn RemoteSession>,
        inbound: Arc<dyn InboundSink>,
        admission: AdmissionCheck,
    ) -> Self {
        Self {
            typing: TypingCoordinator::new(Arc::clone(&session)),
            config,
            session,
            inbound,
            admission,
        }
    }

    /// Dispatch one session event.
    pub async fn handle(&self, event: SessionEvent) -> Result<(), ChannelError> {
        match event {
            SessionEvent::Message { room, event } => self.on_message(&room, &event).await,
            SessionEvent::Invite(invite) => {
                self.on_invite(&invite).await;
                Ok(())
            }
        }
    }

    /// Admit and publish a room message.
    ///
    /// The typing notice goes on before publishing and stays on until the
    /// reply is sent. If publishing fails it is cleared before the error is
    /// returned.
    pub async fn on_message(&self, room: &RoomInfo, event: &InboundEvent) -> Result<(), ChannelError> {
        // Self-echo guard. Exact user id match, so every device of the bot
        // account is suppressed.
        if event.sender == self.config.user_id {
            return Ok(());
        }

        if !(self.admission)(&self.config, room, event) {
            debug!(
                sender = %event.sender,
                room_id = %room.room_id,
                "message not admitted by policy"
            );
            return Ok(());
        }

        self.typing.set_typing(&room.room_id, true).await;

        let msg = InboundMessage {
            channel: CHANNEL_NAME.to_owned(),
            sender_id: event.sender.clone(),
            chat_id: room.room_id.clone(),
            content: event.body.clone(),
            timestamp: Utc::now(),
            metadata: HashMap::from([(ROOM_METADATA_KEY.to_owned(), room.label().to_owned())]),
        };

        if let Err(e) = self.inbound.publish_inbound(msg).await {
            self.typing.set_typing(&room.room_id, false).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Join the invited room if the inviter is allowed.
    pub async fn on_invite(&self, invite: &RoomInvite) {
        if !is_sender_allowed(&self.config.allow_from, &invite.sender) {
            info!(
                room_id = %invite.room_id,
                sender = %invite.sender,
                "ignoring invite from sender outside allow_from"
            );
            return;
        }

        match self.session.join(&invite.room_id).await {
            Ok(()) => info!(room_id = %invite.room_id, sender = %invite.sender, "joined room on invite"),
            Err(e) => report_response_error("join", &e),
        }
    }
}

/// Drain session events in order until the queue closes or stop is signalled.
///
/// Stop is only observed between events, so a handler is never cut off
/// between setting and clearing a typing notice.
async fn run_event_consumer(
    handler: InboundHandler,
    mut events: mpsc::Receiver<SessionEvent>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                if let Err(e) = handler.handle(event).await {
                    warn!(error = %e, "failed to handle Matrix event");
                }
            }
        }
    }
    debug!("Matrix event consumer stopped");
}

// ---------------------------------------------------------------------------
// Outbound content
// ---------------------------------------------------------------------------

/// Build `m.text` content, adding an HTML body when the renderer yields one.
///
/// Render failures fall back to plain text.
pub fn build_text_content(text: &str, renderer: Renderer) -> Value {
    let mut content = json!({"msgtype": "m.text", "body": text});
    match renderer(text) {
        Ok(Some(html)) => {
            content["format"] = Value::from(MATRIX_HTML_FORMAT);
            content["formatted_body"] = Value::from(html);
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "markdown render failed, sending plain text"),
    }
    content
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// The live connection. Exists only between `start` and `stop`.
struct SessionHandle {
    session: Arc<dyn RemoteSession>,
    typing: TypingCoordinator,
    consumer_stop: watch::Sender<bool>,
    consumer: JoinHandle<()>,
}

/// Matrix adapter implementing [`Channel`].
pub struct MatrixChannel {
    config: Arc<MatrixConfig>,
    inbound: Arc<dyn InboundSink>,
    connector: Arc<dyn SessionConnector>,
    admission: AdmissionCheck,
    renderer: Renderer,
    handle: Option<SessionHandle>,
    sync_loop: SyncLoop,
}

impl std::fmt::Debug for MatrixChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixChannel")
            .field("config", &self.config)
            .field("sync_state", &self.sync_loop.state())
            .finish_non_exhaustive()
    }
}

impl MatrixChannel {
    /// Create an adapter using the default policy and markdown renderer.
    pub fn new(
        config: MatrixConfig,
        inbound: Arc<dyn InboundSink>,
        connector: Arc<dyn SessionConnector>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            inbound,
            connector,
            admission: should_process,
            renderer: render_html,
            handle: None,
            sync_loop: SyncLoop::new(),
        }
    }

    /// Replace the outbound text renderer.
    #[must_use]
    pub fn with_renderer(mut self, renderer: Renderer) -> Self {
        self.renderer = renderer;
        self
    }

    /// Replace the admission check.
    #[must_use]
    pub fn with_admission(mut self, admission: AdmissionCheck) -> Self {
        self.admission = admission;
        self
    }

    /// Adapter configuration.
    pub fn config(&self) -> &MatrixConfig {
        &self.config
    }

    /// Whether a session is open.
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Lifecycle state of the sync loop.
    pub fn sync_state(&self) -> SyncState {
        self.sync_loop.state()
    }

    /// Open the session and start the background tasks.
    ///
    /// Only local setup failures are fatal. A missing device id or a store
    /// that cannot be restored disables cursor persistence with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Setup`] if the store directory cannot be
    /// created, or [`ChannelError::Session`] if the session cannot be built.
    pub async fn start_session(&mut self) -> Result<(), ChannelError> {
        if self.handle.is_some() {
            warn!("Matrix channel already started");
            return Ok(());
        }

        let store_dir = self.config.store_dir();
        tokio::fs::create_dir_all(&store_dir).await.map_err(|e| {
            ChannelError::Setup(format!(
                "failed to create store directory {}: {e}",
                store_dir.display()
            ))
        })?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let session = self.connector.connect(&self.config, &store_dir, events_tx)?;

        let restored = if self.config.device_id.trim().is_empty() {
            warn!("matrix.device_id not set; sync cursor persistence disabled");
            false
        } else {
            match session.load_store().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "failed to restore Matrix store; sync cursor persistence disabled");
                    false
                }
            }
        };

        let handler = InboundHandler::with_admission(
            Arc::clone(&self.config),
            Arc::clone(&session),
            Arc::clone(&self.inbound),
            self.admission,
        );
        let (consumer_stop, consumer_stop_rx) = watch::channel(false);
        let consumer = tokio::spawn(run_event_consumer(handler, events_rx, consumer_stop_rx));

        self.sync_loop.start(Arc::clone(&session), restored);
        self.handle = Some(SessionHandle {
            typing: TypingCoordinator::new(Arc::clone(&session)),
            session,
            consumer_stop,
            consumer,
        });

        info!(
            user_id = %self.config.user_id,
            homeserver = %self.config.homeserver,
            restored,
            "Matrix channel started"
        );
        Ok(())
    }

    /// Stop the background tasks and close the session.
    ///
    /// Both tasks share one `sync_stop_grace_seconds` budget: the event
    /// consumer is signalled first and drains while the sync loop winds
    /// down, then gets whatever budget the sync loop left before it is
    /// cancelled. The session is closed only after both tasks have ended.
    /// Calling this on a stopped adapter does nothing.
    pub async fn shutdown(&mut self) -> StopOutcome {
        let Some(handle) = self.handle.take() else {
            debug!("Matrix channel not running");
            return StopOutcome::NotRunning;
        };
        let grace = self.config.sync_stop_grace();
        let started = tokio::time::Instant::now();

        let _ = handle.consumer_stop.send(true);
        let outcome = self.sync_loop.stop(handle.session.as_ref(), grace).await;
        let remaining = grace.saturating_sub(started.elapsed());
        stop_consumer(handle.consumer, remaining).await;

        handle.session.close().await;
        self.sync_loop.mark_stopped();

        info!(?outcome, "Matrix channel stopped");
        outcome
    }

    /// Send a reply to a room.
    ///
    /// Does nothing when no session is open. The typing notice is cleared
    /// after the attempt either way; a send failure is returned afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Session`] if the server rejected the send.
    pub async fn send_message(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
        let Some(handle) = &self.handle else {
            debug!(chat_id = %msg.chat_id, "Matrix channel not running, dropping outbound message");
            return Ok(());
        };

        let content = build_text_content(&msg.content, self.renderer);
        let result = handle
            .session
            .send(&msg.chat_id, ROOM_MESSAGE_TYPE, content, true)
            .await;

        handle.typing.set_typing(&msg.chat_id, false).await;

        result.map_err(|e| {
            report_response_error("send", &e);
            ChannelError::Session(e)
        })
    }
}

/// Wait up to `grace` for the signalled event consumer before aborting it.
async fn stop_consumer(mut consumer: JoinHandle<()>, grace: Duration) {
    if tokio::time::timeout(grace, &mut consumer).await.is_err() {
        warn!("Matrix event consumer did not stop in time, cancelling");
        consumer.abort();
        let _ = consumer.await;
    }
}

#[async_trait]
impl Channel for MatrixChannel {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    async fn start(&mut self) -> Result<(), ChannelError> {
        self.start_session().await
    }

    async fn stop(&mut self) {
        self.shutdown().await;
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
        self.send_message(msg).await
    }
}
