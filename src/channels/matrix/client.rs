//! HTTP client for the Matrix client-server API.
//!
//! Implements [`RemoteSession`] with reqwest. Each `sync` is one long-poll
//! `GET /sync`; text messages and invites found in the response are pushed
//! onto the adapter's event queue in delivery order. The `next_batch` cursor
//! is persisted under the store directory once the store has been loaded.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use super::events::{InboundEvent, Mentions, RoomInfo, RoomInvite, SessionEvent};
use super::session::{RemoteSession, SessionConnector, SessionError};
use crate::config::MatrixConfig;

/// HTTP connect timeout.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Timeout for non-sync requests.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Extra seconds on top of the long-poll timeout so the socket stays open
/// while the server holds the request.
const SYNC_TIMEOUT_MARGIN_SECS: u64 = 10;

// ---------------------------------------------------------------------------
// Wire types (subset)
// ---------------------------------------------------------------------------

/// Error body returned by the homeserver.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errcode: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    soft_logout: bool,
}

#[derive(Debug, Deserialize)]
struct SyncResponse {
    next_batch: String,
    #[serde(default)]
    rooms: Rooms,
}

#[derive(Debug, Default, Deserialize)]
struct Rooms {
    #[serde(default)]
    join: HashMap<String, JoinedRoom>,
    #[serde(default)]
    invite: HashMap<String, InvitedRoom>,
}

#[derive(Debug, Default, Deserialize)]
struct JoinedRoom {
    #[serde(default)]
    summary: RoomSummary,
    #[serde(default)]
    state: EventList,
    #[serde(default)]
    timeline: EventList,
}

#[derive(Debug, Default, Deserialize)]
struct RoomSummary {
    #[serde(rename = "m.joined_member_count")]
    joined_member_count: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct InvitedRoom {
    #[serde(default)]
    invite_state: EventList,
}

#[derive(Debug, Default, Deserialize)]
struct EventList {
    #[serde(default)]
    events: Vec<RawEvent>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    sender: String,
    #[serde(default)]
    state_key: Option<String>,
    #[serde(default)]
    content: Value,
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Per-room facts accumulated across syncs.
#[derive(Debug, Default, Clone)]
struct RoomCache {
    name: Option<String>,
    alias: Option<String>,
    /// Latest `m.joined_member_count` from a room summary.
    summary_count: Option<u64>,
    /// Joined user ids seen in `m.room.member` events.
    members: HashSet<String>,
    /// Whether any membership event has been applied.
    members_known: bool,
}

impl RoomCache {
    /// Joined member count: the server summary when sent, else the count
    /// of tracked memberships, else unknown.
    fn member_count(&self) -> Option<u64> {
        self.summary_count.or_else(|| {
            self.members_known
                .then(|| u64::try_from(self.members.len()).unwrap_or(u64::MAX))
        })
    }
}

/// Mutable sync state.
#[derive(Debug, Default)]
struct SyncState {
    next_batch: Option<String>,
    persist: bool,
    rooms: HashMap<String, RoomCache>,
}

/// A Matrix session over HTTP.
pub struct HttpSession {
    client: reqwest::Client,
    base: Url,
    user_id: String,
    access_token: String,
    cursor_path: PathBuf,
    events: mpsc::Sender<SessionEvent>,
    state: Mutex<SyncState>,
    stop_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl std::fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSession")
            .field("base", &self.base.as_str())
            .field("user_id", &self.user_id)
            .field("access_token", &"__REDACTED__")
            .finish_non_exhaustive()
    }
}

impl HttpSession {
    /// Create a session. No network traffic happens until the first call.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidHomeserver`] if the homeserver is not
    /// an absolute http(s) URL.
    pub fn new(
        config: &MatrixConfig,
        store_dir: &Path,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Self, SessionError> {
        let base = Url::parse(&config.homeserver)
            .map_err(|e| SessionError::InvalidHomeserver(format!("{}: {e}", config.homeserver)))?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(SessionError::InvalidHomeserver(config.homeserver.clone()));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            client,
            base,
            user_id: config.user_id.clone(),
            access_token: config.access_token.clone(),
            cursor_path: cursor_path(store_dir, &config.device_id),
            events,
            state: Mutex::new(SyncState::default()),
            stop_tx,
            closed: AtomicBool::new(false),
        })
    }

    /// Build `<homeserver>/_matrix/client/v3/<segments...>`, encoding each segment.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .extend(["_matrix", "client", "v3"])
                .extend(segments);
        }
        url
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    /// Run a non-sync request and decode any error body.
    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<Value, SessionError> {
        self.ensure_open()?;
        let resp = request
            .bearer_auth(&self.access_token)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .send()
            .await?;
        decode_response(resp).await
    }

    /// Apply one sync response: update room caches, emit events, advance the
    /// cursor.
    async fn apply_sync(&self, response: SyncResponse) {
        let mut emitted = Vec::new();
        {
            let mut state = self.state.lock().await;
            // The first sync without a cursor only primes room state; its
            // timeline is history the bot has not been asked about.
            let emit_messages = state.next_batch.is_some();

            for (room_id, joined) in response.rooms.join {
                let cache = state.rooms.entry(room_id.clone()).or_default();
                if let Some(count) = joined.summary.joined_member_count {
                    cache.summary_count = Some(count);
                }
                for event in &joined.state.events {
                    apply_state_event(cache, event);
                }
                for event in &joined.timeline.events {
                    apply_state_event(cache, event);
                    if !emit_messages || event.kind != "m.room.message" {
                        continue;
                    }
                    if let Some(inbound) = text_message(event) {
                        emitted.push(SessionEvent::Message {
                            room: RoomInfo {
                                room_id: room_id.clone(),
                                display_name: cache.name.clone().or_else(|| cache.alias.clone()),
                                member_count: cache.member_count(),
                            },
                            event: inbound,
                        });
                    }
                }
            }

            for (room_id, invited) in response.rooms.invite {
                let inviter = invited.invite_state.events.iter().find(|e| {
                    e.kind == "m.room.member"
                        && e.state_key.as_deref() == Some(self.user_id.as_str())
                        && e.content.get("membership").and_then(Value::as_str) == Some("invite")
                });
                if let Some(inviter) = inviter {
                    emitted.push(SessionEvent::Invite(RoomInvite {
                        room_id,
                        sender: inviter.sender.clone(),
                    }));
                }
            }

            state.next_batch = Some(response.next_batch.clone());
            if state.persist {
                if let Err(e) = tokio::fs::write(&self.cursor_path, &response.next_batch).await {
                    warn!(error = %e, path = %self.cursor_path.display(), "failed to persist sync cursor");
                }
            }
        }

        for event in emitted {
            if self.events.send(event).await.is_err() {
                debug!("event consumer gone, dropping remaining sync events");
                break;
            }
        }
    }
}

/// Cursor file for a device within the store directory.
fn cursor_path(store_dir: &Path, device_id: &str) -> PathBuf {
    let device = if device_id.trim().is_empty() {
        "default"
    } else {
        device_id.trim()
    };
    store_dir.join(format!("{device}.next_batch"))
}

/// Turn a non-2xx response into [`SessionError::Api`], otherwise parse JSON.
async fn decode_response(resp: reqwest::Response) -> Result<Value, SessionError> {
    let status = resp.status();
    let bytes = resp.bytes().await?;
    if status.is_success() {
        if bytes.is_empty() {
            return Ok(json!({}));
        }
        return Ok(serde_json::from_slice(&bytes)?);
    }
    let body: ErrorBody = serde_json::from_slice(&bytes).unwrap_or_default();
    Err(SessionError::Api {
        status: status.as_u16(),
        errcode: body.errcode,
        message: body.error,
        soft_logout: body.soft_logout,
    })
}

/// Record room name, alias and membership changes.
fn apply_state_event(cache: &mut RoomCache, event: &RawEvent) {
    match event.kind.as_str() {
        "m.room.member" => {
            let Some(user_id) = event.state_key.as_deref() else {
                return;
            };
            cache.members_known = true;
            if event.content.get("membership").and_then(Value::as_str) == Some("join") {
                cache.members.insert(user_id.to_owned());
            } else {
                cache.members.remove(user_id);
            }
        }
        "m.room.name" => {
            cache.name = event
                .content
                .get("name")
                .and_then(Value::as_str)
                .filter(|n| !n.is_empty())
                .map(str::to_owned);
        }
        "m.room.canonical_alias" => {
            cache.alias = event
                .content
                .get("alias")
                .and_then(Value::as_str)
                .map(str::to_owned);
        }
        _ => {}
    }
}

/// Extract an `m.text` message, ignoring other message types.
fn text_message(event: &RawEvent) -> Option<InboundEvent> {
    if event.content.get("msgtype").and_then(Value::as_str) != Some("m.text") {
        return None;
    }
    let body = event.content.get("body").and_then(Value::as_str)?;
    Some(InboundEvent {
        sender: event.sender.clone(),
        body: body.to_owned(),
        mentions: Mentions::from_content(&event.content),
    })
}

#[async_trait]
impl RemoteSession for HttpSession {
    async fn load_store(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        match tokio::fs::read_to_string(&self.cursor_path).await {
            Ok(cursor) => {
                let cursor = cursor.trim();
                if !cursor.is_empty() {
                    state.next_batch = Some(cursor.to_owned());
                }
                debug!(path = %self.cursor_path.display(), "restored sync cursor");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.cursor_path.display(), "no persisted sync cursor yet");
            }
            Err(e) => return Err(e.into()),
        }
        state.persist = true;
        Ok(())
    }

    async fn sync(&self, timeout: Duration, full_state: bool) -> Result<(), SessionError> {
        self.ensure_open()?;
        let mut stop_rx = self.stop_tx.subscribe();
        if *stop_rx.borrow() {
            return Err(SessionError::Cancelled);
        }

        let since = self.state.lock().await.next_batch.clone();
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let mut url = self.endpoint(&["sync"]);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("timeout", &timeout_ms.to_string());
            if full_state {
                query.append_pair("full_state", "true");
            }
            if let Some(since) = &since {
                query.append_pair("since", since);
            }
        }

        let request = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .timeout(timeout.saturating_add(Duration::from_secs(SYNC_TIMEOUT_MARGIN_SECS)))
            .send();

        let resp = tokio::select! {
            resp = request => resp?,
            _ = stop_rx.changed() => return Err(SessionError::Cancelled),
        };
        let body = decode_response(resp).await?;
        let response: SyncResponse = serde_json::from_value(body)?;
        self.apply_sync(response).await;
        Ok(())
    }

    fn stop_sync(&self) {
        self.stop_tx.send_replace(true);
    }

    async fn send(
        &self,
        room_id: &str,
        message_type: &str,
        content: Value,
        _ignore_unverified_devices: bool,
    ) -> Result<(), SessionError> {
        let txn_id = Uuid::new_v4().to_string();
        let url = self.endpoint(&["rooms", room_id, "send", message_type, &txn_id]);
        self.execute(self.client.put(url).json(&content)).await?;
        debug!(room_id, "message sent via Matrix");
        Ok(())
    }

    async fn set_typing(
        &self,
        room_id: &str,
        typing: bool,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let url = self.endpoint(&["rooms", room_id, "typing", &self.user_id]);
        let body = if typing {
            json!({
                "typing": true,
                "timeout": u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })
        } else {
            json!({"typing": false})
        };
        self.execute(self.client.put(url).json(&body)).await?;
        Ok(())
    }

    async fn join(&self, room_id: &str) -> Result<(), SessionError> {
        let url = self.endpoint(&["join", room_id]);
        self.execute(self.client.post(url).json(&json!({}))).await?;
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.stop_tx.send_replace(true);
        debug!("Matrix session closed");
    }
}

/// Opens [`HttpSession`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpConnector;

impl SessionConnector for HttpConnector {
    fn connect(
        &self,
        config: &MatrixConfig,
        store_dir: &Path,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Arc<dyn RemoteSession>, SessionError> {
        Ok(Arc::new(HttpSession::new(config, store_dir, events)?))
    }
}
