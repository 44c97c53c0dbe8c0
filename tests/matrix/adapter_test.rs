//! `MatrixChannel` lifecycle and outbound sends.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use matrix_channel::bus::{InboundSink, OutboundMessage};
use matrix_channel::channels::matrix::events::{InboundEvent, RoomInfo, RoomInvite, SessionEvent};
use matrix_channel::channels::matrix::sync::{StopOutcome, SyncState};
use matrix_channel::channels::matrix::{
    build_text_content, MatrixChannel, CHANNEL_NAME, MATRIX_HTML_FORMAT, ROOM_MESSAGE_TYPE,
};
use matrix_channel::channels::{Channel, ChannelError};
use matrix_channel::config::MatrixConfig;
use matrix_channel::markdown::{render_html, RenderError};

use crate::support::{make_config, Call, FakeConnector, FakeSession, RecordingSink, SyncBehaviour};

struct Harness {
    _dir: tempfile::TempDir,
    session: Arc<FakeSession>,
    connector: Arc<FakeConnector>,
    sink: Arc<RecordingSink>,
    channel: MatrixChannel,
}

fn harness_with(session: Arc<FakeSession>, configure: impl FnOnce(&mut MatrixConfig)) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = make_config(dir.path());
    configure(&mut config);
    let connector = FakeConnector::new(Arc::clone(&session));
    let sink = RecordingSink::new(&session);
    let channel = MatrixChannel::new(
        config,
        Arc::clone(&sink) as Arc<dyn InboundSink>,
        Arc::clone(&connector) as Arc<dyn matrix_channel::channels::matrix::session::SessionConnector>,
    );
    Harness {
        _dir: dir,
        session,
        connector,
        sink,
        channel,
    }
}

fn harness() -> Harness {
    harness_with(FakeSession::cooperative(), |_| {})
}

fn reply(text: &str) -> OutboundMessage {
    OutboundMessage::new(CHANNEL_NAME, "!team:matrix.org", text)
}

fn failing_renderer(_: &str) -> Result<Option<String>, RenderError> {
    Err(RenderError::Pattern(
        regex::Regex::new("(").expect_err("unbalanced group is invalid"),
    ))
}

// ── Outbound ────────────────────────────────────────────────────

#[tokio::test]
async fn send_before_start_is_noop() {
    let h = harness();

    h.channel.send(&reply("hi")).await.expect("no-op");

    assert!(h.session.calls().is_empty());
}

#[tokio::test]
async fn plain_send_then_clears_typing() {
    let mut h = harness();
    h.channel.start().await.expect("start");

    h.channel.send(&reply("Hi")).await.expect("sent");

    let send = Call::Send {
        room_id: "!team:matrix.org".to_owned(),
        message_type: ROOM_MESSAGE_TYPE.to_owned(),
        content: json!({"msgtype": "m.text", "body": "Hi"}),
        ignore_unverified_devices: true,
    };
    let sent_at = h.session.position(|c| *c == send).expect("send recorded");
    let cleared_at = h
        .session
        .position(|c| matches!(c, Call::Typing { typing: false, .. }))
        .expect("typing cleared");
    assert!(sent_at < cleared_at);

    h.channel.stop().await;
}

#[tokio::test]
async fn failed_send_still_clears_typing_and_returns_error() {
    let mut h = harness();
    h.channel.start().await.expect("start");
    h.session.fail_send.store(true, Ordering::SeqCst);

    let result = h.channel.send(&reply("Hi")).await;

    assert!(matches!(result, Err(ChannelError::Session(_))));
    assert_eq!(
        h.session.typing_calls(),
        vec![("!team:matrix.org".to_owned(), false)]
    );
    let sent_at = h
        .session
        .position(|c| matches!(c, Call::Send { .. }))
        .expect("send attempted");
    let cleared_at = h
        .session
        .position(|c| matches!(c, Call::Typing { .. }))
        .expect("typing cleared");
    assert!(sent_at < cleared_at);

    h.channel.stop().await;
}

#[tokio::test]
async fn markdown_reply_carries_html_body() {
    let mut h = harness();
    h.channel.start().await.expect("start");

    h.channel.send(&reply("# Title\n\n**bold**")).await.expect("sent");

    let content = h
        .session
        .calls()
        .into_iter()
        .find_map(|c| match c {
            Call::Send { content, .. } => Some(content),
            _ => None,
        })
        .expect("send recorded");
    assert_eq!(content["body"], "# Title\n\n**bold**");
    assert_eq!(content["format"], MATRIX_HTML_FORMAT);
    let html = content["formatted_body"].as_str().expect("formatted body");
    assert!(html.contains("<h1>Title</h1>"));
    assert!(html.contains("<strong>bold</strong>"));

    h.channel.stop().await;
}

#[test]
fn render_failure_falls_back_to_plain_content() {
    let content = build_text_content("**bold**", failing_renderer);
    assert_eq!(content, json!({"msgtype": "m.text", "body": "**bold**"}));
}

#[test]
fn plain_text_has_no_formatted_body() {
    let content = build_text_content("just words", render_html);
    assert!(content.get("format").is_none());
    assert!(content.get("formatted_body").is_none());
}

#[tokio::test]
async fn custom_renderer_is_used_for_sends() {
    let dir = tempfile::tempdir().expect("tempdir");
    let session = FakeSession::cooperative();
    let connector = FakeConnector::new(Arc::clone(&session));
    let sink = RecordingSink::new(&session);
    let mut channel = MatrixChannel::new(
        make_config(dir.path()),
        sink as Arc<dyn InboundSink>,
        connector as Arc<dyn matrix_channel::channels::matrix::session::SessionConnector>,
    )
    .with_renderer(failing_renderer);
    channel.start().await.expect("start");

    channel.send(&reply("**bold**")).await.expect("sent");

    assert!(session.calls().iter().any(|c| matches!(
        c,
        Call::Send { content, .. } if content.get("formatted_body").is_none()
    )));
    channel.stop().await;
}

// ── Start ───────────────────────────────────────────────────────

#[tokio::test]
async fn start_creates_store_dir_under_data_dir() {
    let mut h = harness();

    h.channel.start().await.expect("start");

    let store_dir = h
        .connector
        .store_dir
        .lock()
        .expect("store lock")
        .clone()
        .expect("connected");
    assert!(store_dir.is_dir());
    assert_eq!(store_dir, h.channel.config().store_dir());
    assert!(h.channel.is_running());
    assert_eq!(h.channel.sync_state(), SyncState::Running);

    h.channel.stop().await;
}

#[tokio::test]
async fn start_without_device_id_skips_store_restore() {
    let mut h = harness();

    h.channel.start().await.expect("start");
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(!h.session.calls().contains(&Call::LoadStore));
    assert_eq!(h.session.sync_calls().first(), Some(&false));

    h.channel.stop().await;
}

#[tokio::test]
async fn start_with_device_id_restores_store_and_requests_full_state() {
    let mut h = harness_with(FakeSession::cooperative(), |c| c.device_id = "DEVICE".to_owned());

    h.channel.start().await.expect("start");
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(h.session.calls().first(), Some(&Call::LoadStore));
    assert_eq!(h.session.sync_calls().first(), Some(&true));

    h.channel.stop().await;
}

#[tokio::test]
async fn store_restore_failure_is_not_fatal() {
    let session = FakeSession::cooperative();
    session.fail_load_store.store(true, Ordering::SeqCst);
    let mut h = harness_with(session, |c| c.device_id = "DEVICE".to_owned());

    h.channel.start().await.expect("restore failure only warns");
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(h.session.sync_calls().first(), Some(&false));

    h.channel.stop().await;
}

#[tokio::test]
async fn unwritable_store_dir_fails_start() {
    let dir = tempfile::tempdir().expect("tempdir");
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"file").expect("write blocker");
    let mut h = harness_with(FakeSession::cooperative(), |c| c.data_dir = Some(blocker.clone()));

    let result = h.channel.start().await;

    assert!(matches!(result, Err(ChannelError::Setup(_))));
    assert!(!h.channel.is_running());
    assert!(h.session.calls().is_empty());
}

// ── Session events ──────────────────────────────────────────────

#[tokio::test]
async fn queued_events_are_handled_in_order() {
    let mut h = harness();
    h.channel.start().await.expect("start");

    let room = RoomInfo {
        room_id: "!team:matrix.org".to_owned(),
        display_name: Some("Team".to_owned()),
        member_count: Some(3),
    };
    for body in ["one", "two"] {
        h.connector
            .push(SessionEvent::Message {
                room: room.clone(),
                event: InboundEvent {
                    sender: "@alice:matrix.org".to_owned(),
                    body: body.to_owned(),
                    mentions: None,
                },
            })
            .await;
    }
    h.connector
        .push(SessionEvent::Invite(RoomInvite {
            room_id: "!new:matrix.org".to_owned(),
            sender: "@alice:matrix.org".to_owned(),
        }))
        .await;

    // Stop drains nothing further but everything queued before it was handled.
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.channel.stop().await;

    let bodies: Vec<String> = h.sink.messages().into_iter().map(|m| m.content).collect();
    assert_eq!(bodies, vec!["one".to_owned(), "two".to_owned()]);
    assert!(h
        .session
        .calls()
        .contains(&Call::Join("!new:matrix.org".to_owned())));
}

// ── Stop ────────────────────────────────────────────────────────

#[tokio::test]
async fn stop_before_start_is_noop() {
    let mut h = harness();

    assert_eq!(h.channel.shutdown().await, StopOutcome::NotRunning);
    assert_eq!(h.channel.shutdown().await, StopOutcome::NotRunning);
    assert!(h.session.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_is_graceful_and_closes_after_stop_sync() {
    let mut h = harness();
    h.channel.start().await.expect("start");
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(h.channel.shutdown().await, StopOutcome::Graceful);

    let stop_at = h.session.position(|c| *c == Call::StopSync).expect("stop_sync");
    let close_at = h.session.position(|c| *c == Call::Close).expect("close");
    assert!(stop_at < close_at);
    assert_eq!(h.session.calls().last(), Some(&Call::Close));
    assert_eq!(h.channel.sync_state(), SyncState::Stopped);
    assert!(!h.channel.is_running());
}

#[tokio::test(start_paused = true)]
async fn stop_twice_closes_once() {
    let mut h = harness();
    h.channel.start().await.expect("start");

    h.channel.stop().await;
    h.channel.stop().await;

    let closes = h.session.calls().iter().filter(|c| **c == Call::Close).count();
    assert_eq!(closes, 1);
}

#[tokio::test(start_paused = true)]
async fn stubborn_sync_is_forced_after_grace() {
    let mut h = harness_with(FakeSession::new(SyncBehaviour::Stubborn), |c| {
        c.sync_stop_grace_seconds = 3;
    });
    h.channel.start().await.expect("start");
    tokio::time::sleep(Duration::from_millis(10)).await;

    let started = tokio::time::Instant::now();
    let outcome = h.channel.shutdown().await;

    assert_eq!(outcome, StopOutcome::Forced);
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(h.session.calls().last(), Some(&Call::Close));
    assert_eq!(h.channel.sync_state(), SyncState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn stop_waits_at_most_one_grace_period_in_total() {
    let mut h = harness_with(FakeSession::new(SyncBehaviour::Stubborn), |c| {
        c.sync_stop_grace_seconds = 3;
    });
    h.sink.hang.store(true, Ordering::SeqCst);
    h.channel.start().await.expect("start");
    h.connector
        .push(SessionEvent::Message {
            room: RoomInfo {
                room_id: "!team:matrix.org".to_owned(),
                display_name: None,
                member_count: Some(4),
            },
            event: InboundEvent {
                sender: "@alice:matrix.org".to_owned(),
                body: "stuck".to_owned(),
                mentions: None,
            },
        })
        .await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(h.session.calls().iter().any(|c| matches!(c, Call::Publish { .. })));

    let started = tokio::time::Instant::now();
    let outcome = h.channel.shutdown().await;

    assert_eq!(outcome, StopOutcome::Forced);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3));
    assert!(elapsed < Duration::from_secs(4), "stop took {elapsed:?}");
    assert_eq!(h.session.calls().last(), Some(&Call::Close));
}

#[tokio::test]
async fn send_after_stop_is_noop() {
    let mut h = harness();
    h.channel.start().await.expect("start");
    h.channel.stop().await;
    let before = h.session.calls().len();

    h.channel.send(&reply("late")).await.expect("no-op");

    assert_eq!(h.session.calls().len(), before);
}
