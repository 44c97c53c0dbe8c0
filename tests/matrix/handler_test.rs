//! Inbound handling: self-echo guard, admission, typing and invites.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use matrix_channel::bus::InboundSink;
use matrix_channel::channels::matrix::events::{InboundEvent, RoomInfo, RoomInvite, SessionEvent};
use matrix_channel::channels::matrix::session::RemoteSession;
use matrix_channel::channels::matrix::typing::TYPING_NOTICE_TIMEOUT;
use matrix_channel::channels::matrix::{InboundHandler, CHANNEL_NAME, ROOM_METADATA_KEY};
use matrix_channel::channels::ChannelError;
use matrix_channel::config::{GroupPolicy, MatrixConfig};

use crate::support::{make_config, Call, FakeSession, RecordingSink, BOT};

struct Harness {
    session: Arc<FakeSession>,
    sink: Arc<RecordingSink>,
    handler: InboundHandler,
}

fn harness(configure: impl FnOnce(&mut MatrixConfig)) -> Harness {
    let mut config = make_config(std::path::Path::new("/nonexistent"));
    configure(&mut config);
    let session = FakeSession::cooperative();
    let sink = RecordingSink::new(&session);
    let handler = InboundHandler::new(
        Arc::new(config),
        Arc::clone(&session) as Arc<dyn RemoteSession>,
        Arc::clone(&sink) as Arc<dyn InboundSink>,
    );
    Harness {
        session,
        sink,
        handler,
    }
}

fn team_room() -> RoomInfo {
    RoomInfo {
        room_id: "!team:matrix.org".to_owned(),
        display_name: Some("Team".to_owned()),
        member_count: Some(5),
    }
}

fn text(sender: &str, body: &str) -> InboundEvent {
    InboundEvent {
        sender: sender.to_owned(),
        body: body.to_owned(),
        mentions: None,
    }
}

#[tokio::test]
async fn admitted_message_sets_typing_then_publishes() {
    let h = harness(|_| {});

    h.handler
        .on_message(&team_room(), &text("@alice:matrix.org", "hello"))
        .await
        .expect("handled");

    assert_eq!(
        h.session.calls(),
        vec![
            Call::Typing {
                room_id: "!team:matrix.org".to_owned(),
                typing: true,
                timeout: TYPING_NOTICE_TIMEOUT,
            },
            Call::Publish {
                sender_id: "@alice:matrix.org".to_owned(),
                chat_id: "!team:matrix.org".to_owned(),
            },
        ]
    );

    let messages = h.sink.messages();
    assert_eq!(messages.len(), 1);
    let msg = &messages[0];
    assert_eq!(msg.channel, CHANNEL_NAME);
    assert_eq!(msg.content, "hello");
    assert_eq!(msg.metadata.get(ROOM_METADATA_KEY).map(String::as_str), Some("Team"));
}

#[tokio::test]
async fn room_metadata_falls_back_to_room_id() {
    let h = harness(|_| {});
    let room = RoomInfo {
        room_id: "!anon:matrix.org".to_owned(),
        display_name: None,
        member_count: Some(4),
    };

    h.handler
        .on_message(&room, &text("@alice:matrix.org", "hi"))
        .await
        .expect("handled");

    let messages = h.sink.messages();
    assert_eq!(
        messages[0].metadata.get(ROOM_METADATA_KEY).map(String::as_str),
        Some("!anon:matrix.org")
    );
}

static ADMISSION_CHECKS: AtomicUsize = AtomicUsize::new(0);

fn counting_admission(_: &MatrixConfig, _: &RoomInfo, _: &InboundEvent) -> bool {
    ADMISSION_CHECKS.fetch_add(1, Ordering::SeqCst);
    true
}

#[tokio::test]
async fn own_messages_skip_policy_and_side_effects() {
    let session = FakeSession::cooperative();
    let sink = RecordingSink::new(&session);
    let handler = InboundHandler::with_admission(
        Arc::new(make_config(std::path::Path::new("/nonexistent"))),
        Arc::clone(&session) as Arc<dyn RemoteSession>,
        Arc::clone(&sink) as Arc<dyn InboundSink>,
        counting_admission,
    );

    handler
        .on_message(&team_room(), &text(BOT, "echo"))
        .await
        .expect("handled");

    assert_eq!(ADMISSION_CHECKS.load(Ordering::SeqCst), 0);
    assert!(session.calls().is_empty());
    assert!(sink.messages().is_empty());

    // Anyone else goes through the check.
    handler
        .on_message(&team_room(), &text("@alice:matrix.org", "hello"))
        .await
        .expect("handled");
    assert_eq!(ADMISSION_CHECKS.load(Ordering::SeqCst), 1);
    assert_eq!(sink.messages().len(), 1);
}

#[tokio::test]
async fn denied_sender_has_no_side_effects() {
    let h = harness(|c| c.allow_from = vec!["@bob:matrix.org".to_owned()]);

    h.handler
        .on_message(&team_room(), &text("@alice:matrix.org", "hello"))
        .await
        .expect("handled");

    assert!(h.session.calls().is_empty());
    assert!(h.sink.messages().is_empty());
}

#[tokio::test]
async fn unmentioned_group_message_is_dropped_under_mention_policy() {
    let h = harness(|c| c.group_policy = GroupPolicy::Mention);

    h.handler
        .on_message(&team_room(), &text("@alice:matrix.org", "hello bot"))
        .await
        .expect("handled");

    assert!(h.session.typing_calls().is_empty());
    assert!(h.sink.messages().is_empty());
}

#[tokio::test]
async fn publish_failure_clears_typing_before_returning() {
    let h = harness(|_| {});
    h.sink.fail.store(true, Ordering::SeqCst);

    let result = h
        .handler
        .on_message(&team_room(), &text("@alice:matrix.org", "hello"))
        .await;

    assert!(matches!(result, Err(ChannelError::Bus(_))));
    assert_eq!(
        h.session.typing_calls(),
        vec![
            ("!team:matrix.org".to_owned(), true),
            ("!team:matrix.org".to_owned(), false),
        ]
    );
    let publish = h
        .session
        .position(|c| matches!(c, Call::Publish { .. }))
        .expect("publish attempted");
    let cleared = h
        .session
        .position(|c| matches!(c, Call::Typing { typing: false, .. }))
        .expect("typing cleared");
    assert!(publish < cleared);
}

#[tokio::test]
async fn typing_failure_does_not_block_publish() {
    let h = harness(|_| {});
    h.session.fail_typing.store(true, Ordering::SeqCst);

    h.handler
        .on_message(&team_room(), &text("@alice:matrix.org", "hello"))
        .await
        .expect("typing errors are swallowed");

    assert_eq!(h.sink.messages().len(), 1);
}

#[tokio::test]
async fn custom_admission_check_is_used() {
    fn reject_all(_: &MatrixConfig, _: &RoomInfo, _: &InboundEvent) -> bool {
        false
    }

    let session = FakeSession::cooperative();
    let sink = RecordingSink::new(&session);
    let handler = InboundHandler::with_admission(
        Arc::new(make_config(std::path::Path::new("/nonexistent"))),
        Arc::clone(&session) as Arc<dyn RemoteSession>,
        Arc::clone(&sink) as Arc<dyn InboundSink>,
        reject_all,
    );

    handler
        .on_message(&team_room(), &text("@alice:matrix.org", "hello"))
        .await
        .expect("handled");

    assert!(session.calls().is_empty());
}

fn invite(sender: &str) -> RoomInvite {
    RoomInvite {
        room_id: "!new:matrix.org".to_owned(),
        sender: sender.to_owned(),
    }
}

#[tokio::test]
async fn invite_with_empty_allowlist_joins() {
    let h = harness(|_| {});

    h.handler.on_invite(&invite("@alice:matrix.org")).await;

    assert_eq!(h.session.calls(), vec![Call::Join("!new:matrix.org".to_owned())]);
}

#[tokio::test]
async fn invite_from_disallowed_sender_is_ignored() {
    let h = harness(|c| c.allow_from = vec!["@bob:matrix.org".to_owned()]);

    h.handler.on_invite(&invite("@alice:matrix.org")).await;
    assert!(h.session.calls().is_empty());

    h.handler.on_invite(&invite("@bob:matrix.org")).await;
    assert_eq!(h.session.calls(), vec![Call::Join("!new:matrix.org".to_owned())]);
}

#[tokio::test]
async fn join_failure_is_not_fatal() {
    let h = harness(|_| {});
    h.session.fail_join.store(true, Ordering::SeqCst);

    h.handler
        .handle(SessionEvent::Invite(invite("@alice:matrix.org")))
        .await
        .expect("join errors are logged, not returned");

    assert_eq!(h.session.calls(), vec![Call::Join("!new:matrix.org".to_owned())]);
}
