//! Session start, cancellation, relay loss and teardown

mod common;

use common::{pid, Mesh};
use meshcall_core::{
    ConnectivityState, EndReason, IncomingCallNotifier, LoopbackBehavior,
    LoopbackConnectionFactory, MediaError, MediaKind, NotificationEvent, SessionConfig,
    SessionError, SessionEvent, SessionState, SignalingMessage, SignalingTransport,
    StaticMediaSource,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn end_reason(events: Vec<SessionEvent>) -> Option<EndReason> {
    events.into_iter().find_map(|e| match e {
        SessionEvent::SessionEnded { reason } => Some(reason),
        _ => None,
    })
}

#[tokio::test]
async fn denied_media_joins_nothing() {
    let mut mesh = Mesh::new();
    mesh.join("a").await;
    let source = Arc::new(StaticMediaSource::denying(MediaError::PermissionDenied(
        "camera".into(),
    )));
    let factory = Arc::new(LoopbackConnectionFactory::new("b"));

    let res = mesh
        .add_with("b", factory.clone(), source)
        .session
        .start_session()
        .await;
    assert!(matches!(
        res,
        Err(SessionError::MediaAcquisition(MediaError::PermissionDenied(_)))
    ));
    mesh.settle().await;

    let b = &mesh.peer("b").session;
    assert_eq!(b.state(), SessionState::Initializing);
    assert_eq!(b.link_count(), 0);
    assert!(b.media_state().local_media.is_none());
    assert_eq!(factory.created_count(), 0);
    assert_eq!(mesh.peer("a").session.link_count(), 0);
    assert_eq!(mesh.relay.call_members(&mesh.project), vec![pid("a")]);
}

#[tokio::test]
async fn teardown_is_idempotent() {
    let mut mesh = Mesh::new();
    mesh.join("a").await;
    mesh.join("b").await;
    let media = mesh.peer("a").session.media_state().local_media.clone().unwrap();
    let conn = mesh.peer("a").factory.latest_connection(&pid("b")).unwrap();

    mesh.peer_mut("a").session.leave_session().await;
    mesh.peer_mut("a").session.leave_session().await;
    mesh.peer_mut("a").session.end_session_for_all().await;
    mesh.settle().await;

    let a = mesh.peer_mut("a");
    assert_eq!(a.session.state(), SessionState::Ended);
    assert_eq!(media.release_count(), 1);
    assert!(media.is_released());
    assert!(conn.is_closed());
    assert!(!a.session.is_relay_connected());

    let events = a.drain_events();
    let ended = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::SessionEnded { .. }))
        .count();
    assert_eq!(ended, 1);
    assert_eq!(end_reason(events), Some(EndReason::Left));

    // Bob saw a leave, not an end-for-all
    assert_eq!(mesh.peer("b").session.state(), SessionState::Active);
    assert_eq!(mesh.peer("b").session.link_count(), 0);
}

#[tokio::test]
async fn teardown_after_link_failure_is_idempotent() {
    let mut mesh = Mesh::new();
    mesh.join("a").await;
    mesh.join("b").await;
    mesh.join("c").await;
    let media = mesh.peer("a").session.media_state().local_media.clone().unwrap();
    let to_b = mesh.peer("a").factory.latest_connection(&pid("b")).unwrap();
    let to_c = mesh.peer("a").factory.latest_connection(&pid("c")).unwrap();

    assert!(to_b.simulate_connectivity(ConnectivityState::Failed));
    mesh.settle().await;
    assert_eq!(mesh.peer("a").session.linked_participants(), vec![pid("c")]);

    mesh.peer_mut("a").session.leave_session().await;
    mesh.peer_mut("a").session.leave_session().await;
    mesh.peer_mut("a").session.end_session_for_all().await;
    mesh.settle().await;

    let a = mesh.peer_mut("a");
    assert_eq!(a.session.state(), SessionState::Ended);
    assert_eq!(a.session.link_count(), 0);
    assert_eq!(media.release_count(), 1);
    assert!(to_b.is_closed());
    assert!(to_c.is_closed());

    let events = a.drain_events();
    let ended = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::SessionEnded { .. }))
        .count();
    assert_eq!(ended, 1);
    assert_eq!(end_reason(events), Some(EndReason::Left));
}

#[tokio::test]
async fn operations_after_end_are_rejected() {
    let mut mesh = Mesh::new();
    mesh.join("a").await;
    mesh.peer_mut("a").session.leave_session().await;

    let a = &mut mesh.peer_mut("a").session;
    assert!(matches!(
        a.toggle_media(MediaKind::Audio, false).await,
        Err(SessionError::InvalidState {
            actual: SessionState::Ended,
            ..
        })
    ));
    assert!(matches!(
        a.start_session().await,
        Err(SessionError::InvalidState { .. })
    ));
    assert!(a.announce_call("Apollo").await.is_err());
}

#[tokio::test]
async fn cancelling_handle_leaves_call() {
    let mut mesh = Mesh::new();
    mesh.join("a").await;
    mesh.join("b").await;
    let handle = mesh.peer("b").session.handle();

    handle.cancel();
    assert!(handle.is_cancelled());
    mesh.settle().await;

    let b = mesh.peer_mut("b");
    assert_eq!(b.session.state(), SessionState::Ended);
    assert_eq!(end_reason(b.drain_events()), Some(EndReason::Cancelled));
    assert_eq!(mesh.peer("a").session.link_count(), 0);
    assert_eq!(mesh.relay.call_members(&mesh.project), vec![pid("a")]);
}

#[tokio::test]
async fn cancel_aborts_in_flight_offer() {
    let mut mesh = Mesh::new();
    let factory = Arc::new(LoopbackConnectionFactory::new("a"));
    factory.set_behavior(
        "b",
        LoopbackBehavior {
            generation_delay: Some(Duration::from_millis(500)),
            ..Default::default()
        },
    );
    mesh.add_with("a", factory.clone(), Arc::new(StaticMediaSource::granting()))
        .session
        .start_session()
        .await
        .unwrap();
    mesh.add("b").session.start_session().await.unwrap();

    let handle = mesh.peer("a").session.handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
    });
    mesh.settle().await;

    assert_eq!(mesh.peer("a").session.state(), SessionState::Ended);
    assert_eq!(mesh.peer("a").session.link_count(), 0);
    let conn = factory.latest_connection(&pid("b")).unwrap();
    assert!(conn.is_closed());
    assert_eq!(conn.local_description_count(), 0);
    // Bob never received an offer
    assert_eq!(mesh.peer("b").factory.created_count(), 0);
    assert_eq!(mesh.peer("b").session.link_count(), 0);
}

#[tokio::test]
async fn relay_loss_is_reported_and_links_survive() {
    let mut mesh = Mesh::new();
    mesh.join("a").await;
    mesh.join("b").await;
    mesh.peer_mut("a").drain_events();
    assert!(mesh.peer("a").session.is_relay_connected());

    let socket = mesh.peer("a").socket_id.clone();
    mesh.relay.disconnect(&socket);
    // Receive errors are reported after the handler's backoff
    tokio::time::sleep(Duration::from_millis(150)).await;
    mesh.settle().await;

    let a = mesh.peer_mut("a");
    assert!(!a.session.is_relay_connected());
    assert_eq!(a.session.state(), SessionState::Active);
    let disconnected = a
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::RelayDisconnected { .. }))
        .count();
    assert_eq!(disconnected, 1);
    assert_eq!(
        a.session.link(&pid("b")).unwrap().state(),
        meshcall_core::LinkState::Connected
    );

    // The relay told bob that alice is gone
    assert_eq!(mesh.peer("b").session.link_count(), 0);
}

#[tokio::test]
async fn run_loop_exits_on_cancel() {
    let mut mesh = Mesh::new();
    mesh.join("a").await;
    mesh.join("b").await;

    let mut peer = mesh.peers.remove(0);
    let handle = peer.session.handle();
    let task = tokio::spawn(async move {
        let result = peer.session.run().await;
        (result, peer)
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.cancel();
    let (result, mut peer) = task.await.unwrap();

    assert!(result.is_ok());
    assert_eq!(peer.session.state(), SessionState::Ended);
    assert_eq!(end_reason(peer.drain_events()), Some(EndReason::Cancelled));

    mesh.settle().await;
    assert_eq!(mesh.peer("b").session.link_count(), 0);
}

#[tokio::test]
async fn run_loop_accepts_zero_sweep_interval() {
    let zero = r#"{"secs":0,"nanos":0}"#;
    let config: SessionConfig = serde_json::from_str(&format!(
        r#"{{"timeout_check_interval":{zero},"min_receive_interval":{zero}}}"#
    ))
    .unwrap();
    assert_eq!(config.timeout_check_interval, Duration::ZERO);
    let mut mesh = Mesh::with_config(config);
    mesh.join("a").await;
    mesh.join("b").await;

    let mut peer = mesh.peers.remove(0);
    let handle = peer.session.handle();
    let task = tokio::spawn(async move { peer.session.run().await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.cancel();
    let result = task.await.unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn call_invitation_rings_room_members() {
    let mut mesh = Mesh::new();
    mesh.join("a").await;
    let watcher = mesh.relay.connect(&mesh.project);
    let mut notifier = IncomingCallNotifier::new(mesh.project.clone(), pid("z"));

    mesh.peer("a").session.announce_call("Apollo").await.unwrap();

    let message = watcher.receive_message().await.unwrap();
    match notifier.handle(&message) {
        Some(NotificationEvent::Ringing(invitation)) => {
            assert_eq!(invitation.caller_id, pid("a"));
            assert_eq!(invitation.project_name, "Apollo");
        }
        other => unreachable!("expected ringing, got {other:?}"),
    }

    mesh.peer_mut("a").session.end_session_for_all().await;
    let message = watcher.receive_message().await.unwrap();
    assert!(matches!(message, SignalingMessage::CallEnded(_)));
    assert!(matches!(
        notifier.handle(&message),
        Some(NotificationEvent::Cancelled(_))
    ));
    assert!(notifier.ringing().is_none());
}
