//! Peer link negotiation against a single loopback connection

use meshcall_core::{
    CandidateDisposition, ConnectionFactory, ConnectivityState, IceCandidate, LinkEnvelope,
    LinkEvent, LinkEventSink, LinkId, LinkRole, LinkState, LocalMediaHandle, LocalTrack,
    LoopbackBehavior, LoopbackConnection, LoopbackConnectionFactory, LoopbackOp, MediaKind,
    NegotiationError, ParticipantId, PeerLink, SessionDescription, SessionEvent,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

struct Harness {
    link: PeerLink,
    conn: Arc<LoopbackConnection>,
    link_events: mpsc::UnboundedReceiver<LinkEnvelope>,
    session_events: broadcast::Receiver<SessionEvent>,
    cancel: CancellationToken,
}

async fn harness(role: LinkRole, behavior: LoopbackBehavior) -> Harness {
    let remote = ParticipantId::from("bob");
    let factory = LoopbackConnectionFactory::new("alice").with_default_behavior(behavior);
    let (tx, link_events) = mpsc::unbounded_channel();
    let connection = factory
        .create_connection(&remote, LinkEventSink::new(LinkId(1), remote.clone(), tx))
        .await
        .unwrap();
    let conn = factory.latest_connection(&remote).unwrap();

    let (events, session_events) = broadcast::channel(64);
    let cancel = CancellationToken::new();
    let link = PeerLink::new(
        LinkId(1),
        remote,
        role,
        connection,
        cancel.child_token(),
        events,
        8,
    );
    Harness {
        link,
        conn,
        link_events,
        session_events,
        cancel,
    }
}

fn candidate(n: u16) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:bob{n} 1 udp 2122260223 127.0.0.1 {} typ host", 50000 + n),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}

fn remote_offer() -> SessionDescription {
    SessionDescription::offer("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:0\r\n")
}

fn applied(conn: &LoopbackConnection) -> Vec<String> {
    conn.applied_candidates()
        .into_iter()
        .map(|c| c.candidate)
        .collect()
}

#[tokio::test]
async fn candidates_before_offer_are_buffered_in_order() {
    let mut h = harness(LinkRole::Answerer, LoopbackBehavior::default()).await;

    for n in 1..=3 {
        let disposition = h.link.add_remote_candidate(candidate(n)).await.unwrap();
        assert_eq!(disposition, CandidateDisposition::Buffered);
    }
    assert_eq!(h.link.pending_candidates(), 3);
    assert!(h.conn.applied_candidates().is_empty());

    h.link.apply_remote_offer(remote_offer()).await.unwrap();
    // Still held until the answer is out
    assert_eq!(h.link.pending_candidates(), 3);

    h.link.create_answer().await.unwrap();
    h.link.mark_answer_sent().unwrap();
    assert_eq!(h.link.flush_candidates().await.unwrap(), 3);

    assert_eq!(
        applied(&h.conn),
        vec![
            candidate(1).candidate,
            candidate(2).candidate,
            candidate(3).candidate
        ]
    );
    assert_eq!(h.link.pending_candidates(), 0);
}

#[tokio::test]
async fn full_backlog_is_kept_and_overflow_is_an_error() {
    let mut h = harness(LinkRole::Answerer, LoopbackBehavior::default()).await;

    for n in 1..=8 {
        h.link.add_remote_candidate(candidate(n)).await.unwrap();
    }
    assert!(matches!(
        h.link.add_remote_candidate(candidate(9)).await,
        Err(NegotiationError::CandidateBacklog { limit: 8 })
    ));
    assert_eq!(h.link.pending_candidates(), 8);

    h.link.apply_remote_offer(remote_offer()).await.unwrap();
    h.link.create_answer().await.unwrap();
    h.link.mark_answer_sent().unwrap();
    assert_eq!(h.link.flush_candidates().await.unwrap(), 8);

    let expected: Vec<String> = (1..=8).map(|n| candidate(n).candidate).collect();
    assert_eq!(applied(&h.conn), expected);
}

#[tokio::test]
async fn candidate_after_description_is_applied_immediately() {
    let mut h = harness(LinkRole::Answerer, LoopbackBehavior::default()).await;
    h.link.apply_remote_offer(remote_offer()).await.unwrap();

    let disposition = h.link.add_remote_candidate(candidate(1)).await.unwrap();
    assert_eq!(disposition, CandidateDisposition::ApplyNow);
    assert_eq!(applied(&h.conn), vec![candidate(1).candidate]);
}

#[tokio::test]
async fn duplicate_candidates_are_applied_once() {
    let mut h = harness(LinkRole::Answerer, LoopbackBehavior::default()).await;

    h.link.add_remote_candidate(candidate(1)).await.unwrap();
    let again = h.link.add_remote_candidate(candidate(1)).await.unwrap();
    assert_eq!(again, CandidateDisposition::Duplicate);

    h.link.apply_remote_offer(remote_offer()).await.unwrap();
    h.link.flush_candidates().await.unwrap();
    let late = h.link.add_remote_candidate(candidate(1)).await.unwrap();
    assert_eq!(late, CandidateDisposition::Duplicate);

    assert_eq!(applied(&h.conn), vec![candidate(1).candidate]);
}

#[tokio::test]
async fn offerer_walks_the_offer_path() {
    let mut h = harness(LinkRole::Offerer, LoopbackBehavior::default()).await;
    let media = LocalMediaHandle::new(vec![LocalTrack {
        id: "cam".into(),
        kind: MediaKind::Video,
    }]);
    h.link.attach_local_media(&media).await.unwrap();

    let offer = h.link.create_offer().await.unwrap();
    assert!(offer.sdp.contains("m=video"));
    assert_eq!(h.link.state(), LinkState::OfferCreated);
    h.link.mark_offer_sent().unwrap();
    assert!(h.link.awaiting_answer());

    h.link
        .apply_remote_answer(SessionDescription::answer("v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n"))
        .await
        .unwrap();
    assert_eq!(h.link.state(), LinkState::AnswerApplied);
    assert!(!h.link.awaiting_answer());

    h.link.add_remote_candidate(candidate(1)).await.unwrap();
    // The loopback reports connectivity once a candidate lands
    let mut connectivity = None;
    while let Ok(envelope) = h.link_events.try_recv() {
        if let LinkEvent::Connectivity(state) = envelope.event {
            connectivity = Some(state);
        }
    }
    assert_eq!(connectivity, Some(ConnectivityState::Connected));
    h.link.on_connectivity(ConnectivityState::Connected).unwrap();
    assert_eq!(h.link.state(), LinkState::Connected);

    assert_eq!(
        h.conn.ops(),
        vec![
            LoopbackOp::AttachMedia,
            LoopbackOp::CreateOffer,
            LoopbackOp::SetLocal(meshcall_core::SdpType::Offer),
            LoopbackOp::SetRemote(meshcall_core::SdpType::Answer),
            LoopbackOp::AddCandidate(candidate(1).candidate),
        ]
    );

    let mut states = Vec::new();
    while let Ok(event) = h.session_events.try_recv() {
        if let SessionEvent::LinkStateChanged { new, .. } = event {
            states.push(new);
        }
    }
    assert_eq!(
        states,
        vec![
            LinkState::OfferCreated,
            LinkState::OfferSent,
            LinkState::AnswerApplied,
            LinkState::Connected
        ]
    );
}

#[tokio::test]
async fn early_connectivity_waits_for_descriptions() {
    let mut h = harness(LinkRole::Offerer, LoopbackBehavior::default()).await;
    h.link.create_offer().await.unwrap();
    h.link.mark_offer_sent().unwrap();

    h.link.on_connectivity(ConnectivityState::Connected).unwrap();
    assert_eq!(h.link.state(), LinkState::OfferSent);

    h.link
        .apply_remote_answer(SessionDescription::answer("v=0\r\n"))
        .await
        .unwrap();
    assert_eq!(h.link.state(), LinkState::Connected);
}

#[tokio::test]
async fn wrong_role_operations_are_rejected() {
    let mut h = harness(LinkRole::Answerer, LoopbackBehavior::default()).await;

    assert!(matches!(
        h.link.create_offer().await,
        Err(NegotiationError::InvalidTransition { .. })
    ));
    assert!(matches!(
        h.link.create_answer().await,
        Err(NegotiationError::InvalidTransition { .. })
    ));
    assert!(matches!(
        h.link.apply_remote_offer(SessionDescription::answer("v=0")).await,
        Err(NegotiationError::InvalidDescription(_))
    ));
    assert_eq!(h.link.state(), LinkState::New);
    assert_eq!(h.conn.remote_description_count(), 0);
}

#[tokio::test]
async fn cancellation_discards_in_flight_offer() {
    let mut h = harness(
        LinkRole::Offerer,
        LoopbackBehavior {
            generation_delay: Some(Duration::from_millis(500)),
            ..Default::default()
        },
    )
    .await;

    let cancel = h.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });

    let result = h.link.create_offer().await;
    assert!(matches!(result, Err(NegotiationError::Cancelled)));
    assert_eq!(h.link.state(), LinkState::New);
    assert_eq!(h.link.local_descriptions_applied(), 0);
    assert!(!h.conn.ops().contains(&LoopbackOp::CreateOffer));
}

#[tokio::test]
async fn hung_backend_call_times_out() {
    let mut h = harness(
        LinkRole::Offerer,
        LoopbackBehavior {
            generation_delay: Some(Duration::from_millis(500)),
            ..Default::default()
        },
    )
    .await;
    h.link = h.link.with_operation_timeout(Duration::from_millis(20));

    let result = h.link.create_offer().await;
    assert!(matches!(result, Err(NegotiationError::TimedOut(_))));
    assert_eq!(h.link.state(), LinkState::New);
    assert_eq!(h.link.local_descriptions_applied(), 0);
    assert!(!h.conn.ops().contains(&LoopbackOp::CreateOffer));
}

#[tokio::test]
async fn disconnect_during_negotiation_resumes() {
    let mut h = harness(LinkRole::Offerer, LoopbackBehavior::default()).await;
    h.link.create_offer().await.unwrap();
    h.link.mark_offer_sent().unwrap();

    h.link.on_connectivity(ConnectivityState::Disconnected).unwrap();
    assert_eq!(h.link.state(), LinkState::Disconnected);
    assert_eq!(h.link.progress_state(), LinkState::OfferSent);
    assert!(h.link.awaiting_answer());

    h.link
        .apply_remote_answer(SessionDescription::answer("v=0\r\n"))
        .await
        .unwrap();
    assert_eq!(h.link.state(), LinkState::Disconnected);
    assert_eq!(h.link.progress_state(), LinkState::AnswerApplied);

    h.link.on_connectivity(ConnectivityState::Connected).unwrap();
    assert_eq!(h.link.state(), LinkState::Connected);
}

#[tokio::test]
async fn close_is_idempotent_and_final() {
    let mut h = harness(LinkRole::Answerer, LoopbackBehavior::default()).await;
    h.link.add_remote_candidate(candidate(1)).await.unwrap();

    assert!(h.link.close().await);
    assert!(!h.link.close().await);
    assert_eq!(h.link.state(), LinkState::Closed);
    assert_eq!(h.link.pending_candidates(), 0);
    assert!(h.conn.is_closed());
    assert_eq!(
        h.conn.ops().iter().filter(|op| **op == LoopbackOp::Close).count(),
        1
    );

    assert!(matches!(
        h.link.add_remote_candidate(candidate(2)).await,
        Err(NegotiationError::Closed)
    ));
    h.link.on_connectivity(ConnectivityState::Connected).unwrap();
    assert_eq!(h.link.state(), LinkState::Closed);
}

#[tokio::test]
async fn failed_remote_description_leaves_link_negotiable_by_session() {
    let mut h = harness(
        LinkRole::Answerer,
        LoopbackBehavior {
            reject_remote_description: true,
            ..Default::default()
        },
    )
    .await;

    let res = h.link.apply_remote_offer(remote_offer()).await;
    assert!(matches!(res, Err(NegotiationError::InvalidDescription(_))));
    assert!(!h.link.has_remote_description());

    h.link.fail("remote description rejected").unwrap();
    assert_eq!(h.link.state(), LinkState::Failed);
    assert!(h.link.close().await);
    assert_eq!(h.link.state(), LinkState::Closed);
}
