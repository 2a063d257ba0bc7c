//! Call session management
//!
//! A [`CallSession`] is one local participant's presence in a project call. It owns the
//! local media, the participant roster and one [`PeerLink`] per remote participant, and it
//! is the only place where relay messages and backend link events are applied. All of
//! that state is mutated from a single task; other tasks reach the session through its
//! event stream and a cancellable [`SessionHandle`].
//!
//! Who offers is decided by arrival order: members already in the call offer to a
//! newcomer, the newcomer answers every offer it receives. If two sides ever offer to
//! each other at once, the lexicographically smaller participant id keeps its offer.

use crate::config::{SessionConfig, MIN_TIMEOUT_CHECK_INTERVAL};
use crate::connection::{ConnectionFactory, LinkEnvelope, LinkEvent, LinkEventSink, LinkId, NegotiationError};
use crate::identity::{ParticipantId, ProjectId};
use crate::media::{MediaError, MediaSource, MediaState};
use crate::peer_link::PeerLink;
use crate::signaling::{
    AnswerPayload, CallEndedPayload, CallInvitation, IceCandidatePayload, MediaChangedPayload,
    OfferPayload, ParticipantAction, SignalingHandler, SignalingMessage, SignalingTransport,
};
use crate::toggle::{MediaToggleBroadcaster, RemoteMediaFlags};
use crate::types::{
    EndReason, IceCandidate, LinkRole, LinkState, MediaKind, Participant, SessionDescription,
    SessionEvent, SessionId, SessionState,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Session-level errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Local media could not be acquired; nothing was joined
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(#[from] MediaError),

    /// Operation not allowed in the current session state
    #[error("Invalid session state: expected {expected:?}, found {actual:?}")]
    InvalidState {
        /// State the operation requires
        expected: SessionState,
        /// Current state
        actual: SessionState,
    },

    /// The relay refused or lost a session-level message
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// The session was cancelled through its handle
    #[error("Session cancelled")]
    Cancelled,
}

/// Identity of the local participant in a project call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalParticipant {
    /// Project whose call room is joined
    pub project_id: ProjectId,
    /// Local participant identifier
    pub id: ParticipantId,
    /// Local display name
    pub name: String,
}

impl LocalParticipant {
    /// Create a local identity
    pub fn new(
        project_id: impl Into<ProjectId>,
        id: impl Into<ParticipantId>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            id: id.into(),
            name: name.into(),
        }
    }

    fn action(&self) -> ParticipantAction {
        ParticipantAction {
            project_id: self.project_id.clone(),
            user_id: self.id.clone(),
            user_name: self.name.clone(),
        }
    }
}

/// Cancellation handle for a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Abort in-flight negotiations and make the session leave
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug)]
enum Inbound {
    Message(SignalingMessage),
    RelayError(String),
}

/// Background task forwarding relay messages into the session
///
/// Dropping the subscription stops the task.
struct RelaySubscription {
    task: JoinHandle<()>,
}

impl RelaySubscription {
    fn spawn<T: SignalingTransport + 'static>(
        signaling: Arc<SignalingHandler<T>>,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> Self {
        let task = tokio::spawn(async move {
            loop {
                let item = match signaling.receive_message().await {
                    Ok(message) => Inbound::Message(message),
                    Err(e) => Inbound::RelayError(e.to_string()),
                };
                if inbound.send(item).is_err() {
                    break;
                }
            }
        });
        Self { task }
    }
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// One local participant's call session
pub struct CallSession<T: SignalingTransport + 'static> {
    id: SessionId,
    local: LocalParticipant,
    state: SessionState,
    created_at: DateTime<Utc>,
    config: SessionConfig,
    signaling: Arc<SignalingHandler<T>>,
    connections: Arc<dyn ConnectionFactory>,
    media_source: Arc<dyn MediaSource>,
    media: MediaState,
    participants: HashMap<ParticipantId, Participant>,
    links: HashMap<ParticipantId, PeerLink>,
    toggles: MediaToggleBroadcaster,
    next_link_id: u64,
    link_events_tx: mpsc::UnboundedSender<LinkEnvelope>,
    link_events_rx: mpsc::UnboundedReceiver<LinkEnvelope>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    relay: Option<RelaySubscription>,
    relay_connected: bool,
    cancel: CancellationToken,
    event_sender: broadcast::Sender<SessionEvent>,
}

impl<T: SignalingTransport + 'static> CallSession<T> {
    /// Create an idle session
    pub fn new(
        transport: Arc<T>,
        connections: Arc<dyn ConnectionFactory>,
        media_source: Arc<dyn MediaSource>,
        local: LocalParticipant,
        config: SessionConfig,
    ) -> Self {
        let (event_sender, _) = broadcast::channel(config.event_capacity.max(1));
        let (link_events_tx, link_events_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let signaling = Arc::new(SignalingHandler::with_min_receive_interval(
            transport,
            config.min_receive_interval,
        ));
        let toggles = MediaToggleBroadcaster::new(local.project_id.clone(), local.id.clone());

        Self {
            id: SessionId::new(),
            local,
            state: SessionState::Idle,
            created_at: Utc::now(),
            config,
            signaling,
            connections,
            media_source,
            media: MediaState::default(),
            participants: HashMap::new(),
            links: HashMap::new(),
            toggles,
            next_link_id: 0,
            link_events_tx,
            link_events_rx,
            inbound_tx,
            inbound_rx,
            relay: None,
            relay_connected: false,
            cancel: CancellationToken::new(),
            event_sender,
        }
    }

    /// Session identifier
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Local identity
    #[must_use]
    pub fn local(&self) -> &LocalParticipant {
        &self.local
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// When the session object was created
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Session configuration
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Local media flags and capture handle
    #[must_use]
    pub fn media_state(&self) -> &MediaState {
        &self.media
    }

    /// Known remote participants
    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    /// Remote participant by id
    #[must_use]
    pub fn participant(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(id)
    }

    /// Link to `remote`, if one exists
    #[must_use]
    pub fn link(&self, remote: &ParticipantId) -> Option<&PeerLink> {
        self.links.get(remote)
    }

    /// Number of live links
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Remote ends of all live links, sorted
    #[must_use]
    pub fn linked_participants(&self) -> Vec<ParticipantId> {
        let mut remotes: Vec<_> = self.links.keys().cloned().collect();
        remotes.sort();
        remotes
    }

    /// Mute flags last announced by `remote`
    #[must_use]
    pub fn remote_media_flags(&self, remote: &ParticipantId) -> RemoteMediaFlags {
        self.toggles.flags(remote)
    }

    /// Whether the relay subscription is currently healthy
    #[must_use]
    pub fn is_relay_connected(&self) -> bool {
        self.relay.is_some() && self.relay_connected
    }

    /// Subscribe to session events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_sender.subscribe()
    }

    /// Handle for cancelling the session from another task
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            cancel: self.cancel.clone(),
        }
    }

    fn set_state(&mut self, new: SessionState) {
        let old = self.state;
        if old == new {
            return;
        }
        tracing::debug!(
            session = %self.id,
            old_state = ?old,
            new_state = ?new,
            "Session state transition"
        );
        self.state = new;
        let _ = self.event_sender.send(SessionEvent::StateChanged { old, new });
    }

    fn require_active(&self) -> Result<(), SessionError> {
        if self.state == SessionState::Active {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                expected: SessionState::Active,
                actual: self.state,
            })
        }
    }

    fn stale(&self, kind: &'static str, from: Option<&ParticipantId>, reason: &str) {
        tracing::warn!(
            session = %self.id,
            event = kind,
            from = ?from,
            reason,
            "Ignoring stale message"
        );
        let _ = self.event_sender.send(SessionEvent::StaleMessage {
            kind,
            from: from.cloned(),
        });
    }

    /// Acquire local media, subscribe to the relay and join the call room
    ///
    /// On failure no link exists and the session stays in `Initializing`, from where
    /// the start may be retried.
    ///
    /// # Errors
    ///
    /// Returns error if media cannot be acquired, the join cannot be sent, the session
    /// was cancelled, or it is not `Idle`/`Initializing`
    #[tracing::instrument(skip(self), fields(session = %self.id, project = %self.local.project_id))]
    pub async fn start_session(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Idle | SessionState::Initializing => {}
            actual => {
                return Err(SessionError::InvalidState {
                    expected: SessionState::Idle,
                    actual,
                })
            }
        }
        self.set_state(SessionState::Initializing);

        let acquired = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(SessionError::Cancelled),
            result = self.media_source.acquire(&self.config.constraints) => result,
        };
        let handle = acquired.map_err(|e| {
            tracing::warn!(error = %e, "Local media acquisition failed");
            SessionError::MediaAcquisition(e)
        })?;
        if self.cancel.is_cancelled() {
            handle.release();
            return Err(SessionError::Cancelled);
        }
        self.media = MediaState::acquired(handle);

        self.relay = Some(RelaySubscription::spawn(
            Arc::clone(&self.signaling),
            self.inbound_tx.clone(),
        ));
        self.relay_connected = true;

        if let Err(e) = self
            .signaling
            .send_message(SignalingMessage::Join(self.local.action()))
            .await
        {
            tracing::warn!(error = %e, "Failed to join call room");
            self.relay = None;
            self.relay_connected = false;
            self.release_media();
            return Err(SessionError::Signaling(e.to_string()));
        }

        self.set_state(SessionState::Active);
        tracing::info!(participant = %self.local.id, "Joined call");
        Ok(())
    }

    /// Invite the project room to a call
    ///
    /// # Errors
    ///
    /// Returns error if the session is ending or the relay rejects the message
    pub async fn announce_call(&self, project_name: &str) -> Result<(), SessionError> {
        if matches!(self.state, SessionState::Ending | SessionState::Ended) {
            return Err(SessionError::InvalidState {
                expected: SessionState::Active,
                actual: self.state,
            });
        }
        let invitation = CallInvitation {
            project_id: self.local.project_id.clone(),
            caller_id: self.local.id.clone(),
            caller_name: self.local.name.clone(),
            project_name: project_name.to_string(),
        };
        self.signaling
            .send_message(SignalingMessage::StartCall(invitation))
            .await
            .map_err(|e| SessionError::Signaling(e.to_string()))
    }

    fn allocate_link_id(&mut self) -> LinkId {
        self.next_link_id += 1;
        LinkId(self.next_link_id)
    }

    async fn create_link(
        &mut self,
        remote: &ParticipantId,
        role: LinkRole,
    ) -> Result<(), NegotiationError> {
        let link_id = self.allocate_link_id();
        let sink = LinkEventSink::new(link_id, remote.clone(), self.link_events_tx.clone());

        let connection = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(NegotiationError::Cancelled),
            result = self.connections.create_connection(remote, sink) => result?,
        };

        let mut link = PeerLink::new(
            link_id,
            remote.clone(),
            role,
            connection,
            self.cancel.child_token(),
            self.event_sender.clone(),
            self.config.max_pending_candidates,
        )
        .with_operation_timeout(self.config.negotiation_timeout);
        tracing::debug!(remote = %remote, link = %link_id, role = ?role, "Created peer link");

        let media = self.media.local_media.clone();
        let attached = match &media {
            Some(media) => link.attach_local_media(media).await,
            None => Ok(()),
        };
        self.links.insert(remote.clone(), link);
        attached
    }

    fn link_mut(&mut self, remote: &ParticipantId) -> Result<&mut PeerLink, NegotiationError> {
        self.links.get_mut(remote).ok_or(NegotiationError::Closed)
    }

    async fn negotiate_as_offerer(&mut self, remote: &ParticipantId) -> Result<(), NegotiationError> {
        self.create_link(remote, LinkRole::Offerer).await?;
        let offer = self.link_mut(remote)?.create_offer().await?;

        let message = SignalingMessage::Offer(OfferPayload {
            offer,
            to: remote.clone(),
            from: self.local.id.clone(),
            from_name: self.local.name.clone(),
        });
        self.signaling
            .send_message(message)
            .await
            .map_err(|e| NegotiationError::Backend(format!("offer not delivered: {e}")))?;

        self.link_mut(remote)?.mark_offer_sent()
    }

    async fn negotiate_as_answerer(
        &mut self,
        remote: &ParticipantId,
        offer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.create_link(remote, LinkRole::Answerer).await?;
        let link = self.link_mut(remote)?;
        link.apply_remote_offer(offer).await?;
        let answer = link.create_answer().await?;

        let message = SignalingMessage::Answer(AnswerPayload {
            answer,
            to: remote.clone(),
            from: self.local.id.clone(),
        });
        self.signaling
            .send_message(message)
            .await
            .map_err(|e| NegotiationError::Backend(format!("answer not delivered: {e}")))?;

        let link = self.link_mut(remote)?;
        link.mark_answer_sent()?;
        link.flush_candidates().await?;
        Ok(())
    }

    async fn handle_negotiation_error(&mut self, remote: &ParticipantId, error: NegotiationError) {
        match error {
            NegotiationError::Cancelled => {
                tracing::debug!(remote = %remote, "Negotiation cancelled, discarding link");
                self.discard_link(remote).await;
            }
            error => self.fail_link(remote, error.to_string()).await,
        }
    }

    /// Close and drop a link without reporting a failure
    async fn discard_link(&mut self, remote: &ParticipantId) {
        if let Some(mut link) = self.links.remove(remote) {
            link.close().await;
        }
    }

    /// Mark a link failed, close it and forget the participant
    async fn fail_link(&mut self, remote: &ParticipantId, reason: String) {
        if let Some(mut link) = self.links.remove(remote) {
            if let Err(e) = link.fail(&reason) {
                tracing::debug!(remote = %remote, error = %e, "Link already closed");
            }
            link.close().await;
        }
        self.toggles.forget(remote);
        if self.participants.remove(remote).is_some() {
            let _ = self.event_sender.send(SessionEvent::ParticipantLeft {
                id: remote.clone(),
            });
        }
        tracing::warn!(session = %self.id, remote = %remote, reason = %reason, "Peer link removed after failure");
        let _ = self.event_sender.send(SessionEvent::LinkFailed {
            remote: remote.clone(),
            reason,
        });
    }

    fn remember_participant(&mut self, participant: Participant) {
        let id = participant.id.clone();
        if self.participants.insert(id, participant.clone()).is_none() {
            let _ = self
                .event_sender
                .send(SessionEvent::ParticipantJoined { participant });
        }
    }

    /// A participant joined after us: create an offerer link to them
    ///
    /// # Errors
    ///
    /// Returns error if the session is not active. Link failures are reported as
    /// [`SessionEvent::LinkFailed`] instead.
    #[tracing::instrument(skip(self, participant), fields(session = %self.id, remote = %participant.id))]
    pub async fn on_participant_joined(&mut self, participant: Participant) -> Result<(), SessionError> {
        self.require_active()?;
        let remote = participant.id.clone();
        if remote == self.local.id {
            return Ok(());
        }

        if let Some(link) = self.links.get(&remote) {
            let same_socket = self
                .participants
                .get(&remote)
                .is_some_and(|p| p.transport_handle == participant.transport_handle);
            if same_socket && !link.state().is_terminal() {
                self.stale("user_joined_video_call", Some(&remote), "duplicate join");
                return Ok(());
            }
            tracing::info!(remote = %remote, "Participant rejoined, replacing link");
            self.discard_link(&remote).await;
            self.participants.remove(&remote);
        }

        self.remember_participant(participant);
        if let Err(e) = self.negotiate_as_offerer(&remote).await {
            self.handle_negotiation_error(&remote, e).await;
        }
        Ok(())
    }

    /// An offer arrived: answer it on a fresh answerer link
    ///
    /// # Errors
    ///
    /// Returns error if the session is not active
    #[tracing::instrument(skip(self, offer, from_name), fields(session = %self.id, remote = %from))]
    pub async fn on_incoming_offer(
        &mut self,
        offer: SessionDescription,
        from: ParticipantId,
        from_name: String,
    ) -> Result<(), SessionError> {
        self.require_active()?;
        if from == self.local.id {
            return Ok(());
        }

        if let Some(link) = self.links.get(&from) {
            let glare = link.role() == LinkRole::Offerer
                && matches!(
                    link.progress_state(),
                    LinkState::New | LinkState::OfferCreated | LinkState::OfferSent
                );
            if glare {
                if self.local.id < from {
                    self.stale("webrtc_offer", Some(&from), "offer collision, keeping ours");
                    return Ok(());
                }
                tracing::info!(remote = %from, "Offer collision, yielding to remote offer");
            } else if link.is_same_remote_offer(&offer) {
                self.stale("webrtc_offer", Some(&from), "duplicate offer");
                return Ok(());
            } else {
                tracing::info!(remote = %from, state = ?link.state(), "New offer from linked participant, replacing link");
            }
            self.discard_link(&from).await;
        }

        self.remember_participant(Participant::new(from.clone(), from_name, None));
        if let Err(e) = self.negotiate_as_answerer(&from, offer).await {
            self.handle_negotiation_error(&from, e).await;
        }
        Ok(())
    }

    /// An answer arrived for one of our offers
    ///
    /// Answers for links that are not waiting for one are stale and ignored.
    ///
    /// # Errors
    ///
    /// Returns error if the session is not active
    #[tracing::instrument(skip(self, answer), fields(session = %self.id, remote = %from))]
    pub async fn on_incoming_answer(
        &mut self,
        answer: SessionDescription,
        from: ParticipantId,
    ) -> Result<(), SessionError> {
        self.require_active()?;

        let Some(link) = self.links.get_mut(&from) else {
            self.stale("webrtc_answer", Some(&from), "no link");
            return Ok(());
        };
        if !link.awaiting_answer() {
            let state = link.state();
            tracing::debug!(remote = %from, state = ?state, "Answer not expected");
            self.stale("webrtc_answer", Some(&from), "link not awaiting answer");
            return Ok(());
        }

        let result = match link.apply_remote_answer(answer).await {
            Ok(()) => link.flush_candidates().await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.handle_negotiation_error(&from, e).await;
        }
        Ok(())
    }

    /// A connectivity candidate arrived from `from`
    ///
    /// # Errors
    ///
    /// Returns error if the session is not active
    pub async fn on_remote_candidate(
        &mut self,
        from: ParticipantId,
        candidate: IceCandidate,
    ) -> Result<(), SessionError> {
        self.require_active()?;

        let Some(link) = self.links.get_mut(&from) else {
            self.stale("webrtc_ice_candidate", Some(&from), "no link");
            return Ok(());
        };
        match link.add_remote_candidate(candidate).await {
            Ok(_) => {}
            Err(NegotiationError::Closed) => {
                self.stale("webrtc_ice_candidate", Some(&from), "link closed");
            }
            Err(e) => self.handle_negotiation_error(&from, e).await,
        }
        Ok(())
    }

    /// Apply a mute/unmute announced by a remote participant
    pub fn on_media_changed(&mut self, change: &MediaChangedPayload) {
        if self.toggles.apply_remote(change).is_some() {
            let _ = self.event_sender.send(SessionEvent::RemoteMediaChanged {
                remote: change.user_id.clone(),
                kind: change.media_type,
                enabled: change.enabled,
            });
        }
    }

    /// A participant left: close only their link
    ///
    /// # Errors
    ///
    /// Returns error if the session is not active
    #[tracing::instrument(skip(self), fields(session = %self.id))]
    pub async fn on_participant_left(&mut self, id: &ParticipantId) -> Result<(), SessionError> {
        self.require_active()?;

        let had_link = self.links.contains_key(id);
        self.discard_link(id).await;
        self.toggles.forget(id);
        let known = self.participants.remove(id).is_some();

        if known {
            let _ = self
                .event_sender
                .send(SessionEvent::ParticipantLeft { id: id.clone() });
            tracing::info!(remote = %id, "Participant left");
        } else if !had_link {
            self.stale("user_left_video_call", Some(id), "unknown participant");
        }
        Ok(())
    }

    /// Enable or disable a local track and announce it
    ///
    /// Takes effect on every link at once; no renegotiation happens. A failed
    /// announcement is logged and does not undo the local change.
    ///
    /// # Errors
    ///
    /// Returns error if the session is not active
    #[tracing::instrument(skip(self), fields(session = %self.id))]
    pub async fn toggle_media(&mut self, kind: MediaKind, enabled: bool) -> Result<(), SessionError> {
        self.require_active()?;

        if let Some(media) = &self.media.local_media {
            if !media.set_enabled(kind, enabled) {
                tracing::debug!(kind = %kind, "No local track of this kind");
            }
        }
        self.media.set(kind, enabled);

        let message = self.toggles.announce(kind, enabled);
        if let Err(e) = self.signaling.send_message(message).await {
            tracing::warn!(kind = %kind, enabled, error = %e, "Failed to announce media toggle");
        }
        Ok(())
    }

    /// Handle a backend event for one of our links
    pub async fn handle_link_event(&mut self, envelope: LinkEnvelope) {
        let remote = envelope.remote;
        let Some(link) = self.links.get_mut(&remote) else {
            tracing::debug!(remote = %remote, link = %envelope.link_id, "Event for removed link");
            return;
        };
        if link.id() != envelope.link_id {
            tracing::debug!(remote = %remote, link = %envelope.link_id, "Event from replaced link");
            return;
        }

        match envelope.event {
            LinkEvent::LocalCandidate(candidate) => {
                let message = SignalingMessage::IceCandidate(IceCandidatePayload {
                    candidate,
                    to: remote.clone(),
                    from: self.local.id.clone(),
                });
                if let Err(e) = self.signaling.send_message(message).await {
                    tracing::warn!(remote = %remote, error = %e, "Failed to send local candidate");
                }
            }
            LinkEvent::Connectivity(connectivity) => {
                if let Err(e) = link.on_connectivity(connectivity) {
                    tracing::warn!(remote = %remote, error = %e, "Ignoring connectivity change");
                }
                if link.state() == LinkState::Failed {
                    self.fail_link(&remote, "connectivity failed".to_string())
                        .await;
                }
            }
            LinkEvent::RemoteMedia(media) => {
                if link.set_remote_media(media.clone()) {
                    let _ = self
                        .event_sender
                        .send(SessionEvent::RemoteMediaAvailable { remote, media });
                }
            }
        }
    }

    /// Fail links whose negotiation has been outstanding too long
    pub async fn expire_stalled_links(&mut self) {
        let timeout = self.config.negotiation_timeout;
        let stalled: Vec<ParticipantId> = self
            .links
            .iter()
            .filter(|(_, link)| link.is_stalled(timeout))
            .map(|(remote, _)| remote.clone())
            .collect();

        for remote in stalled {
            self.fail_link(&remote, "negotiation timed out".to_string())
                .await;
        }
    }

    /// Apply one relay message
    pub async fn handle_message(&mut self, message: SignalingMessage) {
        if self.state != SessionState::Active {
            tracing::debug!(
                event = message.event_name(),
                state = ?self.state,
                "Session not active, dropping message"
            );
            return;
        }
        if let Some(to) = message.to() {
            if to != &self.local.id {
                self.stale(message.event_name(), message.from(), "addressed to someone else");
                return;
            }
        }

        let result = match message {
            SignalingMessage::ParticipantJoined(p) => {
                self.on_participant_joined(Participant::new(
                    p.user_id,
                    p.user_name,
                    Some(p.socket_id),
                ))
                .await
            }
            SignalingMessage::Offer(p) => self.on_incoming_offer(p.offer, p.from, p.from_name).await,
            SignalingMessage::Answer(p) => self.on_incoming_answer(p.answer, p.from).await,
            SignalingMessage::IceCandidate(p) => self.on_remote_candidate(p.from, p.candidate).await,
            SignalingMessage::MediaChanged(p) => {
                self.on_media_changed(&p);
                Ok(())
            }
            SignalingMessage::ParticipantLeft(p) => self.on_participant_left(&p.user_id).await,
            SignalingMessage::CallEnded(p) => {
                self.on_call_ended(&p).await;
                Ok(())
            }
            SignalingMessage::IncomingCall(invitation) => {
                tracing::debug!(caller = %invitation.caller_id, "Invitation while in call");
                Ok(())
            }
            message @ (SignalingMessage::Join(_)
            | SignalingMessage::Leave(_)
            | SignalingMessage::EndCall(_)
            | SignalingMessage::ToggleMedia(_)
            | SignalingMessage::StartCall(_)) => {
                self.stale(message.event_name(), message.from(), "client-to-relay event");
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to handle signaling message");
        }
    }

    async fn on_call_ended(&mut self, payload: &CallEndedPayload) {
        if payload.ended_by.as_ref() == Some(&self.local.id) {
            return;
        }
        tracing::info!(ended_by = ?payload.ended_by, "Call ended by remote participant");
        self.teardown(None, EndReason::EndedByRemote).await;
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Message(message) => {
                if !self.relay_connected {
                    self.relay_connected = true;
                    tracing::info!(session = %self.id, "Relay connection restored");
                    let _ = self.event_sender.send(SessionEvent::RelayReconnected);
                }
                self.handle_message(message).await;
            }
            Inbound::RelayError(error) => {
                if self.relay_connected {
                    self.relay_connected = false;
                    tracing::warn!(session = %self.id, error = %error, "Relay connection lost");
                    let _ = self
                        .event_sender
                        .send(SessionEvent::RelayDisconnected { error });
                }
            }
        }
    }

    /// Apply everything already queued without waiting. Returns how many items ran.
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        loop {
            if self.cancel.is_cancelled() && self.state == SessionState::Active {
                let leave = SignalingMessage::Leave(self.local.action());
                self.teardown(Some(leave), EndReason::Cancelled).await;
                return handled + 1;
            }
            if let Ok(inbound) = self.inbound_rx.try_recv() {
                self.handle_inbound(inbound).await;
            } else if let Ok(envelope) = self.link_events_rx.try_recv() {
                self.handle_link_event(envelope).await;
            } else {
                return handled;
            }
            handled += 1;
        }
    }

    /// Run the session until it ends
    ///
    /// Starts the session first if it is still idle.
    ///
    /// # Errors
    ///
    /// Returns error if starting fails
    pub async fn run(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Idle {
            self.start_session().await?;
        }
        self.require_active()?;

        let period = self.config.timeout_check_interval.max(MIN_TIMEOUT_CHECK_INTERVAL);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.state == SessionState::Active {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let leave = SignalingMessage::Leave(self.local.action());
                    self.teardown(Some(leave), EndReason::Cancelled).await;
                }
                Some(inbound) = self.inbound_rx.recv() => self.handle_inbound(inbound).await,
                Some(envelope) = self.link_events_rx.recv() => self.handle_link_event(envelope).await,
                _ = ticker.tick() => self.expire_stalled_links().await,
            }
        }
        Ok(())
    }

    /// Leave the call; other participants stay connected to each other
    #[tracing::instrument(skip(self), fields(session = %self.id))]
    pub async fn leave_session(&mut self) {
        let leave = SignalingMessage::Leave(self.local.action());
        self.teardown(Some(leave), EndReason::Left).await;
    }

    /// End the call for every participant
    #[tracing::instrument(skip(self), fields(session = %self.id))]
    pub async fn end_session_for_all(&mut self) {
        let end = SignalingMessage::EndCall(self.local.action());
        self.teardown(Some(end), EndReason::EndedByLocal).await;
    }

    fn release_media(&mut self) {
        if let Some(media) = self.media.local_media.take() {
            if media.release() {
                tracing::debug!(stream = media.stream_id(), "Released local media");
            }
        }
        self.media = MediaState::default();
    }

    async fn teardown(&mut self, announce: Option<SignalingMessage>, reason: EndReason) {
        if matches!(self.state, SessionState::Ending | SessionState::Ended) {
            return;
        }
        let was_active = self.state == SessionState::Active;
        self.set_state(SessionState::Ending);
        self.cancel.cancel();

        if was_active {
            if let Some(message) = announce {
                if let Err(e) = self.signaling.send_message(message).await {
                    tracing::warn!(error = %e, "Failed to announce departure");
                }
            }
        }

        let links: Vec<PeerLink> = self.links.drain().map(|(_, link)| link).collect();
        for mut link in links {
            link.close().await;
        }
        self.participants.clear();
        self.toggles.clear();
        self.release_media();

        self.relay = None;
        self.relay_connected = false;
        while self.link_events_rx.try_recv().is_ok() {}

        self.set_state(SessionState::Ended);
        tracing::info!(session = %self.id, reason = ?reason, "Session ended");
        let _ = self.event_sender.send(SessionEvent::SessionEnded { reason });
    }
}

impl<T: SignalingTransport + 'static> Drop for CallSession<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(media) = self.media.local_media.take() {
            media.release();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackConnectionFactory;
    use crate::media::StaticMediaSource;
    use crate::relay::{InMemoryRelay, RelayEndpoint};
    use crate::signaling::ParticipantJoinedPayload;
    use std::time::Duration;

    fn config() -> SessionConfig {
        SessionConfig::builder()
            .min_receive_interval(Duration::ZERO)
            .build()
    }

    fn session(relay: &InMemoryRelay, id: &str) -> CallSession<RelayEndpoint> {
        let project = ProjectId::from("p1");
        CallSession::new(
            Arc::new(relay.connect(&project)),
            Arc::new(LoopbackConnectionFactory::new(id)),
            Arc::new(StaticMediaSource::granting()),
            LocalParticipant::new(project, id, id.to_uppercase()),
            config(),
        )
    }

    #[tokio::test]
    async fn test_start_session_goes_active() {
        let relay = InMemoryRelay::new();
        let mut alice = session(&relay, "alice");
        let mut events = alice.subscribe_events();

        alice.start_session().await.unwrap();

        assert_eq!(alice.state(), SessionState::Active);
        assert!(alice.media_state().local_media.is_some());
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::StateChanged {
                old: SessionState::Idle,
                new: SessionState::Initializing
            }
        ));
        assert_eq!(
            relay.call_members(&ProjectId::from("p1")),
            vec![ParticipantId::from("alice")]
        );
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let relay = InMemoryRelay::new();
        let mut alice = session(&relay, "alice");
        alice.start_session().await.unwrap();
        assert!(matches!(
            alice.start_session().await,
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_handlers_require_active_session() {
        let relay = InMemoryRelay::new();
        let mut alice = session(&relay, "alice");
        let res = alice
            .on_participant_joined(Participant::new("bob".into(), "BOB", None))
            .await;
        assert!(matches!(res, Err(SessionError::InvalidState { .. })));
        assert_eq!(alice.link_count(), 0);
    }

    #[tokio::test]
    async fn test_misaddressed_message_is_stale() {
        let relay = InMemoryRelay::new();
        let mut alice = session(&relay, "alice");
        alice.start_session().await.unwrap();
        let mut events = alice.subscribe_events();

        alice
            .handle_message(SignalingMessage::Answer(AnswerPayload {
                answer: SessionDescription::answer("v=0"),
                to: ParticipantId::from("carol"),
                from: ParticipantId::from("bob"),
            }))
            .await;

        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::StaleMessage { kind: "webrtc_answer", .. }
        ));
    }

    #[tokio::test]
    async fn test_joined_participant_gets_offer() {
        let relay = InMemoryRelay::new();
        let mut alice = session(&relay, "alice");
        alice.start_session().await.unwrap();

        alice
            .handle_message(SignalingMessage::ParticipantJoined(ParticipantJoinedPayload {
                user_id: ParticipantId::from("bob"),
                user_name: "BOB".into(),
                socket_id: "socket-9".into(),
            }))
            .await;

        let link = alice.link(&ParticipantId::from("bob")).unwrap();
        assert_eq!(link.role(), LinkRole::Offerer);
        assert_eq!(link.state(), LinkState::OfferSent);
        assert_eq!(link.local_descriptions_applied(), 1);
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let relay = InMemoryRelay::new();
        let mut alice = session(&relay, "alice");
        alice.start_session().await.unwrap();
        let media = alice.media_state().local_media.clone().unwrap();

        alice.leave_session().await;
        alice.leave_session().await;

        assert_eq!(alice.state(), SessionState::Ended);
        assert_eq!(media.release_count(), 1);
        assert!(relay.call_members(&ProjectId::from("p1")).is_empty());
    }
}
