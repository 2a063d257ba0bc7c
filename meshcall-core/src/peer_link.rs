//! Peer link negotiation state machine
//!
//! One [`PeerLink`] exists per remote participant while a session is active. The link
//! owns its backend connection, drives the offer/answer exchange in the order dictated
//! by its [`LinkRole`], buffers remote candidates until the remote description is set,
//! and refuses any transition outside the allowed graph.
//!
//! Every await on the backend is raced against the link's cancellation token. When the
//! token fires (link closed or session torn down) the pending result is discarded and
//! [`NegotiationError::Cancelled`] is returned instead. A link created with
//! [`PeerLink::with_operation_timeout`] also gives up on a backend call that outlives
//! the bound, so a hung engine fails one link instead of wedging the session.

use crate::connection::{LinkId, NegotiationError, PeerConnection};
use crate::identity::ParticipantId;
use crate::ice_queue::{CandidateDisposition, CandidateQueue};
use crate::media::LocalMediaHandle;
use crate::types::{
    ConnectivityState, IceCandidate, LinkRole, LinkState, RemoteMediaHandle, SdpType,
    SessionDescription, SessionEvent,
};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Negotiation link to a single remote participant
pub struct PeerLink {
    id: LinkId,
    remote: ParticipantId,
    role: LinkRole,
    state: LinkState,
    /// Progress state to return to when a disconnection interrupted negotiation
    resume_state: Option<LinkState>,
    connection: Arc<dyn PeerConnection>,
    candidates: CandidateQueue,
    remote_media: Option<RemoteMediaHandle>,
    remote_description: Option<SessionDescription>,
    local_descriptions_applied: u32,
    remote_descriptions_applied: u32,
    /// Backend reported connectivity before both descriptions were in place
    connectivity_ready: bool,
    negotiation_started: Option<Instant>,
    /// Bound on each backend call; `None` waits indefinitely
    operation_timeout: Option<Duration>,
    cancel: CancellationToken,
    events: broadcast::Sender<SessionEvent>,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("pending_candidates", &self.candidates.len())
            .finish()
    }
}

impl PeerLink {
    /// Create a link in `New`
    ///
    /// `cancel` should be a child of the session token so session teardown reaches
    /// every in-flight negotiation.
    pub fn new(
        id: LinkId,
        remote: ParticipantId,
        role: LinkRole,
        connection: Arc<dyn PeerConnection>,
        cancel: CancellationToken,
        events: broadcast::Sender<SessionEvent>,
        max_pending_candidates: usize,
    ) -> Self {
        Self {
            id,
            remote,
            role,
            state: LinkState::New,
            resume_state: None,
            connection,
            candidates: CandidateQueue::new(max_pending_candidates),
            remote_media: None,
            remote_description: None,
            local_descriptions_applied: 0,
            remote_descriptions_applied: 0,
            connectivity_ready: false,
            negotiation_started: None,
            operation_timeout: None,
            cancel,
            events,
        }
    }

    /// Bound every backend call made by this link
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Link generation
    #[must_use]
    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Remote participant
    #[must_use]
    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    /// Role fixed at creation
    #[must_use]
    pub fn role(&self) -> LinkRole {
        self.role
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Negotiation progress, looking through a transient disconnection
    #[must_use]
    pub fn progress_state(&self) -> LinkState {
        match (self.state, self.resume_state) {
            (LinkState::Disconnected, Some(resume)) => resume,
            (state, _) => state,
        }
    }

    /// Media received from the remote participant, if any
    #[must_use]
    pub fn remote_media(&self) -> Option<&RemoteMediaHandle> {
        self.remote_media.as_ref()
    }

    /// Remote candidates waiting for the remote description
    #[must_use]
    pub fn pending_candidates(&self) -> usize {
        self.candidates.len()
    }

    /// Times a local description was applied on this link
    #[must_use]
    pub fn local_descriptions_applied(&self) -> u32 {
        self.local_descriptions_applied
    }

    /// Times a remote description was applied on this link
    #[must_use]
    pub fn remote_descriptions_applied(&self) -> u32 {
        self.remote_descriptions_applied
    }

    /// Whether the remote description has been applied
    #[must_use]
    pub fn has_remote_description(&self) -> bool {
        self.remote_descriptions_applied > 0
    }

    /// Whether `offer` is the remote offer this link already applied
    #[must_use]
    pub fn is_same_remote_offer(&self, offer: &SessionDescription) -> bool {
        self.role == LinkRole::Answerer && self.remote_description.as_ref() == Some(offer)
    }

    /// Whether the link's operations have been cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Check if a state transition is valid
    #[must_use]
    pub fn is_valid_transition(role: LinkRole, from: LinkState, to: LinkState) -> bool {
        use LinkState::{
            AnswerApplied, AnswerCreated, AnswerSent, Closed, Connected, Disconnected, Failed,
            New, OfferCreated, OfferReceived, OfferSent,
        };

        match (role, from, to) {
            // Any link can be closed
            (_, _, Closed) => from != Closed,

            // Negotiation or connectivity failure
            (_, Closed | Failed, _) => false,
            (_, _, Failed) => true,

            (LinkRole::Offerer, New, OfferCreated)
            | (LinkRole::Offerer, OfferCreated, OfferSent)
            | (LinkRole::Offerer, OfferSent, AnswerApplied)
            | (LinkRole::Offerer, AnswerApplied, Connected) => true,

            (LinkRole::Answerer, New, OfferReceived)
            | (LinkRole::Answerer, OfferReceived, AnswerCreated)
            | (LinkRole::Answerer, AnswerCreated, AnswerSent)
            | (LinkRole::Answerer, AnswerSent, Connected) => true,

            (_, Connected, Disconnected) => true,
            (_, Disconnected, Connected) => true,
            (_, New, Disconnected) => false,
            (_, s, Disconnected) => s.is_negotiating(),
            // Leaving a disconnection to resume negotiation
            (_, Disconnected, s) => s.is_negotiating(),

            _ => false,
        }
    }

    fn transition(&mut self, to: LinkState) -> Result<(), NegotiationError> {
        let from = self.state;
        if !Self::is_valid_transition(self.role, from, to) {
            return Err(NegotiationError::InvalidTransition { from, to });
        }

        tracing::debug!(
            remote = %self.remote,
            link = %self.id,
            role = ?self.role,
            old_state = ?from,
            new_state = ?to,
            "Link state transition"
        );

        self.state = to;
        if matches!(to, LinkState::OfferSent | LinkState::AnswerSent) {
            self.negotiation_started = Some(Instant::now());
        }
        if matches!(to, LinkState::Connected) {
            self.negotiation_started = None;
        }

        let _ = self.events.send(SessionEvent::LinkStateChanged {
            remote: self.remote.clone(),
            old: from,
            new: to,
        });
        Ok(())
    }

    /// Move negotiation forward, deferring the step while disconnected
    fn advance(&mut self, to: LinkState) -> Result<(), NegotiationError> {
        if self.state == LinkState::Disconnected {
            let resume = self.resume_state.unwrap_or(LinkState::Disconnected);
            if !Self::is_valid_transition(self.role, resume, to) {
                return Err(NegotiationError::InvalidTransition { from: resume, to });
            }
            tracing::debug!(remote = %self.remote, progress = ?to, "Negotiation advanced while disconnected");
            self.resume_state = Some(to);
            if matches!(to, LinkState::OfferSent | LinkState::AnswerSent) {
                self.negotiation_started = Some(Instant::now());
            }
            return Ok(());
        }
        self.transition(to)
    }

    fn require_progress(&self, role: LinkRole, expected: LinkState, to: LinkState) -> Result<(), NegotiationError> {
        if self.is_cancelled() || self.state == LinkState::Closed {
            return Err(NegotiationError::Cancelled);
        }
        let from = self.progress_state();
        if self.role != role || from != expected {
            return Err(NegotiationError::InvalidTransition { from, to });
        }
        Ok(())
    }

    /// Race a backend call against cancellation
    async fn guarded<T, F>(&self, op: F) -> Result<T, NegotiationError>
    where
        F: Future<Output = Result<T, NegotiationError>>,
    {
        let bounded = async {
            match self.operation_timeout {
                Some(limit) => tokio::time::timeout(limit, op)
                    .await
                    .unwrap_or(Err(NegotiationError::TimedOut(limit))),
                None => op.await,
            }
        };
        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(NegotiationError::Cancelled),
            result = bounded => result,
        };
        if let Err(NegotiationError::TimedOut(limit)) = &result {
            tracing::warn!(remote = %self.remote, ?limit, "Backend operation timed out");
        }
        if self.cancel.is_cancelled() {
            tracing::debug!(remote = %self.remote, "Discarding result of cancelled operation");
            return Err(NegotiationError::Cancelled);
        }
        result
    }

    /// Attach the local capture tracks
    ///
    /// # Errors
    ///
    /// Returns error if the link is past `New` or the backend rejects the tracks
    pub async fn attach_local_media(
        &mut self,
        media: &LocalMediaHandle,
    ) -> Result<(), NegotiationError> {
        if self.state != LinkState::New {
            return Err(NegotiationError::InvalidTransition {
                from: self.state,
                to: self.state,
            });
        }
        let connection = Arc::clone(&self.connection);
        self.guarded(connection.attach_local_media(media)).await
    }

    /// Generate an offer and apply it locally (`New` → `OfferCreated`)
    ///
    /// # Errors
    ///
    /// Returns error if the link is not a fresh offerer, the backend fails, or the
    /// link is cancelled meanwhile
    pub async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        self.require_progress(LinkRole::Offerer, LinkState::New, LinkState::OfferCreated)?;

        let connection = Arc::clone(&self.connection);
        let offer = self.guarded(connection.create_offer()).await?;
        self.guarded(connection.set_local_description(offer.clone()))
            .await?;
        self.local_descriptions_applied += 1;

        self.advance(LinkState::OfferCreated)?;
        Ok(offer)
    }

    /// Record that the offer was handed to the relay
    ///
    /// # Errors
    ///
    /// Returns error unless the link is in `OfferCreated`
    pub fn mark_offer_sent(&mut self) -> Result<(), NegotiationError> {
        self.require_progress(LinkRole::Offerer, LinkState::OfferCreated, LinkState::OfferSent)?;
        self.advance(LinkState::OfferSent)
    }

    /// Apply a remote offer (`New` → `OfferReceived`)
    ///
    /// Buffered candidates stay queued until [`PeerLink::flush_candidates`].
    ///
    /// # Errors
    ///
    /// Returns error if the link is not a fresh answerer, the description is unusable,
    /// or the backend rejects it
    pub async fn apply_remote_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.require_progress(LinkRole::Answerer, LinkState::New, LinkState::OfferReceived)?;
        validate_description(&offer, SdpType::Offer)?;

        let connection = Arc::clone(&self.connection);
        self.guarded(connection.set_remote_description(offer.clone()))
            .await?;
        self.remote_descriptions_applied += 1;
        self.remote_description = Some(offer);

        self.advance(LinkState::OfferReceived)
    }

    /// Generate an answer and apply it locally (`OfferReceived` → `AnswerCreated`)
    ///
    /// # Errors
    ///
    /// Returns error if no remote offer is applied or the backend fails
    pub async fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError> {
        self.require_progress(
            LinkRole::Answerer,
            LinkState::OfferReceived,
            LinkState::AnswerCreated,
        )?;

        let connection = Arc::clone(&self.connection);
        let answer = self.guarded(connection.create_answer()).await?;
        self.guarded(connection.set_local_description(answer.clone()))
            .await?;
        self.local_descriptions_applied += 1;

        self.advance(LinkState::AnswerCreated)?;
        Ok(answer)
    }

    /// Record that the answer was handed to the relay
    ///
    /// # Errors
    ///
    /// Returns error unless the link is in `AnswerCreated`
    pub fn mark_answer_sent(&mut self) -> Result<(), NegotiationError> {
        self.require_progress(
            LinkRole::Answerer,
            LinkState::AnswerCreated,
            LinkState::AnswerSent,
        )?;
        self.advance(LinkState::AnswerSent)?;
        self.promote_if_ready()
    }

    /// Whether an incoming answer can be applied right now
    #[must_use]
    pub fn awaiting_answer(&self) -> bool {
        self.role == LinkRole::Offerer
            && self.progress_state() == LinkState::OfferSent
            && !self.is_cancelled()
    }

    /// Apply the remote answer (`OfferSent` → `AnswerApplied`)
    ///
    /// # Errors
    ///
    /// Returns error if the link is not waiting for an answer, the description is
    /// unusable, or the backend rejects it
    pub async fn apply_remote_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.require_progress(LinkRole::Offerer, LinkState::OfferSent, LinkState::AnswerApplied)?;
        validate_description(&answer, SdpType::Answer)?;

        let connection = Arc::clone(&self.connection);
        self.guarded(connection.set_remote_description(answer.clone()))
            .await?;
        self.remote_descriptions_applied += 1;
        self.remote_description = Some(answer);

        self.advance(LinkState::AnswerApplied)?;
        self.promote_if_ready()
    }

    /// Accept a remote candidate, applying it now or buffering it
    ///
    /// Backend errors while applying are logged and do not fail the link.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::Closed`] for a failed or closed link, and
    /// [`NegotiationError::CandidateBacklog`] when the buffer bound is exceeded
    pub async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition, NegotiationError> {
        if self.state.is_terminal() || self.is_cancelled() {
            return Err(NegotiationError::Closed);
        }

        let disposition = self
            .candidates
            .admit(candidate.clone(), self.has_remote_description())?;
        match disposition {
            CandidateDisposition::ApplyNow => self.apply_candidate(candidate).await?,
            CandidateDisposition::Buffered => {
                tracing::trace!(remote = %self.remote, pending = self.candidates.len(), "Buffered remote candidate");
            }
            CandidateDisposition::Duplicate => {}
        }
        Ok(disposition)
    }

    /// Apply every buffered candidate in arrival order. Returns how many were applied.
    ///
    /// # Errors
    ///
    /// Returns error if the link is cancelled while applying
    pub async fn flush_candidates(&mut self) -> Result<usize, NegotiationError> {
        if !self.has_remote_description() {
            return Ok(0);
        }
        let pending = self.candidates.drain();
        let count = pending.len();
        for candidate in pending {
            self.apply_candidate(candidate).await?;
        }
        if count > 0 {
            tracing::debug!(remote = %self.remote, count, "Flushed buffered candidates");
        }
        Ok(count)
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let connection = Arc::clone(&self.connection);
        match self
            .guarded(connection.add_ice_candidate(candidate.clone()))
            .await
        {
            Ok(()) => Ok(()),
            Err(NegotiationError::Cancelled) => Err(NegotiationError::Cancelled),
            Err(e) => {
                tracing::warn!(
                    remote = %self.remote,
                    candidate = %candidate.candidate,
                    error = %e,
                    "Failed to apply remote candidate"
                );
                Ok(())
            }
        }
    }

    fn descriptions_complete(&self) -> bool {
        self.local_descriptions_applied > 0 && self.remote_descriptions_applied > 0
    }

    fn promote_if_ready(&mut self) -> Result<(), NegotiationError> {
        if self.connectivity_ready
            && self.descriptions_complete()
            && matches!(self.state, LinkState::AnswerApplied | LinkState::AnswerSent)
        {
            self.transition(LinkState::Connected)?;
        }
        Ok(())
    }

    /// Apply a connectivity signal from the backend
    ///
    /// `Connected` only takes effect once both descriptions are applied; earlier signals
    /// are remembered and honoured when negotiation completes.
    ///
    /// # Errors
    ///
    /// Returns error if the resulting transition is not allowed
    pub fn on_connectivity(&mut self, connectivity: ConnectivityState) -> Result<(), NegotiationError> {
        if self.state.is_terminal() {
            return Ok(());
        }

        match connectivity {
            ConnectivityState::Connected => {
                self.connectivity_ready = true;
                if self.state == LinkState::Disconnected {
                    match self.resume_state.take() {
                        Some(resume) if resume.is_negotiating() => {
                            self.transition(resume)?;
                            self.promote_if_ready()
                        }
                        _ => self.transition(LinkState::Connected),
                    }
                } else {
                    self.promote_if_ready()
                }
            }
            ConnectivityState::Disconnected => {
                self.connectivity_ready = false;
                match self.state {
                    LinkState::New | LinkState::Disconnected => Ok(()),
                    state => {
                        if state.is_negotiating() {
                            self.resume_state = Some(state);
                        }
                        self.transition(LinkState::Disconnected)
                    }
                }
            }
            ConnectivityState::Failed => self.fail("connectivity failed"),
        }
    }

    /// Whether negotiation has been outstanding longer than `timeout`
    #[must_use]
    pub fn is_stalled(&self, timeout: Duration) -> bool {
        !self.state.is_terminal()
            && self
                .negotiation_started
                .is_some_and(|started| started.elapsed() > timeout)
    }

    /// Attach remote media. Ignored unless a remote description is applied.
    pub fn set_remote_media(&mut self, media: RemoteMediaHandle) -> bool {
        let allowed = matches!(
            self.progress_state(),
            LinkState::OfferReceived
                | LinkState::AnswerCreated
                | LinkState::AnswerSent
                | LinkState::AnswerApplied
                | LinkState::Connected
                | LinkState::Disconnected
        );
        if !allowed || self.state.is_terminal() {
            tracing::debug!(remote = %self.remote, state = ?self.state, "Ignoring remote media before remote description");
            return false;
        }
        self.remote_media = Some(media);
        true
    }

    /// Mark the link failed
    ///
    /// # Errors
    ///
    /// Returns error if the link is already closed
    pub fn fail(&mut self, reason: &str) -> Result<(), NegotiationError> {
        if self.state == LinkState::Failed {
            return Ok(());
        }
        tracing::warn!(remote = %self.remote, state = ?self.state, reason, "Peer link failed");
        self.resume_state = None;
        self.transition(LinkState::Failed)
    }

    /// Cancel in-flight operations, close the connection and discard link state
    ///
    /// Returns false when the link was already closed.
    pub async fn close(&mut self) -> bool {
        if self.state == LinkState::Closed {
            return false;
        }
        self.cancel.cancel();

        if let Err(e) = self.connection.close().await {
            tracing::warn!(remote = %self.remote, error = %e, "Error closing connection");
        }

        self.candidates.clear();
        self.remote_media = None;
        self.resume_state = None;
        self.negotiation_started = None;
        if let Err(e) = self.transition(LinkState::Closed) {
            tracing::warn!(remote = %self.remote, error = %e, "Unexpected close transition");
            self.state = LinkState::Closed;
        }
        true
    }
}

fn validate_description(
    desc: &SessionDescription,
    expected: SdpType,
) -> Result<(), NegotiationError> {
    if desc.sdp_type != expected {
        return Err(NegotiationError::InvalidDescription(format!(
            "expected {expected:?}, got {:?}",
            desc.sdp_type
        )));
    }
    if desc.sdp.trim().is_empty() {
        return Err(NegotiationError::InvalidDescription(
            "empty description".to_string(),
        ));
    }
    Ok(())
}
