//! In-process connection backend
//!
//! Produces synthetic descriptions and candidates and declares the link connected once
//! both descriptions and at least one remote candidate are applied. It enforces the same
//! ordering rules a real engine does (no candidates before the remote description, no
//! duplicate candidates), records every operation it sees, and can be told to misbehave
//! per remote participant. Used by the demo command and the test suites.

use crate::connection::{
    ConnectionFactory, LinkEvent, LinkEventSink, NegotiationError, PeerConnection,
};
use crate::identity::ParticipantId;
use crate::media::LocalMediaHandle;
use crate::types::{
    ConnectivityState, IceCandidate, MediaKind, RemoteMediaHandle, SdpType, SessionDescription,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Fault injection for connections to one remote participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackBehavior {
    /// Reject every remote description
    pub reject_remote_description: bool,
    /// Fail offer generation
    pub fail_create_offer: bool,
    /// Never report connectivity
    pub never_connect: bool,
    /// Delay applied to offer and answer generation
    pub generation_delay: Option<Duration>,
    /// Local candidates gathered after the local description is applied
    pub candidates_per_description: usize,
}

impl Default for LoopbackBehavior {
    fn default() -> Self {
        Self {
            reject_remote_description: false,
            fail_create_offer: false,
            never_connect: false,
            generation_delay: None,
            candidates_per_description: 2,
        }
    }
}

/// Operation observed by a loopback connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopbackOp {
    /// Local tracks attached
    AttachMedia,
    /// Offer generated
    CreateOffer,
    /// Answer generated
    CreateAnswer,
    /// Local description applied
    SetLocal(SdpType),
    /// Remote description applied
    SetRemote(SdpType),
    /// Remote candidate applied
    AddCandidate(String),
    /// Connection closed
    Close,
}

#[derive(Debug, Default)]
struct LoopbackState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied_candidates: Vec<IceCandidate>,
    attached_kinds: Vec<MediaKind>,
    ops: Vec<LoopbackOp>,
    gathered: usize,
    connected_reported: bool,
    closed: bool,
}

/// Loopback connection to one remote participant
#[derive(Debug)]
pub struct LoopbackConnection {
    local_id: ParticipantId,
    remote: ParticipantId,
    behavior: LoopbackBehavior,
    events: LinkEventSink,
    state: Mutex<LoopbackState>,
}

impl LoopbackConnection {
    fn new(
        local_id: ParticipantId,
        remote: ParticipantId,
        behavior: LoopbackBehavior,
        events: LinkEventSink,
    ) -> Self {
        Self {
            local_id,
            remote,
            behavior,
            events,
            state: Mutex::new(LoopbackState::default()),
        }
    }

    /// Remote participant of this connection
    #[must_use]
    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    /// Every operation applied so far, in order
    #[must_use]
    pub fn ops(&self) -> Vec<LoopbackOp> {
        self.state.lock().ops.clone()
    }

    /// Remote candidates applied so far, in order
    #[must_use]
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied_candidates.clone()
    }

    /// How many times a local description was applied
    #[must_use]
    pub fn local_description_count(&self) -> usize {
        self.state
            .lock()
            .ops
            .iter()
            .filter(|op| matches!(op, LoopbackOp::SetLocal(_)))
            .count()
    }

    /// How many times a remote description was applied
    #[must_use]
    pub fn remote_description_count(&self) -> usize {
        self.state
            .lock()
            .ops
            .iter()
            .filter(|op| matches!(op, LoopbackOp::SetRemote(_)))
            .count()
    }

    /// Whether the connection was closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Report a connectivity change as if the network produced it
    pub fn simulate_connectivity(&self, state: ConnectivityState) -> bool {
        self.events.emit(LinkEvent::Connectivity(state))
    }

    fn synthetic_sdp(&self, sdp_type: SdpType, kinds: &[MediaKind]) -> String {
        let mut sdp = format!(
            "v=0\r\no=loopback {} {} IN IP4 127.0.0.1\r\ns={:?}\r\nt=0 0\r\n",
            self.local_id, self.events.link_id().0, sdp_type
        );
        for (index, kind) in kinds.iter().enumerate() {
            sdp.push_str(&format!("m={kind} 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:{index}\r\n"));
        }
        sdp
    }

    async fn generation_delay(&self) {
        if let Some(delay) = self.behavior.generation_delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn ensure_open(state: &LoopbackState) -> Result<(), NegotiationError> {
        if state.closed {
            return Err(NegotiationError::Closed);
        }
        Ok(())
    }

    fn gather_candidates(&self, state: &mut LoopbackState) -> Vec<IceCandidate> {
        let mut gathered = Vec::with_capacity(self.behavior.candidates_per_description);
        for _ in 0..self.behavior.candidates_per_description {
            state.gathered += 1;
            let n = state.gathered;
            gathered.push(IceCandidate {
                candidate: format!(
                    "candidate:{}{} 1 udp 2122260223 127.0.0.1 {} typ host",
                    self.local_id,
                    n,
                    40000 + n
                ),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            });
        }
        gathered
    }

    fn maybe_connected(&self, state: &mut LoopbackState) -> bool {
        let ready = !self.behavior.never_connect
            && !state.connected_reported
            && state.local.is_some()
            && state.remote.is_some()
            && !state.applied_candidates.is_empty();
        if ready {
            state.connected_reported = true;
        }
        ready
    }
}

fn kinds_in_sdp(sdp: &str) -> Vec<MediaKind> {
    sdp.lines()
        .filter_map(|line| match line.split_whitespace().next() {
            Some("m=audio") => Some(MediaKind::Audio),
            Some("m=video") => Some(MediaKind::Video),
            _ => None,
        })
        .collect()
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn attach_local_media(&self, media: &LocalMediaHandle) -> Result<(), NegotiationError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        state.attached_kinds = media.tracks().iter().map(|t| t.kind).collect();
        state.ops.push(LoopbackOp::AttachMedia);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.generation_delay().await;
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if self.behavior.fail_create_offer {
            return Err(NegotiationError::Backend("offer generation failed".to_string()));
        }
        state.ops.push(LoopbackOp::CreateOffer);
        Ok(SessionDescription::offer(
            self.synthetic_sdp(SdpType::Offer, &state.attached_kinds),
        ))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.generation_delay().await;
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        match &state.remote {
            Some(desc) if desc.sdp_type == SdpType::Offer => {}
            _ => {
                return Err(NegotiationError::Backend(
                    "no remote offer to answer".to_string(),
                ))
            }
        }
        state.ops.push(LoopbackOp::CreateAnswer);
        Ok(SessionDescription::answer(
            self.synthetic_sdp(SdpType::Answer, &state.attached_kinds),
        ))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        let (candidates, connected) = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            state.ops.push(LoopbackOp::SetLocal(desc.sdp_type));
            state.local = Some(desc);
            let candidates = self.gather_candidates(&mut state);
            let connected = self.maybe_connected(&mut state);
            (candidates, connected)
        };

        for candidate in candidates {
            self.events.emit(LinkEvent::LocalCandidate(candidate));
        }
        if connected {
            self.events
                .emit(LinkEvent::Connectivity(ConnectivityState::Connected));
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if self.behavior.reject_remote_description {
            return Err(NegotiationError::InvalidDescription(
                "remote description rejected".to_string(),
            ));
        }
        let (media, connected) = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            let kinds = kinds_in_sdp(&desc.sdp);
            state.ops.push(LoopbackOp::SetRemote(desc.sdp_type));
            state.remote = Some(desc);
            let media = RemoteMediaHandle {
                stream_id: format!("{}-stream", self.remote),
                kinds,
            };
            (media, self.maybe_connected(&mut state))
        };

        if !media.kinds.is_empty() {
            self.events.emit(LinkEvent::RemoteMedia(media));
        }
        if connected {
            self.events
                .emit(LinkEvent::Connectivity(ConnectivityState::Connected));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let connected = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            if state.remote.is_none() {
                return Err(NegotiationError::Backend(
                    "remote description not set".to_string(),
                ));
            }
            if state.applied_candidates.contains(&candidate) {
                return Err(NegotiationError::Backend("duplicate candidate".to_string()));
            }
            state
                .ops
                .push(LoopbackOp::AddCandidate(candidate.candidate.clone()));
            state.applied_candidates.push(candidate);
            self.maybe_connected(&mut state)
        };

        if connected {
            self.events
                .emit(LinkEvent::Connectivity(ConnectivityState::Connected));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            state.ops.push(LoopbackOp::Close);
        }
        Ok(())
    }
}

/// Factory for [`LoopbackConnection`]s with per-participant behavior
#[derive(Debug)]
pub struct LoopbackConnectionFactory {
    local_id: ParticipantId,
    default_behavior: LoopbackBehavior,
    behaviors: Mutex<HashMap<ParticipantId, LoopbackBehavior>>,
    connections: Mutex<Vec<Arc<LoopbackConnection>>>,
}

impl LoopbackConnectionFactory {
    /// Create a factory for the local participant `local_id`
    pub fn new(local_id: impl Into<ParticipantId>) -> Self {
        Self {
            local_id: local_id.into(),
            default_behavior: LoopbackBehavior::default(),
            behaviors: Mutex::new(HashMap::new()),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Use `behavior` for every remote without an explicit override
    #[must_use]
    pub fn with_default_behavior(mut self, behavior: LoopbackBehavior) -> Self {
        self.default_behavior = behavior;
        self
    }

    /// Override behavior for connections to `remote` created from now on
    pub fn set_behavior(&self, remote: impl Into<ParticipantId>, behavior: LoopbackBehavior) {
        self.behaviors.lock().insert(remote.into(), behavior);
    }

    /// Every connection created to `remote`, oldest first
    #[must_use]
    pub fn connections_to(&self, remote: &ParticipantId) -> Vec<Arc<LoopbackConnection>> {
        self.connections
            .lock()
            .iter()
            .filter(|c| &c.remote == remote)
            .cloned()
            .collect()
    }

    /// Most recent connection to `remote`
    #[must_use]
    pub fn latest_connection(&self, remote: &ParticipantId) -> Option<Arc<LoopbackConnection>> {
        self.connections_to(remote).pop()
    }

    /// Total connections created
    #[must_use]
    pub fn created_count(&self) -> usize {
        self.connections.lock().len()
    }
}

#[async_trait]
impl ConnectionFactory for LoopbackConnectionFactory {
    async fn create_connection(
        &self,
        remote: &ParticipantId,
        events: LinkEventSink,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let behavior = self
            .behaviors
            .lock()
            .get(remote)
            .cloned()
            .unwrap_or_else(|| self.default_behavior.clone());

        let connection = Arc::new(LoopbackConnection::new(
            self.local_id.clone(),
            remote.clone(),
            behavior,
            events,
        ));
        self.connections.lock().push(Arc::clone(&connection));

        tracing::debug!(local = %self.local_id, remote = %remote, "Created loopback connection");
        Ok(connection)
    }
}
