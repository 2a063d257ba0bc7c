//! Call, link and media types shared across the crate

use crate::identity::ParticipantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one call session instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a new random session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of local media track that can be toggled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Microphone track
    Audio,
    /// Camera track
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Media constraints used when acquiring local media
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Acquire a microphone track
    pub audio: bool,
    /// Acquire a camera track
    pub video: bool,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    /// Convert to media kinds
    pub fn to_media_kinds(&self) -> Vec<MediaKind> {
        let mut kinds = Vec::new();
        if self.audio {
            kinds.push(MediaKind::Audio);
        }
        if self.video {
            kinds.push(MediaKind::Video);
        }
        kinds
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::video_call()
    }
}

/// Lifecycle state of a call session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Not started
    Idle,
    /// Acquiring local media
    Initializing,
    /// Joined the room and negotiating/connected with peers
    Active,
    /// Tearing down
    Ending,
    /// Terminal
    Ended,
}

/// Which side of the description exchange a link plays. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkRole {
    /// Creates and sends the offer
    Offerer,
    /// Applies the remote offer and answers it
    Answerer,
}

/// Negotiation state of one peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    /// Created, nothing applied yet
    New,
    /// Offer generated and applied as local description
    OfferCreated,
    /// Offer handed to the relay
    OfferSent,
    /// Remote offer applied as remote description
    OfferReceived,
    /// Answer generated and applied as local description
    AnswerCreated,
    /// Answer handed to the relay
    AnswerSent,
    /// Remote answer applied as remote description
    AnswerApplied,
    /// Media path established
    Connected,
    /// Transient loss of connectivity
    Disconnected,
    /// Unrecoverable; the link is about to be removed
    Failed,
    /// Torn down
    Closed,
}

impl LinkState {
    /// Whether the link can no longer make progress
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    /// Whether a negotiation is still in progress towards `Connected`
    #[must_use]
    pub fn is_negotiating(self) -> bool {
        matches!(
            self,
            Self::OfferCreated
                | Self::OfferSent
                | Self::OfferReceived
                | Self::AnswerCreated
                | Self::AnswerSent
                | Self::AnswerApplied
        )
    }
}

/// Connectivity signal reported by the connection backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectivityState {
    /// A usable path was found
    Connected,
    /// The path was lost, may recover
    Disconnected,
    /// No path can be found
    Failed,
}

/// Description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Session description exchanged over the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate exchanged over the relay
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// SDP media ID
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate with only the candidate line set
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Remote party visible in the room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Participant identifier
    pub id: ParticipantId,
    /// Name shown on the participant's tile
    pub display_name: String,
    /// Relay connection handle; absent when learned from an offer
    pub transport_handle: Option<String>,
    /// When this session first observed the participant
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    /// Create a participant observed now
    pub fn new(
        id: ParticipantId,
        display_name: impl Into<String>,
        transport_handle: Option<String>,
    ) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            transport_handle,
            joined_at: Utc::now(),
        }
    }
}

/// Opaque handle to the media arriving from one remote participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMediaHandle {
    /// Backend stream identifier
    pub stream_id: String,
    /// Kinds of tracks received so far
    pub kinds: Vec<MediaKind>,
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The local participant left
    Left,
    /// The local participant ended the call for everyone
    EndedByLocal,
    /// Another participant ended the call for everyone
    EndedByRemote,
    /// The session was cancelled through its handle
    Cancelled,
}

/// Session event for observers (UI, diagnostics)
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Session lifecycle state changed
    StateChanged {
        /// Previous state
        old: SessionState,
        /// New state
        new: SessionState,
    },
    /// A remote participant is now known
    ParticipantJoined {
        /// The participant
        participant: Participant,
    },
    /// A remote participant left or was dropped
    ParticipantLeft {
        /// Participant identifier
        id: ParticipantId,
    },
    /// A link changed state
    LinkStateChanged {
        /// Remote end of the link
        remote: ParticipantId,
        /// Previous state
        old: LinkState,
        /// New state
        new: LinkState,
    },
    /// Remote tracks arrived for a link
    RemoteMediaAvailable {
        /// Remote end of the link
        remote: ParticipantId,
        /// Media handle
        media: RemoteMediaHandle,
    },
    /// A remote participant muted or unmuted
    RemoteMediaChanged {
        /// Participant identifier
        remote: ParticipantId,
        /// Track kind
        kind: MediaKind,
        /// Whether the track is enabled
        enabled: bool,
    },
    /// A link failed and was removed
    LinkFailed {
        /// Remote end of the link
        remote: ParticipantId,
        /// Failure description
        reason: String,
    },
    /// A message was ignored as stale or duplicate
    StaleMessage {
        /// Wire event name
        kind: &'static str,
        /// Sender, when the message carries one
        from: Option<ParticipantId>,
    },
    /// The relay subscription reported an error
    RelayDisconnected {
        /// Error description
        error: String,
    },
    /// The relay delivered a message after a disconnection
    RelayReconnected,
    /// The session reached `Ended`
    SessionEnded {
        /// Why it ended
        reason: EndReason,
    },
}
