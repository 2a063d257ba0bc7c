//! Meshcall - multi-party mesh call signaling
//!
//! This library coordinates small video calls scoped to a project room. Every pair of
//! participants holds its own peer connection (a full mesh) and negotiates it through a
//! relay that only routes messages. It features:
//!
//! - **Call Sessions**: join, leave and end-for-all with idempotent teardown
//! - **Peer Links**: an explicit offer/answer state machine per remote participant
//! - **Candidate Buffering**: remote candidates held until the remote description is set
//! - **Media Toggles**: mute/unmute without renegotiation
//! - **Pluggable Backends**: WebRTC connections or an in-process loopback
//!
//! # Examples
//!
//! ```rust,no_run
//! use meshcall_core::{
//!     CallSession, InMemoryRelay, LocalParticipant, LoopbackConnectionFactory,
//!     ProjectId, SessionConfig, StaticMediaSource,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let relay = InMemoryRelay::new();
//! let project = ProjectId::from("apollo");
//!
//! let mut session = CallSession::new(
//!     Arc::new(relay.connect(&project)),
//!     Arc::new(LoopbackConnectionFactory::new("alice")),
//!     Arc::new(StaticMediaSource::granting()),
//!     LocalParticipant::new(project, "alice", "Alice"),
//!     SessionConfig::default(),
//! );
//!
//! session.start_session().await?;
//! let handle = session.handle();
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     handle.cancel();
//! });
//! session.run().await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Core call, link and media types
pub mod types;

/// Participant and project identifiers
pub mod identity;

/// Session configuration
pub mod config;

/// Signaling protocol and handlers
pub mod signaling;

/// Local media handle and acquisition
pub mod media;

/// Remote candidate buffering
pub mod ice_queue;

/// Connection backend abstraction
pub mod connection;

/// Peer link negotiation state machine
pub mod peer_link;

/// Mute/unmute announcements
pub mod toggle;

/// Incoming call notifications
pub mod notification;

/// Call session management
pub mod session;

/// In-process project-room relay
pub mod relay;

/// In-process connection backend
pub mod loopback;

/// WebRTC connection backend (requires webrtc-backend feature)
#[cfg(feature = "webrtc-backend")]
pub mod webrtc_backend;

/// WebSocket signaling transport (requires websocket feature)
#[cfg(feature = "websocket")]
pub mod websocket;

// Re-export main types at crate root
pub use config::{SessionConfig, SessionConfigBuilder, MIN_TIMEOUT_CHECK_INTERVAL};
pub use connection::{
    ConnectionFactory, LinkEnvelope, LinkEvent, LinkEventSink, LinkId, NegotiationError,
    PeerConnection,
};
pub use ice_queue::{CandidateDisposition, CandidateQueue};
pub use identity::{ParticipantId, ProjectId};
pub use loopback::{LoopbackBehavior, LoopbackConnection, LoopbackConnectionFactory, LoopbackOp};
pub use media::{LocalMediaHandle, LocalTrack, MediaError, MediaSource, MediaState, StaticMediaSource};
pub use notification::{IncomingCallNotifier, NotificationEvent};
pub use peer_link::PeerLink;
pub use relay::{InMemoryRelay, RelayEndpoint, RelayError};
pub use session::{CallSession, LocalParticipant, SessionError, SessionHandle};
pub use signaling::{
    CallInvitation, SignalingError, SignalingHandler, SignalingMessage, SignalingTransport,
};
pub use toggle::{MediaToggleBroadcaster, RemoteMediaFlags};
pub use types::*;
#[cfg(feature = "webrtc-backend")]
pub use webrtc_backend::WebRtcConnectionFactory;
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketError, WebSocketTransport};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::SessionConfig;
    pub use crate::connection::{ConnectionFactory, PeerConnection};
    pub use crate::identity::{ParticipantId, ProjectId};
    pub use crate::media::{MediaSource, StaticMediaSource};
    pub use crate::relay::InMemoryRelay;
    pub use crate::session::{CallSession, LocalParticipant, SessionError, SessionHandle};
    pub use crate::signaling::{SignalingMessage, SignalingTransport};
    pub use crate::types::{
        LinkRole, LinkState, MediaConstraints, MediaKind, SessionEvent, SessionState,
    };
}
