//! Connection backend abstraction
//!
//! A [`PeerConnection`] wraps whatever actually moves media between two participants.
//! Session code only ever talks to these traits, so the negotiation state machine runs
//! unchanged over the WebRTC backend and the in-process loopback backend.
//!
//! Backends report asynchronous happenings (gathered candidates, connectivity changes,
//! remote tracks) through a [`LinkEventSink`]. Every event carries the [`LinkId`] of the
//! link it was created for, so events from a link that has since been replaced are
//! recognised and dropped.

use crate::identity::ParticipantId;
use crate::media::LocalMediaHandle;
use crate::types::{ConnectivityState, IceCandidate, LinkState, RemoteMediaHandle, SessionDescription};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Negotiation and connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// The operation was superseded by teardown of the link or session
    #[error("Negotiation cancelled")]
    Cancelled,

    /// The connection backend reported an error
    #[error("Backend error: {0}")]
    Backend(String),

    /// A description could not be used
    #[error("Invalid description: {0}")]
    InvalidDescription(String),

    /// The operation is not allowed in the link's current state
    #[error("Invalid link transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// Current state
        from: LinkState,
        /// Requested state
        to: LinkState,
    },

    /// The link or connection is already closed
    #[error("Connection closed")]
    Closed,

    /// More remote candidates arrived before the remote description than a link holds
    #[error("Candidate backlog exceeded {limit} before remote description")]
    CandidateBacklog {
        /// Configured per-link bound
        limit: usize,
    },

    /// A backend operation did not complete in time
    #[error("Backend operation timed out after {0:?}")]
    TimedOut(std::time::Duration),
}

/// Generation number distinguishing successive links to the same participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Asynchronous notification from a connection backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A local candidate was gathered and must be sent to the remote side
    LocalCandidate(IceCandidate),
    /// Connectivity changed
    Connectivity(ConnectivityState),
    /// Remote tracks arrived
    RemoteMedia(RemoteMediaHandle),
}

/// A [`LinkEvent`] tagged with the link it belongs to
#[derive(Debug, Clone)]
pub struct LinkEnvelope {
    /// Link generation
    pub link_id: LinkId,
    /// Remote participant of the link
    pub remote: ParticipantId,
    /// The event
    pub event: LinkEvent,
}

/// Channel end handed to a backend connection for reporting events
#[derive(Debug, Clone)]
pub struct LinkEventSink {
    link_id: LinkId,
    remote: ParticipantId,
    tx: mpsc::UnboundedSender<LinkEnvelope>,
}

impl LinkEventSink {
    /// Create a sink for the given link
    pub fn new(
        link_id: LinkId,
        remote: ParticipantId,
        tx: mpsc::UnboundedSender<LinkEnvelope>,
    ) -> Self {
        Self { link_id, remote, tx }
    }

    /// Report an event. Returns false once the session is gone.
    pub fn emit(&self, event: LinkEvent) -> bool {
        self.tx
            .send(LinkEnvelope {
                link_id: self.link_id,
                remote: self.remote.clone(),
                event,
            })
            .is_ok()
    }

    /// Link generation this sink reports for
    #[must_use]
    pub fn link_id(&self) -> LinkId {
        self.link_id
    }

    /// Remote participant this sink reports for
    #[must_use]
    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }
}

/// One connection to one remote participant
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Attach every track of the local capture handle
    ///
    /// # Errors
    ///
    /// Returns error if the backend rejects a track
    async fn attach_local_media(&self, media: &LocalMediaHandle) -> Result<(), NegotiationError>;

    /// Generate an offer
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot generate a description
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Generate an answer to the applied remote offer
    ///
    /// # Errors
    ///
    /// Returns error if no remote offer is applied or generation fails
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Apply a description generated locally
    ///
    /// # Errors
    ///
    /// Returns error if the backend rejects the description
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError>;

    /// Apply a description received from the remote side
    ///
    /// # Errors
    ///
    /// Returns error if the backend rejects the description
    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), NegotiationError>;

    /// Apply a remote connectivity candidate
    ///
    /// # Errors
    ///
    /// Returns error if the candidate cannot be parsed or applied
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Close the connection. Closing twice is not an error.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails while shutting down
    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Creates connections for new links
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Create a connection to `remote` reporting through `events`
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot allocate a connection
    async fn create_connection(
        &self,
        remote: &ParticipantId,
        events: LinkEventSink,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError>;
}
