//! Call signaling protocol
//!
//! Messages exchanged with the project-room relay. The relay routes addressed messages
//! (those carrying `to`) to one recipient and fans the others out to the room; it never
//! interprets payloads.
//!
//! On the wire every message is a JSON object `{"event": <name>, "data": <payload>}` with
//! camelCase payload fields.

use crate::identity::{ParticipantId, ProjectId};
use crate::types::{IceCandidate, MediaKind, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Payload could not be decoded
    #[error("Malformed signaling message: {0}")]
    Malformed(String),

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Signaling transport trait
///
/// Implement this for the channel that reaches the relay (in-memory broker, WebSocket, ...).
/// Messages are scoped to the room the transport joined; addressing is part of the payload.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Transport error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Hand a message to the relay
    async fn send_message(&self, message: SignalingMessage) -> Result<(), Self::Error>;

    /// Wait for the next message the relay delivers to this endpoint
    async fn receive_message(&self) -> Result<SignalingMessage, Self::Error>;
}

/// Payload of `join_video_call`, `leave_video_call` and `end_video_call`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantAction {
    /// Project whose room is addressed
    pub project_id: ProjectId,
    /// Acting participant
    pub user_id: ParticipantId,
    /// Acting participant's display name
    pub user_name: String,
}

/// Payload of `user_joined_video_call`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantJoinedPayload {
    /// Joining participant
    pub user_id: ParticipantId,
    /// Joining participant's display name
    pub user_name: String,
    /// Relay connection handle of the joiner
    pub socket_id: String,
}

/// Payload of `webrtc_offer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    /// Offer description
    pub offer: SessionDescription,
    /// Recipient
    pub to: ParticipantId,
    /// Sender
    pub from: ParticipantId,
    /// Sender's display name
    pub from_name: String,
}

/// Payload of `webrtc_answer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    /// Answer description
    pub answer: SessionDescription,
    /// Recipient
    pub to: ParticipantId,
    /// Sender
    pub from: ParticipantId,
}

/// Payload of `webrtc_ice_candidate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    /// Candidate
    pub candidate: IceCandidate,
    /// Recipient
    pub to: ParticipantId,
    /// Sender
    pub from: ParticipantId,
}

/// Payload of `toggle_media`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleMediaPayload {
    /// Project whose room is addressed
    pub project_id: ProjectId,
    /// Participant toggling
    pub user_id: ParticipantId,
    /// Toggled track kind
    pub media_type: MediaKind,
    /// New enabled state
    pub enabled: bool,
}

/// Payload of `user_media_changed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChangedPayload {
    /// Participant that toggled
    pub user_id: ParticipantId,
    /// Toggled track kind
    pub media_type: MediaKind,
    /// New enabled state
    pub enabled: bool,
}

/// Payload of `user_left_video_call`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantLeftPayload {
    /// Leaving participant
    pub user_id: ParticipantId,
    /// Leaving participant's display name
    pub user_name: String,
}

/// Payload of `video_call_ended`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEndedPayload {
    /// Participant who ended the call, when the relay reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_by: Option<ParticipantId>,
}

/// Payload of `start_video_call` and `incoming_video_call`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInvitation {
    /// Project whose room hosts the call
    pub project_id: ProjectId,
    /// Participant starting the call
    pub caller_id: ParticipantId,
    /// Caller's display name
    pub caller_name: String,
    /// Project name shown in the notification
    pub project_name: String,
}

/// Signaling message types
///
/// Every relay event is a variant so dispatch is checked exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SignalingMessage {
    /// Client announces it joins the call room
    #[serde(rename = "join_video_call")]
    Join(ParticipantAction),

    /// Relay announces a joiner to the members already present
    #[serde(rename = "user_joined_video_call")]
    ParticipantJoined(ParticipantJoinedPayload),

    /// Description offer, addressed
    #[serde(rename = "webrtc_offer")]
    Offer(OfferPayload),

    /// Description answer, addressed
    #[serde(rename = "webrtc_answer")]
    Answer(AnswerPayload),

    /// Connectivity candidate, addressed
    #[serde(rename = "webrtc_ice_candidate")]
    IceCandidate(IceCandidatePayload),

    /// Client announces a local mute/unmute
    #[serde(rename = "toggle_media")]
    ToggleMedia(ToggleMediaPayload),

    /// Relay announces a remote mute/unmute
    #[serde(rename = "user_media_changed")]
    MediaChanged(MediaChangedPayload),

    /// Client leaves the call room
    #[serde(rename = "leave_video_call")]
    Leave(ParticipantAction),

    /// Relay announces a participant left
    #[serde(rename = "user_left_video_call")]
    ParticipantLeft(ParticipantLeftPayload),

    /// Client ends the call for everyone
    #[serde(rename = "end_video_call")]
    EndCall(ParticipantAction),

    /// Relay announces the call was ended for everyone
    #[serde(rename = "video_call_ended")]
    CallEnded(CallEndedPayload),

    /// Client invites the project room to a call
    #[serde(rename = "start_video_call")]
    StartCall(CallInvitation),

    /// Relay delivers a call invitation
    #[serde(rename = "incoming_video_call")]
    IncomingCall(CallInvitation),
}

impl SignalingMessage {
    /// Wire event name
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Join(_) => "join_video_call",
            Self::ParticipantJoined(_) => "user_joined_video_call",
            Self::Offer(_) => "webrtc_offer",
            Self::Answer(_) => "webrtc_answer",
            Self::IceCandidate(_) => "webrtc_ice_candidate",
            Self::ToggleMedia(_) => "toggle_media",
            Self::MediaChanged(_) => "user_media_changed",
            Self::Leave(_) => "leave_video_call",
            Self::ParticipantLeft(_) => "user_left_video_call",
            Self::EndCall(_) => "end_video_call",
            Self::CallEnded(_) => "video_call_ended",
            Self::StartCall(_) => "start_video_call",
            Self::IncomingCall(_) => "incoming_video_call",
        }
    }

    /// Participant the message originates from, when carried
    #[must_use]
    pub fn from(&self) -> Option<&ParticipantId> {
        match self {
            Self::Join(p) | Self::Leave(p) | Self::EndCall(p) => Some(&p.user_id),
            Self::ParticipantJoined(p) => Some(&p.user_id),
            Self::Offer(p) => Some(&p.from),
            Self::Answer(p) => Some(&p.from),
            Self::IceCandidate(p) => Some(&p.from),
            Self::ToggleMedia(p) => Some(&p.user_id),
            Self::MediaChanged(p) => Some(&p.user_id),
            Self::ParticipantLeft(p) => Some(&p.user_id),
            Self::CallEnded(p) => p.ended_by.as_ref(),
            Self::StartCall(p) | Self::IncomingCall(p) => Some(&p.caller_id),
        }
    }

    /// Single recipient, for addressed messages
    #[must_use]
    pub fn to(&self) -> Option<&ParticipantId> {
        match self {
            Self::Offer(p) => Some(&p.to),
            Self::Answer(p) => Some(&p.to),
            Self::IceCandidate(p) => Some(&p.to),
            _ => None,
        }
    }

    /// Check if this message is sent by clients to the relay (as opposed to relay fan-out)
    #[must_use]
    pub fn is_client_to_relay(&self) -> bool {
        matches!(
            self,
            Self::Join(_)
                | Self::Leave(_)
                | Self::EndCall(_)
                | Self::ToggleMedia(_)
                | Self::StartCall(_)
        )
    }

    /// Encode as a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Malformed(e.to_string()))
    }

    /// Decode a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame is not a known event with a valid payload
    pub fn from_json(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text).map_err(|e| SignalingError::Malformed(e.to_string()))
    }
}

/// Default minimum time between receives (10ms for 100 msg/sec rate limit)
pub const DEFAULT_MIN_RECEIVE_INTERVAL: Duration = Duration::from_millis(10);

/// Signaling handler with rate limiting
pub struct SignalingHandler<T: SignalingTransport> {
    transport: Arc<T>,
    min_receive_interval: Duration,
    last_receive_time: tokio::sync::Mutex<Instant>,
    error_count: tokio::sync::Mutex<u32>,
}

impl<T: SignalingTransport> SignalingHandler<T> {
    /// Create new signaling handler
    #[must_use]
    pub fn new(transport: Arc<T>) -> Self {
        Self::with_min_receive_interval(transport, DEFAULT_MIN_RECEIVE_INTERVAL)
    }

    /// Create a handler with a custom receive rate limit (zero disables it)
    #[must_use]
    pub fn with_min_receive_interval(transport: Arc<T>, min_receive_interval: Duration) -> Self {
        Self {
            transport,
            min_receive_interval,
            last_receive_time: tokio::sync::Mutex::new(Instant::now()),
            error_count: tokio::sync::Mutex::new(0),
        }
    }

    /// Send a signaling message to the relay
    ///
    /// # Errors
    ///
    /// Returns error if sending fails
    #[tracing::instrument(skip(self, message), fields(event = message.event_name(), to = ?message.to()))]
    pub async fn send_message(&self, message: SignalingMessage) -> Result<(), T::Error> {
        tracing::debug!("Sending signaling message");
        self.transport.send_message(message).await
    }

    /// Receive a signaling message with rate limiting and backoff
    ///
    /// # Errors
    ///
    /// Returns error if receiving fails
    pub async fn receive_message(&self) -> Result<SignalingMessage, T::Error> {
        if !self.min_receive_interval.is_zero() {
            let mut last_time = self.last_receive_time.lock().await;
            let elapsed = Instant::now().duration_since(*last_time);

            if elapsed < self.min_receive_interval {
                let sleep_duration = self.min_receive_interval - elapsed;
                tracing::trace!(
                    sleep_ms = sleep_duration.as_millis(),
                    "Rate limiting applied"
                );
                drop(last_time);
                sleep(sleep_duration).await;
                last_time = self.last_receive_time.lock().await;
            }

            *last_time = Instant::now();
        }

        match self.transport.receive_message().await {
            Ok(message) => {
                *self.error_count.lock().await = 0;
                tracing::trace!(
                    event = message.event_name(),
                    from = ?message.from(),
                    "Received signaling message"
                );
                Ok(message)
            }
            Err(e) => {
                let mut error_count = self.error_count.lock().await;
                *error_count += 1;
                let count = *error_count;
                drop(error_count);

                let backoff_duration = Duration::from_millis(100 * u64::from(count.min(10)));
                tracing::warn!(
                    error_count = count,
                    backoff_ms = backoff_duration.as_millis(),
                    "Error receiving message, applying backoff"
                );
                sleep(backoff_duration).await;

                Err(e)
            }
        }
    }

    /// Get access to the underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }
}
