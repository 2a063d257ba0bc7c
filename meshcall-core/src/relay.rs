//! In-process project-room relay
//!
//! A broker with the routing semantics of the production relay: sockets subscribe to a
//! project room, a subset of them joins the call, addressed messages go to exactly one
//! call member and everything else fans out to the room except the sender.
//!
//! Routing happens under a single lock and every socket has its own FIFO inbox, so joins
//! are serialized and messages from one sender arrive in the order they were sent.

use crate::identity::{ParticipantId, ProjectId};
use crate::signaling::{
    CallEndedPayload, MediaChangedPayload, ParticipantJoinedPayload, ParticipantLeftPayload,
    SignalingMessage, SignalingTransport,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Relay errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The endpoint is no longer connected to the relay
    #[error("Disconnected from relay")]
    Disconnected,

    /// Clients may not send relay-to-client events
    #[error("Unexpected event from client: {0}")]
    UnexpectedEvent(&'static str),
}

#[derive(Debug, Clone)]
struct CallMember {
    socket_id: String,
    user_id: ParticipantId,
    user_name: String,
}

#[derive(Debug, Default)]
struct Room {
    subscribers: Vec<String>,
    call: Vec<CallMember>,
}

#[derive(Debug)]
struct Socket {
    project_id: ProjectId,
    inbox: mpsc::UnboundedSender<SignalingMessage>,
}

#[derive(Debug, Default)]
struct RelayState {
    next_socket: u64,
    sockets: HashMap<String, Socket>,
    rooms: HashMap<ProjectId, Room>,
}

impl RelayState {
    fn deliver(&self, socket_id: &str, message: SignalingMessage) {
        match self.sockets.get(socket_id) {
            Some(socket) => {
                if socket.inbox.send(message).is_err() {
                    tracing::debug!(socket = socket_id, "Inbox closed, dropping message");
                }
            }
            None => tracing::debug!(socket = socket_id, "Unknown socket, dropping message"),
        }
    }

    fn deliver_to_call(&self, project: &ProjectId, except: &str, message: &SignalingMessage) {
        if let Some(room) = self.rooms.get(project) {
            for member in room.call.iter().filter(|m| m.socket_id != except) {
                self.deliver(&member.socket_id, message.clone());
            }
        }
    }

    fn deliver_to_room(&self, project: &ProjectId, except: &str, message: &SignalingMessage) {
        if let Some(room) = self.rooms.get(project) {
            for socket_id in room.subscribers.iter().filter(|s| s.as_str() != except) {
                self.deliver(socket_id, message.clone());
            }
        }
    }

    fn remove_call_member(&mut self, project: &ProjectId, socket_id: &str) -> Option<CallMember> {
        let room = self.rooms.get_mut(project)?;
        let index = room.call.iter().position(|m| m.socket_id == socket_id)?;
        Some(room.call.remove(index))
    }
}

/// In-process relay shared by every endpoint connected to it
#[derive(Debug, Clone, Default)]
pub struct InMemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl InMemoryRelay {
    /// Create an empty relay
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a socket subscribed to the room of `project_id`
    pub fn connect(&self, project_id: &ProjectId) -> RelayEndpoint {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.next_socket += 1;
        let socket_id = format!("socket-{}", state.next_socket);

        state.sockets.insert(
            socket_id.clone(),
            Socket {
                project_id: project_id.clone(),
                inbox: tx,
            },
        );
        state
            .rooms
            .entry(project_id.clone())
            .or_default()
            .subscribers
            .push(socket_id.clone());

        tracing::debug!(socket = %socket_id, project = %project_id, "Socket connected");

        RelayEndpoint {
            relay: self.clone(),
            socket_id,
            inbox: tokio::sync::Mutex::new(rx),
        }
    }

    /// Drop a socket as if its connection was lost
    ///
    /// Remaining call members are told the participant left.
    pub fn disconnect(&self, socket_id: &str) {
        let mut state = self.state.lock();
        let Some(socket) = state.sockets.remove(socket_id) else {
            return;
        };
        let project = socket.project_id;

        if let Some(room) = state.rooms.get_mut(&project) {
            room.subscribers.retain(|s| s != socket_id);
        }
        if let Some(member) = state.remove_call_member(&project, socket_id) {
            let left = SignalingMessage::ParticipantLeft(ParticipantLeftPayload {
                user_id: member.user_id,
                user_name: member.user_name,
            });
            state.deliver_to_call(&project, socket_id, &left);
        }
        if state
            .rooms
            .get(&project)
            .is_some_and(|r| r.subscribers.is_empty() && r.call.is_empty())
        {
            state.rooms.remove(&project);
        }

        tracing::debug!(socket = socket_id, project = %project, "Socket disconnected");
    }

    /// Participants currently in the call of `project_id`, in join order
    #[must_use]
    pub fn call_members(&self, project_id: &ProjectId) -> Vec<ParticipantId> {
        self.state
            .lock()
            .rooms
            .get(project_id)
            .map(|r| r.call.iter().map(|m| m.user_id.clone()).collect())
            .unwrap_or_default()
    }

    /// Sockets subscribed to the room of `project_id`
    #[must_use]
    pub fn subscriber_count(&self, project_id: &ProjectId) -> usize {
        self.state
            .lock()
            .rooms
            .get(project_id)
            .map_or(0, |r| r.subscribers.len())
    }

    fn route(&self, socket_id: &str, message: SignalingMessage) -> Result<(), RelayError> {
        let mut state = self.state.lock();
        let project = state
            .sockets
            .get(socket_id)
            .map(|s| s.project_id.clone())
            .ok_or(RelayError::Disconnected)?;

        match message {
            SignalingMessage::Join(action) => {
                let room = state.rooms.entry(project.clone()).or_default();
                // A participant rejoining from a new socket replaces the old entry
                room.call
                    .retain(|m| m.socket_id != socket_id && m.user_id != action.user_id);
                room.call.push(CallMember {
                    socket_id: socket_id.to_string(),
                    user_id: action.user_id.clone(),
                    user_name: action.user_name.clone(),
                });

                let joined = SignalingMessage::ParticipantJoined(ParticipantJoinedPayload {
                    user_id: action.user_id,
                    user_name: action.user_name,
                    socket_id: socket_id.to_string(),
                });
                state.deliver_to_call(&project, socket_id, &joined);
            }
            SignalingMessage::Offer(_)
            | SignalingMessage::Answer(_)
            | SignalingMessage::IceCandidate(_) => {
                let target = message.to().and_then(|to| {
                    state
                        .rooms
                        .get(&project)
                        .and_then(|r| r.call.iter().find(|m| &m.user_id == to))
                        .map(|m| m.socket_id.clone())
                });
                match target {
                    Some(target) => state.deliver(&target, message),
                    None => tracing::debug!(
                        event = message.event_name(),
                        to = ?message.to(),
                        "Addressee not in call, dropping"
                    ),
                }
            }
            SignalingMessage::ToggleMedia(toggle) => {
                let changed = SignalingMessage::MediaChanged(MediaChangedPayload {
                    user_id: toggle.user_id,
                    media_type: toggle.media_type,
                    enabled: toggle.enabled,
                });
                state.deliver_to_call(&project, socket_id, &changed);
            }
            SignalingMessage::Leave(_) => {
                if let Some(member) = state.remove_call_member(&project, socket_id) {
                    let left = SignalingMessage::ParticipantLeft(ParticipantLeftPayload {
                        user_id: member.user_id,
                        user_name: member.user_name,
                    });
                    state.deliver_to_call(&project, socket_id, &left);
                } else {
                    tracing::debug!(socket = socket_id, "Leave from socket not in call");
                }
            }
            SignalingMessage::EndCall(action) => {
                let ended = SignalingMessage::CallEnded(CallEndedPayload {
                    ended_by: Some(action.user_id),
                });
                state.deliver_to_room(&project, socket_id, &ended);
                if let Some(room) = state.rooms.get_mut(&project) {
                    room.call.clear();
                }
            }
            SignalingMessage::StartCall(invitation) => {
                let incoming = SignalingMessage::IncomingCall(invitation);
                state.deliver_to_room(&project, socket_id, &incoming);
            }
            SignalingMessage::ParticipantJoined(_)
            | SignalingMessage::MediaChanged(_)
            | SignalingMessage::ParticipantLeft(_)
            | SignalingMessage::CallEnded(_)
            | SignalingMessage::IncomingCall(_) => {
                return Err(RelayError::UnexpectedEvent(message.event_name()));
            }
        }
        Ok(())
    }
}

/// One socket connected to an [`InMemoryRelay`]
///
/// Dropping the endpoint disconnects the socket.
#[derive(Debug)]
pub struct RelayEndpoint {
    relay: InMemoryRelay,
    socket_id: String,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<SignalingMessage>>,
}

impl RelayEndpoint {
    /// Relay-assigned socket identifier
    #[must_use]
    pub fn socket_id(&self) -> &str {
        &self.socket_id
    }

    /// Relay this endpoint is connected to
    #[must_use]
    pub fn relay(&self) -> &InMemoryRelay {
        &self.relay
    }

    /// Take a message already waiting in the inbox without blocking
    pub fn try_receive(&self) -> Option<SignalingMessage> {
        self.inbox.try_lock().ok()?.try_recv().ok()
    }
}

#[async_trait]
impl SignalingTransport for RelayEndpoint {
    type Error = RelayError;

    async fn send_message(&self, message: SignalingMessage) -> Result<(), RelayError> {
        self.relay.route(&self.socket_id, message)
    }

    async fn receive_message(&self) -> Result<SignalingMessage, RelayError> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or(RelayError::Disconnected)
    }
}

impl Drop for RelayEndpoint {
    fn drop(&mut self) {
        self.relay.disconnect(&self.socket_id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::signaling::{CallInvitation, OfferPayload, ParticipantAction, ToggleMediaPayload};
    use crate::types::{MediaKind, SessionDescription};

    fn project() -> ProjectId {
        ProjectId::from("p1")
    }

    fn join(user: &str) -> SignalingMessage {
        SignalingMessage::Join(ParticipantAction {
            project_id: project(),
            user_id: ParticipantId::from(user),
            user_name: user.to_uppercase(),
        })
    }

    #[tokio::test]
    async fn test_join_is_announced_to_existing_members_only() {
        let relay = InMemoryRelay::new();
        let a = relay.connect(&project());
        let b = relay.connect(&project());

        a.send_message(join("alice")).await.unwrap();
        assert!(a.try_receive().is_none());
        assert!(b.try_receive().is_none());

        b.send_message(join("bob")).await.unwrap();
        let msg = a.receive_message().await.unwrap();
        assert!(matches!(
            msg,
            SignalingMessage::ParticipantJoined(ref p) if p.user_id.as_str() == "bob"
        ));
        assert!(b.try_receive().is_none());
        assert_eq!(
            relay.call_members(&project()),
            vec![ParticipantId::from("alice"), ParticipantId::from("bob")]
        );
    }

    #[tokio::test]
    async fn test_addressed_messages_reach_only_addressee() {
        let relay = InMemoryRelay::new();
        let a = relay.connect(&project());
        let b = relay.connect(&project());
        let c = relay.connect(&project());
        for (ep, user) in [(&a, "alice"), (&b, "bob"), (&c, "carol")] {
            ep.send_message(join(user)).await.unwrap();
        }
        while a.try_receive().is_some() {}
        while b.try_receive().is_some() {}

        let offer = SignalingMessage::Offer(OfferPayload {
            offer: SessionDescription::offer("v=0"),
            to: ParticipantId::from("bob"),
            from: ParticipantId::from("carol"),
            from_name: "CAROL".into(),
        });
        c.send_message(offer.clone()).await.unwrap();

        assert_eq!(b.try_receive(), Some(offer));
        assert!(a.try_receive().is_none());
        assert!(c.try_receive().is_none());
    }

    #[tokio::test]
    async fn test_toggle_is_translated_and_fanned_out() {
        let relay = InMemoryRelay::new();
        let a = relay.connect(&project());
        let b = relay.connect(&project());
        a.send_message(join("alice")).await.unwrap();
        b.send_message(join("bob")).await.unwrap();
        while a.try_receive().is_some() {}

        a.send_message(SignalingMessage::ToggleMedia(ToggleMediaPayload {
            project_id: project(),
            user_id: ParticipantId::from("alice"),
            media_type: MediaKind::Audio,
            enabled: false,
        }))
        .await
        .unwrap();

        assert!(matches!(
            b.try_receive(),
            Some(SignalingMessage::MediaChanged(ref p)) if !p.enabled && p.media_type == MediaKind::Audio
        ));
        assert!(a.try_receive().is_none());
    }

    #[tokio::test]
    async fn test_invitation_and_end_reach_whole_room() {
        let relay = InMemoryRelay::new();
        let caller = relay.connect(&project());
        let watcher = relay.connect(&project());

        caller
            .send_message(SignalingMessage::StartCall(CallInvitation {
                project_id: project(),
                caller_id: ParticipantId::from("alice"),
                caller_name: "ALICE".into(),
                project_name: "Apollo".into(),
            }))
            .await
            .unwrap();
        assert!(matches!(
            watcher.try_receive(),
            Some(SignalingMessage::IncomingCall(_))
        ));

        caller.send_message(join("alice")).await.unwrap();
        caller
            .send_message(SignalingMessage::EndCall(ParticipantAction {
                project_id: project(),
                user_id: ParticipantId::from("alice"),
                user_name: "ALICE".into(),
            }))
            .await
            .unwrap();
        assert!(matches!(
            watcher.try_receive(),
            Some(SignalingMessage::CallEnded(_))
        ));
        assert!(relay.call_members(&project()).is_empty());
    }

    #[tokio::test]
    async fn test_dropping_endpoint_announces_departure() {
        let relay = InMemoryRelay::new();
        let a = relay.connect(&project());
        let b = relay.connect(&project());
        a.send_message(join("alice")).await.unwrap();
        b.send_message(join("bob")).await.unwrap();
        while a.try_receive().is_some() {}

        drop(b);
        assert!(matches!(
            a.try_receive(),
            Some(SignalingMessage::ParticipantLeft(ref p)) if p.user_id.as_str() == "bob"
        ));
        assert_eq!(relay.subscriber_count(&project()), 1);
    }

    #[tokio::test]
    async fn test_disconnected_socket_errors() {
        let relay = InMemoryRelay::new();
        let a = relay.connect(&project());
        relay.disconnect(a.socket_id());

        assert_eq!(
            a.send_message(join("alice")).await,
            Err(RelayError::Disconnected)
        );
        assert_eq!(a.receive_message().await, Err(RelayError::Disconnected));
    }

    #[tokio::test]
    async fn test_relay_events_from_clients_are_rejected() {
        let relay = InMemoryRelay::new();
        let a = relay.connect(&project());
        let res = a
            .send_message(SignalingMessage::CallEnded(CallEndedPayload::default()))
            .await;
        assert_eq!(res, Err(RelayError::UnexpectedEvent("video_call_ended")));
    }
}
