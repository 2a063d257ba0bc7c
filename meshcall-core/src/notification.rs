//! Incoming call notifications for project members not yet in the call

use crate::identity::{ParticipantId, ProjectId};
use crate::signaling::{CallInvitation, SignalingMessage};

/// What a project member's UI should do after a relay message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    /// Start ringing for this invitation
    Ringing(CallInvitation),
    /// Stop ringing; the call ended before it was answered
    Cancelled(CallInvitation),
}

/// Tracks the ringing state of one project room
#[derive(Debug)]
pub struct IncomingCallNotifier {
    project_id: ProjectId,
    local_id: ParticipantId,
    ringing: Option<CallInvitation>,
}

impl IncomingCallNotifier {
    /// Create a notifier for `local_id` in `project_id`
    pub fn new(project_id: ProjectId, local_id: ParticipantId) -> Self {
        Self {
            project_id,
            local_id,
            ringing: None,
        }
    }

    /// Feed a relay message; returns a notification when ringing state changes
    pub fn handle(&mut self, message: &SignalingMessage) -> Option<NotificationEvent> {
        match message {
            SignalingMessage::IncomingCall(invitation) => {
                if invitation.caller_id == self.local_id || invitation.project_id != self.project_id {
                    return None;
                }
                if self.ringing.is_some() {
                    tracing::debug!(project = %self.project_id, "Already ringing, ignoring invitation");
                    return None;
                }
                tracing::info!(
                    project = %self.project_id,
                    caller = %invitation.caller_id,
                    "Incoming call"
                );
                self.ringing = Some(invitation.clone());
                Some(NotificationEvent::Ringing(invitation.clone()))
            }
            SignalingMessage::CallEnded(_) => self.ringing.take().map(NotificationEvent::Cancelled),
            _ => None,
        }
    }

    /// Invitation currently ringing
    #[must_use]
    pub fn ringing(&self) -> Option<&CallInvitation> {
        self.ringing.as_ref()
    }

    /// Stop ringing without joining
    pub fn dismiss(&mut self) -> Option<CallInvitation> {
        self.ringing.take()
    }

    /// Stop ringing to join the call; the caller then starts a session
    pub fn accept(&mut self) -> Option<CallInvitation> {
        self.ringing.take()
    }
}
