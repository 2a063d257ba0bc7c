//! Mute/unmute announcements and remote display flags
//!
//! Toggling never touches SDP. The local side flips its track on the shared capture
//! handle and announces the change; remote sides only update what they display.

use crate::identity::{ParticipantId, ProjectId};
use crate::signaling::{MediaChangedPayload, SignalingMessage, ToggleMediaPayload};
use crate::types::MediaKind;
use std::collections::HashMap;

/// What a remote participant said about their own tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteMediaFlags {
    /// Microphone enabled
    pub audio_enabled: bool,
    /// Camera enabled
    pub video_enabled: bool,
}

impl Default for RemoteMediaFlags {
    fn default() -> Self {
        Self {
            audio_enabled: true,
            video_enabled: true,
        }
    }
}

impl RemoteMediaFlags {
    fn set(&mut self, kind: MediaKind, enabled: bool) {
        match kind {
            MediaKind::Audio => self.audio_enabled = enabled,
            MediaKind::Video => self.video_enabled = enabled,
        }
    }
}

/// Builds local toggle announcements and tracks remote ones
#[derive(Debug)]
pub struct MediaToggleBroadcaster {
    project_id: ProjectId,
    local_id: ParticipantId,
    remote: HashMap<ParticipantId, RemoteMediaFlags>,
}

impl MediaToggleBroadcaster {
    /// Create a broadcaster for `local_id` in `project_id`
    pub fn new(project_id: ProjectId, local_id: ParticipantId) -> Self {
        Self {
            project_id,
            local_id,
            remote: HashMap::new(),
        }
    }

    /// Announcement for a local toggle
    #[must_use]
    pub fn announce(&self, kind: MediaKind, enabled: bool) -> SignalingMessage {
        SignalingMessage::ToggleMedia(ToggleMediaPayload {
            project_id: self.project_id.clone(),
            user_id: self.local_id.clone(),
            media_type: kind,
            enabled,
        })
    }

    /// Record a remote toggle. Returns the updated flags, or `None` for our own echo.
    pub fn apply_remote(&mut self, change: &MediaChangedPayload) -> Option<RemoteMediaFlags> {
        if change.user_id == self.local_id {
            return None;
        }
        let flags = self.remote.entry(change.user_id.clone()).or_default();
        flags.set(change.media_type, change.enabled);
        tracing::debug!(
            remote = %change.user_id,
            kind = %change.media_type,
            enabled = change.enabled,
            "Remote media changed"
        );
        Some(*flags)
    }

    /// Display flags for `remote`; unknown participants are shown unmuted
    #[must_use]
    pub fn flags(&self, remote: &ParticipantId) -> RemoteMediaFlags {
        self.remote.get(remote).copied().unwrap_or_default()
    }

    /// Drop state for a departed participant
    pub fn forget(&mut self, remote: &ParticipantId) {
        self.remote.remove(remote);
    }

    /// Drop all remote state
    pub fn clear(&mut self) {
        self.remote.clear();
    }
}
