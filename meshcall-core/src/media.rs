//! Local media handle and acquisition
//!
//! The capture device itself lives outside this crate. A [`MediaSource`] hands out a
//! [`LocalMediaHandle`], which the call session owns exclusively. Peer links receive clones
//! of the handle to attach its tracks; clones share state, so enabling or disabling a track
//! through the session is observed by every link at once without renegotiation.

use crate::types::{MediaConstraints, MediaKind};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The user or platform refused access to a capture device
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Constraints asked for neither audio nor video
    #[error("No media kind requested")]
    NothingRequested,
}

/// One captured track exposed by a local media handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    /// Track identifier, unique within the handle
    pub id: String,
    /// Track kind
    pub kind: MediaKind,
}

type ReleaseHook = Box<dyn Fn() + Send + Sync>;

struct LocalMediaInner {
    stream_id: String,
    tracks: Vec<LocalTrack>,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
    released: AtomicBool,
    release_count: AtomicUsize,
    on_release: Option<ReleaseHook>,
}

/// Shared handle to the local capture stream
///
/// Cloning is cheap and never copies media. Only the owning session may toggle tracks or
/// release the handle; links only read from it.
#[derive(Clone)]
pub struct LocalMediaHandle {
    inner: Arc<LocalMediaInner>,
}

impl LocalMediaHandle {
    /// Create a handle over the given tracks, all enabled
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self::build(tracks, None)
    }

    /// Create a handle that invokes `hook` exactly once when released
    pub fn with_release_hook(
        tracks: Vec<LocalTrack>,
        hook: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self::build(tracks, Some(Box::new(hook)))
    }

    fn build(tracks: Vec<LocalTrack>, on_release: Option<ReleaseHook>) -> Self {
        Self {
            inner: Arc::new(LocalMediaInner {
                stream_id: Uuid::new_v4().to_string(),
                tracks,
                audio_enabled: AtomicBool::new(true),
                video_enabled: AtomicBool::new(true),
                released: AtomicBool::new(false),
                release_count: AtomicUsize::new(0),
                on_release,
            }),
        }
    }

    /// Stream identifier shared by all tracks of the handle
    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    /// Captured tracks
    #[must_use]
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.inner.tracks
    }

    /// Whether a track of `kind` was acquired
    #[must_use]
    pub fn has(&self, kind: MediaKind) -> bool {
        self.inner.tracks.iter().any(|t| t.kind == kind)
    }

    /// Whether the `kind` track currently carries media
    #[must_use]
    pub fn is_enabled(&self, kind: MediaKind) -> bool {
        self.has(kind) && self.flag(kind).load(Ordering::Acquire)
    }

    /// Enable or disable the `kind` track. Returns false when no such track exists.
    pub(crate) fn set_enabled(&self, kind: MediaKind, enabled: bool) -> bool {
        if !self.has(kind) {
            return false;
        }
        self.flag(kind).store(enabled, Ordering::Release);
        true
    }

    /// Stop capture. Only the first call has an effect; returns whether it did.
    pub(crate) fn release(&self) -> bool {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.release_count.fetch_add(1, Ordering::AcqRel);
        if let Some(hook) = &self.inner.on_release {
            hook();
        }
        true
    }

    /// Whether capture was stopped
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Number of releases actually performed (0 or 1)
    #[must_use]
    pub fn release_count(&self) -> usize {
        self.inner.release_count.load(Ordering::Acquire)
    }

    fn flag(&self, kind: MediaKind) -> &AtomicBool {
        match kind {
            MediaKind::Audio => &self.inner.audio_enabled,
            MediaKind::Video => &self.inner.video_enabled,
        }
    }
}

impl fmt::Debug for LocalMediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMediaHandle")
            .field("stream_id", &self.inner.stream_id)
            .field("tracks", &self.inner.tracks)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Local media state, mutated only by the call session
#[derive(Debug, Clone, Default)]
pub struct MediaState {
    /// Camera enabled
    pub video_enabled: bool,
    /// Microphone enabled
    pub audio_enabled: bool,
    /// Acquired capture handle, present while the session holds media
    pub local_media: Option<LocalMediaHandle>,
}

impl MediaState {
    /// State right after acquiring `handle`
    pub fn acquired(handle: LocalMediaHandle) -> Self {
        Self {
            video_enabled: handle.is_enabled(MediaKind::Video),
            audio_enabled: handle.is_enabled(MediaKind::Audio),
            local_media: Some(handle),
        }
    }

    /// Enabled flag for `kind`
    #[must_use]
    pub fn is_enabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio_enabled,
            MediaKind::Video => self.video_enabled,
        }
    }

    pub(crate) fn set(&mut self, kind: MediaKind, enabled: bool) {
        match kind {
            MediaKind::Audio => self.audio_enabled = enabled,
            MediaKind::Video => self.video_enabled = enabled,
        }
    }
}

/// Source of local capture streams
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire capture tracks matching `constraints`
    ///
    /// # Errors
    ///
    /// Returns error if the device is missing or access is denied
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaHandle, MediaError>;
}

/// Synthetic media source that grants or denies every request
#[derive(Debug, Default)]
pub struct StaticMediaSource {
    denial: Option<MediaError>,
    acquisitions: AtomicUsize,
}

impl StaticMediaSource {
    /// Source that grants every request
    #[must_use]
    pub fn granting() -> Self {
        Self::default()
    }

    /// Source that fails every request with `error`
    #[must_use]
    pub fn denying(error: MediaError) -> Self {
        Self {
            denial: Some(error),
            acquisitions: AtomicUsize::new(0),
        }
    }

    /// Number of successful acquisitions
    #[must_use]
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::Acquire)
    }
}

#[async_trait]
impl MediaSource for StaticMediaSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaHandle, MediaError> {
        if let Some(error) = &self.denial {
            tracing::warn!(error = %error, "Media acquisition denied");
            return Err(error.clone());
        }

        let kinds = constraints.to_media_kinds();
        if kinds.is_empty() {
            return Err(MediaError::NothingRequested);
        }

        let tracks = kinds
            .into_iter()
            .map(|kind| LocalTrack {
                id: format!("{}-{}", kind, Uuid::new_v4()),
                kind,
            })
            .collect();

        self.acquisitions.fetch_add(1, Ordering::AcqRel);
        Ok(LocalMediaHandle::new(tracks))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_source_grants_requested_kinds() {
        let source = StaticMediaSource::granting();
        let handle = source
            .acquire(&MediaConstraints::audio_only())
            .await
            .unwrap();

        assert!(handle.has(MediaKind::Audio));
        assert!(!handle.has(MediaKind::Video));
        assert!(handle.is_enabled(MediaKind::Audio));
        assert!(!handle.is_enabled(MediaKind::Video));
        assert_eq!(source.acquisitions(), 1);
    }

    #[tokio::test]
    async fn test_static_source_denial() {
        let source = StaticMediaSource::denying(MediaError::PermissionDenied("camera".into()));
        let res = source.acquire(&MediaConstraints::video_call()).await;
        assert!(matches!(res, Err(MediaError::PermissionDenied(_))));
        assert_eq!(source.acquisitions(), 0);
    }

    #[tokio::test]
    async fn test_nothing_requested() {
        let source = StaticMediaSource::granting();
        let res = source
            .acquire(&MediaConstraints {
                audio: false,
                video: false,
            })
            .await;
        assert_eq!(res.unwrap_err(), MediaError::NothingRequested);
    }

    #[test]
    fn test_toggle_is_shared_between_clones() {
        let handle = LocalMediaHandle::new(vec![LocalTrack {
            id: "mic".into(),
            kind: MediaKind::Audio,
        }]);
        let link_view = handle.clone();

        assert!(handle.set_enabled(MediaKind::Audio, false));
        assert!(!link_view.is_enabled(MediaKind::Audio));
        assert!(!handle.set_enabled(MediaKind::Video, false));
    }

    #[test]
    fn test_release_runs_hook_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handle = LocalMediaHandle::with_release_hook(Vec::new(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(handle.release());
        assert!(!handle.clone().release());
        assert!(handle.is_released());
        assert_eq!(handle.release_count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
