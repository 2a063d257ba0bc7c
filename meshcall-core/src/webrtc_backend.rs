//! WebRTC connection backend
//!
//! Wraps `webrtc::peer_connection::RTCPeerConnection`. Local tracks are created once
//! per capture track and shared by every link, so one camera feeds N-1 connections.
//! Capture pipelines write samples through [`WebRtcConnectionFactory::local_track`].

use crate::connection::{
    ConnectionFactory, LinkEvent, LinkEventSink, NegotiationError, PeerConnection,
};
use crate::identity::ParticipantId;
use crate::media::{LocalMediaHandle, LocalTrack};
use crate::types::{
    ConnectivityState, IceCandidate, MediaKind, RemoteMediaHandle, SdpType, SessionDescription,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

type TrackCache = Arc<Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>>;

fn backend_error(e: impl std::fmt::Display) -> NegotiationError {
    NegotiationError::Backend(e.to_string())
}

/// Factory producing WebRTC peer connections
pub struct WebRtcConnectionFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    tracks: TrackCache,
}

impl WebRtcConnectionFactory {
    /// Create a factory using the given STUN/TURN URLs
    ///
    /// # Errors
    ///
    /// Returns error if codec or interceptor registration fails
    pub fn new(ice_servers: &[String]) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(backend_error)?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(backend_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }]
        };

        Ok(Self {
            api,
            ice_servers,
            tracks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Shared outgoing track for a capture track, once any link attached it
    #[must_use]
    pub fn local_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.tracks.lock().get(track_id).cloned()
    }

    fn register_handlers(pc: &RTCPeerConnection, events: &LinkEventSink) {
        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        sink.emit(LinkEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to encode local candidate"),
                }
            }
            Box::pin(async {})
        }));

        let sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::debug!(remote = %sink.remote(), state = ?s, "Peer connection state");
            let connectivity = match s {
                RTCPeerConnectionState::Connected => Some(ConnectivityState::Connected),
                RTCPeerConnectionState::Disconnected => Some(ConnectivityState::Disconnected),
                RTCPeerConnectionState::Failed => Some(ConnectivityState::Failed),
                _ => None,
            };
            if let Some(connectivity) = connectivity {
                sink.emit(LinkEvent::Connectivity(connectivity));
            }
            Box::pin(async {})
        }));

        let sink = events.clone();
        pc.on_track(Box::new(move |track, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(MediaKind::Audio),
                RTPCodecType::Video => Some(MediaKind::Video),
                _ => None,
            };
            if let Some(kind) = kind {
                sink.emit(LinkEvent::RemoteMedia(RemoteMediaHandle {
                    stream_id: track.stream_id(),
                    kinds: vec![kind],
                }));
            }
            Box::pin(async {})
        }));
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcConnectionFactory {
    async fn create_connection(
        &self,
        remote: &ParticipantId,
        events: LinkEventSink,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(backend_error)?,
        );
        Self::register_handlers(&pc, &events);

        tracing::debug!(remote = %remote, link = %events.link_id(), "Created peer connection");

        Ok(Arc::new(WebRtcPeerConnection {
            pc,
            tracks: Arc::clone(&self.tracks),
        }))
    }
}

struct WebRtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    tracks: TrackCache,
}

impl WebRtcPeerConnection {
    fn shared_track(&self, track: &LocalTrack, stream_id: &str) -> Arc<TrackLocalStaticSample> {
        let mut tracks = self.tracks.lock();
        let entry = tracks.entry(track.id.clone()).or_insert_with(|| {
            let mime_type = match track.kind {
                MediaKind::Audio => MIME_TYPE_OPUS,
                MediaKind::Video => MIME_TYPE_VP8,
            };
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                track.id.clone(),
                stream_id.to_string(),
            ))
        });
        Arc::clone(entry)
    }

    fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
        match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| NegotiationError::InvalidDescription(e.to_string()))
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn attach_local_media(&self, media: &LocalMediaHandle) -> Result<(), NegotiationError> {
        for track in media.tracks() {
            let local = self.shared_track(track, media.stream_id());
            let local: Arc<dyn TrackLocal + Send + Sync> = local;
            self.pc.add_track(local).await.map_err(backend_error)?;
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.pc.create_offer(None).await.map_err(backend_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await.map_err(backend_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        self.pc
            .set_local_description(Self::to_rtc(desc)?)
            .await
            .map_err(backend_error)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_remote_description(Self::to_rtc(desc)?)
            .await
            .map_err(backend_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(backend_error)
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.pc.close().await.map_err(backend_error)
    }
}
