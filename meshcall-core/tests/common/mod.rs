//! Shared harness: several sessions over one in-memory relay with loopback connections

#![allow(dead_code)]

use meshcall_core::{
    CallSession, InMemoryRelay, LocalParticipant, LoopbackConnectionFactory, MediaSource,
    ParticipantId, ProjectId, RelayEndpoint, SessionConfig, SessionEvent, StaticMediaSource,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub fn pid(id: &str) -> ParticipantId {
    ParticipantId::from(id)
}

/// Route session logs to the test harness; filter with `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> SessionConfig {
    SessionConfig::builder()
        .min_receive_interval(Duration::ZERO)
        .build()
}

pub struct Peer {
    pub id: ParticipantId,
    pub socket_id: String,
    pub session: CallSession<RelayEndpoint>,
    pub factory: Arc<LoopbackConnectionFactory>,
    pub events: broadcast::Receiver<SessionEvent>,
}

impl Peer {
    /// Drain every event received so far
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub struct Mesh {
    pub relay: InMemoryRelay,
    pub project: ProjectId,
    pub config: SessionConfig,
    pub peers: Vec<Peer>,
}

impl Mesh {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        init_tracing();
        Self {
            relay: InMemoryRelay::new(),
            project: ProjectId::from("apollo"),
            config,
            peers: Vec::new(),
        }
    }

    /// Create a session without starting it
    pub fn add(&mut self, id: &str) -> &mut Peer {
        self.add_with(
            id,
            Arc::new(LoopbackConnectionFactory::new(id)),
            Arc::new(StaticMediaSource::granting()),
        )
    }

    pub fn add_with(
        &mut self,
        id: &str,
        factory: Arc<LoopbackConnectionFactory>,
        media: Arc<dyn MediaSource>,
    ) -> &mut Peer {
        let endpoint = Arc::new(self.relay.connect(&self.project));
        let socket_id = endpoint.socket_id().to_string();
        let session = CallSession::new(
            endpoint,
            factory.clone(),
            media,
            LocalParticipant::new(self.project.clone(), id, id.to_uppercase()),
            self.config.clone(),
        );
        let events = session.subscribe_events();
        self.peers.push(Peer {
            id: pid(id),
            socket_id,
            session,
            factory,
            events,
        });
        let last = self.peers.len() - 1;
        &mut self.peers[last]
    }

    /// Create, start and settle a session
    pub async fn join(&mut self, id: &str) {
        self.add(id).session.start_session().await.unwrap();
        self.settle().await;
    }

    pub fn peer(&self, id: &str) -> &Peer {
        self.peers.iter().find(|p| p.id.as_str() == id).unwrap()
    }

    pub fn peer_mut(&mut self, id: &str) -> &mut Peer {
        self.peers.iter_mut().find(|p| p.id.as_str() == id).unwrap()
    }

    /// Let relay forwarders run and apply everything until nothing moves
    pub async fn settle(&mut self) {
        let mut quiet_rounds = 0;
        for _ in 0..500 {
            for _ in 0..8 {
                tokio::task::yield_now().await;
            }
            let mut handled = 0;
            for peer in &mut self.peers {
                handled += peer.session.process_pending().await;
            }
            if handled == 0 {
                quiet_rounds += 1;
                if quiet_rounds >= 3 {
                    return;
                }
            } else {
                quiet_rounds = 0;
            }
        }
    }
}
