//! Meshcall CLI Application

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meshcall_core::prelude::*;
use meshcall_core::{LoopbackConnectionFactory, RelayEndpoint};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Participant identifier (random when omitted)
    #[arg(short, long, env = "MESHCALL_IDENTITY")]
    identity: Option<String>,

    /// Session configuration file (JSON)
    #[arg(long, env = "MESHCALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-process mesh call over the loopback backend
    Demo {
        /// Number of participants joining one after another
        #[arg(short, long, default_value_t = 3, env = "MESHCALL_DEMO_PARTICIPANTS")]
        participants: usize,
    },

    /// Join a project call through a WebSocket relay
    Join {
        /// Relay WebSocket URL
        #[arg(long, env = "MESHCALL_RELAY_URL")]
        relay_url: String,

        /// Project whose call room to join
        #[arg(short, long, env = "MESHCALL_PROJECT")]
        project: String,

        /// Display name
        #[arg(short, long, env = "MESHCALL_NAME")]
        name: Option<String>,

        /// Join without video
        #[arg(long)]
        audio_only: bool,

        /// STUN/TURN server URLs, replacing the configured ones
        #[arg(long = "ice-server", env = "MESHCALL_ICE_SERVERS", value_delimiter = ',')]
        ice_servers: Vec<String>,
    },

    /// Show status and available commands
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("meshcall=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Demo { participants } => {
            handle_demo(participants, config).await?;
        }
        Commands::Join {
            relay_url,
            project,
            name,
            audio_only,
            ice_servers,
        } => {
            let identity = cli.identity.unwrap_or_else(generate_random_identity);
            let name = name.unwrap_or_else(|| identity.clone());
            let mut config = config;
            if audio_only {
                config.constraints = MediaConstraints::audio_only();
            }
            if !ice_servers.is_empty() {
                config.ice_servers = ice_servers;
            }
            handle_join(&relay_url, &project, &identity, &name, config).await?;
        }
        Commands::Status => {
            handle_status();
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<SessionConfig> {
    let Some(path) = path else {
        return Ok(SessionConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config = serde_json::from_str(&text)
        .with_context(|| format!("parsing config {}", path.display()))?;
    Ok(config)
}

/// Apply queued work on every session until nothing moves or `deadline` passes
async fn pump(sessions: &mut [CallSession<RelayEndpoint>], deadline: Duration) {
    let started = tokio::time::Instant::now();
    let mut quiet_rounds = 0;
    while started.elapsed() < deadline && quiet_rounds < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let mut handled = 0;
        for session in sessions.iter_mut() {
            handled += session.process_pending().await;
        }
        quiet_rounds = if handled == 0 { quiet_rounds + 1 } else { 0 };
    }
}

async fn handle_demo(participants: usize, config: SessionConfig) -> Result<()> {
    anyhow::ensure!(participants >= 2, "a mesh call needs at least two participants");

    let relay = InMemoryRelay::new();
    let project = ProjectId::from("demo");
    let mut config = config;
    config.min_receive_interval = Duration::ZERO;

    println!("🕸️  Mesh demo with {participants} participants");

    let mut sessions: Vec<CallSession<RelayEndpoint>> = Vec::with_capacity(participants);
    for n in 0..participants {
        let id = format!("peer-{n}");
        let mut session = CallSession::new(
            Arc::new(relay.connect(&project)),
            Arc::new(LoopbackConnectionFactory::new(id.as_str())),
            Arc::new(StaticMediaSource::granting()),
            LocalParticipant::new(project.clone(), id.as_str(), format!("Peer {n}")),
            config.clone(),
        );
        session.start_session().await?;
        sessions.push(session);
        pump(&mut sessions, Duration::from_secs(2)).await;
        println!("➕ {id} joined");
    }

    let mut links = 0;
    for session in &sessions {
        let connected = session
            .linked_participants()
            .iter()
            .filter(|remote| {
                session
                    .link(remote)
                    .is_some_and(|l| l.state() == LinkState::Connected)
            })
            .count();
        println!(
            "   {}: {} of {} links connected",
            session.local().id,
            connected,
            participants - 1
        );
        links += session.link_count();
    }
    println!(
        "✅ {} undirected links (expected {})",
        links / 2,
        participants * (participants - 1) / 2
    );

    sessions[0].toggle_media(MediaKind::Video, false).await?;
    pump(&mut sessions, Duration::from_secs(1)).await;
    let muted = sessions[1].remote_media_flags(&sessions[0].local().id);
    println!(
        "🔇 {} turned video off; {} sees video_enabled={}",
        sessions[0].local().id,
        sessions[1].local().id,
        muted.video_enabled
    );

    let last = sessions.len() - 1;
    sessions[last].leave_session().await;
    pump(&mut sessions, Duration::from_secs(1)).await;
    println!(
        "👋 {} left; {} now holds {} links",
        sessions[last].local().id,
        sessions[0].local().id,
        sessions[0].link_count()
    );

    sessions[0].end_session_for_all().await;
    pump(&mut sessions, Duration::from_secs(1)).await;
    let ended = sessions
        .iter()
        .filter(|s| s.state() == SessionState::Ended)
        .count();
    println!("📴 Call ended for {ended} of {participants} participants");

    Ok(())
}

#[cfg(all(feature = "webrtc-backend", feature = "websocket"))]
async fn handle_join(
    relay_url: &str,
    project: &str,
    identity: &str,
    name: &str,
    config: SessionConfig,
) -> Result<()> {
    use meshcall_core::{WebRtcConnectionFactory, WebSocketTransport};

    println!("🔗 Joining project {project} as {identity}");

    let transport = Arc::new(WebSocketTransport::connect(relay_url).await?);
    println!("✅ Connected to relay {}", transport.url());

    let connections = Arc::new(WebRtcConnectionFactory::new(&config.ice_servers)?);
    let mut session = CallSession::new(
        transport,
        connections,
        Arc::new(StaticMediaSource::granting()),
        LocalParticipant::new(project, identity, name),
        config,
    );

    let mut events = session.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::ParticipantJoined { participant } => {
                    println!("➕ {} joined", participant.display_name);
                }
                SessionEvent::ParticipantLeft { id } => println!("➖ {id} left"),
                SessionEvent::LinkStateChanged { remote, new, .. } => {
                    println!("   {remote}: {new:?}");
                }
                SessionEvent::RemoteMediaChanged {
                    remote,
                    kind,
                    enabled,
                } => println!("   {remote} {kind} {}", if enabled { "on" } else { "off" }),
                SessionEvent::LinkFailed { remote, reason } => {
                    println!("❌ Link to {remote} failed: {reason}");
                }
                SessionEvent::RelayDisconnected { error } => println!("⚠️  Relay lost: {error}"),
                SessionEvent::RelayReconnected => println!("✅ Relay restored"),
                SessionEvent::SessionEnded { reason } => {
                    println!("📴 Call ended ({reason:?})");
                    break;
                }
                other => tracing::debug!(event = ?other, "Session event"),
            }
        }
    });

    let handle = session.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });

    session.run().await?;
    Ok(())
}

#[cfg(not(all(feature = "webrtc-backend", feature = "websocket")))]
async fn handle_join(
    _relay_url: &str,
    _project: &str,
    _identity: &str,
    _name: &str,
    _config: SessionConfig,
) -> Result<()> {
    anyhow::bail!("join requires the webrtc-backend and websocket features")
}

fn handle_status() {
    println!("📊 Meshcall CLI Status");
    println!("======================");
    println!("✅ Loopback backend: Available");
    if cfg!(feature = "webrtc-backend") {
        println!("✅ WebRTC backend: Available");
    } else {
        println!("⚠️  WebRTC backend: Disabled at build time");
    }
    if cfg!(feature = "websocket") {
        println!("✅ WebSocket relay transport: Available");
    } else {
        println!("⚠️  WebSocket relay transport: Disabled at build time");
    }
    println!();
    println!("Available commands:");
    println!("  meshcall demo [-p N]                        - Run an in-process mesh call");
    println!("  meshcall join --relay-url URL -p PROJECT    - Join a project call");
    println!("  meshcall status                             - Show this status");
    println!();
    println!("Use 'meshcall --help' for detailed options");
}

fn generate_random_identity() -> String {
    let mut rng = rand::thread_rng();
    format!("guest-{:06x}", rng.gen_range(0..0x100_0000u32))
}
