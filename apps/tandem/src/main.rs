use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use signal_mailbox::RedisMailbox;
use tandem_core::telemetry::logging::{self, LogConfig, LogLevel};
use tandem_core::transport::webrtc::WebRtcTransportFactory;
use tandem_core::{MemoryMessageLog, SessionConfig, SessionEvent, SessionRegistry};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "tandem", about = "Peer-to-peer chat over WebRTC data channels")]
struct Cli {
    /// Local identity other peers address signaling to.
    #[arg(long, short = 'u', env = "TANDEM_USER")]
    user: String,

    /// Peer to dial on startup; without it we wait for incoming offers.
    #[arg(long, short = 'p')]
    peer: Option<String>,

    #[arg(long, env = "TANDEM_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    #[arg(long, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    let config = SessionConfig::from_env();
    let mailbox = RedisMailbox::new(&cli.redis_url)
        .with_context(|| format!("invalid redis url {}", cli.redis_url))?;
    let factory = WebRtcTransportFactory::from_config(&config).context("building webrtc api")?;
    let log = Arc::new(MemoryMessageLog::new());
    let registry = SessionRegistry::builder(cli.user.clone(), Arc::new(mailbox), Arc::new(factory))
        .config(config)
        .message_sink(log)
        .build();

    let mut events = registry.subscribe();
    let inbox = registry.spawn_inbox().await.context("subscribing to mailbox")?;

    let mut active_peer = cli.peer.clone();
    if let Some(peer) = cli.peer.as_deref() {
        registry.connect(peer).await?;
        eprintln!("dialing {peer}...");
    } else {
        eprintln!("waiting for a peer to connect to {}...", cli.user);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::Connected { peer } => {
                        eprintln!("connected to {peer}");
                        active_peer.get_or_insert(peer);
                    }
                    SessionEvent::MessageReceived { peer, text } => println!("{peer}: {text}"),
                    SessionEvent::ConnectionFailed { peer, reason } => {
                        eprintln!("connection to {peer} failed: {reason}");
                    }
                    SessionEvent::DecryptionFailed { peer, error } => {
                        eprintln!("unreadable message from {peer}: {error}");
                    }
                    SessionEvent::StateChanged { peer, state } => {
                        tracing::debug!(peer = %peer, state = %state, "session state");
                    }
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" {
                    break;
                }
                let Some(peer) = active_peer.as_deref() else {
                    eprintln!("no peer yet");
                    continue;
                };
                if let Err(err) = registry.send_message(peer, line).await {
                    eprintln!("send failed: {err}");
                }
            }
        }
    }

    registry.shutdown().await;
    inbox.abort();
    Ok(())
}
