use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{error, info};

use duocall::config::{ice_server, Config};
use duocall::logger;
use duocall::relay::FirebaseRelay;
use duocall::signaling::WireFormat;
use duocall::{Client, Session, SessionEvent};

/// Two-party audio/video call signaled through a realtime-database mailbox.
#[derive(Debug, Parser)]
#[command(name = "duocall", version)]
struct Cli {
    /// Name to log in as; other participants call this name.
    #[arg(short, long, env = "DUOCALL_USER")]
    user: String,

    /// Call this participant right after logging in.
    #[arg(short, long)]
    call: Option<String>,

    /// Base URL of the realtime database.
    #[arg(long, env = "DUOCALL_RELAY_URL")]
    relay_url: Option<String>,

    /// NAT-traversal server, e.g. stun:stun.example.org:3478 or turn:host:3478.
    #[arg(long)]
    ice_server: Option<String>,

    /// TURN username for --ice-server.
    #[arg(long, env = "DUOCALL_ICE_USERNAME")]
    ice_username: Option<String>,

    /// TURN credential for --ice-server.
    #[arg(long, env = "DUOCALL_ICE_CREDENTIAL", hide_env_values = true)]
    ice_credential: Option<String>,

    /// Payload encoding for outgoing records: json or packed.
    #[arg(long)]
    wire_format: Option<WireFormat>,

    /// Join with the microphone muted.
    #[arg(long)]
    muted: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init();
    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(url) = cli.relay_url {
        config.relay_url = Some(url);
    }
    if let Some(url) = cli.ice_server {
        config.ice_server = ice_server(url, cli.ice_username, cli.ice_credential);
    }
    if let Some(format) = cli.wire_format {
        config.wire_format = format;
    }

    let Some(relay_url) = config.relay_url.clone() else {
        bail!("no relay configured: pass --relay-url or set DUOCALL_RELAY_URL");
    };
    let relay = FirebaseRelay::new(&relay_url)
        .with_context(|| format!("invalid relay url {relay_url}"))?;
    info!("using relay {relay_url}, ICE server {}", config.ice_server.url);

    let (session, mut events) = Session::with_rtc(config, Arc::new(relay));
    let (client, task) = Client::spawn(session);

    client
        .login(&cli.user)
        .await
        .with_context(|| format!("could not log in as {}", cli.user))?;
    if cli.muted {
        client.set_audio_enabled(false).await?;
    }
    if let Some(callee) = &cli.call {
        client
            .call(callee)
            .await
            .with_context(|| format!("could not call {callee}"))?;
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event);
                if matches!(event, SessionEvent::CallEnded { .. }) {
                    break;
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("waiting for Ctrl-C: {e}");
                }
                info!("hanging up");
                client.end_call().await?;
            }
        }
    }

    client.shutdown();
    task.await.context("session task panicked")?;
    Ok(())
}

fn print_event(event: &SessionEvent) {
    let now = chrono::Local::now().format("%H:%M:%S");
    match event {
        SessionEvent::LocalMediaReady => println!("[{now}] camera and microphone ready"),
        SessionEvent::PhaseChanged(phase) => println!("[{now}] {phase}"),
        SessionEvent::RemoteTrack { peer, track } => {
            println!("[{now}] receiving {} from {peer}", track.kind)
        }
        SessionEvent::MediaConnected { peer } => println!("[{now}] media flowing with {peer}"),
        SessionEvent::PeerDisconnected { peer } => {
            println!("[{now}] Connection lost. {peer} has disconnected.")
        }
        SessionEvent::CallEnded { peer, reason } => match peer {
            Some(peer) => println!("[{now}] call with {peer} ended ({reason:?})"),
            None => println!("[{now}] logged out ({reason:?})"),
        },
    }
}
