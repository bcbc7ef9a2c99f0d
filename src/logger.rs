use once_cell::sync::OnceCell;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::config::DEFAULT_LOG_LEVEL;
use crate::peer::ice::candidate_type;
use crate::peer::types::RemoteTrack;
use crate::session::{EndReason, Phase, SessionEvent};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

static INIT: OnceCell<()> = OnceCell::new();

/// Timestamped logging; `RUST_LOG` overrides the default level.
pub fn init() {
    init_with(DEFAULT_LOG_LEVEL);
}

pub fn init_with(default_directive: &str) {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive));
        // another subscriber may already be installed by the host
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_owned()))
            .with_target(false)
            .try_init();
    });
}

/// Logs a trickled ICE candidate.
pub fn dump_candidate(label: &str, init: &RTCIceCandidateInit) {
    debug!(
        "Trickle {label}: type={} candidate={} sdp_mid={:?} sdp_mline_index={:?}",
        candidate_type(&init.candidate).unwrap_or("unknown"),
        init.candidate,
        init.sdp_mid,
        init.sdp_mline_index
    );
}

pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Publishes session events to the rendering layer.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventEmitter {
    pub fn channel() -> (EventEmitter, SessionEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventEmitter { tx }, rx)
    }

    fn emit(&self, event: SessionEvent) {
        debug!("emitting {:?}", event);
        if self.tx.send(event).is_err() {
            debug!("no one listens to session events");
        }
    }

    pub fn emit_phase(&self, phase: Phase) {
        info!("session phase -> {}", phase);
        self.emit(SessionEvent::PhaseChanged(phase));
    }

    pub fn emit_local_media_ready(&self) {
        self.emit(SessionEvent::LocalMediaReady);
    }

    pub fn emit_remote_track(&self, peer: &str, track: RemoteTrack) {
        info!("remote {} track {} from {}", track.kind, track.id, peer);
        self.emit(SessionEvent::RemoteTrack {
            peer: peer.to_owned(),
            track,
        });
    }

    pub fn emit_media_connected(&self, peer: &str) {
        info!("media path to {} is up", peer);
        self.emit(SessionEvent::MediaConnected {
            peer: peer.to_owned(),
        });
    }

    pub fn emit_peer_disconnected(&self, peer: &str) {
        warn!("Connection lost. {} has disconnected.", peer);
        self.emit(SessionEvent::PeerDisconnected {
            peer: peer.to_owned(),
        });
    }

    pub fn emit_call_ended(&self, peer: Option<String>, reason: EndReason) {
        info!("call with {:?} ended: {:?}", peer, reason);
        self.emit(SessionEvent::CallEnded { peer, reason });
    }
}
