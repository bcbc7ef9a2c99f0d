use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::error::PeerError;
use crate::peer::media::LocalMedia;
use crate::peer::types::{ConnectionEvent, ConnectivityStatus, RemoteTrack, ServerConfig};
use crate::utils::add_ice_url_scheme;

pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;

/// The negotiated media transport as the session sees it.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn attach_media(&self, media: &LocalMedia) -> Result<(), PeerError>;
    async fn create_offer(&self) -> Result<RTCSessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<RTCSessionDescription, PeerError>;
    async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<(), PeerError>;
    async fn has_remote_description(&self) -> bool;
    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), PeerError>;
    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates connection handles. Event handlers are wired before the handle is
/// returned, so nothing the engine reports is lost.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(
        &self,
        ice_server: &ServerConfig,
    ) -> Result<(Arc<dyn PeerConnection>, ConnectionEvents), PeerError>;
}

/// Peer connection configuration for a single ICE server.
pub fn rtc_config(ice_server: &ServerConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![add_ice_url_scheme(ice_server)],
            username: ice_server.username.clone().unwrap_or_default(),
            credential: ice_server.credential.clone().unwrap_or_default(),
            ..Default::default()
        }],
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

/// [`ConnectionFactory`] backed by `webrtc`'s `RTCPeerConnection`.
#[derive(Debug, Default, Clone)]
pub struct RtcConnectionFactory;

#[async_trait]
impl ConnectionFactory for RtcConnectionFactory {
    async fn connect(
        &self,
        ice_server: &ServerConfig,
    ) -> Result<(Arc<dyn PeerConnection>, ConnectionEvents), PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(rtc_config(ice_server)).await?);
        let (tx, rx) = mpsc::unbounded_channel();
        wire_events(&pc, tx);

        let connection: Arc<dyn PeerConnection> = Arc::new(RtcConnection { pc });
        Ok((connection, rx))
    }
}

fn wire_events(pc: &Arc<RTCPeerConnection>, tx: mpsc::UnboundedSender<ConnectionEvent>) {
    let candidates = tx.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        match cand {
            Some(c) => match c.to_json() {
                Ok(init) => {
                    let _ = candidates.send(ConnectionEvent::LocalCandidate(init));
                }
                Err(e) => warn!("Failed to get candidate JSON: {e}"),
            },
            // None marks the end of gathering
            None => debug!("ICE candidate gathering completed"),
        }
        Box::pin(async {})
    }));

    pc.on_ice_gathering_state_change(Box::new(move |state| {
        debug!("ICE gathering state changed to: {state:?}");
        Box::pin(async {})
    }));

    let statuses = tx.clone();
    let pc_stats = Arc::downgrade(pc);
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        debug!("ICE connection state changed to: {state:?}");
        let status = ConnectivityStatus::from(state);
        if matches!(
            status,
            ConnectivityStatus::Disconnected | ConnectivityStatus::Failed
        ) {
            if let Some(pc) = pc_stats.upgrade() {
                tokio::spawn(async move {
                    dump_selected_pair(&pc, "BEFORE-FAIL").await;
                });
            }
        }
        let _ = statuses.send(ConnectionEvent::Status(status));
        Box::pin(async {})
    }));

    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            let _ = tx.send(ConnectionEvent::RemoteTrack(RemoteTrack {
                kind: track.kind().to_string(),
                id: track.id(),
                stream_id: track.stream_id(),
            }));
            Box::pin(async {})
        },
    ));
}

/// Logs the nominated candidate pair from a stats snapshot.
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, report) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = report {
            if pair.nominated {
                info!(
                    "STATS {moment}: {}:{} bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}

pub struct RtcConnection {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for RtcConnection {
    async fn attach_media(&self, media: &LocalMedia) -> Result<(), PeerError> {
        for track in media.tracks() {
            let sender = self.pc.add_track(track).await?;
            // RTCP has to be drained for the interceptors to work
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<RTCSessionDescription, PeerError> {
        Ok(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription, PeerError> {
        Ok(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<(), PeerError> {
        Ok(self.pc.set_local_description(desc).await?)
    }

    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<(), PeerError> {
        Ok(self.pc.set_remote_description(desc).await?)
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), PeerError> {
        Ok(self.pc.add_ice_candidate(candidate).await?)
    }

    async fn close(&self) -> Result<(), PeerError> {
        Ok(self.pc.close().await?)
    }
}
