use std::fmt;

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;

/// ICE server as configured by the user.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl ServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: url.into(),
            username: None,
            credential: None,
        }
    }
}

/// Transport-level health reported by the connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityStatus {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCIceConnectionState> for ConnectivityStatus {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Checking => ConnectivityStatus::Checking,
            RTCIceConnectionState::Connected => ConnectivityStatus::Connected,
            RTCIceConnectionState::Completed => ConnectivityStatus::Completed,
            RTCIceConnectionState::Disconnected => ConnectivityStatus::Disconnected,
            RTCIceConnectionState::Failed => ConnectivityStatus::Failed,
            RTCIceConnectionState::Closed => ConnectivityStatus::Closed,
            _ => ConnectivityStatus::New,
        }
    }
}

impl fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectivityStatus::New => "new",
            ConnectivityStatus::Checking => "checking",
            ConnectivityStatus::Connected => "connected",
            ConnectivityStatus::Completed => "completed",
            ConnectivityStatus::Disconnected => "disconnected",
            ConnectivityStatus::Failed => "failed",
            ConnectivityStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Incoming media track, as handed to the rendering layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub kind: String,
    pub id: String,
    pub stream_id: String,
}

/// Events the connection handle raises while it lives.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    LocalCandidate(RTCIceCandidateInit),
    RemoteTrack(RemoteTrack),
    Status(ConnectivityStatus),
}
