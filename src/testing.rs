//! Test doubles for the connection engine and the capture layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::config::Config;
use crate::error::{MediaError, PeerError};
use crate::logger::SessionEvents;
use crate::peer::connection::{ConnectionEvents, ConnectionFactory, PeerConnection};
use crate::peer::media::{LocalMedia, MediaConstraints, MediaSource, SampleSource};
use crate::peer::types::{ConnectionEvent, ConnectivityStatus, ServerConfig};
use crate::relay::Relay;
use crate::session::{Session, SessionEvent};

pub fn description(kind: &str, sdp: &str) -> RTCSessionDescription {
    serde_json::from_value(serde_json::json!({ "type": kind, "sdp": sdp }))
        .expect("valid session description")
}

pub fn candidate(line: &str) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: line.to_owned(),
        sdp_mid: Some("0".to_owned()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

#[derive(Default)]
struct FakeState {
    local: Option<RTCSessionDescription>,
    remote: Option<RTCSessionDescription>,
    applied: Vec<String>,
    attached: usize,
    closed: bool,
}

/// Connection handle that negotiates nothing but keeps the bookkeeping an
/// engine would enforce.
pub struct FakeConnection {
    state: Mutex<FakeState>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl FakeConnection {
    /// Simulates a locally gathered candidate.
    pub fn discover(&self, line: &str) {
        let _ = self
            .events
            .send(ConnectionEvent::LocalCandidate(candidate(line)));
    }

    pub fn report(&self, status: ConnectivityStatus) {
        let _ = self.events.send(ConnectionEvent::Status(status));
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.state.lock().applied.clone()
    }

    pub fn remote_description(&self) -> Option<RTCSessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn attached(&self) -> usize {
        self.state.lock().attached
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn attach_media(&self, _media: &LocalMedia) -> Result<(), PeerError> {
        self.state.lock().attached += 1;
        Ok(())
    }

    async fn create_offer(&self) -> Result<RTCSessionDescription, PeerError> {
        Ok(description("offer", "v=0\r\ns=fake offer\r\n"))
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription, PeerError> {
        if self.state.lock().remote.is_none() {
            return Err(PeerError::Rejected("answer without remote offer".into()));
        }
        Ok(description("answer", "v=0\r\ns=fake answer\r\n"))
    }

    async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<(), PeerError> {
        self.state.lock().local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        if desc.sdp_type == RTCSdpType::Answer
            && state.local.as_ref().map(|d| d.sdp_type) != Some(RTCSdpType::Offer)
        {
            return Err(PeerError::Rejected("answer without local offer".into()));
        }
        state.remote = Some(desc);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(PeerError::Rejected("remote description not set".into()));
        }
        state.applied.push(candidate.candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.state.lock().closed = true;
        let _ = self
            .events
            .send(ConnectionEvent::Status(ConnectivityStatus::Closed));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeFactory {
    created: Mutex<Vec<Arc<FakeConnection>>>,
    failing: AtomicBool,
}

impl FakeFactory {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn created(&self) -> Vec<Arc<FakeConnection>> {
        self.created.lock().clone()
    }

    /// The most recently created handle.
    pub fn last(&self) -> Arc<FakeConnection> {
        self.created
            .lock()
            .last()
            .cloned()
            .expect("no connection created yet")
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn connect(
        &self,
        _ice_server: &ServerConfig,
    ) -> Result<(Arc<dyn PeerConnection>, ConnectionEvents), PeerError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(PeerError::Rejected("transport unavailable".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(FakeConnection {
            state: Mutex::new(FakeState::default()),
            events: tx,
        });
        self.created.lock().push(connection.clone());
        let connection: Arc<dyn PeerConnection> = connection;
        Ok((connection, rx))
    }
}

/// Capture source that never yields media.
pub enum FailingMedia {
    /// The permission prompt is declined.
    Denied,
    NoDevice,
}

#[async_trait]
impl MediaSource for FailingMedia {
    async fn acquire(&self, _constraints: &MediaConstraints) -> Result<LocalMedia, MediaError> {
        match self {
            FailingMedia::Denied => Err(MediaError::PermissionDenied),
            FailingMedia::NoDevice => Err(MediaError::NoDevice),
        }
    }
}

/// One participant wired to fakes.
pub struct Participant {
    pub session: Session,
    pub events: SessionEvents,
    pub factory: Arc<FakeFactory>,
}

impl Participant {
    pub fn new(relay: Arc<dyn Relay>) -> Self {
        Self::with_media(relay, Arc::new(SampleSource::default()))
    }

    pub fn with_media(relay: Arc<dyn Relay>, media: Arc<dyn MediaSource>) -> Self {
        let factory = Arc::new(FakeFactory::default());
        let (session, events) = Session::new(Config::default(), relay, factory.clone(), media);
        Participant {
            session,
            events,
            factory,
        }
    }

    /// Handles everything that is already queued for the session.
    pub async fn pump(&mut self) {
        while let Ok(Some(input)) =
            tokio::time::timeout(Duration::from_millis(50), self.session.next_input()).await
        {
            self.session.handle_input(input).await;
        }
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            seen.push(event);
        }
        seen
    }
}
