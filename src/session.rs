//! Signaling state machine of one client.
//!
//! A [`Session`] owns the local media, the connection handle and the
//! subscription to its own mailbox slot. It reacts to three kinds of input,
//! all delivered on one logical thread: user actions (`login`, `call`,
//! `end_call`), records arriving in the slot, and events of the connection.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::config::Config;
use crate::error::{DecodeError, SessionError};
use crate::logger::{dump_candidate, EventEmitter, SessionEvents};
use crate::peer::connection::{
    ConnectionEvents, ConnectionFactory, PeerConnection, RtcConnectionFactory,
};
use crate::peer::health::{HealthMonitor, Verdict};
use crate::peer::ice::{apply_pending_candidates, CandidateStats, PendingCandidates};
use crate::peer::media::{LocalMedia, MediaSource, SampleSource};
use crate::peer::types::{ConnectionEvent, ConnectivityStatus, RemoteTrack};
use crate::relay::{Inbox, Relay, SlotUpdate};
use crate::signaling::{MailboxRecord, Signal, SignalKind};
use crate::utils::random_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    LocalMediaReady,
    Offering,
    OfferReceived,
    AnswerSent,
    Connected,
    Ended,
}

impl Phase {
    /// A peer is involved: negotiating or connected.
    pub fn in_call(self) -> bool {
        matches!(
            self,
            Phase::Offering | Phase::OfferReceived | Phase::AnswerSent | Phase::Connected
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::LocalMediaReady => "local-media-ready",
            Phase::Offering => "offering",
            Phase::OfferReceived => "offer-received",
            Phase::AnswerSent => "answer-sent",
            Phase::Connected => "connected",
            Phase::Ended => "ended",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    ConnectionLost,
    NegotiationFailed,
}

/// Notifications for the rendering layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LocalMediaReady,
    PhaseChanged(Phase),
    RemoteTrack { peer: String, track: RemoteTrack },
    MediaConnected { peer: String },
    /// The connection to `peer` was lost without anyone hanging up.
    PeerDisconnected { peer: String },
    CallEnded { peer: Option<String>, reason: EndReason },
}

/// Next thing a session has to react to.
#[derive(Debug)]
pub enum Input {
    Mailbox(Option<SlotUpdate>),
    Connection(Option<ConnectionEvent>),
}

pub struct Session {
    config: Config,
    relay: Arc<dyn Relay>,
    connections: Arc<dyn ConnectionFactory>,
    media_source: Arc<dyn MediaSource>,
    events: EventEmitter,

    phase: Phase,
    local_user: Option<String>,
    remote_user: Option<String>,
    call_id: Option<String>,
    media: Option<LocalMedia>,
    connection: Option<Arc<dyn PeerConnection>>,
    connection_events: Option<ConnectionEvents>,
    inbox: Option<Inbox>,
    health: HealthMonitor,
    pending_remote: PendingCandidates,
    pending_local: Vec<RTCIceCandidateInit>,
    local_stats: CandidateStats,
}

impl Session {
    pub fn new(
        config: Config,
        relay: Arc<dyn Relay>,
        connections: Arc<dyn ConnectionFactory>,
        media_source: Arc<dyn MediaSource>,
    ) -> (Session, SessionEvents) {
        let (events, rx) = EventEmitter::channel();
        let session = Session {
            config,
            relay,
            connections,
            media_source,
            events,
            phase: Phase::Idle,
            local_user: None,
            remote_user: None,
            call_id: None,
            media: None,
            connection: None,
            connection_events: None,
            inbox: None,
            health: HealthMonitor::default(),
            pending_remote: PendingCandidates::default(),
            pending_local: Vec::new(),
            local_stats: CandidateStats::default(),
        };
        (session, rx)
    }

    /// Session on the `webrtc` engine with sample-fed capture tracks.
    pub fn with_rtc(config: Config, relay: Arc<dyn Relay>) -> (Session, SessionEvents) {
        Session::new(
            config,
            relay,
            Arc::new(RtcConnectionFactory),
            Arc::new(SampleSource::default()),
        )
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn local_user(&self) -> Option<&str> {
        self.local_user.as_deref()
    }

    pub fn remote_user(&self) -> Option<&str> {
        self.remote_user.as_deref()
    }

    pub fn media(&self) -> Option<&LocalMedia> {
        self.media.as_ref()
    }

    /// Whether there is anything left to wait for in [`Session::next_input`].
    pub fn is_listening(&self) -> bool {
        self.inbox.is_some() || self.connection_events.is_some()
    }

    pub fn set_audio_enabled(&self, enabled: bool) -> bool {
        match &self.media {
            Some(media) => {
                media.set_audio_enabled(enabled);
                true
            }
            None => false,
        }
    }

    pub fn set_video_enabled(&self, enabled: bool) -> bool {
        match &self.media {
            Some(media) => {
                media.set_video_enabled(enabled);
                true
            }
            None => false,
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            self.phase = phase;
            self.events.emit_phase(phase);
        }
    }

    fn local_name(&self) -> Result<String, SessionError> {
        self.local_user
            .clone()
            .ok_or_else(|| SessionError::SignalingState("not logged in".into()))
    }

    fn active_connection(&self) -> Result<Arc<dyn PeerConnection>, SessionError> {
        self.connection
            .clone()
            .ok_or_else(|| SessionError::SignalingState("no connection handle".into()))
    }

    fn local_media(&self) -> Result<&LocalMedia, SessionError> {
        self.media
            .as_ref()
            .ok_or_else(|| SessionError::SignalingState("no local media".into()))
    }

    /// Acquires local media, creates the connection handle, wipes whatever a
    /// previous session left in `username`'s slot and subscribes to it.
    pub async fn login(&mut self, username: &str) -> Result<(), SessionError> {
        if self.phase != Phase::Idle {
            return Err(SessionError::SignalingState(format!(
                "already logged in as {:?} ({})",
                self.local_user, self.phase
            )));
        }
        info!("logging in as {username}");

        let media = self.media_source.acquire(&self.config.media).await?;

        let (connection, connection_events) =
            match self.connections.connect(&self.config.ice_server).await {
                Ok(created) => created,
                Err(e) => {
                    media.release();
                    return Err(SessionError::ConnectionInit(e));
                }
            };

        // stale records must be gone before the subscription replays the slot
        if let Err(e) = self.relay.clear(username).await {
            warn!("could not clear stale slot of {username}: {e}");
        }

        let inbox = match self.relay.subscribe(username).await {
            Ok(inbox) => inbox,
            Err(e) => {
                media.release();
                if let Err(e) = connection.close().await {
                    debug!("closing unused connection: {e}");
                }
                return Err(e.into());
            }
        };

        self.local_user = Some(username.to_owned());
        self.media = Some(media);
        self.connection = Some(connection);
        self.connection_events = Some(connection_events);
        self.inbox = Some(inbox);
        self.health.reset();

        self.events.emit_local_media_ready();
        self.set_phase(Phase::LocalMediaReady);
        Ok(())
    }

    /// Places a call: writes an offer into `callee`'s slot.
    ///
    /// On failure the negotiation is abandoned, the connection handle is
    /// replaced and the session stays logged in.
    pub async fn call(&mut self, callee: &str) -> Result<(), SessionError> {
        if self.phase != Phase::LocalMediaReady {
            return Err(SessionError::SignalingState(format!(
                "cannot call {callee} while {}",
                self.phase
            )));
        }
        let local = self.local_name()?;
        let call_id = random_id();
        info!("call {call_id}: {local} calling {callee}");

        // local candidates are routed to the callee from here on
        self.remote_user = Some(callee.to_owned());
        self.call_id = Some(call_id);

        match self.send_offer(&local, callee).await {
            Ok(()) => {
                self.set_phase(Phase::Offering);
                self.flush_local_candidates().await;
                Ok(())
            }
            Err(e) => {
                error!("call to {callee} aborted: {e}");
                if let Err(renew) = self.renew_connection().await {
                    error!("could not prepare a new connection: {renew}");
                }
                Err(e)
            }
        }
    }

    async fn send_offer(&self, local: &str, callee: &str) -> Result<(), SessionError> {
        let connection = self.active_connection()?;
        connection
            .attach_media(self.local_media()?)
            .await
            .map_err(|e| SessionError::signaling("attaching local tracks", e))?;

        let offer = connection
            .create_offer()
            .await
            .map_err(|e| SessionError::signaling("creating offer", e))?;
        connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| SessionError::signaling("setting local offer", e))?;

        let record = Signal::Offer(offer).to_record(local, self.config.wire_format)?;
        self.relay.write_replace(callee, &record).await?;
        debug!("offer written to {callee}");
        Ok(())
    }

    /// Drops the current negotiation and starts over with a fresh handle.
    async fn renew_connection(&mut self) -> Result<(), SessionError> {
        self.remote_user = None;
        self.call_id = None;
        self.pending_local.clear();
        self.pending_remote.clear();
        self.connection_events = None;
        if let Some(connection) = self.connection.take() {
            self.health.mark_local_hangup();
            if let Err(e) = connection.close().await {
                debug!("closing abandoned connection: {e}");
            }
        }

        match self.connections.connect(&self.config.ice_server).await {
            Ok((connection, events)) => {
                self.connection = Some(connection);
                self.connection_events = Some(events);
                self.health.reset();
                self.set_phase(Phase::LocalMediaReady);
                Ok(())
            }
            Err(e) => {
                self.teardown().await;
                Err(SessionError::ConnectionInit(e))
            }
        }
    }

    /// Waits for the next mailbox update or connection event.
    ///
    /// Cancel safe. Returns `None` once the session listens to nothing.
    pub async fn next_input(&mut self) -> Option<Input> {
        match (self.inbox.as_mut(), self.connection_events.as_mut()) {
            (Some(inbox), Some(events)) => Some(tokio::select! {
                biased;
                update = inbox.recv() => Input::Mailbox(update),
                event = events.recv() => Input::Connection(event),
            }),
            (Some(inbox), None) => Some(Input::Mailbox(inbox.recv().await)),
            (None, Some(events)) => Some(Input::Connection(events.recv().await)),
            (None, None) => None,
        }
    }

    pub async fn handle_input(&mut self, input: Input) {
        match input {
            Input::Mailbox(Some(SlotUpdate::Record(record))) => self.handle_record(record).await,
            Input::Mailbox(Some(SlotUpdate::Cleared)) => self.handle_slot_cleared().await,
            Input::Mailbox(None) => {
                warn!("relay closed the inbox of {:?}", self.local_user);
                self.inbox = None;
            }
            Input::Connection(Some(event)) => self.handle_connection_event(event).await,
            Input::Connection(None) => {
                debug!("connection event stream ended");
                self.connection_events = None;
            }
        }
    }

    /// Handles one input. Returns `false` when there was nothing to wait for.
    pub async fn step(&mut self) -> bool {
        match self.next_input().await {
            Some(input) => {
                self.handle_input(input).await;
                true
            }
            None => false,
        }
    }

    pub async fn handle_record(&mut self, record: MailboxRecord) {
        if record.from.is_empty() {
            warn!("dropping {} record without a sender", record.kind);
            return;
        }
        debug!("{} record from {}", record.kind, record.from);
        let result = match record.kind {
            SignalKind::Offer => self.on_offer(&record).await,
            SignalKind::Answer => self.on_answer(&record).await,
            SignalKind::Candidate => self.on_remote_candidate(&record).await,
        };

        match result {
            Ok(()) => {}
            Err(SessionError::Decode(e)) => {
                warn!("dropping malformed {} from {}: {e}", record.kind, record.from);
            }
            Err(e @ (SessionError::SignalingState(_) | SessionError::Encode(_))) => {
                error!("negotiation with {} failed: {e}", record.from);
                self.fail_negotiation().await;
            }
            Err(e) => warn!("{} from {} not handled: {e}", record.kind, record.from),
        }
    }

    async fn on_offer(&mut self, record: &MailboxRecord) -> Result<(), SessionError> {
        if self.phase != Phase::LocalMediaReady {
            if self.remote_user.as_deref() == Some(record.from.as_str()) {
                debug!("offer from {} already handled", record.from);
            } else {
                // glare and late offers are not resolved
                warn!("ignoring offer from {} while {}", record.from, self.phase);
            }
            return Ok(());
        }

        let offer = Signal::from_record(record)?
            .into_description()
            .ok_or(DecodeError::MissingPayload(SignalKind::Offer))?;
        let local = self.local_name()?;
        let peer = record.from.clone();
        let call_id = random_id();
        info!("call {call_id}: offer from {peer}");
        self.remote_user = Some(peer.clone());
        self.call_id = Some(call_id);

        let connection = self.active_connection()?;
        connection
            .set_remote_description(offer)
            .await
            .map_err(|e| SessionError::signaling("applying remote offer", e))?;
        self.set_phase(Phase::OfferReceived);
        self.flush_remote_candidates(connection.as_ref(), &peer).await;

        connection
            .attach_media(self.local_media()?)
            .await
            .map_err(|e| SessionError::signaling("attaching local tracks", e))?;
        let answer = connection
            .create_answer()
            .await
            .map_err(|e| SessionError::signaling("creating answer", e))?;
        connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| SessionError::signaling("setting local answer", e))?;

        // merge: the caller's slot may still hold context we do not own
        let reply = Signal::Answer(answer).to_record(&local, self.config.wire_format)?;
        if let Err(e) = self.relay.write_merge(&peer, &reply).await {
            warn!("answer to {peer} not delivered: {e}");
        }
        self.set_phase(Phase::AnswerSent);
        self.flush_local_candidates().await;
        self.set_phase(Phase::Connected);
        Ok(())
    }

    async fn on_answer(&mut self, record: &MailboxRecord) -> Result<(), SessionError> {
        if self.remote_user.as_deref() != Some(record.from.as_str()) {
            warn!("ignoring answer from {} while {}", record.from, self.phase);
            return Ok(());
        }
        match self.phase {
            Phase::Offering => {}
            Phase::Connected => {
                debug!("answer from {} already applied", record.from);
                return Ok(());
            }
            phase => {
                return Err(SessionError::SignalingState(format!(
                    "answer from {} while {phase}",
                    record.from
                )));
            }
        }

        let answer = Signal::from_record(record)
            .map_err(|e| SessionError::signaling("malformed answer", e))?
            .into_description()
            .ok_or_else(|| SessionError::SignalingState("answer without description".into()))?;

        let connection = self.active_connection()?;
        connection
            .set_remote_description(answer)
            .await
            .map_err(|e| SessionError::signaling("applying remote answer", e))?;
        self.flush_remote_candidates(connection.as_ref(), &record.from)
            .await;
        self.set_phase(Phase::Connected);
        Ok(())
    }

    async fn on_remote_candidate(&mut self, record: &MailboxRecord) -> Result<(), SessionError> {
        let Some(connection) = self.connection.clone() else {
            debug!("no connection, dropping candidate from {}", record.from);
            return Ok(());
        };
        if let Some(remote) = self.remote_user.as_deref() {
            if remote != record.from {
                warn!("dropping candidate from {}, in a call with {remote}", record.from);
                return Ok(());
            }
        }

        let candidate = Signal::from_record(record)?
            .into_candidate()
            .ok_or(DecodeError::MissingPayload(SignalKind::Candidate))?;
        dump_candidate("REMOTE", &candidate);

        // applying against an unset remote description would fail
        if connection.has_remote_description().await {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                warn!("Failed to add ICE candidate from {}: {e}", record.from);
            }
        } else {
            self.pending_remote.push(&record.from, candidate);
            debug!("{} remote candidates queued", self.pending_remote.len());
        }
        Ok(())
    }

    async fn flush_remote_candidates(&mut self, connection: &dyn PeerConnection, peer: &str) {
        let queued = self.pending_remote.drain_from(peer);
        if queued.is_empty() {
            return;
        }
        let total = queued.len();
        let applied = apply_pending_candidates(connection, queued).await;
        debug!("applied {applied}/{total} queued candidates from {peer}");
    }

    async fn handle_slot_cleared(&mut self) {
        if !self.phase.in_call() {
            debug!("own slot cleared while {}", self.phase);
            return;
        }
        info!("{:?} hung up", self.remote_user);
        self.health.mark_local_hangup();
        self.finish(EndReason::RemoteHangup).await;
    }

    pub async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::LocalCandidate(candidate) => self.on_local_candidate(candidate).await,
            ConnectionEvent::RemoteTrack(track) => {
                let peer = self.remote_user.clone().unwrap_or_default();
                self.events.emit_remote_track(&peer, track);
            }
            ConnectionEvent::Status(status) => self.on_status(status).await,
        }
    }

    async fn on_local_candidate(&mut self, candidate: RTCIceCandidateInit) {
        dump_candidate("LOCAL", &candidate);
        self.local_stats.record(&candidate);
        let description_sent = matches!(
            self.phase,
            Phase::Offering | Phase::AnswerSent | Phase::Connected
        );
        if description_sent && self.remote_user.is_some() {
            self.send_candidate(candidate).await;
        } else {
            self.pending_local.push(candidate);
        }
    }

    async fn send_candidate(&self, candidate: RTCIceCandidateInit) {
        let (Some(local), Some(remote)) = (self.local_user.as_deref(), self.remote_user.as_deref())
        else {
            return;
        };
        let record = match Signal::Candidate(candidate).to_record(local, self.config.wire_format) {
            Ok(record) => record,
            Err(e) => {
                warn!("could not encode local candidate: {e}");
                return;
            }
        };
        if let Err(e) = self.relay.write_merge(remote, &record).await {
            warn!("candidate to {remote} not delivered: {e}");
        }
    }

    async fn flush_local_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.pending_local) {
            self.send_candidate(candidate).await;
        }
    }

    async fn on_status(&mut self, status: ConnectivityStatus) {
        match self.health.assess(status) {
            Verdict::Healthy => {
                if let Some(peer) = self.remote_user.clone() {
                    self.events.emit_media_connected(&peer);
                }
            }
            Verdict::Pending => debug!("connectivity {status}"),
            Verdict::ExpectedClose => debug!("connectivity {status} after local hang-up"),
            Verdict::RemoteLost => match self.remote_user.clone() {
                Some(peer) => {
                    self.events.emit_peer_disconnected(&peer);
                    self.health.mark_local_hangup();
                    self.finish(EndReason::ConnectionLost).await;
                }
                None => {
                    warn!("connection went {status} with no peer, replacing it");
                    if let Err(e) = self.renew_connection().await {
                        error!("{e}");
                    }
                }
            },
        }
    }

    async fn fail_negotiation(&mut self) {
        self.health.mark_local_hangup();
        self.finish(EndReason::NegotiationFailed).await;
    }

    async fn finish(&mut self, reason: EndReason) {
        let peer = self.remote_user.clone();
        if let Some(call_id) = &self.call_id {
            info!("call {call_id} finished: {reason:?}");
        }
        self.set_phase(Phase::Ended);
        self.teardown().await;
        self.events.emit_call_ended(peer, reason);
    }

    /// Hangs up (or logs out when no call is active).
    pub async fn end_call(&mut self) {
        if self.phase == Phase::Idle {
            debug!("end_call while idle");
            return;
        }
        // before anything closes, so the closing status is not read as a failure
        self.health.mark_local_hangup();
        self.finish(EndReason::LocalHangup).await;
    }

    /// Clears both mailbox slots, closes the connection, releases local media
    /// and returns to `Idle`. Safe to repeat.
    pub async fn teardown(&mut self) {
        self.health.mark_local_hangup();
        self.inbox = None;
        self.connection_events = None;

        if let Some(local) = self.local_user.take() {
            if let Err(e) = self.relay.clear(&local).await {
                warn!("could not clear slot of {local}: {e}");
            }
        }
        if let Some(remote) = self.remote_user.take() {
            if let Err(e) = self.relay.clear(&remote).await {
                warn!("could not clear slot of {remote}: {e}");
            }
        }
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                warn!("closing connection: {e}");
            }
        }
        if let Some(media) = self.media.take() {
            media.release();
        }

        if self.local_stats.total() > 0 {
            self.local_stats.log_summary();
        }
        self.local_stats = CandidateStats::default();
        self.pending_remote.clear();
        self.pending_local.clear();
        self.call_id = None;
        self.set_phase(Phase::Idle);
    }
}

#[cfg(test)]
mod tests;
