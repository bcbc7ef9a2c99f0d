use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::peer::connection::PeerConnection;

/// Candidate type from an SDP candidate line (`host`, `srflx`, `prflx`, `relay`).
pub fn candidate_type(line: &str) -> Option<&str> {
    let mut parts = line.split_whitespace();
    while let Some(part) = parts.next() {
        if part == "typ" {
            return parts.next();
        }
    }
    None
}

/// Remote candidates that arrived before the remote description.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    entries: Vec<(String, RTCIceCandidateInit)>,
}

impl PendingCandidates {
    pub fn push(&mut self, from: &str, candidate: RTCIceCandidateInit) {
        debug!("Remote description not set yet, queuing candidate from {from}");
        self.entries.push((from.to_owned(), candidate));
    }

    /// Takes the candidates sent by `peer`, in arrival order, discarding the rest.
    pub fn drain_from(&mut self, peer: &str) -> Vec<RTCIceCandidateInit> {
        let mut taken = Vec::new();
        for (from, candidate) in self.entries.drain(..) {
            if from == peer {
                taken.push(candidate);
            } else {
                warn!("dropping queued candidate from {from}, negotiating with {peer}");
            }
        }
        taken
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Applies queued candidates once the remote description is set; returns how many were accepted.
pub async fn apply_pending_candidates(
    conn: &dyn PeerConnection,
    candidates: Vec<RTCIceCandidateInit>,
) -> usize {
    let mut applied = 0;
    for candidate in candidates {
        debug!("Applying pending candidate: {}", candidate.candidate);
        match conn.add_ice_candidate(candidate).await {
            Ok(()) => applied += 1,
            Err(e) => warn!("Failed to apply pending candidate: {e}"),
        }
    }
    applied
}

/// Local candidate counts by type.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CandidateStats {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
    pub other: usize,
}

impl CandidateStats {
    pub fn record(&mut self, candidate: &RTCIceCandidateInit) {
        match candidate_type(&candidate.candidate) {
            Some("host") => self.host += 1,
            Some("srflx") => self.srflx += 1,
            Some("relay") => self.relay += 1,
            _ => self.other += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.host + self.srflx + self.relay + self.other
    }

    pub fn log_summary(&self) {
        info!(
            "Candidate analysis: {} host, {} srflx, {} relay",
            self.host, self.srflx, self.relay
        );
        if self.total() > 0 && self.relay == 0 {
            warn!("No TURN relay candidates found! Connection through NAT may fail.");
        }
    }
}
