use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::{DecodeError, EncodeError};

/// Upper bound for an inflated packed payload.
pub const MAX_INFLATED_SIZE: u64 = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How payload strings are written into the mailbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireFormat {
    /// Plain JSON text, the same shape a browser produces.
    #[default]
    Json,
    /// JSON → gzip → base64.
    Packed,
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(WireFormat::Json),
            "packed" => Ok(WireFormat::Packed),
            other => Err(format!("unknown wire format `{other}` (expected json or packed)")),
        }
    }
}

/// The one record a participant's mailbox slot holds.
///
/// Answers and candidates are merged into the slot, so a record may still
/// carry payload fields of other kinds; [`MailboxRecord::payload`] returns the
/// one named by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxRecord {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
}

impl MailboxRecord {
    pub fn new(kind: SignalKind, from: impl Into<String>, payload: impl Into<String>) -> Self {
        let payload = Some(payload.into());
        let mut record = MailboxRecord {
            kind,
            from: from.into(),
            offer: None,
            answer: None,
            candidate: None,
        };
        match kind {
            SignalKind::Offer => record.offer = payload,
            SignalKind::Answer => record.answer = payload,
            SignalKind::Candidate => record.candidate = payload,
        }
        record
    }

    pub fn payload(&self) -> Option<&str> {
        match self.kind {
            SignalKind::Offer => self.offer.as_deref(),
            SignalKind::Answer => self.answer.as_deref(),
            SignalKind::Candidate => self.candidate.as_deref(),
        }
    }
}

/// Decoded signaling payload.
#[derive(Debug, Clone)]
pub enum Signal {
    Offer(RTCSessionDescription),
    Answer(RTCSessionDescription),
    Candidate(RTCIceCandidateInit),
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Offer(_) => SignalKind::Offer,
            Signal::Answer(_) => SignalKind::Answer,
            Signal::Candidate(_) => SignalKind::Candidate,
        }
    }

    pub fn into_description(self) -> Option<RTCSessionDescription> {
        match self {
            Signal::Offer(desc) | Signal::Answer(desc) => Some(desc),
            Signal::Candidate(_) => None,
        }
    }

    pub fn into_candidate(self) -> Option<RTCIceCandidateInit> {
        match self {
            Signal::Candidate(init) => Some(init),
            _ => None,
        }
    }

    pub fn encode(&self, format: WireFormat) -> Result<String, EncodeError> {
        let json = match self {
            Signal::Offer(desc) | Signal::Answer(desc) => serde_json::to_string(desc)?,
            Signal::Candidate(init) => serde_json::to_string(init)?,
        };
        match format {
            WireFormat::Json => Ok(json),
            WireFormat::Packed => pack(json.as_bytes()),
        }
    }

    pub fn decode(kind: SignalKind, wire: &str) -> Result<Signal, DecodeError> {
        let json = unpack(wire)?;
        match kind {
            SignalKind::Offer => {
                let desc = decode_description(&json, RTCSdpType::Offer, kind)?;
                Ok(Signal::Offer(desc))
            }
            SignalKind::Answer => {
                let desc = decode_description(&json, RTCSdpType::Answer, kind)?;
                Ok(Signal::Answer(desc))
            }
            SignalKind::Candidate => Ok(Signal::Candidate(serde_json::from_slice(&json)?)),
        }
    }

    /// Wraps the encoded payload into a record sent by `from`.
    pub fn to_record(&self, from: &str, format: WireFormat) -> Result<MailboxRecord, EncodeError> {
        Ok(MailboxRecord::new(self.kind(), from, self.encode(format)?))
    }

    pub fn from_record(record: &MailboxRecord) -> Result<Signal, DecodeError> {
        let wire = record
            .payload()
            .ok_or(DecodeError::MissingPayload(record.kind))?;
        Signal::decode(record.kind, wire)
    }
}

fn decode_description(
    json: &[u8],
    expected: RTCSdpType,
    kind: SignalKind,
) -> Result<RTCSessionDescription, DecodeError> {
    let desc: RTCSessionDescription = serde_json::from_slice(json)?;
    if desc.sdp_type != expected {
        return Err(DecodeError::KindMismatch {
            expected: kind,
            found: desc.sdp_type.to_string(),
        });
    }
    Ok(desc)
}

fn pack(json: &[u8]) -> Result<String, EncodeError> {
    let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
    gz.write_all(json)?;
    let compressed = gz.finish()?;
    Ok(general_purpose::STANDARD.encode(compressed))
}

/// Returns the JSON bytes of a payload in either wire format.
fn unpack(wire: &str) -> Result<Vec<u8>, DecodeError> {
    let trimmed = wire.trim();
    if trimmed.starts_with('{') {
        return Ok(trimmed.as_bytes().to_vec());
    }

    let compressed = general_purpose::STANDARD.decode(trimmed)?;
    let mut json = Vec::new();
    let mut limited = GzDecoder::new(&compressed[..]).take(MAX_INFLATED_SIZE + 1);
    limited.read_to_end(&mut json)?;
    if json.len() as u64 > MAX_INFLATED_SIZE {
        return Err(DecodeError::TooLarge(MAX_INFLATED_SIZE));
    }
    Ok(json)
}
