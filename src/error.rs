use thiserror::Error;

use crate::signaling::SignalKind;

/// Failures talking to the mailbox relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("relay answered {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("relay record is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid relay address: {0}")]
    Url(#[from] url::ParseError),

    #[error("relay event stream failed: {0}")]
    Stream(String),

    #[error("relay slot `{0}` is unavailable")]
    Unavailable(String),

    #[error("`{0}` cannot be used as a mailbox key")]
    InvalidUser(String),
}

/// A signaling payload that could not be read.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("`{0}` record carries no `{0}` payload")]
    MissingPayload(SignalKind),

    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("packed payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("packed payload failed to inflate: {0}")]
    Inflate(#[from] std::io::Error),

    #[error("packed payload exceeds {0} bytes once inflated")]
    TooLarge(u64),

    #[error("expected a `{expected}` description, got `{found}`")]
    KindMismatch { expected: SignalKind, found: String },
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("payload could not be serialized: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload could not be compressed: {0}")]
    Deflate(#[from] std::io::Error),
}

/// Local audio/video capture was refused or impossible.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("permission to capture audio/video was denied")]
    PermissionDenied,

    #[error("no capture device is available")]
    NoDevice,

    #[error("capture constraints cannot be satisfied: {0}")]
    Unsatisfiable(String),
}

/// Errors of the underlying RTC connection.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Rtc(#[from] webrtc::Error),

    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("local media acquisition failed: {0}")]
    MediaAcquisition(#[from] MediaError),

    #[error("connection setup failed: {0}")]
    ConnectionInit(#[source] PeerError),

    #[error("signaling state error: {0}")]
    SignalingState(String),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("malformed signaling message: {0}")]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl SessionError {
    pub(crate) fn signaling(context: &str, err: impl std::fmt::Display) -> Self {
        SessionError::SignalingState(format!("{context}: {err}"))
    }
}
