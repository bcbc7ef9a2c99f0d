// Application configuration.
// The default log level depends on the build profile; RUST_LOG overrides it.

use std::env;

use crate::peer::media::MediaConstraints;
use crate::peer::types::ServerConfig;
use crate::signaling::WireFormat;

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_LEVEL: &str = "debug";

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_LEVEL: &str = "info";

pub const DEFAULT_ICE_SERVER: &str = "stun:stun2.1.google.com:19302";

/// ICE server from a URL and optional credentials; credentials or a `turn`
/// scheme make it a TURN server.
pub fn ice_server(
    url: String,
    username: Option<String>,
    credential: Option<String>,
) -> ServerConfig {
    let kind = if url.starts_with("turn") || username.is_some() {
        "turn"
    } else {
        "stun"
    };
    ServerConfig {
        id: "configured".into(),
        r#type: kind.into(),
        url,
        username,
        credential,
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub ice_server: ServerConfig,
    /// Base URL of the realtime database used as the mailbox relay.
    pub relay_url: Option<String>,
    pub wire_format: WireFormat,
    pub media: MediaConstraints,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ice_server: ServerConfig::stun(DEFAULT_ICE_SERVER),
            relay_url: None,
            wire_format: WireFormat::Json,
            media: MediaConstraints::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(url) = env::var("DUOCALL_ICE_SERVER") {
            config.ice_server = ice_server(
                url,
                env::var("DUOCALL_ICE_USERNAME").ok(),
                env::var("DUOCALL_ICE_CREDENTIAL").ok(),
            );
        }

        config.relay_url = env::var("DUOCALL_RELAY_URL").ok();

        if let Ok(format) = env::var("DUOCALL_WIRE_FORMAT") {
            match format.parse() {
                Ok(format) => config.wire_format = format,
                Err(err) => tracing::warn!("ignoring DUOCALL_WIRE_FORMAT: {err}"),
            }
        }

        config
    }
}
