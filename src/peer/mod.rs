pub mod connection;
pub mod health;
pub mod ice;
pub mod media;
pub mod types;

pub use connection::{ConnectionFactory, PeerConnection, RtcConnectionFactory};
pub use health::HealthMonitor;
pub use media::{LocalMedia, MediaConstraints, MediaSource, SampleSource};
pub use types::{ConnectionEvent, ConnectivityStatus, RemoteTrack, ServerConfig};
