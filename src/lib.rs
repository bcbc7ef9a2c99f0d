pub mod commands;
pub mod config;
pub mod error;
pub mod logger;
pub mod peer;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod utils;

#[cfg(test)]
mod testing;

pub use commands::Client;
pub use config::Config;
pub use error::SessionError;
pub use session::{EndReason, Phase, Session, SessionEvent};
