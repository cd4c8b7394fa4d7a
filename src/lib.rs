pub mod audio;
pub mod capability;
pub mod config;
pub mod connection;
pub mod devices;
pub mod error;
pub mod media;
pub mod metrics;
pub mod notify;
pub mod optimizer;
pub mod peer;
pub mod registry;
pub mod room;
pub mod screen_share;
pub mod signaling;
pub mod vad;
pub mod webrtc;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
