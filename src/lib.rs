//! Loopback WebRTC call: two peer connections in one process exchanging
//! media and a text data channel.

pub mod config;
pub mod error;
pub mod events;
pub mod logger;
pub mod media;
pub mod peer;
pub mod session;
pub mod surface;
pub mod utils;

pub use config::{CallConfig, LoggingConfig, ServerConfig, ServerKind};
pub use error::{CallError, ConfigError, EndpointError, MediaError};
pub use events::SessionEvent;
pub use media::{LocalTrack, MediaConstraints, MediaKind, MediaSource, MediaStream, SyntheticMediaSource};
pub use session::{CallSession, CallState};
pub use surface::Surfaces;
