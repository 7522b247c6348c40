pub mod connection;
pub mod data_channel;
pub mod endpoint;
pub mod events;
pub mod ice;
pub mod negotiation;
pub mod types;

pub use connection::{RtcEndpoint, RtcEndpointFactory};
pub use endpoint::{DataChannel, Endpoint, EndpointFactory};
pub use ice::{CandidateSummary, IceRelay, RelayStats};
pub use negotiation::{NegotiationStep, Negotiator};
pub use types::{CandidateKind, EndpointRole, IceCandidate, RemoteTrack, SdpKind, SessionDescription};
