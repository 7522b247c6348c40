use serde::Serialize;

use crate::peer::negotiation::NegotiationStep;
use crate::peer::types::{EndpointRole, RemoteTrack};
use crate::session::CallState;

/// Notifications published by a [`CallSession`](crate::session::CallSession).
///
/// Failures that happen in background tasks (ICE ingestion, renegotiation)
/// only reach the caller through here.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        state: CallState,
    },
    LocalMedia {
        stream_id: String,
        tracks: usize,
    },
    RemoteTrack(RemoteTrack),
    DataChannelReceived {
        label: String,
    },
    MessageReceived {
        label: String,
        text: String,
    },
    IceCandidateRelayed {
        from: EndpointRole,
        candidate: String,
    },
    IceIngestionFailed {
        to: EndpointRole,
        candidate: String,
        reason: String,
    },
    NegotiationFailed {
        step: NegotiationStep,
        reason: String,
    },
    Negotiated {
        round: u32,
    },
}
