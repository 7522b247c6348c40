use std::time::Duration;

use thiserror::Error;

use crate::media::MediaKind;
use crate::peer::negotiation::NegotiationStep;
use crate::peer::types::EndpointRole;
use crate::session::CallState;

/// Failure to obtain a local media stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("permission to capture media was denied")]
    PermissionDenied,
    #[error("no {0} capture device available")]
    NoDevice(MediaKind),
    #[error("at least one of audio or video must be requested")]
    EmptyConstraints,
}

/// Errors raised by a single endpoint operation.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error(transparent)]
    Rtc(#[from] webrtc::Error),
    #[error("endpoint is closed")]
    Closed,
    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("media acquisition failed: {0}")]
    MediaAcquisition(#[from] MediaError),

    #[error("negotiation failed at step '{step}': {source}")]
    Negotiation {
        step: NegotiationStep,
        #[source]
        source: EndpointError,
    },

    #[error("negotiation step '{step}' did not complete within {after:?}")]
    NegotiationTimeout { step: NegotiationStep, after: Duration },

    #[error("ICE candidate rejected by {endpoint}: {source}")]
    IceIngestion {
        endpoint: String,
        #[source]
        source: EndpointError,
    },

    #[error("data channel is not ready")]
    ChannelNotReady,

    #[error("failed to send message: {0}")]
    Send(#[source] EndpointError),

    #[error("a call is already in progress (state: {0})")]
    AlreadyStarted(CallState),

    #[error("no call in progress")]
    NotStarted,

    #[error("call was ended while it was being set up")]
    Interrupted,

    #[error("cannot attach {what} while an offer is outstanding")]
    LateAttachment { what: String },

    #[error("failed to create {role} endpoint: {source}")]
    EndpointSetup {
        role: EndpointRole,
        #[source]
        source: EndpointError,
    },
}
