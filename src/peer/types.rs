use std::fmt;

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::EndpointError;
use crate::media::MediaKind;

/// Which side of the loopback an endpoint plays.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    Local,
    Remote,
}

impl EndpointRole {
    pub fn peer(self) -> Self {
        match self {
            EndpointRole::Local => EndpointRole::Remote,
            EndpointRole::Remote => EndpointRole::Local,
        }
    }

    pub fn connection_name(self) -> &'static str {
        match self {
            EndpointRole::Local => "local peer connection",
            EndpointRole::Remote => "remote peer connection",
        }
    }
}

impl fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointRole::Local => write!(f, "local"),
            EndpointRole::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

impl TryFrom<RTCSessionDescription> for SessionDescription {
    type Error = EndpointError;

    fn try_from(desc: RTCSessionDescription) -> Result<Self, Self::Error> {
        match desc.sdp_type {
            RTCSdpType::Offer => Ok(Self::offer(desc.sdp)),
            RTCSdpType::Answer | RTCSdpType::Pranswer => Ok(Self::answer(desc.sdp)),
            other => Err(EndpointError::Rejected(format!(
                "unsupported session description type {other}"
            ))),
        }
    }
}

impl TryFrom<SessionDescription> for RTCSessionDescription {
    type Error = EndpointError;

    fn try_from(desc: SessionDescription) -> Result<Self, Self::Error> {
        let parsed = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
        };
        Ok(parsed)
    }
}

/// ICE candidate as trickled between the two endpoints
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn kind(&self) -> CandidateKind {
        CandidateKind::of(&self.candidate)
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(c: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CandidateKind {
    Host,
    Srflx,
    Prflx,
    Relay,
    Unknown,
}

impl CandidateKind {
    /// Reads the `typ` field of a candidate line.
    pub fn of(candidate: &str) -> Self {
        let mut fields = candidate.split_whitespace();
        while let Some(field) = fields.next() {
            if field == "typ" {
                return match fields.next() {
                    Some("host") => CandidateKind::Host,
                    Some("srflx") => CandidateKind::Srflx,
                    Some("prflx") => CandidateKind::Prflx,
                    Some("relay") => CandidateKind::Relay,
                    _ => CandidateKind::Unknown,
                };
            }
        }
        CandidateKind::Unknown
    }
}

/// A media track that arrived on an endpoint from its peer.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
}
