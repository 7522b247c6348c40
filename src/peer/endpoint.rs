use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

use crate::error::EndpointError;
use crate::media::LocalTrack;
use crate::peer::types::{EndpointRole, IceCandidate, RemoteTrack, SessionDescription};

/// A text data channel between the two endpoints.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    /// Sends `text` as a string message, waiting for the channel to open first.
    async fn send_text(&self, text: &str) -> Result<(), EndpointError>;

    /// Inbound messages, in arrival order.
    fn subscribe_messages(&self) -> UnboundedReceiver<String>;

    async fn close(&self) -> Result<(), EndpointError>;
}

/// One side of a peer connection.
///
/// Events are exposed as one subscription per kind instead of callback
/// properties; each call returns a fresh receiver.
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn role(&self) -> EndpointRole;

    fn name(&self) -> &str;

    async fn create_offer(&self) -> Result<SessionDescription, EndpointError>;

    async fn create_answer(&self) -> Result<SessionDescription, EndpointError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EndpointError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), EndpointError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EndpointError>;

    async fn add_track(&self, track: &LocalTrack) -> Result<(), EndpointError>;

    async fn create_data_channel(&self, label: &str)
        -> Result<Arc<dyn DataChannel>, EndpointError>;

    fn subscribe_ice_candidates(&self) -> UnboundedReceiver<IceCandidate>;

    fn subscribe_tracks(&self) -> UnboundedReceiver<RemoteTrack>;

    fn subscribe_data_channels(&self) -> UnboundedReceiver<Arc<dyn DataChannel>>;

    /// Each item is the moment the endpoint asked for a new offer.
    fn subscribe_negotiation_needed(&self) -> UnboundedReceiver<Instant>;

    async fn close(&self) -> Result<(), EndpointError>;
}

#[async_trait]
pub trait EndpointFactory: Send + Sync {
    async fn create(&self, role: EndpointRole) -> Result<Arc<dyn Endpoint>, EndpointError>;
}
