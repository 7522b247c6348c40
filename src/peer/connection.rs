use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::CallConfig;
use crate::error::EndpointError;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::{LocalTrack, MediaKind};
use crate::peer::data_channel::RtcDataChannel;
use crate::peer::endpoint::{DataChannel, Endpoint, EndpointFactory};
use crate::peer::events::EventHub;
use crate::peer::types::{EndpointRole, IceCandidate, RemoteTrack, SessionDescription};

#[derive(Default)]
struct Hubs {
    candidates: EventHub<IceCandidate>,
    tracks: EventHub<RemoteTrack>,
    channels: EventHub<Arc<dyn DataChannel>>,
    negotiation: EventHub<Instant>,
}

/// Endpoint backed by a webrtc-rs peer connection.
pub struct RtcEndpoint {
    role: EndpointRole,
    pc: Arc<RTCPeerConnection>,
    hubs: Arc<Hubs>,
}

impl RtcEndpoint {
    pub async fn new(role: EndpointRole, config: &CallConfig) -> Result<Self, EndpointError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(config.rtc_configuration()).await?);
        let hubs = Arc::new(Hubs::default());
        wire_handlers(role, &pc, &hubs);

        info!("Created {}", role.connection_name());
        Ok(Self { role, pc, hubs })
    }
}

fn wire_handlers(role: EndpointRole, pc: &Arc<RTCPeerConnection>, hubs: &Arc<Hubs>) {
    let name = role.connection_name();

    pc.on_ice_candidate(Box::new({
        let hubs = Arc::clone(hubs);
        move |cand: Option<RTCIceCandidate>| {
            match cand {
                Some(c) => match c.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate::from(init);
                        dump_candidate(name, &candidate);
                        hubs.candidates.publish(candidate);
                    }
                    Err(e) => warn!("{name}: could not serialize ICE candidate: {e}"),
                },
                // None marks the end of gathering
                None => debug!("{name}: ICE candidate gathering completed"),
            }
            Box::pin(async {})
        }
    }));

    pc.on_ice_gathering_state_change(Box::new(move |state| {
        debug!("{name}: ICE gathering state changed to {state:?}");
        Box::pin(async {})
    }));

    pc.on_track(Box::new({
        let hubs = Arc::clone(hubs);
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _tx: Arc<RTCRtpTransceiver>| {
            match MediaKind::from_codec_type(track.kind()) {
                Some(kind) => {
                    let remote = RemoteTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                    };
                    info!("{name}: receiving {} track {}", kind, remote.id);
                    hubs.tracks.publish(remote);

                    // Drain RTP so the receive buffers never back up.
                    tokio::spawn(async move {
                        let mut packets = 0u64;
                        while track.read_rtp().await.is_ok() {
                            packets += 1;
                        }
                        debug!("{name}: remote track {} ended after {} packet(s)", track.id(), packets);
                    });
                }
                None => warn!("{name}: ignoring track of unknown kind"),
            }
            Box::pin(async {})
        }
    }));

    pc.on_data_channel(Box::new({
        let hubs = Arc::clone(hubs);
        move |dc: Arc<RTCDataChannel>| {
            info!("{name}: receiving data channel '{}'", dc.label());
            let channel: Arc<dyn DataChannel> = RtcDataChannel::attach(dc);
            hubs.channels.publish(channel);
            Box::pin(async {})
        }
    }));

    pc.on_negotiation_needed(Box::new({
        let hubs = Arc::clone(hubs);
        move || {
            debug!("{name}: negotiation needed");
            hubs.negotiation.publish(Instant::now());
            Box::pin(async {})
        }
    }));

    let pc_state = Arc::downgrade(pc);
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        info!("{name}: peer connection state changed to {st:?}");
        if st == RTCPeerConnectionState::Failed {
            if let Some(pc) = pc_state.upgrade() {
                tokio::spawn(async move {
                    dump_selected_pair(&pc, "FAILED").await;
                });
            }
        }
        Box::pin(async {})
    }));
}

#[async_trait]
impl Endpoint for RtcEndpoint {
    fn role(&self) -> EndpointRole {
        self.role
    }

    fn name(&self) -> &str {
        self.role.connection_name()
    }

    async fn create_offer(&self) -> Result<SessionDescription, EndpointError> {
        let offer = self.pc.create_offer(None).await?;
        SessionDescription::try_from(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, EndpointError> {
        let answer = self.pc.create_answer(None).await?;
        SessionDescription::try_from(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EndpointError> {
        let desc = RTCSessionDescription::try_from(desc)?;
        self.pc.set_local_description(desc).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), EndpointError> {
        let desc = RTCSessionDescription::try_from(desc)?;
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EndpointError> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), EndpointError> {
        let rtc: Arc<dyn TrackLocal + Send + Sync> = track.rtc_track();
        let sender = self.pc.add_track(rtc).await?;

        // RTCP has to be read for the interceptors to run.
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });
        debug!("{}: attached {} track {}", self.name(), track.kind(), track.id());
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, EndpointError> {
        // SCTP defaults: reliable and ordered
        let dc = self
            .pc
            .create_data_channel(label, Some(RTCDataChannelInit::default()))
            .await?;
        Ok(RtcDataChannel::attach(dc))
    }

    fn subscribe_ice_candidates(&self) -> UnboundedReceiver<IceCandidate> {
        self.hubs.candidates.subscribe()
    }

    fn subscribe_tracks(&self) -> UnboundedReceiver<RemoteTrack> {
        self.hubs.tracks.subscribe()
    }

    fn subscribe_data_channels(&self) -> UnboundedReceiver<Arc<dyn DataChannel>> {
        self.hubs.channels.subscribe()
    }

    fn subscribe_negotiation_needed(&self) -> UnboundedReceiver<Instant> {
        self.hubs.negotiation.subscribe()
    }

    async fn close(&self) -> Result<(), EndpointError> {
        self.hubs.candidates.close();
        self.hubs.tracks.close();
        self.hubs.channels.close();
        self.hubs.negotiation.close();
        self.pc.close().await?;
        info!("Closed {}", self.name());
        Ok(())
    }
}

/// Builds [`RtcEndpoint`]s from a shared [`CallConfig`].
pub struct RtcEndpointFactory {
    config: CallConfig,
}

impl RtcEndpointFactory {
    pub fn new(config: CallConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EndpointFactory for RtcEndpointFactory {
    async fn create(&self, role: EndpointRole) -> Result<Arc<dyn Endpoint>, EndpointError> {
        let endpoint = RtcEndpoint::new(role, &self.config).await?;
        Ok(Arc::new(endpoint))
    }
}
