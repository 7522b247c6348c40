//! In-memory endpoints that behave like a pair of peer connections, without
//! any networking.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;

use loopcall::error::{EndpointError, MediaError};
use loopcall::media::{LocalTrack, MediaConstraints, MediaKind, MediaSource, MediaStream};
use loopcall::peer::events::EventHub;
use loopcall::peer::{
    DataChannel, Endpoint, EndpointFactory, EndpointRole, IceCandidate, NegotiationStep,
    RemoteTrack, SdpKind, SessionDescription,
};
use loopcall::{CallConfig, CallSession, SessionEvent, SyntheticMediaSource};

#[derive(Debug, Clone, Default)]
pub struct Behavior {
    pub fail_at: Option<NegotiationStep>,
    pub hang_at: Option<NegotiationStep>,
    /// Host candidates each endpoint discovers when its local description is set.
    pub candidates: usize,
    pub reject_candidates: bool,
    pub fail_create: Option<EndpointRole>,
}

pub struct FakeNetwork {
    behavior: Behavior,
    created: AtomicUsize,
    endpoints: Mutex<Vec<Arc<FakeEndpoint>>>,
}

impl FakeNetwork {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            created: AtomicUsize::new(0),
            endpoints: Mutex::new(Vec::new()),
        })
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Most recently created endpoint with `role`.
    pub fn endpoint(&self, role: EndpointRole) -> Arc<FakeEndpoint> {
        self.endpoints
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|e| e.role == role)
            .cloned()
            .expect("endpoint was never created")
    }

    fn peer_of(&self, endpoint: &FakeEndpoint) -> Option<Arc<FakeEndpoint>> {
        self.endpoints
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|e| e.role == endpoint.role.peer())
            .cloned()
    }
}

#[async_trait]
impl EndpointFactory for FakeNetwork {
    async fn create(&self, role: EndpointRole) -> Result<Arc<dyn Endpoint>, EndpointError> {
        if self.behavior.fail_create == Some(role) {
            return Err(EndpointError::Rejected(format!("cannot create {role} endpoint")));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        let endpoint = Arc::new(FakeEndpoint::new(role, self.behavior.clone()));
        // the session always creates the local endpoint first
        let peer = match role {
            EndpointRole::Remote => self.peer_of(&endpoint),
            EndpointRole::Local => None,
        };
        if let Some(peer) = peer {
            let _ = endpoint.peer.set(Arc::downgrade(&peer));
            let _ = peer.peer.set(Arc::downgrade(&endpoint));
        }
        self.endpoints.lock().unwrap().push(Arc::clone(&endpoint));
        Ok(endpoint)
    }
}

#[derive(Default)]
struct FakeState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    tracks: Vec<(String, String, MediaKind)>,
    channels: Vec<Arc<FakeChannel>>,
    received: Vec<Arc<FakeChannel>>,
    delivered_tracks: HashSet<String>,
    delivered_channels: HashSet<String>,
    offers: Vec<String>,
    ingested: Vec<IceCandidate>,
    gathered: bool,
}

pub struct FakeEndpoint {
    pub role: EndpointRole,
    behavior: Behavior,
    peer: OnceLock<Weak<FakeEndpoint>>,
    state: Mutex<FakeState>,
    closed: AtomicBool,
    candidates: EventHub<IceCandidate>,
    tracks: EventHub<RemoteTrack>,
    channels: EventHub<Arc<dyn DataChannel>>,
    negotiation: EventHub<Instant>,
}

impl FakeEndpoint {
    fn new(role: EndpointRole, behavior: Behavior) -> Self {
        Self {
            role,
            behavior,
            peer: OnceLock::new(),
            state: Mutex::new(FakeState::default()),
            closed: AtomicBool::new(false),
            candidates: EventHub::new(),
            tracks: EventHub::new(),
            channels: EventHub::new(),
            negotiation: EventHub::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn ingested(&self) -> Vec<IceCandidate> {
        self.lock().ingested.clone()
    }

    pub fn offers(&self) -> Vec<String> {
        self.lock().offers.clone()
    }

    pub fn track_count(&self) -> usize {
        self.lock().tracks.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn emit_candidate(&self, candidate: IceCandidate) {
        self.candidates.publish(candidate);
    }

    pub fn signal_negotiation_needed(&self) {
        self.negotiation.publish(Instant::now());
    }

    async fn gate(&self, step: NegotiationStep) -> Result<(), EndpointError> {
        if self.is_closed() {
            return Err(EndpointError::Closed);
        }
        if self.behavior.hang_at == Some(step) {
            // stuck until the endpoint is closed, like a real connection
            while !self.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            return Err(EndpointError::Closed);
        }
        if self.behavior.fail_at == Some(step) {
            return Err(EndpointError::Rejected(format!("injected failure: {step}")));
        }
        Ok(())
    }

    fn describe(&self) -> String {
        let state = self.lock();
        let mut sdp = format!("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns={}\r\n", self.role);
        for (id, stream, kind) in &state.tracks {
            sdp.push_str(&format!("a=track:{kind}:{stream}:{id}\r\n"));
        }
        for channel in &state.channels {
            sdp.push_str(&format!("a=channel:{}\r\n", channel.label));
        }
        sdp
    }

    fn gather(&self) {
        let count = {
            let mut state = self.lock();
            if state.gathered {
                return;
            }
            state.gathered = true;
            self.behavior.candidates
        };
        for i in 0..count {
            self.candidates.publish(host_candidate(self.role, i));
        }
    }

    /// Surfaces whatever the peer's description announces and is new to us.
    fn learn(&self, desc: &SessionDescription, network_peer: Option<Arc<FakeEndpoint>>) {
        for line in desc.sdp.lines() {
            if let Some(track) = line.strip_prefix("a=track:") {
                let mut parts = track.splitn(3, ':');
                let (Some(kind), Some(stream), Some(id)) = (parts.next(), parts.next(), parts.next())
                else {
                    continue;
                };
                if !self.lock().delivered_tracks.insert(id.to_string()) {
                    continue;
                }
                let kind = if kind == "audio" { MediaKind::Audio } else { MediaKind::Video };
                self.tracks.publish(RemoteTrack {
                    id: id.to_string(),
                    stream_id: stream.to_string(),
                    kind,
                });
            } else if let Some(label) = line.strip_prefix("a=channel:") {
                if !self.lock().delivered_channels.insert(label.to_string()) {
                    continue;
                }
                let Some(peer) = network_peer.as_ref() else { continue };
                let Some(theirs) = peer.lock().channels.iter().find(|c| c.label == label).cloned()
                else {
                    continue;
                };
                let ours = FakeChannel::new(label);
                ours.pair(&theirs);
                self.lock().received.push(Arc::clone(&ours));
                self.channels.publish(ours);
            }
        }
    }
}

pub fn host_candidate(role: EndpointRole, i: usize) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{role}{i} 1 udp 2122260223 127.0.0.1 {} typ host", 50000 + i),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

#[async_trait]
impl Endpoint for FakeEndpoint {
    fn role(&self) -> EndpointRole {
        self.role
    }

    fn name(&self) -> &str {
        self.role.connection_name()
    }

    async fn create_offer(&self) -> Result<SessionDescription, EndpointError> {
        self.gate(NegotiationStep::CreateOffer).await?;
        let sdp = self.describe();
        self.lock().offers.push(sdp.clone());
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EndpointError> {
        self.gate(NegotiationStep::CreateAnswer).await?;
        if self.lock().remote.is_none() {
            return Err(EndpointError::Rejected("no remote offer".into()));
        }
        Ok(SessionDescription::answer(self.describe()))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EndpointError> {
        let step = match desc.kind {
            SdpKind::Offer => NegotiationStep::SetLocalOffer,
            SdpKind::Answer => NegotiationStep::SetLocalAnswer,
        };
        self.gate(step).await?;
        self.lock().local = Some(desc);
        self.gather();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EndpointError> {
        let step = match desc.kind {
            SdpKind::Offer => NegotiationStep::SetRemoteOffer,
            SdpKind::Answer => NegotiationStep::SetRemoteAnswer,
        };
        self.gate(step).await?;
        let peer = self.peer.get().and_then(Weak::upgrade);
        self.learn(&desc, peer);
        self.lock().remote = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EndpointError> {
        if self.is_closed() {
            return Err(EndpointError::Closed);
        }
        if self.lock().remote.is_none() {
            return Err(EndpointError::Rejected("remote description not set".into()));
        }
        if self.behavior.reject_candidates || candidate.candidate.is_empty() {
            return Err(EndpointError::Rejected("malformed candidate".into()));
        }
        self.lock().ingested.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), EndpointError> {
        self.lock().tracks.push((
            track.id().to_string(),
            track.stream_id().to_string(),
            track.kind(),
        ));
        self.negotiation.publish(Instant::now());
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, EndpointError> {
        let channel = FakeChannel::new(label);
        self.lock().channels.push(Arc::clone(&channel));
        Ok(channel)
    }

    fn subscribe_ice_candidates(&self) -> UnboundedReceiver<IceCandidate> {
        self.candidates.subscribe()
    }

    fn subscribe_tracks(&self) -> UnboundedReceiver<RemoteTrack> {
        self.tracks.subscribe()
    }

    fn subscribe_data_channels(&self) -> UnboundedReceiver<Arc<dyn DataChannel>> {
        self.channels.subscribe()
    }

    fn subscribe_negotiation_needed(&self) -> UnboundedReceiver<Instant> {
        self.negotiation.subscribe()
    }

    async fn close(&self) -> Result<(), EndpointError> {
        self.closed.store(true, Ordering::SeqCst);
        let state = self.lock();
        for channel in state.channels.iter().chain(&state.received) {
            channel.closed.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

pub struct FakeChannel {
    label: String,
    peer: OnceLock<Weak<FakeChannel>>,
    messages: EventHub<String>,
    closed: AtomicBool,
}

impl FakeChannel {
    fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            peer: OnceLock::new(),
            messages: EventHub::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn pair(self: &Arc<Self>, other: &Arc<FakeChannel>) {
        let _ = self.peer.set(Arc::downgrade(other));
        let _ = other.peer.set(Arc::downgrade(self));
    }
}

#[async_trait]
impl DataChannel for FakeChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send_text(&self, text: &str) -> Result<(), EndpointError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EndpointError::Closed);
        }
        let peer = self
            .peer
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| EndpointError::Rejected("channel not open".into()))?;
        peer.messages.publish(text.to_string());
        Ok(())
    }

    fn subscribe_messages(&self) -> UnboundedReceiver<String> {
        self.messages.subscribe()
    }

    async fn close(&self) -> Result<(), EndpointError> {
        self.closed.store(true, Ordering::SeqCst);
        self.messages.close();
        Ok(())
    }
}

/// Wraps the synthetic source and keeps every stream it hands out.
#[derive(Default)]
pub struct RecordingMedia {
    inner: SyntheticMediaSource,
    streams: Mutex<Vec<MediaStream>>,
    gate: Option<Arc<Notify>>,
}

impl RecordingMedia {
    pub fn new(inner: SyntheticMediaSource) -> Arc<Self> {
        Arc::new(Self {
            inner,
            streams: Mutex::new(Vec::new()),
            gate: None,
        })
    }

    /// Stream acquisition blocks until the returned gate is notified.
    pub fn gated(inner: SyntheticMediaSource) -> (Arc<Self>, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let media = Arc::new(Self {
            inner,
            streams: Mutex::new(Vec::new()),
            gate: Some(Arc::clone(&gate)),
        });
        (media, gate)
    }

    pub fn streams(&self) -> Vec<MediaStream> {
        self.streams.lock().unwrap().clone()
    }

    pub fn last(&self) -> MediaStream {
        self.streams().pop().expect("no stream acquired")
    }
}

#[async_trait]
impl MediaSource for RecordingMedia {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let stream = self.inner.acquire(constraints).await?;
        self.streams.lock().unwrap().push(stream.clone());
        Ok(stream)
    }

    async fn acquire_track(
        &self,
        kind: MediaKind,
        stream_id: &str,
    ) -> Result<LocalTrack, MediaError> {
        self.inner.acquire_track(kind, stream_id).await
    }
}

pub struct Harness {
    pub session: Arc<CallSession>,
    pub network: Arc<FakeNetwork>,
    pub media: Arc<RecordingMedia>,
}

impl Harness {
    pub fn new(behavior: Behavior) -> Self {
        Self::with(CallConfig::default(), SyntheticMediaSource::default(), behavior)
    }

    pub fn with(config: CallConfig, source: SyntheticMediaSource, behavior: Behavior) -> Self {
        Self::around(config, RecordingMedia::new(source), behavior)
    }

    pub fn around(config: CallConfig, media: Arc<RecordingMedia>, behavior: Behavior) -> Self {
        let network = FakeNetwork::new(behavior);
        let session = Arc::new(CallSession::new(
            config,
            Arc::clone(&media) as Arc<dyn MediaSource>,
            Arc::clone(&network) as Arc<dyn EndpointFactory>,
        ));
        Self {
            session,
            network,
            media,
        }
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Waits for the first event matching `pick`.
pub async fn next_event<T>(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut pick: impl FnMut(SessionEvent) -> Option<T>,
) -> Option<T> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(event) {
                        return Some(found);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), wait).await.ok().flatten()
}
