//! Call lifecycle: `Idle → Starting → Active → Ending → Idle`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{broadcast, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::config::{CallConfig, ServerKind};
use crate::error::{CallError, EndpointError};
use crate::events::SessionEvent;
use crate::media::{LocalTrack, MediaKind, MediaSource, MediaStream, SyntheticMediaSource};
use crate::peer::ice::{log_analysis, summary_by_role};
use crate::peer::{
    DataChannel, Endpoint, EndpointFactory, EndpointRole, IceRelay, Negotiator, RelayStats,
    RemoteTrack, RtcEndpointFactory,
};
use crate::surface::Surfaces;
use crate::utils::random_id;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Idle,
    Starting,
    Active,
    Ending,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallState::Idle => "idle",
            CallState::Starting => "starting",
            CallState::Active => "active",
            CallState::Ending => "ending",
        };
        f.write_str(s)
    }
}

struct LifecycleState {
    state: CallState,
    // bumped on every Idle -> Starting so a stale start can tell it was ended
    generation: u64,
}

struct Lifecycle {
    inner: StdMutex<LifecycleState>,
    events: broadcast::Sender<SessionEvent>,
}

impl Lifecycle {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: StdMutex::new(LifecycleState {
                state: CallState::Idle,
                generation: 0,
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LifecycleState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get(&self) -> CallState {
        self.lock().state
    }

    /// Moves to `to` if the current state is one of `from`; returns the generation.
    fn advance(&self, from: &[CallState], to: CallState) -> Result<u64, CallState> {
        let generation = {
            let mut inner = self.lock();
            if !from.contains(&inner.state) {
                return Err(inner.state);
            }
            inner.state = to;
            if to == CallState::Starting {
                inner.generation += 1;
            }
            inner.generation
        };
        self.announce(to);
        Ok(generation)
    }

    /// Like `advance`, but only within the given generation.
    fn advance_within(&self, generation: u64, from: CallState, to: CallState) -> bool {
        {
            let mut inner = self.lock();
            if inner.generation != generation || inner.state != from {
                return false;
            }
            inner.state = to;
        }
        self.announce(to);
        true
    }

    fn is_current(&self, generation: u64, state: CallState) -> bool {
        let inner = self.lock();
        inner.generation == generation && inner.state == state
    }

    fn set(&self, to: CallState) {
        self.lock().state = to;
        self.announce(to);
    }

    fn announce(&self, state: CallState) {
        debug!("Call state -> {}", state);
        let _ = self.events.send(SessionEvent::StateChanged { state });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/// Everything owned by a call between `start_call` and `end_call`.
struct ActiveCall {
    id: String,
    started_at: DateTime<Local>,
    local: Arc<dyn Endpoint>,
    remote: Arc<dyn Endpoint>,
    stream: MediaStream,
    channel: Arc<dyn DataChannel>,
    negotiator: Arc<Negotiator>,
    relays: Vec<(EndpointRole, Arc<IceRelay>)>,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveCall {
    async fn teardown(self) -> HashMap<EndpointRole, RelayStats> {
        self.negotiator.cancel();
        for task in &self.tasks {
            task.abort();
        }

        let mut stats = HashMap::new();
        for (from, relay) in &self.relays {
            let relay_stats = relay.close().await;
            log_analysis(*from, &relay_stats);
            stats.insert(*from, relay_stats);
        }

        // Release camera + mic
        self.stream.stop_all();

        if let Err(e) = self.channel.close().await {
            debug!("Closing data channel '{}': {}", self.channel.label(), e);
        }
        close_endpoints(&self.local, &self.remote).await;

        info!(
            "Call {} torn down after {}s",
            self.id,
            (Local::now() - self.started_at).num_seconds()
        );
        stats
    }
}

async fn close_endpoints(local: &Arc<dyn Endpoint>, remote: &Arc<dyn Endpoint>) {
    for endpoint in [local, remote] {
        if let Err(e) = endpoint.close().await {
            warn!("Failed to close {}: {}", endpoint.name(), e);
        }
    }
}

/// A loopback call between two endpoints owned by this value.
pub struct CallSession {
    config: CallConfig,
    media: Arc<dyn MediaSource>,
    factory: Arc<dyn EndpointFactory>,
    surfaces: Arc<Surfaces>,
    lifecycle: Arc<Lifecycle>,
    call: Mutex<Option<ActiveCall>>,
}

impl CallSession {
    pub fn new(
        config: CallConfig,
        media: Arc<dyn MediaSource>,
        factory: Arc<dyn EndpointFactory>,
    ) -> Self {
        Self {
            config,
            media,
            factory,
            surfaces: Arc::new(Surfaces::default()),
            lifecycle: Arc::new(Lifecycle::new()),
            call: Mutex::new(None),
        }
    }

    /// webrtc-rs endpoints fed by the synthetic media source.
    pub fn loopback(config: CallConfig) -> Self {
        let factory = Arc::new(RtcEndpointFactory::new(config.clone()));
        Self::new(config, Arc::new(SyntheticMediaSource::default()), factory)
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    pub fn state(&self) -> CallState {
        self.lifecycle.get()
    }

    pub fn surfaces(&self) -> &Surfaces {
        &self.surfaces
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.lifecycle.events.subscribe()
    }

    /// True once the initial negotiation completed and until the call ends.
    pub fn can_send(&self) -> bool {
        self.state() == CallState::Active
    }

    pub async fn call_id(&self) -> Option<String> {
        self.call.lock().await.as_ref().map(|c| c.id.clone())
    }

    pub async fn local_stream(&self) -> Option<MediaStream> {
        self.call.lock().await.as_ref().map(|c| c.stream.clone())
    }

    pub async fn negotiation_rounds(&self) -> u32 {
        self.call
            .lock()
            .await
            .as_ref()
            .map_or(0, |c| c.negotiator.rounds())
    }

    /// Relay statistics keyed by the endpoint that discovered the candidates.
    pub async fn ice_stats(&self) -> HashMap<EndpointRole, RelayStats> {
        let call = self.call.lock().await;
        let mut stats = HashMap::new();
        if let Some(call) = call.as_ref() {
            for (from, relay) in &call.relays {
                stats.insert(*from, relay.stats().await);
            }
        }
        stats
    }

    pub async fn start_call(&self) -> Result<(), CallError> {
        info!("Starting call...");
        let generation = self
            .lifecycle
            .advance(&[CallState::Idle], CallState::Starting)
            .map_err(CallError::AlreadyStarted)?;

        let stream = match self.media.acquire(&self.config.media).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Something went wrong starting local media stream: {}", e);
                self.revert(generation);
                return Err(e.into());
            }
        };
        if !self.lifecycle.is_current(generation, CallState::Starting) {
            stream.stop_all();
            return Err(CallError::Interrupted);
        }
        self.surfaces
            .local_video
            .show(stream.id(), stream.track_ids());
        self.lifecycle.emit(SessionEvent::LocalMedia {
            stream_id: stream.id().to_string(),
            tracks: stream.tracks().len(),
        });

        let call = match self.setup(stream.clone()).await {
            Ok(call) => call,
            Err(e) => {
                error!("Call setup failed: {}", e);
                stream.stop_all();
                self.revert(generation);
                return Err(e);
            }
        };
        let negotiator = Arc::clone(&call.negotiator);

        {
            let mut slot = self.call.lock().await;
            if !self.lifecycle.is_current(generation, CallState::Starting) {
                drop(slot);
                call.teardown().await;
                self.surfaces.local_video.clear_if_showing(stream.id());
                return Err(CallError::Interrupted);
            }
            *slot = Some(call);
        }

        // On failure the session stays in Starting with whatever was negotiated.
        if let Err(e) = negotiator.run().await {
            if !self.lifecycle.is_current(generation, CallState::Starting) {
                debug!("Negotiation ended by end_call: {}", e);
                return Err(CallError::Interrupted);
            }
            return Err(e);
        }

        if !self
            .lifecycle
            .advance_within(generation, CallState::Starting, CallState::Active)
        {
            return Err(CallError::Interrupted);
        }
        info!("Call started");
        Ok(())
    }

    /// Undoes a failed start, unless the call was ended meanwhile.
    fn revert(&self, generation: u64) {
        if self
            .lifecycle
            .advance_within(generation, CallState::Starting, CallState::Idle)
        {
            self.surfaces.local_video.clear();
        }
    }

    async fn setup(&self, stream: MediaStream) -> Result<ActiveCall, CallError> {
        let local = self
            .factory
            .create(EndpointRole::Local)
            .await
            .map_err(|source| CallError::EndpointSetup {
                role: EndpointRole::Local,
                source,
            })?;
        let remote = match self.factory.create(EndpointRole::Remote).await {
            Ok(remote) => remote,
            Err(source) => {
                if let Err(e) = local.close().await {
                    warn!("Failed to close {}: {}", local.name(), e);
                }
                return Err(CallError::EndpointSetup {
                    role: EndpointRole::Remote,
                    source,
                });
            }
        };

        let events = self.lifecycle.events.clone();
        let to_remote = IceRelay::new(EndpointRole::Local, Arc::clone(&remote), events.clone());
        let to_local = IceRelay::new(EndpointRole::Remote, Arc::clone(&local), events.clone());

        let mut tasks = vec![
            to_remote.spawn(local.subscribe_ice_candidates()),
            to_local.spawn(remote.subscribe_ice_candidates()),
            spawn_track_renderer(
                remote.subscribe_tracks(),
                Arc::clone(&self.surfaces),
                events.clone(),
            ),
            spawn_message_forwarder(
                remote.subscribe_data_channels(),
                Arc::clone(&self.surfaces),
                events.clone(),
            ),
        ];

        // Tracks and the data channel must be on the local endpoint before its offer.
        let attached = attach_before_offer(&local, &stream, &self.config.data_channel_label).await;
        let channel = match attached {
            Ok(channel) => channel,
            Err(source) => {
                for task in &tasks {
                    task.abort();
                }
                close_endpoints(&local, &remote).await;
                return Err(CallError::EndpointSetup {
                    role: EndpointRole::Local,
                    source,
                });
            }
        };

        let negotiator = Negotiator::new(
            Arc::clone(&local),
            Arc::clone(&remote),
            Arc::clone(&to_local),
            Arc::clone(&to_remote),
            self.config.negotiation_timeout(),
            events,
        );
        tasks.push(spawn_renegotiation(
            local.subscribe_negotiation_needed(),
            Arc::clone(&negotiator),
            Arc::clone(&self.lifecycle),
        ));

        Ok(ActiveCall {
            id: random_id(),
            started_at: Local::now(),
            local,
            remote,
            stream,
            channel,
            negotiator,
            relays: vec![(EndpointRole::Local, to_remote), (EndpointRole::Remote, to_local)],
            tasks,
        })
    }

    pub async fn end_call(&self) -> Result<(), CallError> {
        info!("Ending call...");
        self.lifecycle
            .advance(&[CallState::Starting, CallState::Active], CallState::Ending)
            .map_err(|_| CallError::NotStarted)?;

        let call = self.call.lock().await.take();
        match call {
            Some(call) => {
                let stats = call.teardown().await;
                let has_turn = self
                    .config
                    .ice_servers
                    .iter()
                    .any(|s| s.kind == ServerKind::Turn);
                if has_turn && summary_by_role(&stats).relay == 0 {
                    warn!("No TURN relay candidates found! Connection through NAT may fail.");
                }
            }
            None => debug!("No endpoints were created for this call"),
        }

        // Remove video from both surfaces
        self.surfaces.clear_video();
        self.lifecycle.set(CallState::Idle);
        info!("Call ended");
        Ok(())
    }

    /// Sends `text` over the local data channel.
    pub async fn send_message(&self, text: &str) -> Result<(), CallError> {
        let channel = {
            let call = self.call.lock().await;
            match (self.state(), call.as_ref()) {
                (CallState::Active, Some(call)) => Arc::clone(&call.channel),
                _ => return Err(CallError::ChannelNotReady),
            }
        };

        info!("Sending message on local data channel...");
        let sent = match self.config.send_timeout() {
            Some(limit) => tokio::time::timeout(limit, channel.send_text(text))
                .await
                .map_err(|_| CallError::ChannelNotReady)?,
            None => channel.send_text(text).await,
        };
        sent.map_err(|e| match e {
            EndpointError::Closed => CallError::ChannelNotReady,
            other => CallError::Send(other),
        })
    }

    /// Captures one more track into the local stream and renegotiates so the
    /// remote side receives it.
    pub async fn add_track(&self, kind: MediaKind) -> Result<LocalTrack, CallError> {
        let (local, negotiator, stream_id) = {
            let call = self.call.lock().await;
            match (self.state(), call.as_ref()) {
                (CallState::Active, Some(call)) => (
                    Arc::clone(&call.local),
                    Arc::clone(&call.negotiator),
                    call.stream.id().to_string(),
                ),
                (CallState::Starting, _) | (CallState::Ending, _) => {
                    return Err(CallError::LateAttachment {
                        what: format!("{kind} track"),
                    })
                }
                _ => return Err(CallError::NotStarted),
            }
        };

        let track = self.media.acquire_track(kind, &stream_id).await?;
        let what = format!("{} track {}", track.kind(), track.id());
        let attached = match negotiator.try_begin_attach(&what) {
            Ok(_hold) => local.add_track(&track).await.map_err(|source| {
                CallError::EndpointSetup {
                    role: EndpointRole::Local,
                    source,
                }
            }),
            Err(e) => Err(e),
        };
        if let Err(e) = attached {
            track.stop();
            return Err(e);
        }

        if let Some(call) = self.call.lock().await.as_mut() {
            call.stream.push(track.clone());
        } else {
            // Ended while attaching
            track.stop();
            return Err(CallError::Interrupted);
        }
        self.surfaces
            .local_video
            .attach_track(track.stream_id(), track.id());

        info!("Attached {}, renegotiating", what);
        negotiator.run().await?;
        Ok(track)
    }

    /// Re-runs the offer/answer exchange on an active call.
    pub async fn renegotiate(&self) -> Result<(), CallError> {
        let negotiator = {
            let call = self.call.lock().await;
            match (self.state(), call.as_ref()) {
                (CallState::Active, Some(call)) => Arc::clone(&call.negotiator),
                _ => return Err(CallError::NotStarted),
            }
        };
        negotiator.run().await
    }
}

async fn attach_before_offer(
    local: &Arc<dyn Endpoint>,
    stream: &MediaStream,
    label: &str,
) -> Result<Arc<dyn DataChannel>, EndpointError> {
    for track in stream.tracks() {
        local.add_track(track).await?;
    }
    local.create_data_channel(label).await
}

fn spawn_track_renderer(
    mut tracks: UnboundedReceiver<RemoteTrack>,
    surfaces: Arc<Surfaces>,
    events: broadcast::Sender<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(track) = tracks.recv().await {
            info!("Receiving local peer {} track {}", track.kind, track.id);
            surfaces
                .remote_video
                .attach_track(&track.stream_id, &track.id);
            let _ = events.send(SessionEvent::RemoteTrack(track));
        }
    })
}

fn spawn_message_forwarder(
    mut channels: UnboundedReceiver<Arc<dyn DataChannel>>,
    surfaces: Arc<Surfaces>,
    events: broadcast::Sender<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // dropped with this task, which aborts the readers
        let mut readers = JoinSet::new();
        while let Some(channel) = channels.recv().await {
            let label = channel.label().to_string();
            info!("Receiving local data channel '{}'...", label);
            let _ = events.send(SessionEvent::DataChannelReceived {
                label: label.clone(),
            });

            let mut messages = channel.subscribe_messages();
            let surfaces = Arc::clone(&surfaces);
            let events = events.clone();
            readers.spawn(async move {
                let _channel = channel;
                while let Some(text) = messages.recv().await {
                    surfaces.remote_message.show(text.clone());
                    let _ = events.send(SessionEvent::MessageReceived {
                        label: label.clone(),
                        text,
                    });
                }
            });
        }
        while readers.join_next().await.is_some() {}
    })
}

fn spawn_renegotiation(
    mut needed: UnboundedReceiver<Instant>,
    negotiator: Arc<Negotiator>,
    lifecycle: Arc<Lifecycle>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(raised_at) = needed.recv().await {
            if lifecycle.get() != CallState::Active {
                // the initial exchange covers it
                debug!("Negotiation needed before the call is active, skipping");
                continue;
            }
            if negotiator.offered_since(raised_at) {
                debug!("Negotiation needed already covered by a later offer");
                continue;
            }
            info!("Negotiation needed, renegotiating");
            if let Err(e) = negotiator.run().await {
                warn!("Renegotiation failed: {}", e);
            }
        }
    })
}
