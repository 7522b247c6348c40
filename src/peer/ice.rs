use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::error::CallError;
use crate::events::SessionEvent;
use crate::logger::dump_candidate;
use crate::peer::endpoint::Endpoint;
use crate::peer::types::{CandidateKind, EndpointRole, IceCandidate};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub prflx: usize,
    pub relay: usize,
    pub unknown: usize,
}

impl CandidateSummary {
    fn count(&mut self, kind: CandidateKind) {
        match kind {
            CandidateKind::Host => self.host += 1,
            CandidateKind::Srflx => self.srflx += 1,
            CandidateKind::Prflx => self.prflx += 1,
            CandidateKind::Relay => self.relay += 1,
            CandidateKind::Unknown => self.unknown += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub delivered: usize,
    pub failed: usize,
    pub pending: usize,
    pub dropped: usize,
    pub kinds: CandidateSummary,
}

#[derive(Default)]
struct RelayState {
    ready: bool,
    closed: bool,
    pending: Vec<IceCandidate>,
    stats: RelayStats,
}

/// Forwards the ICE candidates of one endpoint to the other.
///
/// Candidates reaching the target before it has a remote description are
/// held back and flushed by [`IceRelay::mark_ready`]. All deliveries happen
/// under one lock, so each candidate is ingested at most once.
pub struct IceRelay {
    from: EndpointRole,
    target: Arc<dyn Endpoint>,
    state: Mutex<RelayState>,
    events: broadcast::Sender<SessionEvent>,
}

impl IceRelay {
    pub fn new(
        from: EndpointRole,
        target: Arc<dyn Endpoint>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            from,
            target,
            state: Mutex::new(RelayState::default()),
            events,
        })
    }

    /// Relays every candidate from `candidates` until the stream ends.
    pub fn spawn(self: &Arc<Self>, mut candidates: UnboundedReceiver<IceCandidate>) -> JoinHandle<()> {
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(candidate) = candidates.recv().await {
                relay.forward(candidate).await;
            }
            debug!("ICE relay {} -> {} finished", relay.from, relay.target.role());
        })
    }

    pub async fn forward(&self, candidate: IceCandidate) {
        let mut state = self.state.lock().await;
        if state.closed {
            state.stats.dropped += 1;
            return;
        }
        state.stats.kinds.count(candidate.kind());
        if state.ready {
            self.deliver(&mut state, candidate).await;
        } else {
            debug!(
                "{} has no remote description yet, queuing candidate",
                self.target.name()
            );
            state.pending.push(candidate);
            state.stats.pending = state.pending.len();
        }
    }

    /// Called once the target has a remote description; flushes queued candidates.
    pub async fn mark_ready(&self) {
        let mut state = self.state.lock().await;
        if state.closed || state.ready {
            return;
        }
        state.ready = true;
        let pending: Vec<IceCandidate> = state.pending.drain(..).collect();
        state.stats.pending = 0;
        if !pending.is_empty() {
            debug!(
                "Applying {} pending candidate(s) to {}",
                pending.len(),
                self.target.name()
            );
        }
        for candidate in pending {
            self.deliver(&mut state, candidate).await;
        }
    }

    /// Stops relaying; anything still queued is discarded.
    pub async fn close(&self) -> RelayStats {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.stats.dropped += state.pending.len();
        state.pending.clear();
        state.stats.pending = 0;
        state.stats.clone()
    }

    pub async fn stats(&self) -> RelayStats {
        self.state.lock().await.stats.clone()
    }

    async fn deliver(&self, state: &mut RelayState, candidate: IceCandidate) {
        dump_candidate(self.target.name(), &candidate);
        match self.target.add_ice_candidate(candidate.clone()).await {
            Ok(()) => {
                state.stats.delivered += 1;
                let _ = self.events.send(SessionEvent::IceCandidateRelayed {
                    from: self.from,
                    candidate: candidate.candidate,
                });
            }
            Err(source) => {
                state.stats.failed += 1;
                let err = CallError::IceIngestion {
                    endpoint: self.target.name().to_string(),
                    source,
                };
                warn!("Error adding ICE candidate {}: {}", candidate.candidate, err);
                let _ = self.events.send(SessionEvent::IceIngestionFailed {
                    to: self.target.role(),
                    candidate: candidate.candidate,
                    reason: err.to_string(),
                });
            }
        }
    }
}

/// Logs a breakdown of candidate types seen by a relay.
pub fn log_analysis(from: EndpointRole, stats: &RelayStats) {
    let kinds = &stats.kinds;
    info!(
        "Candidate analysis ({from}): {} host, {} srflx, {} prflx, {} relay; delivered={} failed={} dropped={}",
        kinds.host, kinds.srflx, kinds.prflx, kinds.relay, stats.delivered, stats.failed, stats.dropped
    );
}

pub fn summary_by_role(stats: &HashMap<EndpointRole, RelayStats>) -> CandidateSummary {
    let mut total = CandidateSummary::default();
    for s in stats.values() {
        total.host += s.kinds.host;
        total.srflx += s.kinds.srflx;
        total.prflx += s.kinds.prflx;
        total.relay += s.kinds.relay;
        total.unknown += s.kinds.unknown;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(line: &str) -> IceCandidate {
        IceCandidate {
            candidate: line.to_string(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn summary_counts_by_type() {
        let mut summary = CandidateSummary::default();
        for line in [
            "candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host",
            "candidate:2 1 udp 2130706431 10.0.0.3 5001 typ host",
            "candidate:3 1 udp 1694498815 203.0.113.7 40000 typ srflx",
            "garbage",
        ] {
            summary.count(candidate(line).kind());
        }
        assert_eq!(summary.host, 2);
        assert_eq!(summary.srflx, 1);
        assert_eq!(summary.relay, 0);
        assert_eq!(summary.unknown, 1);
    }

    #[test]
    fn summary_adds_both_directions() {
        let mut stats = HashMap::new();
        let mut local = RelayStats::default();
        local.kinds.host = 2;
        let mut remote = RelayStats::default();
        remote.kinds.host = 1;
        remote.kinds.relay = 1;
        stats.insert(EndpointRole::Local, local);
        stats.insert(EndpointRole::Remote, remote);

        let total = summary_by_role(&stats);
        assert_eq!(total.host, 3);
        assert_eq!(total.relay, 1);
    }
}
