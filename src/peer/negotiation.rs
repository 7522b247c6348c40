//! Offer/answer exchange between the local and remote endpoint.
//!
//! 1. local creates an offer
//! 2. local commits it as its local description
//! 3. remote accepts it as its remote description
//! 4. remote creates an answer
//! 5. remote commits it as its local description
//! 6. local accepts it as its remote description
//!
//! A failed step is reported and the endpoints are left as they are; nothing
//! is rolled back or retried. A cancelled negotiator abandons the step in
//! flight and fails every later round with [`CallError::Interrupted`].

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, error, info};
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex, MutexGuard};
use tokio::time::Instant;

use crate::error::{CallError, EndpointError};
use crate::events::SessionEvent;
use crate::peer::endpoint::Endpoint;
use crate::peer::ice::IceRelay;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationStep {
    CreateOffer,
    SetLocalOffer,
    SetRemoteOffer,
    CreateAnswer,
    SetLocalAnswer,
    SetRemoteAnswer,
}

impl NegotiationStep {
    pub const ALL: [NegotiationStep; 6] = [
        NegotiationStep::CreateOffer,
        NegotiationStep::SetLocalOffer,
        NegotiationStep::SetRemoteOffer,
        NegotiationStep::CreateAnswer,
        NegotiationStep::SetLocalAnswer,
        NegotiationStep::SetRemoteAnswer,
    ];
}

impl fmt::Display for NegotiationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NegotiationStep::CreateOffer => "local creates offer",
            NegotiationStep::SetLocalOffer => "local sets offer as local description",
            NegotiationStep::SetRemoteOffer => "remote sets offer as remote description",
            NegotiationStep::CreateAnswer => "remote creates answer",
            NegotiationStep::SetLocalAnswer => "remote sets answer as local description",
            NegotiationStep::SetRemoteAnswer => "local sets answer as remote description",
        };
        f.write_str(s)
    }
}

/// Runs offer/answer rounds between two endpoints, one at a time.
pub struct Negotiator {
    local: Arc<dyn Endpoint>,
    remote: Arc<dyn Endpoint>,
    to_local: Arc<IceRelay>,
    to_remote: Arc<IceRelay>,
    step_timeout: Option<Duration>,
    lock: Mutex<()>,
    rounds: AtomicU32,
    // when the latest offer was started; it covers everything attached before
    last_offer: StdMutex<Option<Instant>>,
    cancelled: watch::Sender<bool>,
    events: broadcast::Sender<SessionEvent>,
}

impl Negotiator {
    pub fn new(
        local: Arc<dyn Endpoint>,
        remote: Arc<dyn Endpoint>,
        to_local: Arc<IceRelay>,
        to_remote: Arc<IceRelay>,
        step_timeout: Option<Duration>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            remote,
            to_local,
            to_remote,
            step_timeout,
            lock: Mutex::new(()),
            rounds: AtomicU32::new(0),
            last_offer: StdMutex::new(None),
            cancelled: watch::channel(false).0,
            events,
        })
    }

    /// Completed rounds so far.
    pub fn rounds(&self) -> u32 {
        self.rounds.load(Ordering::Acquire)
    }

    /// True if an offer was started at or after `at`.
    pub fn offered_since(&self, at: Instant) -> bool {
        let last = *self.last_offer.lock().unwrap_or_else(|e| e.into_inner());
        last.is_some_and(|offered| offered >= at)
    }

    /// Abandons the step in flight. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Holds off negotiation while something is attached to the local endpoint.
    ///
    /// Fails with [`CallError::LateAttachment`] if an offer is outstanding.
    pub fn try_begin_attach(&self, what: &str) -> Result<MutexGuard<'_, ()>, CallError> {
        self.lock.try_lock().map_err(|_| CallError::LateAttachment {
            what: what.to_string(),
        })
    }

    pub async fn run(&self) -> Result<(), CallError> {
        let _guard = self.lock.lock().await;
        if self.is_cancelled() {
            return Err(CallError::Interrupted);
        }
        match self.exchange().await {
            Ok(()) => {
                let round = self.rounds.fetch_add(1, Ordering::AcqRel) + 1;
                info!("Negotiation round {} completed", round);
                let _ = self.events.send(SessionEvent::Negotiated { round });
                Ok(())
            }
            // endpoints closed under us: not a negotiation failure
            Err(_) if self.is_cancelled() => {
                debug!("Negotiation abandoned, call is ending");
                Err(CallError::Interrupted)
            }
            Err(err) => {
                error!("Something went wrong exchanging metadata: {}", err);
                if let Some(step) = failed_step(&err) {
                    let _ = self.events.send(SessionEvent::NegotiationFailed {
                        step,
                        reason: err.to_string(),
                    });
                }
                Err(err)
            }
        }
    }

    async fn exchange(&self) -> Result<(), CallError> {
        *self.last_offer.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        let offer = self
            .step(NegotiationStep::CreateOffer, self.local.create_offer())
            .await?;
        debug!("Offer created {}", offer.sdp);

        self.step(
            NegotiationStep::SetLocalOffer,
            self.local.set_local_description(offer.clone()),
        )
        .await?;
        self.step(
            NegotiationStep::SetRemoteOffer,
            self.remote.set_remote_description(offer),
        )
        .await?;
        self.to_remote.mark_ready().await;

        let answer = self
            .step(NegotiationStep::CreateAnswer, self.remote.create_answer())
            .await?;
        debug!("Answer created {}", answer.sdp);

        self.step(
            NegotiationStep::SetLocalAnswer,
            self.remote.set_local_description(answer.clone()),
        )
        .await?;
        self.step(
            NegotiationStep::SetRemoteAnswer,
            self.local.set_remote_description(answer),
        )
        .await?;
        self.to_local.mark_ready().await;

        Ok(())
    }

    async fn step<T, F>(&self, step: NegotiationStep, fut: F) -> Result<T, CallError>
    where
        F: Future<Output = Result<T, EndpointError>>,
    {
        debug!("Negotiation step: {}", step);
        let bounded = async {
            let outcome = match self.step_timeout {
                Some(after) => tokio::time::timeout(after, fut)
                    .await
                    .map_err(|_| CallError::NegotiationTimeout { step, after })?,
                None => fut.await,
            };
            outcome.map_err(|source| CallError::Negotiation { step, source })
        };

        let mut cancelled = self.cancelled.subscribe();
        tokio::select! {
            outcome = bounded => outcome,
            _ = cancelled.wait_for(|c| *c) => Err(CallError::Interrupted),
        }
    }
}

fn failed_step(err: &CallError) -> Option<NegotiationStep> {
    match err {
        CallError::Negotiation { step, .. } | CallError::NegotiationTimeout { step, .. } => {
            Some(*step)
        }
        _ => None,
    }
}
