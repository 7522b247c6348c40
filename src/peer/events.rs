use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use log::warn;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Fan-out of one kind of endpoint event to any number of subscribers.
///
/// Events published before the first subscription are kept and handed to the
/// first subscriber, so a handler registered right after an endpoint is created
/// never misses what the endpoint did in between. The backlog keeps at most
/// [`BACKLOG_LIMIT`] events, dropping the oldest, so a hub nobody subscribes to
/// stays bounded.
pub struct EventHub<T> {
    inner: Mutex<HubState<T>>,
}

struct HubState<T> {
    subscribers: Vec<UnboundedSender<T>>,
    backlog: VecDeque<T>,
    overflowed: bool,
    subscribed: bool,
}

pub const BACKLOG_LIMIT: usize = 256;

impl<T: Clone + Send> Default for EventHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send> EventHub<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HubState {
                subscribers: Vec::new(),
                backlog: VecDeque::new(),
                overflowed: false,
                subscribed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> UnboundedReceiver<T> {
        let (tx, rx) = unbounded_channel();
        let mut state = self.lock();
        for event in state.backlog.drain(..) {
            let _ = tx.send(event);
        }
        state.subscribed = true;
        state.subscribers.push(tx);
        rx
    }

    pub fn publish(&self, event: T) {
        let mut state = self.lock();
        if !state.subscribed {
            if state.backlog.len() == BACKLOG_LIMIT {
                state.backlog.pop_front();
                if !state.overflowed {
                    state.overflowed = true;
                    warn!("Event backlog full with no subscriber, dropping oldest events");
                }
            }
            state.backlog.push_back(event);
            return;
        }
        state.subscribers.retain(|tx| !tx.is_closed());
        for tx in &state.subscribers {
            let _ = tx.send(event.clone());
        }
    }

    /// Drops every subscriber so their receivers see the end of the stream.
    pub fn close(&self) {
        let mut state = self.lock();
        state.subscribers.clear();
        state.backlog.clear();
        state.subscribed = true;
    }
}
