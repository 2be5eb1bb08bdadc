//! Routing of inbound frames to waiting callers or to the state store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use htsp_protocol::{ClientError, Inbound, Message, PushMethod};

use crate::client::connection::FrameHandler;
use crate::client::correlator::Correlator;
use crate::store::StateStore;

/// Latch released by `initialSyncCompleted` or by the end of the session.
pub struct SyncLatch {
    state: Mutex<LatchState>,
    changed: Condvar,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct LatchState {
    released: bool,
    synced: bool,
}

impl Default for SyncLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncLatch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LatchState::default()),
            changed: Condvar::new(),
        }
    }

    /// Initial sync finished.
    pub fn complete(&self) {
        let mut state = self.state.lock();
        state.synced = true;
        state.released = true;
        self.changed.notify_all();
    }

    /// Let waiters go without marking the cache as synced.
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.released = true;
        self.changed.notify_all();
    }

    pub fn reset(&self) {
        *self.state.lock() = LatchState::default();
    }

    pub fn is_synced(&self) -> bool {
        self.state.lock().synced
    }

    /// Wait until released or `timeout` elapses. Returns whether the initial
    /// sync completed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.released {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.synced
    }
}

/// The reader loop's frame handler.
///
/// Replies go to the correlator; push notifications are applied to the
/// store in receive order. This is the only writer of mirrored state.
pub struct Dispatcher {
    correlator: Arc<Correlator>,
    store: Arc<StateStore>,
    latch: Arc<SyncLatch>,
}

impl Dispatcher {
    pub fn new(correlator: Arc<Correlator>, store: Arc<StateStore>, latch: Arc<SyncLatch>) -> Self {
        Self {
            correlator,
            store,
            latch,
        }
    }

    fn dispatch_push(&self, method: &str, message: &Message) {
        match PushMethod::parse(method) {
            Some(PushMethod::Entity(kind, mutation)) => {
                if let Err(e) = self.store.apply(kind, mutation, message) {
                    warn!("Ignoring malformed '{}': {}", method, e);
                }
            }
            Some(PushMethod::InitialSyncCompleted) => {
                info!("Initial sync completed");
                self.latch.complete();
            }
            None => debug!("Unmapped action received '{}'", method),
        }
    }
}

impl FrameHandler for Dispatcher {
    fn on_frame(&self, inbound: Inbound) {
        match inbound {
            Inbound::Reply { seq, message } => {
                if let Err(message) = self.correlator.resolve(seq, message) {
                    // Stale reply, or a push that happens to carry a seq.
                    match message.method_name() {
                        Some(method) => self.dispatch_push(method, &message),
                        None => debug!("Dropping reply for unknown seq={}", seq),
                    }
                }
            }
            Inbound::Notification { method, message } => self.dispatch_push(&method, &message),
            Inbound::Unlabelled(message) => {
                debug!("Dropping frame with {} field(s) and no method", message.len())
            }
        }
    }

    fn on_closed(&self) {
        self.correlator.fail_all(ClientError::ConnectionClosed);
        self.latch.release();
    }
}
