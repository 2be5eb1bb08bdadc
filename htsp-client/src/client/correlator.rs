//! Matching of replies to outstanding requests by sequence number.
//!
//! Every request gets its own [`Waiter`] with its own condition variable, so
//! a reply only ever wakes the thread that asked for it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, trace};
use parking_lot::{Condvar, Mutex};

use htsp_protocol::{ClientError, Message, Value};

/// Default upper bound for a round trip.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Outbound side of a session as seen by the correlator.
pub trait Transport: Send + Sync {
    /// Queue a frame for sending.
    fn send(&self, message: &Message) -> Result<(), ClientError>;

    /// Tear the session down after it was found desynchronized.
    fn reset(&self);
}

/// One-shot slot a caller blocks on until its reply (or a failure) arrives.
struct Waiter {
    slot: Mutex<Option<Result<Message, ClientError>>>,
    ready: Condvar,
}

impl Waiter {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// Fill the slot. Only the first result is kept.
    fn signal(&self, result: Result<Message, ClientError>) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(result);
            self.ready.notify_one();
        }
    }

    /// Block until signalled or until `timeout` has elapsed.
    fn wait(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while slot.is_none() {
            if self.ready.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
    }

    fn take(&self) -> Option<Result<Message, ClientError>> {
        self.slot.lock().take()
    }
}

struct PendingTable {
    next_seq: u32,
    waiters: HashMap<u32, Arc<Waiter>>,
}

/// Pending-request table plus sequence number allocation.
pub struct Correlator {
    table: Mutex<PendingTable>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub(crate) fn starting_at(seq: u32) -> Self {
        Self {
            table: Mutex::new(PendingTable {
                next_seq: seq,
                waiters: HashMap::new(),
            }),
        }
    }

    /// Number of requests currently waiting for a reply.
    pub fn pending(&self) -> usize {
        self.table.lock().waiters.len()
    }

    fn register(&self) -> (u32, Arc<Waiter>) {
        let mut table = self.table.lock();
        // Skip numbers still in use after wrap-around.
        let seq = loop {
            let seq = table.next_seq;
            table.next_seq = table.next_seq.wrapping_add(1);
            if !table.waiters.contains_key(&seq) {
                break seq;
            }
        };
        let waiter = Arc::new(Waiter::new());
        table.waiters.insert(seq, Arc::clone(&waiter));
        (seq, waiter)
    }

    fn unregister(&self, seq: u32) {
        self.table.lock().waiters.remove(&seq);
    }

    /// Send `message` stamped with a fresh `seq` and wait for its reply.
    ///
    /// On timeout the transport is reset, since a late reply would leave the
    /// stream out of step with the caller.
    pub fn call<T>(
        &self,
        transport: &T,
        mut message: Message,
        timeout: Duration,
    ) -> Result<Message, ClientError>
    where
        T: Transport + ?Sized,
    {
        let (seq, waiter) = self.register();
        message.set("seq", Value::S64(i64::from(seq)));
        trace!(
            "Request seq={} method={}",
            seq,
            message.method_name().unwrap_or("?")
        );

        if let Err(e) = transport.send(&message) {
            self.unregister(seq);
            debug!("Failed to send seq={}: {}", seq, e);
            return Err(e);
        }

        waiter.wait(timeout);
        self.unregister(seq);

        // Nothing can signal once unregistered, so this check is final.
        match waiter.take() {
            Some(result) => result,
            None => {
                error!(
                    "Timeout waiting for response to '{}' (seq={})",
                    message.method_name().unwrap_or("?"),
                    seq
                );
                transport.reset();
                Err(ClientError::Timeout)
            }
        }
    }

    /// Hand a reply to the waiter registered under `seq`.
    ///
    /// Gives the message back if nobody is waiting for that number.
    pub fn resolve(&self, seq: u32, message: Message) -> Result<(), Message> {
        let table = self.table.lock();
        match table.waiters.get(&seq) {
            Some(waiter) => {
                waiter.signal(Ok(message));
                Ok(())
            }
            None => Err(message),
        }
    }

    /// Wake every waiter with `err`.
    pub fn fail_all(&self, err: ClientError) {
        let waiters: Vec<_> = self.table.lock().waiters.drain().collect();
        if !waiters.is_empty() {
            debug!("Failing {} pending request(s): {}", waiters.len(), err);
        }
        for (_, waiter) in waiters {
            waiter.signal(Err(err.clone()));
        }
    }
}
