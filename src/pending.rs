//! Client-side table of in-flight calls.
//!
//! Responses on a connection can arrive in any order. The table routes each
//! one back to the caller waiting on the matching call id, and resolves every
//! waiter with [`Resolution::ConnectionLost`] when the connection goes away.

use crate::{codec::Outcome, error::CodecError};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};
use tokio::{sync::oneshot, time::Instant};

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique call id, so connections never share in-flight ids.
pub(crate) fn next_call_id() -> u64 {
    NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug)]
pub(crate) enum Resolution {
    Response(Outcome),
    /// A response arrived for this call but could not be decoded.
    Malformed(CodecError),
    ConnectionLost,
}

/// The waiting side of an in-flight call: a write-once slot and its deadline.
pub(crate) struct PendingCall {
    pub(crate) call_id: u64,
    pub(crate) deadline: Instant,
    pub(crate) slot: oneshot::Receiver<Resolution>,
}

#[derive(Default)]
struct Table {
    calls: HashMap<u64, oneshot::Sender<Resolution>>,
    connection_lost: bool,
}

#[derive(Default)]
pub(crate) struct PendingCalls {
    table: Mutex<Table>,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a call. Returns `None` if the connection has already been lost.
    pub(crate) fn register(&self, call_id: u64, deadline: Instant) -> Option<PendingCall> {
        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.table.lock();
            if table.connection_lost {
                return None;
            }
            table.calls.insert(call_id, tx);
        }
        Some(PendingCall {
            call_id,
            deadline,
            slot: rx,
        })
    }

    /// Delivers a resolution to the waiter for `call_id`.
    ///
    /// Returns `false`, and drops the resolution, if nobody is waiting: the
    /// call already timed out, was already resolved, or never existed.
    pub(crate) fn resolve(&self, call_id: u64, resolution: Resolution) -> bool {
        let Some(slot) = self.table.lock().calls.remove(&call_id) else {
            tracing::warn!(call_id, "discarding response with no pending call");
            return false;
        };
        if slot.send(resolution).is_err() {
            tracing::debug!(call_id, "caller stopped waiting before its response arrived");
        }
        true
    }

    /// Forgets a call, e.g. after its deadline elapsed.
    pub(crate) fn remove(&self, call_id: u64) -> bool {
        self.table.lock().calls.remove(&call_id).is_some()
    }

    /// Resolves every waiter with `ConnectionLost` and refuses later registrations.
    pub(crate) fn fail_all(&self) {
        let drained: Vec<_> = {
            let mut table = self.table.lock();
            table.connection_lost = true;
            table.calls.drain().collect()
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "failing pending calls after connection loss");
        }
        for (_, slot) in drained {
            _ = slot.send(Resolution::ConnectionLost);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.table.lock().calls.len()
    }
}

/// Removes its call from the table when dropped, so a timed-out or abandoned
/// invocation never leaves a stale entry behind.
pub(crate) struct PendingGuard<'a> {
    pub(crate) calls: &'a PendingCalls,
    pub(crate) call_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.calls.remove(self.call_id);
    }
}
