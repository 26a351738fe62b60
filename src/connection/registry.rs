//! Invocation registry.
//!
//! Correlates outbound calls with the server's `Completion` and `StreamItem`
//! messages by invocation id. Every entry is settled exactly once: by its
//! completion, by its caller giving up, or by the connection closing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_channel::{mpsc, oneshot};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::error::HubError;
use crate::protocol::CompletionResult;

pub(crate) type ItemSender = mpsc::UnboundedSender<Result<Value, HubError>>;
pub(crate) type ItemReceiver = mpsc::UnboundedReceiver<Result<Value, HubError>>;

/// A call awaiting its answer.
enum PendingInvocation {
    /// Awaiting a single `Completion`.
    Single(oneshot::Sender<Result<Value, HubError>>),
    /// Receiving `StreamItem`s until a `Completion`.
    Stream(ItemSender),
}

pub(crate) struct InvocationRegistry {
    next_id: AtomicU64,
    pending: Mutex<BTreeMap<u64, PendingInvocation>>,
}

impl InvocationRegistry {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    /// Allocates an id for an invocation or an upload stream. Ids are never
    /// reused for the lifetime of the connection object.
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_single(&self, id: u64) -> oneshot::Receiver<Result<Value, HubError>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, PendingInvocation::Single(tx));
        rx
    }

    pub(crate) fn register_stream(&self, id: u64) -> ItemReceiver {
        let (tx, rx) = mpsc::unbounded();
        self.pending.lock().insert(id, PendingInvocation::Stream(tx));
        rx
    }

    /// Forgets an entry without settling it. Returns `false` if it was
    /// already gone.
    pub(crate) fn remove(&self, id: u64) -> bool {
        self.pending.lock().remove(&id).is_some()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Settles the entry for `invocation_id`. Unknown or already settled ids
    /// are logged and ignored.
    pub(crate) fn complete(&self, invocation_id: &str, result: CompletionResult) -> bool {
        let entry = parse_id(invocation_id).and_then(|id| self.pending.lock().remove(&id));
        let Some(entry) = entry else {
            debug!(invocation_id, "Dropped unsolicited Completion message");
            return false;
        };
        trace!(invocation_id, "Received Completion message");

        match (entry, result) {
            (PendingInvocation::Single(tx), CompletionResult::Error(e)) => {
                let _ = tx.send(Err(HubError::RemoteInvocation(e)));
            }
            (PendingInvocation::Single(tx), CompletionResult::Value(v)) => {
                let _ = tx.send(Ok(v));
            }
            (PendingInvocation::Single(tx), CompletionResult::Void) => {
                let _ = tx.send(Ok(Value::Null));
            }
            (PendingInvocation::Stream(tx), CompletionResult::Error(e)) => {
                let _ = tx.unbounded_send(Err(HubError::RemoteInvocation(e)));
            }
            (PendingInvocation::Stream(_), CompletionResult::Value(_)) => {
                warn!(invocation_id, "Ignored result value on a stream Completion");
            }
            // Dropping the sender ends the stream.
            (PendingInvocation::Stream(_), CompletionResult::Void) => {}
        }
        true
    }

    /// Pushes one item into a pending stream.
    pub(crate) fn stream_item(&self, invocation_id: &str, item: Value) -> bool {
        let Some(id) = parse_id(invocation_id) else {
            debug!(invocation_id, "Dropped StreamItem with unknown id");
            return false;
        };
        let pending = self.pending.lock();
        match pending.get(&id) {
            Some(PendingInvocation::Stream(tx)) => {
                trace!(invocation_id, "Received StreamItem message");
                tx.unbounded_send(Ok(item)).is_ok()
            }
            Some(PendingInvocation::Single(_)) => {
                warn!(invocation_id, "StreamItem received for a non-streaming invocation");
                false
            }
            None => {
                debug!(invocation_id, "Dropped StreamItem for unknown or canceled stream");
                false
            }
        }
    }

    /// Settles every pending entry with `ConnectionClosed`, lowest id first.
    /// Returns the ids that were settled.
    pub(crate) fn close_all(&self, cause: Option<Arc<HubError>>) -> Vec<u64> {
        let drained = std::mem::take(&mut *self.pending.lock());
        if !drained.is_empty() {
            debug!(count = drained.len(), "Canceling pending invocations");
        }
        let mut settled = Vec::with_capacity(drained.len());
        for (id, entry) in drained {
            let error = HubError::ConnectionClosed(cause.clone());
            match entry {
                PendingInvocation::Single(tx) => {
                    let _ = tx.send(Err(error));
                }
                PendingInvocation::Stream(tx) => {
                    let _ = tx.unbounded_send(Err(error));
                }
            }
            settled.push(id);
        }
        settled
    }
}

fn parse_id(invocation_id: &str) -> Option<u64> {
    invocation_id.parse().ok()
}
