//! Outbound Mailbox: messages produced while no session is open.
//!
//! The mailbox holds envelopes in arrival order and replays them after a
//! session opens. Flush snapshots the queue under the lock, transmits
//! outside it so producers are never blocked behind network writes, and
//! re-appends failures so nothing is silently dropped.

use std::mem;
use std::sync::Mutex;

use signage_core::Envelope;
use tracing::{debug, warn};

use crate::gateway::SendError;

/// Anything that can transmit an envelope. The Connection Gateway is the
/// production implementation; tests substitute recording fakes.
pub trait MessageSink: Sync {
    fn send_envelope(
        &self,
        envelope: &Envelope,
    ) -> impl std::future::Future<Output = Result<(), SendError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    pub sent: usize,
    pub requeued: usize,
}

#[derive(Debug, Default)]
pub struct OutboundMailbox {
    pending: Mutex<Vec<Envelope>>,
}

impl OutboundMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, envelope: Envelope) {
        let mut pending = self.lock();
        pending.push(envelope);
        debug!(queued = pending.len(), "message queued for later delivery");
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drain queued messages through `sink` in FIFO order.
    ///
    /// The queue is snapshotted and released before any transmission, so
    /// producers keep enqueueing during a slow flush. Messages that fail to
    /// send are put back after anything enqueued meanwhile; arrival order is
    /// preserved within each flush.
    pub async fn flush<S: MessageSink>(&self, sink: &S) -> FlushOutcome {
        let batch = { mem::take(&mut *self.lock()) };
        if batch.is_empty() {
            return FlushOutcome { sent: 0, requeued: 0 };
        }

        let total = batch.len();
        let mut failed = Vec::new();
        for envelope in batch {
            if let Err(err) = sink.send_envelope(&envelope).await {
                warn!(message_type = envelope.type_name(), error = %err, "flush send failed, requeueing");
                failed.push(envelope);
            }
        }

        let requeued = failed.len();
        if requeued > 0 {
            self.lock().extend(failed);
        }
        debug!(sent = total - requeued, requeued, "mailbox flushed");
        FlushOutcome {
            sent: total - requeued,
            requeued,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Envelope>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
