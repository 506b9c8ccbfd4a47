//! Bounded in-memory queue for edges inside one process.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;

use super::{EdgeQueue, QueueError};
use crate::envelope::TickEnvelope;

/// Intra-process queue: a `flume` bounded buffer with cooperative
/// producer/consumer semantics. Envelopes move; nothing is serialized.
///
/// Closing drops the stored sender, so a consumer drains buffered envelopes
/// before observing `Closed`, and raises a watch flag that unblocks any
/// push currently waiting for capacity.
pub struct IntraQueue {
    tx: Mutex<Option<flume::Sender<TickEnvelope>>>,
    rx: flume::Receiver<TickEnvelope>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl IntraQueue {
    /// Default buffer length when the edge does not override it.
    pub const DEFAULT_CAPACITY: usize = 1;

    /// A queue with the given buffer length (minimum 1).
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity.max(1));
        let (closed_tx, closed_rx) = watch::channel(false);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
            closed_tx,
            closed_rx,
        }
    }

    /// A queue primed with one disabled envelope.
    ///
    /// Feedback edges are lag-by-one-tick: the consumer's first gather finds
    /// the primed envelope instead of blocking on output that has not been
    /// produced yet.
    #[must_use]
    pub fn primed(capacity: usize) -> Self {
        let queue = Self::bounded(capacity);
        let guard = queue.tx.lock().expect("queue sender poisoned");
        if let Some(tx) = guard.as_ref() {
            let _ = tx.try_send(TickEnvelope::new());
        }
        drop(guard);
        queue
    }

    fn sender(&self) -> Option<flume::Sender<TickEnvelope>> {
        self.tx.lock().expect("queue sender poisoned").clone()
    }
}

#[async_trait]
impl EdgeQueue for IntraQueue {
    async fn push(&self, envelope: TickEnvelope, deadline: Instant) -> Result<(), QueueError> {
        let Some(tx) = self.sender() else {
            return Err(QueueError::Closed);
        };
        let mut closed = self.closed_rx.clone();
        if *closed.borrow() {
            return Err(QueueError::Closed);
        }
        tokio::select! {
            res = tx.send_async(envelope) => res.map_err(|_| QueueError::Closed),
            _ = closed.changed() => Err(QueueError::Closed),
            _ = tokio::time::sleep_until(deadline) => Err(QueueError::Timeout),
        }
    }

    fn try_pop(&self) -> Result<Option<TickEnvelope>, QueueError> {
        match self.rx.try_recv() {
            Ok(envelope) => Ok(Some(envelope)),
            Err(flume::TryRecvError::Empty) => Ok(None),
            Err(flume::TryRecvError::Disconnected) => Err(QueueError::Closed),
        }
    }

    fn close(&self) {
        self.tx.lock().expect("queue sender poisoned").take();
        let _ = self.closed_tx.send(true);
    }

    fn is_open(&self) -> bool {
        !*self.closed_rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn deadline(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[tokio::test]
    async fn push_pop_preserves_fifo() {
        let q = IntraQueue::bounded(4);
        for i in 0..3u64 {
            let mut env = TickEnvelope::new();
            env.emit(serde_json::json!(i));
            q.push(env, deadline(100)).await.unwrap();
        }
        for i in 0..3u64 {
            let env = q.try_pop().unwrap().unwrap();
            assert_eq!(env.list[0], serde_json::json!(i));
        }
        assert_eq!(q.try_pop().unwrap(), None);
    }

    #[tokio::test]
    async fn full_queue_push_times_out() {
        let q = IntraQueue::bounded(1);
        q.push(TickEnvelope::new(), deadline(50)).await.unwrap();
        let err = q.push(TickEnvelope::new(), deadline(20)).await.unwrap_err();
        assert_eq!(err, QueueError::Timeout);
    }

    #[tokio::test]
    async fn consumer_drains_before_closed() {
        let q = IntraQueue::bounded(2);
        q.push(TickEnvelope::new(), deadline(50)).await.unwrap();
        q.close();
        assert!(!q.is_open());
        assert!(q.try_pop().unwrap().is_some());
        assert_eq!(q.try_pop().unwrap_err(), QueueError::Closed);
    }

    #[tokio::test]
    async fn close_unblocks_waiting_push() {
        let q = std::sync::Arc::new(IntraQueue::bounded(1));
        q.push(TickEnvelope::new(), deadline(50)).await.unwrap();
        let q2 = q.clone();
        let blocked = tokio::spawn(async move {
            q2.push(TickEnvelope::new(), super::super::far_deadline())
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close();
        assert_eq!(blocked.await.unwrap().unwrap_err(), QueueError::Closed);
    }

    #[tokio::test]
    async fn primed_queue_yields_disabled_envelope_first() {
        let q = IntraQueue::primed(1);
        let env = q.try_pop().unwrap().unwrap();
        assert!(env.is_reset());
    }
}
