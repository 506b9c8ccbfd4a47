//! The queue layer: three interchangeable transports behind one contract.
//!
//! Every edge in a running system is backed by a queue implementing
//! [`EdgeQueue`]: a blocking deadline [`push`](EdgeQueue::push), a
//! non-blocking [`try_pop`](EdgeQueue::try_pop), an idempotent
//! [`close`](EdgeQueue::close) and a liveness predicate. Envelopes transfer
//! with value semantics: after a successful push the producer never observes
//! consumer-side mutation, and vice versa.
//!
//! Transports:
//!
//! - [`IntraQueue`] — bounded in-memory buffer inside one process (move
//!   semantics, no serialization).
//! - [`LinkServer`] / [`LinkClient`] — the consumer half binds a TCP
//!   endpoint, the producer half dials in; envelopes cross as length-prefixed
//!   wire frames with a credit byte returned per consumed envelope. The same
//!   pair serves on-host inter-process edges (loopback, no reconnect) and
//!   inter-host edges (reconnect with bounded exponential backoff).

pub mod framing;
mod intra;
mod link;

pub use intra::IntraQueue;
pub use link::{LinkClient, LinkServer, Reconnect};

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;
use tokio::time::Instant;

use crate::envelope::TickEnvelope;

/// Polling granularity for [`EdgeQueue::pop_deadline`].
const POP_POLL: std::time::Duration = std::time::Duration::from_micros(500);

/// Failure surface of the queue contract.
#[derive(Debug, Clone, Error, Diagnostic, PartialEq, Eq)]
pub enum QueueError {
    /// The push could not complete before its deadline.
    #[error("queue push deadline elapsed")]
    #[diagnostic(code(stableflow::queue::timeout))]
    Timeout,

    /// The queue is closed. Consumers see this only after draining.
    #[error("queue closed")]
    #[diagnostic(code(stableflow::queue::closed))]
    Closed,

    /// The underlying transport failed.
    #[error("transport failure: {message}")]
    #[diagnostic(code(stableflow::queue::transport))]
    Transport { message: String },
}

impl QueueError {
    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        QueueError::Transport {
            message: err.to_string(),
        }
    }
}

/// Uniform queue contract shared by all transports.
#[async_trait]
pub trait EdgeQueue: Send + Sync {
    /// Blocking push with a deadline. `Timeout` past the deadline, `Closed`
    /// on a closed queue.
    async fn push(&self, envelope: TickEnvelope, deadline: Instant) -> Result<(), QueueError>;

    /// Non-blocking pop. `Ok(None)` when empty, `Err(Closed)` only once the
    /// queue is closed and drained.
    fn try_pop(&self) -> Result<Option<TickEnvelope>, QueueError>;

    /// Close the queue. Idempotent; unblocks blocked pushes with `Closed`.
    fn close(&self);

    /// Liveness predicate.
    fn is_open(&self) -> bool;

    /// Bounded-deadline pop built on [`try_pop`](Self::try_pop): polls until
    /// an envelope arrives, the deadline elapses (`Ok(None)`), or the queue
    /// reports closure.
    async fn pop_deadline(&self, deadline: Instant) -> Result<Option<TickEnvelope>, QueueError> {
        loop {
            if let Some(envelope) = self.try_pop()? {
                return Ok(Some(envelope));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POP_POLL).await;
        }
    }
}

/// A deadline far enough out to express an unbounded blocking call.
#[must_use]
pub fn far_deadline() -> Instant {
    Instant::now() + std::time::Duration::from_secs(365 * 24 * 3600)
}
