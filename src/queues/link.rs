//! TCP-backed queue halves for edges that leave the producing process.
//!
//! One logical edge is one [`LinkServer`] (consumer side, binds) plus one
//! [`LinkClient`] (producer side, dials). Envelopes cross as length-prefixed
//! wire frames; the server returns one credit byte per envelope the consumer
//! actually pops, which is what bounds the queue: a client with `capacity`
//! unacknowledged envelopes blocks in `push` until credit returns.
//!
//! On-host inter-process edges use [`Reconnect::Never`]: transport loss is
//! process death and surfaces as `Closed`. Inter-host edges use
//! [`Reconnect::Backoff`]: the client redials with bounded exponential
//! backoff and jitter, resending unacknowledged envelopes in order.
//! Envelopes acknowledged before a teardown are never resent.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::framing::{read_frame, write_close, write_frame, ACK};
use super::{EdgeQueue, QueueError};
use crate::envelope::TickEnvelope;

/// Reconnection policy for the client half.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Reconnect {
    /// Transport loss after the first session surfaces as `Closed`.
    Never,
    /// Redial with exponential backoff until the budget is exhausted.
    Backoff {
        initial: Duration,
        cap: Duration,
        budget: Duration,
    },
}

impl Reconnect {
    /// The inter-host default: 100 ms initial, 5 s cap, ±25% jitter,
    /// 30 s total budget.
    #[must_use]
    pub fn backoff_default() -> Self {
        Reconnect::Backoff {
            initial: Duration::from_millis(100),
            cap: Duration::from_secs(5),
            budget: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// Server half
// ---------------------------------------------------------------------------

/// Consumer half of a link edge. Binds the edge endpoint and buffers
/// decoded envelopes up to the edge capacity; reading stalls while the
/// buffer is full, which propagates backpressure to the client.
pub struct LinkServer {
    buffer: flume::Receiver<TickEnvelope>,
    acks: flume::Sender<()>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    local_addr: std::net::SocketAddr,
}

impl LinkServer {
    /// Bind the consumer endpoint and start accepting. At most one
    /// connection is serviced at a time; a lost connection (EOF without the
    /// close marker) returns to accepting so the client can redial.
    pub async fn bind(addr: &str, capacity: usize) -> Result<Self, QueueError> {
        Self::bind_inner(addr, capacity, false).await
    }

    /// Like [`bind`](Self::bind), but primed with one disabled envelope for
    /// lag-by-one-tick feedback edges.
    pub async fn bind_primed(addr: &str, capacity: usize) -> Result<Self, QueueError> {
        Self::bind_inner(addr, capacity, true).await
    }

    async fn bind_inner(addr: &str, capacity: usize, primed: bool) -> Result<Self, QueueError> {
        let listener = TcpListener::bind(addr).await.map_err(QueueError::transport)?;
        let local_addr = listener.local_addr().map_err(QueueError::transport)?;
        let (buf_tx, buf_rx) = flume::bounded(capacity.max(1));
        let (ack_tx, ack_rx) = flume::unbounded::<()>();
        if primed {
            let _ = buf_tx.try_send(TickEnvelope::new());
        }
        let (closed_tx, closed_rx) = watch::channel(false);
        let mut shutdown = closed_rx.clone();

        tokio::spawn(async move {
            'accepting: loop {
                let stream = tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "link server accepted connection");
                            stream
                        }
                        Err(err) => {
                            warn!(error = %err, "link server accept failed");
                            break 'accepting;
                        }
                    },
                    _ = shutdown.changed() => break 'accepting,
                };
                let _ = stream.set_nodelay(true);
                let (mut reader, mut writer) = stream.into_split();

                // Credits are written from a side task so a full buffer
                // never wedges ack delivery.
                let conn_acks = ack_rx.clone();
                let ack_writer = tokio::spawn(async move {
                    while conn_acks.recv_async().await.is_ok() {
                        if tokio::io::AsyncWriteExt::write_u8(&mut writer, ACK)
                            .await
                            .is_err()
                        {
                            break;
                        }
                        let _ = tokio::io::AsyncWriteExt::flush(&mut writer).await;
                    }
                });

                loop {
                    tokio::select! {
                        frame = read_frame(&mut reader) => match frame {
                            Ok(Some(bytes)) => match TickEnvelope::from_wire(&bytes) {
                                Ok(envelope) => {
                                    if buf_tx.send_async(envelope).await.is_err() {
                                        ack_writer.abort();
                                        break 'accepting;
                                    }
                                }
                                Err(err) => {
                                    warn!(error = %err, "dropping undecodable envelope frame");
                                }
                            },
                            // Close marker: orderly producer shutdown.
                            Ok(None) => {
                                ack_writer.abort();
                                break 'accepting;
                            }
                            // Transport loss: keep the buffer, accept again.
                            Err(err) => {
                                trace!(error = %err, "link connection lost, awaiting redial");
                                ack_writer.abort();
                                continue 'accepting;
                            }
                        },
                        _ = shutdown.changed() => {
                            ack_writer.abort();
                            break 'accepting;
                        }
                    }
                }
            }
            // Dropping buf_tx lets the consumer drain, then observe Closed.
        });

        Ok(Self {
            buffer: buf_rx,
            acks: ack_tx,
            closed_tx,
            closed_rx,
            local_addr,
        })
    }

    /// The bound endpoint (useful when binding port 0).
    #[must_use]
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl EdgeQueue for LinkServer {
    async fn push(&self, _envelope: TickEnvelope, _deadline: Instant) -> Result<(), QueueError> {
        Err(QueueError::Transport {
            message: "push on the consumer half of a link edge".into(),
        })
    }

    fn try_pop(&self) -> Result<Option<TickEnvelope>, QueueError> {
        match self.buffer.try_recv() {
            Ok(envelope) => {
                let _ = self.acks.send(());
                Ok(Some(envelope))
            }
            Err(flume::TryRecvError::Empty) => Ok(None),
            Err(flume::TryRecvError::Disconnected) => Err(QueueError::Closed),
        }
    }

    fn close(&self) {
        let _ = self.closed_tx.send(true);
    }

    fn is_open(&self) -> bool {
        !*self.closed_rx.borrow() && !self.buffer.is_disconnected()
    }
}

// ---------------------------------------------------------------------------
// Client half
// ---------------------------------------------------------------------------

struct ClientConn {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

struct ClientState {
    conn: Option<ClientConn>,
    unacked: VecDeque<TickEnvelope>,
    ever_connected: bool,
}

/// Producer half of a link edge. Dials the consumer endpoint and tracks
/// unacknowledged envelopes against the edge capacity.
pub struct LinkClient {
    endpoint: String,
    capacity: usize,
    policy: Reconnect,
    state: Mutex<ClientState>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

enum AckOutcome {
    Received,
    Deadline,
    Lost,
}

impl LinkClient {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, capacity: usize, policy: Reconnect) -> Self {
        let (closed_tx, closed_rx) = watch::channel(false);
        Self {
            endpoint: endpoint.into(),
            capacity: capacity.max(1),
            policy,
            state: Mutex::new(ClientState {
                conn: None,
                unacked: VecDeque::new(),
                ever_connected: false,
            }),
            closed_tx,
            closed_rx,
        }
    }

    /// Wait until every pushed envelope has been acknowledged, then send the
    /// close marker. Called by the supervisor's drain sequence.
    pub async fn drain(&self, deadline: Instant) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        while !state.unacked.is_empty() {
            if state.conn.is_none() {
                self.connect(&mut state, deadline).await?;
            }
            match Self::await_ack(&mut state, deadline).await {
                AckOutcome::Received => {}
                AckOutcome::Deadline => return Err(QueueError::Timeout),
                AckOutcome::Lost => {
                    state.conn = None;
                    if !self.reconnectable() {
                        return Err(QueueError::Closed);
                    }
                }
            }
        }
        if let Some(conn) = state.conn.as_mut() {
            let _ = write_close(&mut conn.writer).await;
        }
        state.conn = None;
        let _ = self.closed_tx.send(true);
        Ok(())
    }

    fn reconnectable(&self) -> bool {
        matches!(self.policy, Reconnect::Backoff { .. })
    }

    async fn connect(&self, state: &mut ClientState, deadline: Instant) -> Result<(), QueueError> {
        match self.policy {
            Reconnect::Never => {
                if state.ever_connected {
                    // Process death on the other side; no redial on-host.
                    return Err(QueueError::Closed);
                }
                // The consumer process may come up after us; retry briefly.
                loop {
                    match TcpStream::connect(&self.endpoint).await {
                        Ok(stream) => return Self::install(state, stream),
                        Err(_) => {
                            if Instant::now() + Duration::from_millis(50) >= deadline {
                                return Err(QueueError::Timeout);
                            }
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
            }
            Reconnect::Backoff {
                initial,
                cap,
                budget,
            } => {
                let started = Instant::now();
                let mut delay = initial;
                loop {
                    match TcpStream::connect(&self.endpoint).await {
                        Ok(stream) => {
                            Self::install(state, stream)?;
                            Self::resend_unacked(state).await;
                            return Ok(());
                        }
                        Err(err) => {
                            if started.elapsed() > budget {
                                debug!(endpoint = %self.endpoint, error = %err,
                                    "reconnect budget exhausted");
                                return Err(QueueError::Closed);
                            }
                            if Instant::now() >= deadline {
                                return Err(QueueError::Timeout);
                            }
                            let jitter = rand::rng().random_range(0.75..1.25);
                            let wait = delay.mul_f64(jitter);
                            trace!(endpoint = %self.endpoint, ?wait, "redialing after backoff");
                            tokio::time::sleep(wait).await;
                            delay = (delay * 2).min(cap);
                        }
                    }
                }
            }
        }
    }

    fn install(state: &mut ClientState, stream: TcpStream) -> Result<(), QueueError> {
        stream.set_nodelay(true).map_err(QueueError::transport)?;
        let (reader, writer) = stream.into_split();
        state.conn = Some(ClientConn { reader, writer });
        state.ever_connected = true;
        Ok(())
    }

    /// Resend every unacknowledged envelope in order on a fresh session.
    async fn resend_unacked(state: &mut ClientState) {
        if state.unacked.is_empty() {
            return;
        }
        debug!(count = state.unacked.len(), "resending unacknowledged envelopes");
        let frames: Vec<Vec<u8>> = state.unacked.iter().map(TickEnvelope::to_wire).collect();
        let mut failed = false;
        if let Some(conn) = state.conn.as_mut() {
            for frame in &frames {
                if write_frame(&mut conn.writer, frame).await.is_err() {
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            state.conn = None;
        }
    }

    async fn await_ack(state: &mut ClientState, deadline: Instant) -> AckOutcome {
        let read = {
            let Some(conn) = state.conn.as_mut() else {
                return AckOutcome::Lost;
            };
            tokio::time::timeout_at(deadline, conn.reader.read_u8()).await
        };
        match read {
            Err(_) => AckOutcome::Deadline,
            Ok(Ok(byte)) if byte == ACK => {
                state.unacked.pop_front();
                AckOutcome::Received
            }
            Ok(_) => AckOutcome::Lost,
        }
    }

    /// Consume any credits that arrived since the last push.
    fn collect_acks(state: &mut ClientState) {
        let mut received = 0usize;
        let mut lost = false;
        if let Some(conn) = state.conn.as_mut() {
            let mut byte = [0u8; 1];
            loop {
                match conn.reader.try_read(&mut byte) {
                    Ok(0) => {
                        lost = true;
                        break;
                    }
                    Ok(_) if byte[0] == ACK => received += 1,
                    Ok(_) => {
                        lost = true;
                        break;
                    }
                    Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(_) => {
                        lost = true;
                        break;
                    }
                }
            }
        }
        for _ in 0..received {
            state.unacked.pop_front();
        }
        if lost {
            state.conn = None;
        }
    }
}

#[async_trait]
impl EdgeQueue for LinkClient {
    async fn push(&self, envelope: TickEnvelope, deadline: Instant) -> Result<(), QueueError> {
        if *self.closed_rx.borrow() {
            return Err(QueueError::Closed);
        }
        let mut state = self.state.lock().await;
        'session: loop {
            if *self.closed_rx.borrow() {
                return Err(QueueError::Closed);
            }
            if state.conn.is_none() {
                self.connect(&mut state, deadline).await?;
            }
            Self::collect_acks(&mut state);
            while state.unacked.len() >= self.capacity {
                match Self::await_ack(&mut state, deadline).await {
                    AckOutcome::Received => {}
                    AckOutcome::Deadline => return Err(QueueError::Timeout),
                    AckOutcome::Lost => {
                        state.conn = None;
                        if !self.reconnectable() {
                            return Err(QueueError::Closed);
                        }
                        continue 'session;
                    }
                }
            }
            let frame = envelope.to_wire();
            if state.conn.is_none() {
                continue 'session;
            }
            let write = {
                let conn = state.conn.as_mut().expect("connection checked above");
                write_frame(&mut conn.writer, &frame).await
            };
            match write {
                Ok(()) => {
                    state.unacked.push_back(envelope);
                    return Ok(());
                }
                Err(err) => {
                    state.conn = None;
                    if !self.reconnectable() {
                        return Err(QueueError::Closed);
                    }
                    trace!(error = %err, "push hit transport loss, will redial");
                }
            }
        }
    }

    fn try_pop(&self) -> Result<Option<TickEnvelope>, QueueError> {
        Err(QueueError::Transport {
            message: "pop on the producer half of a link edge".into(),
        })
    }

    fn close(&self) {
        if self.closed_tx.send_replace(true) {
            return;
        }
        // Best-effort close marker so the server can distinguish an orderly
        // shutdown from transport loss.
        if let Ok(mut state) = self.state.try_lock() {
            if let Some(mut conn) = state.conn.take() {
                tokio::spawn(async move {
                    let _ = write_close(&mut conn.writer).await;
                });
            }
        }
    }

    fn is_open(&self) -> bool {
        !*self.closed_rx.borrow()
    }
}
