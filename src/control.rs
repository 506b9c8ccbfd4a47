//! Control frames and the in-process control bus.
//!
//! Control signals travel out-of-band from the data queues. Inside one
//! process they fan out over a [`ControlBus`]; between processes and hosts
//! they cross as [`ControlFrame`]s on the same length-prefixed framing the
//! link queues use. The bus is single-producer (orchestrator or supervisor)
//! and multi-consumer (supervisors and nodes).

use std::sync::Mutex;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::queues::framing::{read_frame, write_frame};
use crate::signal::ControlSignal;

const FRAME_SIGNAL: u8 = 0x01;
const FRAME_HELLO: u8 = 0x02;

/// One frame on a control channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlFrame {
    /// A control signal, tagged with the id of its origin (system, host or
    /// process) for tracing.
    Signal {
        signal: ControlSignal,
        origin: String,
    },
    /// First frame a worker sends after attaching, naming its process.
    Hello { id_process: String },
}

impl ControlFrame {
    /// A signal frame from the given origin.
    #[must_use]
    pub fn signal(signal: ControlSignal, origin: impl Into<String>) -> Self {
        ControlFrame::Signal {
            signal,
            origin: origin.into(),
        }
    }

    /// Encode: a type byte, then the signal code and origin, or the process
    /// id. Strings are UTF-8 to the end of the frame.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ControlFrame::Signal { signal, origin } => {
                let mut buf = Vec::with_capacity(2 + origin.len());
                buf.push(FRAME_SIGNAL);
                buf.push(signal.code());
                buf.extend_from_slice(origin.as_bytes());
                buf
            }
            ControlFrame::Hello { id_process } => {
                let mut buf = Vec::with_capacity(1 + id_process.len());
                buf.push(FRAME_HELLO);
                buf.extend_from_slice(id_process.as_bytes());
                buf
            }
        }
    }

    /// Decode one frame payload.
    pub fn decode(bytes: &[u8]) -> std::io::Result<Self> {
        let bad = |what: &str| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, what.to_string())
        };
        match bytes.first() {
            Some(&FRAME_SIGNAL) => {
                let code = *bytes.get(1).ok_or_else(|| bad("truncated signal frame"))?;
                let signal = ControlSignal::from_code(code)
                    .ok_or_else(|| bad("unknown control-signal code"))?;
                let origin = std::str::from_utf8(&bytes[2..])
                    .map_err(|_| bad("origin is not valid UTF-8"))?
                    .to_string();
                Ok(ControlFrame::Signal { signal, origin })
            }
            Some(&FRAME_HELLO) => {
                let id_process = std::str::from_utf8(&bytes[1..])
                    .map_err(|_| bad("process id is not valid UTF-8"))?
                    .to_string();
                Ok(ControlFrame::Hello { id_process })
            }
            _ => Err(bad("unknown control frame type")),
        }
    }

    /// Write this frame to a control connection.
    pub async fn write_to<W>(&self, writer: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        write_frame(writer, &self.encode()).await
    }

    /// Read the next frame from a control connection. `Ok(None)` is the
    /// orderly close marker.
    pub async fn read_from<R>(reader: &mut R) -> std::io::Result<Option<Self>>
    where
        R: AsyncRead + Unpin,
    {
        match read_frame(reader).await? {
            Some(payload) => Ok(Some(Self::decode(&payload)?)),
            None => Ok(None),
        }
    }
}

/// In-process control fan-out.
///
/// Subscribers receive every signal broadcast after they subscribe; a
/// dropped receiver is pruned on the next broadcast.
#[derive(Default)]
pub struct ControlBus {
    subscribers: Mutex<Vec<flume::Sender<ControlSignal>>>,
}

impl ControlBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A new subscription. Signals queue until polled.
    #[must_use]
    pub fn subscribe(&self) -> flume::Receiver<ControlSignal> {
        let (tx, rx) = flume::unbounded();
        self.subscribers
            .lock()
            .expect("control bus poisoned")
            .push(tx);
        rx
    }

    /// Deliver a signal to every live subscriber.
    pub fn broadcast(&self, signal: ControlSignal) {
        self.subscribers
            .lock()
            .expect("control bus poisoned")
            .retain(|tx| tx.send(signal).is_ok());
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("control bus poisoned")
            .len()
    }
}

impl std::fmt::Debug for ControlBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
