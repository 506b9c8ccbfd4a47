//! Tick envelopes: the record carried on every port, every tick.
//!
//! A [`TickEnvelope`] bundles an enable flag, an optional [`TickStamp`] and a
//! sequence of JSON payload items. Producing nodes reset their output
//! envelopes at the start of each tick, components mutate them in place, and
//! the runtime dispatches only the envelopes whose enable flag is set.
//!
//! Envelopes that cross a process or host boundary are serialized with the
//! deterministic little-endian wire format implemented by
//! [`TickEnvelope::to_wire`] / [`TickEnvelope::from_wire`].
//!
//! # Examples
//!
//! ```
//! use stableflow::envelope::{TickEnvelope, TickStamp};
//!
//! let mut env = TickEnvelope::new();
//! assert!(!env.ena);
//!
//! env.emit(serde_json::json!({"reading": 42}));
//! env.ts = Some(TickStamp::at(7, 1_700_000_000.0));
//! assert!(env.ena);
//!
//! let bytes = env.to_wire();
//! let decoded = TickEnvelope::from_wire(&bytes).unwrap();
//! assert_eq!(decoded.list, env.list);
//! assert_eq!(decoded.ts.unwrap().idx, 7);
//! ```

use std::collections::BTreeMap;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Timestamp record attached to an envelope.
///
/// `idx` is the monotonically increasing tick counter of the producing
/// process; `unix_time` is the wall clock at tick generation. The `extra`
/// map is reserved for transit timestamps and is ordered so the wire
/// encoding stays deterministic.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TickStamp {
    pub idx: u64,
    pub unix_time: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, f64>,
}

impl TickStamp {
    /// Stamp for tick `idx` at the current wall clock.
    #[must_use]
    pub fn now(idx: u64) -> Self {
        let unix_time = chrono::Utc::now().timestamp_micros() as f64 / 1e6;
        Self::at(idx, unix_time)
    }

    /// Stamp for tick `idx` at an explicit unix time.
    #[must_use]
    pub fn at(idx: u64, unix_time: f64) -> Self {
        Self {
            idx,
            unix_time,
            extra: BTreeMap::new(),
        }
    }
}

/// The `{ena, ts, list}` record exchanged on every edge.
///
/// The runtime pre-allocates one envelope per port and calls
/// [`reset`](Self::reset) before each component invocation, so components
/// observe `ena == false`, `ts == None` and an empty `list` and mutate the
/// envelope in place to emit data.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TickEnvelope {
    pub ena: bool,
    pub ts: Option<TickStamp>,
    pub list: Vec<serde_json::Value>,
}

impl TickEnvelope {
    /// A fresh, disabled envelope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An enabled envelope carrying `items`, stamped with `ts`.
    #[must_use]
    pub fn enabled(ts: TickStamp, items: Vec<serde_json::Value>) -> Self {
        Self {
            ena: true,
            ts: Some(ts),
            list: items,
        }
    }

    /// Clear the envelope back to its pre-tick shape: enable flag down,
    /// timestamp cleared, payload list truncated. Capacity is retained.
    pub fn reset(&mut self) {
        self.ena = false;
        self.ts = None;
        self.list.clear();
    }

    /// Append a payload item and raise the enable flag.
    pub fn emit(&mut self, item: serde_json::Value) {
        self.ena = true;
        self.list.push(item);
    }

    /// True when the envelope is in its reset state.
    #[must_use]
    pub fn is_reset(&self) -> bool {
        !self.ena && self.ts.is_none() && self.list.is_empty()
    }

    /// Encode into the deterministic little-endian wire format.
    ///
    /// Field order: enable byte, `ts.idx` (u64), `ts.unix_time` (f64), the
    /// reserved timestamp map (count-prefixed), then the payload list
    /// (count-prefixed, each item length-prefixed JSON). An unset stamp is
    /// written as zeros; dispatch stamps every envelope before it reaches a
    /// serializing queue, so this only arises when encoding reset envelopes
    /// directly.
    #[must_use]
    pub fn to_wire(&self) -> Vec<u8> {
        let ts = self.ts.clone().unwrap_or_default();
        let mut buf = Vec::with_capacity(32 + self.list.len() * 16);
        buf.push(u8::from(self.ena));
        buf.extend_from_slice(&ts.idx.to_le_bytes());
        buf.extend_from_slice(&ts.unix_time.to_le_bytes());
        buf.extend_from_slice(&(ts.extra.len() as u32).to_le_bytes());
        for (key, value) in &ts.extra {
            buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
            buf.extend_from_slice(key.as_bytes());
            buf.extend_from_slice(&value.to_le_bytes());
        }
        buf.extend_from_slice(&(self.list.len() as u32).to_le_bytes());
        for item in &self.list {
            let bytes = serde_json::to_vec(item).unwrap_or_else(|_| b"null".to_vec());
            buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(&bytes);
        }
        buf
    }

    /// Decode an envelope from its wire form.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor { buf: bytes, at: 0 };
        let ena = match cur.u8()? {
            0 => false,
            1 => true,
            other => return Err(WireError::BadEnable(other)),
        };
        let idx = cur.u64()?;
        let unix_time = cur.f64()?;
        let mut extra = BTreeMap::new();
        let extra_len = cur.u32()? as usize;
        for _ in 0..extra_len {
            let key_len = cur.u32()? as usize;
            let key = std::str::from_utf8(cur.take(key_len)?)
                .map_err(|_| WireError::BadKey)?
                .to_string();
            let value = cur.f64()?;
            extra.insert(key, value);
        }
        let list_len = cur.u32()? as usize;
        let mut list = Vec::with_capacity(list_len.min(1024));
        for _ in 0..list_len {
            let item_len = cur.u32()? as usize;
            let item = serde_json::from_slice(cur.take(item_len)?)?;
            list.push(item);
        }
        if cur.at != bytes.len() {
            return Err(WireError::TrailingBytes(bytes.len() - cur.at));
        }
        Ok(Self {
            ena,
            ts: Some(TickStamp {
                idx,
                unix_time,
                extra,
            }),
            list,
        })
    }
}

/// Decoding failures for the envelope wire format.
#[derive(Debug, Error, Diagnostic)]
pub enum WireError {
    #[error("envelope truncated: needed {needed} more bytes at offset {at}")]
    #[diagnostic(code(stableflow::envelope::truncated))]
    Truncated { at: usize, needed: usize },

    #[error("invalid enable byte {0:#04x}")]
    #[diagnostic(code(stableflow::envelope::bad_enable))]
    BadEnable(u8),

    #[error("timestamp key is not valid UTF-8")]
    #[diagnostic(code(stableflow::envelope::bad_key))]
    BadKey,

    #[error("{0} trailing bytes after envelope")]
    #[diagnostic(code(stableflow::envelope::trailing))]
    TrailingBytes(usize),

    #[error("payload item is not valid JSON: {0}")]
    #[diagnostic(code(stableflow::envelope::bad_payload))]
    BadPayload(#[from] serde_json::Error),
}

struct Cursor<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() - self.at < n {
            return Err(WireError::Truncated {
                at: self.at,
                needed: n - (self.buf.len() - self.at),
            });
        }
        let slice = &self.buf[self.at..self.at + n];
        self.at += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn f64(&mut self) -> Result<f64, WireError> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }
}
