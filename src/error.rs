//! Runtime error taxonomy and the structured error sink.
//!
//! The taxonomy mirrors the failure surface of the runtime: configuration
//! rejection, queue timeouts and closure, transport loss, component faults,
//! tick-budget overruns and supervisor faults. User-visible failures are
//! reported as a non-zero exit code plus one structured [`ErrorRecord`]
//! written to the configured [`ErrorSink`], naming the offending entity by
//! its configuration path.

use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::queues::QueueError;
use crate::signal::CONFIG_ERROR_EXIT_CODE;

/// Top-level runtime error.
#[derive(Debug, Error, Diagnostic)]
pub enum RuntimeError {
    /// Configuration was rejected before start.
    #[error(transparent)]
    #[diagnostic(transparent)]
    ConfigInvalid(#[from] ConfigError),

    /// A queue push missed its deadline.
    #[error("queue timeout on edge `{edge}`")]
    #[diagnostic(code(stableflow::queue::timeout))]
    QueueTimeout { edge: String },

    /// A queue was closed (observed by consumers only after drain).
    #[error("queue closed on edge `{edge}`")]
    #[diagnostic(code(stableflow::queue::closed))]
    QueueClosed { edge: String },

    /// The inter-host transport was lost beyond its backoff budget.
    #[error("transport lost on edge `{edge}`: {message}")]
    #[diagnostic(code(stableflow::queue::transport_lost))]
    TransportLost { edge: String, message: String },

    /// User component code failed.
    #[error("component fault in node `{id_node}`: {message}")]
    #[diagnostic(
        code(stableflow::node::component_fault),
        help("The owning process escalates to exit_ex_controlled.")
    )]
    ComponentFault { id_node: String, message: String },

    /// A node exceeded its tick budget.
    #[error("tick budget overrun in node `{id_node}` at tick {idx}")]
    #[diagnostic(code(stableflow::node::tick_overrun))]
    TickOverrun { id_node: String, idx: u64 },

    /// A supervised process died unexpectedly.
    #[error("process `{id_process}` exited unexpectedly with code {code}")]
    #[diagnostic(
        code(stableflow::host::supervisor_fault),
        help("Peer processes receive exit_ex_controlled and drain.")
    )]
    SupervisorFault { id_process: String, code: i32 },

    /// I/O failure outside the queue layer (control channel, error sink).
    #[error("i/o error: {0}")]
    #[diagnostic(code(stableflow::io))]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Lift a queue-layer error into the taxonomy, naming the edge.
    #[must_use]
    pub fn from_queue(edge: impl Into<String>, err: QueueError) -> Self {
        let edge = edge.into();
        match err {
            QueueError::Timeout => RuntimeError::QueueTimeout { edge },
            QueueError::Closed => RuntimeError::QueueClosed { edge },
            QueueError::Transport { message } => RuntimeError::TransportLost { edge, message },
        }
    }

    /// Process exit code for this failure.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            RuntimeError::ConfigInvalid(_) => CONFIG_ERROR_EXIT_CODE,
            _ => 1,
        }
    }

    /// Short taxonomy label used in error records.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeError::ConfigInvalid(_) => "ConfigInvalid",
            RuntimeError::QueueTimeout { .. } => "QueueTimeout",
            RuntimeError::QueueClosed { .. } => "QueueClosed",
            RuntimeError::TransportLost { .. } => "TransportLost",
            RuntimeError::ComponentFault { .. } => "ComponentFault",
            RuntimeError::TickOverrun { .. } => "TickOverrun",
            RuntimeError::SupervisorFault { .. } => "SupervisorFault",
            RuntimeError::Io(_) => "Io",
        }
    }

    /// Build the structured record written to the error sink.
    #[must_use]
    pub fn to_record(&self) -> ErrorRecord {
        let path = match self {
            RuntimeError::ConfigInvalid(e) => e.path().to_string(),
            RuntimeError::QueueTimeout { edge }
            | RuntimeError::QueueClosed { edge }
            | RuntimeError::TransportLost { edge, .. } => edge.clone(),
            RuntimeError::ComponentFault { id_node, .. }
            | RuntimeError::TickOverrun { id_node, .. } => format!("node.{id_node}"),
            RuntimeError::SupervisorFault { id_process, .. } => format!("process.{id_process}"),
            RuntimeError::Io(_) => String::new(),
        };
        ErrorRecord {
            when: Utc::now(),
            code: self.kind().to_string(),
            path,
            message: self.to_string(),
        }
    }
}

/// One structured error record, serialized as a single JSON line.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorRecord {
    pub when: DateTime<Utc>,
    pub code: String,
    /// Configuration path of the offending entity, e.g. `node.sampler`.
    pub path: String,
    pub message: String,
}

/// Destination for structured error records.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ErrorSink {
    #[default]
    Stderr,
    File(PathBuf),
}

impl ErrorSink {
    /// Parse the configuration value: `"stderr"` or a file path.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "stderr" | "" => ErrorSink::Stderr,
            path => ErrorSink::File(PathBuf::from(path)),
        }
    }

    /// Write one record as a JSON line.
    pub fn write(&self, record: &ErrorRecord) -> std::io::Result<()> {
        let line = serde_json::to_string(record)?;
        match self {
            ErrorSink::Stderr => {
                let mut err = std::io::stderr().lock();
                writeln!(err, "{line}")
            }
            ErrorSink::File(path) => {
                let mut file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                writeln!(file, "{line}")
            }
        }
    }
}
