//! Configuration loading, denormalization and validation.
//!
//! A system is described declaratively as a JSON document with the top-level
//! keys `system`, `host`, `process`, `node`, `edge` and `queue`. Loading
//! proceeds in three phases:
//!
//! 1. **Overrides** — an ordered list of dot-delimited `(address, value)`
//!    pairs is applied to the raw document ([`overrides`]).
//! 2. **Denormalization** — implicit `ctrl` ports are injected, edge kinds
//!    are inferred from endpoint locality, default queue classes and link
//!    endpoints are filled in ([`loader`]).
//! 3. **Validation** — structural rules are checked and the intra-tick graph
//!    is topologically ordered; the first violation is reported as a
//!    [`ConfigError`] naming the offending path ([`validate`]).
//!
//! The result is an immutable [`System`] record.
//!
//! # Examples
//!
//! ```
//! use stableflow::config::{load_value, Override};
//!
//! let doc = serde_json::json!({
//!     "system": {"id_system": "demo"},
//!     "host": {"localhost": {"acct_run": "alice", "is_local": true}},
//!     "process": {"main": {"host": "localhost"}},
//!     "node": [
//!         {"id_node": "src", "process": "main",
//!          "component": "stableflow.counter", "port_out": ["out"]},
//!         {"id_node": "dst", "process": "main",
//!          "component": "stableflow.log", "port_in": ["in"]}
//!     ],
//!     "edge": [{"src": "src.out", "dst": "dst.in"}]
//! });
//!
//! let over = Override::parse("host.localhost.acct_run=bob").unwrap();
//! let system = load_value(doc, &[over], None).unwrap();
//! assert_eq!(system.host("localhost").unwrap().acct_run, "bob");
//! ```

pub mod builder;
pub mod loader;
pub mod model;
pub mod overrides;
pub mod validate;

pub use builder::SystemBuilder;
pub use loader::{load_path, load_str, load_value};
pub use model::{
    EdgeDef, EdgeKind, HostDef, NodeDef, PortRef, ProcessDef, QueuePolicy, StateType, System,
};
pub use overrides::{apply_override, apply_overrides, Override};

use miette::Diagnostic;
use thiserror::Error;

/// Configuration rejection, fatal before start.
///
/// Carries the dot-delimited path of the first offending entity, e.g.
/// `edge.2.src` or `host.worker.acct_run`.
#[derive(Debug, Clone, Error, Diagnostic, PartialEq, Eq)]
#[error("invalid configuration at `{path}`: {reason}")]
#[diagnostic(
    code(stableflow::config::invalid),
    help("Fix the named entity in the system document or the override list.")
)]
pub struct ConfigError {
    path: String,
    reason: String,
}

impl ConfigError {
    /// An error naming the offending config path.
    #[must_use]
    pub fn at(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// The offending path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The rejection reason.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}
