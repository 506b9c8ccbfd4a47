//! Fluent construction of system documents from code.
//!
//! [`SystemBuilder`] assembles the same JSON document the loader reads from
//! disk, so programmatic construction and file-based configuration go
//! through one denormalization and validation path. It is the surface the
//! demos and tests use to describe small graphs without writing documents
//! by hand.
//!
//! # Examples
//!
//! ```
//! use stableflow::components::builtin_registry;
//! use stableflow::config::SystemBuilder;
//!
//! let registry = builtin_registry();
//! let system = SystemBuilder::new("pipeline")
//!     .tick_period_ms(10)
//!     .local_host("localhost", "demo")
//!     .process("main", "localhost")
//!     .node("ticker", "main", "stableflow.counter")
//!     .node_cfg(serde_json::json!({"emit": 25}))
//!     .outputs(["out"])
//!     .node("printer", "main", "stableflow.log")
//!     .inputs(["in"])
//!     .connect("ticker.out", "printer.in")
//!     .compile(Some(&registry))
//!     .unwrap();
//!
//! assert_eq!(system.nodes.len(), 2);
//! assert_eq!(system.edges[0].class, "queue.intra_process");
//! ```

use serde_json::{json, Map, Value};

use super::loader::load_value;
use super::model::System;
use super::ConfigError;
use crate::component::ComponentRegistry;

/// Builder assembling a system document, compiled through the loader.
///
/// Node-scoped methods (`node_cfg`, `inputs`, `outputs`, `state_type`)
/// apply to the most recently added node; edge-scoped methods (`capacity`,
/// `tags`) to the most recently added edge.
#[derive(Clone, Debug)]
pub struct SystemBuilder {
    system: Map<String, Value>,
    hosts: Map<String, Value>,
    processes: Map<String, Value>,
    nodes: Vec<Value>,
    edges: Vec<Value>,
    queue: Map<String, Value>,
}

impl SystemBuilder {
    #[must_use]
    pub fn new(id_system: impl Into<String>) -> Self {
        let mut system = Map::new();
        system.insert("id_system".into(), Value::String(id_system.into()));
        Self {
            system,
            hosts: Map::new(),
            processes: Map::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
            queue: Map::new(),
        }
    }

    #[must_use]
    pub fn tick_period_ms(mut self, ms: u64) -> Self {
        self.system.insert("tick_period_ms".into(), json!(ms));
        self
    }

    #[must_use]
    pub fn tick_budget_ms(mut self, ms: u64) -> Self {
        self.system.insert("tick_budget_ms".into(), json!(ms));
        self
    }

    #[must_use]
    pub fn error_sink(mut self, sink: impl Into<String>) -> Self {
        self.system.insert("error_sink".into(), json!(sink.into()));
        self
    }

    /// First port assigned to link edges without an explicit endpoint.
    #[must_use]
    pub fn base_port(mut self, port: u16) -> Self {
        self.queue.insert("base_port".into(), json!(port));
        self
    }

    /// A host this invocation runs on (loopback address).
    #[must_use]
    pub fn local_host(mut self, id_host: impl Into<String>, acct_run: impl Into<String>) -> Self {
        self.hosts.insert(
            id_host.into(),
            json!({"acct_run": acct_run.into(), "is_local": true}),
        );
        self
    }

    /// A remote host driven through its agent.
    #[must_use]
    pub fn remote_host(
        mut self,
        id_host: impl Into<String>,
        addr: impl Into<String>,
        acct_run: impl Into<String>,
    ) -> Self {
        self.hosts.insert(
            id_host.into(),
            json!({"addr": addr.into(), "acct_run": acct_run.into()}),
        );
        self
    }

    #[must_use]
    pub fn process(mut self, id_process: impl Into<String>, host: impl Into<String>) -> Self {
        self.processes
            .insert(id_process.into(), json!({"host": host.into()}));
        self
    }

    /// Add a node; subsequent node-scoped calls configure it.
    #[must_use]
    pub fn node(
        mut self,
        id_node: impl Into<String>,
        process: impl Into<String>,
        component: impl Into<String>,
    ) -> Self {
        self.nodes.push(json!({
            "id_node": id_node.into(),
            "process": process.into(),
            "component": component.into(),
        }));
        self
    }

    #[must_use]
    pub fn node_cfg(mut self, cfg: Value) -> Self {
        if let Some(node) = self.nodes.last_mut() {
            node["cfg"] = cfg;
        }
        self
    }

    #[must_use]
    pub fn inputs<I, S>(mut self, ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(node) = self.nodes.last_mut() {
            let ports: Vec<String> = ports.into_iter().map(Into::into).collect();
            node["port_in"] = json!(ports);
        }
        self
    }

    #[must_use]
    pub fn outputs<I, S>(mut self, ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(node) = self.nodes.last_mut() {
            let ports: Vec<String> = ports.into_iter().map(Into::into).collect();
            node["port_out"] = json!(ports);
        }
        self
    }

    #[must_use]
    pub fn state_type(mut self, state_type: impl Into<String>) -> Self {
        if let Some(node) = self.nodes.last_mut() {
            node["state_type"] = json!(state_type.into());
        }
        self
    }

    /// Add an edge; subsequent edge-scoped calls configure it.
    #[must_use]
    pub fn connect(mut self, src: impl Into<String>, dst: impl Into<String>) -> Self {
        self.edges
            .push(json!({"src": src.into(), "dst": dst.into()}));
        self
    }

    /// A lag-by-one-tick feedback edge.
    #[must_use]
    pub fn connect_feedback(self, src: impl Into<String>, dst: impl Into<String>) -> Self {
        self.connect(src, dst).tags(["feedback"])
    }

    #[must_use]
    pub fn capacity(mut self, capacity: usize) -> Self {
        if let Some(edge) = self.edges.last_mut() {
            edge["capacity"] = json!(capacity);
        }
        self
    }

    #[must_use]
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(edge) = self.edges.last_mut() {
            let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
            edge["tags"] = json!(tags);
        }
        self
    }

    /// The assembled document, as the loader would read it from disk.
    #[must_use]
    pub fn into_value(self) -> Value {
        json!({
            "system": Value::Object(self.system),
            "host": Value::Object(self.hosts),
            "process": Value::Object(self.processes),
            "node": Value::Array(self.nodes),
            "edge": Value::Array(self.edges),
            "queue": Value::Object(self.queue),
        })
    }

    /// Denormalize and validate into an immutable [`System`].
    pub fn compile(self, registry: Option<&ComponentRegistry>) -> Result<System, ConfigError> {
        load_value(self.into_value(), &[], registry)
    }
}
