//! The denormalized, immutable configuration model.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ErrorSink;

/// A `(node, port)` endpoint reference, written `node.port` in documents.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRef {
    pub node: String,
    pub port: String,
}

impl PortRef {
    /// Parse the `node.port` document form.
    pub fn parse(text: &str) -> Option<Self> {
        let (node, port) = text.split_once('.')?;
        if node.is_empty() || port.is_empty() {
            return None;
        }
        Some(Self {
            node: node.to_string(),
            port: port.to_string(),
        })
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.port)
    }
}

/// Inferred transport kind of an edge.
///
/// Inter-host edges carry two halves: the consumer side binds (server), the
/// producer side dials (client). The canonical kind stored on an edge record
/// is the server half; [`EdgeDef::kind_for`] resolves the half a given
/// process holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    IntraProcess,
    InterProcess,
    InterHostServer,
    InterHostClient,
}

impl EdgeKind {
    /// Key used in the queue-class policy map.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            EdgeKind::IntraProcess => "intra_process",
            EdgeKind::InterProcess => "inter_process",
            EdgeKind::InterHostServer => "inter_host_server",
            EdgeKind::InterHostClient => "inter_host_client",
        }
    }

    /// True for kinds whose envelopes are serialized onto a transport.
    #[must_use]
    pub const fn is_link(self) -> bool {
        !matches!(self, EdgeKind::IntraProcess)
    }

    #[must_use]
    pub const fn is_inter_host(self) -> bool {
        matches!(self, EdgeKind::InterHostServer | EdgeKind::InterHostClient)
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Tag marking a lag-by-one-tick feedback edge.
pub const FEEDBACK_TAG: &str = "feedback";

/// One directed queue-backed connection between an output and an input port.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeDef {
    pub src: PortRef,
    pub dst: PortRef,
    pub tags: Vec<String>,
    /// Transport module path; filled from the queue policy when absent.
    pub class: String,
    pub kind: EdgeKind,
    pub capacity: usize,
    /// `host:port` endpoint for link kinds; `None` for intra-process edges.
    pub endpoint: Option<String>,
    /// Lag-by-one-tick delay element (feedback edges).
    pub lag: bool,
}

impl EdgeDef {
    /// True when tagged as feedback.
    #[must_use]
    pub fn is_feedback(&self) -> bool {
        self.tags.iter().any(|tag| tag == FEEDBACK_TAG)
    }

    /// The half of this edge a given process holds: the consumer side of a
    /// cross-host edge is the server, the producer side the client. For
    /// on-host kinds the stored kind is returned unchanged.
    #[must_use]
    pub fn kind_for(&self, system: &System, id_process: &str) -> EdgeKind {
        if !self.kind.is_inter_host() {
            return self.kind;
        }
        let consumer = system
            .node(&self.dst.node)
            .map(|node| node.process.as_str());
        if consumer == Some(id_process) {
            EdgeKind::InterHostServer
        } else {
            EdgeKind::InterHostClient
        }
    }
}

/// Per-node component state policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateType {
    /// Component state survives across ticks (the default).
    #[default]
    Stateful,
    /// Component is re-created on every `control_reset`.
    Stateless,
}

/// One computational node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    pub id_node: String,
    pub process: String,
    /// Component module path resolved through the registry.
    pub component: String,
    pub cfg: serde_json::Value,
    /// Ordered input ports; position 0 is the implicit `ctrl` port.
    pub port_in: Vec<String>,
    /// Ordered output ports.
    pub port_out: Vec<String>,
    pub state_type: StateType,
}

impl NodeDef {
    /// Input ports excluding the implicit `ctrl` port, in configured order.
    pub fn data_inputs(&self) -> impl Iterator<Item = &str> {
        self.port_in
            .iter()
            .map(String::as_str)
            .filter(|port| *port != "ctrl")
    }
}

/// One operating-system process definition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDef {
    pub id_process: String,
    pub host: String,
}

/// One host the system runs on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDef {
    pub id_host: String,
    pub addr: String,
    pub acct_run: String,
    pub is_local: bool,
    /// Port of the host's control endpoint; workers attach on the next port.
    pub ctrl_port: u16,
}

impl HostDef {
    /// Endpoint of the system control surface on this host.
    #[must_use]
    pub fn ctrl_endpoint(&self) -> String {
        format!("{}:{}", self.addr, self.ctrl_port)
    }

    /// Endpoint workers on this host attach to.
    #[must_use]
    pub fn worker_endpoint(&self) -> String {
        format!("{}:{}", self.addr, self.ctrl_port + 1)
    }
}

/// Mapping from edge kind to transport module, plus port assignment base.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePolicy {
    pub intra_process: String,
    pub inter_process: String,
    pub inter_host_server: String,
    pub inter_host_client: String,
    /// First port assigned to link edges without an explicit one.
    pub base_port: u16,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            intra_process: "queue.intra_process".to_string(),
            inter_process: "queue.inter_process".to_string(),
            inter_host_server: "queue.tcp_server".to_string(),
            inter_host_client: "queue.tcp_client".to_string(),
            base_port: 7500,
        }
    }
}

impl QueuePolicy {
    /// Default transport module for an edge kind.
    #[must_use]
    pub fn class_for(&self, kind: EdgeKind) -> &str {
        match kind {
            EdgeKind::IntraProcess => &self.intra_process,
            EdgeKind::InterProcess => &self.inter_process,
            EdgeKind::InterHostServer => &self.inter_host_server,
            EdgeKind::InterHostClient => &self.inter_host_client,
        }
    }
}

/// The immutable system record produced by the loader.
///
/// Constructed once at system start; nodes, processes and queues are
/// instantiated from it and it is never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct System {
    pub id_system: String,
    pub hosts: Vec<HostDef>,
    pub processes: Vec<ProcessDef>,
    pub nodes: Vec<NodeDef>,
    pub edges: Vec<EdgeDef>,
    pub queue: QueuePolicy,
    pub tick_period: Duration,
    /// Bound on one tick's work; `None` is unbounded.
    pub tick_budget: Option<Duration>,
    /// Per-port gather deadline.
    pub gather_budget: Duration,
    #[serde(skip, default)]
    pub error_sink: ErrorSink,
    /// Topological order of node ids over non-feedback edges.
    pub topo: Vec<String>,
}

impl System {
    #[must_use]
    pub fn host(&self, id_host: &str) -> Option<&HostDef> {
        self.hosts.iter().find(|h| h.id_host == id_host)
    }

    #[must_use]
    pub fn process(&self, id_process: &str) -> Option<&ProcessDef> {
        self.processes.iter().find(|p| p.id_process == id_process)
    }

    #[must_use]
    pub fn node(&self, id_node: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.id_node == id_node)
    }

    /// The host this invocation runs on.
    #[must_use]
    pub fn local_host(&self) -> Option<&HostDef> {
        self.hosts.iter().find(|h| h.is_local)
    }

    /// Nodes of one process, in document order.
    #[must_use]
    pub fn nodes_of(&self, id_process: &str) -> Vec<&NodeDef> {
        self.nodes
            .iter()
            .filter(|n| n.process == id_process)
            .collect()
    }

    /// Processes hosted on one host, in document order.
    #[must_use]
    pub fn processes_of(&self, id_host: &str) -> Vec<&ProcessDef> {
        self.processes
            .iter()
            .filter(|p| p.host == id_host)
            .collect()
    }

    /// Host a node ultimately runs on.
    #[must_use]
    pub fn host_of_node(&self, id_node: &str) -> Option<&HostDef> {
        let node = self.node(id_node)?;
        let process = self.process(&node.process)?;
        self.host(&process.host)
    }

    /// Edges whose producer or consumer lives in the given process.
    #[must_use]
    pub fn edges_of_process(&self, id_process: &str) -> Vec<(usize, &EdgeDef)> {
        self.edges
            .iter()
            .enumerate()
            .filter(|(_, edge)| {
                let src_in = self
                    .node(&edge.src.node)
                    .is_some_and(|n| n.process == id_process);
                let dst_in = self
                    .node(&edge.dst.node)
                    .is_some_and(|n| n.process == id_process);
                src_in || dst_in
            })
            .collect()
    }

    /// Node ids of one process in system topological order.
    #[must_use]
    pub fn topo_of(&self, id_process: &str) -> Vec<String> {
        self.topo
            .iter()
            .filter(|id| {
                self.node(id)
                    .is_some_and(|n| n.process == id_process)
            })
            .cloned()
            .collect()
    }
}
