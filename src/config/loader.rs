//! Loading and denormalization of the declarative system document.
//!
//! The raw document is a JSON map with the top-level keys `system`, `host`,
//! `process`, `node`, `edge` and `queue`. Hosts and processes are maps keyed
//! by id; nodes and edges are sequences, and error paths use their sequence
//! index (`node.2.process`). After overrides are applied, the loader fills
//! in everything the document may leave implicit:
//!
//! - every node acquires a `ctrl` input port at position 0,
//! - every edge gets a kind inferred from the host-locality of its
//!   endpoints, the default queue class for that kind, a capacity and (for
//!   link kinds) a TCP endpoint assigned from the policy's base port,
//! - feedback-tagged edges are marked lag-by-one-tick.
//!
//! Validation then runs over the denormalized parts; see
//! [`validate`](super::validate).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use super::model::{
    EdgeDef, EdgeKind, HostDef, NodeDef, PortRef, ProcessDef, QueuePolicy, StateType, System,
};
use super::overrides::{apply_overrides, Override};
use super::validate;
use super::ConfigError;
use crate::component::ComponentRegistry;
use crate::error::ErrorSink;

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawSystem {
    id_system: String,
    tick_period_ms: u64,
    tick_budget_ms: Option<u64>,
    gather_budget_ms: Option<u64>,
    error_sink: String,
}

impl Default for RawSystem {
    fn default() -> Self {
        Self {
            id_system: "stableflow".to_string(),
            tick_period_ms: 100,
            tick_budget_ms: None,
            gather_budget_ms: None,
            error_sink: "stderr".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawHost {
    addr: String,
    acct_run: String,
    is_local: bool,
    ctrl_port: u16,
}

impl Default for RawHost {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1".to_string(),
            acct_run: String::new(),
            is_local: false,
            ctrl_port: 7400,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawProcess {
    host: String,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    id_node: String,
    process: String,
    component: String,
    #[serde(default)]
    cfg: Value,
    #[serde(default)]
    port_in: Vec<String>,
    #[serde(default)]
    port_out: Vec<String>,
    #[serde(default)]
    state_type: StateType,
}

#[derive(Debug, Deserialize)]
struct RawEdge {
    src: String,
    dst: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    class: Option<String>,
    #[serde(default)]
    kind: Option<EdgeKind>,
    #[serde(default)]
    capacity: Option<usize>,
    #[serde(default)]
    endpoint: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawQueue {
    intra_process: Option<String>,
    inter_process: Option<String>,
    inter_host_server: Option<String>,
    inter_host_client: Option<String>,
    base_port: Option<u16>,
}

fn de<T: DeserializeOwned>(value: Value, path: &str) -> Result<T, ConfigError> {
    serde_json::from_value(value).map_err(|err| ConfigError::at(path, err.to_string()))
}

fn de_or_default<T: DeserializeOwned + Default>(
    value: Option<&Value>,
    path: &str,
) -> Result<T, ConfigError> {
    match value {
        None | Some(Value::Null) => Ok(T::default()),
        Some(v) => de(v.clone(), path),
    }
}

fn de_map<T: DeserializeOwned>(
    value: Option<&Value>,
    key: &str,
) -> Result<BTreeMap<String, T>, ConfigError> {
    let Some(value) = value else {
        return Ok(BTreeMap::new());
    };
    let map = value
        .as_object()
        .ok_or_else(|| ConfigError::at(key, "expected a map keyed by id"))?;
    let mut out = BTreeMap::new();
    for (id, entry) in map {
        let path = format!("{key}.{id}");
        out.insert(id.clone(), de(entry.clone(), &path)?);
    }
    Ok(out)
}

fn de_seq<T: DeserializeOwned>(value: Option<&Value>, key: &str) -> Result<Vec<T>, ConfigError> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let seq = value
        .as_array()
        .ok_or_else(|| ConfigError::at(key, "expected a sequence"))?;
    seq.iter()
        .enumerate()
        .map(|(index, entry)| de(entry.clone(), &format!("{key}.{index}")))
        .collect()
}

/// Load a system from a document value plus an ordered override list.
///
/// When a [`ComponentRegistry`] is supplied, node component paths are
/// resolved against it; `None` skips that check (useful for tooling that
/// only inspects the topology).
pub fn load_value(
    mut doc: Value,
    overrides: &[Override],
    registry: Option<&ComponentRegistry>,
) -> Result<System, ConfigError> {
    apply_overrides(&mut doc, overrides)?;
    let root = doc
        .as_object()
        .ok_or_else(|| ConfigError::at("document", "document root must be a map"))?;

    let raw_system: RawSystem = de_or_default(root.get("system"), "system")?;
    let raw_hosts: BTreeMap<String, RawHost> = de_map(root.get("host"), "host")?;
    let raw_processes: BTreeMap<String, RawProcess> = de_map(root.get("process"), "process")?;
    let raw_nodes: Vec<RawNode> = de_seq(root.get("node"), "node")?;
    let raw_edges: Vec<RawEdge> = de_seq(root.get("edge"), "edge")?;
    let raw_queue: RawQueue = de_or_default(root.get("queue"), "queue")?;

    let hosts: Vec<HostDef> = raw_hosts
        .into_iter()
        .map(|(id_host, raw)| HostDef {
            id_host,
            addr: raw.addr,
            acct_run: raw.acct_run,
            is_local: raw.is_local,
            ctrl_port: raw.ctrl_port,
        })
        .collect();

    let processes: Vec<ProcessDef> = raw_processes
        .into_iter()
        .map(|(id_process, raw)| ProcessDef {
            id_process,
            host: raw.host,
        })
        .collect();

    let mut nodes: Vec<NodeDef> = raw_nodes
        .into_iter()
        .map(|raw| NodeDef {
            id_node: raw.id_node,
            process: raw.process,
            component: raw.component,
            cfg: raw.cfg,
            port_in: raw.port_in,
            port_out: raw.port_out,
            state_type: raw.state_type,
        })
        .collect();

    // Implicit ctrl input, gathered from the process tick generator.
    for node in &mut nodes {
        if !node.port_in.iter().any(|port| port == "ctrl") {
            node.port_in.insert(0, "ctrl".to_string());
        }
    }

    let defaults = QueuePolicy::default();
    let queue = QueuePolicy {
        intra_process: raw_queue.intra_process.unwrap_or(defaults.intra_process),
        inter_process: raw_queue.inter_process.unwrap_or(defaults.inter_process),
        inter_host_server: raw_queue
            .inter_host_server
            .unwrap_or(defaults.inter_host_server),
        inter_host_client: raw_queue
            .inter_host_client
            .unwrap_or(defaults.inter_host_client),
        base_port: raw_queue.base_port.unwrap_or(defaults.base_port),
    };

    let mut edges = Vec::with_capacity(raw_edges.len());
    let mut declared_kinds = Vec::with_capacity(raw_edges.len());
    for (index, raw) in raw_edges.into_iter().enumerate() {
        let src = PortRef::parse(&raw.src).ok_or_else(|| {
            ConfigError::at(format!("edge.{index}.src"), "expected `node.port`")
        })?;
        let dst = PortRef::parse(&raw.dst).ok_or_else(|| {
            ConfigError::at(format!("edge.{index}.dst"), "expected `node.port`")
        })?;
        declared_kinds.push(raw.kind);
        edges.push(EdgeDef {
            src,
            dst,
            tags: raw.tags,
            class: raw.class.unwrap_or_default(),
            // Placeholder; inference below assigns the real kind.
            kind: raw.kind.unwrap_or(EdgeKind::IntraProcess),
            capacity: raw
                .capacity
                .unwrap_or(crate::queues::IntraQueue::DEFAULT_CAPACITY),
            endpoint: raw.endpoint,
            lag: false,
        });
    }

    validate::check_structure(&hosts, &processes, &nodes, &edges)?;

    if let Some(registry) = registry {
        for (index, node) in nodes.iter().enumerate() {
            if !registry.contains(&node.component) {
                return Err(ConfigError::at(
                    format!("node.{index}.component"),
                    format!("component path `{}` does not resolve", node.component),
                ));
            }
        }
    }

    denormalize_edges(&mut edges, &declared_kinds, &nodes, &processes, &hosts, &queue)?;
    let topo = validate::check_graph(&nodes, &edges)?;

    let tick_period = Duration::from_millis(raw_system.tick_period_ms.max(1));
    let gather_budget = raw_system
        .gather_budget_ms
        .map_or(tick_period / 2, Duration::from_millis);

    Ok(System {
        id_system: raw_system.id_system,
        hosts,
        processes,
        nodes,
        edges,
        queue,
        tick_period,
        tick_budget: raw_system.tick_budget_ms.map(Duration::from_millis),
        gather_budget,
        error_sink: ErrorSink::parse(&raw_system.error_sink),
        topo,
    })
}

/// Infer edge kinds from endpoint locality and fill in the queue class,
/// endpoint and lag flag. Declared kinds that contradict the locality of
/// their endpoints are rejected here; the structural checks have already
/// guaranteed that both endpoints resolve.
fn denormalize_edges(
    edges: &mut [EdgeDef],
    declared_kinds: &[Option<EdgeKind>],
    nodes: &[NodeDef],
    processes: &[ProcessDef],
    hosts: &[HostDef],
    queue: &QueuePolicy,
) -> Result<(), ConfigError> {
    let process_of = |id_node: &str| -> &str {
        nodes
            .iter()
            .find(|n| n.id_node == id_node)
            .map(|n| n.process.as_str())
            .unwrap_or_default()
    };
    let host_of = |id_process: &str| -> &str {
        processes
            .iter()
            .find(|p| p.id_process == id_process)
            .map(|p| p.host.as_str())
            .unwrap_or_default()
    };

    let mut next_port = queue.base_port;
    for (index, edge) in edges.iter_mut().enumerate() {
        let src_process = process_of(&edge.src.node);
        let dst_process = process_of(&edge.dst.node);
        let inferred = if src_process == dst_process {
            EdgeKind::IntraProcess
        } else if host_of(src_process) == host_of(dst_process) {
            EdgeKind::InterProcess
        } else {
            // Canonical stored kind for a cross-host edge is the server
            // (consumer) half; `EdgeDef::kind_for` resolves the other side.
            EdgeKind::InterHostServer
        };
        // A declared kind must agree with endpoint locality. The document
        // may name either half of an inter-host edge.
        if let Some(declared) = declared_kinds[index] {
            let matches = match declared {
                EdgeKind::InterHostClient | EdgeKind::InterHostServer => {
                    inferred == EdgeKind::InterHostServer
                }
                declared => declared == inferred,
            };
            if !matches {
                return Err(ConfigError::at(
                    format!("edge.{index}.kind"),
                    format!(
                        "declared kind `{declared}` contradicts endpoint locality (`{inferred}`)"
                    ),
                ));
            }
        }
        edge.kind = inferred;
        if edge.class.is_empty() {
            edge.class = queue.class_for(inferred).to_string();
        }
        edge.lag = edge.is_feedback();
        if inferred.is_link() && edge.endpoint.is_none() {
            let dst_host = hosts
                .iter()
                .find(|h| h.id_host == host_of(dst_process))
                .map(|h| h.addr.as_str())
                .unwrap_or("127.0.0.1");
            edge.endpoint = Some(format!("{dst_host}:{next_port}"));
            next_port = next_port.wrapping_add(1);
        }
        if !inferred.is_link() {
            edge.endpoint = None;
        }
    }
    Ok(())
}

/// Load a system from a JSON document string.
pub fn load_str(
    text: &str,
    overrides: &[Override],
    registry: Option<&ComponentRegistry>,
) -> Result<System, ConfigError> {
    let doc: Value = serde_json::from_str(text)
        .map_err(|err| ConfigError::at("document", format!("invalid JSON: {err}")))?;
    load_value(doc, overrides, registry)
}

/// Load a system from a document file.
pub fn load_path(
    path: &Path,
    overrides: &[Override],
    registry: Option<&ComponentRegistry>,
) -> Result<System, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|err| {
        ConfigError::at(path.display().to_string(), format!("cannot read: {err}"))
    })?;
    load_str(&text, overrides, registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_doc() -> Value {
        json!({
            "system": {"id_system": "t", "tick_period_ms": 10},
            "host": {"localhost": {"acct_run": "alice", "is_local": true}},
            "process": {"main": {"host": "localhost"}},
            "node": [
                {"id_node": "a", "process": "main",
                 "component": "stableflow.counter", "port_out": ["out"]},
                {"id_node": "b", "process": "main",
                 "component": "stableflow.log", "port_in": ["in"]}
            ],
            "edge": [{"src": "a.out", "dst": "b.in"}]
        })
    }

    #[test]
    fn loads_and_denormalizes_minimal_doc() {
        let system = load_value(minimal_doc(), &[], None).unwrap();
        assert_eq!(system.id_system, "t");
        let a = system.node("a").unwrap();
        assert_eq!(a.port_in[0], "ctrl");
        let edge = &system.edges[0];
        assert_eq!(edge.kind, EdgeKind::IntraProcess);
        assert_eq!(edge.class, "queue.intra_process");
        assert!(edge.endpoint.is_none());
        assert_eq!(system.topo, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn infers_inter_process_kind_and_assigns_endpoint() {
        let mut doc = minimal_doc();
        doc["process"]["aux"] = json!({"host": "localhost"});
        doc["node"][1]["process"] = json!("aux");
        let system = load_value(doc, &[], None).unwrap();
        let edge = &system.edges[0];
        assert_eq!(edge.kind, EdgeKind::InterProcess);
        assert_eq!(edge.class, "queue.inter_process");
        assert_eq!(edge.endpoint.as_deref(), Some("127.0.0.1:7500"));
    }

    #[test]
    fn infers_inter_host_kind() {
        let mut doc = minimal_doc();
        doc["host"]["worker"] = json!({"addr": "10.0.0.2", "acct_run": "svc"});
        doc["process"]["aux"] = json!({"host": "worker"});
        doc["node"][1]["process"] = json!("aux");
        let system = load_value(doc, &[], None).unwrap();
        let edge = &system.edges[0];
        assert_eq!(edge.kind, EdgeKind::InterHostServer);
        assert_eq!(edge.endpoint.as_deref(), Some("10.0.0.2:7500"));
        assert_eq!(edge.kind_for(&system, "aux"), EdgeKind::InterHostServer);
        assert_eq!(edge.kind_for(&system, "main"), EdgeKind::InterHostClient);
    }

    #[test]
    fn rejects_unknown_component_paths_against_registry() {
        let registry = crate::components::builtin_registry();
        let mut doc = minimal_doc();
        doc["node"][0]["component"] = json!("no.such.component");
        let err = load_value(doc, &[], Some(&registry)).unwrap_err();
        assert_eq!(err.path(), "node.0.component");
    }

    #[test]
    fn overrides_reach_the_loaded_system() {
        let over = Override::parse("host.localhost.acct_run=bob").unwrap();
        let system = load_value(minimal_doc(), &[over], None).unwrap();
        assert_eq!(system.host("localhost").unwrap().acct_run, "bob");
    }

    #[test]
    fn null_node_entry_is_rejected_with_its_path() {
        let mut doc = minimal_doc();
        let over = Override::parse("node.5.id_node=late").unwrap();
        apply_overrides(&mut doc, &[over]).unwrap();
        let err = load_value(doc, &[], None).unwrap_err();
        assert!(err.path().starts_with("node."));
    }

    #[test]
    fn feedback_edges_are_marked_lag() {
        let mut doc = minimal_doc();
        doc["node"][0]["port_in"] = json!(["loop"]);
        doc["node"][1]["port_out"] = json!(["back"]);
        doc["edge"]
            .as_array_mut()
            .unwrap()
            .push(json!({"src": "b.back", "dst": "a.loop", "tags": ["feedback"]}));
        let system = load_value(doc, &[], None).unwrap();
        assert!(system.edges[1].lag);
    }
}
