//! Structural and graph validation over the denormalized parts.
//!
//! Checks run in two phases: [`check_structure`] before edge-kind inference
//! (references, accounts, port uniqueness, tag well-formedness), and
//! [`check_graph`] after it (inter-host fan-out, acyclicity over non-feedback
//! edges). The first violation is reported as a [`ConfigError`] naming the
//! offending path; `check_graph` additionally returns the topological node
//! order used for shutdown sequencing.

use std::collections::HashSet;

use rustc_hash::{FxHashMap, FxHashSet};

use super::model::{EdgeDef, EdgeKind, HostDef, NodeDef, ProcessDef};
use super::ConfigError;

pub(crate) fn check_structure(
    hosts: &[HostDef],
    processes: &[ProcessDef],
    nodes: &[NodeDef],
    edges: &[EdgeDef],
) -> Result<(), ConfigError> {
    if hosts.is_empty() {
        return Err(ConfigError::at("host", "at least one host is required"));
    }
    if !hosts.iter().any(|h| h.is_local) {
        return Err(ConfigError::at("host", "no host is marked local"));
    }
    for host in hosts {
        if host.acct_run.is_empty() {
            return Err(ConfigError::at(
                format!("host.{}.acct_run", host.id_host),
                "host has no account to run under",
            ));
        }
    }

    for process in processes {
        if hosts.iter().all(|h| h.id_host != process.host) {
            return Err(ConfigError::at(
                format!("process.{}.host", process.id_process),
                format!("unknown host `{}`", process.host),
            ));
        }
        if nodes.iter().all(|n| n.process != process.id_process) {
            return Err(ConfigError::at(
                format!("process.{}", process.id_process),
                "process contains no nodes",
            ));
        }
    }

    let mut node_ids: FxHashSet<&str> = FxHashSet::default();
    for (index, node) in nodes.iter().enumerate() {
        if node.id_node.is_empty() {
            return Err(ConfigError::at(
                format!("node.{index}.id_node"),
                "node id is empty",
            ));
        }
        if !node_ids.insert(&node.id_node) {
            return Err(ConfigError::at(
                format!("node.{index}.id_node"),
                format!("duplicate node id `{}`", node.id_node),
            ));
        }
        if processes.iter().all(|p| p.id_process != node.process) {
            return Err(ConfigError::at(
                format!("node.{index}.process"),
                format!("unknown process `{}`", node.process),
            ));
        }
        check_port_names(&node.port_in, index, "port_in")?;
        check_port_names(&node.port_out, index, "port_out")?;
    }

    // Input ports have exactly one producer.
    let mut consumed: FxHashSet<(&str, &str)> = FxHashSet::default();
    for (index, edge) in edges.iter().enumerate() {
        for (tag_index, tag) in edge.tags.iter().enumerate() {
            if tag.is_empty() {
                return Err(ConfigError::at(
                    format!("edge.{index}.tags.{tag_index}"),
                    "empty tag",
                ));
            }
            if edge.tags[..tag_index].contains(tag) {
                return Err(ConfigError::at(
                    format!("edge.{index}.tags.{tag_index}"),
                    format!("duplicate tag `{tag}`"),
                ));
            }
        }
        let src_node = nodes.iter().find(|n| n.id_node == edge.src.node);
        let Some(src_node) = src_node else {
            return Err(ConfigError::at(
                format!("edge.{index}.src"),
                format!("unknown node `{}`", edge.src.node),
            ));
        };
        if !src_node.port_out.contains(&edge.src.port) {
            return Err(ConfigError::at(
                format!("edge.{index}.src"),
                format!("node `{}` has no output port `{}`", edge.src.node, edge.src.port),
            ));
        }
        let dst_node = nodes.iter().find(|n| n.id_node == edge.dst.node);
        let Some(dst_node) = dst_node else {
            return Err(ConfigError::at(
                format!("edge.{index}.dst"),
                format!("unknown node `{}`", edge.dst.node),
            ));
        };
        if edge.dst.port == "ctrl" {
            return Err(ConfigError::at(
                format!("edge.{index}.dst"),
                "the ctrl port is fed by the tick generator, not by edges",
            ));
        }
        if !dst_node.port_in.contains(&edge.dst.port) {
            return Err(ConfigError::at(
                format!("edge.{index}.dst"),
                format!("node `{}` has no input port `{}`", edge.dst.node, edge.dst.port),
            ));
        }
        if !consumed.insert((&edge.dst.node, &edge.dst.port)) {
            return Err(ConfigError::at(
                format!("edge.{index}.dst"),
                format!("input port `{}` already has a producer", edge.dst),
            ));
        }
    }
    Ok(())
}

fn check_port_names(ports: &[String], index: usize, field: &str) -> Result<(), ConfigError> {
    let mut seen: HashSet<&str> = HashSet::new();
    for (port_index, port) in ports.iter().enumerate() {
        if port.is_empty() {
            return Err(ConfigError::at(
                format!("node.{index}.{field}.{port_index}"),
                "empty port name",
            ));
        }
        if !seen.insert(port) {
            return Err(ConfigError::at(
                format!("node.{index}.{field}.{port_index}"),
                format!("duplicate port name `{port}`"),
            ));
        }
    }
    Ok(())
}

/// Graph-level checks after kind inference. Returns the topological order of
/// node ids over non-feedback edges.
pub(crate) fn check_graph(
    nodes: &[NodeDef],
    edges: &[EdgeDef],
) -> Result<Vec<String>, ConfigError> {
    // Multi-consumer fan-out over the inter-host transport is undefined;
    // such configs are rejected until the semantics are fixed.
    let mut inter_host_out: FxHashMap<(&str, &str), usize> = FxHashMap::default();
    for (index, edge) in edges.iter().enumerate() {
        if !edge.kind.is_inter_host() {
            continue;
        }
        let key = (edge.src.node.as_str(), edge.src.port.as_str());
        if let Some(first) = inter_host_out.insert(key, index) {
            return Err(ConfigError::at(
                format!("edge.{index}"),
                format!(
                    "output port `{}` already feeds inter-host edge {first}; \
                     inter-host fan-out is not supported",
                    edge.src
                ),
            ));
        }
    }

    // Back-edges are legal only when tagged as feedback; everything else
    // must topologically order (Kahn, stable in document order).
    let position: FxHashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(index, node)| (node.id_node.as_str(), index))
        .collect();
    let mut indegree = vec![0usize; nodes.len()];
    let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for edge in edges {
        if edge.lag {
            continue;
        }
        let src = position[edge.src.node.as_str()];
        let dst = position[edge.dst.node.as_str()];
        indegree[dst] += 1;
        outgoing[src].push(dst);
    }

    let mut ready: Vec<usize> = (0..nodes.len()).filter(|&i| indegree[i] == 0).collect();
    let mut topo = Vec::with_capacity(nodes.len());
    while let Some(next) = ready.iter().copied().min() {
        ready.retain(|&i| i != next);
        topo.push(nodes[next].id_node.clone());
        for &dst in &outgoing[next] {
            indegree[dst] -= 1;
            if indegree[dst] == 0 {
                ready.push(dst);
            }
        }
    }
    if topo.len() != nodes.len() {
        let in_cycle: FxHashSet<&str> = nodes
            .iter()
            .filter(|node| !topo.contains(&node.id_node))
            .map(|node| node.id_node.as_str())
            .collect();
        let offending = edges
            .iter()
            .position(|edge| {
                !edge.lag
                    && in_cycle.contains(edge.src.node.as_str())
                    && in_cycle.contains(edge.dst.node.as_str())
            })
            .unwrap_or(0);
        return Err(ConfigError::at(
            format!("edge.{offending}"),
            "intra-tick cycle; tag the back-edge as feedback to introduce a one-tick lag",
        ));
    }
    Ok(topo)
}

#[cfg(test)]
mod tests {
    use super::super::loader::load_value;
    use serde_json::json;

    fn doc() -> serde_json::Value {
        json!({
            "host": {"localhost": {"acct_run": "alice", "is_local": true}},
            "process": {"main": {"host": "localhost"}},
            "node": [
                {"id_node": "a", "process": "main",
                 "component": "stableflow.counter", "port_out": ["out"]},
                {"id_node": "b", "process": "main",
                 "component": "stableflow.relay",
                 "port_in": ["in"], "port_out": ["out"]}
            ],
            "edge": [{"src": "a.out", "dst": "b.in"}]
        })
    }

    #[test]
    fn missing_local_host_is_rejected() {
        let mut d = doc();
        d["host"]["localhost"]["is_local"] = json!(false);
        let err = load_value(d, &[], None).unwrap_err();
        assert_eq!(err.path(), "host");
    }

    #[test]
    fn missing_account_is_rejected() {
        let mut d = doc();
        d["host"]["localhost"]["acct_run"] = json!("");
        let err = load_value(d, &[], None).unwrap_err();
        assert_eq!(err.path(), "host.localhost.acct_run");
    }

    #[test]
    fn unknown_edge_port_is_rejected() {
        let mut d = doc();
        d["edge"][0]["dst"] = json!("b.nope");
        let err = load_value(d, &[], None).unwrap_err();
        assert_eq!(err.path(), "edge.0.dst");
    }

    #[test]
    fn edge_into_ctrl_port_is_rejected() {
        let mut d = doc();
        d["edge"][0]["dst"] = json!("b.ctrl");
        let err = load_value(d, &[], None).unwrap_err();
        assert_eq!(err.path(), "edge.0.dst");
    }

    #[test]
    fn second_producer_for_one_input_is_rejected() {
        let mut d = doc();
        d["node"][1]["port_out"] = json!(["out", "alt"]);
        d["edge"].as_array_mut().unwrap().push(json!({"src": "b.alt", "dst": "b.in"}));
        let err = load_value(d, &[], None).unwrap_err();
        assert_eq!(err.path(), "edge.1.dst");
    }

    #[test]
    fn untagged_cycle_is_rejected() {
        let mut d = doc();
        d["node"][0]["port_in"] = json!(["loop"]);
        d["edge"].as_array_mut().unwrap().push(json!({"src": "b.out", "dst": "a.loop"}));
        let err = load_value(d, &[], None).unwrap_err();
        assert!(err.path().starts_with("edge."));
        assert!(err.reason().contains("cycle"));
    }

    #[test]
    fn feedback_tag_permits_the_cycle() {
        let mut d = doc();
        d["node"][0]["port_in"] = json!(["loop"]);
        d["edge"]
            .as_array_mut()
            .unwrap()
            .push(json!({"src": "b.out", "dst": "a.loop", "tags": ["feedback"]}));
        let system = load_value(d, &[], None).unwrap();
        assert_eq!(system.topo, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn inter_host_fan_out_is_rejected() {
        let mut d = doc();
        d["host"]["remote"] = json!({"addr": "10.1.1.1", "acct_run": "svc"});
        d["process"]["p2"] = json!({"host": "remote"});
        d["process"]["p3"] = json!({"host": "remote"});
        d["node"].as_array_mut().unwrap().push(json!(
            {"id_node": "c", "process": "p2",
             "component": "stableflow.log", "port_in": ["in"]}));
        d["node"].as_array_mut().unwrap().push(json!(
            {"id_node": "d", "process": "p3",
             "component": "stableflow.log", "port_in": ["in"]}));
        d["edge"].as_array_mut().unwrap().push(json!({"src": "a.out", "dst": "c.in"}));
        d["edge"].as_array_mut().unwrap().push(json!({"src": "a.out", "dst": "d.in"}));
        let err = load_value(d, &[], None).unwrap_err();
        assert_eq!(err.path(), "edge.2");
    }

    #[test]
    fn declared_kind_must_match_locality() {
        let mut d = doc();
        d["edge"][0]["kind"] = json!("inter_host_server");
        let err = load_value(d, &[], None).unwrap_err();
        assert_eq!(err.path(), "edge.0.kind");
    }
}
