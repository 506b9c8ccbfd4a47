#![allow(dead_code)]

//! Document builders shared by the integration tests.

use serde_json::{json, Value};

/// Single-process, single-host document: `src → dst` over one intra-process
/// edge. Callers adjust components, cfg and edges as needed.
pub fn single_process_doc(tick_period_ms: u64) -> Value {
    json!({
        "system": {"id_system": "itest", "tick_period_ms": tick_period_ms},
        "host": {"localhost": {"acct_run": "itest", "is_local": true}},
        "process": {"main": {"host": "localhost"}},
        "node": [
            {"id_node": "src", "process": "main",
             "component": "stableflow.counter", "port_out": ["out"]},
            {"id_node": "dst", "process": "main",
             "component": "probe.capture", "port_in": ["in"]}
        ],
        "edge": [{"src": "src.out", "dst": "dst.in", "capacity": 4}]
    })
}

/// Two processes on one host connected by one inter-process edge. The
/// `base_port` must be unique per test so parallel tests do not collide.
pub fn two_process_doc(tick_period_ms: u64, ctrl_port: u16, base_port: u16) -> Value {
    json!({
        "system": {"id_system": "itest2", "tick_period_ms": tick_period_ms},
        "host": {"localhost": {
            "acct_run": "itest", "is_local": true, "ctrl_port": ctrl_port}},
        "process": {
            "pump": {"host": "localhost"},
            "sink": {"host": "localhost"}
        },
        "node": [
            {"id_node": "src", "process": "pump",
             "component": "stableflow.counter", "port_out": ["out"]},
            {"id_node": "dst", "process": "sink",
             "component": "probe.capture", "port_in": ["in"]}
        ],
        "edge": [{"src": "src.out", "dst": "dst.in", "capacity": 1}],
        "queue": {"base_port": base_port}
    })
}

/// Write a document to a temp file for the CLI / worker paths.
pub fn write_doc(doc: &Value) -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().expect("temp file");
    std::fs::write(file.path(), serde_json::to_vec_pretty(doc).expect("doc"))
        .expect("write doc");
    file
}
