mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use serde_json::json;
use stableflow::config::load_value;
use stableflow::host::HostOptions;
use stableflow::orchestrator::{send_control, Orchestrator};
use stableflow::signal::ControlSignal;

const WORKER_BIN: &str = env!("CARGO_BIN_EXE_stableflow");

fn options(file: &tempfile::NamedTempFile) -> HostOptions {
    let mut opts = HostOptions::new(file.path());
    opts.worker_cmd = WORKER_BIN.into();
    opts
}

/// A self-stopping two-process system: the producer finishes after thirty
/// envelopes, the sibling is wound down, and the system reports success.
#[tokio::test]
async fn two_worker_system_exits_zero() {
    let mut doc = two_process_doc(10, 47420, 47440);
    doc["node"][0]["cfg"] = json!({"emit": 30});
    doc["node"][1]["component"] = json!("stableflow.log");
    let file = write_doc(&doc);
    let system = Arc::new(load_value(doc, &[], None).unwrap());

    let orchestrator = Orchestrator::start(system, options(&file))
        .await
        .expect("system started");
    let code = tokio::time::timeout(Duration::from_secs(60), orchestrator.wait())
        .await
        .expect("system finished");
    assert_eq!(code, 0);
}

/// A component fault on one worker escalates: the owning process exits 1,
/// the sibling receives `exit_ex_controlled`, and the system reports 1.
#[tokio::test]
async fn component_fault_fails_the_whole_system() {
    let mut doc = two_process_doc(20, 47450, 47470);
    doc["node"][1]["component"] = json!("stableflow.fault_at");
    doc["node"][1]["cfg"] = json!({"at": 5});
    let file = write_doc(&doc);
    let system = Arc::new(load_value(doc, &[], None).unwrap());

    let orchestrator = Orchestrator::start(system, options(&file))
        .await
        .expect("system started");
    let code = tokio::time::timeout(Duration::from_secs(60), orchestrator.wait())
        .await
        .expect("system finished");
    assert_eq!(code, 1);
}

/// A detached invocation reaches a running system through its control
/// endpoint and stops it.
#[tokio::test]
async fn detached_stop_reaches_a_running_system() {
    let mut doc = two_process_doc(10, 47480, 47500);
    doc["node"][1]["component"] = json!("stableflow.log");
    let file = write_doc(&doc);
    let system = Arc::new(load_value(doc, &[], None).unwrap());

    let orchestrator = Orchestrator::start(system.clone(), options(&file))
        .await
        .expect("system started");
    let waiting = tokio::spawn(orchestrator.wait());

    // Give the workers time to attach before stopping the system the same
    // way `stableflow stop <cfg>` would.
    tokio::time::sleep(Duration::from_secs(2)).await;
    send_control(&system, ControlSignal::ExitOkControlled)
        .await
        .expect("control endpoint reachable");

    let code = tokio::time::timeout(Duration::from_secs(60), waiting)
        .await
        .expect("system finished")
        .unwrap();
    assert_eq!(code, 0);
}
