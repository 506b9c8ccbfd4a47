mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use serde_json::json;
use stableflow::config::load_value;
use stableflow::process::ProcessSupervisor;
use stableflow::signal::ControlSignal;

/// Tick alignment: a counter feeds its tick index into a capture sink; after
/// ten ticks the sink has observed 0..=9 in order and the process exits
/// cleanly.
#[tokio::test]
async fn tick_indices_arrive_aligned_and_in_order() {
    let (registry, probes) = probe_registry();
    let mut doc = single_process_doc(5);
    doc["node"][0]["cfg"] = json!({"emit": 10});
    // Generous capacity so the producer never blocks and never skips ticks.
    doc["edge"][0]["capacity"] = json!(16);
    let system = Arc::new(load_value(doc, &[], Some(&registry)).unwrap());

    let (supervisor, _handle) = ProcessSupervisor::build(system, "main", &registry)
        .await
        .unwrap();
    let code = tokio::time::timeout(Duration::from_secs(10), supervisor.run())
        .await
        .expect("process finished");
    assert_eq!(code, 0);

    let expected: Vec<serde_json::Value> = (0..10u64).map(|idx| json!(idx)).collect();
    assert_eq!(probes.captured(), expected);
}

/// Inter-process drain: the producer pushes one hundred envelopes through a
/// length-1 queue, then stops; the consumer receives every one of them
/// before it observes closure, and both processes exit 0.
#[tokio::test]
async fn inter_process_edge_drains_completely() {
    let (registry, probes) = probe_registry();
    let mut doc = two_process_doc(5, 47310, 47330);
    doc["node"][0]["cfg"] = json!({"emit": 100});
    let system = Arc::new(load_value(doc, &[], Some(&registry)).unwrap());

    // Consumer first, so its endpoint is bound before the producer dials.
    let (sink, _sink_handle) = ProcessSupervisor::build(system.clone(), "sink", &registry)
        .await
        .unwrap();
    let (pump, _pump_handle) = ProcessSupervisor::build(system, "pump", &registry)
        .await
        .unwrap();

    let sink_task = tokio::spawn(sink.run());
    let pump_task = tokio::spawn(pump.run());
    let pump_code = tokio::time::timeout(Duration::from_secs(30), pump_task)
        .await
        .expect("pump finished")
        .unwrap();
    let sink_code = tokio::time::timeout(Duration::from_secs(30), sink_task)
        .await
        .expect("sink finished")
        .unwrap();
    assert_eq!((pump_code, sink_code), (0, 0));

    let captured = probes.captured();
    assert_eq!(captured.len(), 100, "every pushed envelope was delivered");
    // Backpressure may make the producer skip ticks, so indices can gap,
    // but per-edge FIFO keeps them strictly ascending.
    let values: Vec<u64> = captured.iter().map(|v| v.as_u64().unwrap()).collect();
    assert!(values.windows(2).all(|w| w[0] < w[1]));
}

/// Pause/step gating: after `control_pause` no tick begins; `control_step`
/// fires exactly one; resuming restores the clock.
#[tokio::test]
async fn pause_gates_ticks_and_step_advances_one() {
    let (registry, probes) = probe_registry();
    let doc = json!({
        "system": {"id_system": "pause", "tick_period_ms": 100},
        "host": {"localhost": {"acct_run": "itest", "is_local": true}},
        "process": {"main": {"host": "localhost"}},
        "node": [{"id_node": "ticker", "process": "main",
                  "component": "probe.tick_count"}],
        "edge": []
    });
    let system = Arc::new(load_value(doc, &[], Some(&registry)).unwrap());
    let (supervisor, handle) = ProcessSupervisor::build(system, "main", &registry)
        .await
        .unwrap();
    let running = tokio::spawn(supervisor.run());

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(handle.send(ControlSignal::ControlPause));
    // Let a tick already in flight settle before sampling.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let at_pause = probes.tick_count();
    assert!(at_pause >= 2);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(probes.tick_count(), at_pause, "no tick begins while paused");

    assert!(handle.send(ControlSignal::ControlStep));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(probes.tick_count(), at_pause + 1, "step advances exactly one tick");

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(probes.tick_count(), at_pause + 1, "still paused after the step");

    // Second pause is the resume.
    assert!(handle.send(ControlSignal::ControlPause));
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(probes.tick_count() > at_pause + 1, "clock resumed");

    assert!(handle.send(ControlSignal::ExitOkControlled));
    let code = tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("process finished")
        .unwrap();
    assert_eq!(code, 0);
}

/// `control_reset` re-runs component initialization with queues in place.
#[tokio::test]
async fn reset_reinitializes_components() {
    let (registry, probes) = probe_registry();
    let doc = json!({
        "system": {"id_system": "reset", "tick_period_ms": 10},
        "host": {"localhost": {"acct_run": "itest", "is_local": true}},
        "process": {"main": {"host": "localhost"}},
        "node": [{"id_node": "ticker", "process": "main",
                  "component": "probe.reset_count"}],
        "edge": []
    });
    let system = Arc::new(load_value(doc, &[], Some(&registry)).unwrap());
    let (supervisor, handle) = ProcessSupervisor::build(system, "main", &registry)
        .await
        .unwrap();
    let running = tokio::spawn(supervisor.run());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(probes.reset_count(), 1, "initialized once at start");

    assert!(handle.send(ControlSignal::ControlReset));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(probes.reset_count(), 2, "reset re-ran initialization");

    assert!(handle.send(ControlSignal::ExitOkControlled));
    let code = tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("process finished")
        .unwrap();
    assert_eq!(code, 0);
}
