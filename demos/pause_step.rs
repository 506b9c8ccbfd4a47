//! Pause, single-step and resume a running graph.
//!
//! The supervisor handle is the same control path the orchestrator uses;
//! here it is driven from the demo itself: pause the clock, advance two
//! ticks one at a time, resume, then stop.
//!
//! Run with: `cargo run --example pause_step`

use std::sync::Arc;
use std::time::Duration;

use stableflow::components::builtin_registry;
use stableflow::config::load_value;
use stableflow::process::ProcessSupervisor;
use stableflow::signal::ControlSignal;
use stableflow::telemetry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init();

    let doc = serde_json::json!({
        "system": {"id_system": "pause-step", "tick_period_ms": 200},
        "host": {"localhost": {"acct_run": "demo", "is_local": true}},
        "process": {"main": {"host": "localhost"}},
        "node": [
            {"id_node": "ticker", "process": "main",
             "component": "stableflow.counter", "port_out": ["out"]},
            {"id_node": "printer", "process": "main",
             "component": "stableflow.log", "port_in": ["in"]}
        ],
        "edge": [{"src": "ticker.out", "dst": "printer.in", "capacity": 4}]
    });

    let registry = builtin_registry();
    let system = Arc::new(load_value(doc, &[], Some(&registry))?);
    let (supervisor, handle) = ProcessSupervisor::build(system, "main", &registry).await?;
    let running = tokio::spawn(supervisor.run());

    tokio::time::sleep(Duration::from_millis(700)).await;
    println!("pausing");
    handle.send(ControlSignal::ControlPause);
    tokio::time::sleep(Duration::from_secs(1)).await;

    println!("two single steps");
    handle.send(ControlSignal::ControlStep);
    tokio::time::sleep(Duration::from_millis(300)).await;
    handle.send(ControlSignal::ControlStep);
    tokio::time::sleep(Duration::from_millis(300)).await;

    println!("resuming");
    handle.send(ControlSignal::ControlPause);
    tokio::time::sleep(Duration::from_millis(700)).await;

    println!("stopping");
    handle.send(ControlSignal::ExitOkControlled);
    let code = running.await?;
    println!("process exited with code {code}");
    Ok(())
}
