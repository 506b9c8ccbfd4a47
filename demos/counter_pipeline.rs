//! Minimal two-node pipeline inside one process.
//!
//! A counter emits its tick index on every tick; a log sink prints whatever
//! arrives. The counter stops the system after 25 values by raising
//! `exit_ok_controlled`, which drains the edge before the process exits.
//!
//! Run with: `cargo run --example counter_pipeline`

use std::sync::Arc;

use stableflow::components::builtin_registry;
use stableflow::config::SystemBuilder;
use stableflow::process::ProcessSupervisor;
use stableflow::telemetry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init();

    let registry = builtin_registry();
    let system = SystemBuilder::new("counter-pipeline")
        .tick_period_ms(100)
        .local_host("localhost", "demo")
        .process("main", "localhost")
        .node("ticker", "main", "stableflow.counter")
        .node_cfg(serde_json::json!({"emit": 25}))
        .outputs(["out"])
        .node("printer", "main", "stableflow.log")
        .inputs(["in"])
        .connect("ticker.out", "printer.in")
        .capacity(4)
        .compile(Some(&registry))?;

    let system = Arc::new(system);
    let (supervisor, _handle) = ProcessSupervisor::build(system, "main", &registry).await?;
    let code = supervisor.run().await;
    println!("process exited with code {code}");
    Ok(())
}
