//! # Stableflow: Configuration-Driven Dataflow Runtime
//!
//! Stableflow instantiates a graph of computational **nodes** from a
//! declarative system description, wires them together with **queues** that
//! may cross process and host boundaries, and drives them through a
//! tick-based control loop under a uniform **control-signal protocol**.
//!
//! ## Core Concepts
//!
//! - **System document**: a JSON description of hosts, processes, nodes and
//!   edges, loaded with dot-path overrides, denormalized and validated into
//!   an immutable [`config::System`]
//! - **Envelope**: the `{ena, ts, list}` record carried on every port each
//!   tick ([`envelope::TickEnvelope`])
//! - **Edict component**: user logic conforming to the per-tick
//!   gather/invoke/dispatch contract ([`component::Edict`])
//! - **Queues**: intra-process buffers and TCP link halves behind one
//!   push/pop contract ([`queues::EdgeQueue`])
//! - **Control signals**: a closed enumeration carried out-of-band to start,
//!   pause, step, reset and shut a running graph down ([`signal::ControlSignal`])
//!
//! ## Quick Start
//!
//! ### Describing and loading a system
//!
//! ```
//! use stableflow::components::builtin_registry;
//! use stableflow::config::{load_value, Override};
//!
//! let doc = serde_json::json!({
//!     "system": {"id_system": "demo", "tick_period_ms": 10},
//!     "host": {"localhost": {"acct_run": "demo", "is_local": true}},
//!     "process": {"main": {"host": "localhost"}},
//!     "node": [
//!         {"id_node": "ticker", "process": "main",
//!          "component": "stableflow.counter",
//!          "cfg": {"emit": 25}, "port_out": ["out"]},
//!         {"id_node": "sink", "process": "main",
//!          "component": "stableflow.log", "port_in": ["in"]}
//!     ],
//!     "edge": [{"src": "ticker.out", "dst": "sink.in"}]
//! });
//!
//! let registry = builtin_registry();
//! let over = Override::parse("node.0.cfg.emit=50").unwrap();
//! let system = load_value(doc, &[over], Some(&registry)).unwrap();
//!
//! // The loader injected the implicit ctrl port and inferred the edge kind.
//! assert_eq!(system.node("sink").unwrap().port_in[0], "ctrl");
//! assert_eq!(system.edges[0].class, "queue.intra_process");
//! ```
//!
//! ### Running a process
//!
//! ```no_run
//! use std::sync::Arc;
//! use stableflow::components::builtin_registry;
//! use stableflow::config::load_path;
//! use stableflow::process::ProcessSupervisor;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = builtin_registry();
//! let system = Arc::new(load_path("system.json".as_ref(), &[], Some(&registry))?);
//! let (supervisor, handle) = ProcessSupervisor::build(system, "main", &registry).await?;
//!
//! // The handle delivers control signals while the supervisor runs.
//! let code = supervisor.run().await;
//! assert_eq!(code, 0);
//! # drop(handle);
//! # Ok(())
//! # }
//! ```
//!
//! Whole systems — multiple processes, multiple hosts — go through
//! [`orchestrator::Orchestrator`], which spawns one worker process per
//! process definition and owns the global control surface. The `stableflow`
//! binary is a thin shell over it.
//!
//! ## Writing Components
//!
//! ```
//! use async_trait::async_trait;
//! use stableflow::component::{Edict, EdictContext, EdictFault, PortMap};
//! use stableflow::signal::ControlSignal;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Edict for Echo {
//!     async fn reset(&mut self, _ctx: &EdictContext) -> Result<(), EdictFault> {
//!         Ok(())
//!     }
//!
//!     async fn step(
//!         &mut self,
//!         _ctx: &EdictContext,
//!         inputs: &PortMap,
//!         outputs: &mut PortMap,
//!     ) -> Result<ControlSignal, EdictFault> {
//!         if let Some(input) = inputs.get("in") {
//!             if input.ena {
//!                 if let Some(out) = outputs.get_mut("out") {
//!                     out.ena = true;
//!                     out.list.extend(input.list.iter().cloned());
//!                 }
//!             }
//!         }
//!         Ok(ControlSignal::ContinueOk)
//!     }
//! }
//! ```
//!
//! Components are registered under string paths
//! ([`component::ComponentRegistry`]) and referenced from the document by
//! that path; `outputs` arrives reset on every tick, and only ports left
//! with `ena == true` are dispatched downstream.
//!
//! ## Module Guide
//!
//! - [`config`] - Document loading, overrides, denormalization, validation
//! - [`envelope`] - Tick envelopes and their wire encoding
//! - [`component`] - The edict contract and the component registry
//! - [`components`] - Built-in components (counter, relay, sinks)
//! - [`queues`] - Intra-process, inter-process and inter-host queues
//! - [`node`] - The per-tick node runtime
//! - [`process`] - The process supervisor and tick generator
//! - [`host`] - The host controller and worker protocol
//! - [`orchestrator`] - The system-level control surface
//! - [`signal`] - Control signals, run states and exit codes
//! - [`control`] - Control frames and the in-process control bus
//! - [`error`] - The runtime error taxonomy and error sink
//! - [`telemetry`] - Tracing setup

pub mod component;
pub mod components;
pub mod config;
pub mod control;
pub mod envelope;
pub mod error;
pub mod host;
pub mod node;
pub mod orchestrator;
pub mod process;
pub mod queues;
pub mod signal;
pub mod telemetry;
