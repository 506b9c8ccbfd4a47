//! The process supervisor: one operating-system process worth of nodes.
//!
//! A [`ProcessSupervisor`] owns everything inside one configured process: it
//! constructs the queue endpoints its edges require, instantiates the nodes
//! through the component registry, runs the process tick generator, and
//! multiplexes control between the parent (host controller or test harness),
//! the operating system's signal handlers and the nodes themselves.
//!
//! Shutdown follows the drain protocol: on a draining `exit_*` signal the
//! supervisor stops tick generation, signals every node, then waits for the
//! drain cascade to complete under a hard deadline — as each node stops, its
//! outbound queues close, which is what lets the next node downstream
//! observe end-of-stream and stop in turn. Outbound link clients are drained
//! last so every acknowledged envelope reaches the peer process, and
//! anything still unacknowledged at the deadline is logged as dropped.
//! `exit_ex_immediate` skips all of that and tears the process down.

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::component::{ComponentRegistry, EdictContext};
use crate::config::{ConfigError, StateType, System};
use crate::envelope::TickStamp;
use crate::error::{ErrorRecord, RuntimeError};
use crate::node::{InputBinding, NodeEvent, NodeHarness, NodeRuntime, OutputBinding};
use crate::queues::{EdgeQueue, IntraQueue, LinkClient, LinkServer, Reconnect};
use crate::signal::{ControlSignal, RunState};

/// Hard deadline for the drain sequence on a controlled exit.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(2);

/// Control entry point into a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    control: flume::Sender<ControlSignal>,
}

impl SupervisorHandle {
    /// Deliver a control signal. Returns `false` once the supervisor has
    /// stopped listening.
    pub fn send(&self, signal: ControlSignal) -> bool {
        self.control.send(signal).is_ok()
    }
}

struct NodeSlot {
    id_node: String,
    runtime: NodeRuntime,
    harness: NodeHarness,
}

/// Supervisor for one configured process.
pub struct ProcessSupervisor {
    system: Arc<System>,
    id_process: String,
    nodes: Vec<NodeSlot>,
    /// Producer halves of link edges leaving this process, by config path.
    clients: Vec<(String, Arc<LinkClient>)>,
    /// Every queue endpoint this process holds, for final closing.
    queues: Vec<Arc<dyn EdgeQueue>>,
    /// Outbound queues per node, closed as the node stops during drain.
    outbound: FxHashMap<String, Vec<Arc<dyn EdgeQueue>>>,
    events: flume::Receiver<NodeEvent>,
    control: flume::Receiver<ControlSignal>,
}

impl ProcessSupervisor {
    /// Construct queue endpoints and nodes for `id_process`.
    ///
    /// Consumer halves of link edges bind their endpoints here, so on-host
    /// peers can dial in as soon as this returns.
    pub async fn build(
        system: Arc<System>,
        id_process: &str,
        registry: &ComponentRegistry,
    ) -> Result<(Self, SupervisorHandle), RuntimeError> {
        if system.process(id_process).is_none() {
            return Err(RuntimeError::ConfigInvalid(ConfigError::at(
                format!("process.{id_process}"),
                "unknown process",
            )));
        }

        let mut input_map: FxHashMap<(String, String), Arc<dyn EdgeQueue>> = FxHashMap::default();
        let mut output_map: FxHashMap<(String, String), Vec<Arc<dyn EdgeQueue>>> =
            FxHashMap::default();
        let mut clients = Vec::new();
        let mut queues: Vec<Arc<dyn EdgeQueue>> = Vec::new();
        let mut outbound: FxHashMap<String, Vec<Arc<dyn EdgeQueue>>> = FxHashMap::default();

        for (index, edge) in system.edges_of_process(id_process) {
            let path = format!("edge.{index}");
            let src_local = system
                .node(&edge.src.node)
                .is_some_and(|n| n.process == id_process);
            let dst_local = system
                .node(&edge.dst.node)
                .is_some_and(|n| n.process == id_process);

            if src_local && dst_local {
                let queue: Arc<IntraQueue> = Arc::new(if edge.lag {
                    IntraQueue::primed(edge.capacity)
                } else {
                    IntraQueue::bounded(edge.capacity)
                });
                input_map.insert(
                    (edge.dst.node.clone(), edge.dst.port.clone()),
                    queue.clone(),
                );
                output_map
                    .entry((edge.src.node.clone(), edge.src.port.clone()))
                    .or_default()
                    .push(queue.clone());
                outbound
                    .entry(edge.src.node.clone())
                    .or_default()
                    .push(queue.clone());
                queues.push(queue);
            } else {
                let endpoint = edge.endpoint.as_deref().ok_or_else(|| {
                    RuntimeError::ConfigInvalid(ConfigError::at(
                        format!("{path}.endpoint"),
                        "link edge has no endpoint",
                    ))
                })?;
                if dst_local {
                    let server = if edge.lag {
                        LinkServer::bind_primed(endpoint, edge.capacity).await
                    } else {
                        LinkServer::bind(endpoint, edge.capacity).await
                    }
                    .map_err(|err| RuntimeError::from_queue(path.clone(), err))?;
                    let server: Arc<dyn EdgeQueue> = Arc::new(server);
                    input_map.insert(
                        (edge.dst.node.clone(), edge.dst.port.clone()),
                        server.clone(),
                    );
                    queues.push(server);
                } else {
                    let policy = if edge.kind.is_inter_host() {
                        Reconnect::backoff_default()
                    } else {
                        Reconnect::Never
                    };
                    let client = Arc::new(LinkClient::new(endpoint, edge.capacity, policy));
                    output_map
                        .entry((edge.src.node.clone(), edge.src.port.clone()))
                        .or_default()
                        .push(client.clone() as Arc<dyn EdgeQueue>);
                    // Not part of the in-process close cascade: clients are
                    // drained (acks awaited, close marker last) after every
                    // node has stopped.
                    clients.push((path, client.clone()));
                    queues.push(client);
                }
            }
        }

        let (events_tx, events_rx) = flume::unbounded();
        let (control_tx, control_rx) = flume::unbounded();
        let mut nodes = Vec::new();
        for def in system.nodes_of(id_process) {
            let component = registry.build(&def.component, &def.cfg).map_err(|fault| {
                RuntimeError::ComponentFault {
                    id_node: def.id_node.clone(),
                    message: fault.message,
                }
            })?;
            let ctx = EdictContext {
                id_node: def.id_node.clone(),
                cfg: def.cfg.clone(),
                tick_period: system.tick_period,
            };
            let input_bindings = def
                .data_inputs()
                .filter_map(|port| {
                    input_map
                        .remove(&(def.id_node.clone(), port.to_string()))
                        .map(|queue| InputBinding::new(port, queue))
                })
                .collect();
            let output_bindings = def
                .port_out
                .iter()
                .filter_map(|port| {
                    output_map
                        .remove(&(def.id_node.clone(), port.clone()))
                        .map(|queues| OutputBinding::new(port.clone(), queues))
                })
                .collect();
            // Stateless nodes get a fresh component instance on every reset.
            let rebuild = match def.state_type {
                StateType::Stateless => registry.factory(&def.component),
                StateType::Stateful => None,
            };
            let (runtime, harness) = NodeRuntime::new(
                def.id_node.clone(),
                component,
                ctx,
                &def.port_in,
                &def.port_out,
                input_bindings,
                output_bindings,
                events_tx.clone(),
                system.gather_budget,
                system.tick_budget,
                rebuild,
            );
            nodes.push(NodeSlot {
                id_node: def.id_node.clone(),
                runtime,
                harness,
            });
        }

        Ok((
            Self {
                system,
                id_process: id_process.to_string(),
                nodes,
                clients,
                queues,
                outbound,
                events: events_rx,
                control: control_rx,
            },
            SupervisorHandle {
                control: control_tx,
            },
        ))
    }

    /// Run the process to completion and return its exit code.
    #[instrument(skip_all, fields(id_process = %self.id_process))]
    pub async fn run(mut self) -> i32 {
        let mut tasks: Vec<(String, JoinHandle<ControlSignal>)> = Vec::new();
        let mut controls: Vec<(String, flume::Sender<ControlSignal>)> = Vec::new();
        let mut tick_senders: Vec<flume::Sender<TickStamp>> = Vec::new();
        for slot in std::mem::take(&mut self.nodes) {
            controls.push((slot.id_node.clone(), slot.harness.control.clone()));
            tick_senders.push(slot.harness.ticks.clone());
            tasks.push((slot.id_node, tokio::spawn(slot.runtime.run())));
        }
        info!(nodes = tasks.len(), "process started");

        let (paused_tx, paused_rx) = watch::channel(false);
        let (step_tx, step_rx) = flume::unbounded::<()>();
        let pacer = tokio::spawn(pacer(self.system.tick_period, tick_senders, paused_rx, step_rx));

        let mut state = RunState::Stopped.started();
        let mut first_error: Option<ErrorRecord> = None;
        let signal = loop {
            let signal = tokio::select! {
                ctrl = self.control.recv_async() => match ctrl {
                    Ok(signal) => signal,
                    // Parent is gone; wind down cleanly.
                    Err(_) => break ControlSignal::ExitOkControlled,
                },
                event = self.events.recv_async() => match event {
                    Ok(event) => {
                        if let Some(error) = &event.error {
                            warn!(id_node = %event.id_node, error = %error, "node escalated");
                            if first_error.is_none() {
                                first_error = Some(error.to_record());
                            }
                        }
                        event.signal
                    }
                    Err(_) => break ControlSignal::ExitOkControlled,
                },
            };
            match signal {
                ControlSignal::ContinueOk => {}
                ControlSignal::ControlPause => {
                    state = state.apply(signal);
                    let _ = paused_tx.send(state == RunState::Paused);
                    debug!(%state, "pause toggled");
                }
                ControlSignal::ControlStep => {
                    let _ = step_tx.send(());
                }
                ControlSignal::ControlReset => {
                    debug!("re-initializing components");
                    for (_, control) in &controls {
                        let _ = control.send(ControlSignal::ControlReset);
                    }
                }
                exit => break exit,
            }
        };

        pacer.abort();
        if signal == ControlSignal::ExitExImmediate {
            for (_, task) in &tasks {
                task.abort();
            }
            for queue in &self.queues {
                queue.close();
            }
            return signal.exit_code();
        }

        // Stop signals go out in reverse topological order; the drain
        // cascade then completes source-to-sink, each node's outbound
        // queues closing as it stops so end-of-stream propagates downstream.
        let topo = self.system.topo_of(&self.id_process);
        for id_node in topo.iter().rev() {
            if let Some((_, control)) = controls.iter().find(|(id, _)| id == id_node) {
                let _ = control.send(signal);
            }
        }
        let deadline = Instant::now() + DRAIN_DEADLINE;
        for id_node in topo {
            let Some(position) = tasks.iter().position(|(id, _)| *id == id_node) else {
                continue;
            };
            let (id_node, task) = tasks.remove(position);
            let abort = task.abort_handle();
            match tokio::time::timeout_at(deadline, task).await {
                Ok(_) => debug!(%id_node, "node stopped"),
                Err(_) => {
                    warn!(%id_node, "drain deadline hit, stopping node; buffered output dropped");
                    abort.abort();
                }
            }
            if let Some(queues) = self.outbound.get(&id_node) {
                for queue in queues {
                    queue.close();
                }
            }
        }
        for (_, task) in &tasks {
            task.abort();
        }

        for (path, client) in &self.clients {
            if let Err(err) = client.drain(deadline).await {
                warn!(edge = %path, error = %err, "unacknowledged envelopes dropped during drain");
            }
        }
        for queue in &self.queues {
            queue.close();
        }

        if let Some(record) = first_error {
            if let Err(err) = self.system.error_sink.write(&record) {
                warn!(error = %err, "cannot write error record");
            }
        }
        info!(%signal, code = signal.exit_code(), "process stopped");
        signal.exit_code()
    }
}

/// The process tick generator. Offers each tick to every node through its
/// bounded tick channel; a node still busy with the previous tick misses the
/// offer and observes a gap in `idx` rather than a backlog. Pausing stops
/// the clock; a step pulse fires exactly one tick while paused.
async fn pacer(
    period: Duration,
    ticks: Vec<flume::Sender<TickStamp>>,
    mut paused: watch::Receiver<bool>,
    steps: flume::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut idx: u64 = 0;
    loop {
        if *paused.borrow() {
            tokio::select! {
                pulse = steps.recv_async() => {
                    if pulse.is_err() {
                        return;
                    }
                    fire(&ticks, &mut idx);
                }
                changed = paused.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    interval.reset();
                }
            }
            continue;
        }
        tokio::select! {
            _ = interval.tick() => fire(&ticks, &mut idx),
            changed = paused.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            // A step while running is a no-op.
            pulse = steps.recv_async() => {
                if pulse.is_err() {
                    return;
                }
            }
        }
    }
}

fn fire(ticks: &[flume::Sender<TickStamp>], idx: &mut u64) {
    let stamp = TickStamp::now(*idx);
    for tx in ticks {
        let _ = tx.try_send(stamp.clone());
    }
    *idx += 1;
}

/// Map the operating-system signals onto control-signal codes and feed them
/// into the supervisor. `SIGKILL` cannot be observed; it terminates the
/// process with code 137 directly.
#[cfg(unix)]
pub fn install_os_signals(handle: &SupervisorHandle) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mappings = [
        (SignalKind::terminate(), ControlSignal::ExitOkControlled),
        (SignalKind::user_defined1(), ControlSignal::ControlPause),
        (SignalKind::user_defined2(), ControlSignal::ControlStep),
    ];
    for (kind, control) in mappings {
        let mut stream = signal(kind)?;
        let handle = handle.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if !handle.send(control) {
                    break;
                }
            }
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::builtin_registry;
    use crate::config::load_value;
    use serde_json::json;

    fn pipeline_doc(emit: u64) -> serde_json::Value {
        json!({
            "system": {"id_system": "sup-test", "tick_period_ms": 5},
            "host": {"localhost": {"acct_run": "test", "is_local": true}},
            "process": {"main": {"host": "localhost"}},
            "node": [
                {"id_node": "src", "process": "main",
                 "component": "stableflow.counter",
                 "cfg": {"emit": emit}, "port_out": ["out"]},
                {"id_node": "dst", "process": "main",
                 "component": "stableflow.check_sequence",
                 "cfg": {"expect": emit}, "port_in": ["in"]}
            ],
            "edge": [{"src": "src.out", "dst": "dst.in", "capacity": 4}]
        })
    }

    #[tokio::test]
    async fn pipeline_runs_to_controlled_completion() {
        let registry = builtin_registry();
        let system = Arc::new(load_value(pipeline_doc(10), &[], Some(&registry)).unwrap());
        let (supervisor, _handle) = ProcessSupervisor::build(system, "main", &registry)
            .await
            .unwrap();
        let code = tokio::time::timeout(Duration::from_secs(5), supervisor.run())
            .await
            .expect("supervisor finished");
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn sequence_fault_exits_with_failure() {
        let registry = builtin_registry();
        let mut doc = pipeline_doc(10);
        doc["node"][1]["cfg"] = json!({"start": 5, "expect": 10});
        let system = Arc::new(load_value(doc, &[], Some(&registry)).unwrap());
        let (supervisor, _handle) = ProcessSupervisor::build(system, "main", &registry)
            .await
            .unwrap();
        let code = tokio::time::timeout(Duration::from_secs(5), supervisor.run())
            .await
            .expect("supervisor finished");
        assert_eq!(code, 1);
    }

    #[tokio::test]
    async fn immediate_exit_reports_kill_code() {
        let registry = builtin_registry();
        let system = Arc::new(load_value(pipeline_doc(1_000_000), &[], Some(&registry)).unwrap());
        let (supervisor, handle) = ProcessSupervisor::build(system, "main", &registry)
            .await
            .unwrap();
        let task = tokio::spawn(supervisor.run());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(handle.send(ControlSignal::ExitExImmediate));
        let code = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 137);
    }
}
