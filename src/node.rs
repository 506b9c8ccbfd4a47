//! The node runtime: one loop owning one edict component.
//!
//! A [`NodeRuntime`] drives its component through the per-tick contract:
//! poll the control subscription, gather one envelope per data input under a
//! bounded deadline, reset the output envelopes, invoke the component under
//! the tick budget, then dispatch every enabled output in configured order.
//! Tick offers arrive from the owning process's tick generator; pause and
//! step never reach the node — the generator simply stops offering ticks —
//! so the signals a node interprets itself are `control_reset` and the
//! `exit_*` family.
//!
//! Escalation rules: a component fault or tick-budget overrun raises
//! `exit_ex_controlled` for the owning process; a closed queue means the
//! peer is gone and raises `exit_ok_controlled`. On a draining exit the node
//! keeps consuming until every data input reports closed, so in-flight
//! envelopes reach the component before the process stops.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

use crate::component::{ComponentFactory, Edict, EdictContext, PortMap};
use crate::envelope::TickStamp;
use crate::error::RuntimeError;
use crate::queues::{far_deadline, EdgeQueue, QueueError};
use crate::signal::ControlSignal;

/// Terminal report a node sends to its supervisor when it raises a signal.
#[derive(Debug)]
pub struct NodeEvent {
    pub id_node: String,
    pub signal: ControlSignal,
    /// Present when the signal was escalated from a failure.
    pub error: Option<RuntimeError>,
}

/// Channels the supervisor keeps per node.
pub struct NodeHarness {
    /// Control subscription feeding the node (reset and exit signals).
    pub control: flume::Sender<ControlSignal>,
    /// Tick offers; bounded so a lagging node observes gaps, not a backlog.
    pub ticks: flume::Sender<TickStamp>,
}

/// One queue feeding a data input port.
pub struct InputBinding {
    pub port: String,
    pub queue: Arc<dyn EdgeQueue>,
    closed: bool,
}

impl InputBinding {
    #[must_use]
    pub fn new(port: impl Into<String>, queue: Arc<dyn EdgeQueue>) -> Self {
        Self {
            port: port.into(),
            queue,
            closed: false,
        }
    }
}

/// The queues fed by one output port, in edge document order.
pub struct OutputBinding {
    pub port: String,
    pub queues: Vec<Arc<dyn EdgeQueue>>,
}

impl OutputBinding {
    #[must_use]
    pub fn new(port: impl Into<String>, queues: Vec<Arc<dyn EdgeQueue>>) -> Self {
        Self {
            port: port.into(),
            queues,
        }
    }
}

enum TickOutcome {
    Continue,
    Stop(ControlSignal),
}

/// The loop owning a single component and its port envelopes.
pub struct NodeRuntime {
    id_node: String,
    component: Box<dyn Edict>,
    ctx: EdictContext,
    inputs: PortMap,
    outputs: PortMap,
    input_queues: Vec<InputBinding>,
    output_queues: Vec<OutputBinding>,
    control: flume::Receiver<ControlSignal>,
    ticks: flume::Receiver<TickStamp>,
    events: flume::Sender<NodeEvent>,
    gather_budget: Duration,
    tick_budget: Option<Duration>,
    /// Present for stateless nodes: a fresh component instance replaces the
    /// old one on every reset.
    rebuild: Option<Arc<ComponentFactory>>,
    last_idx: u64,
    pending_reset: bool,
}

impl NodeRuntime {
    /// Assemble a node runtime. `port_in`/`port_out` fix the gather and
    /// dispatch order; unbound input ports gather as disabled envelopes.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id_node: impl Into<String>,
        component: Box<dyn Edict>,
        ctx: EdictContext,
        port_in: &[String],
        port_out: &[String],
        input_queues: Vec<InputBinding>,
        output_queues: Vec<OutputBinding>,
        events: flume::Sender<NodeEvent>,
        gather_budget: Duration,
        tick_budget: Option<Duration>,
        rebuild: Option<Arc<ComponentFactory>>,
    ) -> (Self, NodeHarness) {
        let (control_tx, control_rx) = flume::unbounded();
        let (tick_tx, tick_rx) = flume::bounded(1);
        let runtime = Self {
            id_node: id_node.into(),
            component,
            ctx,
            inputs: PortMap::with_ports(port_in.iter().cloned()),
            outputs: PortMap::with_ports(port_out.iter().cloned()),
            input_queues,
            output_queues,
            control: control_rx,
            ticks: tick_rx,
            events,
            gather_budget,
            tick_budget,
            rebuild,
            last_idx: 0,
            pending_reset: true,
        };
        (
            runtime,
            NodeHarness {
                control: control_tx,
                ticks: tick_tx,
            },
        )
    }

    /// Run until a signal stops the node. Returns the stopping signal.
    #[instrument(skip_all, fields(id_node = %self.id_node))]
    pub async fn run(mut self) -> ControlSignal {
        loop {
            // Apply pending control before data work.
            while let Ok(signal) = self.control.try_recv() {
                match self.apply_signal(signal) {
                    TickOutcome::Continue => {}
                    TickOutcome::Stop(signal) => return self.drain(signal).await,
                }
            }

            let stamp = tokio::select! {
                stamp = self.ticks.recv_async() => match stamp {
                    Ok(stamp) => stamp,
                    // Tick generator gone: the supervisor is tearing down.
                    Err(_) => return self.drain(ControlSignal::ExitOkControlled).await,
                },
                signal = self.control.recv_async() => {
                    match signal {
                        Ok(signal) => match self.apply_signal(signal) {
                            TickOutcome::Continue => continue,
                            TickOutcome::Stop(signal) => return self.drain(signal).await,
                        },
                        Err(_) => return self.drain(ControlSignal::ExitOkControlled).await,
                    }
                }
            };

            match self.tick(stamp).await {
                TickOutcome::Continue => {}
                TickOutcome::Stop(ControlSignal::ExitExImmediate) => {
                    return ControlSignal::ExitExImmediate;
                }
                TickOutcome::Stop(signal) => return self.drain(signal).await,
            }
        }
    }

    fn apply_signal(&mut self, signal: ControlSignal) -> TickOutcome {
        match signal {
            ControlSignal::ControlReset => {
                self.pending_reset = true;
                TickOutcome::Continue
            }
            signal if signal.is_exit() => TickOutcome::Stop(signal),
            // Pause and step are realized by the tick generator.
            _ => TickOutcome::Continue,
        }
    }

    /// One tick: reset-if-pending, gather, invoke, dispatch.
    async fn tick(&mut self, stamp: TickStamp) -> TickOutcome {
        self.last_idx = stamp.idx;
        if self.pending_reset {
            if let Some(factory) = &self.rebuild {
                match factory(&self.ctx.cfg) {
                    Ok(component) => self.component = component,
                    Err(fault) => return self.escalate_fault(fault.message),
                }
            }
            if let Err(fault) = self.component.reset(&self.ctx).await {
                return self.escalate_fault(fault.message);
            }
            self.pending_reset = false;
        }

        self.gather(&stamp).await;
        if !self.input_queues.is_empty() && self.input_queues.iter().all(|b| b.closed) {
            // Every producer is gone; wind the process down.
            debug!("all input queues closed");
            self.raise(ControlSignal::ExitOkControlled, None);
            return TickOutcome::Stop(ControlSignal::ExitOkControlled);
        }

        self.outputs.reset_all();
        let signal = match self.invoke().await {
            Ok(signal) => signal,
            Err(outcome) => return outcome,
        };

        if let TickOutcome::Stop(signal) = self.dispatch(&stamp).await {
            return TickOutcome::Stop(signal);
        }

        if signal != ControlSignal::ContinueOk {
            trace!(%signal, "component raised a signal");
            self.raise(signal, None);
            if signal.is_exit() {
                return TickOutcome::Stop(signal);
            }
        }
        TickOutcome::Continue
    }

    /// Pop one envelope per bound input under the gather deadline; absent
    /// input yields a disabled envelope. The ctrl port carries the stamp.
    async fn gather(&mut self, stamp: &TickStamp) {
        let deadline = Instant::now() + self.gather_budget;
        for binding in &mut self.input_queues {
            let gathered = if binding.closed {
                None
            } else {
                match binding.queue.pop_deadline(deadline).await {
                    Ok(found) => found,
                    Err(_) => {
                        debug!(port = %binding.port, "input queue closed");
                        binding.closed = true;
                        None
                    }
                }
            };
            if let Some(slot) = self.inputs.get_mut(&binding.port) {
                match gathered {
                    Some(envelope) => *slot = envelope,
                    None => slot.reset(),
                }
            }
        }
        if let Some(ctrl) = self.inputs.get_mut("ctrl") {
            ctrl.reset();
            ctrl.ena = true;
            ctrl.ts = Some(stamp.clone());
        }
    }

    async fn invoke(&mut self) -> Result<ControlSignal, TickOutcome> {
        let outcome = {
            let step = self
                .component
                .step(&self.ctx, &self.inputs, &mut self.outputs);
            match self.tick_budget {
                Some(budget) => tokio::time::timeout(budget, step).await,
                None => Ok(step.await),
            }
        };
        match outcome {
            Ok(Ok(signal)) => Ok(signal),
            Ok(Err(fault)) => Err(self.escalate_fault(fault.message)),
            Err(_) => {
                warn!(idx = self.last_idx, "tick budget overrun");
                let error = RuntimeError::TickOverrun {
                    id_node: self.id_node.clone(),
                    idx: self.last_idx,
                };
                self.raise(ControlSignal::ExitExControlled, Some(error));
                Err(TickOutcome::Stop(ControlSignal::ExitExControlled))
            }
        }
    }

    /// Push every enabled output, in configured port order, to each of its
    /// queues. Dispatch stamps an envelope the component left unstamped.
    async fn dispatch(&mut self, stamp: &TickStamp) -> TickOutcome {
        let deadline = self
            .tick_budget
            .map_or_else(far_deadline, |budget| Instant::now() + budget);
        for binding in &self.output_queues {
            let Some(envelope) = self.outputs.get_mut(&binding.port) else {
                continue;
            };
            if !envelope.ena {
                continue;
            }
            if envelope.ts.is_none() {
                envelope.ts = Some(stamp.clone());
            }
            let envelope = envelope.clone();
            for queue in &binding.queues {
                match queue.push(envelope.clone(), deadline).await {
                    Ok(()) => {}
                    Err(QueueError::Closed) => {
                        debug!(port = %binding.port, "output queue closed");
                        self.raise(ControlSignal::ExitOkControlled, None);
                        return TickOutcome::Stop(ControlSignal::ExitOkControlled);
                    }
                    Err(err) => {
                        warn!(port = %binding.port, error = %err, "dispatch failed");
                        let error = RuntimeError::from_queue(
                            format!("node.{}.{}", self.id_node, binding.port),
                            err,
                        );
                        self.raise(ControlSignal::ExitExControlled, Some(error));
                        return TickOutcome::Stop(ControlSignal::ExitExControlled);
                    }
                }
            }
        }
        TickOutcome::Continue
    }

    fn escalate_fault(&self, message: String) -> TickOutcome {
        warn!(%message, "component fault");
        let error = RuntimeError::ComponentFault {
            id_node: self.id_node.clone(),
            message,
        };
        self.raise(ControlSignal::ExitExControlled, Some(error));
        TickOutcome::Stop(ControlSignal::ExitExControlled)
    }

    fn raise(&self, signal: ControlSignal, error: Option<RuntimeError>) {
        let _ = self.events.send(NodeEvent {
            id_node: self.id_node.clone(),
            signal,
            error,
        });
    }

    /// Draining exit: keep consuming until every data input reports closed,
    /// so envelopes already pushed by peers reach the component. Sources
    /// stop immediately. Bounded from above by the supervisor's drain
    /// deadline.
    async fn drain(mut self, signal: ControlSignal) -> ControlSignal {
        if !signal.drains() {
            return signal;
        }
        let mut signal = signal;
        while !self.input_queues.is_empty() && !self.input_queues.iter().all(|b| b.closed) {
            if let Ok(ControlSignal::ExitExImmediate) = self.control.try_recv() {
                return ControlSignal::ExitExImmediate;
            }
            let stamp = TickStamp::now(self.last_idx + 1);
            match self.tick(stamp).await {
                TickOutcome::Continue => {}
                // An escalation during drain outranks the original signal.
                TickOutcome::Stop(ControlSignal::ExitExControlled) => {
                    signal = ControlSignal::ExitExControlled;
                    break;
                }
                TickOutcome::Stop(_) => break,
            }
        }
        debug!(%signal, "node stopped");
        signal
    }
}
