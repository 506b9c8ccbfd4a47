//! Built-in components shipped with the runtime.
//!
//! These cover the graphs the demos and tests exercise: a tick-counter
//! source, a sequence-checking sink, a pass-through relay and a tracing log
//! sink. [`builtin_registry`] returns a registry with all of them installed;
//! deployments extend it with their own paths.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::component::{ComponentRegistry, Edict, EdictContext, EdictFault, PortMap};
use crate::signal::ControlSignal;

/// Registry pre-populated with the `stableflow.*` component paths.
#[must_use]
pub fn builtin_registry() -> ComponentRegistry {
    let mut registry = ComponentRegistry::new();
    registry.register(Counter::PATH, |cfg| Ok(Box::new(Counter::from_cfg(cfg)?)));
    registry.register(CheckSequence::PATH, |cfg| {
        Ok(Box::new(CheckSequence::from_cfg(cfg)?))
    });
    registry.register(Relay::PATH, |_cfg| Ok(Box::new(Relay)));
    registry.register(LogSink::PATH, |_cfg| Ok(Box::new(LogSink)));
    registry.register(FaultAt::PATH, |cfg| Ok(Box::new(FaultAt::from_cfg(cfg)?)));
    registry
}

#[derive(Debug, Default, Deserialize)]
struct CounterCfg {
    /// Stop with `exit_ok_controlled` after emitting this many values.
    #[serde(default)]
    emit: Option<u64>,
}

/// Source emitting the current tick index on port `out`.
pub struct Counter {
    cfg: CounterCfg,
    emitted: u64,
}

impl Counter {
    pub const PATH: &'static str = "stableflow.counter";

    fn from_cfg(cfg: &serde_json::Value) -> Result<Self, EdictFault> {
        let cfg = if cfg.is_null() {
            CounterCfg::default()
        } else {
            serde_json::from_value(cfg.clone())?
        };
        Ok(Self { cfg, emitted: 0 })
    }
}

#[async_trait]
impl Edict for Counter {
    async fn reset(&mut self, _ctx: &EdictContext) -> Result<(), EdictFault> {
        self.emitted = 0;
        Ok(())
    }

    async fn step(
        &mut self,
        _ctx: &EdictContext,
        inputs: &PortMap,
        outputs: &mut PortMap,
    ) -> Result<ControlSignal, EdictFault> {
        let ctrl = inputs
            .get("ctrl")
            .ok_or_else(|| EdictFault::msg("missing ctrl port"))?;
        let Some(ts) = ctrl.ts.as_ref() else {
            return Ok(ControlSignal::ContinueOk);
        };
        let out = outputs
            .get_mut("out")
            .ok_or_else(|| EdictFault::msg("missing out port"))?;
        out.emit(serde_json::json!(ts.idx));
        self.emitted += 1;
        if let Some(limit) = self.cfg.emit {
            if self.emitted >= limit {
                return Ok(ControlSignal::ExitOkControlled);
            }
        }
        Ok(ControlSignal::ContinueOk)
    }
}

#[derive(Debug, Default, Deserialize)]
struct CheckSequenceCfg {
    /// First expected value.
    #[serde(default)]
    start: u64,
    /// Stop with `exit_ok_controlled` after observing this many values.
    #[serde(default)]
    expect: Option<u64>,
}

/// Sink asserting that port `in` carries a gap-free ascending sequence.
pub struct CheckSequence {
    cfg: CheckSequenceCfg,
    next: u64,
    seen: u64,
}

impl CheckSequence {
    pub const PATH: &'static str = "stableflow.check_sequence";

    fn from_cfg(cfg: &serde_json::Value) -> Result<Self, EdictFault> {
        let cfg: CheckSequenceCfg = if cfg.is_null() {
            CheckSequenceCfg::default()
        } else {
            serde_json::from_value(cfg.clone())?
        };
        let next = cfg.start;
        Ok(Self { cfg, next, seen: 0 })
    }

    /// Values observed so far.
    #[must_use]
    pub fn seen(&self) -> u64 {
        self.seen
    }
}

#[async_trait]
impl Edict for CheckSequence {
    async fn reset(&mut self, _ctx: &EdictContext) -> Result<(), EdictFault> {
        self.next = self.cfg.start;
        self.seen = 0;
        Ok(())
    }

    async fn step(
        &mut self,
        _ctx: &EdictContext,
        inputs: &PortMap,
        _outputs: &mut PortMap,
    ) -> Result<ControlSignal, EdictFault> {
        let Some(input) = inputs.get("in") else {
            return Ok(ControlSignal::ContinueOk);
        };
        if !input.ena {
            return Ok(ControlSignal::ContinueOk);
        }
        for item in &input.list {
            let value = item
                .as_u64()
                .ok_or_else(|| EdictFault::msg(format!("non-integer item {item}")))?;
            if value != self.next {
                return Err(EdictFault::msg(format!(
                    "sequence break: expected {}, observed {value}",
                    self.next
                )));
            }
            self.next += 1;
            self.seen += 1;
        }
        if let Some(expect) = self.cfg.expect {
            if self.seen >= expect {
                return Ok(ControlSignal::ExitOkControlled);
            }
        }
        Ok(ControlSignal::ContinueOk)
    }
}

/// Pass-through: copies an enabled `in` envelope's payload to `out`.
pub struct Relay;

impl Relay {
    pub const PATH: &'static str = "stableflow.relay";
}

#[async_trait]
impl Edict for Relay {
    async fn reset(&mut self, _ctx: &EdictContext) -> Result<(), EdictFault> {
        Ok(())
    }

    async fn step(
        &mut self,
        _ctx: &EdictContext,
        inputs: &PortMap,
        outputs: &mut PortMap,
    ) -> Result<ControlSignal, EdictFault> {
        if let Some(input) = inputs.get("in") {
            if input.ena {
                if let Some(out) = outputs.get_mut("out") {
                    out.ena = true;
                    out.list.extend(input.list.iter().cloned());
                }
            }
        }
        Ok(ControlSignal::ContinueOk)
    }
}

/// Sink logging enabled envelopes through `tracing`.
pub struct LogSink;

impl LogSink {
    pub const PATH: &'static str = "stableflow.log";
}

#[async_trait]
impl Edict for LogSink {
    async fn reset(&mut self, ctx: &EdictContext) -> Result<(), EdictFault> {
        info!(id_node = %ctx.id_node, "log sink ready");
        Ok(())
    }

    async fn step(
        &mut self,
        ctx: &EdictContext,
        inputs: &PortMap,
        _outputs: &mut PortMap,
    ) -> Result<ControlSignal, EdictFault> {
        for (port, envelope) in inputs.iter() {
            if port != "ctrl" && envelope.ena {
                let idx = envelope.ts.as_ref().map_or(0, |ts| ts.idx);
                info!(
                    id_node = %ctx.id_node,
                    port,
                    idx,
                    items = envelope.list.len(),
                    payload = %serde_json::Value::Array(envelope.list.clone()),
                    "envelope"
                );
            }
        }
        Ok(ControlSignal::ContinueOk)
    }
}

#[derive(Debug, Deserialize)]
struct FaultAtCfg {
    /// Tick index at which to raise a component fault.
    at: u64,
}

/// Deliberately faulting component used to exercise escalation paths.
pub struct FaultAt {
    at: u64,
}

impl FaultAt {
    pub const PATH: &'static str = "stableflow.fault_at";

    fn from_cfg(cfg: &serde_json::Value) -> Result<Self, EdictFault> {
        let cfg: FaultAtCfg = serde_json::from_value(cfg.clone())?;
        Ok(Self { at: cfg.at })
    }
}

#[async_trait]
impl Edict for FaultAt {
    async fn reset(&mut self, _ctx: &EdictContext) -> Result<(), EdictFault> {
        Ok(())
    }

    async fn step(
        &mut self,
        _ctx: &EdictContext,
        inputs: &PortMap,
        _outputs: &mut PortMap,
    ) -> Result<ControlSignal, EdictFault> {
        let idx = inputs
            .get("ctrl")
            .and_then(|ctrl| ctrl.ts.as_ref())
            .map_or(0, |ts| ts.idx);
        if idx >= self.at {
            return Err(EdictFault::msg(format!("configured fault at tick {idx}")));
        }
        Ok(ControlSignal::ContinueOk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{TickEnvelope, TickStamp};
    use std::time::Duration;

    fn ctx() -> EdictContext {
        EdictContext {
            id_node: "test".into(),
            cfg: serde_json::Value::Null,
            tick_period: Duration::from_millis(10),
        }
    }

    fn ctrl_inputs(idx: u64) -> PortMap {
        let mut inputs = PortMap::with_ports(["ctrl"]);
        inputs.set("ctrl", TickEnvelope::enabled(TickStamp::at(idx, 0.0), vec![]));
        inputs
    }

    #[tokio::test]
    async fn counter_emits_tick_idx() {
        let mut counter = Counter::from_cfg(&serde_json::Value::Null).unwrap();
        counter.reset(&ctx()).await.unwrap();
        let mut outputs = PortMap::with_ports(["out"]);
        counter
            .step(&ctx(), &ctrl_inputs(5), &mut outputs)
            .await
            .unwrap();
        let out = outputs.get("out").unwrap();
        assert!(out.ena);
        assert_eq!(out.list, vec![serde_json::json!(5)]);
    }

    #[tokio::test]
    async fn check_sequence_faults_on_gap() {
        let mut check = CheckSequence::from_cfg(&serde_json::Value::Null).unwrap();
        check.reset(&ctx()).await.unwrap();

        let mut inputs = PortMap::with_ports(["ctrl", "in"]);
        inputs.set(
            "in",
            TickEnvelope::enabled(TickStamp::at(0, 0.0), vec![serde_json::json!(0)]),
        );
        let mut outputs = PortMap::default();
        check.step(&ctx(), &inputs, &mut outputs).await.unwrap();

        inputs.set(
            "in",
            TickEnvelope::enabled(TickStamp::at(1, 0.0), vec![serde_json::json!(5)]),
        );
        let err = check.step(&ctx(), &inputs, &mut outputs).await.unwrap_err();
        assert!(err.message.contains("expected 1"));
    }

    #[tokio::test]
    async fn check_sequence_signals_exit_when_satisfied() {
        let mut check =
            CheckSequence::from_cfg(&serde_json::json!({"expect": 2})).unwrap();
        check.reset(&ctx()).await.unwrap();
        let mut inputs = PortMap::with_ports(["in"]);
        inputs.set(
            "in",
            TickEnvelope::enabled(
                TickStamp::at(0, 0.0),
                vec![serde_json::json!(0), serde_json::json!(1)],
            ),
        );
        let mut outputs = PortMap::default();
        let signal = check.step(&ctx(), &inputs, &mut outputs).await.unwrap();
        assert_eq!(signal, ControlSignal::ExitOkControlled);
    }
}
