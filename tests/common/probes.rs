#![allow(dead_code)]

//! Probe components used by the integration tests: they record what the
//! runtime hands them into shared cells the test can assert on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use stableflow::component::{ComponentRegistry, Edict, EdictContext, EdictFault, PortMap};
use stableflow::components::builtin_registry;
use stableflow::signal::ControlSignal;

/// Shared cells the probe components write into.
#[derive(Clone, Default)]
pub struct Probes {
    /// Payload items observed by `probe.capture` on port `in`, in order.
    pub captured: Arc<Mutex<Vec<serde_json::Value>>>,
    /// Steps taken by `probe.tick_count`.
    pub ticks: Arc<AtomicU64>,
    /// Reset invocations seen by `probe.reset_count`.
    pub resets: Arc<AtomicU64>,
}

impl Probes {
    pub fn captured(&self) -> Vec<serde_json::Value> {
        self.captured.lock().expect("probe cell poisoned").clone()
    }

    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    pub fn reset_count(&self) -> u64 {
        self.resets.load(Ordering::SeqCst)
    }
}

/// The builtin registry extended with the probe paths.
pub fn probe_registry() -> (ComponentRegistry, Probes) {
    let probes = Probes::default();
    let mut registry = builtin_registry();
    {
        let cell = Arc::clone(&probes.captured);
        registry.register("probe.capture", move |_cfg| {
            Ok(Box::new(Capture {
                values: Arc::clone(&cell),
            }))
        });
    }
    {
        let cell = Arc::clone(&probes.ticks);
        registry.register("probe.tick_count", move |_cfg| {
            Ok(Box::new(TickCount {
                ticks: Arc::clone(&cell),
            }))
        });
    }
    {
        let cell = Arc::clone(&probes.resets);
        registry.register("probe.reset_count", move |_cfg| {
            Ok(Box::new(ResetCount {
                resets: Arc::clone(&cell),
            }))
        });
    }
    (registry, probes)
}

struct Capture {
    values: Arc<Mutex<Vec<serde_json::Value>>>,
}

#[async_trait]
impl Edict for Capture {
    async fn reset(&mut self, _ctx: &EdictContext) -> Result<(), EdictFault> {
        Ok(())
    }

    async fn step(
        &mut self,
        _ctx: &EdictContext,
        inputs: &PortMap,
        _outputs: &mut PortMap,
    ) -> Result<ControlSignal, EdictFault> {
        if let Some(input) = inputs.get("in") {
            if input.ena {
                let mut values = self.values.lock().expect("probe cell poisoned");
                values.extend(input.list.iter().cloned());
            }
        }
        Ok(ControlSignal::ContinueOk)
    }
}

struct TickCount {
    ticks: Arc<AtomicU64>,
}

#[async_trait]
impl Edict for TickCount {
    async fn reset(&mut self, _ctx: &EdictContext) -> Result<(), EdictFault> {
        Ok(())
    }

    async fn step(
        &mut self,
        _ctx: &EdictContext,
        _inputs: &PortMap,
        _outputs: &mut PortMap,
    ) -> Result<ControlSignal, EdictFault> {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        Ok(ControlSignal::ContinueOk)
    }
}

struct ResetCount {
    resets: Arc<AtomicU64>,
}

#[async_trait]
impl Edict for ResetCount {
    async fn reset(&mut self, _ctx: &EdictContext) -> Result<(), EdictFault> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn step(
        &mut self,
        _ctx: &EdictContext,
        _inputs: &PortMap,
        _outputs: &mut PortMap,
    ) -> Result<ControlSignal, EdictFault> {
        Ok(ControlSignal::ContinueOk)
    }
}
