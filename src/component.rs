//! The per-tick execution contract seen by user ("edict") components.
//!
//! A component is a unit of user logic owned by exactly one node. Both
//! declared shapes share the same side-effect convention: `outputs` is a
//! [`PortMap`] whose envelopes are reset at the start of every tick; the
//! component mutates it in place, and ports left enabled after the step are
//! dispatched downstream.
//!
//! - The **step shape** implements [`Edict`] directly: `reset` once (and on
//!   `control_reset`), then `step` per tick.
//! - The **coroutine shape** implements [`Coroutine`] and is adapted through
//!   [`CoroutineEdict`]: started once, resumed each tick with freshly
//!   gathered inputs, returning its outputs and an optional signal. The only
//!   suspension point is between ticks.
//!
//! Components are referenced from configuration by a string module path and
//! resolved through a [`ComponentRegistry`] populated at compile time.
//!
//! # Examples
//!
//! ```
//! use async_trait::async_trait;
//! use stableflow::component::{Edict, EdictContext, EdictFault, PortMap};
//! use stableflow::signal::ControlSignal;
//!
//! struct Doubler;
//!
//! #[async_trait]
//! impl Edict for Doubler {
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
//!                 let out = outputs.get_mut("out").ok_or_else(|| EdictFault::msg("no out port"))?;
//!                 for item in &input.list {
//!                     let n = item.as_i64().unwrap_or(0);
//!                     out.emit(serde_json::json!(n * 2));
//!                 }
//!             }
//!         }
//!         Ok(ControlSignal::ContinueOk)
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::envelope::TickEnvelope;
use crate::signal::ControlSignal;

/// Ordered mapping from port name to tick envelope.
///
/// Iteration follows the configured port order; the runtime relies on this
/// for deterministic gather and dispatch.
#[derive(Clone, Debug, Default)]
pub struct PortMap {
    order: Vec<String>,
    map: FxHashMap<String, TickEnvelope>,
}

impl PortMap {
    /// Build a map with one reset envelope per port, in the given order.
    #[must_use]
    pub fn with_ports<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut pm = Self::default();
        for name in names {
            let name = name.into();
            if pm.map.insert(name.clone(), TickEnvelope::new()).is_none() {
                pm.order.push(name);
            }
        }
        pm
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TickEnvelope> {
        self.map.get(name)
    }

    #[must_use]
    pub fn get_mut(&mut self, name: &str) -> Option<&mut TickEnvelope> {
        self.map.get_mut(name)
    }

    /// Replace the envelope on `name`, registering the port if new.
    pub fn set(&mut self, name: &str, envelope: TickEnvelope) {
        if self.map.insert(name.to_string(), envelope).is_none() {
            self.order.push(name.to_string());
        }
    }

    /// Reset every envelope in place.
    pub fn reset_all(&mut self) {
        for envelope in self.map.values_mut() {
            envelope.reset();
        }
    }

    /// Port names in configured order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// Ordered iteration over `(port, envelope)`.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TickEnvelope)> {
        self.order
            .iter()
            .filter_map(|name| self.map.get(name).map(|env| (name.as_str(), env)))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }
}

/// Execution environment handed to a component at reset and step time.
#[derive(Clone, Debug)]
pub struct EdictContext {
    /// Identifier of the owning node.
    pub id_node: String,
    /// The node's `cfg` value from configuration.
    pub cfg: serde_json::Value,
    /// Tick period of the owning process.
    pub tick_period: Duration,
}

/// Failure raised by user component code. Always escalates to
/// `exit_ex_controlled` for the owning process.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct EdictFault {
    pub message: String,
}

impl EdictFault {
    #[must_use]
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for EdictFault {
    fn from(err: serde_json::Error) -> Self {
        Self::msg(err.to_string())
    }
}

/// The iterative "step" component shape.
#[async_trait]
pub trait Edict: Send {
    /// Called once before the first tick and again on `control_reset`.
    async fn reset(&mut self, ctx: &EdictContext) -> Result<(), EdictFault>;

    /// One tick. `inputs` holds the gathered envelopes (including `ctrl`);
    /// `outputs` arrives reset and is mutated in place. Returns
    /// [`ControlSignal::ContinueOk`] unless the component raises a signal.
    async fn step(
        &mut self,
        ctx: &EdictContext,
        inputs: &PortMap,
        outputs: &mut PortMap,
    ) -> Result<ControlSignal, EdictFault>;
}

/// The resumable "coroutine" component shape.
///
/// Started once, resumed each tick with freshly gathered inputs. The
/// returned map is copied onto the node's output envelopes; ports the
/// coroutine does not mention stay disabled.
#[async_trait]
pub trait Coroutine: Send {
    async fn start(&mut self, ctx: &EdictContext) -> Result<(), EdictFault>;

    async fn resume(
        &mut self,
        ctx: &EdictContext,
        inputs: &PortMap,
    ) -> Result<(PortMap, ControlSignal), EdictFault>;
}

/// Adapter running a [`Coroutine`] under the [`Edict`] contract.
pub struct CoroutineEdict<C> {
    inner: C,
}

impl<C: Coroutine> CoroutineEdict<C> {
    #[must_use]
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<C: Coroutine> Edict for CoroutineEdict<C> {
    async fn reset(&mut self, ctx: &EdictContext) -> Result<(), EdictFault> {
        self.inner.start(ctx).await
    }

    async fn step(
        &mut self,
        ctx: &EdictContext,
        inputs: &PortMap,
        outputs: &mut PortMap,
    ) -> Result<ControlSignal, EdictFault> {
        let (produced, signal) = self.inner.resume(ctx, inputs).await?;
        for (port, envelope) in produced.iter() {
            if let Some(slot) = outputs.get_mut(port) {
                *slot = envelope.clone();
            }
        }
        Ok(signal)
    }
}

/// Factory building a boxed component from its configured `cfg` value.
pub type ComponentFactory =
    dyn Fn(&serde_json::Value) -> Result<Box<dyn Edict>, EdictFault> + Send + Sync;

/// Compile-time registry resolving component module paths.
///
/// Configuration references components by string path; in a language without
/// runtime loading the registry is populated at startup with every path the
/// deployment knows about.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    factories: FxHashMap<String, Arc<ComponentFactory>>,
}

impl ComponentRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a module path. Later registrations replace
    /// earlier ones.
    pub fn register<F>(&mut self, path: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&serde_json::Value) -> Result<Box<dyn Edict>, EdictFault> + Send + Sync + 'static,
    {
        self.factories.insert(path.into(), Arc::new(factory));
        self
    }

    /// True when `path` resolves.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.factories.contains_key(path)
    }

    /// Registered paths, sorted.
    #[must_use]
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    /// Instantiate the component registered at `path`.
    pub fn build(
        &self,
        path: &str,
        cfg: &serde_json::Value,
    ) -> Result<Box<dyn Edict>, EdictFault> {
        let factory = self
            .factories
            .get(path)
            .ok_or_else(|| EdictFault::msg(format!("unknown component path `{path}`")))?;
        factory(cfg)
    }

    /// The factory registered at `path`, for nodes whose state policy
    /// re-creates the component on reset.
    #[must_use]
    pub fn factory(&self, path: &str) -> Option<Arc<ComponentFactory>> {
        self.factories.get(path).cloned()
    }
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("paths", &self.paths())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_map_keeps_configured_order() {
        let mut pm = PortMap::with_ports(["b", "a", "c"]);
        pm.get_mut("a").unwrap().emit(serde_json::json!(1));
        let names: Vec<&str> = pm.iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["b", "a", "c"]);
    }

    #[test]
    fn reset_all_clears_every_envelope() {
        let mut pm = PortMap::with_ports(["x", "y"]);
        pm.get_mut("x").unwrap().emit(serde_json::json!("v"));
        pm.reset_all();
        assert!(pm.iter().all(|(_, env)| env.is_reset()));
    }

    #[tokio::test]
    async fn coroutine_shape_runs_under_the_edict_contract() {
        // Resumed each tick with fresh inputs; its returned map lands on
        // the node's output envelopes.
        struct Accumulate {
            total: i64,
        }

        #[async_trait]
        impl Coroutine for Accumulate {
            async fn start(&mut self, _ctx: &EdictContext) -> Result<(), EdictFault> {
                self.total = 0;
                Ok(())
            }

            async fn resume(
                &mut self,
                _ctx: &EdictContext,
                inputs: &PortMap,
            ) -> Result<(PortMap, ControlSignal), EdictFault> {
                if let Some(input) = inputs.get("in") {
                    for item in &input.list {
                        self.total += item.as_i64().unwrap_or(0);
                    }
                }
                let mut produced = PortMap::with_ports(["out"]);
                produced
                    .get_mut("out")
                    .ok_or_else(|| EdictFault::msg("no out"))?
                    .emit(serde_json::json!(self.total));
                Ok((produced, ControlSignal::ContinueOk))
            }
        }

        let ctx = EdictContext {
            id_node: "acc".into(),
            cfg: serde_json::Value::Null,
            tick_period: Duration::from_millis(10),
        };
        let mut edict = CoroutineEdict::new(Accumulate { total: -1 });
        edict.reset(&ctx).await.unwrap();

        let mut outputs = PortMap::with_ports(["out"]);
        for (value, running) in [(2, 2), (3, 5)] {
            let mut inputs = PortMap::with_ports(["ctrl", "in"]);
            inputs
                .get_mut("in")
                .unwrap()
                .emit(serde_json::json!(value));
            outputs.reset_all();
            let signal = edict.step(&ctx, &inputs, &mut outputs).await.unwrap();
            assert_eq!(signal, ControlSignal::ContinueOk);
            let out = outputs.get("out").unwrap();
            assert!(out.ena);
            assert_eq!(out.list, vec![serde_json::json!(running)]);
        }
    }

    #[test]
    fn registry_resolves_registered_paths() {
        struct Noop;
        #[async_trait]
        impl Edict for Noop {
            async fn reset(&mut self, _ctx: &EdictContext) -> Result<(), EdictFault> {
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

        let mut registry = ComponentRegistry::new();
        registry.register("test.noop", |_cfg| Ok(Box::new(Noop)));
        assert!(registry.contains("test.noop"));
        assert!(!registry.contains("test.other"));
        assert!(registry.build("test.noop", &serde_json::Value::Null).is_ok());
        assert!(registry.build("test.other", &serde_json::Value::Null).is_err());
    }
}
