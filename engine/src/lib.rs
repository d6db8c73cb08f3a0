//! Convergence engine: handler registry, flag primitives with trigger
//! cascades, and the two-phase dispatch loop that drives a unit toward
//! quiescence.
//!
//! The engine is deliberately synchronous. A dispatch run is a short-lived
//! process reacting to one lifecycle hook; all durable state lives in the
//! [`converge_store::Store`] and every in-process structure is rebuilt at
//! startup by re-running handler registration.

mod config;
mod dispatch;
mod error;
mod flags;
mod helpers;
mod patterns;
mod registry;
mod watch;


pub mod external;

pub use config::{DEFAULT_MAX_CASCADE_DEPTH, EngineConfig, HOOK_ENV, LOG_OPTS_ENV};
pub use dispatch::{MAX_ITERATIONS, dispatch};
pub use error::EngineError;
pub use flags::TriggerCallback;
pub use helpers::{any_file_changed, data_changed, file_changed, mark_invoked, was_invoked};
pub use patterns::{NoRelations, RelationLookup};
pub use registry::{
    Action, ArgSource, CustomPredicate, HandlerBuilder, PostCallback, Predicate, Registry,
};

use std::path::Path;

use converge_store::Store;
use converge_types::Phase;

use flags::CallbackTable;

/// Store keys owned by the engine. Everything the engine persists lives
/// under the `converge.` namespace.
pub(crate) mod keys {
    use converge_types::Direction;

    pub const FLAG_PREFIX: &str = "converge.flags.";
    pub const WATCH: &str = "converge.watch";
    pub const PHASE: &str = "converge.dispatch.phase";
    pub const REMOVED: &str = "converge.dispatch.removed";
    pub const INVOKED_PREFIX: &str = "converge.invoked.";
    pub const DATA_PREFIX: &str = "converge.data_changed.";

    pub fn flag(name: &str) -> String {
        format!("{FLAG_PREFIX}{name}")
    }

    pub fn trigger(direction: Direction, flag: &str) -> String {
        match direction {
            Direction::OnSet => format!("converge.triggers.set.{flag}"),
            Direction::OnClear => format!("converge.triggers.clear.{flag}"),
        }
    }

    pub fn invoked(id: &str) -> String {
        format!("{INVOKED_PREFIX}{id}")
    }

    pub fn data_hash(id: &str) -> String {
        format!("{DATA_PREFIX}{id}")
    }
}

/// The engine proper: a store, the process-local trigger callbacks, and the
/// dispatch configuration.
///
/// Handlers are held separately in a [`Registry`] so handler actions can
/// receive `&mut Engine` while the dispatch loop walks the registry.
pub struct Engine {
    pub(crate) store: Store,
    pub(crate) relations: Box<dyn RelationLookup>,
    pub(crate) callbacks: CallbackTable,
    pub(crate) cascade_depth: usize,
    pub(crate) config: EngineConfig,
}

impl Engine {
    #[must_use]
    pub fn new(store: Store, config: EngineConfig) -> Self {
        Self {
            store,
            relations: Box::new(NoRelations),
            callbacks: CallbackTable::new(),
            cascade_depth: 0,
            config,
        }
    }

    /// Open (or create) the store at `path` and build an engine over it.
    pub fn open(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        Ok(Self::new(Store::open(path)?, config))
    }

    /// Engine over an in-memory store, mostly for tests.
    pub fn in_memory(config: EngineConfig) -> Result<Self, EngineError> {
        Ok(Self::new(Store::open_in_memory()?, config))
    }

    /// Replace the relation lookup used by hook-pattern expansion.
    #[must_use]
    pub fn with_relations(mut self, relations: Box<dyn RelationLookup>) -> Self {
        self.relations = relations;
        self
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    #[must_use]
    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    /// The persisted dispatch phase. Defaults to [`Phase::Hooks`] when no
    /// dispatch has recorded one yet.
    pub fn phase(&self) -> Result<Phase, EngineError> {
        let Some(value) = self.store.get(keys::PHASE)? else {
            return Ok(Phase::Hooks);
        };
        let raw = value.as_str().unwrap_or_default().to_string();
        raw.parse()
            .map_err(|e| EngineError::Store(anyhow::Error::new(e)))
    }

    /// Phase-aware hook test for out-of-process handlers: true only during
    /// the hooks phase, when the current hook name matches any pattern.
    pub fn current_hook_matches(&self, hook_patterns: &[String]) -> Result<bool, EngineError> {
        Ok(self.phase()? == Phase::Hooks
            && patterns::matches_hook(
                &self.config.hook_name,
                hook_patterns,
                self.relations.as_ref(),
            ))
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) -> Result<(), EngineError> {
        self.store
            .set(keys::PHASE, serde_json::Value::String(phase.as_str().to_string()));
        Ok(())
    }

    /// Commit buffered store writes. Called before spawning external
    /// handlers and at the end of a dispatch run.
    pub fn flush(&mut self) -> Result<(), EngineError> {
        self.store.flush()?;
        Ok(())
    }
}
