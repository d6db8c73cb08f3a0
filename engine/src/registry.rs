//! Handler registry.
//!
//! Handlers are process-local and rebuilt at startup by re-running the
//! registration code, so the registry is a plain ordered `Vec`. Registration
//! order is the invocation order within a batch, which keeps dispatch runs
//! deterministic for a fixed handler set.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::Value;

use converge_types::Phase;

use crate::config::log_register_from_env;
use crate::external::ExternalHandler;
use crate::helpers::{mark_invoked, was_invoked};
use crate::patterns::matches_hook;
use crate::{Engine, EngineError};

/// Handler body. Receives the engine and the concatenated output of the
/// handler's argument sources.
pub type Action = Box<dyn FnMut(&mut Engine, &[Value]) -> anyhow::Result<()>>;

/// Lazily evaluated argument producer, run at invoke time.
pub type ArgSource = Box<dyn FnMut(&mut Engine) -> anyhow::Result<Vec<Value>>>;

/// Callback run after a successful invocation.
pub type PostCallback = Box<dyn FnMut(&mut Engine) -> anyhow::Result<()>>;

/// Arbitrary predicate, tested in every phase.
pub type CustomPredicate = Box<dyn FnMut(&mut Engine) -> anyhow::Result<bool>>;

/// A single match condition on a handler. All of a handler's predicates must
/// hold for it to be invoked.
///
/// Hook patterns only match during the hooks phase; flag predicates only
/// match during the convergence phase. A handler mixing the two therefore
/// never matches.
pub enum Predicate {
    HookPattern(Vec<String>),
    AllFlagsSet(Vec<String>),
    AnyFlagsSet(Vec<String>),
    NoneFlagsSet(Vec<String>),
    NotAllFlagsSet(Vec<String>),
    Custom(CustomPredicate),
}

impl Predicate {
    fn matches(&mut self, handler_id: &str, engine: &mut Engine) -> Result<bool, EngineError> {
        let phase = engine.phase()?;
        match self {
            Predicate::HookPattern(patterns) => Ok(phase == Phase::Hooks
                && matches_hook(
                    &engine.config.hook_name,
                    patterns,
                    engine.relations.as_ref(),
                )),
            Predicate::AllFlagsSet(flags) => {
                Ok(phase == Phase::Other
                    && engine.all_flags_set(flags.iter().map(String::as_str))?)
            }
            Predicate::AnyFlagsSet(flags) => {
                Ok(phase == Phase::Other
                    && engine.any_flags_set(flags.iter().map(String::as_str))?)
            }
            Predicate::NoneFlagsSet(flags) => {
                Ok(phase == Phase::Other
                    && !engine.any_flags_set(flags.iter().map(String::as_str))?)
            }
            Predicate::NotAllFlagsSet(flags) => {
                Ok(phase == Phase::Other
                    && !engine.all_flags_set(flags.iter().map(String::as_str))?)
            }
            Predicate::Custom(f) => f(engine).map_err(|source| EngineError::Action {
                id: handler_id.to_string(),
                source,
            }),
        }
    }

    /// Flags this predicate consumes, for change-gated re-testing. Only the
    /// positive predicates watch their flags; negated predicates do not keep
    /// a handler alive across iterations on their own.
    fn consumed_flags(&self) -> &[String] {
        match self {
            Predicate::AllFlagsSet(flags) | Predicate::AnyFlagsSet(flags) => flags,
            _ => &[],
        }
    }
}

pub(crate) enum HandlerKind {
    Local {
        predicates: Vec<Predicate>,
        args: Vec<ArgSource>,
        post: Vec<PostCallback>,
        action: Action,
    },
    External(ExternalHandler),
}

pub(crate) struct HandlerEntry {
    id: String,
    /// Union of the consumed flags of all predicates.
    flags: Vec<String>,
    kind: HandlerKind,
}

impl HandlerEntry {
    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn flags(&self) -> &[String] {
        &self.flags
    }

    /// Do all predicates currently hold?
    pub(crate) fn test(&mut self, engine: &mut Engine) -> Result<bool, EngineError> {
        match &mut self.kind {
            HandlerKind::Local { predicates, .. } => {
                for predicate in predicates {
                    if !predicate.matches(&self.id, engine)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            HandlerKind::External(handler) => handler.test(engine),
        }
    }

    pub(crate) fn invoke(&mut self, engine: &mut Engine) -> Result<(), EngineError> {
        match &mut self.kind {
            HandlerKind::Local {
                args,
                action,
                post,
                ..
            } => {
                let mut collected = Vec::new();
                for source in args {
                    let values = source(engine).map_err(|source| EngineError::Action {
                        id: self.id.clone(),
                        source,
                    })?;
                    collected.extend(values);
                }
                action(engine, &collected).map_err(|source| EngineError::Action {
                    id: self.id.clone(),
                    source,
                })?;
                for callback in post {
                    callback(engine).map_err(|source| EngineError::Action {
                        id: self.id.clone(),
                        source,
                    })?;
                }
                Ok(())
            }
            HandlerKind::External(handler) => handler.invoke(engine),
        }
    }
}

/// Ordered collection of handlers for one dispatch process.
#[derive(Default)]
pub struct Registry {
    entries: Vec<HandlerEntry>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building a local handler. Nothing is registered until
    /// [`HandlerBuilder::register`] is called with the action.
    pub fn handler(&mut self, id: impl Into<String>) -> HandlerBuilder<'_> {
        HandlerBuilder {
            registry: self,
            id: id.into(),
            predicates: Vec::new(),
            extra_flags: Vec::new(),
            args: Vec::new(),
            post: Vec::new(),
        }
    }

    /// Register one external executable handler. Re-registering the same
    /// path is a no-op; the registry holds one handler per identity.
    pub fn register_external(&mut self, path: impl Into<PathBuf>) {
        let handler = ExternalHandler::new(path.into());
        if self.contains(&handler.id()) {
            return;
        }
        if log_register_from_env() {
            tracing::debug!(handler = handler.id(), "registered external handler");
        }
        self.entries.push(HandlerEntry {
            id: handler.id(),
            flags: Vec::new(),
            kind: HandlerKind::External(handler),
        });
    }

    /// Register every regular file in `dir` as an external handler, in name
    /// order so discovery is deterministic.
    pub fn register_external_dir(&mut self, dir: impl AsRef<Path>) -> Result<(), EngineError> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read handler dir {}", dir.display()))?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry =
                entry.with_context(|| format!("Failed to read handler dir {}", dir.display()))?;
            if entry
                .file_type()
                .with_context(|| format!("Failed to stat {}", entry.path().display()))?
                .is_file()
            {
                paths.push(entry.path());
            }
        }
        paths.sort();
        for path in paths {
            self.register_external(path);
        }
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [HandlerEntry] {
        &mut self.entries
    }
}

/// Builder for a local handler. Predicate methods may be combined freely and
/// repeated; all conditions must hold for the handler to run.
pub struct HandlerBuilder<'r> {
    registry: &'r mut Registry,
    id: String,
    predicates: Vec<Predicate>,
    extra_flags: Vec<String>,
    args: Vec<ArgSource>,
    post: Vec<PostCallback>,
}

impl HandlerBuilder<'_> {
    /// Match when the current hook name matches any of the patterns.
    #[must_use]
    pub fn hook<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.predicates
            .push(Predicate::HookPattern(collect(patterns)));
        self
    }

    /// Match when every named flag is set.
    #[must_use]
    pub fn when_all<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.predicates.push(Predicate::AllFlagsSet(collect(flags)));
        self
    }

    /// Match when at least one named flag is set.
    #[must_use]
    pub fn when_any<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.predicates.push(Predicate::AnyFlagsSet(collect(flags)));
        self
    }

    /// Match when none of the named flags are set.
    #[must_use]
    pub fn when_none<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.predicates
            .push(Predicate::NoneFlagsSet(collect(flags)));
        self
    }

    /// Match unless every named flag is set.
    #[must_use]
    pub fn when_not_all<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.predicates
            .push(Predicate::NotAllFlagsSet(collect(flags)));
        self
    }

    /// Declare flags this handler consumes, on top of those implied by its
    /// flag predicates. Used by the change-gating rule when the handler's
    /// conditions are expressed as custom predicates.
    #[must_use]
    pub fn consumes<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_flags.extend(flags.into_iter().map(Into::into));
        self
    }

    /// Add an arbitrary, phase-agnostic predicate.
    #[must_use]
    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: FnMut(&mut Engine) -> anyhow::Result<bool> + 'static,
    {
        self.predicates.push(Predicate::Custom(Box::new(predicate)));
        self
    }

    /// Add a lazily evaluated argument source.
    #[must_use]
    pub fn with_args<F>(mut self, source: F) -> Self
    where
        F: FnMut(&mut Engine) -> anyhow::Result<Vec<Value>> + 'static,
    {
        self.args.push(Box::new(source));
        self
    }

    /// Add a callback that runs after each successful invocation.
    #[must_use]
    pub fn post_invoke<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&mut Engine) -> anyhow::Result<()> + 'static,
    {
        self.post.push(Box::new(callback));
        self
    }

    /// Run this handler at most once across the unit's whole lifetime,
    /// tracked durably by handler id.
    #[must_use]
    pub fn only_once(self) -> Self {
        let test_id = self.id.clone();
        let mark_id = self.id.clone();
        self.when(move |engine| Ok(!was_invoked(engine, &test_id)?))
            .post_invoke(move |engine| Ok(mark_invoked(engine, &mark_id)?))
    }

    /// Finish registration with the handler's action.
    ///
    /// Registration is idempotent per id: when a handler with this id
    /// already exists the call is a no-op, so re-running registration code
    /// cannot produce duplicate handlers.
    pub fn register<F>(self, action: F)
    where
        F: FnMut(&mut Engine, &[Value]) -> anyhow::Result<()> + 'static,
    {
        if self.registry.contains(&self.id) {
            tracing::debug!(handler = %self.id, "handler already registered; skipping");
            return;
        }
        let mut flags: Vec<String> = self
            .predicates
            .iter()
            .flat_map(|p| p.consumed_flags().iter().cloned())
            .collect();
        for flag in self.extra_flags {
            if !flags.contains(&flag) {
                flags.push(flag);
            }
        }
        if log_register_from_env() {
            tracing::debug!(handler = %self.id, ?flags, "registered handler");
        }
        self.registry.entries.push(HandlerEntry {
            id: self.id,
            flags,
            kind: HandlerKind::Local {
                predicates: self.predicates,
                args: self.args,
                post: self.post,
                action: Box::new(action),
            },
        });
    }
}

fn collect<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
