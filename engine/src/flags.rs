//! Flag primitives and trigger cascades.
//!
//! A flag is a named presence bit with an optional JSON value, persisted in
//! the store under `converge.flags.`. Setting an already-set flag updates its
//! value but is otherwise a no-op: no change is recorded and no trigger
//! fires. Clearing an absent flag does nothing at all.
//!
//! Triggers hang side effects off genuine flag transitions. The persisted
//! part (`TriggerDef`) survives across processes; callbacks are process-local
//! and must be re-registered each run, like handlers. Cascades apply
//! synchronously inside `set_flag`/`clear_flag` in a fixed order: set flags,
//! then clear flags, then callbacks. Recursion is bounded by
//! `max_cascade_depth` so a mutual-trigger cycle surfaces as an error
//! instead of a stack overflow.

use std::collections::HashMap;

use converge_types::{Direction, TriggerDef};
use serde_json::Value;

use crate::{Engine, EngineError, keys};

/// Process-local trigger callback. Runs after the trigger's flag effects.
pub type TriggerCallback = Box<dyn FnMut(&mut Engine) -> Result<(), EngineError>>;

pub(crate) type CallbackTable = HashMap<(String, Direction), Vec<TriggerCallback>>;

impl Engine {
    /// Set a flag, firing its on-set trigger when the flag was previously
    /// unset. The value is stored either way.
    pub fn set_flag(&mut self, name: &str, value: Option<Value>) -> Result<(), EngineError> {
        let was_set = self.is_flag_set(name)?;
        self.store
            .set(&keys::flag(name), value.unwrap_or(Value::Null));
        if was_set {
            return Ok(());
        }
        tracing::debug!(flag = name, "flag set");
        self.watch_change(name)?;
        self.run_trigger(Direction::OnSet, name)
    }

    /// Clear a flag, firing its on-clear trigger when the flag was
    /// previously set. Also records the removal marker that makes the
    /// dispatch loop re-test the rest of the current batch.
    pub fn clear_flag(&mut self, name: &str) -> Result<(), EngineError> {
        if !self.is_flag_set(name)? {
            return Ok(());
        }
        self.store.unset(&keys::flag(name));
        tracing::debug!(flag = name, "flag cleared");
        self.watch_change(name)?;
        self.store.set(keys::REMOVED, Value::Bool(true));
        self.run_trigger(Direction::OnClear, name)
    }

    /// Set or clear depending on `should_set`.
    pub fn toggle_flag(&mut self, name: &str, should_set: bool) -> Result<(), EngineError> {
        if should_set {
            self.set_flag(name, None)
        } else {
            self.clear_flag(name)
        }
    }

    pub fn is_flag_set(&self, name: &str) -> Result<bool, EngineError> {
        Ok(self.store.get(&keys::flag(name))?.is_some())
    }

    /// The value stored with a flag. `None` when the flag is not set; a flag
    /// set without a value reads as `Some(Value::Null)`.
    pub fn flag_value(&self, name: &str) -> Result<Option<Value>, EngineError> {
        Ok(self.store.get(&keys::flag(name))?)
    }

    /// All currently set flags, sorted by name.
    pub fn get_flags(&self) -> Result<Vec<String>, EngineError> {
        let range = self.store.getrange(keys::FLAG_PREFIX, true)?;
        Ok(range.into_keys().collect())
    }

    pub fn all_flags_set<'a, I>(&self, flags: I) -> Result<bool, EngineError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for flag in flags {
            if !self.is_flag_set(flag)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn any_flags_set<'a, I>(&self, flags: I) -> Result<bool, EngineError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for flag in flags {
            if self.is_flag_set(flag)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Register a trigger on a flag transition.
    ///
    /// `set_flag` and `clear_flag` are merged into the persisted trigger
    /// record; `callback` is appended to the process-local callback list.
    /// At least one of the three must be given.
    pub fn register_trigger(
        &mut self,
        flag: &str,
        direction: Direction,
        set_flag: Option<&str>,
        clear_flag: Option<&str>,
        callback: Option<TriggerCallback>,
    ) -> Result<(), EngineError> {
        if flag.is_empty() {
            return Err(EngineError::TriggerValidation("trigger flag must be non-empty"));
        }
        if set_flag.is_none() && clear_flag.is_none() && callback.is_none() {
            return Err(EngineError::TriggerValidation(
                "trigger needs at least one of set_flag, clear_flag, or callback",
            ));
        }
        if set_flag.is_some() || clear_flag.is_some() {
            let key = keys::trigger(direction, flag);
            let mut def = self.load_trigger(&key)?;
            def.merge(set_flag, clear_flag);
            let value = serde_json::to_value(&def)
                .map_err(|e| EngineError::Store(anyhow::Error::new(e)))?;
            self.store.set(&key, value);
        }
        if let Some(cb) = callback {
            self.callbacks
                .entry((flag.to_string(), direction))
                .or_default()
                .push(cb);
        }
        if self.config.log_register {
            tracing::debug!(flag, ?direction, "registered trigger");
        }
        Ok(())
    }

    fn load_trigger(&self, key: &str) -> Result<TriggerDef, EngineError> {
        let Some(value) = self.store.get(key)? else {
            return Ok(TriggerDef::default());
        };
        serde_json::from_value(value).map_err(|e| EngineError::Store(anyhow::Error::new(e)))
    }

    /// Has any flag been removed since the marker was last reset?
    pub(crate) fn flag_was_removed(&self) -> Result<bool, EngineError> {
        Ok(matches!(self.store.get(keys::REMOVED)?, Some(Value::Bool(true))))
    }

    pub(crate) fn reset_flag_removal(&mut self) -> Result<(), EngineError> {
        self.store.unset(keys::REMOVED);
        Ok(())
    }

    fn run_trigger(&mut self, direction: Direction, flag: &str) -> Result<(), EngineError> {
        if self.cascade_depth >= self.config.max_cascade_depth {
            return Err(EngineError::CascadeDepthExceeded {
                flag: flag.to_string(),
                limit: self.config.max_cascade_depth,
            });
        }
        self.cascade_depth += 1;
        let result = self.run_trigger_inner(direction, flag);
        self.cascade_depth -= 1;
        result
    }

    fn run_trigger_inner(&mut self, direction: Direction, flag: &str) -> Result<(), EngineError> {
        let def = self.load_trigger(&keys::trigger(direction, flag))?;
        for name in &def.set_flags {
            self.set_flag(name, None)?;
        }
        for name in &def.clear_flags {
            self.clear_flag(name)?;
        }

        let key = (flag.to_string(), direction);
        let Some(mut callbacks) = self.callbacks.remove(&key) else {
            return Ok(());
        };
        let mut result = Ok(());
        for callback in &mut callbacks {
            if let Err(e) = callback(self) {
                result = Err(e);
                break;
            }
        }
        // A callback may itself have registered callbacks for this key; keep
        // both the originals and the newcomers.
        if let Some(registered_during) = self.callbacks.remove(&key) {
            callbacks.extend(registered_during);
        }
        self.callbacks.insert(key, callbacks);
        result
    }
}
