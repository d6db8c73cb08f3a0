//! Core domain types for Converge.
//!
//! This crate contains pure domain types with no IO, no async, and minimal
//! dependencies. The change-tracking logic of [`WatchRecord`] and the merge
//! logic of [`TriggerDef`] live here so the dispatch loop can be reasoned
//! about (and tested) without a backing store.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Phase - where the dispatch loop currently is
// ============================================================================

/// Dispatch phase, persisted as a string so out-of-process helpers can be
/// phase-aware.
///
/// Hook-pattern predicates only match during [`Phase::Hooks`]; flag
/// predicates only match during [`Phase::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// First pass: hook-pattern handlers, run exactly once per dispatch.
    Hooks,
    /// Iterating pass: flag-predicate handlers, run to quiescence.
    Other,
}

impl Phase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Hooks => "hooks",
            Phase::Other => "other",
        }
    }
}

/// Error from parsing a persisted phase string.
#[derive(Debug, Error)]
#[error("unknown dispatch phase: {0}")]
pub struct UnknownPhase(pub String);

impl std::str::FromStr for Phase {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hooks" => Ok(Phase::Hooks),
            "other" => Ok(Phase::Other),
            other => Err(UnknownPhase(other.to_string())),
        }
    }
}

// ============================================================================
// Direction - which flag transition a trigger reacts to
// ============================================================================

/// The flag transition a trigger is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The trigger fires when its flag is set.
    OnSet,
    /// The trigger fires when its flag is cleared.
    OnClear,
}

// ============================================================================
// TriggerDef - persisted cascade rule for one (flag, direction) key
// ============================================================================

/// The persisted part of a trigger: flags to set and flags to clear when the
/// keyed transition happens. Callbacks are process-local and are not part of
/// this record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerDef {
    #[serde(default)]
    pub set_flags: Vec<String>,
    #[serde(default)]
    pub clear_flags: Vec<String>,
}

impl TriggerDef {
    /// Append flag names to this trigger, skipping names already present.
    ///
    /// Registration order is preserved; re-registering the same trigger is a
    /// no-op for the persisted record.
    pub fn merge(&mut self, set_flag: Option<&str>, clear_flag: Option<&str>) {
        if let Some(flag) = set_flag
            && !self.set_flags.iter().any(|f| f == flag)
        {
            self.set_flags.push(flag.to_string());
        }
        if let Some(flag) = clear_flag
            && !self.clear_flags.iter().any(|f| f == flag)
        {
            self.clear_flags.push(flag.to_string());
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set_flags.is_empty() && self.clear_flags.is_empty()
    }
}

// ============================================================================
// WatchRecord - per-dispatch change tracking
// ============================================================================

/// Change-tracking state for one dispatch run, persisted as a single record.
///
/// `changes` holds the flags that changed in the previously committed batch;
/// `pending` accumulates flag names for the batch currently being invoked and
/// replaces `changes` at [`WatchRecord::commit`]. The record is reset to its
/// default at the start and end of every dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchRecord {
    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub changes: Vec<String>,
    #[serde(default)]
    pub pending: Vec<String>,
}

impl WatchRecord {
    /// Record a flag mutation into the accumulating batch.
    pub fn change(&mut self, flag: &str) {
        self.pending.push(flag.to_string());
    }

    /// Promote the accumulating batch: `pending` becomes the new `changes`.
    pub fn commit(&mut self) {
        self.changes = std::mem::take(&mut self.pending);
    }

    /// The change-gating rule: a handler watching `flags` may be re-tested
    /// only on the first iteration, or when one of its flags is among the
    /// committed changes. Uncommitted (`pending`) mutations never count.
    #[must_use]
    pub fn eligible<'a, I>(&self, flags: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        if self.iteration == 0 {
            return true;
        }
        flags.into_iter().any(|f| self.changes.contains(f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_str() {
        assert_eq!("hooks".parse::<Phase>().unwrap(), Phase::Hooks);
        assert_eq!("other".parse::<Phase>().unwrap(), Phase::Other);
        assert_eq!(Phase::Hooks.as_str(), "hooks");
        assert!("restricted".parse::<Phase>().is_err());
    }

    #[test]
    fn trigger_merge_dedupes() {
        let mut def = TriggerDef::default();
        def.merge(Some("b"), None);
        def.merge(Some("b"), Some("c"));
        def.merge(Some("d"), Some("c"));
        assert_eq!(def.set_flags, vec!["b", "d"]);
        assert_eq!(def.clear_flags, vec!["c"]);
    }

    #[test]
    fn watch_change_accumulates_pending() {
        let mut record = WatchRecord::default();
        record.change("foo");
        record.change("bar");
        assert_eq!(record.pending, vec!["foo", "bar"]);
        assert!(record.changes.is_empty());
    }

    #[test]
    fn watch_commit_promotes_pending() {
        let mut record = WatchRecord::default();
        record.change("foo");
        record.change("bar");
        record.commit();
        assert_eq!(record.changes, vec!["foo", "bar"]);
        assert!(record.pending.is_empty());
    }

    #[test]
    fn watch_eligibility() {
        let foos = vec!["foos".to_string()];
        let bars = vec!["bars".to_string()];
        let both = vec!["foos".to_string(), "bars".to_string()];

        let mut record = WatchRecord::default();
        assert!(record.eligible(&foos), "iteration 0 is always eligible");

        record.iteration = 1;
        assert!(!record.eligible(&foos), "no changes yet");

        record.change("foos");
        assert!(!record.eligible(&foos), "pending changes do not count");

        record.commit();
        assert!(record.eligible(&foos), "committed change is visible");

        record.change("bars");
        record.commit();
        assert!(!record.eligible(&foos), "older change was replaced");
        assert!(record.eligible(&bars));
        assert!(record.eligible(&both), "any overlap is enough");

        record.commit();
        assert!(!record.eligible(&bars), "already seen");
    }
}
