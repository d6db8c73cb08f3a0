//! Persistence glue for the per-dispatch [`WatchRecord`].
//!
//! The record is stored as one JSON value so an external handler process,
//! which rebuilds its registry from scratch, still observes the same
//! iteration counter and committed change set as the dispatching process.

use converge_types::WatchRecord;

use crate::{Engine, EngineError, keys};

impl Engine {
    pub(crate) fn watch_load(&self) -> Result<WatchRecord, EngineError> {
        let Some(value) = self.store.get(keys::WATCH)? else {
            return Ok(WatchRecord::default());
        };
        let record = serde_json::from_value(value)
            .map_err(|e| EngineError::Store(anyhow::Error::new(e)))?;
        Ok(record)
    }

    pub(crate) fn watch_save(&mut self, record: &WatchRecord) -> Result<(), EngineError> {
        let value = serde_json::to_value(record)
            .map_err(|e| EngineError::Store(anyhow::Error::new(e)))?;
        self.store.set(keys::WATCH, value);
        Ok(())
    }

    /// Drop all change tracking. Runs at both ends of a dispatch so stale
    /// state from an aborted run cannot gate the next one.
    pub(crate) fn watch_reset(&mut self) -> Result<(), EngineError> {
        self.store.unset(keys::WATCH);
        Ok(())
    }

    pub(crate) fn watch_set_iteration(&mut self, iteration: u32) -> Result<(), EngineError> {
        let mut record = self.watch_load()?;
        record.iteration = iteration;
        self.watch_save(&record)
    }

    /// Record a flag mutation into the accumulating batch.
    pub(crate) fn watch_change(&mut self, flag: &str) -> Result<(), EngineError> {
        let mut record = self.watch_load()?;
        record.change(flag);
        self.watch_save(&record)
    }

    /// Promote pending mutations to the committed change set. Runs once per
    /// invocation batch.
    pub(crate) fn watch_commit(&mut self) -> Result<(), EngineError> {
        let mut record = self.watch_load()?;
        record.commit();
        self.watch_save(&record)
    }
}
