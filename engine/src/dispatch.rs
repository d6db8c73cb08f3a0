//! The two-phase dispatch loop.
//!
//! Phase one runs hook-pattern handlers exactly once. Phase two iterates
//! flag handlers until no handler matches, bounded by [`MAX_ITERATIONS`];
//! hitting the bound is logged, not an error, because a partially converged
//! unit will pick up where it left off on the next dispatch.
//!
//! Within a batch, handlers run in registration order. Clearing a flag
//! mid-batch invalidates the rest of the batch, which is re-tested and
//! pruned before invocation continues. Setting a flag mid-batch never adds
//! handlers to the current batch; additions wait for the next iteration's
//! test pass.

use std::collections::VecDeque;

use converge_types::Phase;

use crate::registry::Registry;
use crate::{Engine, EngineError};

/// Bound on convergence iterations per dispatch.
pub const MAX_ITERATIONS: u32 = 100;

/// Run one full dispatch: hooks phase, then flag convergence to quiescence.
pub fn dispatch(engine: &mut Engine, registry: &mut Registry) -> Result<(), EngineError> {
    engine.watch_reset()?;

    engine.set_phase(Phase::Hooks)?;
    tracing::debug!(hook = %engine.config.hook_name, "dispatch: hooks phase");
    let batch = test_all(engine, registry)?;
    invoke_batch(engine, registry, batch)?;

    engine.set_phase(Phase::Other)?;
    let mut converged = false;
    for iteration in 0..MAX_ITERATIONS {
        engine.watch_set_iteration(iteration)?;
        let batch = test_all(engine, registry)?;
        if batch.is_empty() {
            converged = true;
            break;
        }
        tracing::debug!(iteration, handlers = batch.len(), "dispatch: convergence iteration");
        invoke_batch(engine, registry, batch)?;
    }
    if !converged {
        tracing::warn!(
            limit = MAX_ITERATIONS,
            "dispatch stopped before quiescence; remaining work deferred to the next dispatch"
        );
    }

    engine.watch_reset()?;
    engine.flush()?;
    Ok(())
}

/// Indices of handlers that are change-eligible and whose predicates hold,
/// in registration order.
fn test_all(engine: &mut Engine, registry: &mut Registry) -> Result<Vec<usize>, EngineError> {
    let watch = engine.watch_load()?;
    let mut matched = Vec::new();
    for (idx, entry) in registry.entries_mut().iter_mut().enumerate() {
        // Change gating applies only to handlers that consume flags; a
        // handler with no consumed flags is re-tested every iteration.
        if !entry.flags().is_empty() && !watch.eligible(entry.flags()) {
            continue;
        }
        if entry.test(engine)? {
            matched.push(idx);
        }
    }
    Ok(matched)
}

fn invoke_batch(
    engine: &mut Engine,
    registry: &mut Registry,
    batch: Vec<usize>,
) -> Result<(), EngineError> {
    let mut to_invoke: VecDeque<usize> = batch.into();
    while !to_invoke.is_empty() {
        engine.reset_flag_removal()?;
        let mut removed = false;
        while let Some(idx) = to_invoke.pop_front() {
            let entry = &mut registry.entries_mut()[idx];
            tracing::info!(handler = entry.id(), "invoking handler");
            entry.invoke(engine)?;
            if engine.flag_was_removed()? {
                removed = true;
                break;
            }
        }
        if removed {
            // A cleared flag can invalidate handlers matched earlier in this
            // batch; keep only those whose predicates still hold.
            let watch = engine.watch_load()?;
            let mut survivors = VecDeque::new();
            for idx in to_invoke {
                let entry = &mut registry.entries_mut()[idx];
                let eligible = entry.flags().is_empty() || watch.eligible(entry.flags());
                if eligible && entry.test(engine)? {
                    survivors.push_back(idx);
                }
            }
            to_invoke = survivors;
        }
    }
    engine.reset_flag_removal()?;
    engine.watch_commit()?;
    Ok(())
}
