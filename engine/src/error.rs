//! Engine error taxonomy.
//!
//! Input-validation errors surface at registration time; storage failures are
//! fatal and propagate out of `dispatch()` untouched; external-handler
//! failures distinguish "not an executable" from ordinary OS errors and from
//! a predicate that simply evaluated false (exit code 1, not an error).

use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A malformed `register_trigger` call, raised synchronously to the
    /// caller at registration time.
    #[error("invalid trigger: {0}")]
    TriggerValidation(&'static str),

    /// The `--test` spawn hit a file that is not a recognized executable
    /// format. Distinct from a predicate evaluating false and from generic
    /// OS errors such as a missing file.
    #[error("broken external handler (not executable): {path}")]
    BrokenHandler { path: PathBuf },

    /// An external handler's `--invoke` call exited non-zero.
    #[error("external handler {path} failed with {status}")]
    ExternalHandlerFailed { path: PathBuf, status: ExitStatus },

    /// A trigger cascade recursed past the configured depth bound, which
    /// almost always means a mutual-trigger cycle.
    #[error("trigger cascade exceeded depth {limit} while applying flag {flag}")]
    CascadeDepthExceeded { flag: String, limit: usize },

    /// OS-level failure spawning or waiting on an external handler.
    #[error("failed to run external handler {path}")]
    HandlerIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A handler action or predicate failed.
    #[error("handler {id} failed")]
    Action {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    /// Storage-layer failure. Fatal; no retry policy exists in the engine.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
