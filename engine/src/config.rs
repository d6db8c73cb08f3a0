//! Engine configuration.
//!
//! Everything here has a usable default so tests can build an engine without
//! touching the process environment.

use std::env;

/// Environment variable naming the lifecycle hook currently being handled.
pub const HOOK_ENV: &str = "CONVERGE_HOOK";

/// Environment variable with comma-separated log switches
/// (currently only `register`).
pub const LOG_OPTS_ENV: &str = "CONVERGE_LOG_OPTS";

/// Default bound on trigger cascade recursion.
pub const DEFAULT_MAX_CASCADE_DEPTH: usize = 100;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Name of the hook this process is handling; matched by hook-pattern
    /// predicates during the hooks phase.
    pub hook_name: String,
    /// Cascade recursion bound; exceeding it is a detectable error rather
    /// than a stack overflow.
    pub max_cascade_depth: usize,
    /// Emit a debug log line for every handler/predicate registration.
    pub log_register: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hook_name: String::new(),
            max_cascade_depth: DEFAULT_MAX_CASCADE_DEPTH,
            log_register: false,
        }
    }
}

impl EngineConfig {
    /// Build a config from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            hook_name: env::var(HOOK_ENV).unwrap_or_default(),
            max_cascade_depth: DEFAULT_MAX_CASCADE_DEPTH,
            log_register: log_register_from_env(),
        }
    }

    #[must_use]
    pub fn with_hook(mut self, hook_name: impl Into<String>) -> Self {
        self.hook_name = hook_name.into();
        self
    }
}

pub(crate) fn log_register_from_env() -> bool {
    env::var(LOG_OPTS_ENV)
        .map(|opts| opts.split(',').any(|opt| opt.trim() == "register"))
        .unwrap_or(false)
}
