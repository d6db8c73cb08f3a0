//! Out-of-process handlers.
//!
//! An external handler is any executable speaking a two-call protocol:
//!
//! * `handler --test` prints an opaque payload on the first line of stdout
//!   and exits 0 to request invocation, non-zero to decline.
//! * `handler --invoke <payload>` performs the work; a non-zero exit is a
//!   handler failure.
//!
//! The store is flushed before each spawn so the child sees a committed
//! snapshot, and the child's own committed writes become visible to this
//! process through the shared database.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::{Engine, EngineError};

pub struct ExternalHandler {
    path: PathBuf,
    /// First stdout line of the last `--test` call, passed back on invoke.
    test_output: String,
}

impl ExternalHandler {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            test_output: String::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> String {
        self.path.display().to_string()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn test(&mut self, engine: &mut Engine) -> Result<bool, EngineError> {
        engine.flush()?;
        let output = Command::new(&self.path)
            .arg("--test")
            .output()
            .map_err(|e| self.spawn_error(e))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        self.test_output = stdout.lines().next().unwrap_or_default().to_string();
        Ok(output.status.success())
    }

    pub(crate) fn invoke(&mut self, engine: &mut Engine) -> Result<(), EngineError> {
        engine.flush()?;
        let status = Command::new(&self.path)
            .arg("--invoke")
            .arg(&self.test_output)
            .status()
            .map_err(|e| self.spawn_error(e))?;
        if !status.success() {
            return Err(EngineError::ExternalHandlerFailed {
                path: self.path.clone(),
                status,
            });
        }
        Ok(())
    }

    fn spawn_error(&self, e: std::io::Error) -> EngineError {
        #[cfg(unix)]
        if e.raw_os_error() == Some(libc::ENOEXEC) {
            return EngineError::BrokenHandler {
                path: self.path.clone(),
            };
        }
        EngineError::HandlerIo {
            path: self.path.clone(),
            source: e,
        }
    }
}
