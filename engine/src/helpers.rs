//! Durable convenience helpers used by handlers and the run-once machinery.

use std::fmt::Write as _;
use std::path::Path;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{Engine, EngineError, keys};

/// Has [`mark_invoked`] ever been called for this id?
pub fn was_invoked(engine: &Engine, id: &str) -> Result<bool, EngineError> {
    Ok(engine.store.get(&keys::invoked(id))?.is_some())
}

/// Durably record that the identified work has run.
pub fn mark_invoked(engine: &mut Engine, id: &str) -> Result<(), EngineError> {
    engine.store.set(&keys::invoked(id), Value::Bool(true));
    Ok(())
}

/// Has `data` changed since the last call with this id?
///
/// Returns true on the first call and whenever the value's hash differs from
/// the stored one. The stored hash is updated either way.
pub fn data_changed(engine: &mut Engine, id: &str, data: &Value) -> Result<bool, EngineError> {
    let raw = serde_json::to_vec(data).map_err(|e| EngineError::Store(anyhow::Error::new(e)))?;
    let digest = hex_digest(&Sha256::digest(&raw));
    let key = keys::data_hash(id);
    let previous = engine.store.get(&key)?;
    engine.store.set(&key, Value::String(digest.clone()));
    Ok(previous.as_ref().and_then(Value::as_str) != Some(digest.as_str()))
}

/// Has this file changed since the last call?
pub fn file_changed(engine: &mut Engine, path: impl AsRef<Path>) -> Result<bool, EngineError> {
    any_file_changed(engine, [path])
}

/// Has any of the files changed since the last call?
///
/// A missing file hashes as absent, so creation and deletion both count as a
/// change. Every file's hash is refreshed even after a change is found.
pub fn any_file_changed<I, P>(engine: &mut Engine, paths: I) -> Result<bool, EngineError>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut changed = false;
    for path in paths {
        let path = path.as_ref();
        let current = match std::fs::read(path) {
            Ok(bytes) => Value::String(hex_digest(&Sha256::digest(&bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Value::Null,
            Err(e) => {
                return Err(EngineError::Store(anyhow::Error::new(e).context(format!(
                    "Failed to hash file {}",
                    path.display()
                ))));
            }
        };
        let id = format!("file.{}", path.display());
        if data_changed(engine, &id, &current)? {
            changed = true;
        }
    }
    Ok(changed)
}

fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(64), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}
