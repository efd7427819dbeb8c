//! Atomic single-file JSON persistence.
//!
//! Every durable store rewrites its whole document through a temp file and a
//! rename, so a reader after a crash observes either the previous or the new
//! state, never a partial write. A corrupt file is logged and replaced with
//! the default — data the component never wrote is never lost silently.

use overseer_core::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Clone, Debug)]
pub struct JsonState {
    path: PathBuf,
}

impl JsonState {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document, falling back to the default on absence or corruption.
    pub fn load_or_default<T: DeserializeOwned + Default>(&self) -> T {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "state file unreadable, starting empty");
                return T::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "state file corrupt, starting empty");
                T::default()
            }
        }
    }

    /// Write the whole document atomically: temp file, then rename.
    pub fn save<T: Serialize>(&self, value: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(value)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
