//! Run-state persistence (component B).
//!
//! A run's entire dynamic state lives in one JSON document,
//! `run_state.json`, rather than split across multiple files or a database.
//! Writes go to a sibling temp file and are renamed into place so a reader
//! never observes a half-written document.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::types::RunState;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read run state at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write run state at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("run state at {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Load the run state document at `path`. Returns `Ok(None)` when the file
/// doesn't exist yet (a brand-new run); any other IO failure or a corrupt
/// document is an error.
pub fn load(path: &Path) -> Result<Option<RunState>> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let state = serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
                path: path.to_path_buf(),
                source,
            })?;
            Ok(Some(state))
        }
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StoreError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Persist `state` to `path`, refreshing `updated_at` first. Writes are
/// atomic: the new document lands in a sibling temp file, then a rename
/// swaps it into place.
pub fn save(path: &Path, state: &mut RunState) -> Result<()> {
    state.updated_at = chrono::Utc::now();
    let serialized = serde_json::to_string_pretty(state).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    })?;

    let tmp_path = parent.join(format!(
        ".{}.tmp",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("run_state.json")
    ));
    std::fs::write(&tmp_path, serialized).map_err(|source| StoreError::Write {
        path: tmp_path.clone(),
        source,
    })?;
    std::fs::rename(&tmp_path, path).map_err(|source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}
