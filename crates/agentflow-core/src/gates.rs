//! Gate evaluation (component C).
//!
//! Gates are backed by an external JSON document mapping gate key to a
//! boolean, reloaded on every call so a human or CI job can flip a gate open
//! between scheduler ticks without restarting the run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GateError>;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("failed to read gate state at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("gate state at {path} is not a JSON object of key -> bool: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Evaluates whether a step's declared gates are open.
#[derive(Debug, Clone)]
pub struct GateEvaluator {
    gate_state_path: Option<PathBuf>,
}

impl GateEvaluator {
    /// No gate file configured: every gate is always open.
    pub fn always_open() -> Self {
        Self {
            gate_state_path: None,
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            gate_state_path: Some(path.into()),
        }
    }

    /// Whether every gate key named in `gates` currently evaluates truthy.
    /// A step with an empty `gates` list is always open.
    pub fn open(&self, gates: &[String]) -> Result<bool> {
        if gates.is_empty() {
            return Ok(true);
        }
        let Some(path) = &self.gate_state_path else {
            return Ok(true);
        };
        let state = read_gate_state(path)?;
        Ok(gates.iter().all(|key| state.get(key).copied().unwrap_or(false)))
    }
}

fn read_gate_state(path: &Path) -> Result<BTreeMap<String, bool>> {
    let content = std::fs::read_to_string(path).map_err(|source| GateError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| GateError::Invalid {
        path: path.to_path_buf(),
        source,
    })
}
