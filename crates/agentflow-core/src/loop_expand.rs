//! Loop expansion (component E).
//!
//! Turns one declared step carrying a `loop` block into N child runtime
//! instances, one per resolved item, each depending serially on the
//! previous child. Item resolution happens once, at the moment the declared
//! step becomes ready; the resolved list is then cached on the declared
//! step's runtime (`StepRuntime::resolved_loop_items`) and replayed verbatim
//! on any later loop-back rewind rather than re-resolved.

use std::path::Path;

use serde_json::Value;
use thiserror::Error;

use crate::types::{LoopItemSource, LoopSpec, StepRuntime};

pub type Result<T> = std::result::Result<T, LoopExpandError>;

#[derive(Debug, Error)]
pub enum LoopExpandError {
    #[error("loop source step {0:?} has not produced a runtime record yet")]
    PredecessorMissing(String),
    #[error("loop source step {0:?} produced neither an artifact nor a loop_items metric")]
    NoResolvableItems(String),
    #[error("failed to read loop item source file {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("loop item source {path} did not contain a JSON array: {source}")]
    Parse {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Separator between a declared step id and its loop-expanded child index.
pub const CHILD_SEPARATOR: &str = "__";

/// One materialized child instance of a loop-expanded declared step.
#[derive(Debug, Clone)]
pub struct LoopChild {
    pub id: String,
    pub index: u32,
    pub item: Value,
    /// The prior sibling's id; `None` for the first child. The scheduler's
    /// admit step requires this sibling to be COMPLETED before the child is
    /// eligible to run, enforcing ordered iteration.
    pub prev_sibling: Option<String>,
}

/// Resolve the declared step's loop items from its configured source.
/// `predecessor` is the `StepRuntime` of the step named by `items_from_step`,
/// when that source variant is used.
pub fn resolve_items(
    source: &LoopItemSource,
    repo_dir: &Path,
    predecessor: Option<&StepRuntime>,
) -> Result<Vec<Value>> {
    match source {
        LoopItemSource::Inline { items } => Ok(items.clone()),
        LoopItemSource::FromArtifact { path } => read_json_array(&repo_dir.join(path)),
        LoopItemSource::FromStep { step_id } => {
            let predecessor = predecessor
                .ok_or_else(|| LoopExpandError::PredecessorMissing(step_id.clone()))?;
            if let Some(first_artifact) = predecessor.artifacts.first() {
                return read_json_array(&repo_dir.join(first_artifact));
            }
            if let Some(raw) = predecessor.metrics.get("loop_items") {
                let path = std::path::PathBuf::from(format!("metrics:{step_id}.loop_items"));
                return serde_json::from_str::<Vec<Value>>(raw)
                    .map_err(|source| LoopExpandError::Parse { path, source });
            }
            Err(LoopExpandError::NoResolvableItems(step_id.clone()))
        }
    }
}

fn read_json_array(path: &Path) -> Result<Vec<Value>> {
    let content = std::fs::read_to_string(path).map_err(|source| LoopExpandError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| LoopExpandError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Materialize child instances from a resolved item list, applying
/// `max_iterations` as a hard cap on the count (extra items are dropped; the
/// caller should log when that happens).
pub fn expand_children(declared_id: &str, items: &[Value], spec: &LoopSpec) -> Vec<LoopChild> {
    let capped: &[Value] = match spec.max_iterations {
        Some(max) => &items[..items.len().min(max as usize)],
        None => items,
    };
    let width = capped.len().to_string().len().max(2);
    let mut prev: Option<String> = None;
    capped
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let id = format!("{declared_id}{CHILD_SEPARATOR}{index:0width$}");
            let child = LoopChild {
                id: id.clone(),
                index: index as u32,
                item: item.clone(),
                prev_sibling: prev.clone(),
            };
            prev = Some(id);
            child
        })
        .collect()
}

/// Split a materialized child id back into its declared step id, if `id`
/// follows the `<declared>__<NN>` convention.
pub fn declared_step_of(id: &str) -> Option<&str> {
    id.rsplit_once(CHILD_SEPARATOR)
        .filter(|(_, suffix)| !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()))
        .map(|(declared, _)| declared)
}
