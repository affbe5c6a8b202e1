//! Workflow loading and one-time DAG validation (component H).
//!
//! Parses a workflow definition from JSON and validates the invariants the
//! rest of the engine assumes hold for the lifetime of a run: no cycles,
//! every reference resolves, every `loop_back_to` target is a genuine
//! ancestor, and every `loop` block names exactly one item source. None of
//! this is re-checked once a run starts ticking.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::Path;

use thiserror::Error;

use crate::types::{LoopItemSource, LoopSpec, Step, Workflow};

pub type Result<T> = std::result::Result<T, WorkflowError>;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("failed to read workflow file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse workflow JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("duplicate step id {0:?}")]
    DuplicateStepId(String),
    #[error("step {step:?} references unknown step {target:?} in {field}")]
    DanglingReference {
        step: String,
        field: &'static str,
        target: String,
    },
    #[error("cycle detected in step dependencies involving {0:?}")]
    Cycle(String),
    #[error("step {step:?} declares loop_back_to {target:?}, which is not an ancestor of {step:?}")]
    InvalidLoopBackTarget { step: String, target: String },
    #[error("step {step:?} loop block must name exactly one item source, found {count}")]
    LoopSourceCount { step: String, count: usize },
}

/// Load and validate a workflow document from a filesystem path.
pub fn load_workflow(path: &Path) -> Result<Workflow> {
    let content = std::fs::read_to_string(path).map_err(|source| WorkflowError::Io {
        path: path.display().to_string(),
        source,
    })?;
    load_workflow_str(&content)
}

/// Load and validate a workflow document from an in-memory JSON string.
pub fn load_workflow_str(content: &str) -> Result<Workflow> {
    let workflow: Workflow = serde_json::from_str(content)?;
    validate(&workflow)?;
    Ok(workflow)
}

/// Validate DAG invariants on an already-parsed workflow. Exposed so callers
/// that construct a `Workflow` programmatically (tests, embedders) can reuse
/// the same checks the file loader applies.
pub fn validate(workflow: &Workflow) -> Result<()> {
    let mut seen = HashSet::new();
    for step in &workflow.steps {
        if !seen.insert(step.id.clone()) {
            return Err(WorkflowError::DuplicateStepId(step.id.clone()));
        }
    }

    let ids: HashSet<&str> = workflow.steps.iter().map(|s| s.id.as_str()).collect();
    for step in &workflow.steps {
        for target in &step.needs {
            if !ids.contains(target.as_str()) {
                return Err(WorkflowError::DanglingReference {
                    step: step.id.clone(),
                    field: "needs",
                    target: target.clone(),
                });
            }
        }
        for target in &step.next_on_success {
            if !ids.contains(target.as_str()) {
                return Err(WorkflowError::DanglingReference {
                    step: step.id.clone(),
                    field: "next_on_success",
                    target: target.clone(),
                });
            }
        }
        if let Some(target) = &step.loop_back_to {
            if !ids.contains(target.as_str()) {
                return Err(WorkflowError::DanglingReference {
                    step: step.id.clone(),
                    field: "loop_back_to",
                    target: target.clone(),
                });
            }
        }
    }

    check_acyclic(workflow)?;

    for step in &workflow.steps {
        if let Some(target) = &step.loop_back_to {
            let ancestors = ancestors(workflow, &step.id);
            if !ancestors.contains(target) {
                return Err(WorkflowError::InvalidLoopBackTarget {
                    step: step.id.clone(),
                    target: target.clone(),
                });
            }
        }
        if let Some(raw) = &step.loop_config {
            resolve_loop_spec(&step.id, raw)?;
        }
    }

    Ok(())
}

/// Convert a step's wire-format `loop` block into the structural
/// [`LoopSpec`], failing unless exactly one item source is present.
pub fn resolve_loop_spec(
    step_id: &str,
    raw: &crate::types::LoopConfigRaw,
) -> Result<LoopSpec> {
    let mut sources = Vec::new();
    if let Some(items) = &raw.items {
        sources.push(LoopItemSource::Inline {
            items: items.clone(),
        });
    }
    if let Some(step) = &raw.items_from_step {
        sources.push(LoopItemSource::FromStep {
            step_id: step.clone(),
        });
    }
    if let Some(path) = &raw.items_from_artifact {
        sources.push(LoopItemSource::FromArtifact { path: path.clone() });
    }
    if sources.len() != 1 {
        return Err(WorkflowError::LoopSourceCount {
            step: step_id.to_string(),
            count: sources.len(),
        });
    }
    Ok(LoopSpec {
        source: sources.into_iter().next().expect("checked len == 1"),
        item_var: raw
            .item_var
            .clone()
            .unwrap_or_else(|| LoopSpec::DEFAULT_ITEM_VAR.to_string()),
        index_var: raw
            .index_var
            .clone()
            .unwrap_or_else(|| LoopSpec::DEFAULT_INDEX_VAR.to_string()),
        max_iterations: raw.max_iterations,
    })
}

/// Kahn's algorithm over the `needs` edges; a non-empty remainder after
/// peeling off all steps with satisfied indegree means a cycle exists.
fn check_acyclic(workflow: &Workflow) -> Result<()> {
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in &workflow.steps {
        indegree.entry(step.id.as_str()).or_insert(0);
        for need in &step.needs {
            *indegree.entry(step.id.as_str()).or_insert(0) += 1;
            dependents.entry(need.as_str()).or_default().push(step.id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0usize;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        if let Some(deps) = dependents.get(id) {
            for dependent in deps {
                let entry = indegree.get_mut(dependent).expect("known step");
                *entry -= 1;
                if *entry == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    if visited != workflow.steps.len() {
        let stuck = workflow
            .steps
            .iter()
            .find(|s| indegree.get(s.id.as_str()).copied().unwrap_or(0) > 0)
            .map(|s| s.id.clone())
            .unwrap_or_default();
        return Err(WorkflowError::Cycle(stuck));
    }
    Ok(())
}

/// All steps transitively required by `step_id` via `needs` (not including
/// `step_id` itself).
pub fn ancestors(workflow: &Workflow, step_id: &str) -> BTreeSet<String> {
    let by_id: HashMap<&str, &Step> = workflow.steps.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut result = BTreeSet::new();
    let mut stack: Vec<&str> = by_id
        .get(step_id)
        .map(|s| s.needs.iter().map(String::as_str).collect())
        .unwrap_or_default();
    while let Some(id) = stack.pop() {
        if result.insert(id.to_string()) {
            if let Some(step) = by_id.get(id) {
                stack.extend(step.needs.iter().map(String::as_str));
            }
        }
    }
    result
}

/// All steps that transitively depend on `step_id` via `needs` (not
/// including `step_id` itself).
pub fn descendants(workflow: &Workflow, step_id: &str) -> BTreeSet<String> {
    let mut result = BTreeSet::new();
    let mut stack = vec![step_id.to_string()];
    while let Some(id) = stack.pop() {
        for step in &workflow.steps {
            if step.needs.contains(&id) && result.insert(step.id.clone()) {
                stack.push(step.id.clone());
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow_json(steps: &str) -> String {
        format!(r#"{{"name":"w","description":"","steps":[{steps}]}}"#)
    }

    #[test]
    fn loads_linear_workflow() {
        let json = workflow_json(
            r#"{"id":"a","agent":"x","prompt":"a.md","needs":[]},
               {"id":"b","agent":"x","prompt":"b.md","needs":["a"]}"#,
        );
        let wf = load_workflow_str(&json).unwrap();
        assert_eq!(wf.steps.len(), 2);
    }

    #[test]
    fn rejects_dangling_needs() {
        let json = workflow_json(r#"{"id":"a","agent":"x","prompt":"a.md","needs":["ghost"]}"#);
        let err = load_workflow_str(&json).unwrap_err();
        assert!(matches!(err, WorkflowError::DanglingReference { .. }));
    }

    #[test]
    fn rejects_cycle() {
        let json = workflow_json(
            r#"{"id":"a","agent":"x","prompt":"a.md","needs":["b"]},
               {"id":"b","agent":"x","prompt":"b.md","needs":["a"]}"#,
        );
        let err = load_workflow_str(&json).unwrap_err();
        assert!(matches!(err, WorkflowError::Cycle(_)));
    }

    #[test]
    fn rejects_duplicate_step_id() {
        let json = workflow_json(
            r#"{"id":"a","agent":"x","prompt":"a.md","needs":[]},
               {"id":"a","agent":"x","prompt":"a2.md","needs":[]}"#,
        );
        let err = load_workflow_str(&json).unwrap_err();
        assert!(matches!(err, WorkflowError::DuplicateStepId(_)));
    }

    #[test]
    fn rejects_loop_back_to_non_ancestor() {
        let json = workflow_json(
            r#"{"id":"a","agent":"x","prompt":"a.md","needs":[]},
               {"id":"b","agent":"x","prompt":"b.md","needs":[],"loop_back_to":"a"}"#,
        );
        let err = load_workflow_str(&json).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidLoopBackTarget { .. }));
    }

    #[test]
    fn accepts_loop_back_to_ancestor() {
        let json = workflow_json(
            r#"{"id":"code","agent":"x","prompt":"c.md","needs":[]},
               {"id":"review","agent":"x","prompt":"r.md","needs":["code"],"loop_back_to":"code"}"#,
        );
        load_workflow_str(&json).unwrap();
    }

    #[test]
    fn rejects_loop_with_zero_sources() {
        let json = workflow_json(
            r#"{"id":"a","agent":"x","prompt":"a.md","needs":[],"loop":{}}"#,
        );
        let err = load_workflow_str(&json).unwrap_err();
        assert!(matches!(err, WorkflowError::LoopSourceCount { count: 0, .. }));
    }

    #[test]
    fn rejects_loop_with_two_sources() {
        let json = workflow_json(
            r#"{"id":"a","agent":"x","prompt":"a.md","needs":[],
                "loop":{"items":[1,2],"items_from_artifact":"x.json"}}"#,
        );
        let err = load_workflow_str(&json).unwrap_err();
        assert!(matches!(err, WorkflowError::LoopSourceCount { count: 2, .. }));
    }

    #[test]
    fn ancestors_and_descendants_agree_on_linear_chain() {
        let json = workflow_json(
            r#"{"id":"a","agent":"x","prompt":"a.md","needs":[]},
               {"id":"b","agent":"x","prompt":"b.md","needs":["a"]},
               {"id":"c","agent":"x","prompt":"c.md","needs":["b"]}"#,
        );
        let wf = load_workflow_str(&json).unwrap();
        let anc = ancestors(&wf, "c");
        assert!(anc.contains("a") && anc.contains("b"));
        let desc = descendants(&wf, "a");
        assert!(desc.contains("b") && desc.contains("c"));
    }
}
