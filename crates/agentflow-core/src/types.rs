//! Core data model for the workflow engine.
//!
//! These types mirror the data model section of the design: a static
//! [`Workflow`] of [`Step`]s, the dynamic [`StepRuntime`] each step owns once
//! a run starts, the persisted [`RunState`] aggregate, and the [`RunReport`]
//! a wrapper writes to signal completion.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current `RunState` schema version. Bump when the persisted shape changes
/// in a way readers of an older version need to know about.
pub const CURRENT_SCHEMA: u32 = 1;

fn current_schema_version() -> u32 {
    CURRENT_SCHEMA
}

/// Unique identifier. Uses `UUIDv7` so ids sort lexicographically by
/// creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Dynamic lifecycle state of a step instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    WaitingOnHuman,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::WaitingOnHuman => "WAITING_ON_HUMAN",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Whether this status satisfies a downstream step's `needs` edge.
    pub fn satisfies_needs(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

/// Terminal status a wrapper reports for a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    Completed,
    Failed,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

/// Raw, wire-format shape of a `loop` block as it appears in a workflow
/// document: an object carrying optional fields, at most one of which names
/// an item source. [`crate::workflow::load_workflow`] converts this into the
/// structural [`LoopSpec`] and rejects zero or multiple sources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopConfigRaw {
    #[serde(default)]
    pub items: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub items_from_step: Option<String>,
    #[serde(default)]
    pub items_from_artifact: Option<String>,
    #[serde(default)]
    pub item_var: Option<String>,
    #[serde(default)]
    pub index_var: Option<String>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
}

/// The loop-item source, modeled as a tagged sum rather than a struct with
/// optional fields: exactly one variant exists, so "exactly one source" is
/// structural, not a runtime check scattered across call sites.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoopItemSource {
    Inline { items: Vec<serde_json::Value> },
    FromStep { step_id: String },
    FromArtifact { path: String },
}

/// Resolved loop configuration for a declared step, post-validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopSpec {
    pub source: LoopItemSource,
    pub item_var: String,
    pub index_var: String,
    pub max_iterations: Option<u32>,
}

impl LoopSpec {
    pub const DEFAULT_ITEM_VAR: &'static str = "LOOP_ITEM";
    pub const DEFAULT_INDEX_VAR: &'static str = "LOOP_INDEX";
}

/// Static configuration for a single step in the declared workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub agent: String,
    pub prompt: String,
    #[serde(default)]
    pub needs: BTreeSet<String>,
    #[serde(default)]
    pub next_on_success: BTreeSet<String>,
    #[serde(default)]
    pub gates: Vec<String>,
    #[serde(default)]
    pub human_in_the_loop: bool,
    #[serde(default)]
    pub loop_back_to: Option<String>,
    #[serde(rename = "loop", default)]
    pub loop_config: Option<LoopConfigRaw>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// A named, immutable DAG loaded once per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<Step>,
}

impl Workflow {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Dynamic state for one step instance (post loop-expansion, one record per
/// materialized id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRuntime {
    pub status: StepStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub iteration_count: u32,
    #[serde(default)]
    pub report_path: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, String>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub manual_input_path: Option<String>,
    #[serde(default)]
    pub blocked_by_loop: Option<String>,
    /// For a loop-expanded declared step: the item list resolved the first
    /// time it became ready. Replayed verbatim on loop-back rather than
    /// re-resolved (see the resolved Open Question in the design notes).
    #[serde(default)]
    pub resolved_loop_items: Option<Vec<serde_json::Value>>,
}

impl StepRuntime {
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            attempts: 0,
            iteration_count: 0,
            report_path: None,
            started_at: None,
            ended_at: None,
            last_error: None,
            artifacts: Vec::new(),
            metrics: BTreeMap::new(),
            logs: Vec::new(),
            manual_input_path: None,
            blocked_by_loop: None,
            resolved_loop_items: None,
        }
    }

    /// Reset per-attempt fields ahead of a retry, preserving counters.
    pub fn reset_for_retry(&mut self) {
        self.status = StepStatus::Pending;
        self.started_at = None;
        self.ended_at = None;
        self.report_path = None;
    }

    /// Reset for a loop-back rewind, incrementing `iteration_count`.
    pub fn reset_for_loop_back(&mut self, blocked_by: &str) {
        self.status = StepStatus::Pending;
        self.attempts = 0;
        self.started_at = None;
        self.ended_at = None;
        self.report_path = None;
        self.last_error = None;
        self.artifacts.clear();
        self.metrics.clear();
        self.logs.clear();
        self.blocked_by_loop = Some(blocked_by.to_string());
        self.iteration_count += 1;
    }
}

/// Top-level persisted aggregate: one document per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default = "current_schema_version")]
    pub schema: u32,
    pub run_id: String,
    pub workflow_name: String,
    pub repo_dir: String,
    pub reports_dir: String,
    pub manual_inputs_dir: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub steps: BTreeMap<String, StepRuntime>,
    /// Fields from a newer schema version this build doesn't know about.
    /// Carried through load/save untouched so upgrading the writer doesn't
    /// lose data written by a future version reading an older document.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RunState {
    pub fn new(
        run_id: impl Into<String>,
        workflow_name: impl Into<String>,
        repo_dir: impl Into<String>,
        reports_dir: impl Into<String>,
        manual_inputs_dir: impl Into<String>,
        steps: BTreeMap<String, StepRuntime>,
    ) -> Self {
        let now = Utc::now();
        Self {
            schema: CURRENT_SCHEMA,
            run_id: run_id.into(),
            workflow_name: workflow_name.into(),
            repo_dir: repo_dir.into(),
            reports_dir: reports_dir.into(),
            manual_inputs_dir: manual_inputs_dir.into(),
            created_at: now,
            updated_at: now,
            steps,
            extra: serde_json::Map::new(),
        }
    }
}

/// Report produced by a wrapper, consumed by the core once validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub schema: u32,
    pub run_id: String,
    pub step_id: String,
    pub agent: String,
    pub status: ReportStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Coerced to strings by the validator's normalize step regardless of
    /// the wire-format JSON value type.
    #[serde(default)]
    pub metrics: BTreeMap<String, String>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub gate_failure: bool,
    #[serde(default)]
    pub next_suggested_steps: Vec<String>,
}
