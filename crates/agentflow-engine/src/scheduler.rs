//! Scheduler / Orchestrator (component F).
//!
//! A single cooperative loop driving an arbitrary `needs`-DAG of steps, as
//! opposed to a fixed pipeline: every tick, it admits newly-ready steps,
//! collects outcomes from running ones, resolves state transitions, and
//! checks for a terminal condition before sleeping. All subprocess and
//! filesystem interaction is non-blocking; the only suspension point is the
//! top-of-loop sleep.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use agentflow_core::gates::GateEvaluator;
use agentflow_core::loop_expand::{self, LoopExpandError};
use agentflow_core::notify::{NotificationDispatcher, NotificationEvent, NotificationPayload};
use agentflow_core::report::{self, ValidatorConfig, ValidatorError};
use agentflow_core::store;
use agentflow_core::types::{
    LoopSpec, RunState, Step, StepRuntime, StepStatus, Workflow,
};
use agentflow_core::workflow::{self, WorkflowError};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::runner::{LaunchedStep, Outcome, RunLayout, StepRunner};

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    Store(#[from] agentflow_core::store::StoreError),
    #[error(transparent)]
    Gate(#[from] agentflow_core::gates::GateError),
    #[error(transparent)]
    LoopExpand(#[from] LoopExpandError),
    #[error("step {0:?} declares a loop block that failed to resolve: {1}")]
    LoopSpec(String, String),
    #[error("resume target {0:?} is not a known step")]
    UnknownResumeTarget(String),
}

/// Tunables the scheduler itself consumes; a subset of [`agentflow_core::config::Config`].
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub max_iterations: u32,
    pub pause_for_human_input: bool,
    pub start_at_step: Option<String>,
    pub cancellation_grace_period: Duration,
    pub env_overrides: BTreeMap<String, String>,
}

/// Final result of running a workflow to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failure,
}

struct RunningChild {
    declared_id: String,
    launched: LaunchedStep,
}

/// Drives one run of a [`Workflow`] against a [`RunLayout`].
pub struct Scheduler {
    workflow: Workflow,
    runner: StepRunner,
    gates: GateEvaluator,
    dispatcher: NotificationDispatcher,
    report_config: ValidatorConfig,
    options: SchedulerOptions,
    run_id: String,
    state_path: PathBuf,
    state: RunState,
    running: BTreeMap<String, RunningChild>,
    cancelled: bool,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workflow: Workflow,
        runner: StepRunner,
        gates: GateEvaluator,
        dispatcher: NotificationDispatcher,
        report_config: ValidatorConfig,
        options: SchedulerOptions,
        run_id: String,
        repo_dir: PathBuf,
        reports_dir: PathBuf,
        manual_inputs_dir: PathBuf,
        state_path: PathBuf,
    ) -> Result<Self> {
        let mut state = store::load(&state_path)?.unwrap_or_else(|| {
            let mut steps = BTreeMap::new();
            for step in &workflow.steps {
                steps.insert(step.id.clone(), StepRuntime::pending());
            }
            RunState::new(
                run_id.clone(),
                workflow.name.clone(),
                repo_dir.display().to_string(),
                reports_dir.display().to_string(),
                manual_inputs_dir.display().to_string(),
                steps,
            )
        });

        for step in &workflow.steps {
            state.steps.entry(step.id.clone()).or_insert_with(StepRuntime::pending);
        }

        if let Some(target) = &options.start_at_step {
            apply_resume(&workflow, &mut state, target)?;
        }

        Ok(Self {
            workflow,
            runner,
            gates,
            dispatcher,
            report_config,
            options,
            run_id,
            state_path,
            state,
            running: BTreeMap::new(),
            cancelled: false,
        })
    }

    pub fn request_cancellation(&mut self) {
        self.cancelled = true;
    }

    /// Run the scheduler loop to completion, ticking until every step is
    /// terminal or cancellation has fully unwound.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        loop {
            if self.cancelled {
                self.cancel_all().await;
                self.persist()?;
                return Ok(RunOutcome::Failure);
            }

            self.resume_waiting_on_human()?;
            self.admit()?;
            self.collect().await?;
            if self.reconcile_loop_groups() {
                self.persist()?;
            }

            if self.is_terminal() {
                self.persist()?;
                return Ok(self.outcome());
            }

            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    fn outcome(&self) -> RunOutcome {
        let any_failed = self
            .state
            .steps
            .values()
            .any(|rt| rt.status == StepStatus::Failed);
        if any_failed {
            RunOutcome::Failure
        } else {
            RunOutcome::Success
        }
    }

    fn is_terminal(&self) -> bool {
        self.state.steps.values().all(|rt| rt.status.is_terminal())
    }

    fn declared_step(&self, materialized_id: &str) -> Option<&Step> {
        let declared = loop_expand::declared_step_of(materialized_id).unwrap_or(materialized_id);
        self.workflow.step(declared)
    }

    /// Materialized ids currently present in state for a declared step: the
    /// step itself if not loop-expanded, or its children.
    fn materialized_ids_for(&self, declared_id: &str) -> Vec<String> {
        let prefix = format!("{declared_id}{}", loop_expand::CHILD_SEPARATOR);
        let mut ids: Vec<String> = self
            .state
            .steps
            .keys()
            .filter(|id| id.as_str() == declared_id || id.starts_with(&prefix))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn admit(&mut self) -> Result<()> {
        if self.cancelled {
            return Ok(());
        }

        for step in self.workflow.steps.clone() {
            if step.loop_config.is_some() {
                self.admit_loop_step(&step)?;
            } else {
                self.admit_plain_step(&step)?;
            }
        }
        Ok(())
    }

    fn needs_satisfied(&self, step: &Step) -> bool {
        step.needs.iter().all(|need| {
            self.materialized_ids_for(need)
                .iter()
                .all(|id| {
                    self.state
                        .steps
                        .get(id)
                        .map(|rt| rt.status.satisfies_needs())
                        .unwrap_or(false)
                })
                && !self.materialized_ids_for(need).is_empty()
        })
    }

    fn admit_plain_step(&mut self, step: &Step) -> Result<()> {
        let ready = {
            let Some(runtime) = self.state.steps.get(&step.id) else {
                return Ok(());
            };
            runtime.status == StepStatus::Pending
        };
        if !ready || !self.needs_satisfied(step) {
            return Ok(());
        }
        if !self.gates.open(&step.gates)? {
            return Ok(());
        }
        self.launch_one(&step.id, step, None)
    }

    fn admit_loop_step(&mut self, step: &Step) -> Result<()> {
        let raw = step.loop_config.as_ref().expect("checked by caller");
        let spec = workflow::resolve_loop_spec(&step.id, raw)
            .map_err(|e| SchedulerError::LoopSpec(step.id.clone(), e.to_string()))?;

        let declared_ready = {
            let Some(runtime) = self.state.steps.get(&step.id) else {
                return Ok(());
            };
            runtime.status == StepStatus::Pending
        };

        if declared_ready {
            if !self.needs_satisfied(step) {
                return Ok(());
            }
            self.materialize_loop_children(step, &spec)?;
        }

        let child_ids = self.materialized_ids_for(&step.id);
        for (index, child_id) in child_ids.iter().enumerate() {
            if child_id == &step.id {
                continue;
            }
            let ready = self
                .state
                .steps
                .get(child_id)
                .map(|rt| rt.status == StepStatus::Pending)
                .unwrap_or(false);
            if !ready {
                continue;
            }
            let prev_ready = if index == 0 {
                true
            } else {
                self.state
                    .steps
                    .get(&child_ids[index - 1])
                    .map(|rt| rt.status.satisfies_needs())
                    .unwrap_or(false)
            };
            if !prev_ready {
                continue;
            }
            if !self.gates.open(&step.gates)? {
                continue;
            }
            let item = self.loop_item_for(step, &spec, child_id);
            self.launch_one(child_id, step, item)?;
        }
        Ok(())
    }

    fn loop_item_for(&self, step: &Step, spec: &LoopSpec, child_id: &str) -> Option<(String, Value, String, u32)> {
        let resolved = self.state.steps.get(&step.id)?.resolved_loop_items.clone()?;
        let index: usize = child_id
            .rsplit_once(loop_expand::CHILD_SEPARATOR)?
            .1
            .parse()
            .ok()?;
        let item = resolved.get(index)?.clone();
        Some((spec.item_var.clone(), item, spec.index_var.clone(), index as u32))
    }

    fn materialize_loop_children(&mut self, step: &Step, spec: &LoopSpec) -> Result<()> {
        let already_materialized = self.materialized_ids_for(&step.id).len() > 1;
        if already_materialized {
            return Ok(());
        }

        let predecessor = match &spec.source {
            agentflow_core::types::LoopItemSource::FromStep { step_id } => {
                self.state.steps.get(step_id).cloned()
            }
            _ => None,
        };
        let items = loop_expand::resolve_items(&spec.source, &self.runner.layout.repo_dir, predecessor.as_ref())?;
        let children = loop_expand::expand_children(&step.id, &items, spec);

        if let Some(runtime) = self.state.steps.get_mut(&step.id) {
            runtime.resolved_loop_items = Some(items);
            if children.is_empty() {
                runtime.status = StepStatus::Skipped;
            }
        }
        for child in &children {
            self.state.steps.insert(child.id.clone(), StepRuntime::pending());
        }
        Ok(())
    }

    /// Roll up every materialized loop-expanded group onto its declared
    /// step: COMPLETED once all children satisfy `needs`, or FAILED (along
    /// with any sibling still stuck behind the failure) as soon as one child
    /// fails permanently. Without this the declared step's own runtime never
    /// leaves PENDING, so it never becomes terminal and nothing depending on
    /// it via `needs` can ever admit. Returns whether any runtime changed.
    fn reconcile_loop_groups(&mut self) -> bool {
        let declared_ids: Vec<String> = self
            .workflow
            .steps
            .iter()
            .filter(|s| s.loop_config.is_some())
            .map(|s| s.id.clone())
            .collect();

        let mut changed = false;
        for declared_id in declared_ids {
            let already_terminal = self
                .state
                .steps
                .get(&declared_id)
                .map(|rt| rt.status.is_terminal())
                .unwrap_or(true);
            if already_terminal {
                continue;
            }

            let children: Vec<String> = self
                .materialized_ids_for(&declared_id)
                .into_iter()
                .filter(|id| id != &declared_id)
                .collect();
            if children.is_empty() {
                continue;
            }

            let failed_child = children.iter().find(|id| {
                self.state
                    .steps
                    .get(id.as_str())
                    .map(|rt| rt.status == StepStatus::Failed)
                    .unwrap_or(false)
            });

            if let Some(failed_child) = failed_child.cloned() {
                for id in &children {
                    if let Some(runtime) = self.state.steps.get_mut(id) {
                        if !runtime.status.is_terminal() {
                            runtime.status = StepStatus::Failed;
                            runtime.ended_at = Some(chrono::Utc::now());
                            runtime.last_error =
                                Some(format!("blocked by failed sibling {failed_child}"));
                        }
                    }
                }
                if let Some(runtime) = self.state.steps.get_mut(&declared_id) {
                    runtime.status = StepStatus::Failed;
                    runtime.ended_at = Some(chrono::Utc::now());
                    runtime.last_error = Some(format!("loop child {failed_child} failed"));
                }
                warn!(step_id = %declared_id, failed_child = %failed_child, "loop group failed, rolling up");
                changed = true;
                continue;
            }

            let all_satisfied = children.iter().all(|id| {
                self.state
                    .steps
                    .get(id)
                    .map(|rt| rt.status.satisfies_needs())
                    .unwrap_or(false)
            });
            if !all_satisfied {
                continue;
            }

            let mut artifacts = Vec::new();
            let mut logs = Vec::new();
            let mut metrics = std::collections::BTreeMap::new();
            for id in &children {
                if let Some(rt) = self.state.steps.get(id) {
                    artifacts.extend(rt.artifacts.iter().cloned());
                    logs.extend(rt.logs.iter().cloned());
                    metrics.extend(rt.metrics.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
            if let Some(runtime) = self.state.steps.get_mut(&declared_id) {
                runtime.status = StepStatus::Completed;
                runtime.ended_at = Some(chrono::Utc::now());
                runtime.artifacts = artifacts;
                runtime.logs = logs;
                runtime.metrics = metrics;
            }
            info!(step_id = %declared_id, "loop group completed, rolling up");
            changed = true;
        }
        changed
    }

    fn launch_one(&mut self, materialized_id: &str, declared: &Step, loop_item: Option<(String, Value, String, u32)>) -> Result<()> {
        let human_in_the_loop = declared.human_in_the_loop && self.options.pause_for_human_input;

        if human_in_the_loop {
            let manual_input_path = self.runner.layout.manual_input_path(materialized_id);
            let attempt = self
                .state
                .steps
                .get(materialized_id)
                .map(|rt| rt.attempts)
                .unwrap_or(0);
            if let Some(runtime) = self.state.steps.get_mut(materialized_id) {
                runtime.status = StepStatus::WaitingOnHuman;
                runtime.manual_input_path = Some(manual_input_path.display().to_string());
                runtime.started_at = Some(chrono::Utc::now());
            }
            info!(step_id = materialized_id, "step entered WAITING_ON_HUMAN");
            self.dispatcher.notify(NotificationEvent::step_paused(NotificationPayload {
                run_id: self.run_id.clone(),
                step_id: materialized_id.to_string(),
                attempts: attempt,
                iteration_count: self.iteration_count(materialized_id),
                log_tail: None,
                manual_input_path: Some(manual_input_path.display().to_string()),
            }));
            return Ok(());
        }

        self.do_launch(materialized_id, declared, loop_item, None)
    }

    /// Spawn the wrapper for a step unconditionally: used for a fresh launch
    /// (no `human_in_the_loop`) and for resuming a step out of
    /// WAITING_ON_HUMAN once its manual input file has appeared.
    fn do_launch(
        &mut self,
        materialized_id: &str,
        declared: &Step,
        loop_item: Option<(String, Value, String, u32)>,
        manual_input: Option<serde_json::Map<String, Value>>,
    ) -> Result<()> {
        let env_overrides = self.options.env_overrides.clone();
        let upstream: BTreeMap<String, StepRuntime> = declared
            .needs
            .iter()
            .flat_map(|need| self.materialized_ids_for(need))
            .filter_map(|id| self.state.steps.get(&id).map(|rt| (id, rt.clone())))
            .collect();

        let report_path = self.runner.layout.report_path(materialized_id);
        let prompt_path = match self.runner.resolve_prompt(declared) {
            Ok(p) => p,
            Err(err) => {
                warn!(step_id = materialized_id, error = %err, "prompt resolution failed");
                self.fail_step(materialized_id, err.to_string());
                return Ok(());
            }
        };

        let loop_ctx = loop_item
            .as_ref()
            .map(|(iv, item, idxv, idx)| (iv.as_str(), item, idxv.as_str(), *idx));

        let attempt = self
            .state
            .steps
            .get(materialized_id)
            .map(|rt| rt.attempts + 1)
            .unwrap_or(1);

        let env = self.runner.assemble_env(
            declared,
            materialized_id,
            &prompt_path,
            &report_path,
            &env_overrides,
            &upstream,
            loop_ctx,
            manual_input.as_ref(),
        );

        let timeout = declared.timeout_secs.map(Duration::from_secs);
        match self.runner.launch(declared, materialized_id, attempt, &env, timeout) {
            Ok(launched) => {
                if let Some(runtime) = self.state.steps.get_mut(materialized_id) {
                    runtime.status = StepStatus::Running;
                    runtime.attempts = attempt;
                    runtime.started_at = Some(chrono::Utc::now());
                    runtime.manual_input_path = None;
                }
                self.running.insert(
                    materialized_id.to_string(),
                    RunningChild {
                        declared_id: declared.id.clone(),
                        launched,
                    },
                );
            }
            Err(err) => {
                warn!(step_id = materialized_id, error = %err, "failed to launch step");
                self.fail_step(materialized_id, err.to_string());
            }
        }
        Ok(())
    }

    /// Scan every WAITING_ON_HUMAN step for its awaited manual input file;
    /// resume to RUNNING as soon as it appears, merging its contents into the
    /// wrapper's env (§4.6: "manual input file appears" -> RUNNING).
    fn resume_waiting_on_human(&mut self) -> Result<()> {
        let waiting: Vec<String> = self
            .state
            .steps
            .iter()
            .filter(|(_, rt)| rt.status == StepStatus::WaitingOnHuman)
            .map(|(id, _)| id.clone())
            .collect();

        for materialized_id in waiting {
            let Some(path_str) = self
                .state
                .steps
                .get(&materialized_id)
                .and_then(|rt| rt.manual_input_path.clone())
            else {
                continue;
            };
            let path = PathBuf::from(&path_str);
            if !path.exists() {
                continue;
            }
            let manual_input = match read_manual_input(&path) {
                Ok(v) => v,
                Err(err) => {
                    warn!(step_id = %materialized_id, error = %err, "manual input file is not a JSON object; leaving step paused");
                    continue;
                }
            };
            let Some(declared) = self.declared_step(&materialized_id).cloned() else {
                continue;
            };
            let loop_item = declared
                .loop_config
                .as_ref()
                .and_then(|raw| workflow::resolve_loop_spec(&declared.id, raw).ok())
                .and_then(|spec| self.loop_item_for(&declared, &spec, &materialized_id));
            info!(step_id = %materialized_id, "manual input arrived, resuming");
            self.do_launch(&materialized_id, &declared, loop_item, Some(manual_input))?;
        }
        Ok(())
    }

    fn iteration_count(&self, materialized_id: &str) -> u32 {
        self.state
            .steps
            .get(materialized_id)
            .map(|rt| rt.iteration_count)
            .unwrap_or(0)
    }

    fn fail_step(&mut self, materialized_id: &str, error: String) {
        if let Some(runtime) = self.state.steps.get_mut(materialized_id) {
            runtime.status = StepStatus::Failed;
            runtime.ended_at = Some(chrono::Utc::now());
            runtime.last_error = Some(error.clone());
        }
        self.dispatcher.notify(NotificationEvent::step_failed(NotificationPayload {
            run_id: self.run_id.clone(),
            step_id: materialized_id.to_string(),
            attempts: self
                .state
                .steps
                .get(materialized_id)
                .map(|rt| rt.attempts)
                .unwrap_or(0),
            iteration_count: self.iteration_count(materialized_id),
            log_tail: None,
            manual_input_path: None,
        }));
    }

    async fn collect(&mut self) -> Result<()> {
        let ids: Vec<String> = self.running.keys().cloned().collect();
        for id in ids {
            let outcome = {
                let running = self.running.get_mut(&id).expect("known running id");
                StepRunner::poll(&mut running.launched)
            };
            match outcome {
                Outcome::StillRunning => continue,
                Outcome::ReportArrived => self.resolve_report(&id).await?,
                Outcome::ChildExitedWithoutReport => self.resolve_no_report(&id, "child exited without report"),
                Outcome::Timeout => {
                    if let Some(mut running) = self.running.remove(&id) {
                        StepRunner::terminate(&mut running.launched, self.options.cancellation_grace_period).await;
                    }
                    self.resolve_no_report(&id, "step timed out");
                }
            }
        }

        for (id, mut running) in std::mem::take(&mut self.running) {
            if matches!(StepRunner::poll(&mut running.launched), Outcome::StillRunning) {
                self.running.insert(id, running);
            }
        }
        Ok(())
    }

    async fn resolve_report(&mut self, materialized_id: &str) -> Result<()> {
        let Some(running) = self.running.remove(materialized_id) else {
            return Ok(());
        };
        let report_path = running.launched.report_path.clone();
        match report::validate_report_file(&report_path, &self.report_config).await {
            Ok(report) => {
                let gate_failure = report.gate_failure;
                let declared_id = running.declared_id.clone();
                if let Some(runtime) = self.state.steps.get_mut(materialized_id) {
                    runtime.status = StepStatus::Completed;
                    runtime.ended_at = Some(chrono::Utc::now());
                    runtime.artifacts = report.artifacts;
                    runtime.metrics = report.metrics;
                    runtime.logs = report.logs;
                }
                if gate_failure {
                    if let Some(declared) = self.workflow.step(&declared_id).cloned() {
                        if let Some(target) = declared.loop_back_to.clone() {
                            self.loop_back(&declared, &target, materialized_id);
                        }
                    }
                }
            }
            Err(err) => self.handle_attempt_failure(materialized_id, &err_to_message(&err)),
        }
        self.persist()
    }

    fn resolve_no_report(&mut self, materialized_id: &str, reason: &str) {
        self.running.remove(materialized_id);
        self.handle_attempt_failure(materialized_id, reason);
        if let Err(err) = self.persist() {
            error!(step_id = materialized_id, error = %err, "failed to persist after attempt failure");
        }
    }

    fn handle_attempt_failure(&mut self, materialized_id: &str, reason: &str) {
        let max_attempts = self.options.max_attempts;
        let Some(runtime) = self.state.steps.get_mut(materialized_id) else {
            return;
        };
        if runtime.attempts < max_attempts {
            runtime.reset_for_retry();
            info!(step_id = materialized_id, attempts = runtime.attempts, "retrying step");
        } else {
            runtime.status = StepStatus::Failed;
            runtime.ended_at = Some(chrono::Utc::now());
            runtime.last_error = Some(reason.to_string());
            warn!(step_id = materialized_id, reason, "step exhausted retries");
            self.dispatcher.notify(NotificationEvent::step_failed(NotificationPayload {
                run_id: self.run_id.clone(),
                step_id: materialized_id.to_string(),
                attempts: runtime.attempts,
                iteration_count: runtime.iteration_count,
                log_tail: None,
                manual_input_path: None,
            }));
        }
    }

    /// Reset the declared loop-back target and everything between it and the
    /// completed step, per the loop-back procedure.
    fn loop_back(&mut self, completed_step: &Step, target: &str, triggering_id: &str) {
        let reset_set = {
            let mut ancestors_of_s = workflow::ancestors(&self.workflow, &completed_step.id);
            ancestors_of_s.insert(completed_step.id.clone());
            let mut descendants_of_t = workflow::descendants(&self.workflow, target);
            descendants_of_t.insert(target.to_string());
            descendants_of_t
                .into_iter()
                .filter(|id| id == target || ancestors_of_s.contains(id))
                .collect::<std::collections::BTreeSet<_>>()
        };

        for declared_id in reset_set {
            let materialized = self.materialized_ids_for(&declared_id);
            for id in materialized {
                let Some(runtime) = self.state.steps.get_mut(&id) else {
                    continue;
                };
                if runtime.iteration_count + 1 > self.options.max_iterations {
                    runtime.status = StepStatus::Failed;
                    runtime.last_error = Some("max loop-back iterations exceeded".to_string());
                    warn!(step_id = %id, "loop-back iteration cap exceeded");
                    continue;
                }
                runtime.reset_for_loop_back(triggering_id);
            }
        }
    }

    async fn cancel_all(&mut self) {
        let ids: Vec<String> = self.running.keys().cloned().collect();
        for id in ids {
            if let Some(mut running) = self.running.remove(&id) {
                StepRunner::terminate(&mut running.launched, self.options.cancellation_grace_period).await;
            }
            if let Some(runtime) = self.state.steps.get_mut(&id) {
                if !runtime.status.is_terminal() {
                    runtime.status = StepStatus::Failed;
                    runtime.last_error = Some("cancelled".to_string());
                    runtime.ended_at = Some(chrono::Utc::now());
                }
            }
        }
        for runtime in self.state.steps.values_mut() {
            if !runtime.status.is_terminal() {
                runtime.status = StepStatus::Failed;
                runtime.last_error = Some("cancelled".to_string());
            }
        }
    }

    fn persist(&mut self) -> Result<()> {
        store::save(&self.state_path, &mut self.state)?;
        Ok(())
    }
}

fn err_to_message(err: &ValidatorError) -> String {
    err.to_string()
}

/// Read a manual input file: a UTF-8 JSON object whose fields get merged into
/// the resuming step's env. Presence alone satisfies WAITING_ON_HUMAN; the
/// shape is still enforced to be an object so field merging is well-defined.
fn read_manual_input(path: &std::path::Path) -> std::result::Result<serde_json::Map<String, Value>, String> {
    let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let value: Value = serde_json::from_str(&content).map_err(|e| e.to_string())?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(format!("expected a JSON object, got {other}")),
    }
}

/// Reset `target` and its transitive dependents to PENDING for a resume,
/// preserving upstream COMPLETED state and `iteration_count`.
fn apply_resume(workflow: &Workflow, state: &mut RunState, target: &str) -> Result<()> {
    if workflow.step(target).is_none() {
        return Err(SchedulerError::UnknownResumeTarget(target.to_string()));
    }
    let mut reset_ids = workflow::descendants(workflow, target);
    reset_ids.insert(target.to_string());
    for declared_id in reset_ids {
        let prefix = format!("{declared_id}{}", loop_expand::CHILD_SEPARATOR);
        let matching: Vec<String> = state
            .steps
            .keys()
            .filter(|id| id.as_str() == declared_id.as_str() || id.starts_with(&prefix))
            .cloned()
            .collect();
        for id in matching {
            if let Some(runtime) = state.steps.get_mut(&id) {
                runtime.status = StepStatus::Pending;
                runtime.started_at = None;
                runtime.ended_at = None;
                runtime.report_path = None;
                runtime.last_error = None;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::workflow::load_workflow_str;
    use std::collections::BTreeSet;

    fn linear_workflow() -> Workflow {
        load_workflow_str(
            r#"{"name":"w","description":"","steps":[
                {"id":"a","agent":"codex","prompt":"a.md","needs":[]},
                {"id":"b","agent":"codex","prompt":"b.md","needs":["a"]}
            ]}"#,
        )
        .unwrap()
    }

    fn write_report(layout: &RunLayout, step_id: &str, attempts_dir_ready: bool) {
        std::fs::create_dir_all(layout.reports_dir()).unwrap();
        if attempts_dir_ready {
            std::fs::create_dir_all(layout.logs_dir()).unwrap();
        }
        let body = format!(
            r#"{{"schema":1,"run_id":"{run}","step_id":"{step}","agent":"codex",
                "status":"COMPLETED","started_at":"2026-01-01T00:00:00Z",
                "ended_at":"2026-01-01T00:01:00Z","logs":["done"]}}"#,
            run = layout.run_id,
            step = step_id
        );
        std::fs::write(layout.report_path(step_id), body).unwrap();
    }

    fn make_scheduler(dir: &tempfile::TempDir, workflow: Workflow) -> Scheduler {
        let repo = dir.path().join("repo");
        let prompt_root = dir.path().join("prompts");
        std::fs::create_dir_all(&prompt_root).unwrap();
        for name in ["a.md", "b.md"] {
            std::fs::write(prompt_root.join(name), "do it").unwrap();
        }
        let layout = RunLayout::new(&repo, "run1");
        let runner = StepRunner::new(layout.clone(), prompt_root, vec!["sh".into(), "-c".into(), "sleep 5".into()]);
        Scheduler::new(
            workflow,
            runner,
            GateEvaluator::always_open(),
            NotificationDispatcher::noop(),
            ValidatorConfig::default(),
            SchedulerOptions {
                poll_interval: Duration::from_millis(10),
                max_attempts: 2,
                max_iterations: 4,
                pause_for_human_input: true,
                start_at_step: None,
                cancellation_grace_period: Duration::from_millis(50),
                env_overrides: BTreeMap::new(),
            },
            "run1".to_string(),
            repo,
            layout.reports_dir(),
            layout.manual_inputs_dir(),
            layout.run_state_path(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn admits_only_root_step_initially() {
        let dir = tempfile::tempdir().unwrap();
        let mut scheduler = make_scheduler(&dir, linear_workflow());
        scheduler.admit().unwrap();
        assert_eq!(
            scheduler.state.steps.get("a").unwrap().status,
            StepStatus::Running
        );
        assert_eq!(
            scheduler.state.steps.get("b").unwrap().status,
            StepStatus::Pending
        );
    }

    #[tokio::test]
    async fn resolves_completed_report_and_admits_dependent() {
        let dir = tempfile::tempdir().unwrap();
        let mut scheduler = make_scheduler(&dir, linear_workflow());
        scheduler.admit().unwrap();
        write_report(&scheduler.runner.layout.clone(), "a", true);
        scheduler.collect().await.unwrap();
        assert_eq!(
            scheduler.state.steps.get("a").unwrap().status,
            StepStatus::Completed
        );
        scheduler.admit().unwrap();
        assert_eq!(
            scheduler.state.steps.get("b").unwrap().status,
            StepStatus::Running
        );
    }

    #[tokio::test]
    async fn retries_on_child_exit_without_report_then_fails_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        let prompt_root = dir.path().join("prompts");
        std::fs::create_dir_all(&prompt_root).unwrap();
        std::fs::write(prompt_root.join("a.md"), "do it").unwrap();
        let layout = RunLayout::new(&repo, "run1");
        let runner = StepRunner::new(layout.clone(), prompt_root, vec!["sh".into(), "-c".into(), "exit 1".into()]);
        let workflow = load_workflow_str(
            r#"{"name":"w","description":"","steps":[{"id":"a","agent":"codex","prompt":"a.md","needs":[]}]}"#,
        )
        .unwrap();
        let mut scheduler = Scheduler::new(
            workflow,
            runner,
            GateEvaluator::always_open(),
            NotificationDispatcher::noop(),
            ValidatorConfig::default(),
            SchedulerOptions {
                poll_interval: Duration::from_millis(5),
                max_attempts: 2,
                max_iterations: 4,
                pause_for_human_input: true,
                start_at_step: None,
                cancellation_grace_period: Duration::from_millis(50),
                env_overrides: BTreeMap::new(),
            },
            "run1".to_string(),
            repo,
            layout.reports_dir(),
            layout.manual_inputs_dir(),
            layout.run_state_path(),
        )
        .unwrap();

        let outcome = scheduler.run().await.unwrap();
        assert_eq!(outcome, RunOutcome::Failure);
        assert_eq!(scheduler.state.steps.get("a").unwrap().status, StepStatus::Failed);
        assert_eq!(scheduler.state.steps.get("a").unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn human_in_the_loop_step_waits_for_manual_input() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = load_workflow_str(
            r#"{"name":"w","description":"","steps":[
                {"id":"a","agent":"codex","prompt":"a.md","needs":[],"human_in_the_loop":true}
            ]}"#,
        )
        .unwrap();
        let mut scheduler = make_scheduler(&dir, workflow);
        scheduler.admit().unwrap();
        assert_eq!(
            scheduler.state.steps.get("a").unwrap().status,
            StepStatus::WaitingOnHuman
        );
        assert!(scheduler.state.steps.get("a").unwrap().manual_input_path.is_some());
    }

    #[tokio::test]
    async fn manual_input_arriving_resumes_waiting_on_human_step_to_running() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = load_workflow_str(
            r#"{"name":"w","description":"","steps":[
                {"id":"a","agent":"codex","prompt":"a.md","needs":[],"human_in_the_loop":true}
            ]}"#,
        )
        .unwrap();
        let mut scheduler = make_scheduler(&dir, workflow);
        scheduler.admit().unwrap();
        assert_eq!(
            scheduler.state.steps.get("a").unwrap().status,
            StepStatus::WaitingOnHuman
        );

        let manual_input_path = PathBuf::from(
            scheduler
                .state
                .steps
                .get("a")
                .unwrap()
                .manual_input_path
                .clone()
                .unwrap(),
        );
        std::fs::create_dir_all(manual_input_path.parent().unwrap()).unwrap();
        std::fs::write(&manual_input_path, r#"{"approved": true}"#).unwrap();

        scheduler.resume_waiting_on_human().unwrap();
        assert_eq!(
            scheduler.state.steps.get("a").unwrap().status,
            StepStatus::Running
        );
        assert!(scheduler.running.contains_key("a"));
    }

    #[test]
    fn resume_resets_target_and_dependents_preserving_iteration_count() {
        let workflow = linear_workflow();
        let mut steps = BTreeMap::new();
        let mut a = StepRuntime::pending();
        a.status = StepStatus::Completed;
        a.iteration_count = 2;
        steps.insert("a".to_string(), a);
        let mut b = StepRuntime::pending();
        b.status = StepStatus::Failed;
        steps.insert("b".to_string(), b);
        let mut state = RunState::new("r1", "w", "/repo", "/repo/reports", "/repo/manual", steps);

        apply_resume(&workflow, &mut state, "b").unwrap();
        assert_eq!(state.steps.get("a").unwrap().status, StepStatus::Completed);
        assert_eq!(state.steps.get("a").unwrap().iteration_count, 2);
        assert_eq!(state.steps.get("b").unwrap().status, StepStatus::Pending);
    }

    #[test]
    fn loop_expansion_skips_declared_step_with_zero_items() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = load_workflow_str(
            r#"{"name":"w","description":"","steps":[
                {"id":"plan","agent":"codex","prompt":"plan.md","needs":[]},
                {"id":"impl","agent":"codex","prompt":"impl.md","needs":["plan"],
                 "loop":{"items":[]}}
            ]}"#,
        )
        .unwrap();
        let mut scheduler = make_scheduler(&dir, workflow);
        scheduler.state.steps.get_mut("plan").unwrap().status = StepStatus::Completed;
        let impl_step = scheduler.workflow.step("impl").unwrap().clone();
        scheduler.admit_loop_step(&impl_step).unwrap();
        assert_eq!(
            scheduler.state.steps.get("impl").unwrap().status,
            StepStatus::Skipped
        );
        let _ = BTreeSet::<String>::new();
    }

    #[tokio::test]
    async fn loop_group_rolls_up_to_completed_once_every_child_completes() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        let prompt_root = dir.path().join("prompts");
        std::fs::create_dir_all(&prompt_root).unwrap();
        std::fs::write(prompt_root.join("plan.md"), "do it").unwrap();
        std::fs::write(prompt_root.join("impl.md"), "do it").unwrap();
        let layout = RunLayout::new(&repo, "run1");
        let runner = StepRunner::new(
            layout.clone(),
            prompt_root,
            vec!["sh".into(), "-c".into(), "sleep 5".into()],
        );
        let workflow = load_workflow_str(
            r#"{"name":"w","description":"","steps":[
                {"id":"plan","agent":"codex","prompt":"plan.md","needs":[]},
                {"id":"impl","agent":"codex","prompt":"impl.md","needs":["plan"],
                 "loop":{"items":[1,2]}},
                {"id":"after","agent":"codex","prompt":"impl.md","needs":["impl"]}
            ]}"#,
        )
        .unwrap();
        let mut scheduler = Scheduler::new(
            workflow,
            runner,
            GateEvaluator::always_open(),
            NotificationDispatcher::noop(),
            ValidatorConfig::default(),
            SchedulerOptions {
                poll_interval: Duration::from_millis(5),
                max_attempts: 2,
                max_iterations: 4,
                pause_for_human_input: true,
                start_at_step: None,
                cancellation_grace_period: Duration::from_millis(50),
                env_overrides: BTreeMap::new(),
            },
            "run1".to_string(),
            repo,
            layout.reports_dir(),
            layout.manual_inputs_dir(),
            layout.run_state_path(),
        )
        .unwrap();

        scheduler.state.steps.get_mut("plan").unwrap().status = StepStatus::Completed;

        let impl_step = scheduler.workflow.step("impl").unwrap().clone();
        scheduler.admit_loop_step(&impl_step).unwrap();
        assert!(scheduler.state.steps.contains_key("impl__00"));
        assert!(scheduler.state.steps.contains_key("impl__01"));

        write_report(&scheduler.runner.layout.clone(), "impl__00", true);
        scheduler.collect().await.unwrap();
        assert!(!scheduler.reconcile_loop_groups());
        assert_eq!(
            scheduler.state.steps.get("impl").unwrap().status,
            StepStatus::Pending,
            "declared step stays open while a sibling is still running"
        );

        scheduler.admit_loop_step(&impl_step).unwrap();
        write_report(&scheduler.runner.layout.clone(), "impl__01", true);
        scheduler.collect().await.unwrap();
        assert!(scheduler.reconcile_loop_groups());
        assert_eq!(
            scheduler.state.steps.get("impl").unwrap().status,
            StepStatus::Completed
        );
        assert_eq!(scheduler.state.steps.get("impl").unwrap().logs, vec!["done", "done"]);

        scheduler.admit().unwrap();
        assert_eq!(
            scheduler.state.steps.get("after").unwrap().status,
            StepStatus::Running,
            "downstream needs on a loop step unblock once the rollup completes it"
        );
    }

    #[tokio::test]
    async fn launching_a_step_clears_a_stale_report_left_at_its_deterministic_path() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        let prompt_root = dir.path().join("prompts");
        std::fs::create_dir_all(&prompt_root).unwrap();
        std::fs::write(prompt_root.join("a.md"), "do it").unwrap();
        let layout = RunLayout::new(&repo, "run1");
        let runner = StepRunner::new(
            layout.clone(),
            prompt_root,
            vec!["sh".into(), "-c".into(), "sleep 5".into()],
        );
        let workflow = load_workflow_str(
            r#"{"name":"w","description":"","steps":[{"id":"a","agent":"codex","prompt":"a.md","needs":[]}]}"#,
        )
        .unwrap();
        let mut scheduler = Scheduler::new(
            workflow,
            runner,
            GateEvaluator::always_open(),
            NotificationDispatcher::noop(),
            ValidatorConfig::default(),
            SchedulerOptions {
                poll_interval: Duration::from_millis(5),
                max_attempts: 2,
                max_iterations: 4,
                pause_for_human_input: true,
                start_at_step: None,
                cancellation_grace_period: Duration::from_millis(50),
                env_overrides: BTreeMap::new(),
            },
            "run1".to_string(),
            repo,
            layout.reports_dir(),
            layout.manual_inputs_dir(),
            layout.run_state_path(),
        )
        .unwrap();

        // Simulate a report left behind by an interrupted earlier run of this
        // same run directory, sitting at the deterministic path before the
        // step has ever actually been launched this time around.
        std::fs::create_dir_all(scheduler.runner.layout.reports_dir()).unwrap();
        std::fs::write(
            scheduler.runner.layout.report_path("a"),
            r#"{"schema":1,"run_id":"run1","step_id":"a","agent":"codex",
                "status":"COMPLETED","started_at":"2026-01-01T00:00:00Z",
                "ended_at":"2026-01-01T00:01:00Z","logs":["stale attempt"]}"#,
        )
        .unwrap();

        scheduler.admit().unwrap();
        assert!(
            !scheduler.runner.layout.report_path("a").exists(),
            "launching a step must clear any stale report left at its deterministic path"
        );

        write_report(&scheduler.runner.layout.clone(), "a", true);
        scheduler.collect().await.unwrap();
        assert_eq!(
            scheduler.state.steps.get("a").unwrap().status,
            StepStatus::Completed
        );
        assert_eq!(
            scheduler.state.steps.get("a").unwrap().logs,
            vec!["done"],
            "the freshly written report must win, not the stale one it replaced"
        );
    }
}
