//! Step Runner (component D).
//!
//! Materializes one wrapper invocation for a step and hands control back to
//! the scheduler without blocking on it. The scheduler polls; this module
//! never decides retry policy, only reports what it observed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use agentflow_core::types::{Step, StepRuntime};
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::info;

pub type Result<T> = std::result::Result<T, RunnerError>;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("prompt not found for step {step_id:?}: tried {tried:?}")]
    PromptNotFound { step_id: String, tried: Vec<PathBuf> },
    #[error("failed to spawn wrapper for step {step_id:?}: {source}")]
    Spawn {
        step_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of a single non-blocking poll of a launched step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    StillRunning,
    ReportArrived,
    ChildExitedWithoutReport,
    Timeout,
}

/// Filesystem layout rooted at `<repo_dir>/.agents/`, matching the external
/// interfaces section of the design exactly.
#[derive(Debug, Clone)]
pub struct RunLayout {
    pub repo_dir: PathBuf,
    pub run_id: String,
}

impl RunLayout {
    pub fn new(repo_dir: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            run_id: run_id.into(),
        }
    }

    pub fn run_root(&self) -> PathBuf {
        self.repo_dir.join(".agents/runs").join(&self.run_id)
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.run_root().join("reports")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.run_root().join("logs")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.run_root().join("artifacts")
    }

    pub fn manual_inputs_dir(&self) -> PathBuf {
        self.run_root().join("manual_inputs")
    }

    pub fn run_state_path(&self) -> PathBuf {
        self.run_root().join("run_state.json")
    }

    pub fn prompts_override_dir(&self) -> PathBuf {
        self.repo_dir.join(".agents/prompts")
    }

    pub fn report_path(&self, step_id: &str) -> PathBuf {
        self.reports_dir()
            .join(format!("{}__{}.json", self.run_id, step_id))
    }

    pub fn log_path(&self, step_id: &str, attempt: u32) -> PathBuf {
        self.logs_dir()
            .join(format!("{}__{}__attempt{}.log", self.run_id, step_id, attempt))
    }

    pub fn manual_input_path(&self, step_id: &str) -> PathBuf {
        self.manual_inputs_dir()
            .join(format!("{}__{}.json", self.run_id, step_id))
    }
}

/// Registry entry describing how to derive convenience env vars from one of
/// a predecessor's artifacts (e.g. issue workflow -> `ISSUE_MARKDOWN_PATH`,
/// `ISSUE_MARKDOWN_DIR`, `ISSUE_MARKDOWN_FILENAME`).
#[derive(Debug, Clone)]
pub struct ArtifactEnvMapping {
    pub var_prefix: String,
    pub artifact_index: usize,
}

/// Everything the runner needs to launch a step that doesn't vary per call.
#[derive(Debug, Clone)]
pub struct StepRunner {
    pub layout: RunLayout,
    pub prompt_root: PathBuf,
    /// Argv template for the wrapper; the prompt path is appended as the
    /// final argument.
    pub wrapper_argv: Vec<String>,
    /// Predecessor step id -> convenience env var mapping.
    pub artifact_env_mappings: BTreeMap<String, ArtifactEnvMapping>,
}

/// A launched, not-yet-resolved step invocation.
pub struct LaunchedStep {
    pub child: Child,
    pub report_path: PathBuf,
    pub log_path: PathBuf,
    pub started_at: chrono::DateTime<Utc>,
    pub deadline: Option<Instant>,
}

impl StepRunner {
    pub fn new(layout: RunLayout, prompt_root: PathBuf, wrapper_argv: Vec<String>) -> Self {
        Self {
            layout,
            prompt_root,
            wrapper_argv,
            artifact_env_mappings: BTreeMap::new(),
        }
    }

    /// Resolve a step's prompt: an override under `.agents/prompts/` wins
    /// over the packaged prompt root.
    pub fn resolve_prompt(&self, step: &Step) -> Result<PathBuf> {
        let basename = Path::new(&step.prompt)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&step.prompt));
        let override_path = self.layout.prompts_override_dir().join(&basename);
        if override_path.exists() {
            return Ok(override_path);
        }
        let packaged_path = self.prompt_root.join(&step.prompt);
        if packaged_path.exists() {
            return Ok(packaged_path);
        }
        Err(RunnerError::PromptNotFound {
            step_id: step.id.clone(),
            tried: vec![override_path, packaged_path],
        })
    }

    /// Assemble the wrapper's environment per the step runner contract.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble_env(
        &self,
        step: &Step,
        materialized_id: &str,
        prompt_path: &Path,
        report_path: &Path,
        env_overrides: &BTreeMap<String, String>,
        upstream: &BTreeMap<String, StepRuntime>,
        loop_context: Option<(&str, &Value, &str, u32)>,
        manual_input: Option<&serde_json::Map<String, Value>>,
    ) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("RUN_ID".to_string(), self.layout.run_id.clone());
        env.insert("STEP_ID".to_string(), materialized_id.to_string());
        env.insert(
            "REPO_DIR".to_string(),
            self.layout.repo_dir.display().to_string(),
        );
        env.insert("REPORT_PATH".to_string(), report_path.display().to_string());
        env.insert(
            "ARTIFACTS_DIR".to_string(),
            self.layout.artifacts_dir().display().to_string(),
        );
        env.insert(
            "LOGS_DIR".to_string(),
            self.layout.logs_dir().display().to_string(),
        );
        env.insert("PROMPT_PATH".to_string(), prompt_path.display().to_string());

        for (k, v) in env_overrides {
            env.insert(k.clone(), v.clone());
        }

        for predecessor_id in &step.needs {
            let Some(mapping) = self.artifact_env_mappings.get(predecessor_id) else {
                continue;
            };
            let Some(runtime) = upstream.get(predecessor_id) else {
                continue;
            };
            let Some(artifact) = runtime.artifacts.get(mapping.artifact_index) else {
                continue;
            };
            let absolute = self.layout.repo_dir.join(artifact);
            env.insert(
                format!("{}_PATH", mapping.var_prefix),
                absolute.display().to_string(),
            );
            if let Some(parent) = absolute.parent() {
                env.insert(
                    format!("{}_DIR", mapping.var_prefix),
                    parent.display().to_string(),
                );
            }
            if let Some(filename) = absolute.file_name().and_then(|f| f.to_str()) {
                env.insert(format!("{}_FILENAME", mapping.var_prefix), filename.to_string());
            }
        }

        if let Some((item_var, item, index_var, index)) = loop_context {
            let item_value = match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            env.insert(item_var.to_string(), item_value);
            env.insert(index_var.to_string(), index.to_string());
        }

        if let Some(input) = manual_input {
            for (k, v) in input {
                let value = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                env.insert(k.to_ascii_uppercase(), value);
            }
        }

        env
    }

    /// Spawn the wrapper as a non-blocking child. stdout/stderr are piped
    /// into the attempt's log file; the scheduler must poll the returned
    /// handle, never await it.
    pub fn launch(
        &self,
        step: &Step,
        materialized_id: &str,
        attempt: u32,
        env: &BTreeMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<LaunchedStep> {
        std::fs::create_dir_all(self.layout.logs_dir()).ok();
        std::fs::create_dir_all(self.layout.reports_dir()).ok();
        std::fs::create_dir_all(self.layout.artifacts_dir()).ok();

        let prompt_path = self.resolve_prompt(step)?;
        let report_path = self.layout.report_path(materialized_id);
        let log_path = self.layout.log_path(materialized_id, attempt);

        // A prior attempt (or a pre-loop-back run) may have left a report
        // file behind at this same deterministic path. Remove it before
        // spawning so `poll` can't mistake it for this attempt's report.
        std::fs::remove_file(&report_path).ok();

        let log_file = std::fs::File::create(&log_path).map_err(|source| RunnerError::LogFile {
            path: log_path.clone(),
            source,
        })?;
        let stderr_file = log_file.try_clone().map_err(|source| RunnerError::LogFile {
            path: log_path.clone(),
            source,
        })?;

        let (program, args) = self
            .wrapper_argv
            .split_first()
            .expect("wrapper_argv must name a program");
        let mut command = Command::new(program);
        command
            .args(args)
            .arg(&prompt_path)
            .envs(env)
            .stdout(std::process::Stdio::from(log_file))
            .stderr(std::process::Stdio::from(stderr_file))
            .kill_on_drop(true);

        let child = command.spawn().map_err(|source| RunnerError::Spawn {
            step_id: materialized_id.to_string(),
            source,
        })?;

        info!(step_id = materialized_id, attempt, "launched wrapper");

        Ok(LaunchedStep {
            child,
            report_path,
            log_path,
            started_at: Utc::now(),
            deadline: timeout.map(|d| Instant::now() + d),
        })
    }

    /// Non-blocking poll: report-file readiness wins even over an already
    /// exited child, since the wrapper may write the report just before
    /// exiting.
    pub fn poll(launched: &mut LaunchedStep) -> Outcome {
        if launched.report_path.exists() {
            return Outcome::ReportArrived;
        }
        if let Some(deadline) = launched.deadline {
            if Instant::now() >= deadline {
                return Outcome::Timeout;
            }
        }
        match launched.child.try_wait() {
            Ok(Some(_status)) => Outcome::ChildExitedWithoutReport,
            Ok(None) => Outcome::StillRunning,
            Err(_) => Outcome::ChildExitedWithoutReport,
        }
    }

    /// Send SIGTERM, wait up to `grace`, then force-kill if still alive.
    pub async fn terminate(launched: &mut LaunchedStep, grace: Duration) {
        if let Some(pid) = launched.child.id() {
            // SAFETY: `pid` names a child process we own; sending SIGTERM is
            // the standard graceful-shutdown request and has no memory-safety
            // implications.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        let deadline = Instant::now() + grace;
        loop {
            if let Ok(Some(_)) = launched.child.try_wait() {
                return;
            }
            if Instant::now() >= deadline {
                let _ = launched.child.start_kill();
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Tail the last `lines` lines of an attempt log, for notification
    /// payloads. Best-effort: a missing or unreadable log yields `None`.
    pub fn tail_log(log_path: &Path, lines: usize) -> Option<String> {
        let content = std::fs::read_to_string(log_path).ok()?;
        let tail: Vec<&str> = content.lines().rev().take(lines).collect();
        Some(tail.into_iter().rev().collect::<Vec<_>>().join("\n"))
    }
}
