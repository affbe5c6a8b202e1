//! Run-report ingestion and validation (component A).
//!
//! Reads a wrapper's JSON report file, retrying through the window where a
//! racey filesystem can expose a partial write, then enforces the required
//! fields, timestamp shape, and placeholder-content rules before the
//! scheduler is allowed to see it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::types::{ReportStatus, RunReport};

pub type Result<T> = std::result::Result<T, ValidatorError>;

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("report file not found or unreadable after {attempts} attempt(s): {path}")]
    ReportParseError { path: PathBuf, attempts: u32 },
    #[error("report {path} has placeholder content in {field}: matched {matched:?}")]
    PlaceholderContent {
        path: PathBuf,
        field: String,
        matched: String,
    },
    #[error("report {path} has timestamp field {field} set to the unset epoch sentinel")]
    EpochSentinelTimestamp { path: PathBuf, field: &'static str },
    #[error("report {path} has status COMPLETED but no log entries")]
    MissingCompletionLog { path: PathBuf },
}

/// Substrings that mark a field as unfinished placeholder content rather
/// than a wrapper's real output. Injectable configuration, not a hard-coded
/// list, so prompt evolution never requires a code change here.
pub fn default_placeholder_blacklist() -> Vec<String> {
    vec![
        "<REPLACE".to_string(),
        "REPLACE WITH".to_string(),
        "summary of what you accomplished".to_string(),
        "list/of/created/file/paths".to_string(),
        "TODO: fill in".to_string(),
    ]
}

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub placeholder_blacklist: Vec<String>,
    pub max_parse_attempts: u32,
    pub parse_backoff_base: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            placeholder_blacklist: default_placeholder_blacklist(),
            max_parse_attempts: 5,
            parse_backoff_base: Duration::from_millis(100),
        }
    }
}

/// Wire-format shape of a report file. `metrics` is accepted as arbitrary
/// JSON values and coerced to strings during normalization; everything else
/// matches [`RunReport`] field-for-field.
#[derive(Debug, Deserialize)]
struct RawReport {
    schema: u32,
    run_id: String,
    step_id: String,
    agent: String,
    status: ReportStatus,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    #[serde(default)]
    artifacts: Vec<String>,
    #[serde(default)]
    metrics: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    logs: Vec<String>,
    #[serde(default)]
    gate_failure: bool,
    #[serde(default)]
    next_suggested_steps: Vec<String>,
}

/// Read and validate a report file at `path`, retrying with bounded
/// exponential backoff while the bytes on disk don't yet parse as JSON.
pub async fn validate_report_file(path: &Path, config: &ValidatorConfig) -> Result<RunReport> {
    let raw = read_with_backoff(path, config).await?;
    validate_raw(path, raw, config)
}

async fn read_with_backoff(path: &Path, config: &ValidatorConfig) -> Result<RawReport> {
    let mut delay = config.parse_backoff_base;
    let mut last_attempt = 0;
    for attempt in 1..=config.max_parse_attempts {
        last_attempt = attempt;
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<RawReport>(&content) {
                Ok(raw) => return Ok(raw),
                Err(err) => {
                    warn!(path = %path.display(), attempt, error = %err, "report parse attempt failed");
                }
            },
            Err(err) => {
                warn!(path = %path.display(), attempt, error = %err, "report read attempt failed");
            }
        }
        if attempt < config.max_parse_attempts {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }
    Err(ValidatorError::ReportParseError {
        path: path.to_path_buf(),
        attempts: last_attempt,
    })
}

fn validate_raw(path: &Path, raw: RawReport, config: &ValidatorConfig) -> Result<RunReport> {
    if is_epoch_sentinel(raw.started_at) {
        return Err(ValidatorError::EpochSentinelTimestamp {
            path: path.to_path_buf(),
            field: "started_at",
        });
    }
    if is_epoch_sentinel(raw.ended_at) {
        return Err(ValidatorError::EpochSentinelTimestamp {
            path: path.to_path_buf(),
            field: "ended_at",
        });
    }

    let artifacts = normalize_strings(raw.artifacts);
    let logs = normalize_strings(raw.logs);

    for artifact in &artifacts {
        check_placeholder(path, "artifacts", artifact, &config.placeholder_blacklist)?;
    }
    for log in &logs {
        check_placeholder(path, "logs", log, &config.placeholder_blacklist)?;
    }

    if matches!(raw.status, ReportStatus::Completed) && logs.is_empty() {
        return Err(ValidatorError::MissingCompletionLog {
            path: path.to_path_buf(),
        });
    }

    let metrics = raw
        .metrics
        .into_iter()
        .map(|(k, v)| (k, coerce_metric_value(v)))
        .collect();

    Ok(RunReport {
        schema: raw.schema,
        run_id: raw.run_id,
        step_id: raw.step_id,
        agent: raw.agent,
        status: raw.status,
        started_at: raw.started_at,
        ended_at: raw.ended_at,
        artifacts,
        metrics,
        logs,
        gate_failure: raw.gate_failure,
        next_suggested_steps: normalize_strings(raw.next_suggested_steps),
    })
}

fn is_epoch_sentinel(ts: DateTime<Utc>) -> bool {
    ts.timestamp() == 0 && ts.timestamp_subsec_nanos() == 0
}

fn normalize_strings(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

fn check_placeholder(path: &Path, field: &str, value: &str, blacklist: &[String]) -> Result<()> {
    for needle in blacklist {
        if value.contains(needle.as_str()) {
            return Err(ValidatorError::PlaceholderContent {
                path: path.to_path_buf(),
                field: field.to_string(),
                matched: needle.clone(),
            });
        }
    }
    Ok(())
}

fn coerce_metric_value(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}
