//! Configuration (component I).
//!
//! A minimal `key=value` file covering exactly the options the core
//! recognizes. No profiles, no environment interpolation, no YAML: a richer
//! configuration surface belongs to the CLI front-end this crate doesn't
//! implement. Unknown keys are a warning, not a hard error, so a config file
//! shared across engine versions degrades gracefully.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::report::default_placeholder_blacklist;

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: invalid boolean value {value:?} for key {key}")]
    InvalidBool { line: usize, key: String, value: String },
    #[error("line {line}: invalid number value {value:?} for key {key}")]
    InvalidNumber { line: usize, key: String, value: String },
    #[error("line {line}: malformed line, expected key=value: {content:?}")]
    InvalidLine { line: usize, content: String },
}

/// Engine configuration: the recognized options of the external interfaces
/// section, plus the cancellation grace period and placeholder blacklist.
#[derive(Debug, Clone)]
pub struct Config {
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub max_iterations: u32,
    pub pause_for_human_input: bool,
    pub start_at_step: Option<String>,
    pub gate_state_path: Option<String>,
    pub env_overrides: BTreeMap<String, String>,
    pub cancellation_grace_period: Duration,
    pub placeholder_blacklist: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_attempts: 2,
            max_iterations: 4,
            pause_for_human_input: true,
            start_at_step: None,
            gate_state_path: None,
            env_overrides: BTreeMap::new(),
            cancellation_grace_period: Duration::from_secs(10),
            placeholder_blacklist: default_placeholder_blacklist(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_content(&content)
    }

    pub fn parse_content(content: &str) -> Result<Self> {
        let mut config = Self::default();
        for (line_no, raw_line) in content.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::InvalidLine {
                    line: line_no + 1,
                    content: raw_line.to_string(),
                });
            };
            let key = key.trim();
            let value = unquote(value.trim());
            config.apply(key, &value, line_no + 1)?;
        }
        Ok(config)
    }

    fn apply(&mut self, key: &str, value: &str, line: usize) -> Result<()> {
        match key {
            "poll_interval" => {
                self.poll_interval = Duration::from_secs_f64(parse_f64(key, value, line)?);
            }
            "max_attempts" => self.max_attempts = parse_u32(key, value, line)?,
            "max_iterations" => self.max_iterations = parse_u32(key, value, line)?,
            "pause_for_human_input" => self.pause_for_human_input = parse_bool(key, value, line)?,
            "start_at_step" => self.start_at_step = Some(value.to_string()),
            "gate_state_path" => self.gate_state_path = Some(value.to_string()),
            "cancellation_grace_period" => {
                self.cancellation_grace_period = Duration::from_secs_f64(parse_f64(key, value, line)?);
            }
            "placeholder_blacklist" => {
                self.placeholder_blacklist =
                    value.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
            }
            _ if key.starts_with("env_overrides.") => {
                let env_key = key.trim_start_matches("env_overrides.").to_string();
                self.env_overrides.insert(env_key, value.to_string());
            }
            other => {
                warn!(key = other, line, "ignoring unknown config key");
            }
        }
        Ok(())
    }
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

fn parse_bool(key: &str, value: &str, line: usize) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "on" => Ok(true),
        "false" | "0" | "no" | "n" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            line,
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_u32(key: &str, value: &str, line: usize) -> Result<u32> {
    value.parse().map_err(|_| ConfigError::InvalidNumber {
        line,
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_f64(key: &str, value: &str, line: usize) -> Result<f64> {
    value.parse().map_err(|_| ConfigError::InvalidNumber {
        line,
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_external_interface_table() {
        let config = Config::default();
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.max_iterations, 4);
        assert!(config.pause_for_human_input);
        assert!(config.start_at_step.is_none());
    }

    #[test]
    fn parses_recognized_keys() {
        let content = "poll_interval=0.25\nmax_attempts=3\nmax_iterations=5\nstart_at_step=review\n";
        let config = Config::parse_content(content).unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs_f64(0.25));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.start_at_step.as_deref(), Some("review"));
    }

    #[test]
    fn parses_env_overrides_by_prefix() {
        let content = "env_overrides.API_KEY=abc123\n";
        let config = Config::parse_content(content).unwrap();
        assert_eq!(config.env_overrides.get("API_KEY").map(String::as_str), Some("abc123"));
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let content = "# a comment\n\nmax_attempts=3\n";
        let config = Config::parse_content(content).unwrap();
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn accepts_common_boolean_spellings() {
        for (value, expected) in [("yes", true), ("0", false), ("on", true), ("No", false)] {
            let content = format!("pause_for_human_input={value}\n");
            let config = Config::parse_content(&content).unwrap();
            assert_eq!(config.pause_for_human_input, expected, "value={value}");
        }
    }

    #[test]
    fn rejects_invalid_boolean() {
        let err = Config::parse_content("pause_for_human_input=maybe\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBool { .. }));
    }

    #[test]
    fn rejects_malformed_line() {
        let err = Config::parse_content("this is not key value\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLine { .. }));
    }

    #[test]
    fn unknown_key_is_a_warning_not_an_error() {
        let config = Config::parse_content("some_future_option=42\n").unwrap();
        assert_eq!(config.max_attempts, 2);
    }

    #[test]
    fn unquotes_quoted_values() {
        let config = Config::parse_content("start_at_step=\"review\"\n").unwrap();
        assert_eq!(config.start_at_step.as_deref(), Some("review"));
    }
}
