//! Application configuration: YAML file plus `FERRY_*` environment overlay.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::assistant::OutputFormat;
use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlackConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub app_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    /// Executable to spawn for each session.
    #[serde(default = "default_cli_path")]
    pub cli_path: String,
    /// Extra arguments prepended before any mode flags.
    #[serde(default)]
    pub default_args: Vec<String>,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub model: Option<String>,
    /// Hard cap on a single stdin write.
    #[serde(default = "default_max_input_len")]
    pub max_input_len: usize,
    /// How long a freshly spawned process is watched for an early exit.
    #[serde(default = "default_startup_probe_ms")]
    pub startup_probe_ms: u64,
    #[serde(default = "default_terminate_grace_secs")]
    pub terminate_grace_secs: u64,
    /// Idle-stdout window that ends a reply when no prompt marker is seen.
    #[serde(default = "default_quiet_window_ms")]
    pub quiet_window_ms: u64,
    /// Prompt-ready marker advertised by the CLI, if any. Takes precedence
    /// over the quiet window when set.
    #[serde(default)]
    pub prompt_marker: Option<String>,
    #[serde(default = "default_chunk_buffer")]
    pub chunk_buffer: usize,
    #[serde(default = "default_stderr_ring_bytes")]
    pub stderr_ring_bytes: usize,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            cli_path: default_cli_path(),
            default_args: Vec::new(),
            output_format: OutputFormat::default(),
            model: None,
            max_input_len: default_max_input_len(),
            startup_probe_ms: default_startup_probe_ms(),
            terminate_grace_secs: default_terminate_grace_secs(),
            quiet_window_ms: default_quiet_window_ms(),
            prompt_marker: None,
            chunk_buffer: default_chunk_buffer(),
            stderr_ring_bytes: default_stderr_ring_bytes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    #[serde(default = "default_task_queue_size")]
    pub task_queue_size: usize,
    #[serde(default = "default_queue_history_limit")]
    pub queue_history_limit: usize,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default)]
    pub task_retry_limit: u32,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty config must deserialize")
    }
}

fn default_cli_path() -> String {
    "claude".to_string()
}

fn default_max_input_len() -> usize {
    32_768
}

fn default_startup_probe_ms() -> u64 {
    2_000
}

fn default_terminate_grace_secs() -> u64 {
    10
}

fn default_quiet_window_ms() -> u64 {
    200
}

fn default_chunk_buffer() -> usize {
    256
}

fn default_stderr_ring_bytes() -> usize {
    65_536
}

fn default_data_dir() -> PathBuf {
    expand_tilde(Path::new("~/.ferry"))
}

fn default_max_sessions() -> usize {
    10
}

fn default_session_idle_secs() -> u64 {
    3_600
}

fn default_reaper_interval_secs() -> u64 {
    60
}

fn default_task_queue_size() -> usize {
    100
}

fn default_queue_history_limit() -> usize {
    100
}

fn default_task_timeout_secs() -> u64 {
    1_800
}

fn default_log_level() -> String {
    "info".to_string()
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~")
        && let Ok(home) = std::env::var("HOME")
    {
        return PathBuf::from(home).join(stripped);
    }
    path.to_path_buf()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = serde_yaml::from_str(&raw)?;
        config.apply_overlay(|key| std::env::var(key).ok());
        config.expand_paths();
        Ok(config)
    }

    /// Environment overlay: a small fixed set of keys that win over the file,
    /// so deployments can inject secrets without editing YAML.
    pub fn apply_overlay(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FERRY_SLACK_BOT_TOKEN") {
            self.slack.bot_token = v;
        }
        if let Some(v) = lookup("FERRY_SLACK_CHANNEL_ID") {
            self.slack.channel_id = v;
        }
        if let Some(v) = lookup("FERRY_CLI_PATH") {
            self.assistant.cli_path = v;
        }
        if let Some(v) = lookup("FERRY_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FERRY_LOG_LEVEL") {
            self.log_level = v;
        }
    }

    fn expand_paths(&mut self) {
        self.data_dir = expand_tilde(&self.data_dir);
        for project in &mut self.projects {
            project.path = expand_tilde(&project.path);
        }
    }

    /// Collects every problem into one error so the operator sees the full
    /// list instead of fixing issues one at a time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.slack.bot_token.is_empty() {
            errors.push("slack bot token is required".to_string());
        } else if !self.slack.bot_token.starts_with("xoxb-")
            && !self.slack.bot_token.starts_with("xoxp-")
        {
            errors.push("slack bot token must start with 'xoxb-' or 'xoxp-'".to_string());
        }

        if self.slack.channel_id.is_empty() {
            errors.push("slack channel id is required".to_string());
        } else if !self.slack.channel_id.starts_with('C') {
            errors.push("slack channel id must start with 'C'".to_string());
        }

        if self.assistant.cli_path.is_empty() {
            errors.push("assistant cli path is required".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for project in &self.projects {
            if project.name.is_empty() {
                errors.push(format!("project at {} has no name", project.path.display()));
            } else if !seen.insert(project.name.clone()) {
                errors.push(format!("duplicate project name '{}'", project.name));
            }
            if !project.path.is_dir() {
                errors.push(format!(
                    "project '{}' path is not a directory: {}",
                    project.name,
                    project.path.display()
                ));
            }
        }

        if self.max_sessions == 0 {
            errors.push("max_sessions must be positive".to_string());
        }
        if self.task_queue_size == 0 {
            errors.push("task_queue_size must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors.join("; ")))
        }
    }

    pub fn project(&self, name: &str) -> Option<&ProjectConfig> {
        self.projects.iter().find(|p| p.name == name)
    }

    pub fn project_for_dir(&self, dir: &Path) -> Option<&ProjectConfig> {
        self.projects.iter().find(|p| p.path == dir)
    }

    pub fn queues_file(&self) -> PathBuf {
        self.data_dir.join("queues.json")
    }
}
