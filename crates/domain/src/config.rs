use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub exec: ExecConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

impl Config {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &std::path::Path) -> crate::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Validate the configuration, returning every issue found.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        if self.server.port == 0 {
            issues.push(ConfigIssue::error("server.port must be nonzero"));
        }
        if self.llm.model.is_empty() {
            issues.push(ConfigIssue::error("llm.model must not be empty"));
        }
        if std::env::var(&self.llm.api_key_env).is_err() {
            issues.push(ConfigIssue::warning(format!(
                "{} is not set — LLM calls will fail",
                self.llm.api_key_env
            )));
        }
        if self.exec.default_timeout_sec == 0 {
            issues.push(ConfigIssue::error("exec.default_timeout_sec must be nonzero"));
        }
        if self.agent.max_tool_loops == 0 {
            issues.push(ConfigIssue::error("agent.max_tool_loops must be nonzero"));
        }
        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation issues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl ConfigIssue {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    /// Allowed CORS origins. A single `"*"` allows all origins.
    #[serde(default = "d_origins")]
    pub allowed_origins: Vec<String>,
    /// Maximum concurrent in-flight HTTP requests.
    #[serde(default = "d_max_concurrent")]
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            allowed_origins: d_origins(),
            max_concurrent_requests: d_max_concurrent(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Data layout
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Root for session JSON files and the singleton collection files.
    #[serde(default = "d_data_dir")]
    pub data_dir: PathBuf,
    /// Tool output artifact area (one subdirectory per task).
    #[serde(default = "d_artifact_dir")]
    pub artifact_dir: PathBuf,
    /// Tool definitions YAML file.
    #[serde(default = "d_tool_defs")]
    pub tool_definitions: PathBuf,
    /// Directory of playbook YAML files.
    #[serde(default = "d_playbooks")]
    pub playbook_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: d_data_dir(),
            artifact_dir: d_artifact_dir(),
            tool_definitions: d_tool_defs(),
            playbook_dir: d_playbooks(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Env var holding the Anthropic API key. Secrets never live in config.
    #[serde(default = "d_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "d_base_url")]
    pub base_url: String,
    #[serde(default = "d_model")]
    pub model: String,
    #[serde(default = "d_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "d_llm_timeout")]
    pub request_timeout_sec: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key_env: d_api_key_env(),
            base_url: d_base_url(),
            model: d_model(),
            max_tokens: d_max_tokens(),
            request_timeout_sec: d_llm_timeout(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Default subprocess timeout when the request does not carry one.
    #[serde(default = "d_exec_timeout")]
    pub default_timeout_sec: u64,
    /// Per-stream output cap; older output is dropped from the front.
    #[serde(default = "d_max_output")]
    pub max_output_chars: usize,
    /// Interval for result polling (websocket task streams, background polls).
    #[serde(default = "d_poll_ms")]
    pub poll_interval_ms: u64,
    /// Grace period between SIGTERM and SIGKILL on the process group.
    #[serde(default = "d_kill_grace")]
    pub kill_grace_ms: u64,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            default_timeout_sec: d_exec_timeout(),
            max_output_chars: d_max_output(),
            poll_interval_ms: d_poll_ms(),
            kill_grace_ms: d_kill_grace(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent driver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum tool-call loops per chat turn or autonomous execute phase.
    #[serde(default = "d_tool_loops")]
    pub max_tool_loops: usize,
    /// Human-approval wait for an autonomous step.
    #[serde(default = "d_step_approval")]
    pub step_approval_timeout_sec: u64,
    /// Human-approval wait for a scope addition.
    #[serde(default = "d_scope_approval")]
    pub scope_approval_timeout_sec: u64,
    /// Tool output stored per event / fed back to the LLM is capped here.
    #[serde(default = "d_output_cap")]
    pub tool_output_cap: usize,
    /// Chat history window sent to the LLM.
    #[serde(default = "d_history")]
    pub history_window: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_loops: d_tool_loops(),
            step_approval_timeout_sec: d_step_approval(),
            scope_approval_timeout_sec: d_scope_approval(),
            tool_output_cap: d_output_cap(),
            history_window: d_history(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Seconds between due-job evaluations.
    #[serde(default = "d_tick")]
    pub tick_sec: u64,
    /// Timeout handed to the executor for scheduled runs.
    #[serde(default = "d_exec_timeout")]
    pub run_timeout_sec: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            tick_sec: d_tick(),
            run_timeout_sec: d_exec_timeout(),
        }
    }
}

// ── serde default helpers ──────────────────────────────────────────

fn d_tick() -> u64 {
    30
}
fn d_host() -> String {
    "0.0.0.0".into()
}
fn d_port() -> u16 {
    8800
}
fn d_origins() -> Vec<String> {
    vec!["http://localhost:3000".into()]
}
fn d_max_concurrent() -> usize {
    256
}
fn d_data_dir() -> PathBuf {
    PathBuf::from("./data/sessions")
}
fn d_artifact_dir() -> PathBuf {
    PathBuf::from("./data/tasks")
}
fn d_tool_defs() -> PathBuf {
    PathBuf::from("./configs/tool_definitions.yaml")
}
fn d_playbooks() -> PathBuf {
    PathBuf::from("./configs/playbooks")
}
fn d_api_key_env() -> String {
    "ANTHROPIC_API_KEY".into()
}
fn d_base_url() -> String {
    "https://api.anthropic.com".into()
}
fn d_model() -> String {
    "claude-sonnet-4-20250514".into()
}
fn d_max_tokens() -> u32 {
    4096
}
fn d_llm_timeout() -> u64 {
    120
}
fn d_exec_timeout() -> u64 {
    300
}
fn d_max_output() -> usize {
    400_000
}
fn d_poll_ms() -> u64 {
    500
}
fn d_kill_grace() -> u64 {
    2_000
}
fn d_tool_loops() -> usize {
    25
}
fn d_step_approval() -> u64 {
    600
}
fn d_scope_approval() -> u64 {
    90
}
fn d_output_cap() -> usize {
    5_000
}
fn d_history() -> usize {
    50
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.server.port, 8800);
        assert_eq!(cfg.agent.step_approval_timeout_sec, 600);
        assert_eq!(cfg.agent.scope_approval_timeout_sec, 90);
        assert_eq!(cfg.llm.model, "claude-sonnet-4-20250514");
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let cfg: Config = toml::from_str("[server]\nport = 9000\n").unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.exec.default_timeout_sec, 300);
    }

    #[test]
    fn validate_flags_zero_port() {
        let mut cfg = Config::default();
        cfg.server.port = 0;
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.message.contains("server.port")));
    }

    #[test]
    fn load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("talon.toml")).unwrap();
        assert_eq!(cfg.server.port, 8800);
    }
}
