//! Pipeline configuration: `teamloop.toml`, then `TEAMLOOP_*` environment overrides.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::core::retry::RetryPolicy;

/// File looked up in the current directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "teamloop.toml";

/// Which chat backend serves the model-driven stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Mock,
    Ollama,
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Mock => "mock",
            BackendKind::Ollama => "ollama",
            BackendKind::Anthropic => "anthropic",
            BackendKind::OpenAi => "openai",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(BackendKind::Mock),
            "ollama" => Ok(BackendKind::Ollama),
            "anthropic" => Ok(BackendKind::Anthropic),
            "openai" => Ok(BackendKind::OpenAi),
            other => Err(anyhow!(
                "unknown backend {other:?} (expected mock|ollama|anthropic|openai)"
            )),
        }
    }
}

/// Top-level configuration (TOML). Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamConfig {
    pub backend: BackendKind,
    /// Generation retries allowed after the first attempt.
    pub max_iterations: u32,
    /// Sandbox root for generated files.
    pub workdir: PathBuf,
    /// Directory holding `run_<id>.jsonl` files.
    pub log_dir: PathBuf,
    /// Entry point every accepted generation must contain.
    pub required_file: String,
    /// Byte budget for a rendered stage prompt.
    pub prompt_budget_bytes: usize,
    /// Attach sandbox fingerprints and change sets to run log records.
    pub fingerprints: bool,
    pub verify: VerifyConfig,
    pub chat: ChatConfig,
    pub retry: RetryPolicy,
    pub ollama: OllamaConfig,
    pub anthropic: HostedConfig,
    pub openai: HostedConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Oracle command, run inside the sandbox root.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Per-stream cap on captured oracle output.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub timeout_secs: u64,
    pub temperature: f64,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
    /// Model for planning, design and review; falls back to `model`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_general: Option<String>,
    /// Model for generation; falls back to `model`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_coder: Option<String>,
}

/// Settings for a keyed hosted API. The key itself only comes from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostedConfig {
    pub base_url: String,
    pub model: String,
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Mock,
            max_iterations: 3,
            workdir: PathBuf::from("game"),
            log_dir: PathBuf::from("logs"),
            required_file: "main.py".to_string(),
            prompt_budget_bytes: 60_000,
            fingerprints: true,
            verify: VerifyConfig::default(),
            chat: ChatConfig::default(),
            retry: RetryPolicy::default(),
            ollama: OllamaConfig::default(),
            anthropic: HostedConfig {
                base_url: "https://api.anthropic.com/v1".to_string(),
                model: "claude-3-5-sonnet-latest".to_string(),
            },
            openai: HostedConfig::default(),
        }
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            command: ["python", "-m", "compileall", "-q", "."]
                .map(String::from)
                .to_vec(),
            timeout_secs: 600,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            temperature: 0.2,
            max_tokens: 2048,
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "deepseek-r1:latest".to_string(),
            model_general: None,
            model_coder: None,
        }
    }
}

impl Default for HostedConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
        }
    }
}

impl OllamaConfig {
    pub fn general_model(&self) -> &str {
        non_empty(self.model_general.as_deref()).unwrap_or(&self.model)
    }

    pub fn coder_model(&self) -> &str {
        non_empty(self.model_coder.as_deref()).unwrap_or(&self.model)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl TeamConfig {
    pub fn validate(&self) -> Result<()> {
        if self.verify.command.is_empty() || self.verify.command[0].trim().is_empty() {
            bail!("verify.command must be a non-empty array");
        }
        if self.verify.timeout_secs == 0 {
            bail!("verify.timeout_secs must be > 0");
        }
        if self.verify.output_limit_bytes == 0 {
            bail!("verify.output_limit_bytes must be > 0");
        }
        if self.chat.timeout_secs == 0 {
            bail!("chat.timeout_secs must be > 0");
        }
        if self.chat.max_tokens == 0 {
            bail!("chat.max_tokens must be > 0");
        }
        if !(0.0..=2.0).contains(&self.chat.temperature) {
            bail!("chat.temperature must be within 0.0..=2.0");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be > 0");
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            bail!("retry.max_backoff_ms must be >= retry.initial_backoff_ms");
        }
        if self.prompt_budget_bytes == 0 {
            bail!("prompt_budget_bytes must be > 0");
        }
        if self.required_file.trim().is_empty() {
            bail!("required_file must be non-empty");
        }
        if self.workdir.as_os_str().is_empty() {
            bail!("workdir must be non-empty");
        }
        Ok(())
    }

    /// Apply `TEAMLOOP_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`; empty values are ignored.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(value) = get("TEAMLOOP_BACKEND") {
            self.backend = value.parse().context("TEAMLOOP_BACKEND")?;
        }
        if let Some(value) = get("TEAMLOOP_MAX_ITERATIONS") {
            self.max_iterations = value
                .parse()
                .with_context(|| format!("TEAMLOOP_MAX_ITERATIONS must be an integer, got {value:?}"))?;
        }
        if let Some(value) = get("TEAMLOOP_WORKDIR") {
            self.workdir = PathBuf::from(value);
        }
        if let Some(value) = get("TEAMLOOP_LOG_DIR") {
            self.log_dir = PathBuf::from(value);
        }
        if let Some(value) = get("TEAMLOOP_OLLAMA_BASE_URL") {
            self.ollama.base_url = value;
        }
        if let Some(value) = get("TEAMLOOP_OLLAMA_MODEL") {
            self.ollama.model = value;
        }
        if let Some(value) = get("TEAMLOOP_OLLAMA_MODEL_GENERAL") {
            self.ollama.model_general = Some(value);
        }
        if let Some(value) = get("TEAMLOOP_OLLAMA_MODEL_CODER") {
            self.ollama.model_coder = Some(value);
        }
        if let Some(value) = get("TEAMLOOP_ANTHROPIC_MODEL") {
            self.anthropic.model = value;
        }
        if let Some(value) = get("TEAMLOOP_OPENAI_MODEL") {
            self.openai.model = value;
        }
        if let Some(value) = get("TEAMLOOP_OPENAI_BASE_URL") {
            self.openai.base_url = value;
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `TeamConfig::default()`.
pub fn load_config(path: &Path) -> Result<TeamConfig> {
    if !path.exists() {
        return Ok(TeamConfig::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let cfg: TeamConfig =
        toml::from_str(&contents).with_context(|| format!("parse config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &TeamConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
