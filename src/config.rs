use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{MirrorClawError, MirrorClawResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub perception: PerceptionConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    pub active_provider: String,
    #[serde(default)]
    pub providers: HashMap<String, ProviderEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub display_name: String,
    /// Base URL of an OpenAI-compatible API; `/chat/completions` is appended.
    pub api_base: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Use SSE streaming for completions.
    #[serde(default)]
    pub stream: bool,
    /// Optional API key stored in config.toml (falls back to env var MIRRORCLAW_<ID>_API_KEY).
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_temperature() -> f64 {
    0.0
}

fn default_top_p() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    2048
}

/// Worker loop budgets and retry behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Step budget: maximum number of recorded turns per run.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Consecutive protocol failures tolerated within one turn before the run errors.
    #[serde(default = "default_parse_retry_limit")]
    pub parse_retry_limit: u32,
    #[serde(default)]
    pub max_duration_minutes: Option<u32>,
    #[serde(default = "default_loop_interval_ms")]
    pub loop_interval_ms: u64,
    /// Number of past turns replayed into each prompt.
    #[serde(default = "default_history_tail_rounds")]
    pub history_tail_rounds: usize,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Park the run in `paused` instead of stopping when the model calls `finished()`.
    #[serde(default)]
    pub hang_on_finished: bool,
    /// Park the run in `paused` instead of stopping when the model calls `call_user()`.
    #[serde(default = "default_true")]
    pub hang_on_call_user: bool,
    #[serde(default)]
    pub cache: ActionCacheConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            parse_retry_limit: default_parse_retry_limit(),
            max_duration_minutes: None,
            loop_interval_ms: default_loop_interval_ms(),
            history_tail_rounds: default_history_tail_rounds(),
            language: default_language(),
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
            hang_on_finished: false,
            hang_on_call_user: true,
            cache: ActionCacheConfig::default(),
        }
    }
}

fn default_max_steps() -> u32 {
    100
}

fn default_parse_retry_limit() -> u32 {
    3
}

fn default_loop_interval_ms() -> u64 {
    500
}

fn default_history_tail_rounds() -> usize {
    8
}

fn default_language() -> String {
    "en".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    800
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

/// Per-call bounds on the three external collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_capture_ms")]
    pub capture_ms: u64,
    #[serde(default = "default_model_ms")]
    pub model_ms: u64,
    #[serde(default = "default_execute_ms")]
    pub execute_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            capture_ms: default_capture_ms(),
            model_ms: default_model_ms(),
            execute_ms: default_execute_ms(),
        }
    }
}

fn default_capture_ms() -> u64 {
    10_000
}

fn default_model_ms() -> u64 {
    180_000
}

fn default_execute_ms() -> u64 {
    15_000
}

/// In-run replay of known-good actions for screens seen before.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionCacheConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Maximum Hamming distance between two screen fingerprints that still counts as a hit.
    #[serde(default = "default_hash_threshold")]
    pub hash_threshold: u32,
    /// Verified replays allowed per entry.
    #[serde(default = "default_max_reuse")]
    pub max_reuse: u32,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Top fraction of the screen ignored when fingerprinting (status bar).
    #[serde(default = "default_status_bar_frac")]
    pub status_bar_frac: f64,
}

impl Default for ActionCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hash_threshold: default_hash_threshold(),
            max_reuse: default_max_reuse(),
            max_entries: default_max_entries(),
            status_bar_frac: default_status_bar_frac(),
        }
    }
}

fn default_hash_threshold() -> u32 {
    5
}

fn default_max_reuse() -> u32 {
    3
}

fn default_max_entries() -> usize {
    256
}

fn default_status_bar_frac() -> f64 {
    0.08
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateSpace {
    /// Values are fractions of the surface (0.0–1.0).
    Normalized,
    /// Values are in 0..=coord_factor.
    Thousandths,
    /// Both axes ≤ 1.0 are fractions, anything else is divided by coord_factor.
    #[default]
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerceptionConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default)]
    pub window_contains: Option<String>,
    #[serde(default)]
    pub coordinate_space: CoordinateSpace,
    #[serde(default = "default_coord_factor")]
    pub coord_factor: f64,
    #[serde(default = "default_min_pixels")]
    pub min_pixels: u32,
    #[serde(default = "default_max_pixels")]
    pub max_pixels: u32,
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            window_contains: None,
            coordinate_space: CoordinateSpace::default(),
            coord_factor: default_coord_factor(),
            min_pixels: default_min_pixels(),
            max_pixels: default_max_pixels(),
        }
    }
}

fn default_app_name() -> String {
    "iPhone Mirroring".into()
}

fn default_coord_factor() -> f64 {
    1000.0
}

fn default_min_pixels() -> u32 {
    100 * 28 * 28
}

fn default_max_pixels() -> u32 {
    16384 * 28 * 28
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// A lagging subscriber skips the events it can no longer recover.
    #[default]
    DropOldest,
    /// A lagging subscriber is disconnected.
    Disconnect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token required on /api/* (falls back to env var MIRRORCLAW_SUPERVISOR_TOKEN).
    #[serde(default)]
    pub token: Option<String>,
    /// Live fan-out buffer shared by all subscribers of a run.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Events retained per run for replay.
    #[serde(default = "default_replay_capacity")]
    pub replay_capacity: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
    /// How long a finished run stays queryable.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
            port: default_port(),
            token: None,
            event_buffer: default_event_buffer(),
            replay_capacity: default_replay_capacity(),
            overflow: OverflowPolicy::default(),
            retention_secs: default_retention_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_bind() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    17334
}

fn default_event_buffer() -> usize {
    256
}

fn default_replay_capacity() -> usize {
    4096
}

fn default_retention_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Root directory for run logs; defaults to the platform data dir.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub save_snapshots: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            dir: None,
            save_snapshots: true,
        }
    }
}

impl RecorderConfig {
    /// `<data_local_dir>/MirrorClaw/runs`, falling back to `./runs`.
    pub fn resolved_dir(&self) -> PathBuf {
        if let Some(dir) = &self.dir {
            return dir.clone();
        }
        dirs::data_local_dir()
            .map(|d| d.join("MirrorClaw").join("runs"))
            .unwrap_or_else(|| PathBuf::from("runs"))
    }
}

impl AppConfig {
    /// Copy safe to write to disk: API keys and the supervisor token are masked.
    pub fn redacted(&self) -> AppConfig {
        let mut cfg = self.clone();
        for entry in cfg.llm.providers.values_mut() {
            if entry.api_key.is_some() {
                entry.api_key = Some("***REDACTED***".into());
            }
        }
        if cfg.supervisor.token.is_some() {
            cfg.supervisor.token = Some("***REDACTED***".into());
        }
        cfg
    }

    /// Token from config, overridden by `MIRRORCLAW_SUPERVISOR_TOKEN`.
    pub fn supervisor_token(&self) -> Option<String> {
        std::env::var("MIRRORCLAW_SUPERVISOR_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .or_else(|| self.supervisor.token.clone())
    }
}

fn resolve_config_path() -> MirrorClawResult<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(candidate);
            }
        }
    }

    let cwd = std::env::current_dir()?;
    let candidate = cwd.join("config.toml");
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(candidate);
    }

    Err(MirrorClawError::Config(
        "config.toml not found next to executable or in working directory".into(),
    ))
}

pub fn parse_config(content: &str) -> MirrorClawResult<AppConfig> {
    let config: AppConfig = toml::from_str(content)?;
    if config.agent.parse_retry_limit == 0 {
        return Err(MirrorClawError::Config(
            "agent.parse_retry_limit must be at least 1".into(),
        ));
    }
    if config.agent.retry.max_attempts == 0 {
        return Err(MirrorClawError::Config(
            "agent.retry.max_attempts must be at least 1".into(),
        ));
    }
    Ok(config)
}

pub fn load_config() -> MirrorClawResult<AppConfig> {
    let path = resolve_config_path()?;
    let content = std::fs::read_to_string(&path)?;
    let config = parse_config(&content)?;
    tracing::info!(path = %path.display(), provider = %config.llm.active_provider, "config loaded");
    Ok(config)
}
