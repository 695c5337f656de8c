use crate::error::FloorsumError;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub interval: u64,
    pub keep_count: u64,
    pub max_batches_per_run: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: 20,
            keep_count: 10,
            max_batches_per_run: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub enabled: bool,
    pub auto_bind: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_bind: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Local,
    Command,
    OpenAiCompatible,
    Anthropic,
}

impl ProviderKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "local" => Some(Self::Local),
            "command" => Some(Self::Command),
            "openai-compatible" | "openai" => Some(Self::OpenAiCompatible),
            "anthropic" => Some(Self::Anthropic),
            _ => None,
        }
    }

    pub fn is_remote(self) -> bool {
        matches!(self, Self::OpenAiCompatible | Self::Anthropic)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    pub provider: String,
    pub model: String,
    pub base_url: String,
    pub command: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            model: String::new(),
            base_url: String::new(),
            command: String::new(),
            timeout_secs: 180,
            max_retries: 2,
            retry_backoff_ms: 1000,
        }
    }
}

impl SummarizerConfig {
    pub fn provider_kind(&self) -> Option<ProviderKind> {
        ProviderKind::parse(&self.provider)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FloorsumConfig {
    pub schedule: ScheduleConfig,
    pub sync: SyncConfig,
    pub summarizer: SummarizerConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialFloorsumConfig {
    schedule: Option<PartialSchedule>,
    sync: Option<PartialSync>,
    summarizer: Option<SummarizerConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialSchedule {
    interval: Option<u64>,
    #[serde(alias = "keep")]
    keep_count: Option<u64>,
    #[serde(alias = "max_batches")]
    max_batches_per_run: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialSync {
    enabled: Option<bool>,
    auto_bind: Option<bool>,
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_bool(var: &str, fallback: bool) -> bool {
    match env::var(var) {
        Ok(v) => match v.trim() {
            "1" | "true" | "TRUE" | "yes" | "on" => true,
            "0" | "false" | "FALSE" | "no" | "off" => false,
            _ => fallback,
        },
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

/// First non-empty API key from the supported environment variables.
pub fn api_key_from_env(provider: ProviderKind) -> Option<String> {
    let vendor = match provider {
        ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
        _ => "OPENAI_API_KEY",
    };
    for var in ["FLOORSUM_API_KEY", "AI_API_KEY", vendor] {
        if let Ok(v) = env::var(var) {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

pub fn validate(cfg: &FloorsumConfig) -> Result<(), FloorsumError> {
    if cfg.schedule.interval == 0 {
        return Err(FloorsumError::InvalidConfig(
            "schedule.interval must be >= 1".to_string(),
        ));
    }
    if cfg.schedule.max_batches_per_run == 0 {
        return Err(FloorsumError::InvalidConfig(
            "schedule.max_batches_per_run must be >= 1".to_string(),
        ));
    }
    if cfg.summarizer.timeout_secs == 0 {
        return Err(FloorsumError::InvalidConfig(
            "summarizer.timeout_secs must be >= 1".to_string(),
        ));
    }
    let Some(kind) = cfg.summarizer.provider_kind() else {
        return Err(FloorsumError::InvalidConfig(format!(
            "unknown summarizer provider `{}`: use `local`, `command`, `openai-compatible`, or `anthropic`",
            cfg.summarizer.provider
        )));
    };
    if kind == ProviderKind::Command && cfg.summarizer.command.trim().is_empty() {
        return Err(FloorsumError::InvalidConfig(
            "summarizer.command is required when provider=command".to_string(),
        ));
    }
    if kind.is_remote() && cfg.summarizer.model.trim().is_empty() {
        return Err(FloorsumError::InvalidConfig(format!(
            "summarizer.model is required when provider={}",
            cfg.summarizer.provider
        )));
    }
    Ok(())
}

pub fn resolve_config_path(home: &Path) -> PathBuf {
    if let Ok(custom) = env::var("FLOORSUM_CONFIG_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    home.join("floorsum.toml")
}

fn merge_toml(base: &mut FloorsumConfig, raw: &str, origin: &Path) -> Result<()> {
    let parsed: PartialFloorsumConfig = toml::from_str(raw)
        .map_err(|err| anyhow!("failed to parse floorsum config {}: {err}", origin.display()))?;
    if let Some(schedule) = parsed.schedule {
        if let Some(interval) = schedule.interval {
            base.schedule.interval = interval;
        }
        if let Some(keep_count) = schedule.keep_count {
            base.schedule.keep_count = keep_count;
        }
        if let Some(max_batches) = schedule.max_batches_per_run {
            base.schedule.max_batches_per_run = max_batches;
        }
    }
    if let Some(sync) = parsed.sync {
        if let Some(enabled) = sync.enabled {
            base.sync.enabled = enabled;
        }
        if let Some(auto_bind) = sync.auto_bind {
            base.sync.auto_bind = auto_bind;
        }
    }
    if let Some(summarizer) = parsed.summarizer {
        base.summarizer = summarizer;
    }
    Ok(())
}

fn apply_env_overrides(cfg: &mut FloorsumConfig) {
    cfg.schedule.interval = env_or_u64("FLOORSUM_INTERVAL", cfg.schedule.interval);
    cfg.schedule.keep_count = env_or_u64("FLOORSUM_KEEP_COUNT", cfg.schedule.keep_count);
    cfg.schedule.max_batches_per_run =
        env_or_u64("FLOORSUM_MAX_BATCHES", cfg.schedule.max_batches_per_run);
    cfg.sync.enabled = env_or_bool("FLOORSUM_SYNC_ENABLED", cfg.sync.enabled);
    cfg.sync.auto_bind = env_or_bool("FLOORSUM_AUTO_BIND", cfg.sync.auto_bind);

    let s = &mut cfg.summarizer;
    s.provider = env_or_string("FLOORSUM_SUMMARIZER_PROVIDER", &s.provider);
    s.model = env_or_string("FLOORSUM_SUMMARIZER_MODEL", &s.model);
    s.base_url = env_or_string("FLOORSUM_SUMMARIZER_BASE_URL", &s.base_url);
    s.command = env_or_string("FLOORSUM_SUMMARIZER_COMMAND", &s.command);
    s.timeout_secs = env_or_u64("FLOORSUM_SUMMARIZER_TIMEOUT_SECS", s.timeout_secs);
    s.max_retries = env_or_u64("FLOORSUM_SUMMARIZER_MAX_RETRIES", u64::from(s.max_retries))
        .try_into()
        .unwrap_or(u32::MAX);
    s.retry_backoff_ms = env_or_u64("FLOORSUM_SUMMARIZER_BACKOFF_MS", s.retry_backoff_ms);
}

pub fn load_config(home: &Path) -> Result<FloorsumConfig> {
    let mut cfg = FloorsumConfig::default();
    let path = resolve_config_path(home);
    if path.exists() {
        let raw = fs::read_to_string(&path)
            .map_err(|err| anyhow!("failed to read floorsum config {}: {err}", path.display()))?;
        merge_toml(&mut cfg, &raw, &path)?;
    }
    apply_env_overrides(&mut cfg);
    validate(&cfg)?;
    Ok(cfg)
}
