use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::session::DEFAULT_GAP_THRESHOLD_SECS;
use crate::transcript::{DEFAULT_EXCERPT_TAIL_LINES, DEFAULT_USAGE_TAIL_LINES};

const CONFIG_SCHEMA_VERSION: u32 = 1;
const DEFAULT_CONTEXT_BUDGET_TOKENS: u64 = 200_000;
const DEFAULT_GIT_CACHE_TTL_MS: u64 = 5_000;
const DEFAULT_GIT_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_EXCERPT_MAX_LINES: usize = 3;
const DEFAULT_EXCERPT_LINE_WIDTH: usize = 80;
const MIN_EXCERPT_LINE_WIDTH: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatuslineConfig {
    pub schema_version: u32,
    pub tracking: TrackingConfig,
    pub context: ContextConfig,
    pub git: GitConfig,
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackingConfig {
    pub gap_threshold_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    pub budget_tokens: u64,
    pub tail_lines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    pub cache_ttl_ms: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DisplayConfig {
    pub show_git_branch: bool,
    pub show_context: bool,
    pub show_elapsed: bool,
    pub show_excerpt: bool,
    pub excerpt_tail_lines: usize,
    pub excerpt_max_lines: usize,
    pub excerpt_line_width: usize,
}

impl Default for StatuslineConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            tracking: TrackingConfig::default(),
            context: ContextConfig::default(),
            git: GitConfig::default(),
            display: DisplayConfig::default(),
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            gap_threshold_secs: DEFAULT_GAP_THRESHOLD_SECS,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget_tokens: DEFAULT_CONTEXT_BUDGET_TOKENS,
            tail_lines: DEFAULT_USAGE_TAIL_LINES,
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: DEFAULT_GIT_CACHE_TTL_MS,
            timeout_ms: DEFAULT_GIT_TIMEOUT_MS,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            show_git_branch: true,
            show_context: true,
            show_elapsed: true,
            show_excerpt: true,
            excerpt_tail_lines: DEFAULT_EXCERPT_TAIL_LINES,
            excerpt_max_lines: DEFAULT_EXCERPT_MAX_LINES,
            excerpt_line_width: DEFAULT_EXCERPT_LINE_WIDTH,
        }
    }
}

impl StatuslineConfig {
    pub fn load_or_init() -> Result<Self> {
        Self::load_or_init_at(&config_path())
    }

    pub fn load_or_init_at(cfg_path: &Path) -> Result<Self> {
        if cfg_path.exists() {
            let raw = fs::read_to_string(cfg_path)
                .with_context(|| format!("failed to read {}", cfg_path.display()))?;
            let mut parsed: StatuslineConfig = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", cfg_path.display()))?;
            if parsed.normalize_and_migrate() {
                parsed.save_to(cfg_path)?;
            }
            Ok(parsed)
        } else {
            let cfg = StatuslineConfig::default();
            cfg.save_to(cfg_path)?;
            Ok(cfg)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }

        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn git_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.git.cache_ttl_ms)
    }

    /// `STATUSLINE_GIT_TIMEOUT_MS` wins over the file.
    pub fn effective_git_timeout(&self) -> Duration {
        Duration::from_millis(env_u64("STATUSLINE_GIT_TIMEOUT_MS", self.git.timeout_ms))
    }

    fn normalize_and_migrate(&mut self) -> bool {
        let mut changed = false;

        if self.schema_version < CONFIG_SCHEMA_VERSION {
            self.schema_version = CONFIG_SCHEMA_VERSION;
            changed = true;
        }

        if self.tracking.gap_threshold_secs <= 0 {
            self.tracking.gap_threshold_secs = DEFAULT_GAP_THRESHOLD_SECS;
            changed = true;
        }
        if self.context.budget_tokens == 0 {
            self.context.budget_tokens = DEFAULT_CONTEXT_BUDGET_TOKENS;
            changed = true;
        }
        if self.context.tail_lines == 0 {
            self.context.tail_lines = DEFAULT_USAGE_TAIL_LINES;
            changed = true;
        }
        if self.git.timeout_ms == 0 {
            self.git.timeout_ms = DEFAULT_GIT_TIMEOUT_MS;
            changed = true;
        }
        if self.display.excerpt_tail_lines == 0 {
            self.display.excerpt_tail_lines = DEFAULT_EXCERPT_TAIL_LINES;
            changed = true;
        }
        if self.display.excerpt_line_width < MIN_EXCERPT_LINE_WIDTH {
            self.display.excerpt_line_width = DEFAULT_EXCERPT_LINE_WIDTH;
            changed = true;
        }

        changed
    }
}

/// Root of everything this tool writes. `STATUSLINE_HOME` overrides the
/// default `~/.claude/session-tracker`.
pub fn tracker_home() -> PathBuf {
    if let Ok(custom) = env::var("STATUSLINE_HOME") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
        .join("session-tracker")
}

pub fn sessions_path() -> PathBuf {
    tracker_home().join("sessions")
}

pub fn config_path() -> PathBuf {
    tracker_home().join("statusline-config.json")
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
