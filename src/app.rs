use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::{self, ScopedJoinHandle};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Deserialize;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::config::{self, StatuslineConfig};
use crate::error::{self, StatuslineError};
use crate::git::GitBranchCache;
use crate::render::{Renderer, StatusLine};
use crate::session::{Session, SessionStore, TodayTotals};
use crate::transcript::{self, UsageTailScanner};
use crate::util::format_elapsed;

/// The JSON object the assistant pipes in on every refresh. Unknown fields
/// are ignored and every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StatusRequest {
    pub model: ModelInfo,
    pub session_id: String,
    pub workspace: WorkspaceInfo,
    pub transcript_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModelInfo {
    pub display_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkspaceInfo {
    pub current_dir: String,
}

impl StatusRequest {
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        serde_json::from_reader(reader).context("failed to decode status request from stdin")
    }

    fn transcript(&self) -> &Path {
        Path::new(self.transcript_path.as_deref().unwrap_or(""))
    }

    fn project_name(&self) -> String {
        Path::new(&self.workspace.current_dir)
            .file_name()
            .and_then(|name| name.to_str())
            .map(ToString::to_string)
            .unwrap_or_else(|| self.workspace.current_dir.clone())
    }
}

/// Results of the read-only queries of one invocation, one slot per signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signals {
    pub branch: Option<String>,
    pub today: TodayTotals,
    pub context_tokens: u64,
    pub excerpt: Option<String>,
}

/// Fans the independent queries out, joins them, then records the heartbeat.
pub struct Aggregator {
    config: StatuslineConfig,
    git: GitBranchCache,
    store: SessionStore,
    scanner: UsageTailScanner,
}

impl Aggregator {
    pub fn new(config: &StatuslineConfig, sessions_root: PathBuf) -> Self {
        Self {
            config: config.clone(),
            git: GitBranchCache::new(config.git_cache_ttl(), config.effective_git_timeout()),
            store: SessionStore::new(sessions_root, config.tracking.gap_threshold_secs),
            scanner: UsageTailScanner::new(config.context.tail_lines),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Collects all signals and only then writes this session's heartbeat,
    /// so today's total reflects the state before this invocation.
    pub fn run(&self, request: &StatusRequest, now: DateTime<Local>) -> Signals {
        let signals = self.collect(request, now);
        self.record(request, now);
        signals
    }

    pub fn collect(&self, request: &StatusRequest, now: DateTime<Local>) -> Signals {
        thread::scope(|scope| {
            let branch = scope.spawn(|| self.query_branch(request));
            let today = scope.spawn(|| self.store.aggregate_today(now));
            let context = scope.spawn(|| self.scanner.estimate(request.transcript()));
            let excerpt = scope.spawn(|| self.query_excerpt(request));

            Signals {
                branch: settle("git_branch", branch),
                today: settle("today_total", today),
                context_tokens: settle("context_usage", context),
                excerpt: settle("message_excerpt", excerpt),
            }
        })
    }

    pub fn record(&self, request: &StatusRequest, now: DateTime<Local>) -> Option<Session> {
        if request.session_id.is_empty() {
            debug!("no session id in request; heartbeat skipped");
            return None;
        }
        match self.store.record_heartbeat(&request.session_id, now) {
            Ok(session) => Some(session),
            Err(err) => {
                warn!(error = %err, session_id = %request.session_id, "heartbeat not persisted");
                None
            }
        }
    }

    fn query_branch(&self, request: &StatusRequest) -> error::Result<Option<String>> {
        if !self.config.display.show_git_branch {
            return Ok(None);
        }
        let dir = if request.workspace.current_dir.is_empty() {
            std::env::current_dir().map_err(|err| StatuslineError::io(".", err))?
        } else {
            PathBuf::from(&request.workspace.current_dir)
        };
        Ok(self.git.branch(&dir))
    }

    fn query_excerpt(&self, request: &StatusRequest) -> error::Result<Option<String>> {
        if !self.config.display.show_excerpt || request.session_id.is_empty() {
            return Ok(None);
        }
        transcript::latest_user_message(
            request.transcript(),
            &request.session_id,
            self.config.display.excerpt_tail_lines,
        )
    }

    pub fn status_line(&self, request: &StatusRequest, signals: Signals) -> StatusLine {
        let display = &self.config.display;
        StatusLine {
            model: request.model.display_name.clone(),
            project: request.project_name(),
            branch: signals.branch,
            context_tokens: display.show_context.then_some(signals.context_tokens),
            today: display.show_elapsed.then_some(signals.today),
            excerpt: signals.excerpt,
        }
    }
}

/// Unwraps one joined task, substituting the default on error or panic.
fn settle<T: Default>(signal: &'static str, handle: ScopedJoinHandle<'_, error::Result<T>>) -> T {
    match handle.join() {
        Ok(Ok(value)) => value,
        Ok(Err(err)) if err.is_not_found() => {
            debug!(signal, error = %err, "signal source missing");
            T::default()
        }
        Ok(Err(err)) => {
            warn!(signal, error = %err, "signal unavailable");
            T::default()
        }
        Err(_) => {
            warn!(signal, "signal task panicked");
            T::default()
        }
    }
}

pub fn run_statusline(config: &StatuslineConfig, color: bool) -> Result<()> {
    let request = StatusRequest::from_reader(io::stdin().lock())?;
    let aggregator = Aggregator::new(config, config::sessions_path());
    let signals = aggregator.run(&request, Local::now());
    let line = aggregator.status_line(&request, signals);
    let rendered = Renderer::new(&config.display, config.context.budget_tokens, color).render(&line);

    let mut out = io::stdout().lock();
    out.write_all(rendered.as_bytes())
        .and_then(|()| out.flush())
        .context("failed to write status line")?;
    Ok(())
}

pub fn print_status(config: &StatuslineConfig) -> Result<()> {
    let store = SessionStore::new(config::sessions_path(), config.tracking.gap_threshold_secs);
    let totals = store
        .aggregate_today(Local::now())
        .context("failed to read session records")?;

    println!("session-statusline status");
    println!("home: {}", config::tracker_home().display());
    println!("config: {}", config::config_path().display());
    println!("sessions_dir: {}", store.root().display());
    println!("today_total: {}", format_elapsed(totals.total_seconds));
    println!("active_sessions: {}", totals.active_sessions);
    Ok(())
}

pub fn doctor(config: &StatuslineConfig) -> Result<u8> {
    let mut issues = 0u8;
    let sessions_dir = config::sessions_path();

    println!("session-statusline doctor");
    println!("config_path: {}", config::config_path().display());
    println!("sessions_dir: {}", sessions_dir.display());

    match sessions_dir_writable(&sessions_dir) {
        Ok(()) => println!("[OK] Sessions directory is writable."),
        Err(err) => {
            issues += 1;
            println!("[WARN] Sessions directory is not writable: {err:#}");
        }
    }

    if command_available("git") {
        println!("[OK] git command available.");
    } else {
        issues += 1;
        println!("[WARN] git command not found in PATH; branch segment will stay empty.");
    }

    println!(
        "git timeout: {} ms",
        config.effective_git_timeout().as_millis()
    );

    if issues == 0 {
        println!("Doctor: healthy");
        Ok(0)
    } else {
        println!("Doctor: {issues} issue(s) found");
        Ok(1)
    }
}

fn sessions_dir_writable(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    NamedTempFile::new_in(dir).with_context(|| format!("failed to write in {}", dir.display()))?;
    Ok(())
}

fn command_available(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
