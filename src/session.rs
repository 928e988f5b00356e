use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Result, StatuslineError};

/// Heartbeats closer together than this belong to the same interval, and a
/// session whose last heartbeat is younger than this counts as active.
pub const DEFAULT_GAP_THRESHOLD_SECS: i64 = 600;

/// A contiguous span of activity. `end` is `None` only for the newest
/// interval of a session that has not seen a second heartbeat yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub start: i64,
    #[serde(default)]
    pub end: Option<i64>,
}

impl Interval {
    pub fn open(start: i64) -> Self {
        Self { start, end: None }
    }

    pub fn closed(start: i64, end: i64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    pub fn duration_secs(&self) -> Option<i64> {
        self.end.map(|end| end.saturating_sub(self.start))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Session {
    pub id: String,
    pub date: String,
    pub start: i64,
    pub last_heartbeat: i64,
    pub total_seconds: i64,
    pub intervals: Vec<Interval>,
}

impl Session {
    pub fn new(id: impl Into<String>, date: impl Into<String>, now: i64) -> Self {
        Self {
            id: id.into(),
            date: date.into(),
            start: now,
            last_heartbeat: now,
            total_seconds: 0,
            intervals: vec![Interval::open(now)],
        }
    }

    /// Folds one heartbeat at `now` into the interval list.
    ///
    /// A gap below `gap_threshold` stretches the newest interval to `now`.
    /// A longer gap opens a zero-length interval at `now`; the silence is
    /// never counted and the new interval only grows from the following
    /// heartbeat onwards. An open interval left behind by a split is closed
    /// where it started, so it still adds nothing to the total.
    pub fn apply_heartbeat(&mut self, now: i64, gap_threshold: i64) {
        let gap = now.saturating_sub(self.last_heartbeat);
        if gap < gap_threshold {
            match self.intervals.last_mut() {
                Some(last) => last.end = Some(now),
                None => self.intervals.push(Interval::closed(now, now)),
            }
        } else {
            if let Some(last) = self.intervals.last_mut()
                && last.end.is_none()
            {
                last.end = Some(last.start);
            }
            self.intervals.push(Interval::closed(now, now));
        }
        self.last_heartbeat = now;
        self.total_seconds = self.closed_seconds();
    }

    pub fn closed_seconds(&self) -> i64 {
        self.intervals
            .iter()
            .filter_map(Interval::duration_secs)
            .fold(0, i64::saturating_add)
    }

    pub fn is_active(&self, now: i64, gap_threshold: i64) -> bool {
        now.saturating_sub(self.last_heartbeat) < gap_threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TodayTotals {
    pub total_seconds: i64,
    pub active_sessions: usize,
}

/// One JSON file per session under a single directory.
///
/// Updates are read-modify-write without a cross-process lock: two
/// invocations racing on the same session id keep whichever write lands
/// last. Each write goes through a temp file and a rename, so readers never
/// observe a half-written record.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
    gap_threshold_secs: i64,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>, gap_threshold_secs: i64) -> Self {
        Self {
            root: root.into(),
            gap_threshold_secs,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn gap_threshold_secs(&self) -> i64 {
        self.gap_threshold_secs
    }

    pub fn session_path(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.root.join(format!("{session_id}.json")))
    }

    pub fn load(&self, session_id: &str) -> Result<Option<Session>> {
        let path = self.session_path(session_id)?;
        match read_session_file(&path) {
            Ok(session) => Ok(Some(session)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn save(&self, session: &Session) -> Result<()> {
        let path = self.session_path(&session.id)?;
        fs::create_dir_all(&self.root).map_err(|err| StatuslineError::io(&self.root, err))?;
        let data = serde_json::to_vec(session).map_err(|err| StatuslineError::json(&path, err))?;

        let mut tmp =
            NamedTempFile::new_in(&self.root).map_err(|err| StatuslineError::io(&self.root, err))?;
        tmp.write_all(&data)
            .map_err(|err| StatuslineError::io(&path, err))?;
        tmp.persist(&path)
            .map_err(|err| StatuslineError::io(&path, err.error))?;
        Ok(())
    }

    /// Records that `session_id` is alive at `now` and persists the result.
    ///
    /// On error nothing is written and the returned error describes why; the
    /// previous file stays authoritative for the next invocation.
    pub fn record_heartbeat(&self, session_id: &str, now: DateTime<Local>) -> Result<Session> {
        let timestamp = now.timestamp();
        let mut session = match self.load(session_id) {
            Ok(Some(session)) => session,
            Ok(None) => Session::new(session_id, local_date(now), timestamp),
            Err(err @ StatuslineError::Json { .. }) => {
                warn!(error = %err, session_id, "discarding unreadable session record");
                Session::new(session_id, local_date(now), timestamp)
            }
            Err(err) => return Err(err),
        };

        session.apply_heartbeat(timestamp, self.gap_threshold_secs);
        self.save(&session)?;
        Ok(session)
    }

    /// Sums the closed time of every session first seen on `now`'s local
    /// date and counts those with a recent heartbeat. Unreadable files are
    /// skipped.
    pub fn aggregate_today(&self, now: DateTime<Local>) -> Result<TodayTotals> {
        let mut totals = TodayTotals::default();
        for session in self.sessions_on(&local_date(now))? {
            totals.total_seconds = totals.total_seconds.saturating_add(session.total_seconds);
            if session.is_active(now.timestamp(), self.gap_threshold_secs) {
                totals.active_sessions += 1;
            }
        }
        Ok(totals)
    }

    pub fn sessions_on(&self, date: &str) -> Result<Vec<Session>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    if err.depth() == 0 {
                        let io = err
                            .into_io_error()
                            .unwrap_or_else(|| std::io::Error::other("walk failed"));
                        return Err(StatuslineError::io(&self.root, io));
                    }
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|ext| ext.to_str()) != Some("json")
            {
                continue;
            }
            match read_session_file(path) {
                Ok(session) if session.date == date => sessions.push(session),
                Ok(_) => {}
                Err(err) => debug!(error = %err, "skipping session file"),
            }
        }
        Ok(sessions)
    }
}

pub fn local_date(now: DateTime<Local>) -> String {
    now.format("%Y-%m-%d").to_string()
}

fn read_session_file(path: &Path) -> Result<Session> {
    let raw = fs::read(path).map_err(|err| StatuslineError::io(path, err))?;
    serde_json::from_slice(&raw).map_err(|err| StatuslineError::json(path, err))
}

fn validate_session_id(session_id: &str) -> Result<()> {
    let invalid = session_id.is_empty()
        || session_id == "."
        || session_id == ".."
        || session_id
            .chars()
            .any(|ch| matches!(ch, '/' | '\\' | '\0') || ch.is_control());
    if invalid {
        return Err(StatuslineError::InvalidSessionId(session_id.to_string()));
    }
    Ok(())
}
