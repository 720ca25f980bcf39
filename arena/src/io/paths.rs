//! Canonical on-disk layout of an arena state directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::core::job::JobState;

/// Env var that relocates the default state directory.
pub const HOME_ENV: &str = "TASKARENA_HOME";

/// All canonical paths within a state directory.
#[derive(Debug, Clone)]
pub struct ArenaPaths {
    pub root: PathBuf,
    pub queue_dir: PathBuf,
    pub inbox_dir: PathBuf,
    pub running_dir: PathBuf,
    pub done_dir: PathBuf,
    pub failed_dir: PathBuf,
    pub draining_dir: PathBuf,
    pub log_path: PathBuf,
    pub artifacts_dir: PathBuf,
    pub agent_rules_path: PathBuf,
    pub scoreboard_path: PathBuf,
    pub config_path: PathBuf,
}

impl ArenaPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let queue_dir = root.join("queue");
        Self {
            inbox_dir: queue_dir.join(JobState::Inbox.dir_name()),
            running_dir: queue_dir.join(JobState::Running.dir_name()),
            done_dir: queue_dir.join(JobState::Done.dir_name()),
            failed_dir: queue_dir.join(JobState::Failed.dir_name()),
            draining_dir: queue_dir.join("draining"),
            queue_dir,
            log_path: root.join("logs").join("run.jsonl"),
            artifacts_dir: root.join("patches"),
            agent_rules_path: root.join("rules").join("agents.md"),
            scoreboard_path: root.join("scores").join("scoreboard.json"),
            config_path: root.join("config.toml"),
            root,
        }
    }

    /// Directory holding records in `state`.
    pub fn state_dir(&self, state: JobState) -> &Path {
        match state {
            JobState::Inbox => &self.inbox_dir,
            JobState::Running => &self.running_dir,
            JobState::Done => &self.done_dir,
            JobState::Failed => &self.failed_dir,
        }
    }

    /// Create every directory and the log file. Safe to call repeatedly.
    pub fn ensure_layout(&self) -> Result<()> {
        let parents = [
            self.log_path.parent(),
            self.agent_rules_path.parent(),
            self.scoreboard_path.parent(),
        ];
        let dirs = [
            self.inbox_dir.as_path(),
            self.running_dir.as_path(),
            self.done_dir.as_path(),
            self.failed_dir.as_path(),
            self.draining_dir.as_path(),
            self.artifacts_dir.as_path(),
        ];
        for dir in dirs.into_iter().chain(parents.into_iter().flatten()) {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .with_context(|| format!("touch {}", self.log_path.display()))?;
        debug!(root = %self.root.display(), "state layout ready");
        Ok(())
    }
}

/// `$TASKARENA_HOME`, else `~/.taskarena`.
pub fn default_state_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().ok_or_else(|| anyhow!("cannot determine home directory"))?;
    Ok(home.join(".taskarena"))
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(raw: &str) -> PathBuf {
    let rest = if raw == "~" {
        Some("")
    } else {
        raw.strip_prefix("~/")
    };
    match (rest, dirs::home_dir()) {
        (Some(""), Some(home)) => home,
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_stable() {
        let paths = ArenaPaths::new("/state");
        assert_eq!(paths.inbox_dir, Path::new("/state/queue/inbox"));
        assert_eq!(paths.failed_dir, Path::new("/state/queue/failed"));
        assert_eq!(paths.log_path, Path::new("/state/logs/run.jsonl"));
        assert_eq!(
            paths.scoreboard_path,
            Path::new("/state/scores/scoreboard.json")
        );
        assert_eq!(paths.state_dir(JobState::Done), paths.done_dir);
    }

    #[test]
    fn ensure_layout_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ArenaPaths::new(temp.path().join("arena"));
        paths.ensure_layout().expect("first");
        fs::write(&paths.log_path, "line\n").expect("write log");
        paths.ensure_layout().expect("second");

        for state in JobState::ALL {
            assert!(paths.state_dir(state).is_dir());
        }
        assert!(paths.draining_dir.is_dir());
        assert_eq!(fs::read_to_string(&paths.log_path).expect("log"), "line\n");
    }

    #[test]
    fn tilde_expands_to_home() {
        let home = dirs::home_dir().expect("home");
        assert_eq!(expand_tilde("~/repo"), home.join("repo"));
        assert_eq!(expand_tilde("/abs/~x"), PathBuf::from("/abs/~x"));
    }
}
