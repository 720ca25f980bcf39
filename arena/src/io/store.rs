//! Directory-backed job store.
//!
//! Each job is one `<id>.json` file and its state is the directory holding
//! it. Every transition is a single `rename`, which is the only
//! concurrency-control primitive: whichever worker's rename succeeds owns
//! the job, and losers see `NotFound` and move on. There is no in-process
//! lock around these directories.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use super::atomic::write_json_atomic;
use super::paths::ArenaPaths;
use crate::core::job::{JobRecord, JobState, id_from_file_name, record_file_name};

/// A job this worker owns, currently in `running/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct JobStore {
    paths: ArenaPaths,
}

impl JobStore {
    pub fn new(paths: ArenaPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &ArenaPaths {
        &self.paths
    }

    /// Write a new record into `inbox/`. Visible to `claim` once this returns.
    #[instrument(skip_all, fields(job_id = %record.id))]
    pub fn enqueue(&self, record: &JobRecord) -> Result<String> {
        if record.id.trim().is_empty() || record.id.contains(['/', '\\']) {
            return Err(anyhow!("invalid job id '{}'", record.id));
        }
        let path = self.record_path(JobState::Inbox, &record.id);
        if path.exists() {
            return Err(anyhow!("job {} already queued", record.id));
        }
        write_json_atomic(&path, record)
            .with_context(|| format!("enqueue job {}", record.id))?;
        debug!("job enqueued");
        Ok(record.id.clone())
    }

    /// Take ownership of the first inbox record another worker has not taken.
    pub fn claim(&self) -> Result<Option<ClaimedJob>> {
        for id in self.list(JobState::Inbox)? {
            let source = self.record_path(JobState::Inbox, &id);
            let target = self.record_path(JobState::Running, &id);
            match fs::rename(&source, &target) {
                Ok(()) => {
                    debug!(job_id = %id, "claimed job");
                    return Ok(Some(ClaimedJob { id, path: target }));
                }
                // Another worker moved it first.
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    warn!(job_id = %id, err = %err, "claim rename failed, skipping");
                }
            }
        }
        Ok(None)
    }

    /// Move a claimed job into its terminal directory.
    #[instrument(skip_all, fields(job_id = %job.id, success = success))]
    pub fn finish(&self, job: &ClaimedJob, success: bool) -> Result<JobState> {
        let next = if success {
            JobState::Done
        } else {
            JobState::Failed
        };
        let current = self
            .locate(&job.id)
            .ok_or_else(|| anyhow!("job {} is not in any queue directory", job.id))?;
        if !current.can_transition_to(next) {
            return Err(anyhow!("job {} cannot move from {current} to {next}", job.id));
        }
        let target = self.record_path(next, &job.id);
        fs::rename(&job.path, &target).with_context(|| {
            format!("move job {} from running to {next}", job.id)
        })?;
        debug!(state = %next, "job finished");
        Ok(next)
    }

    /// Sorted ids of the records in `state`. Temp files are skipped.
    pub fn list(&self, state: JobState) -> Result<Vec<String>> {
        list_record_ids(self.paths.state_dir(state))
    }

    pub fn count(&self, state: JobState) -> Result<usize> {
        Ok(self.list(state)?.len())
    }

    /// Which state directory currently holds `id`, if any.
    pub fn locate(&self, id: &str) -> Option<JobState> {
        JobState::ALL
            .into_iter()
            .find(|state| self.record_path(*state, id).is_file())
    }

    pub fn record_path(&self, state: JobState, id: &str) -> PathBuf {
        self.paths.state_dir(state).join(record_file_name(id))
    }
}

/// Sorted ids of `*.json` records directly inside `dir`. Missing dir is empty.
pub fn list_record_ids(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("list {}", dir.display())),
    };
    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let name = entry.file_name();
        if let Some(id) = name.to_str().and_then(id_from_file_name) {
            ids.push(id.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, JobStore) {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ArenaPaths::new(temp.path());
        paths.ensure_layout().expect("layout");
        (temp, JobStore::new(paths))
    }

    fn record(id: &str) -> JobRecord {
        JobRecord {
            id: id.to_string(),
            prompt: "do it".to_string(),
            repo: "/tmp/repo".to_string(),
            repo_key: None,
            mode: None,
            hint: None,
            submitted_at: None,
        }
    }

    #[test]
    fn enqueue_then_claim_moves_to_running() {
        let (_temp, store) = store();
        store.enqueue(&record("a")).expect("enqueue");
        assert_eq!(store.locate("a"), Some(JobState::Inbox));

        let claimed = store.claim().expect("claim").expect("some job");
        assert_eq!(claimed.id, "a");
        assert_eq!(store.locate("a"), Some(JobState::Running));
        assert!(store.claim().expect("claim").is_none());
    }

    #[test]
    fn claim_order_is_lexicographic() {
        let (_temp, store) = store();
        for id in ["c", "a", "b"] {
            store.enqueue(&record(id)).expect("enqueue");
        }
        let order: Vec<String> = std::iter::from_fn(|| store.claim().expect("claim"))
            .map(|job| job.id)
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn finish_moves_to_terminal_dir() {
        let (_temp, store) = store();
        store.enqueue(&record("ok")).expect("enqueue");
        store.enqueue(&record("bad")).expect("enqueue");
        let bad = store.claim().expect("claim").expect("job");
        let ok = store.claim().expect("claim").expect("job");

        assert_eq!(store.finish(&ok, true).expect("finish"), JobState::Done);
        assert_eq!(store.finish(&bad, false).expect("finish"), JobState::Failed);
        assert_eq!(store.locate("ok"), Some(JobState::Done));
        assert_eq!(store.locate("bad"), Some(JobState::Failed));
        assert_eq!(store.count(JobState::Running).expect("count"), 0);
    }

    #[test]
    fn finishing_twice_fails() {
        let (_temp, store) = store();
        store.enqueue(&record("x")).expect("enqueue");
        let job = store.claim().expect("claim").expect("job");
        store.finish(&job, true).expect("finish");
        assert!(store.finish(&job, false).is_err());
        assert_eq!(store.locate("x"), Some(JobState::Done));
    }

    #[test]
    fn temp_files_are_invisible() {
        let (_temp, store) = store();
        fs::write(store.paths().inbox_dir.join("half.json.tmp"), "{").expect("write");
        assert_eq!(store.count(JobState::Inbox).expect("count"), 0);
        assert!(store.claim().expect("claim").is_none());
    }

    #[test]
    fn duplicate_and_path_like_ids_are_rejected() {
        let (_temp, store) = store();
        store.enqueue(&record("dup")).expect("enqueue");
        assert!(store.enqueue(&record("dup")).is_err());
        assert!(store.enqueue(&record("../escape")).is_err());
        assert!(store.enqueue(&record("")).is_err());
    }

    #[test]
    fn enqueued_record_round_trips() {
        let (_temp, store) = store();
        let original = record("rt");
        store.enqueue(&original).expect("enqueue");
        let raw = fs::read_to_string(store.record_path(JobState::Inbox, "rt")).expect("read");
        let parsed: JobRecord = serde_json::from_str(&raw).expect("parse");
        assert_eq!(parsed, original);
    }
}
