//! Job record schema and the positional state machine.
//!
//! A job's state is never stored inside the record. It is the name of the
//! queue directory that currently holds `<id>.json`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Serialized form of a job, one file per job named `<id>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    #[serde(default)]
    pub prompt: String,
    /// Absolute path of the target repository. Older records used `dir`.
    #[serde(alias = "dir")]
    pub repo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<String>,
}

/// Queue directory a job record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Inbox,
    Running,
    Done,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 4] = [
        JobState::Inbox,
        JobState::Running,
        JobState::Done,
        JobState::Failed,
    ];

    /// Directory name under `queue/`.
    pub fn dir_name(self) -> &'static str {
        match self {
            JobState::Inbox => "inbox",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Failed => "failed",
        }
    }

    /// Only `inbox -> running` and `running -> done|failed` are legal.
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Inbox, JobState::Running)
                | (JobState::Running, JobState::Done)
                | (JobState::Running, JobState::Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// File name for a job id inside any state directory.
pub fn record_file_name(id: &str) -> String {
    format!("{id}.json")
}

/// Job id for a record file name, ignoring anything that is not `*.json`.
pub fn id_from_file_name(name: &str) -> Option<&str> {
    name.strip_suffix(".json").filter(|stem| !stem.is_empty())
}
