//! Validated submission of new jobs, shared by the HTTP ingress and the CLI.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::core::job::JobRecord;
use crate::core::repo_key::compute_repo_key;
use crate::io::paths::expand_tilde;
use crate::io::store::JobStore;

/// Mode recorded when the submitter does not name one.
pub const DEFAULT_MODE: &str = "code_apply";

/// Submission payload, e.g. the body of `POST /jobs`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobRequest {
    pub dir: Option<String>,
    pub prompt: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub hint: Option<String>,
}

/// Returned once the record is durably in `inbox/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accepted {
    pub id: String,
    pub repo_key: String,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("dir and prompt are required")]
    MissingField,
    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("could not enqueue job: {0:#}")]
    Store(anyhow::Error),
}

impl SubmitError {
    /// Whether the caller sent a bad request (as opposed to a server fault).
    pub fn is_client_error(&self) -> bool {
        !matches!(self, SubmitError::Store(_))
    }
}

/// Validate `request` and enqueue it under a fresh uuid.
pub fn submit(store: &JobStore, request: JobRequest) -> Result<Accepted, SubmitError> {
    let dir = request
        .dir
        .as_deref()
        .map(str::trim)
        .filter(|dir| !dir.is_empty())
        .ok_or(SubmitError::MissingField)?;
    let prompt = request
        .prompt
        .as_deref()
        .map(str::trim)
        .filter(|prompt| !prompt.is_empty())
        .ok_or(SubmitError::MissingField)?;

    let expanded = expand_tilde(dir);
    // Rebuilding from components drops trailing separators and `.` segments,
    // so `repo` and `repo/` share one repo key.
    let repo: PathBuf = std::path::absolute(&expanded)
        .unwrap_or(expanded)
        .components()
        .collect();
    if !repo.is_dir() {
        return Err(SubmitError::NotADirectory(repo));
    }

    let repo = repo.to_string_lossy().into_owned();
    let repo_key = compute_repo_key(&repo);
    let record = JobRecord {
        id: Uuid::new_v4().to_string(),
        prompt: prompt.to_string(),
        repo,
        repo_key: Some(repo_key.clone()),
        mode: Some(
            request
                .mode
                .filter(|mode| !mode.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_MODE.to_string()),
        ),
        hint: request.hint.filter(|hint| !hint.trim().is_empty()),
        submitted_at: Some(chrono::Utc::now().to_rfc3339()),
    };
    let id = store.enqueue(&record).map_err(SubmitError::Store)?;
    info!(job_id = %id, %repo_key, "job accepted");
    Ok(Accepted { id, repo_key })
}
