//! Per-job artifact bundles under `patches/<repo_key>/<id>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::agent::{Step, StepOutput};

/// File names inside one bundle.
#[derive(Debug, Clone)]
pub struct ArtifactBundle {
    pub dir: PathBuf,
    pub plan_stdout_path: PathBuf,
    pub plan_stderr_path: PathBuf,
    pub apply_stdout_path: PathBuf,
    pub apply_stderr_path: PathBuf,
    pub error_path: PathBuf,
}

impl ArtifactBundle {
    pub fn new(artifacts_dir: &Path, repo_key: &str, job_id: &str) -> Self {
        let dir = artifacts_dir.join(repo_key).join(job_id);
        Self {
            plan_stdout_path: dir.join("plan.stdout.txt"),
            plan_stderr_path: dir.join("plan.stderr.txt"),
            apply_stdout_path: dir.join("apply.stdout.txt"),
            apply_stderr_path: dir.join("apply.stderr.txt"),
            error_path: dir.join("error.txt"),
            dir,
        }
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create artifact dir {}", self.dir.display()))
    }

    /// Persist one step's stdout and stderr.
    pub fn write_step(&self, step: Step, output: &StepOutput) -> Result<()> {
        let (stdout_path, stderr_path) = match step {
            Step::Plan => (&self.plan_stdout_path, &self.plan_stderr_path),
            Step::Apply => (&self.apply_stdout_path, &self.apply_stderr_path),
        };
        write_text(stdout_path, &output.stdout)?;
        write_text(stderr_path, &output.stderr)
    }

    pub fn write_error(&self, message: &str) -> Result<()> {
        write_text(&self.error_path, message)
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}
