//! Test-only helpers: scripted agents, throwaway arenas, fake agent CLIs.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::job::JobRecord;
use crate::core::repo_key::compute_repo_key;
use crate::io::agent::{Agent, AgentUnavailable, Step, StepOutput, StepRequest};
use crate::io::paths::ArenaPaths;
use crate::io::store::JobStore;
use crate::worker::WorkerContext;

/// Canned result for one step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptedStep {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ScriptedStep {
    pub fn ok(stdout: &str) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.to_string(),
            ..Self::default()
        }
    }

    pub fn failing(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            stderr: format!("exit {code}"),
            ..Self::default()
        }
    }

    fn output(&self) -> StepOutput {
        StepOutput {
            exit_code: self.exit_code,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            timed_out: self.timed_out,
        }
    }
}

/// One observed `run_step` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub repo: PathBuf,
    pub step: Step,
    pub prompt: String,
}

/// In-process [`Agent`] returning fixed outputs and recording every call.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    pub plan: ScriptedStep,
    pub apply: ScriptedStep,
    unavailable: bool,
    /// Plan fails with exit 1 when the prompt contains this text.
    fail_marker: Option<String>,
    /// Plan panics when the prompt contains this text.
    panic_marker: Option<String>,
    /// Apply returns this as an `Err`, as if the step could not be spawned.
    apply_error: Option<String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedAgent {
    pub fn new(plan: ScriptedStep, apply: ScriptedStep) -> Self {
        Self {
            plan,
            apply,
            ..Self::default()
        }
    }

    pub fn succeeding() -> Self {
        Self::new(ScriptedStep::ok("1. edit files"), ScriptedStep::ok("applied"))
    }

    /// Every step fails as if no executable were installed.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::succeeding()
        }
    }

    pub fn with_fail_marker(mut self, marker: &str) -> Self {
        self.fail_marker = Some(marker.to_string());
        self
    }

    pub fn with_panic_marker(mut self, marker: &str) -> Self {
        self.panic_marker = Some(marker.to_string());
        self
    }

    pub fn with_apply_error(mut self, message: &str) -> Self {
        self.apply_error = Some(message.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn calls_for(&self, step: Step) -> usize {
        self.calls().iter().filter(|call| call.step == step).count()
    }
}

impl Agent for ScriptedAgent {
    fn run_step(&self, request: &StepRequest<'_>) -> Result<StepOutput> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedCall {
                repo: request.repo.to_path_buf(),
                step: request.step,
                prompt: request.prompt.to_string(),
            });
        if self.unavailable {
            return Err(AgentUnavailable {
                program: "claude".to_string(),
                tried: "PATH".to_string(),
            }
            .into());
        }
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        let marked = |marker: &Option<String>| {
            request.step == Step::Plan
                && marker
                    .as_deref()
                    .is_some_and(|marker| request.prompt.contains(marker))
        };
        if marked(&self.panic_marker) {
            panic!("scripted agent panic");
        }
        if marked(&self.fail_marker) {
            return Ok(ScriptedStep::failing(1).output());
        }
        if let (Step::Apply, Some(message)) = (request.step, &self.apply_error) {
            return Err(anyhow!("{message}"));
        }
        Ok(match request.step {
            Step::Plan => self.plan.output(),
            Step::Apply => self.apply.output(),
        })
    }
}

/// A state directory and a target repository inside one temp dir.
pub struct TestArena {
    temp: TempDir,
    paths: ArenaPaths,
    repo: PathBuf,
}

impl TestArena {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp dir")?;
        let paths = ArenaPaths::new(temp.path().join("state"));
        paths.ensure_layout()?;
        let repo = temp.path().join("repoX");
        fs::create_dir_all(&repo).context("create repo dir")?;
        Ok(Self { temp, paths, repo })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn paths(&self) -> &ArenaPaths {
        &self.paths
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    pub fn repo_key(&self) -> String {
        compute_repo_key(&self.repo.to_string_lossy())
    }

    pub fn store(&self) -> JobStore {
        JobStore::new(self.paths.clone())
    }

    /// Queue a job against the test repository with id `id`.
    pub fn enqueue(&self, id: &str, prompt: &str) -> Result<String> {
        self.enqueue_for(id, prompt, &self.repo)
    }

    pub fn enqueue_for(&self, id: &str, prompt: &str, repo: &Path) -> Result<String> {
        let record = JobRecord {
            id: id.to_string(),
            prompt: prompt.to_string(),
            repo: repo.to_string_lossy().into_owned(),
            repo_key: None,
            mode: Some("code_apply".to_string()),
            hint: None,
            submitted_at: None,
        };
        self.store().enqueue(&record)
    }

    pub fn context<A: Agent>(&self, agent: A) -> Result<WorkerContext<A>> {
        WorkerContext::new(self.paths.clone(), agent)
    }
}

/// Write an executable shell script named `name` into `dir`.
#[cfg(unix)]
pub fn write_fake_cli(dir: &Path, name: &str, script: &str) -> Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    if !script.starts_with("#!") {
        anyhow::bail!("fake CLI script needs a shebang line");
    }
    let path = dir.join(name);
    fs::write(&path, script).with_context(|| format!("write {}", path.display()))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("chmod {}", path.display()))?;
    Ok(path)
}
