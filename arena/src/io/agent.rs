//! Agent CLI invocation.
//!
//! The [`Agent`] trait decouples the plan/apply protocol from the actual
//! backend (the `claude` CLI). Tests use scripted agents that return
//! predetermined outputs without spawning processes.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::config::ArenaConfig;
use super::paths::expand_tilde;
use super::process::run_command_with_timeout;
use crate::core::flavor::{CliFlavor, flavor_from_help};

/// Env var naming the agent executable explicitly.
pub const CLI_ENV: &str = "CLAUDE_CLI";

const HELP_OUTPUT_LIMIT_BYTES: usize = 64 * 1024;

/// Phase of the plan/apply protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Plan,
    Apply,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::Plan => "plan",
            Step::Apply => "apply",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One agent invocation.
#[derive(Debug, Clone, Copy)]
pub struct StepRequest<'a> {
    /// Repository the agent works in (also its working directory).
    pub repo: &'a Path,
    pub step: Step,
    pub prompt: &'a str,
}

/// What one invocation produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutput {
    /// `None` when the process was killed or timed out.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl StepOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Abstraction over agent backends.
///
/// A non-zero exit or timeout is a normal `Ok` outcome. `Err` means the step
/// could not be attempted at all (no executable, spawn failure).
pub trait Agent: Send + Sync {
    fn run_step(&self, request: &StepRequest<'_>) -> Result<StepOutput>;
}

/// No usable agent executable was found.
#[derive(Debug, Error)]
#[error(
    "agent CLI '{program}' not found (tried: {tried}); install it, add it to PATH, or set {CLI_ENV} or agent.command"
)]
pub struct AgentUnavailable {
    pub program: String,
    pub tried: String,
}

/// Settings for [`ClaudeCli`], usually derived from [`ArenaConfig`].
#[derive(Debug, Clone)]
pub struct CliSettings {
    pub command: Option<PathBuf>,
    /// Env var consulted after `command`. `None` disables the lookup.
    pub override_env: Option<String>,
    pub program: String,
    pub fallback: Option<PathBuf>,
    pub step_timeout: Duration,
    pub detect_timeout: Duration,
    pub output_limit_bytes: usize,
}

impl CliSettings {
    pub fn from_config(cfg: &ArenaConfig) -> Self {
        let fallback = cfg.agent.fallback.clone().or_else(|| {
            dirs::home_dir().map(|home| home.join(".local").join("bin").join(&cfg.agent.program))
        });
        Self {
            command: cfg.agent.command.clone(),
            override_env: Some(CLI_ENV.to_string()),
            program: cfg.agent.program.clone(),
            fallback,
            step_timeout: Duration::from_secs(cfg.agent.step_timeout_secs),
            detect_timeout: Duration::from_secs(cfg.agent.detect_timeout_secs),
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }
}

/// Agent backed by the `claude` CLI.
///
/// One instance is shared by every worker in the process. The resolved
/// executable and its detected flavor are cached here; the flavor lock is
/// held across the `--help` probe so it runs at most once.
pub struct ClaudeCli {
    settings: CliSettings,
    resolved: Mutex<Option<PathBuf>>,
    flavor: Mutex<Option<CliFlavor>>,
}

impl ClaudeCli {
    pub fn new(settings: CliSettings) -> Self {
        Self {
            settings,
            resolved: Mutex::new(None),
            flavor: Mutex::new(None),
        }
    }

    /// Locate the executable: configured command, env override, `PATH`,
    /// then the fallback location.
    ///
    /// Failures are not cached, so fixing the environment takes effect for
    /// the next job.
    pub fn resolve(&self) -> Result<PathBuf, AgentUnavailable> {
        let mut resolved = self.resolved.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(path) = resolved.as_ref() {
            return Ok(path.clone());
        }
        let candidates = self.candidates();
        match candidates.iter().find(|path| is_executable(path)) {
            Some(found) => {
                info!(path = %found.display(), "resolved agent executable");
                *resolved = Some(found.clone());
                Ok(found.clone())
            }
            None => Err(AgentUnavailable {
                program: self.settings.program.clone(),
                tried: describe_candidates(&candidates),
            }),
        }
    }

    fn candidates(&self) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(command) = &self.settings.command {
            candidates.push(expand_tilde(&command.to_string_lossy()));
        }
        if let Some(var) = &self.settings.override_env
            && let Some(raw) = std::env::var_os(var).filter(|v| !v.is_empty())
        {
            candidates.push(expand_tilde(&raw.to_string_lossy()));
        }
        if let Some(found) = find_executable_in_path(&self.settings.program) {
            candidates.push(found);
        }
        if let Some(fallback) = &self.settings.fallback {
            candidates.push(fallback.clone());
        }
        candidates
    }

    /// Calling convention of `exe`, probed once and cached.
    pub fn flavor(&self, exe: &Path) -> CliFlavor {
        let mut cached = self.flavor.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(flavor) = *cached {
            return flavor;
        }
        let flavor = self.probe_flavor(exe);
        info!(%flavor, "detected agent CLI flavor");
        *cached = Some(flavor);
        flavor
    }

    fn probe_flavor(&self, exe: &Path) -> CliFlavor {
        let mut cmd = Command::new(exe);
        cmd.arg("--help");
        match run_command_with_timeout(cmd, self.settings.detect_timeout, HELP_OUTPUT_LIMIT_BYTES)
        {
            Ok(output) => {
                let mut help = output.stdout_text();
                help.push_str(&output.stderr_text());
                flavor_from_help(&help)
            }
            Err(err) => {
                warn!("agent --help probe failed: {err:#}");
                CliFlavor::FileBased
            }
        }
    }
}

impl Agent for ClaudeCli {
    #[instrument(skip_all, fields(step = %request.step, repo = %request.repo.display()))]
    fn run_step(&self, request: &StepRequest<'_>) -> Result<StepOutput> {
        let exe = self.resolve()?;
        let flavor = self.flavor(&exe);

        let mut cmd = Command::new(&exe);
        cmd.current_dir(request.repo);
        // Held until the child exits; the file is removed on drop.
        let prompt_file = match flavor {
            CliFlavor::SingleShot => {
                cmd.arg("-p").arg(request.prompt);
                None
            }
            CliFlavor::FileBased => {
                let file = write_prompt_file(request.prompt)?;
                cmd.arg("code")
                    .arg(request.step.as_str())
                    .arg("--repo")
                    .arg(request.repo)
                    .arg("--plan")
                    .arg(file.path());
                Some(file)
            }
        };

        debug!(%flavor, "invoking agent");
        let output = run_command_with_timeout(
            cmd,
            self.settings.step_timeout,
            self.settings.output_limit_bytes,
        )
        .with_context(|| format!("run agent {} step", request.step))?;
        drop(prompt_file);

        let mut stderr = output.stderr_text();
        if output.timed_out {
            warn!(timeout_secs = self.settings.step_timeout.as_secs(), "agent step timed out");
            stderr.push_str(&format!(
                "\n[{} timed out after {}s]\n",
                request.step,
                self.settings.step_timeout.as_secs()
            ));
        }
        let step_output = StepOutput {
            exit_code: output.exit_code(),
            stdout: output.stdout_text(),
            stderr,
            timed_out: output.timed_out,
        };
        debug!(exit_code = ?step_output.exit_code, "agent step finished");
        Ok(step_output)
    }
}

fn write_prompt_file(prompt: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("taskarena-")
        .suffix(".md")
        .tempfile()
        .context("create prompt file")?;
    file.write_all(prompt.as_bytes())
        .context("write prompt file")?;
    file.flush().context("flush prompt file")?;
    Ok(file)
}

fn describe_candidates(candidates: &[PathBuf]) -> String {
    if candidates.is_empty() {
        return "PATH".to_string();
    }
    candidates
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && (m.permissions().mode() & 0o111 != 0))
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file())
        .unwrap_or(false)
}

fn find_executable_in_path(program: &str) -> Option<PathBuf> {
    let program = program.trim();
    if program.is_empty() {
        return None;
    }
    if program.contains(std::path::MAIN_SEPARATOR) || program.contains('/') {
        return Some(expand_tilde(program));
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}
