//! Arena configuration stored at `<state>/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use super::atomic::write_atomic;

/// Env var overriding `workers`.
pub const WORKERS_ENV: &str = "TA_WORKERS";

/// Arena configuration (TOML).
///
/// Intended to be edited by humans. Missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ArenaConfig {
    /// Number of concurrent workers draining the inbox.
    pub workers: usize,

    /// Fixed sleep between claim attempts when the inbox is empty.
    pub idle_backoff_ms: u64,

    /// Interval between scoreboard drain cycles.
    pub drain_interval_secs: u64,

    /// Truncate captured agent stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    pub agent: AgentConfig,

    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Explicit executable path; takes precedence over `CLAUDE_CLI` and `PATH`.
    pub command: Option<PathBuf>,
    /// Program name looked up on `PATH`.
    pub program: String,
    /// Last-resort location. Defaults to `~/.local/bin/<program>`.
    pub fallback: Option<PathBuf>,
    /// Upper bound for each plan/apply invocation.
    pub step_timeout_secs: u64,
    /// Upper bound for the one-time `--help` probe.
    pub detect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Requests with larger bodies are rejected.
    pub max_body_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: None,
            program: "claude".to_string(),
            fallback: None,
            step_timeout_secs: 600,
            detect_timeout_secs: 10,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8787,
            max_body_bytes: 1024 * 1024,
        }
    }
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            idle_backoff_ms: 500,
            drain_interval_secs: 1,
            output_limit_bytes: 1_000_000,
            agent: AgentConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl ArenaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(anyhow!("workers must be > 0"));
        }
        if self.idle_backoff_ms == 0 {
            return Err(anyhow!("idle_backoff_ms must be > 0"));
        }
        if self.drain_interval_secs == 0 {
            return Err(anyhow!("drain_interval_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.agent.program.trim().is_empty() {
            return Err(anyhow!("agent.program must be non-empty"));
        }
        if self.agent.step_timeout_secs == 0 || self.agent.detect_timeout_secs == 0 {
            return Err(anyhow!("agent timeouts must be > 0"));
        }
        if self.server.bind.trim().is_empty() {
            return Err(anyhow!("server.bind must be non-empty"));
        }
        if self.server.max_body_bytes == 0 {
            return Err(anyhow!("server.max_body_bytes must be > 0"));
        }
        Ok(())
    }

    /// Apply `TA_WORKERS` on top of the file values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(raw) = std::env::var(WORKERS_ENV) {
            self.workers = parse_workers(&raw)?;
        }
        Ok(())
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }
}

fn parse_workers(raw: &str) -> Result<usize> {
    let workers: usize = raw
        .trim()
        .parse()
        .with_context(|| format!("{WORKERS_ENV} must be a positive integer, got '{raw}'"))?;
    if workers == 0 {
        return Err(anyhow!("{WORKERS_ENV} must be > 0"));
    }
    Ok(workers)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ArenaConfig::default()`.
pub fn load_config(path: &Path) -> Result<ArenaConfig> {
    if !path.exists() {
        let cfg = ArenaConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ArenaConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load `path` and apply environment overrides on top.
pub fn load_runtime_config(path: &Path) -> Result<ArenaConfig> {
    let mut cfg = load_config(path)?;
    cfg.apply_env_overrides()?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ArenaConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ArenaConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = ArenaConfig::default();
        cfg.agent.command = Some(PathBuf::from("/opt/claude"));
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "workers = 2\n[agent]\nstep_timeout_secs = 5\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.agent.step_timeout_secs, 5);
        assert_eq!(cfg.agent.program, "claude");
        assert_eq!(cfg.server.port, 8787);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "workers = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("workers"));
    }

    #[test]
    fn workers_override_must_be_positive() {
        assert_eq!(parse_workers(" 8 ").expect("parse"), 8);
        assert!(parse_workers("0").is_err());
        assert!(parse_workers("many").is_err());
    }
}
