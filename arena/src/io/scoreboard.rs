//! Cumulative pass/fail counters (`scores/scoreboard.json`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::atomic::write_json_atomic;

/// Snapshot rewritten in full on every drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scoreboard {
    pub pass: u64,
    pub fail: u64,
    /// Sequence number of the last drain batch folded into the counters.
    #[serde(default)]
    pub cycle: u64,
}

impl Scoreboard {
    pub fn total(&self) -> u64 {
        self.pass + self.fail
    }
}

/// Load the snapshot; a missing file means all zeros.
pub fn load_scoreboard(path: &Path) -> Result<Scoreboard> {
    if !path.exists() {
        return Ok(Scoreboard::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read scoreboard {}", path.display()))?;
    let board = serde_json::from_str(&contents)
        .with_context(|| format!("parse scoreboard {}", path.display()))?;
    Ok(board)
}

/// Atomically replace the snapshot (temp file + rename).
pub fn write_scoreboard(path: &Path, board: &Scoreboard) -> Result<()> {
    debug!(pass = board.pass, fail = board.fail, cycle = board.cycle, "writing scoreboard");
    write_json_atomic(path, board)
}
