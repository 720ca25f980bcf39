//! Scoreboard drain: folds terminal jobs into the cumulative counters and
//! removes them from the queue.
//!
//! Each cycle stages `done/` and `failed/` into a numbered batch under
//! `queue/draining/<seq>/`, adds the batch to the counters, and writes the
//! snapshot with `cycle = seq`. That atomic write is the commit point; the
//! batch is deleted only afterwards. A batch left behind by a crash is
//! either already reflected in the snapshot (`seq <= cycle`, delete it) or
//! not (count it now). Either way every record is counted exactly once.
//!
//! One drain loop per state directory is assumed.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::job::record_file_name;
use crate::io::journal::read_entries;
use crate::io::paths::ArenaPaths;
use crate::io::scoreboard::{Scoreboard, load_scoreboard, write_scoreboard};
use crate::io::store::list_record_ids;
use crate::pool::sleep_unless_shutdown;

const PASS_DIR: &str = "pass";
const FAIL_DIR: &str = "fail";

/// What one `drain_once` call folded in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub passed: u64,
    pub failed: u64,
    /// Leftover batches from an interrupted cycle that were counted now.
    pub recovered_batches: usize,
    /// Snapshot as written at the end of the call.
    pub board: Scoreboard,
}

impl DrainReport {
    pub fn drained(&self) -> u64 {
        self.passed + self.failed
    }
}

/// Run one drain cycle, including recovery of any interrupted batch.
#[instrument(skip_all)]
pub fn drain_once(paths: &ArenaPaths) -> Result<DrainReport> {
    let mut board = load_scoreboard(&paths.scoreboard_path)?;
    let mut report = DrainReport::default();

    for seq in leftover_batches(&paths.draining_dir)? {
        let batch = batch_dir(paths, seq);
        if seq <= board.cycle {
            debug!(seq, "removing already-counted batch");
            remove_batch(&batch)?;
            continue;
        }
        let (pass, fail) = count_batch(&batch)?;
        info!(seq, pass, fail, "recovering interrupted drain batch");
        commit(paths, &mut board, seq, pass, fail)?;
        remove_batch(&batch)?;
        report.recovered_batches += 1;
        report.passed += pass;
        report.failed += fail;
    }

    let seq = board.cycle + 1;
    let batch = batch_dir(paths, seq);
    let pass = stage(&paths.done_dir, &batch.join(PASS_DIR))?;
    let fail = stage(&paths.failed_dir, &batch.join(FAIL_DIR))?;
    if pass + fail == 0 {
        remove_batch(&batch)?;
        write_scoreboard(&paths.scoreboard_path, &board)?;
    } else {
        commit(paths, &mut board, seq, pass, fail)?;
        remove_batch(&batch)?;
        info!(seq, pass, fail, total = board.total(), "drained terminal jobs");
    }

    report.passed += pass;
    report.failed += fail;
    report.board = board;
    Ok(report)
}

/// Call `drain_once` every `interval` until `shutdown` is set. Cycle errors
/// are logged and the loop carries on.
pub fn run_drain_loop(paths: &ArenaPaths, interval: Duration, shutdown: &AtomicBool) {
    info!(interval_ms = interval.as_millis() as u64, "starting drain loop");
    while !shutdown.load(Ordering::Relaxed) {
        if let Err(err) = drain_once(paths) {
            warn!("drain cycle failed: {err:#}");
        }
        sleep_unless_shutdown(interval, shutdown);
    }
    info!("drain loop stopped");
}

/// Recompute the counters from the event log and rewrite the snapshot.
///
/// Counts each id once using its last entry. Jobs whose records are still
/// in `done/`, `failed/` or a drain batch are left for the drain to count.
pub fn rebuild_from_journal(paths: &ArenaPaths) -> Result<Scoreboard> {
    let mut last: BTreeMap<String, bool> = BTreeMap::new();
    for entry in read_entries(&paths.log_path)? {
        last.insert(entry.id, entry.ok);
    }
    let pending = pending_ids(paths)?;
    let current = load_scoreboard(&paths.scoreboard_path)?;
    let mut board = Scoreboard {
        cycle: current.cycle,
        ..Scoreboard::default()
    };
    for (_, ok) in last.iter().filter(|(id, _)| !pending.contains(id.as_str())) {
        if *ok {
            board.pass += 1;
        } else {
            board.fail += 1;
        }
    }
    write_scoreboard(&paths.scoreboard_path, &board)?;
    info!(pass = board.pass, fail = board.fail, "rebuilt scoreboard from event log");
    Ok(board)
}

fn pending_ids(paths: &ArenaPaths) -> Result<HashSet<String>> {
    let mut dirs = vec![paths.done_dir.clone(), paths.failed_dir.clone()];
    for seq in leftover_batches(&paths.draining_dir)? {
        let batch = batch_dir(paths, seq);
        dirs.push(batch.join(PASS_DIR));
        dirs.push(batch.join(FAIL_DIR));
    }
    let mut ids = HashSet::new();
    for dir in dirs {
        ids.extend(list_record_ids(&dir)?);
    }
    Ok(ids)
}

fn commit(paths: &ArenaPaths, board: &mut Scoreboard, seq: u64, pass: u64, fail: u64) -> Result<()> {
    board.pass += pass;
    board.fail += fail;
    board.cycle = seq;
    write_scoreboard(&paths.scoreboard_path, board)
}

fn batch_dir(paths: &ArenaPaths, seq: u64) -> PathBuf {
    paths.draining_dir.join(seq.to_string())
}

/// Numeric batch directories under `draining/`, ascending.
fn leftover_batches(draining_dir: &Path) -> Result<Vec<u64>> {
    let entries = match fs::read_dir(draining_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("list {}", draining_dir.display()));
        }
    };
    let mut batches = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", draining_dir.display()))?;
        match entry.file_name().to_str().and_then(|name| name.parse::<u64>().ok()) {
            Some(seq) => batches.push(seq),
            None => warn!(path = %entry.path().display(), "ignoring unexpected entry in draining dir"),
        }
    }
    batches.sort_unstable();
    Ok(batches)
}

/// Move every record in `source` into `target`. Returns how many moved.
fn stage(source: &Path, target: &Path) -> Result<u64> {
    let ids = list_record_ids(source)?;
    if ids.is_empty() {
        return Ok(0);
    }
    fs::create_dir_all(target).with_context(|| format!("create {}", target.display()))?;
    let mut moved = 0;
    for id in ids {
        let name = record_file_name(&id);
        match fs::rename(source.join(&name), target.join(&name)) {
            Ok(()) => moved += 1,
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("stage {} from {}", id, source.display()));
            }
        }
    }
    Ok(moved)
}

fn count_batch(batch: &Path) -> Result<(u64, u64)> {
    let pass = list_record_ids(&batch.join(PASS_DIR))?.len() as u64;
    let fail = list_record_ids(&batch.join(FAIL_DIR))?.len() as u64;
    Ok((pass, fail))
}

fn remove_batch(batch: &Path) -> Result<()> {
    match fs::remove_dir_all(batch) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", batch.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::journal::{Journal, LogEntry};

    fn arena() -> (tempfile::TempDir, ArenaPaths) {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ArenaPaths::new(temp.path());
        paths.ensure_layout().expect("layout");
        (temp, paths)
    }

    fn touch(dir: &Path, id: &str) {
        fs::create_dir_all(dir).expect("mkdir");
        fs::write(dir.join(format!("{id}.json")), "{}").expect("write record");
    }

    #[test]
    fn empty_drain_is_idempotent() {
        let (_temp, paths) = arena();
        let first = drain_once(&paths).expect("drain");
        let second = drain_once(&paths).expect("drain");
        assert_eq!(first.board, Scoreboard::default());
        assert_eq!(second.board, Scoreboard::default());
        assert!(paths.scoreboard_path.exists());
        assert!(leftover_batches(&paths.draining_dir).expect("batches").is_empty());
    }

    #[test]
    fn counts_and_removes_terminal_records() {
        let (_temp, paths) = arena();
        touch(&paths.done_dir, "a");
        touch(&paths.done_dir, "b");
        touch(&paths.failed_dir, "c");
        touch(&paths.running_dir, "d");

        let report = drain_once(&paths).expect("drain");
        assert_eq!((report.passed, report.failed), (2, 1));
        assert_eq!(report.board, Scoreboard { pass: 2, fail: 1, cycle: 1 });
        assert!(list_record_ids(&paths.done_dir).expect("done").is_empty());
        assert!(list_record_ids(&paths.failed_dir).expect("failed").is_empty());
        assert_eq!(list_record_ids(&paths.running_dir).expect("running"), vec!["d"]);

        let again = drain_once(&paths).expect("drain");
        assert_eq!(again.drained(), 0);
        assert_eq!(load_scoreboard(&paths.scoreboard_path).expect("load"), report.board);
    }

    #[test]
    fn committed_batch_is_not_counted_twice() {
        let (_temp, paths) = arena();
        // Crash after the snapshot commit, before the batch was deleted.
        touch(&batch_dir(&paths, 1).join(PASS_DIR), "a");
        write_scoreboard(&paths.scoreboard_path, &Scoreboard { pass: 1, fail: 0, cycle: 1 })
            .expect("write");

        let report = drain_once(&paths).expect("drain");
        assert_eq!(report.recovered_batches, 0);
        assert_eq!(report.board, Scoreboard { pass: 1, fail: 0, cycle: 1 });
        assert!(!batch_dir(&paths, 1).exists());
    }

    #[test]
    fn uncommitted_batch_is_counted_on_recovery() {
        let (_temp, paths) = arena();
        // Crash after staging, before the snapshot commit.
        touch(&batch_dir(&paths, 1).join(PASS_DIR), "a");
        touch(&batch_dir(&paths, 1).join(FAIL_DIR), "b");
        touch(&paths.done_dir, "c");

        let report = drain_once(&paths).expect("drain");
        assert_eq!(report.recovered_batches, 1);
        assert_eq!(report.board, Scoreboard { pass: 2, fail: 1, cycle: 2 });
        assert!(leftover_batches(&paths.draining_dir).expect("batches").is_empty());
    }

    #[test]
    fn drain_loop_stops_on_shutdown() {
        let (_temp, paths) = arena();
        touch(&paths.done_dir, "a");
        let shutdown = AtomicBool::new(false);
        std::thread::scope(|scope| {
            scope.spawn(|| run_drain_loop(&paths, Duration::from_millis(20), &shutdown));
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            while load_scoreboard(&paths.scoreboard_path).expect("load").pass == 0 {
                assert!(std::time::Instant::now() < deadline, "drain loop never ran");
                std::thread::sleep(Duration::from_millis(10));
            }
            shutdown.store(true, Ordering::Relaxed);
        });
        assert_eq!(load_scoreboard(&paths.scoreboard_path).expect("load").pass, 1);
    }

    #[test]
    fn rebuild_uses_last_entry_and_skips_pending_records() {
        let (_temp, paths) = arena();
        let journal = Journal::new(&paths.log_path);
        journal.append(&LogEntry::new("a", false)).expect("append");
        journal.append(&LogEntry::new("a", true)).expect("append");
        journal.append(&LogEntry::new("b", false)).expect("append");
        journal.append(&LogEntry::new("c", true)).expect("append");
        touch(&paths.done_dir, "c");

        let board = rebuild_from_journal(&paths).expect("rebuild");
        assert_eq!((board.pass, board.fail), (1, 1));

        let after = drain_once(&paths).expect("drain");
        assert_eq!((after.board.pass, after.board.fail), (2, 1));
    }
}
