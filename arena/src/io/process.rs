//! Bounded child-process execution.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// How long reader threads get to hit EOF once the process group was killed.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Captured output of a finished (or killed) child.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Exit code, or `None` when killed by a signal or timed out.
    pub fn exit_code(&self) -> Option<i32> {
        if self.timed_out {
            None
        } else {
            self.status.code()
        }
    }

    /// Stdout as text with a notice when bytes were dropped.
    pub fn stdout_text(&self) -> String {
        lossy_with_notice(&self.stdout, self.stdout_truncated, "stdout")
    }

    /// Stderr as text with a notice when bytes were dropped.
    pub fn stderr_text(&self) -> String {
        lossy_with_notice(&self.stderr, self.stderr_truncated, "stderr")
    }
}

fn lossy_with_notice(bytes: &[u8], truncated: usize, label: &str) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if truncated > 0 {
        text.push_str(&format!("\n[{label} truncated {truncated} bytes]\n"));
    }
    text
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

type Captured = Result<(Vec<u8>, usize)>;

/// Run `cmd` with a timeout, draining stdout/stderr on reader threads so a
/// chatty child can never block on a full pipe.
///
/// Stdin is closed. At most `output_limit_bytes` of each stream is kept;
/// the rest is read and discarded. On unix the child leads its own process
/// group, and on timeout the whole group is killed so descendants holding
/// the pipes cannot outlive the deadline. Reader threads that still have
/// not finished a grace period after the kill are abandoned.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!(program = ?cmd.get_program(), "spawning child process");
    let started = Instant::now();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {}", cmd.get_program().to_string_lossy()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (tx, rx) = mpsc::channel();
    spawn_reader(stdout, Stream::Stdout, output_limit_bytes, tx.clone());
    spawn_reader(stderr, Stream::Stderr, output_limit_bytes, tx);

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing process group"
            );
            timed_out = true;
            kill_tree(&mut child);
            child.wait().context("wait command after kill")?
        }
    };

    // An exited child may have left descendants holding the pipes open.
    // They get whatever remains of the timeout before the group is killed.
    let mut group_killed = timed_out;
    let mut deadline = if timed_out {
        Instant::now() + KILL_GRACE
    } else {
        started + timeout
    };
    let mut stdout = None;
    let mut stderr = None;
    while stdout.is_none() || stderr.is_none() {
        match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok((Stream::Stdout, captured)) => stdout = Some(captured.context("read stdout")?),
            Ok((Stream::Stderr, captured)) => stderr = Some(captured.context("read stderr")?),
            Err(RecvTimeoutError::Timeout) if !group_killed => {
                warn!("descendants still hold the output pipes, killing process group");
                kill_group(child.id());
                group_killed = true;
                deadline = Instant::now() + KILL_GRACE;
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("output readers did not finish after kill, abandoning them");
                break;
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("output reader thread panicked"));
            }
        }
    }
    let (stdout, stdout_truncated) = stdout.unwrap_or_default();
    let (stderr, stderr_truncated) = stderr.unwrap_or_default();

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn spawn_reader<R: Read + Send + 'static>(
    reader: R,
    stream: Stream,
    limit: usize,
    tx: Sender<(Stream, Captured)>,
) {
    thread::spawn(move || {
        let captured = read_stream_limited(reader, limit);
        // The receiver is gone only when the caller abandoned this reader.
        let _ = tx.send((stream, captured));
    });
}

fn kill_tree(child: &mut Child) {
    kill_group(child.id());
    if let Err(err) = child.kill() {
        debug!(error = %err, "kill after group kill");
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        warn!(pid, "pid out of range, cannot signal process group");
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(err) => warn!(pid, error = %err, "kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_both_streams_and_exit_code() {
        let output = run_command_with_timeout(
            sh("echo out; echo err >&2; exit 3"),
            Duration::from_secs(10),
            1000,
        )
        .expect("run");
        assert_eq!(output.exit_code(), Some(3));
        assert_eq!(output.stdout_text(), "out\n");
        assert_eq!(output.stderr_text(), "err\n");
        assert!(!output.timed_out);
    }

    #[test]
    fn timeout_kills_child() {
        let output =
            run_command_with_timeout(sh("exec sleep 30"), Duration::from_millis(200), 1000)
                .expect("run");
        assert!(output.timed_out);
        assert_eq!(output.exit_code(), None);
    }

    #[test]
    fn timeout_kills_descendants_holding_the_pipes() {
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 5; echo done"),
            Duration::from_millis(300),
            1000,
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!output.stdout_text().contains("done"));
    }

    #[test]
    fn background_descendant_does_not_hold_up_an_exited_child() {
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 5 & echo started"),
            Duration::from_millis(500),
            1000,
        )
        .expect("run");
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!output.timed_out);
        assert_eq!(output.exit_code(), Some(0));
        assert_eq!(output.stdout_text(), "started\n");
    }

    #[test]
    fn output_beyond_limit_is_counted_not_kept() {
        let output = run_command_with_timeout(
            sh("printf '0123456789'"),
            Duration::from_secs(10),
            4,
        )
        .expect("run");
        assert_eq!(output.stdout, b"0123");
        assert_eq!(output.stdout_truncated, 6);
        assert!(output.stdout_text().contains("[stdout truncated 6 bytes]"));
    }

    #[test]
    fn missing_program_is_an_error() {
        let err = run_command_with_timeout(
            Command::new("/definitely/not/here"),
            Duration::from_secs(1),
            10,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("spawn"));
    }
}
