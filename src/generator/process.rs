//! Child process driver for generator runs.
//!
//! Spawns the command described by a [`CommandSpec`], pumps its output line by
//! line into a bounded collector, and waits for exit, timeout or a stop
//! request. Termination is graceful first: SIGTERM to the process group, then
//! SIGKILL once the grace period runs out.

use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{CommandSpec, RawOutput, StreamPolicy};

/// Output kept per stream; anything beyond is dropped.
pub const MAX_CAPTURED_BYTES: usize = 4 * 1024 * 1024;

/// Longest piece of a single line read in one go; longer lines arrive in
/// several pieces.
const MAX_READ_CHUNK: u64 = 64 * 1024;

/// How long readers may keep draining pipes after the process is gone.
const STREAM_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

const TRUNCATION_MARKER: &str = "[output truncated]\n";

/// Requests sent from `Generator::stop` to a running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Graceful signal, forced kill after the grace period.
    Terminate,
    /// Forced kill right away.
    Kill,
}

/// Why the process stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ending {
    Exited,
    TimedOut,
    Stopped,
}

/// A finished process run.
#[derive(Debug)]
pub struct ProcessRun {
    pub raw: RawOutput,
    pub ending: Ending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Stdout,
    Stderr,
}

/// Run `spec` to completion, timeout or stop. Only spawn failures are errors;
/// everything else is described by the returned [`ProcessRun`].
pub async fn execute(
    spec: &CommandSpec,
    mut control: mpsc::UnboundedReceiver<Control>,
    kill_grace: Duration,
) -> std::io::Result<ProcessRun> {
    let Some((program, args)) = spec.argv.split_first() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty argument vector",
        ));
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(&spec.options.env)
        .stdin(Stdio::null())
        .stdout(stdio_for(spec.options.stdout))
        .stderr(stdio_for(spec.options.stderr))
        .kill_on_drop(true);
    if let Some(dir) = &spec.options.working_dir {
        cmd.current_dir(dir);
    }
    // Own process group so signals reach anything the workload forks.
    #[cfg(unix)]
    cmd.process_group(0);

    let start = Instant::now();
    let mut child = cmd.spawn()?;
    let pid = child.id();
    info!(pid, command = %spec.command_line(), timeout_sec = spec.timeout.as_secs_f64(), "spawned workload process");

    let (line_tx, line_rx) = mpsc::unbounded_channel();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pump_lines(stdout, StreamKind::Stdout, line_tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pump_lines(stderr, StreamKind::Stderr, line_tx.clone())));
    }
    drop(line_tx);
    let merge = spec.options.stderr == StreamPolicy::MergeIntoStdout;
    let collector = tokio::spawn(collect_lines(line_rx, merge));

    let deadline = tokio::time::sleep(spec.timeout);
    tokio::pin!(deadline);

    let (ending, status) = tokio::select! {
        biased;

        Some(request) = control.recv() => {
            debug!(pid, ?request, "stop requested, terminating workload process");
            let status = match request {
                Control::Terminate => terminate_child(&mut child, kill_grace, &mut control).await,
                Control::Kill => force_kill(&mut child).await,
            };
            (Ending::Stopped, status)
        }

        _ = &mut deadline => {
            warn!(pid, timeout_sec = spec.timeout.as_secs_f64(), "workload process timed out, terminating");
            (Ending::TimedOut, terminate_child(&mut child, kill_grace, &mut control).await)
        }

        status = child.wait() => {
            match status {
                Ok(status) => (Ending::Exited, Some(status)),
                Err(e) => {
                    warn!(pid, error = %e, "failed to wait for workload process");
                    (Ending::Exited, None)
                }
            }
        }
    };
    let elapsed = start.elapsed();

    // Orphaned grandchildren may hold the pipes open; do not wait on them forever.
    let handles: Vec<_> = readers.iter().map(|r| r.abort_handle()).collect();
    if tokio::time::timeout(STREAM_FLUSH_TIMEOUT, join_all(readers))
        .await
        .is_err()
    {
        debug!(pid, "output readers did not drain in time, abandoning them");
        for handle in handles {
            handle.abort();
        }
    }
    let (stdout, stderr) = match tokio::time::timeout(STREAM_FLUSH_TIMEOUT, collector).await {
        Ok(Ok(captured)) => captured,
        _ => {
            warn!(pid, "output collector did not finish, output is lost");
            (String::new(), String::new())
        }
    };

    let exit_code = status.and_then(|s| s.code());
    info!(pid, ?ending, exit_code, elapsed_sec = elapsed.as_secs_f64(), "workload process finished");

    Ok(ProcessRun {
        raw: RawOutput {
            argv: spec.argv.clone(),
            exit_code,
            stdout,
            stderr,
            elapsed,
            timed_out: ending == Ending::TimedOut,
            timeout: spec.timeout,
        },
        ending,
    })
}

fn stdio_for(policy: StreamPolicy) -> Stdio {
    match policy {
        StreamPolicy::Discard => Stdio::null(),
        StreamPolicy::Capture | StreamPolicy::MergeIntoStdout => Stdio::piped(),
    }
}

async fn pump_lines<R>(reader: R, kind: StreamKind, tx: mpsc::UnboundedSender<(StreamKind, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match (&mut reader).take(MAX_READ_CHUNK).read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send((kind, line)).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, ?kind, "stopped reading workload output");
                break;
            }
        }
    }
}

async fn collect_lines(
    mut rx: mpsc::UnboundedReceiver<(StreamKind, String)>,
    merge: bool,
) -> (String, String) {
    let mut stdout = CappedBuffer::default();
    let mut stderr = CappedBuffer::default();
    while let Some((kind, line)) = rx.recv().await {
        match kind {
            StreamKind::Stdout => stdout.push(&line),
            StreamKind::Stderr if merge => stdout.push(&line),
            StreamKind::Stderr => stderr.push(&line),
        }
    }
    (stdout.text, stderr.text)
}

#[derive(Default)]
struct CappedBuffer {
    text: String,
    truncated: bool,
}

impl CappedBuffer {
    fn push(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        let room = MAX_CAPTURED_BYTES - self.text.len();
        if line.len() <= room {
            self.text.push_str(line);
            return;
        }
        let mut end = room;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        self.text.push_str(&line[..end]);
        self.text.push_str(TRUNCATION_MARKER);
        self.truncated = true;
    }
}

/// Gracefully terminate a child process.
///
/// Sends SIGTERM first, waits up to `grace`, then sends SIGKILL if the process
/// is still running. A `Control::Kill` during the grace period skips the wait.
async fn terminate_child(
    child: &mut Child,
    grace: Duration,
    control: &mut mpsc::UnboundedReceiver<Control>,
) -> Option<ExitStatus> {
    #[cfg(unix)]
    signal_group(child, libc::SIGTERM);
    #[cfg(not(unix))]
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "failed to signal child");
    }

    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => {
                debug!(exit_code = status.code(), "child exited after SIGTERM");
                Some(status)
            }
            Err(e) => {
                warn!(error = %e, "error waiting for child after SIGTERM");
                None
            }
        },
        _ = tokio::time::sleep(grace) => {
            warn!(grace_sec = grace.as_secs_f64(), "child did not exit after SIGTERM, sending SIGKILL");
            force_kill(child).await
        }
        _ = kill_requested(control) => {
            warn!("forced kill requested during grace period");
            force_kill(child).await
        }
    }
}

async fn force_kill(child: &mut Child) -> Option<ExitStatus> {
    #[cfg(unix)]
    signal_group(child, libc::SIGKILL);
    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to SIGKILL child");
    }
    child.wait().await.ok()
}

async fn kill_requested(control: &mut mpsc::UnboundedReceiver<Control>) {
    loop {
        match control.recv().await {
            Some(Control::Kill) => return,
            Some(Control::Terminate) => continue,
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: libc::c_int) {
    if let Some(pid) = child.id() {
        // Negative pid addresses the whole process group created at spawn.
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
        if rc != 0 {
            debug!(pid, signal, "process group signal failed, child may have exited");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::generator::LaunchOptions;

    fn spec(argv: &[&str], options: LaunchOptions, timeout: Duration) -> CommandSpec {
        CommandSpec {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            options,
            timeout,
        }
    }

    #[tokio::test]
    async fn test_captures_both_streams() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let spec = spec(
            &["sh", "-c", "echo out; echo err >&2; exit 3"],
            LaunchOptions::default(),
            Duration::from_secs(10),
        );
        let run = execute(&spec, rx, Duration::from_secs(1)).await.unwrap();

        assert_eq!(run.ending, Ending::Exited);
        assert_eq!(run.raw.exit_code, Some(3));
        assert_eq!(run.raw.stdout, "out\n");
        assert_eq!(run.raw.stderr, "err\n");
        assert!(!run.raw.timed_out);
    }

    #[tokio::test]
    async fn test_merge_and_discard_policies() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let merged = spec(
            &["sh", "-c", "echo a; sleep 0.1; echo b >&2"],
            LaunchOptions::combined(),
            Duration::from_secs(10),
        );
        let run = execute(&merged, rx, Duration::from_secs(1)).await.unwrap();
        assert_eq!(run.raw.stdout, "a\nb\n");
        assert!(run.raw.stderr.is_empty());

        let (_tx, rx) = mpsc::unbounded_channel();
        let discarded = spec(
            &["sh", "-c", "echo hidden; echo shown >&2"],
            LaunchOptions::discard_stdout(),
            Duration::from_secs(10),
        );
        let run = execute(&discarded, rx, Duration::from_secs(1)).await.unwrap();
        assert!(run.raw.stdout.is_empty());
        assert_eq!(run.raw.stderr, "shown\n");
    }

    #[tokio::test]
    async fn test_timeout_terminates_process() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let spec = spec(&["sleep", "30"], LaunchOptions::default(), Duration::from_millis(300));
        let started = Instant::now();
        let run = execute(&spec, rx, Duration::from_secs(5)).await.unwrap();

        assert_eq!(run.ending, Ending::TimedOut);
        assert!(run.raw.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_sigterm_ignored_escalates_to_kill() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let spec = spec(
            &["sh", "-c", "trap '' TERM; sleep 30"],
            LaunchOptions::default(),
            Duration::from_millis(200),
        );
        let started = Instant::now();
        let run = execute(&spec, rx, Duration::from_millis(500)).await.unwrap();

        assert_eq!(run.ending, Ending::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_stop_request() {
        let (tx, rx) = mpsc::unbounded_channel();
        let spec = spec(&["sleep", "30"], LaunchOptions::default(), Duration::from_secs(60));
        tx.send(Control::Terminate).unwrap();
        let run = execute(&spec, rx, Duration::from_secs(5)).await.unwrap();
        assert_eq!(run.ending, Ending::Stopped);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let spec = spec(
            &["/nonexistent/binary"],
            LaunchOptions::default(),
            Duration::from_secs(1),
        );
        assert!(execute(&spec, rx, Duration::from_secs(1)).await.is_err());
    }

    #[test]
    fn test_capped_buffer_truncates_once() {
        let mut buf = CappedBuffer::default();
        let chunk = "x".repeat(MAX_CAPTURED_BYTES - 1);
        buf.push(&chunk);
        buf.push("yy\n");
        buf.push("zz\n");
        assert!(buf.truncated);
        assert_eq!(buf.text.len(), MAX_CAPTURED_BYTES + TRUNCATION_MARKER.len());
        assert!(buf.text.ends_with(&format!("xy{}", TRUNCATION_MARKER)));
        assert!(!buf.text.contains("zz"));
    }

    #[test]
    fn test_capped_buffer_cuts_on_char_boundary() {
        let mut buf = CappedBuffer::default();
        buf.push(&"x".repeat(MAX_CAPTURED_BYTES - 1));
        buf.push("é\n");
        assert!(buf.truncated);
        assert_eq!(buf.text.len(), MAX_CAPTURED_BYTES - 1 + TRUNCATION_MARKER.len());
    }

    #[tokio::test]
    async fn test_oversized_line_keeps_leading_output() {
        let script = "echo header; head -c 5000000 /dev/zero | tr '\\0' a";
        let (_tx, rx) = mpsc::unbounded_channel();
        let spec = spec(&["sh", "-c", script], LaunchOptions::default(), Duration::from_secs(20));
        let run = execute(&spec, rx, Duration::from_secs(1)).await.unwrap();
        let stdout = &run.raw.stdout;
        assert!(run.raw.success());
        assert!(stdout.starts_with("header\naaaa"));
        assert_eq!(stdout.len(), MAX_CAPTURED_BYTES + TRUNCATION_MARKER.len());
        assert!(stdout.ends_with(TRUNCATION_MARKER));
    }
}
