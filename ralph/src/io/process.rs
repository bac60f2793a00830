//! Helpers for running child processes with timeouts and bounded output.

use std::collections::VecDeque;
use std::ffi::OsStr;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How often a running child is polled for exit, timeout and cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Time a child gets to exit after a forwarded interrupt before it is killed.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// A program plus its argument list. Never passed through a shell.
///
/// Serialized as a non-empty array of strings (`["npm", "run", "lint"]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Build a `Command` running in `workdir`, with `extra` args appended.
    pub fn to_command<I, S>(&self, workdir: &Path, extra: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).args(extra).current_dir(workdir);
        cmd
    }
}

impl TryFrom<Vec<String>> for CommandSpec {
    type Error = String;

    fn try_from(mut value: Vec<String>) -> Result<Self, Self::Error> {
        if value.is_empty() || value[0].trim().is_empty() {
            return Err("command must be a non-empty array".to_string());
        }
        let program = value.remove(0);
        Ok(Self {
            program,
            args: value,
        })
    }
}

impl From<CommandSpec> for Vec<String> {
    fn from(spec: CommandSpec) -> Self {
        let mut out = Vec::with_capacity(spec.args.len() + 1);
        out.push(spec.program);
        out.extend(spec.args);
        out
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured child process output.
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
    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            )
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// The child runs in its own process group; on timeout the whole group is killed. When `cancel`
/// becomes set, the group receives an interrupt.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: Option<&AtomicBool>,
) -> Result<CommandOutput> {
    let (mut child, stdin_writer) = spawn_piped(&mut cmd, stdin)?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let (status, timed_out) = wait_with_deadline(&mut child, Some(timeout), cancel)?;

    join_stdin(stdin_writer)?;
    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

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

/// Predicate applied to every output line of a streamed command.
pub type LineMatcher = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Where streamed output goes besides the in-memory tail.
pub struct StreamOptions<'a> {
    /// Append every line here (created if missing, never truncated).
    pub log_path: &'a Path,
    /// Lines of stdout and of stderr retained in memory.
    pub tail_lines: usize,
    /// Echo lines to stderr as they arrive.
    pub echo: bool,
    /// Evaluated on every line; the result reports whether any line matched.
    pub matcher: Option<LineMatcher>,
    /// Forward an interrupt to the child's process group once this is set.
    pub cancel: Option<&'a AtomicBool>,
}

/// Output of a streamed command.
#[derive(Debug)]
pub struct StreamedOutput {
    pub status: ExitStatus,
    /// Most recent stdout lines followed by most recent stderr lines.
    pub tail: Vec<String>,
    pub matched: bool,
    pub timed_out: bool,
}

/// Run a command, tee-ing every line of stdout/stderr to an append-only log.
///
/// Unlike `run_command_with_timeout`, memory use is bounded by line count: only the last
/// `tail_lines` lines per stream are kept, while the log receives everything. `timeout` of
/// `None` waits indefinitely. Process-group handling matches `run_command_with_timeout`.
#[instrument(skip_all, fields(timeout_secs = timeout.map(|t| t.as_secs()), log = %options.log_path.display()))]
pub fn run_command_streaming(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Option<Duration>,
    options: StreamOptions<'_>,
) -> Result<StreamedOutput> {
    if let Some(parent) = options.log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(options.log_path)
        .with_context(|| format!("open log {}", options.log_path.display()))?;
    let log = Arc::new(Mutex::new(log_file));

    let (mut child, stdin_writer) = spawn_piped(&mut cmd, stdin)?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_tee = Tee {
        log: log.clone(),
        tail_lines: options.tail_lines,
        echo: options.echo,
        matcher: options.matcher.clone(),
    };
    let stderr_tee = Tee {
        log,
        tail_lines: options.tail_lines,
        echo: options.echo,
        matcher: options.matcher,
    };
    let stdout_handle = thread::spawn(move || stdout_tee.drain(stdout));
    let stderr_handle = thread::spawn(move || stderr_tee.drain(stderr));

    let (status, timed_out) = wait_with_deadline(&mut child, timeout, options.cancel)?;

    join_stdin(stdin_writer)?;
    let (mut tail, stdout_matched) = join_tee(stdout_handle).context("join stdout")?;
    let (stderr_tail, stderr_matched) = join_tee(stderr_handle).context("join stderr")?;
    tail.extend(stderr_tail);

    debug!(exit_code = ?status.code(), timed_out, "streamed command finished");
    Ok(StreamedOutput {
        status,
        tail,
        matched: stdout_matched || stderr_matched,
        timed_out,
    })
}

type StdinWriter = Option<thread::JoinHandle<Result<()>>>;

/// Spawn with piped output. Input is fed from its own thread so a child that
/// writes before it finishes reading cannot deadlock against us.
fn spawn_piped(cmd: &mut Command, stdin: Option<&[u8]>) -> Result<(Child, StdinWriter)> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    // Grandchildren share the group, so a timeout can reach all of them.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!(program = ?cmd.get_program(), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, program = ?cmd.get_program(), "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let writer = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || {
                // A child that exits without reading its input closes the pipe; that is not our error.
                match child_stdin.write_all(&input) {
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                        warn!("child closed stdin before reading all input");
                        Ok(())
                    }
                    other => other.context("write stdin"),
                }
            }))
        }
        None => None,
    };

    Ok((child, writer))
}

fn join_stdin(writer: StdinWriter) -> Result<()> {
    match writer.map(thread::JoinHandle::join) {
        None => Ok(()),
        Some(Ok(result)) => result,
        Some(Err(_)) => Err(anyhow!("stdin writer thread panicked")),
    }
}

/// Wait for `child`, enforcing `timeout` and forwarding cancellation.
///
/// Returns `(status, timed_out)`. Whatever is left of the child's process
/// group after the child exits is killed, since stragglers would hold the
/// output pipes open.
fn wait_with_deadline(
    child: &mut Child,
    timeout: Option<Duration>,
    cancel: Option<&AtomicBool>,
) -> Result<(ExitStatus, bool)> {
    let started = Instant::now();
    let mut interrupted_at: Option<Instant> = None;
    loop {
        if let Some(status) = child
            .wait_timeout(POLL_INTERVAL)
            .context("wait for command")?
        {
            signal_group(child, GroupSignal::Kill);
            return Ok((status, false));
        }

        if let Some(timeout) = timeout
            && started.elapsed() >= timeout
        {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing its process group"
            );
            signal_group(child, GroupSignal::Kill);
            let status = child.wait().context("wait command after kill")?;
            return Ok((status, true));
        }

        match interrupted_at {
            None if cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) => {
                debug!("forwarding interrupt to child process group");
                signal_group(child, GroupSignal::Interrupt);
                interrupted_at = Some(Instant::now());
            }
            Some(at) if at.elapsed() >= CANCEL_GRACE => {
                warn!(
                    grace_secs = CANCEL_GRACE.as_secs(),
                    "command ignored the interrupt, killing its process group"
                );
                signal_group(child, GroupSignal::Kill);
                let status = child.wait().context("wait command after kill")?;
                return Ok((status, false));
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Interrupt,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &mut Child, signal: GroupSignal) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(pgid) = i32::try_from(child.id()) else {
        return;
    };
    let signal = match signal {
        GroupSignal::Interrupt => Signal::SIGINT,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pgid), signal) {
        // ESRCH: the group is already gone.
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => {
            debug!(%err, pgid, "signalling process group failed, killing child only");
            let _ = child.kill();
        }
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _signal: GroupSignal) {
    let _ = child.kill();
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn join_tee(handle: thread::JoinHandle<Result<(Vec<String>, bool)>>) -> Result<(Vec<String>, bool)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

struct Tee {
    log: Arc<Mutex<File>>,
    tail_lines: usize,
    echo: bool,
    matcher: Option<LineMatcher>,
}

impl Tee {
    fn drain<R: Read>(self, reader: R) -> Result<(Vec<String>, bool)> {
        let mut buf_reader = BufReader::new(reader);
        let mut tail = VecDeque::with_capacity(self.tail_lines.min(1024));
        let mut matched = false;

        loop {
            let mut raw = Vec::new();
            let n = buf_reader
                .read_until(b'\n', &mut raw)
                .context("read line")?;
            if n == 0 {
                break;
            }

            if let Ok(mut writer) = self.log.lock() {
                if let Err(e) = writer.write_all(&raw) {
                    warn!(err = %e, "failed to write to log");
                } else if let Err(e) = writer.flush() {
                    warn!(err = %e, "failed to flush log");
                }
            }

            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if self.echo {
                eprintln!("{line}");
            }
            if !matched && let Some(matcher) = &self.matcher {
                matched = matcher(line);
            }

            if self.tail_lines > 0 {
                if tail.len() == self.tail_lines {
                    tail.pop_front();
                }
                tail.push_back(line.to_string());
            }
        }

        Ok((tail.into_iter().collect(), matched))
    }
}

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
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
