//! One spawned agent process and its stdio plumbing

use super::command::LaunchSpec;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

/// A line read from one of the process's output streams, or a piece of
/// one when the line is longer than the reader's limit
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StreamChunk {
    Stdout(String),
    Stderr(String),
}

/// Spawned process with reader and writer tasks attached.
///
/// Both reader tasks feed one channel; it closes once stdout and stderr
/// have both reached EOF.
pub(crate) struct AgentProcess {
    pub child: Child,
    pub pid: Option<u32>,
    pub stdin_tx: mpsc::Sender<String>,
    pub chunks: mpsc::Receiver<StreamChunk>,
}

impl AgentProcess {
    pub fn spawn(
        spec: &LaunchSpec,
        input_capacity: usize,
        max_line_bytes: usize,
    ) -> std::io::Result<Self> {
        debug!("Spawning agent: {} (cwd: {:?})", spec.display(), spec.cwd);

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .current_dir(&spec.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so signals reach tools the CLI spawns
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let pid = child.id();

        let missing = |name: &str| {
            std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("Failed to capture {}", name),
            )
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(input_capacity.max(1));
        let (chunk_tx, chunks) = mpsc::channel::<StreamChunk>(256);

        tokio::spawn(Self::write_stdin_task(stdin, stdin_rx));
        let limit = max_line_bytes.max(1) as u64;
        tokio::spawn(Self::read_stream_task(
            stdout,
            chunk_tx.clone(),
            limit,
            StreamChunk::Stdout,
        ));
        tokio::spawn(Self::read_stream_task(stderr, chunk_tx, limit, StreamChunk::Stderr));

        Ok(Self {
            child,
            pid,
            stdin_tx,
            chunks,
        })
    }

    /// Background task to write to stdin; each message is newline-terminated
    async fn write_stdin_task(mut stdin: ChildStdin, mut rx: mpsc::Receiver<String>) {
        while let Some(data) = rx.recv().await {
            trace!("Sending to stdin: {}", data);
            if let Err(e) = stdin.write_all(data.as_bytes()).await {
                warn!("Failed to write to stdin: {}", e);
                break;
            }
            if !data.ends_with('\n') {
                if let Err(e) = stdin.write_all(b"\n").await {
                    warn!("Failed to write newline to stdin: {}", e);
                    break;
                }
            }
            if let Err(e) = stdin.flush().await {
                warn!("Failed to flush stdin: {}", e);
                break;
            }
        }
        debug!("Stdin writer task ended");
    }

    /// Background task to read lines from stdout or stderr.
    ///
    /// At most `limit` bytes are buffered; a longer line is forwarded in pieces.
    async fn read_stream_task<R>(
        stream: R,
        tx: mpsc::Sender<StreamChunk>,
        limit: u64,
        wrap: fn(String) -> StreamChunk,
    ) where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match (&mut reader).take(limit).read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    trace!("Agent output: {}", line);
                    if tx.send(wrap(line)).await.is_err() {
                        debug!("Output channel closed");
                        break;
                    }
                }
                Err(e) => {
                    error!("Error reading agent output: {}", e);
                    break;
                }
            }
        }
    }
}

/// Exit code for `status`; death by signal N maps to 128 + N
pub(crate) fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopSignal {
    Terminate,
    Kill,
}

/// Signal the process group led by `pid`. A group that is already gone is not an error.
#[cfg(unix)]
pub(crate) fn signal_group(pid: u32, signal: StopSignal) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let sig = match signal {
        StopSignal::Terminate => Signal::SIGTERM,
        StopSignal::Kill => Signal::SIGKILL,
    };
    let raw = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    match killpg(Pid::from_raw(raw), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(std::io::Error::from(e)),
    }
}

#[cfg(not(unix))]
pub(crate) fn signal_group(_pid: u32, _signal: StopSignal) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process groups are only supported on unix",
    ))
}

/// Whether any process is still in the group led by `pid`
#[cfg(unix)]
pub(crate) fn group_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // EPERM still means the group exists
    !matches!(killpg(Pid::from_raw(raw), None), Err(Errno::ESRCH))
}

#[cfg(not(unix))]
pub(crate) fn group_alive(_pid: u32) -> bool {
    false
}
