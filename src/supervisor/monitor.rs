use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::LogKind;
use crate::config::RetentionConfig;
use crate::logstore::{complete_utf8_len, LogWriter};
use crate::supervisor::process::ExitOutcome;
use crate::supervisor::{Inner, ProcessSupervisor};

const CHUNK_SIZE: usize = 8192;

/// Directory inside the sandbox holding one pid file per supervised command.
pub(super) const PID_DIR: &str = "/tmp/.sandbox-manager";

/// `$0` is the pid file, `$1` the command. The shell records its pid and
/// then becomes the command, so the recorded pid stays valid.
pub(super) const WRAPPER_SCRIPT: &str = r#"{ echo $$ > "$0"; } 2>/dev/null; exec sh -c "$1""#;

/// `$0` is the pid file, `$1` the signal name. Signals the process group,
/// falling back to the single process.
const SIGNAL_SCRIPT: &str = r#"pid=$(cat "$0" 2>/dev/null) || exit 0; kill -"$1" -- "-$pid" 2>/dev/null || kill -"$1" "$pid" 2>/dev/null; exit 0"#;

/// Holds back an incomplete UTF-8 sequence at the end of a pipe read until
/// the bytes that complete it arrive.
#[derive(Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let complete = complete_utf8_len(&self.pending);
        if complete == 0 {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending[..complete]).into_owned();
        self.pending.drain(..complete);
        Some(text)
    }

    /// Whatever is left once the stream has ended.
    fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

/// Moves a child's output into its log file and the sandbox's room until
/// the child exits or a stop is requested.
pub(super) struct Pump {
    inner: Arc<Inner>,
    process_id: String,
    sandbox_id: String,
    writer: LogWriter,
    /// Pid file inside the container; `None` for processes that only follow logs
    pid_file: Option<String>,
    stdout: Utf8Carry,
    stderr: Utf8Carry,
}

enum Waited {
    Cancel,
    Status(std::io::Result<ExitStatus>),
}

impl Pump {
    pub(super) fn new(
        inner: Arc<Inner>,
        process_id: String,
        sandbox_id: String,
        writer: LogWriter,
        pid_file: Option<String>,
    ) -> Self {
        Self {
            inner,
            process_id,
            sandbox_id,
            writer,
            pid_file,
            stdout: Utf8Carry::default(),
            stderr: Utf8Carry::default(),
        }
    }

    pub(super) async fn run(mut self, mut child: Child, mut cancel: oneshot::Receiver<()>) {
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut out_open = stdout.is_some();
        let mut err_open = stderr.is_some();
        let mut cancelled = false;

        // Both streams are read from this one task so log order and broadcast order agree.
        while out_open || err_open {
            tokio::select! {
                biased;
                _ = &mut cancel => {
                    cancelled = true;
                    break;
                }
                read = read_chunk(&mut stdout), if out_open => match read {
                    Ok(bytes) if !bytes.is_empty() => self.forward(LogKind::Stdout, &bytes).await,
                    _ => out_open = false,
                },
                read = read_chunk(&mut stderr), if err_open => match read {
                    Ok(bytes) if !bytes.is_empty() => self.forward(LogKind::Stderr, &bytes).await,
                    _ => err_open = false,
                },
            }
        }

        let outcome = if cancelled {
            self.stop(&mut child).await
        } else {
            let waited = tokio::select! {
                biased;
                _ = &mut cancel => Waited::Cancel,
                status = child.wait() => Waited::Status(status),
            };
            match waited {
                Waited::Cancel => self.stop(&mut child).await,
                Waited::Status(Ok(status)) => status
                    .code()
                    .map(ExitOutcome::Exited)
                    .unwrap_or(ExitOutcome::Terminated),
                Waited::Status(Err(e)) => {
                    warn!(process_id = %self.process_id, error = %e, "Failed to collect exit status");
                    ExitOutcome::Lost
                }
            }
        };

        self.finish(outcome).await;
    }

    async fn forward(&mut self, kind: LogKind, bytes: &[u8]) {
        if let Err(e) = self.writer.append(bytes).await {
            warn!(process_id = %self.process_id, error = %e, "Failed to append to process log");
        }
        if let Some(text) = self.carry(kind).push(bytes) {
            self.inner.broadcaster.publish(&self.sandbox_id, kind, &text);
        }
    }

    fn carry(&mut self, kind: LogKind) -> &mut Utf8Carry {
        match kind {
            LogKind::Stderr => &mut self.stderr,
            _ => &mut self.stdout,
        }
    }

    async fn finish(mut self, outcome: ExitOutcome) {
        for kind in [LogKind::Stdout, LogKind::Stderr] {
            if let Some(text) = self.carry(kind).flush() {
                self.inner.broadcaster.publish(&self.sandbox_id, kind, &text);
            }
        }
        if let Err(e) = self.writer.append(outcome.trailer().as_bytes()).await {
            warn!(process_id = %self.process_id, error = %e, "Failed to write log trailer");
        }
        self.inner
            .broadcaster
            .system(&self.sandbox_id, &outcome.message());
        self.inner.finish(&self.process_id, &self.sandbox_id, outcome);
        self.remove_pid_file().await;

        info!(
            process_id = %self.process_id,
            sandbox_id = %self.sandbox_id,
            exit_code = ?outcome.exit_code(),
            bytes = self.writer.written(),
            "Process finished"
        );
    }
}

impl Pump {
    /// SIGTERM, then SIGKILL once the grace period runs out.
    ///
    /// Each signal goes both to the command inside the container and to the
    /// local engine client attached to it.
    async fn stop(&self, child: &mut Child) -> ExitOutcome {
        let grace = self.inner.grace();
        self.signal_in_container("TERM").await;
        send_sigterm(child);

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(_)) => ExitOutcome::Terminated,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to wait for terminated process");
                ExitOutcome::Lost
            }
            Err(_) => {
                warn!(
                    pid = ?child.id(),
                    grace_secs = grace.as_secs(),
                    "Process ignored SIGTERM, killing"
                );
                self.signal_in_container("KILL").await;
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill process");
                    return ExitOutcome::Lost;
                }
                ExitOutcome::Terminated
            }
        }
    }

    async fn signal_in_container(&self, signal: &str) {
        let Some(pid_file) = self.pid_file.as_deref() else {
            return;
        };
        let argv = ["sh", "-c", SIGNAL_SCRIPT, pid_file, signal];
        if let Err(e) = self.inner.engine.exec(&self.sandbox_id, &argv).await {
            warn!(
                sandbox_id = %self.sandbox_id,
                process_id = %self.process_id,
                signal,
                error = %e,
                "Failed to signal process inside the container"
            );
        }
    }

    async fn remove_pid_file(&self) {
        let Some(pid_file) = self.pid_file.as_deref() else {
            return;
        };
        if let Err(e) = self
            .inner
            .engine
            .exec(&self.sandbox_id, &["rm", "-f", pid_file])
            .await
        {
            debug!(process_id = %self.process_id, error = %e, "Failed to remove pid file");
        }
    }
}

/// Next chunk from an optional pipe; an empty chunk means end of stream.
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut Option<R>) -> std::io::Result<Vec<u8>> {
    let Some(reader) = reader.as_mut() else {
        return Ok(Vec::new());
    };
    let mut buf = vec![0u8; CHUNK_SIZE];
    let n = reader.read(&mut buf).await?;
    buf.truncate(n);
    Ok(buf)
}

#[cfg(unix)]
fn send_sigterm(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!(pid, error = %e, "Failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child) {
    let _ = child.start_kill();
}

/// Pid file for a supervised command inside its sandbox.
pub(super) fn pid_file_for(process_id: &str) -> String {
    format!("{}/{}.pid", PID_DIR, process_id)
}

/// Periodically evict finished processes and their log files.
pub fn spawn_retention_sweeper(
    supervisor: ProcessSupervisor,
    retention: RetentionConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(retention.sweep_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let evicted = supervisor.prune(&retention).await;
            debug!(evicted, "Retention sweep finished");
        }
    })
}
