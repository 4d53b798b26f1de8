use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::event::UsageEvent;
use crate::jsonl::JsonlSink;
use crate::process::{EnvFile, Launcher, SandboxJob};
use crate::scoped::ScopedTask;
use crate::usage::{UsageSnapshot, UsageTracker};
use crate::watchdog::{Verdict, Watchdog};
use crate::{Result, SandboxError};

// ─── RunSettings ──────────────────────────────────────────────────────────

/// Supervision parameters shared by every workload of a run.
#[derive(Clone)]
pub struct RunSettings {
    /// Secret `KEY=value` pairs delivered through the env file.
    pub env: Vec<(String, String)>,
    /// Hard wall-clock limit for one sandbox.
    pub timeout: Duration,
    pub watchdog_poll: Duration,
    pub emit_interval: Duration,
    /// Bounded join for the periodic emitter.
    pub emitter_grace: Duration,
    /// How long to keep reading output after the process has exited.
    pub drain_timeout: Duration,
}

impl fmt::Debug for RunSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("RunSettings")
            .field("env", &keys)
            .field("timeout", &self.timeout)
            .field("watchdog_poll", &self.watchdog_poll)
            .field("emit_interval", &self.emit_interval)
            .field("emitter_grace", &self.emitter_grace)
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}

// ─── RunOutcome ───────────────────────────────────────────────────────────

/// Why a sandbox run did not complete.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    /// The process exited with a non-zero code.
    NonZeroExit(i32),
    /// The process was terminated by a signal it did not ask for.
    Signaled,
    /// The watchdog killed the process at its deadline.
    TimedOut { after_secs: u64 },
    /// The sandbox could not be started.
    Launch(String),
    /// Supervision failed after the sandbox started.
    Supervision(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonZeroExit(code) => write!(f, "exit code {code}"),
            Self::Signaled => write!(f, "terminated by signal"),
            Self::TimedOut { after_secs } => write!(f, "timed out after {after_secs}s"),
            Self::Launch(msg) => write!(f, "launch failed: {msg}"),
            Self::Supervision(msg) => write!(f, "supervision failed: {msg}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Failed(FailureReason),
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            Self::Completed => None,
            Self::Failed(reason) => Some(reason),
        }
    }
}

/// Terminal report of one sandbox run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// The final usage snapshot, emitted on every exit path.
    pub usage: UsageSnapshot,
}

// ─── Public API ───────────────────────────────────────────────────────────

/// Launch one sandbox, supervise it to a terminal state, and report.
///
/// Never returns an error: launch and supervision failures become
/// [`RunOutcome::Failed`] so a sibling workload is never affected. On every
/// path the emitter is stopped and joined, one final usage snapshot is
/// emitted, and the env file is deleted.
pub async fn run(job: &SandboxJob, launcher: &dyn Launcher, settings: &RunSettings) -> RunReport {
    let usage_log = match JsonlSink::open(&job.log_dir.join("token_usage.jsonl")) {
        Ok(sink) => Some(sink),
        Err(e) => {
            tracing::warn!(agent_id = %job.agent_id, error = %e, "token usage log unavailable");
            None
        }
    };
    let tracker = Arc::new(UsageTracker::new(job.agent_id.clone(), usage_log));

    let mut env_file: Option<EnvFile> = None;
    let mut emitter: Option<ScopedTask<()>> = None;

    let outcome = match supervise(job, launcher, settings, &tracker, &mut env_file, &mut emitter)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::warn!(agent_id = %job.agent_id, error = %e, "sandbox error");
            let reason = e.to_string();
            match e {
                SandboxError::Spawn { .. } | SandboxError::EnvFile(_) => {
                    RunOutcome::Failed(FailureReason::Launch(reason))
                }
                _ => RunOutcome::Failed(FailureReason::Supervision(reason)),
            }
        }
    };

    if let Some(task) = emitter.take() {
        task.shutdown(settings.emitter_grace).await;
    }
    let usage = tracker.emit();
    if let Some(mut f) = env_file.take() {
        f.remove();
    }

    RunReport { outcome, usage }
}

// ─── Internal ─────────────────────────────────────────────────────────────

async fn supervise(
    job: &SandboxJob,
    launcher: &dyn Launcher,
    settings: &RunSettings,
    tracker: &Arc<UsageTracker>,
    env_file: &mut Option<EnvFile>,
    emitter: &mut Option<ScopedTask<()>>,
) -> Result<RunOutcome> {
    tokio::fs::create_dir_all(&job.log_dir).await?;
    let log_file = tokio::fs::File::create(stdout_log(job)).await?;
    let mut log = BufWriter::new(log_file);

    let env = env_file.insert(EnvFile::create(&settings.env)?);

    let mut cmd = launcher.command(job, env.path());
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let dog = Watchdog::new(job.agent_id.clone(), settings.timeout, settings.watchdog_poll);
    let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
        program: launcher.program().to_string(),
        source,
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SandboxError::Process("stdout not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| SandboxError::Process("stderr not captured".into()))?;

    // Both pipes feed one channel: the combined output stream.
    let (tx, mut rx) = mpsc::channel::<String>(256);
    let readers = [forward_lines(stdout, tx.clone()), forward_lines(stderr, tx)];

    *emitter = Some(tracker.spawn_emitter(settings.emit_interval));
    let mut watchdog = tokio::spawn(dog.supervise(child));

    let mut verdict: Option<Verdict> = None;
    let mut drain_until: Option<Instant> = None;

    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => {
                    if let Some(env) = env_file.as_mut() {
                        // The runtime has read the env file once output flows.
                        env.remove();
                    }
                    record_line(&mut log, tracker, &job.agent_id, &line).await;
                }
                None => break,
            },
            joined = &mut watchdog, if verdict.is_none() => {
                let v = joined.unwrap_or_else(|e| Verdict::Lost(e.to_string()));
                if matches!(v, Verdict::TimedOut { .. }) {
                    verdict = Some(v);
                    break;
                }
                verdict = Some(v);
                drain_until = Some(Instant::now() + settings.drain_timeout);
            }
            _ = tokio::time::sleep_until(drain_until.unwrap_or_else(Instant::now)), if drain_until.is_some() => {
                tracing::warn!(agent_id = %job.agent_id, "output still open after exit; closing log");
                break;
            }
        }
    }

    let verdict = match verdict {
        Some(v) => v,
        None => (&mut watchdog)
            .await
            .unwrap_or_else(|e| Verdict::Lost(e.to_string())),
    };

    for reader in readers {
        reader.abort();
    }
    if let Err(e) = log.flush().await {
        tracing::warn!(agent_id = %job.agent_id, error = %e, "failed to flush stdout.log");
    }

    Ok(classify(&job.agent_id, verdict))
}

/// Forward every line of `pipe` into `tx`, decoding lossily so a stray
/// invalid byte never ends the stream.
fn forward_lines<R>(pipe: R, tx: mpsc::Sender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(|c| c == '\r' || c == '\n')
                        .to_string();
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Persist one line verbatim, then try it as a structured event.
/// Lines that are not JSON objects are skipped silently.
async fn record_line<W>(log: &mut W, tracker: &UsageTracker, agent_id: &str, line: &str)
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        log.write_all(line.as_bytes()).await?;
        log.write_all(b"\n").await
    };
    if let Err(e) = write.await {
        tracing::warn!(agent_id = %agent_id, error = %e, "failed to write stdout.log");
    }

    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }
    if let Some(event) = UsageEvent::parse_line(trimmed) {
        tracker.update(&event);
    }
}

fn classify(agent_id: &str, verdict: Verdict) -> RunOutcome {
    match verdict {
        Verdict::Exited(status) if status.success() => {
            tracing::info!(agent_id = %agent_id, "agent finished (exit 0)");
            RunOutcome::Completed
        }
        Verdict::Exited(status) => match status.code() {
            Some(code) => {
                tracing::warn!(agent_id = %agent_id, exit_code = code, "agent finished with non-zero exit");
                RunOutcome::Failed(FailureReason::NonZeroExit(code))
            }
            None => {
                tracing::warn!(agent_id = %agent_id, "agent terminated by signal");
                RunOutcome::Failed(FailureReason::Signaled)
            }
        },
        Verdict::TimedOut { after } => RunOutcome::Failed(FailureReason::TimedOut {
            after_secs: after.as_secs(),
        }),
        Verdict::Lost(msg) => {
            tracing::warn!(agent_id = %agent_id, error = %msg, "lost track of sandbox process");
            RunOutcome::Failed(FailureReason::Supervision(msg))
        }
    }
}

/// Path of the raw output log for a job.
pub fn stdout_log(job: &SandboxJob) -> PathBuf {
    job.log_dir.join("stdout.log")
}

// ─── Tests ────────────────────────────────────────────────────────────────
