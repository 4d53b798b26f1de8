use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;
use tokio::time::Instant;

/// How a supervised process ended.
#[derive(Debug)]
pub enum Verdict {
    /// The process exited on its own.
    Exited(ExitStatus),
    /// The deadline passed and the process was killed.
    TimedOut { after: Duration },
    /// Waiting on the process failed; its fate is unknown.
    Lost(String),
}

/// Enforces a hard wall-clock deadline on one process.
///
/// The watchdog owns the [`Child`]. It waits on the process and, in
/// parallel, wakes at least every `poll_interval` (capped at the time left)
/// to compare against the deadline. The kill therefore happens within one
/// poll interval of the deadline whether or not the process writes any
/// output.
#[derive(Debug, Clone)]
pub struct Watchdog {
    agent_id: String,
    timeout: Duration,
    deadline: Instant,
    poll_interval: Duration,
}

impl Watchdog {
    /// Arm a watchdog whose deadline is `timeout` from now.
    pub fn new(agent_id: impl Into<String>, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            agent_id: agent_id.into(),
            timeout,
            deadline: Instant::now() + timeout,
            poll_interval,
        }
    }

    /// Supervise `child` until it exits or the deadline passes.
    pub async fn supervise(self, mut child: Child) -> Verdict {
        loop {
            let now = Instant::now();
            if now >= self.deadline {
                return self.kill(&mut child).await;
            }
            let nap = self.poll_interval.min(self.deadline - now);

            tokio::select! {
                status = child.wait() => {
                    return match status {
                        Ok(s) => Verdict::Exited(s),
                        Err(e) => Verdict::Lost(e.to_string()),
                    };
                }
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    async fn kill(&self, child: &mut Child) -> Verdict {
        tracing::warn!(
            agent_id = %self.agent_id,
            timeout_secs = self.timeout.as_secs(),
            "agent timed out; killing sandbox"
        );
        if let Err(e) = child.kill().await {
            // Already gone between the last poll and the kill.
            tracing::debug!(agent_id = %self.agent_id, error = %e, "kill after deadline failed");
        }
        Verdict::TimedOut {
            after: self.timeout,
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
