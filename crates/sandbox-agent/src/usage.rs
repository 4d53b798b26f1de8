use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::event::UsageEvent;
use crate::jsonl::JsonlSink;
use crate::scoped::ScopedTask;

// ─── UsageSnapshot ────────────────────────────────────────────────────────

/// Point-in-time usage totals for one workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub agent_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub num_turns: u32,
    pub elapsed_seconds: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    input_tokens: u64,
    output_tokens: u64,
    cache_read_tokens: u64,
    cache_creation_tokens: u64,
    cost_usd: f64,
    num_turns: u32,
}

// ─── UsageTracker ─────────────────────────────────────────────────────────

/// Thread-safe accumulator of token usage for one workload.
///
/// Token counters are summed; `cost_usd` and `num_turns` are last-write-wins
/// because the stream reports them as cumulative values on terminal events.
/// Every read and write goes through one mutex, and readers only ever get a
/// copy via [`UsageTracker::snapshot`].
#[derive(Debug)]
pub struct UsageTracker {
    agent_id: String,
    totals: Mutex<Totals>,
    start: Instant,
    file_log: Option<JsonlSink>,
}

impl UsageTracker {
    pub fn new(agent_id: impl Into<String>, file_log: Option<JsonlSink>) -> Self {
        Self {
            agent_id: agent_id.into(),
            totals: Mutex::new(Totals::default()),
            start: Instant::now(),
            file_log,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Fold one parsed event into the running totals.
    pub fn update(&self, event: &UsageEvent) {
        let mut t = match self.totals.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Counters come from untrusted output; saturate instead of wrapping.
        t.input_tokens = t.input_tokens.saturating_add(event.usage.input_tokens);
        t.output_tokens = t.output_tokens.saturating_add(event.usage.output_tokens);
        t.cache_read_tokens = t
            .cache_read_tokens
            .saturating_add(event.usage.cache_read_input_tokens);
        t.cache_creation_tokens = t
            .cache_creation_tokens
            .saturating_add(event.usage.cache_creation_input_tokens);
        if let Some(cost) = event.cost_usd {
            t.cost_usd = cost;
        }
        if let Some(turns) = event.num_turns {
            t.num_turns = turns;
        }
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        let t = match self.totals.lock() {
            Ok(t) => *t,
            Err(poisoned) => *poisoned.into_inner(),
        };
        UsageSnapshot {
            agent_id: self.agent_id.clone(),
            input_tokens: t.input_tokens,
            output_tokens: t.output_tokens,
            cache_read_tokens: t.cache_read_tokens,
            cache_creation_tokens: t.cache_creation_tokens,
            total_tokens: t.input_tokens.saturating_add(t.output_tokens),
            cost_usd: round_to(t.cost_usd, 6),
            num_turns: t.num_turns,
            elapsed_seconds: round_to(self.start.elapsed().as_secs_f64(), 1),
        }
    }

    /// Write the current snapshot to the console and the durable log.
    pub fn emit(&self) -> UsageSnapshot {
        let snap = self.snapshot();
        tracing::info!(
            agent_id = %snap.agent_id,
            input_tokens = snap.input_tokens,
            output_tokens = snap.output_tokens,
            cache_read_tokens = snap.cache_read_tokens,
            cache_creation_tokens = snap.cache_creation_tokens,
            total_tokens = snap.total_tokens,
            cost_usd = snap.cost_usd,
            num_turns = snap.num_turns,
            elapsed_seconds = snap.elapsed_seconds,
            "token_usage"
        );
        if let Some(log) = &self.file_log {
            log.info("token_usage", &snap);
        }
        snap
    }

    /// Emit a snapshot every `interval` until the returned task is shut down.
    ///
    /// The emitter keeps running after the workload's process exits; the
    /// caller stops it and emits the final snapshot itself.
    pub fn spawn_emitter(self: &Arc<Self>, interval: Duration) -> ScopedTask<()> {
        let tracker = Arc::clone(self);
        let name = format!("token-emitter-{}", tracker.agent_id);
        ScopedTask::spawn(name, move |mut stop| async move {
            while !stop.sleep(interval).await {
                tracker.emit();
            }
        })
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

// ─── Tests ────────────────────────────────────────────────────────────────
