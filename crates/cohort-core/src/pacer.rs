//! Uniform simulated-time pacing for one cohort.

use crate::health::CohortContext;
use crate::sim::SimError;
use crate::workload::{Target, TimeTick};
use futures::future::join_all;
use sandbox_agent::{JsonlSink, ScopedTask, StopSignal};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Advances every target city by one month per interval, up to a fixed
/// budget of ticks.
///
/// The tick counter is written only by the pacer loop; [`TimePacer::tick`]
/// reads it without blocking the loop.
pub struct TimePacer {
    task: ScopedTask<()>,
    cycle: Arc<AtomicU32>,
    total: u32,
    grace: Duration,
}

impl TimePacer {
    pub fn start(
        ctx: CohortContext,
        log: Option<JsonlSink>,
        total_cycles: u32,
        interval: Duration,
        grace: Duration,
    ) -> Self {
        let cycle = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&cycle);
        let name = format!("time-pacer-{}", ctx.cohort);
        let task = ScopedTask::spawn(name, move |stop| {
            pace_loop(ctx, log, counter, total_cycles, interval, stop)
        });
        Self {
            task,
            cycle,
            total: total_cycles,
            grace,
        }
    }

    pub fn tick(&self) -> TimeTick {
        TimeTick {
            cycle: self.cycle.load(Ordering::SeqCst),
            total: self.total,
        }
    }

    /// Stop pacing and return the final clock state.
    pub async fn stop(self) -> TimeTick {
        let cycle = Arc::clone(&self.cycle);
        let total = self.total;
        self.task.shutdown(self.grace).await;
        TimeTick {
            cycle: cycle.load(Ordering::SeqCst),
            total,
        }
    }
}

async fn pace_loop(
    ctx: CohortContext,
    log: Option<JsonlSink>,
    cycle: Arc<AtomicU32>,
    total: u32,
    interval: Duration,
    mut stop: StopSignal,
) {
    tracing::info!(
        cohort = ctx.cohort,
        total_cycles = total,
        interval_secs = interval.as_secs_f64(),
        targets = ctx.targets.len(),
        "time pacer started"
    );

    while !stop.is_raised() && cycle.load(Ordering::SeqCst) < total {
        if stop.sleep(interval).await {
            break;
        }
        let current = cycle.fetch_add(1, Ordering::SeqCst) + 1;

        let advances = ctx
            .targets
            .iter()
            .map(|target| advance_one(&ctx, log.as_ref(), target, current));
        join_all(advances).await;

        let tick = TimeTick {
            cycle: current,
            total,
        };
        tracing::info!(
            cohort = ctx.cohort,
            cycle = tick.cycle,
            total = tick.total,
            remaining = tick.remaining(),
            "time tick"
        );
        if let Some(log) = &log {
            log.info(
                "time_tick",
                &json!({
                    "cohort": ctx.cohort,
                    "cycle": tick.cycle,
                    "total": tick.total,
                    "remaining": tick.remaining(),
                }),
            );
        }
    }

    if cycle.load(Ordering::SeqCst) >= total {
        tracing::info!(cohort = ctx.cohort, total_cycles = total, "time pacer done");
        if let Some(log) = &log {
            log.info(
                "time_pacer_done",
                &json!({ "cohort": ctx.cohort, "total_cycles": total }),
            );
        }
    }
}

async fn advance_one(ctx: &CohortContext, log: Option<&JsonlSink>, target: &Target, cycle: u32) {
    let call = ctx.sim.advance(&ctx.key, &target.city_id, 1);
    let result = match tokio::time::timeout(ctx.call_timeout, call).await {
        Ok(r) => r,
        Err(_) => Err(SimError::Other(format!(
            "no response within {:.0}s",
            ctx.call_timeout.as_secs_f64()
        ))),
    };

    if let Err(e) = result {
        tracing::warn!(
            cohort = ctx.cohort,
            agent_id = %target.agent_id,
            city_id = %target.city_id,
            cycle,
            error = %e,
            "time advance failed"
        );
        if let Some(log) = log {
            log.warning(
                "time_advance_failed",
                &json!({
                    "cohort": ctx.cohort,
                    "agent_id": target.agent_id,
                    "city_id": target.city_id,
                    "cycle": cycle,
                    "error": e.to_string(),
                }),
            );
        }
    }
}
