//! Periodic city-state observation for one cohort.

use crate::sim::{SimError, SimService};
use crate::workload::{HealthRecord, Target};
use futures::future::join_all;
use sandbox_agent::{JsonlSink, ScopedTask, StopSignal};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Shared inputs of a cohort's background loops.
#[derive(Clone)]
pub struct CohortContext {
    pub cohort: usize,
    pub key: Arc<str>,
    pub targets: Arc<[Target]>,
    pub sim: Arc<dyn SimService>,
    /// Upper bound on one external call.
    pub call_timeout: Duration,
}

/// Scoped poller: fetches every target's stats once per interval until
/// stopped. Dropping it without [`HealthPoller::stop`] aborts the loop.
pub struct HealthPoller {
    task: ScopedTask<Vec<HealthRecord>>,
    grace: Duration,
}

impl HealthPoller {
    pub fn start(
        ctx: CohortContext,
        log: Option<JsonlSink>,
        interval: Duration,
        grace: Duration,
    ) -> Self {
        let name = format!("healthcheck-{}", ctx.cohort);
        let task = ScopedTask::spawn(name, move |stop| poll_loop(ctx, log, interval, stop));
        Self { task, grace }
    }

    /// Stop polling and return every record observed.
    pub async fn stop(self) -> Vec<HealthRecord> {
        self.task.shutdown(self.grace).await.unwrap_or_default()
    }
}

async fn poll_loop(
    ctx: CohortContext,
    log: Option<JsonlSink>,
    interval: Duration,
    mut stop: StopSignal,
) -> Vec<HealthRecord> {
    let start = Instant::now();
    let mut history = Vec::new();

    while !stop.is_raised() {
        let elapsed = start.elapsed().as_secs_f64();
        let polls = ctx
            .targets
            .iter()
            .map(|target| poll_one(&ctx, log.as_ref(), target, elapsed));
        history.extend(join_all(polls).await.into_iter().flatten());

        if stop.sleep(interval).await {
            break;
        }
    }
    history
}

async fn poll_one(
    ctx: &CohortContext,
    log: Option<&JsonlSink>,
    target: &Target,
    elapsed: f64,
) -> Option<HealthRecord> {
    let call = ctx.sim.city_stats(&ctx.key, &target.city_id);
    let result = match tokio::time::timeout(ctx.call_timeout, call).await {
        Ok(r) => r,
        Err(_) => Err(SimError::Other(format!(
            "no response within {:.0}s",
            ctx.call_timeout.as_secs_f64()
        ))),
    };

    match result {
        Ok(stats) => {
            let record = HealthRecord {
                cohort: ctx.cohort,
                agent_id: target.agent_id.clone(),
                city_id: target.city_id.clone(),
                population: stats.population,
                score: stats.score,
                funds: stats.funds,
                game_year: stats.game_year,
                elapsed_seconds: (elapsed * 10.0).round() / 10.0,
            };
            tracing::info!(
                cohort = ctx.cohort,
                agent_id = %record.agent_id,
                city_id = %record.city_id,
                population = ?record.population,
                score = ?record.score,
                funds = ?record.funds,
                game_year = ?record.game_year,
                elapsed_seconds = record.elapsed_seconds,
                "healthcheck"
            );
            if let Some(log) = log {
                log.info("healthcheck", &record);
            }
            Some(record)
        }
        Err(e) => {
            tracing::warn!(
                cohort = ctx.cohort,
                agent_id = %target.agent_id,
                city_id = %target.city_id,
                error = %e,
                "healthcheck poll failed"
            );
            if let Some(log) = log {
                log.warning(
                    "healthcheck_poll_failed",
                    &json!({
                        "cohort": ctx.cohort,
                        "agent_id": target.agent_id,
                        "city_id": target.city_id,
                        "error": e.to_string(),
                    }),
                );
            }
            None
        }
    }
}
