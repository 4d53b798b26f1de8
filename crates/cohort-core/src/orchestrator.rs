//! Cohort lifecycle: allocate → run → collect → release → persist.
//!
//! ```text
//!            ┌──────────────┐  create fails   ┌───────────────────┐
//!            │  allocating  │ ──────────────► │ allocating-failed │
//!            └──────┬───────┘                 └───────────────────┘
//!                   │ prep fails (cities released)  ┌─────────────┐
//!                   ├─────────────────────────────► │ prep-failed │
//!                   ▼                               └─────────────┘
//!            ┌──────────────┐   HealthPoller + TimePacer started,
//!            │   running    │   one sandbox per workload
//!            └──────┬───────┘
//!                   ▼
//!            ┌──────────────┐   every sandbox terminal
//!            │  collecting  │
//!            └──────┬───────┘
//!                   ▼
//!            ┌──────────────┐   loops stopped, workspaces discarded,
//!            │  releasing   │   cities retired in creation order
//!            └──────┬───────┘
//!                   ▼
//!            ┌──────────────┐   results persisted (non-fatal)
//!            │     done     │
//!            └──────────────┘
//! ```

use crate::config::ExperimentConfig;
use crate::health::{CohortContext, HealthPoller};
use crate::pacer::TimePacer;
use crate::sim::{SimError, SimService};
use crate::store::ExperimentStore;
use crate::workload::{AgentResult, HealthRecord, Target, TimeTick, Workload, WorkloadStatus};
use crate::workspace::WorkspacePreparer;
use chrono::{DateTime, Utc};
use sandbox_agent::{run_sandbox, JsonlSink, Launcher, RunOutcome, RunReport, RunSettings, SandboxJob};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;

// ---------------------------------------------------------------------------
// CohortPhase / CohortReport / RunSummary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CohortPhase {
    Allocating,
    AllocatingFailed,
    PrepFailed,
    Running,
    Collecting,
    Releasing,
    Done,
}

impl CohortPhase {
    pub fn is_aborted(self) -> bool {
        matches!(self, CohortPhase::AllocatingFailed | CohortPhase::PrepFailed)
    }
}

#[derive(Debug, Clone)]
pub struct CohortReport {
    /// 1-based.
    pub index: usize,
    pub phase: CohortPhase,
    /// Empty for aborted cohorts: their workloads never ran.
    pub workloads: Vec<Workload>,
    pub health: Vec<HealthRecord>,
    pub clock: Option<TimeTick>,
    pub error: Option<String>,
}

impl CohortReport {
    fn new(index: usize) -> Self {
        Self {
            index,
            phase: CohortPhase::Allocating,
            workloads: Vec::new(),
            health: Vec::new(),
            clock: None,
            error: None,
        }
    }

    fn aborted(mut self, phase: CohortPhase, error: String) -> Self {
        self.phase = phase;
        self.error = Some(error);
        self
    }

    pub fn count(&self, status: WorkloadStatus) -> usize {
        self.workloads.iter().filter(|w| w.status() == status).count()
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub experiment_id: String,
    pub started_at: DateTime<Utc>,
    pub cohorts: Vec<CohortReport>,
}

impl RunSummary {
    pub fn workloads(&self) -> impl Iterator<Item = &Workload> {
        self.cohorts.iter().flat_map(|c| c.workloads.iter())
    }

    pub fn completed(&self) -> usize {
        self.workloads()
            .filter(|w| w.status() == WorkloadStatus::Completed)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.workloads()
            .filter(|w| w.status() == WorkloadStatus::Failed)
            .count()
    }

    pub fn aborted_cohorts(&self) -> usize {
        self.cohorts.iter().filter(|c| c.phase.is_aborted()).count()
    }

    /// Cities observed at least once by a health poll.
    pub fn cities_with_data(&self) -> usize {
        self.cohorts
            .iter()
            .flat_map(|c| c.health.iter().map(|h| h.city_id.as_str()))
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Experiment-level metadata for the durable store and the results dir.
    pub fn metadata(&self) -> Map<String, Value> {
        let agents: Vec<Value> = self
            .workloads()
            .map(|w| {
                json!({
                    "agent_id": w.agent_id,
                    "intent": w.intent.key,
                    "label": w.intent.label,
                    "city_id": w.city_id,
                    "hs_key": w.key_prefix,
                    "status": w.status(),
                })
            })
            .collect();
        let mut meta = Map::new();
        meta.insert("experiment_id".into(), json!(self.experiment_id));
        meta.insert("timestamp".into(), json!(self.started_at.to_rfc3339()));
        meta.insert("timestamp_unix".into(), json!(self.started_at.timestamp()));
        meta.insert("n_pairs".into(), json!(self.cohorts.len()));
        meta.insert("completed".into(), json!(self.completed()));
        meta.insert("failed".into(), json!(self.failed()));
        meta.insert("aborted_cohorts".into(), json!(self.aborted_cohorts()));
        meta.insert("cities_with_data".into(), json!(self.cities_with_data()));
        meta.insert("agents".into(), Value::Array(agents));
        meta
    }
}

// ---------------------------------------------------------------------------
// CohortOrchestrator
// ---------------------------------------------------------------------------

/// Collaborators injected into the orchestrator.
#[derive(Clone)]
pub struct Services {
    pub sim: Arc<dyn SimService>,
    pub store: Arc<dyn ExperimentStore>,
    pub workspaces: Arc<dyn WorkspacePreparer>,
    pub launcher: Arc<dyn Launcher>,
}

pub struct CohortOrchestrator {
    config: ExperimentConfig,
    services: Services,
    settings: RunSettings,
    experiment_id: String,
    results_dir: PathBuf,
    started_at: DateTime<Utc>,
}

impl CohortOrchestrator {
    /// `env` is the secret material handed to every sandbox.
    pub fn new(
        config: ExperimentConfig,
        services: Services,
        env: Vec<(String, String)>,
        experiment_id: impl Into<String>,
        results_dir: PathBuf,
    ) -> Self {
        let t = &config.timing;
        let settings = RunSettings {
            env,
            timeout: t.agent_timeout(),
            watchdog_poll: t.watchdog_poll(),
            emit_interval: t.emit_interval(),
            emitter_grace: t.emitter_grace(),
            drain_timeout: t.drain_timeout(),
        };
        Self {
            config,
            services,
            settings,
            experiment_id: experiment_id.into(),
            results_dir,
            started_at: Utc::now(),
        }
    }

    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Run `cohorts` cohorts back to back under one key.
    pub async fn run(&self, key: &str, cohorts: usize) -> RunSummary {
        let mut reports = Vec::with_capacity(cohorts);
        for index in 1..=cohorts {
            tracing::info!(cohort = index, of = cohorts, "starting cohort");
            let report = self.run_cohort(index, key).await;
            tracing::info!(
                cohort = index,
                phase = ?report.phase,
                completed = report.count(WorkloadStatus::Completed),
                failed = report.count(WorkloadStatus::Failed),
                "cohort finished"
            );
            reports.push(report);
            if index < cohorts {
                tokio::time::sleep(self.config.timing.cohort_pause()).await;
            }
        }
        RunSummary {
            experiment_id: self.experiment_id.clone(),
            started_at: self.started_at,
            cohorts: reports,
        }
    }

    pub async fn run_cohort(&self, index: usize, key: &str) -> CohortReport {
        let mut report = CohortReport::new(index);
        let timing = &self.config.timing;

        // allocating
        let cities = match self.allocate(index, key).await {
            Ok(cities) => cities,
            Err(e) => {
                tracing::warn!(cohort = index, error = %e, "city allocation failed; skipping cohort");
                return report.aborted(CohortPhase::AllocatingFailed, e.to_string());
            }
        };
        let mut workloads: Vec<Workload> = self
            .config
            .intents
            .iter()
            .zip(cities)
            .map(|(intent, city)| Workload::new(intent.clone(), index, city, key))
            .collect();

        let mut prep_error = None;
        for w in workloads.iter_mut() {
            match self.services.workspaces.prepare(w, key) {
                Ok(path) => w.workspace = Some(path),
                Err(e) => {
                    prep_error = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = prep_error {
            tracing::warn!(cohort = index, error = %e, "workspace preparation failed; skipping cohort");
            self.discard_workspaces(&mut workloads);
            self.release(index, key, &workloads).await;
            return report.aborted(CohortPhase::PrepFailed, e.to_string());
        }

        // running
        report.phase = CohortPhase::Running;
        let ctx = CohortContext {
            cohort: index,
            key: Arc::from(key),
            targets: workloads.iter().map(Target::from).collect(),
            sim: Arc::clone(&self.services.sim),
            call_timeout: self.config.sim.request_timeout(),
        };
        let poller = HealthPoller::start(
            ctx.clone(),
            self.cohort_log("healthcheck.jsonl"),
            timing.health_interval(),
            timing.poller_grace(),
        );
        let pacer = TimePacer::start(
            ctx,
            self.cohort_log("time_pacer.jsonl"),
            timing.total_cycles,
            timing.tick_interval(),
            timing.pacer_grace(),
        );

        // collecting
        report.phase = CohortPhase::Collecting;
        self.run_pool(&mut workloads).await;

        // releasing
        report.phase = CohortPhase::Releasing;
        report.health = poller.stop().await;
        report.clock = Some(pacer.stop().await);
        self.discard_workspaces(&mut workloads);
        self.release(index, key, &workloads).await;

        // done
        report.phase = CohortPhase::Done;
        self.persist(index, &workloads, report.clock);
        report.workloads = workloads;
        report
    }

    /// Create one city per intent, serialized with the settle delay.
    /// On failure the cities already created are retired.
    async fn allocate(&self, index: usize, key: &str) -> Result<Vec<String>, SimError> {
        let delay = self.config.timing.city_delay();
        let mut cities = Vec::with_capacity(self.config.cohort_size());

        for _ in 0..self.config.cohort_size() {
            match self.services.sim.create_city(key, None).await {
                Ok(id) => {
                    tracing::info!(cohort = index, city_id = %id, "city created");
                    cities.push(id);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.retire_all(index, key, &cities).await;
                    return Err(e);
                }
            }
        }
        Ok(cities)
    }

    async fn release(&self, index: usize, key: &str, workloads: &[Workload]) {
        let cities: Vec<String> = workloads.iter().map(|w| w.city_id.clone()).collect();
        self.retire_all(index, key, &cities).await;
    }

    /// Best-effort, in creation order, separated by the settle delay.
    async fn retire_all(&self, index: usize, key: &str, cities: &[String]) {
        for (n, city_id) in cities.iter().enumerate() {
            if n > 0 {
                tokio::time::sleep(self.config.timing.city_delay()).await;
            }
            match self.services.sim.retire_city(key, city_id).await {
                Ok(()) => tracing::info!(cohort = index, city_id = %city_id, "city retired"),
                Err(e) => tracing::warn!(
                    cohort = index,
                    city_id = %city_id,
                    error = %e,
                    "city retirement failed"
                ),
            }
        }
    }

    /// Run every workload concurrently, bounded to the cohort size, and
    /// wait for all of them.
    async fn run_pool(&self, workloads: &mut [Workload]) {
        let semaphore = Arc::new(Semaphore::new(workloads.len().max(1)));
        let mut handles = Vec::with_capacity(workloads.len());

        for w in workloads.iter_mut() {
            if let Err(e) = w.transition(WorkloadStatus::Running) {
                tracing::warn!(agent_id = %w.agent_id, error = %e, "workload not startable");
                handles.push(None);
                continue;
            }
            let job = self.job_for(w);
            let launcher = Arc::clone(&self.services.launcher);
            let settings = self.settings.clone();
            let sem = Arc::clone(&semaphore);
            tracing::info!(agent_id = %w.agent_id, city_id = %w.city_id, "launching sandbox");
            handles.push(Some(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await;
                run_sandbox(&job, launcher.as_ref(), &settings).await
            })));
        }

        for (w, handle) in workloads.iter_mut().zip(handles) {
            let Some(handle) = handle else { continue };
            let outcome = match handle.await {
                Ok(report) => apply_report(w, report),
                Err(e) => w.fail(format!("sandbox task failed: {e}")),
            };
            if let Err(e) = outcome {
                tracing::warn!(agent_id = %w.agent_id, error = %e, "status update rejected");
            }
            log_terminal(w);
        }
    }

    fn job_for(&self, w: &Workload) -> SandboxJob {
        SandboxJob {
            agent_id: w.agent_id.clone(),
            workspace: w.workspace.clone().unwrap_or_default(),
            intent_file: w.intent.file.clone(),
            prompt: self.config.agent_prompt(),
            max_turns: self.config.sandbox.max_turns,
            log_dir: self.results_dir.join(&w.agent_id),
        }
    }

    fn discard_workspaces(&self, workloads: &mut [Workload]) {
        for w in workloads.iter_mut() {
            if let Some(path) = w.workspace.take() {
                self.services.workspaces.discard(&path);
            }
        }
    }

    fn cohort_log(&self, name: &str) -> Option<JsonlSink> {
        let path = self.results_dir.join(name);
        match JsonlSink::open(&path) {
            Ok(sink) => Some(sink),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cohort log unavailable");
                None
            }
        }
    }

    /// Store terminal results and cohort metadata. Failures are warnings.
    fn persist(&self, index: usize, workloads: &[Workload], clock: Option<TimeTick>) {
        let store = &self.services.store;
        for w in workloads {
            if let Err(e) = store.push_agent_result(&self.experiment_id, &AgentResult::from(w)) {
                tracing::warn!(agent_id = %w.agent_id, error = %e, "failed to persist agent result");
            }
        }

        let cohort = json!({
            "completed": workloads.iter().filter(|w| w.status() == WorkloadStatus::Completed).count(),
            "failed": workloads.iter().filter(|w| w.status() == WorkloadStatus::Failed).count(),
            "cities": workloads.iter().map(|w| w.city_id.as_str()).collect::<Vec<_>>(),
            "cycles": clock.map(|c| c.cycle),
        });
        let mut fields = Map::new();
        fields.insert(format!("cohort_{index}"), cohort);
        fields.insert("cohorts_done".into(), json!(index));
        if let Err(e) = store.store_experiment(&self.experiment_id, &fields, self.started_at) {
            tracing::warn!(cohort = index, error = %e, "failed to persist cohort metadata");
        }
    }
}

fn apply_report(w: &mut Workload, report: RunReport) -> crate::error::Result<()> {
    w.usage = Some(report.usage);
    match report.outcome {
        RunOutcome::Completed => w.transition(WorkloadStatus::Completed),
        RunOutcome::Failed(reason) => w.fail(reason.to_string()),
    }
}

fn log_terminal(w: &Workload) {
    let tokens = w.usage.as_ref().map(|u| u.total_tokens).unwrap_or(0);
    match w.status() {
        WorkloadStatus::Completed => tracing::info!(
            agent_id = %w.agent_id,
            status = %w.status(),
            city_id = %w.city_id,
            key = %w.key_prefix,
            total_tokens = tokens,
            "agent finished"
        ),
        status => tracing::warn!(
            agent_id = %w.agent_id,
            status = %status,
            city_id = %w.city_id,
            key = %w.key_prefix,
            total_tokens = tokens,
            reason = w.failure.as_deref().unwrap_or("unknown"),
            "agent finished"
        ),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimingConfig;
    use crate::testing::{DirWorkspace, FakeSim, MemoryStore, ScriptLauncher};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn fast_config() -> ExperimentConfig {
        let mut cfg = ExperimentConfig::default();
        cfg.timing = TimingConfig {
            total_cycles: 3,
            tick_interval_secs: 0.2,
            health_interval_secs: 0.2,
            emit_interval_secs: 0.5,
            watchdog_poll_secs: 0.1,
            timeout_margin_secs: 0.0,
            agent_timeout_secs: Some(1.5),
            city_delay_secs: 0.01,
            cohort_pause_secs: 0.01,
            drain_timeout_secs: 0.5,
        };
        cfg
    }

    struct Harness {
        sim: Arc<FakeSim>,
        store: Arc<MemoryStore>,
        workspaces: Arc<DirWorkspace>,
        dir: TempDir,
    }

    impl Harness {
        fn new(sim: FakeSim, store: MemoryStore) -> Self {
            let dir = TempDir::new().unwrap();
            std::fs::create_dir_all(dir.path().join("work")).unwrap();
            Self {
                sim: Arc::new(sim),
                store: Arc::new(store),
                workspaces: Arc::new(DirWorkspace::new(&dir.path().join("work"))),
                dir,
            }
        }

        fn with_workspaces(mut self, ws: DirWorkspace) -> Self {
            self.workspaces = Arc::new(ws);
            self
        }

        fn orchestrator(&self, launcher: ScriptLauncher) -> CohortOrchestrator {
            let services = Services {
                sim: self.sim.clone(),
                store: self.store.clone(),
                workspaces: self.workspaces.clone(),
                launcher: Arc::new(launcher),
            };
            CohortOrchestrator::new(
                fast_config(),
                services,
                vec![("ANTHROPIC_AUTH_TOKEN".into(), "sk-test".into())],
                "20261019_120000",
                self.dir.path().join("results"),
            )
        }
    }

    #[tokio::test]
    async fn cohorts_run_to_done_and_release_in_creation_order() {
        let h = Harness::new(FakeSim::default(), MemoryStore::default());
        let summary = h.orchestrator(ScriptLauncher::new()).run("hs_key_1234567890", 2).await;

        assert_eq!(summary.cohorts.len(), 2);
        assert!(summary.cohorts.iter().all(|c| c.phase == CohortPhase::Done));
        assert_eq!(summary.completed(), 4);
        assert_eq!(summary.failed(), 0);
        assert!(summary.workloads().all(|w| w.status().is_terminal()));
        assert!(summary.workloads().all(|w| w.workspace.is_none()));

        let ids: Vec<&str> = summary.workloads().map(|w| w.agent_id.as_str()).collect();
        assert_eq!(ids, vec!["a-01", "b-01", "a-02", "b-02"]);

        assert_eq!(h.sim.args_of("create_city"), vec!["city-1", "city-2", "city-3", "city-4"]);
        assert_eq!(h.sim.args_of("retire_city"), vec!["city-1", "city-2", "city-3", "city-4"]);
        // Every creation of a cohort precedes its first retirement.
        let calls = h.sim.calls();
        let last_create = calls.iter().rposition(|c| c.op == "create_city" && c.arg == "city-2").unwrap();
        let first_retire = calls.iter().position(|c| c.op == "retire_city").unwrap();
        assert!(last_create < first_retire);

        let usage = summary.workloads().next().unwrap().usage.clone().unwrap();
        assert_eq!(usage.input_tokens, 105);
        assert_eq!(usage.num_turns, 3);

        let stored = h.store.agent_results("20261019_120000").unwrap();
        assert_eq!(stored.len(), 4);
        assert_eq!(stored[0].hs_key, "hs_key_12345...");
        let meta = h.store.get_experiment("20261019_120000").unwrap().unwrap();
        assert_eq!(meta.get("cohorts_done"), Some(&json!(2)));

        let results = h.dir.path().join("results");
        assert!(results.join("a-01/stdout.log").exists());
        assert!(results.join("b-02/token_usage.jsonl").exists());
        assert!(results.join("healthcheck.jsonl").exists());
    }

    #[tokio::test]
    async fn hung_workload_is_killed_while_sibling_completes() {
        let h = Harness::new(FakeSim::default(), MemoryStore::default());
        let launcher = ScriptLauncher::new().with("a", "sleep 30");
        let start = Instant::now();
        let summary = h.orchestrator(launcher).run("hs_key", 1).await;
        assert!(start.elapsed() < Duration::from_secs(15));

        let cohort = &summary.cohorts[0];
        let hung = &cohort.workloads[0];
        assert_eq!(hung.agent_id, "a-01");
        assert_eq!(hung.status(), WorkloadStatus::Failed);
        assert!(hung.failure.as_deref().unwrap().contains("timed out"));

        let sibling = &cohort.workloads[1];
        assert_eq!(sibling.status(), WorkloadStatus::Completed);
        assert_eq!(sibling.usage.as_ref().unwrap().output_tokens, 21);
        assert_eq!(h.store.agent_results("20261019_120000").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn non_zero_exit_fails_only_that_workload() {
        let h = Harness::new(FakeSim::default(), MemoryStore::default());
        let summary = h
            .orchestrator(ScriptLauncher::new().with("b", "echo boom >&2; exit 3"))
            .run("hs_key", 1)
            .await;
        assert_eq!(summary.completed(), 1);
        assert_eq!(summary.failed(), 1);
        let failed = summary.workloads().find(|w| w.agent_id == "b-01").unwrap();
        assert_eq!(failed.failure.as_deref(), Some("exit code 3"));
    }

    #[tokio::test]
    async fn failing_store_still_produces_a_summary() {
        let h = Harness::new(FakeSim::default(), MemoryStore::failing());
        let summary = h.orchestrator(ScriptLauncher::new()).run("hs_key", 1).await;
        assert_eq!(summary.completed(), 2);
        assert_eq!(summary.cohorts[0].phase, CohortPhase::Done);
        let meta = summary.metadata();
        assert_eq!(meta.get("completed"), Some(&json!(2)));
        assert_eq!(meta.get("agents").and_then(Value::as_array).map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn records_group_by_intent_key() {
        let h = Harness::new(FakeSim::default(), MemoryStore::default());
        let summary = h.orchestrator(ScriptLauncher::new()).run("hs_key_1234567890", 1).await;

        let meta = summary.metadata();
        let agents = meta["agents"].as_array().unwrap();
        assert_eq!(agents[0]["intent"], json!("a"));
        assert_eq!(agents[0]["label"], json!("Metric Optimization"));
        assert_eq!(agents[0]["hs_key"], json!("hs_key_12345..."));
        assert_eq!(agents[1]["intent"], json!("b"));

        let stored = h.store.agent_results("20261019_120000").unwrap();
        let intents: Vec<&str> = stored.iter().map(|r| r.intent.as_str()).collect();
        assert_eq!(intents, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn failed_retire_does_not_stop_release_or_later_cohorts() {
        let h = Harness::new(FakeSim::default().failing_retire_for("city-1"), MemoryStore::default());
        let summary = h.orchestrator(ScriptLauncher::new()).run("hs_key", 2).await;

        assert_eq!(summary.cohorts.len(), 2);
        assert!(summary.cohorts.iter().all(|c| c.phase == CohortPhase::Done));
        assert_eq!(summary.completed(), 4);
        assert_eq!(h.sim.args_of("retire_city"), vec!["city-1", "city-2", "city-3", "city-4"]);

        assert_eq!(h.store.agent_results("20261019_120000").unwrap().len(), 4);
        let meta = h.store.get_experiment("20261019_120000").unwrap().unwrap();
        assert_eq!(meta.get("cohorts_done"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn allocation_failure_skips_the_cohort_and_retires_partial_cities() {
        let h = Harness::new(FakeSim::default().creates_allowed(3), MemoryStore::default());
        let summary = h.orchestrator(ScriptLauncher::new()).run("hs_key", 2).await;

        assert_eq!(summary.cohorts[0].phase, CohortPhase::Done);
        let second = &summary.cohorts[1];
        assert_eq!(second.phase, CohortPhase::AllocatingFailed);
        assert!(second.workloads.is_empty());
        assert!(second.error.as_deref().unwrap().contains("slot limit"));
        assert_eq!(summary.aborted_cohorts(), 1);

        assert_eq!(h.sim.args_of("retire_city"), vec!["city-1", "city-2", "city-3"]);
        assert_eq!(h.store.agent_results("20261019_120000").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn workspace_failure_releases_cities_and_discards_prepared_workspaces() {
        let h = Harness::new(FakeSim::default(), MemoryStore::default());
        let mut ws = DirWorkspace::new(&h.dir.path().join("work"));
        ws.fail_for = Some("b-01".into());
        let h = h.with_workspaces(ws);

        let summary = h.orchestrator(ScriptLauncher::new()).run("hs_key", 1).await;
        let cohort = &summary.cohorts[0];
        assert_eq!(cohort.phase, CohortPhase::PrepFailed);
        assert!(cohort.workloads.is_empty());

        assert_eq!(h.sim.args_of("retire_city"), vec!["city-1", "city-2"]);
        assert_eq!(h.sim.calls_named("advance"), 0);
        let prepared = h.workspaces.prepared.lock().unwrap().clone();
        let discarded = h.workspaces.discarded.lock().unwrap().clone();
        assert_eq!(prepared, discarded);
        assert!(h.store.agent_results("20261019_120000").unwrap().is_empty());
    }

    #[tokio::test]
    async fn pacer_stops_with_the_cohort() {
        let h = Harness::new(FakeSim::default(), MemoryStore::default());
        // Sandboxes outlive the 3-tick budget (0.6s).
        let launcher = ScriptLauncher::new().with("a", "sleep 1").with("b", "sleep 1");
        let summary = h.orchestrator(launcher).run("hs_key", 1).await;

        let clock = summary.cohorts[0].clock.unwrap();
        assert_eq!(clock, TimeTick { cycle: 3, total: 3 });
        assert_eq!(h.sim.advance_times("city-1").len(), 3);
        assert_eq!(h.sim.advance_times("city-2").len(), 3);
        assert!(summary.cities_with_data() >= 1);
    }
}
