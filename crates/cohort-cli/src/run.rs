use crate::output;
use crate::Cli;
use anyhow::Context;
use cohort_core::config::ExperimentConfig;
use cohort_core::credentials::load_or_create_key;
use cohort_core::orchestrator::{CohortOrchestrator, RunSummary, Services};
use cohort_core::sim::HttpSimClient;
use cohort_core::store::{ExperimentStore, RedbStore};
use cohort_core::workload::key_prefix;
use cohort_core::workspace::TemplateWorkspace;
use sandbox_agent::DockerLauncher;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const ROUTER_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = ExperimentConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    let experiment_id = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    let results_dir = results_dir(cli.results_dir.as_deref(), &experiment_id);
    std::fs::create_dir_all(&results_dir)
        .with_context(|| format!("failed to create {}", results_dir.display()))?;

    output::banner(cli.pairs, &config);

    let token = non_empty(cli.auth_token.as_deref())
        .context("ANTHROPIC_AUTH_TOKEN is not set (export it, add it to .env, or pass --auth-token)")?;
    let model = non_empty(cli.model.as_deref());
    match &model {
        Some(m) => tracing::info!(model = %m, "model"),
        None => tracing::warn!("CCR_MODEL not set; continuing without a model name"),
    }

    probe_router(&format!("http://127.0.0.1:{}", config.sandbox.router_port)).await?;

    let store = Arc::new(
        RedbStore::open(&config.store.path)
            .with_context(|| format!("failed to open store at {}", config.store.path.display()))?,
    );
    let sim = Arc::new(HttpSimClient::new(&config.sim)?);
    let key = load_or_create_key(store.as_ref(), sim.as_ref())
        .await
        .context("could not obtain a simulation API key")?;

    let services = Services {
        sim,
        store: store.clone(),
        workspaces: Arc::new(TemplateWorkspace::new(
            config.assets.templates_dir.clone(),
            config.assets.intents_dir.clone(),
        )),
        launcher: Arc::new(DockerLauncher {
            image: config.sandbox.image.clone(),
            router_host: config.sandbox.router_host.clone(),
        }),
    };
    let env = config.sandbox.sandbox_env(&token);
    let intents: Vec<String> = config.intents.iter().map(|i| i.key.clone()).collect();
    let orchestrator =
        CohortOrchestrator::new(config, services, env, experiment_id.clone(), results_dir.clone());

    let summary = orchestrator.run(&key, cli.pairs).await;

    let meta = experiment_metadata(&summary, model.as_deref(), &key, &intents);
    let meta_path = results_dir.join("experiment_meta.json");
    match write_metadata(&meta_path, &meta) {
        Ok(()) => tracing::info!(path = %meta_path.display(), "metadata saved"),
        Err(e) => tracing::warn!(path = %meta_path.display(), error = %format!("{e:#}"), "failed to write metadata"),
    }

    let mut stored = meta;
    stored.insert("status".into(), json!("completed"));
    match store.store_experiment(&experiment_id, &stored, summary.started_at) {
        Ok(()) => tracing::info!(experiment_id = %experiment_id, "experiment metadata stored"),
        Err(e) => tracing::warn!(error = %e, "store write failed (non-fatal)"),
    }

    output::summary(&summary, &results_dir);
    Ok(())
}

fn results_dir(explicit: Option<&Path>, experiment_id: &str) -> PathBuf {
    match explicit {
        Some(dir) => dir.to_path_buf(),
        None => PathBuf::from("results").join(experiment_id),
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Any HTTP answer counts as alive; connection failures do not.
async fn probe_router(url: &str) -> anyhow::Result<()> {
    tracing::info!(url = %url, "checking model router");
    let client = reqwest::Client::builder()
        .timeout(ROUTER_PROBE_TIMEOUT)
        .build()?;
    client
        .get(url)
        .send()
        .await
        .with_context(|| format!("cannot reach the model router at {url}; start it first (ccr start)"))?;
    tracing::info!("model router is alive");
    Ok(())
}

fn experiment_metadata(
    summary: &RunSummary,
    model: Option<&str>,
    key: &str,
    intents: &[String],
) -> Map<String, Value> {
    let mut meta = summary.metadata();
    meta.insert("model".into(), json!(model.unwrap_or_default()));
    meta.insert("hs_key".into(), json!(key_prefix(key)));
    for intent in intents {
        meta.insert(
            format!("intent_{intent}_count"),
            json!(summary.cohorts.len()),
        );
    }
    meta
}

fn write_metadata(path: &Path, meta: &Map<String, Value>) -> anyhow::Result<()> {
    let data = serde_json::to_string_pretty(meta)?;
    std::fs::write(path, data)?;
    Ok(())
}
