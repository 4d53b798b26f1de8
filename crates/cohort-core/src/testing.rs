//! In-memory doubles for the orchestrator's collaborators.

use crate::error::{ExperimentError, Result};
use crate::sim::{CityStats, SimError, SimService};
use crate::store::{ExperimentStore, StoreError};
use crate::workload::{AgentResult, Workload};
use crate::workspace::WorkspacePreparer;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sandbox_agent::{Launcher, SandboxJob};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::process::Command;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// FakeSim
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SimCall {
    pub op: &'static str,
    pub arg: String,
    pub at: Instant,
}

#[derive(Default)]
pub struct FakeSim {
    calls: Mutex<Vec<SimCall>>,
    next_key: AtomicU32,
    next_city: AtomicU32,
    failing_stats: HashSet<String>,
    hanging_stats: HashSet<String>,
    failing_advance: HashSet<String>,
    failing_retire: HashSet<String>,
    creates_allowed: Option<u32>,
}

impl FakeSim {
    pub fn failing_stats_for(mut self, city: &str) -> Self {
        self.failing_stats.insert(city.to_string());
        self
    }

    pub fn hanging_stats_for(mut self, city: &str) -> Self {
        self.hanging_stats.insert(city.to_string());
        self
    }

    pub fn failing_advance_for(mut self, city: &str) -> Self {
        self.failing_advance.insert(city.to_string());
        self
    }

    pub fn failing_retire_for(mut self, city: &str) -> Self {
        self.failing_retire.insert(city.to_string());
        self
    }

    /// City creation succeeds `n` times, then fails.
    pub fn creates_allowed(mut self, n: u32) -> Self {
        self.creates_allowed = Some(n);
        self
    }

    fn record(&self, op: &'static str, arg: &str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(SimCall {
                op,
                arg: arg.to_string(),
                at: Instant::now(),
            });
        }
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_named(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| c.op == op).count()
    }

    /// Arguments of every call to `op`, in call order.
    pub fn args_of(&self, op: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.op == op)
            .map(|c| c.arg)
            .collect()
    }

    pub fn advance_times(&self, city: &str) -> Vec<Instant> {
        self.calls()
            .into_iter()
            .filter(|c| c.op == "advance" && c.arg == city)
            .map(|c| c.at)
            .collect()
    }
}

#[async_trait]
impl SimService for FakeSim {
    async fn provision_key(&self) -> std::result::Result<String, SimError> {
        self.record("provision_key", "");
        let n = self.next_key.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("hs_fake_key_{n:04}"))
    }

    async fn create_city(&self, _key: &str, _seed: Option<u64>) -> std::result::Result<String, SimError> {
        let n = self.next_city.fetch_add(1, Ordering::SeqCst) + 1;
        if self.creates_allowed.is_some_and(|allowed| n > allowed) {
            self.record("create_city", "");
            return Err(SimError::Other("slot limit reached".into()));
        }
        let id = format!("city-{n}");
        self.record("create_city", &id);
        Ok(id)
    }

    async fn retire_city(&self, _key: &str, city_id: &str) -> std::result::Result<(), SimError> {
        self.record("retire_city", city_id);
        if self.failing_retire.contains(city_id) {
            return Err(SimError::Other("retire refused".into()));
        }
        Ok(())
    }

    async fn city_stats(&self, _key: &str, city_id: &str) -> std::result::Result<CityStats, SimError> {
        self.record("city_stats", city_id);
        if self.hanging_stats.contains(city_id) {
            std::future::pending::<()>().await;
        }
        if self.failing_stats.contains(city_id) {
            return Err(SimError::Other("stats unavailable".into()));
        }
        Ok(CityStats {
            population: Some(1000u32.into()),
            score: Some(5u32.into()),
            funds: Some(20_000u32.into()),
            game_year: Some(1900u32.into()),
            extra: Map::new(),
        })
    }

    async fn advance(&self, _key: &str, city_id: &str, _months: u32) -> std::result::Result<(), SimError> {
        self.record("advance", city_id);
        if self.failing_advance.contains(city_id) {
            return Err(SimError::Other("advance rejected".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    failing: bool,
    keys: Mutex<Vec<String>>,
    experiments: Mutex<BTreeMap<String, (DateTime<Utc>, Map<String, Value>)>>,
    results: Mutex<Vec<(String, AgentResult)>>,
}

impl MemoryStore {
    /// A store whose every operation fails.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    fn check(&self) -> std::result::Result<(), StoreError> {
        if self.failing {
            Err(StoreError::Db("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

impl ExperimentStore for MemoryStore {
    fn push_key(&self, key: &str) -> std::result::Result<(), StoreError> {
        self.check()?;
        self.keys.lock().unwrap().push(key.to_string());
        Ok(())
    }

    fn peek_key(&self) -> std::result::Result<Option<String>, StoreError> {
        self.check()?;
        Ok(self.keys.lock().unwrap().first().cloned())
    }

    fn store_experiment(
        &self,
        exp_id: &str,
        fields: &Map<String, Value>,
        at: DateTime<Utc>,
    ) -> std::result::Result<(), StoreError> {
        self.check()?;
        let mut experiments = self.experiments.lock().unwrap();
        let entry = experiments
            .entry(exp_id.to_string())
            .or_insert_with(|| (at, Map::new()));
        entry.0 = at;
        entry.1.extend(fields.clone());
        Ok(())
    }

    fn get_experiment(&self, exp_id: &str) -> std::result::Result<Option<Map<String, Value>>, StoreError> {
        self.check()?;
        Ok(self.experiments.lock().unwrap().get(exp_id).map(|(_, m)| m.clone()))
    }

    fn list_experiments(&self) -> std::result::Result<Vec<String>, StoreError> {
        self.check()?;
        let experiments = self.experiments.lock().unwrap();
        let mut ids: Vec<(DateTime<Utc>, String)> =
            experiments.iter().map(|(id, (at, _))| (*at, id.clone())).collect();
        ids.sort();
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }

    fn push_agent_result(&self, exp_id: &str, result: &AgentResult) -> std::result::Result<(), StoreError> {
        self.check()?;
        self.results
            .lock()
            .unwrap()
            .push((exp_id.to_string(), result.clone()));
        Ok(())
    }

    fn agent_results(&self, exp_id: &str) -> std::result::Result<Vec<AgentResult>, StoreError> {
        self.check()?;
        Ok(self
            .results
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == exp_id)
            .map(|(_, r)| r.clone())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// DirWorkspace
// ---------------------------------------------------------------------------

/// Creates an empty directory per workload under `root`.
pub struct DirWorkspace {
    pub root: PathBuf,
    pub fail_for: Option<String>,
    pub prepared: Mutex<Vec<PathBuf>>,
    pub discarded: Mutex<Vec<PathBuf>>,
}

impl DirWorkspace {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            fail_for: None,
            prepared: Mutex::new(Vec::new()),
            discarded: Mutex::new(Vec::new()),
        }
    }
}

impl WorkspacePreparer for DirWorkspace {
    fn prepare(&self, workload: &Workload, _key: &str) -> Result<PathBuf> {
        if self.fail_for.as_deref() == Some(workload.agent_id.as_str()) {
            return Err(ExperimentError::WorkspacePrep {
                agent_id: workload.agent_id.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "template missing"),
            });
        }
        let dir = self.root.join(format!("intent-{}", workload.agent_id));
        std::fs::create_dir_all(&dir)?;
        self.prepared.lock().unwrap().push(dir.clone());
        Ok(dir)
    }

    fn discard(&self, path: &Path) {
        let _ = std::fs::remove_dir_all(path);
        self.discarded.lock().unwrap().push(path.to_path_buf());
    }
}

// ---------------------------------------------------------------------------
// ScriptLauncher
// ---------------------------------------------------------------------------

/// Runs `sh -c <script>` chosen by the job's agent-id prefix.
pub struct ScriptLauncher {
    pub scripts: HashMap<String, String>,
    pub default_script: String,
}

/// A well-behaved sandbox: one usage event, one result event, exit 0.
pub const COMPLETING_SCRIPT: &str = r#"echo '{"type":"assistant","message":{"usage":{"input_tokens":100,"output_tokens":20}}}'
echo '{"type":"result","num_turns":3,"cost_usd":0.01,"usage":{"input_tokens":5,"output_tokens":1}}'"#;

impl ScriptLauncher {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            default_script: COMPLETING_SCRIPT.to_string(),
        }
    }

    pub fn with(mut self, intent_key: &str, script: &str) -> Self {
        self.scripts.insert(intent_key.to_string(), script.to_string());
        self
    }
}

impl Launcher for ScriptLauncher {
    fn program(&self) -> &str {
        "sh"
    }

    fn command(&self, job: &SandboxJob, env_file: &Path) -> Command {
        let prefix = job.agent_id.split('-').next().unwrap_or_default();
        let script = self.scripts.get(prefix).unwrap_or(&self.default_script);
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(script)
            .env("SANDBOX_ENV_FILE", env_file)
            .current_dir(&job.workspace);
        cmd
    }
}
