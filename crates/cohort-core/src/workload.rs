use crate::config::IntentSpec;
use crate::error::{ExperimentError, Result};
use sandbox_agent::UsageSnapshot;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// WorkloadStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl WorkloadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadStatus::Pending => "pending",
            WorkloadStatus::Running => "running",
            WorkloadStatus::Completed => "completed",
            WorkloadStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkloadStatus::Completed | WorkloadStatus::Failed)
    }

    /// Status only moves forward: pending → running → completed | failed.
    pub fn can_transition_to(self, next: WorkloadStatus) -> bool {
        matches!(
            (self, next),
            (WorkloadStatus::Pending, WorkloadStatus::Running)
                | (WorkloadStatus::Running, WorkloadStatus::Completed)
                | (WorkloadStatus::Running, WorkloadStatus::Failed)
        )
    }
}

impl fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Workload
// ---------------------------------------------------------------------------

/// One agent paired with one city, owned by the orchestrator for the
/// lifetime of its cohort.
#[derive(Debug, Clone)]
pub struct Workload {
    pub agent_id: String,
    pub intent: IntentSpec,
    /// 1-based cohort index.
    pub cohort: usize,
    pub city_id: String,
    /// Display-safe prefix of the cohort credential.
    pub key_prefix: String,
    pub workspace: Option<PathBuf>,
    pub failure: Option<String>,
    pub usage: Option<UsageSnapshot>,
    status: WorkloadStatus,
}

impl Workload {
    pub fn new(intent: IntentSpec, cohort: usize, city_id: String, key: &str) -> Self {
        Self {
            agent_id: agent_id(&intent, cohort),
            intent,
            cohort,
            city_id,
            key_prefix: key_prefix(key),
            workspace: None,
            failure: None,
            usage: None,
            status: WorkloadStatus::Pending,
        }
    }

    pub fn status(&self) -> WorkloadStatus {
        self.status
    }

    pub fn transition(&mut self, next: WorkloadStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ExperimentError::InvalidTransition {
                agent_id: self.agent_id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Mark a running workload failed with a reason.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(WorkloadStatus::Failed)?;
        self.failure = Some(reason.into());
        Ok(())
    }
}

pub fn agent_id(intent: &IntentSpec, cohort: usize) -> String {
    format!("{}-{:02}", intent.key, cohort)
}

/// First 12 characters of a credential followed by `...`.
pub fn key_prefix(key: &str) -> String {
    let head: String = key.chars().take(12).collect();
    format!("{head}...")
}

// ---------------------------------------------------------------------------
// AgentResult
// ---------------------------------------------------------------------------

/// Terminal record persisted per workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_id: String,
    /// Intent key (`a`, `b`, ...); reports group agents by it.
    pub intent: String,
    #[serde(default)]
    pub label: String,
    pub cohort: usize,
    pub hs_key: String,
    pub city_id: String,
    pub status: WorkloadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

impl From<&Workload> for AgentResult {
    fn from(w: &Workload) -> Self {
        Self {
            agent_id: w.agent_id.clone(),
            intent: w.intent.key.clone(),
            label: w.intent.label.clone(),
            cohort: w.cohort,
            hs_key: w.key_prefix.clone(),
            city_id: w.city_id.clone(),
            status: w.status(),
            failure: w.failure.clone(),
            total_tokens: w.usage.as_ref().map(|u| u.total_tokens),
            cost_usd: w.usage.as_ref().map(|u| u.cost_usd),
        }
    }
}

// ---------------------------------------------------------------------------
// HealthRecord / TimeTick
// ---------------------------------------------------------------------------

/// One observation of a city, written only by the health poller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub cohort: usize,
    pub agent_id: String,
    pub city_id: String,
    pub population: Option<serde_json::Number>,
    pub score: Option<serde_json::Number>,
    pub funds: Option<serde_json::Number>,
    pub game_year: Option<serde_json::Number>,
    pub elapsed_seconds: f64,
}

/// Pacer clock state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeTick {
    pub cycle: u32,
    pub total: u32,
}

impl TimeTick {
    pub fn remaining(&self) -> u32 {
        self.total.saturating_sub(self.cycle)
    }

    pub fn is_exhausted(&self) -> bool {
        self.cycle >= self.total
    }
}

/// A city tracked by the cohort's background tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub agent_id: String,
    pub city_id: String,
}

impl From<&Workload> for Target {
    fn from(w: &Workload) -> Self {
        Self {
            agent_id: w.agent_id.clone(),
            city_id: w.city_id.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
