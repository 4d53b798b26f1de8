use thiserror::Error;

use crate::sim::SimError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("provisioning failed: {0}")]
    Provisioning(#[source] SimError),

    #[error("workspace preparation failed for {agent_id}: {source}")]
    WorkspacePrep {
        agent_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid status transition for {agent_id}: {from} -> {to}")]
    InvalidTransition {
        agent_id: String,
        from: String,
        to: String,
    },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ExperimentError>;
