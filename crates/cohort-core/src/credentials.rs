use crate::error::{ExperimentError, Result};
use crate::sim::SimService;
use crate::store::ExperimentStore;
use crate::workload::key_prefix;

/// Reuse the oldest pooled API key, or provision and pool a new one.
///
/// Failing to read or write the pool only costs reuse; failing to
/// provision is fatal.
pub async fn load_or_create_key(store: &dyn ExperimentStore, sim: &dyn SimService) -> Result<String> {
    match store.peek_key() {
        Ok(Some(key)) => {
            tracing::info!(key = %key_prefix(&key), "reusing pooled key");
            return Ok(key);
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "could not read key pool"),
    }

    let key = sim
        .provision_key()
        .await
        .map_err(ExperimentError::Provisioning)?;
    tracing::info!(key = %key_prefix(&key), "provisioned new key");

    if let Err(e) = store.push_key(&key) {
        tracing::warn!(error = %e, "could not save key to pool");
    }
    Ok(key)
}
