pub mod config;
pub mod credentials;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod pacer;
pub mod sim;
pub mod store;
pub mod workload;
pub mod workspace;

#[cfg(test)]
mod testing;

pub use error::{ExperimentError, Result};
