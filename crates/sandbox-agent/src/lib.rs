//! `sandbox-agent` — run one agent workload inside an isolated sandbox.
//!
//! The sandboxed program speaks `--output-format stream-json`: one JSON
//! event per line on its combined stdout/stderr. This crate launches it,
//! keeps a durable copy of every line, folds token usage out of the
//! structured events, and enforces a hard wall-clock deadline.
//!
//! # Architecture
//!
//! ```text
//! SandboxJob ──► Launcher        ← builds `docker run --env-file … <image> …`
//!                   │
//!                   ▼
//!              runner::run       ← owns the child's stdout; writes stdout.log
//!               │   │    │
//!               │   │    └─► Watchdog       ← owns the Child; kills at deadline
//!               │   └──────► periodic emit  ← ScopedTask, every emit_interval
//!               ▼
//!           UsageTracker         ← Mutex-guarded totals, snapshot-by-copy
//!               │
//!               ▼
//!   tracing (console) + JsonlSink (token_usage.jsonl)
//! ```
//!
//! Every failure inside [`runner::run`] is folded into a [`RunOutcome`];
//! nothing escapes to abort sibling workloads.

pub mod error;
pub mod event;
pub mod jsonl;
pub mod process;
pub mod runner;
pub mod scoped;
pub mod usage;
pub mod watchdog;


pub use error::SandboxError;
pub use event::{TokenUsage, UsageEvent, UsageLocation};
pub use jsonl::JsonlSink;
pub use process::{DockerLauncher, EnvFile, Launcher, SandboxJob};
pub use runner::{run as run_sandbox, FailureReason, RunOutcome, RunReport, RunSettings};
pub use scoped::{ScopedTask, StopSignal};
pub use usage::{UsageSnapshot, UsageTracker};
pub use watchdog::{Verdict, Watchdog};

/// Convenience `Result` alias for this crate.
pub type Result<T> = std::result::Result<T, SandboxError>;
