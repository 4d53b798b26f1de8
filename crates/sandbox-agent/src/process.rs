use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tokio::process::Command;

use crate::{Result, SandboxError};

// ─── SandboxJob ───────────────────────────────────────────────────────────

/// Everything needed to launch one workload's sandbox.
#[derive(Debug, Clone)]
pub struct SandboxJob {
    pub agent_id: String,
    /// Isolated workspace, mounted read-write at `/workspace`.
    pub workspace: PathBuf,
    /// Intent file name inside the workspace, appended to the system prompt.
    pub intent_file: String,
    pub prompt: String,
    pub max_turns: u32,
    /// Per-workload log directory (`stdout.log`, `token_usage.jsonl`).
    pub log_dir: PathBuf,
}

// ─── Launcher ─────────────────────────────────────────────────────────────

/// Builds the command that starts a sandbox for a job.
///
/// Secret material never appears in the returned command's arguments; it is
/// only reachable through `env_file`.
pub trait Launcher: Send + Sync {
    /// Program name, for error messages.
    fn program(&self) -> &str;

    fn command(&self, job: &SandboxJob, env_file: &Path) -> Command;
}

/// Launches the agent CLI inside a throwaway Docker container.
#[derive(Debug, Clone)]
pub struct DockerLauncher {
    pub image: String,
    /// Hostname the container uses to reach the model router on the host.
    pub router_host: String,
}

impl Launcher for DockerLauncher {
    fn program(&self) -> &str {
        "docker"
    }

    fn command(&self, job: &SandboxJob, env_file: &Path) -> Command {
        let mut cmd = Command::new("docker");
        cmd.args(docker_args(self, job, env_file));
        cmd
    }
}

fn docker_args(launcher: &DockerLauncher, job: &SandboxJob, env_file: &Path) -> Vec<String> {
    vec![
        "run".into(),
        "--rm".into(),
        "--env-file".into(),
        env_file.display().to_string(),
        "-v".into(),
        format!("{}:/workspace", job.workspace.display()),
        "-w".into(),
        "/workspace".into(),
        "--add-host".into(),
        format!("{}:host-gateway", launcher.router_host),
        launcher.image.clone(),
        "--dangerously-skip-permissions".into(),
        "--max-turns".into(),
        job.max_turns.to_string(),
        "--output-format".into(),
        "stream-json".into(),
        "--verbose".into(),
        "--append-system-prompt-file".into(),
        job.intent_file.clone(),
        "-p".into(),
        job.prompt.clone(),
    ]
}

// ─── EnvFile ──────────────────────────────────────────────────────────────

/// A private (`0600`) temporary `KEY=value` file handed to the sandbox
/// runtime, so secrets stay out of the process listing.
///
/// The file is deleted when the guard is dropped or [`EnvFile::remove`] is
/// called, whichever comes first.
#[derive(Debug)]
pub struct EnvFile {
    file: Option<NamedTempFile>,
    path: PathBuf,
}

impl EnvFile {
    pub fn create(vars: &[(String, String)]) -> Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("intent-env-")
            .suffix(".env")
            .tempfile()
            .map_err(SandboxError::EnvFile)?;

        for (key, value) in vars {
            if key.contains('\n') || key.contains('=') || value.contains('\n') {
                return Err(SandboxError::Process(format!(
                    "env var '{key}' cannot be written to an env file"
                )));
            }
            writeln!(file, "{key}={value}").map_err(SandboxError::EnvFile)?;
        }
        file.flush().map_err(SandboxError::EnvFile)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))
                .map_err(SandboxError::EnvFile)?;
        }

        let path = file.path().to_path_buf();
        Ok(Self {
            file: Some(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_removed(&self) -> bool {
        self.file.is_none()
    }

    /// Delete the file now. Idempotent.
    pub fn remove(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.close() {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to delete env file");
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
