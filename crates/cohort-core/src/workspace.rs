use crate::error::{ExperimentError, Result};
use crate::workload::Workload;
use std::path::{Path, PathBuf};

/// Builds and removes the isolated directory each workload runs in.
pub trait WorkspacePreparer: Send + Sync {
    /// Create a fresh workspace for `workload`, wired to `key` and its city.
    fn prepare(&self, workload: &Workload, key: &str) -> Result<PathBuf>;

    /// Remove a workspace. Best-effort.
    fn discard(&self, path: &Path);
}

const KEY_PLACEHOLDER: &str = "HS_API_KEY_PLACEHOLDER";
const CITY_PLACEHOLDER: &str = "CITY_ID_PLACEHOLDER";

/// Copies a template tree plus the workload's intent file into a new
/// temporary directory.
#[derive(Debug, Clone)]
pub struct TemplateWorkspace {
    pub templates_dir: PathBuf,
    pub intents_dir: PathBuf,
    /// Parent of every workspace; the system temp dir unless overridden.
    pub root: PathBuf,
}

impl TemplateWorkspace {
    pub fn new(templates_dir: PathBuf, intents_dir: PathBuf) -> Self {
        Self {
            templates_dir,
            intents_dir,
            root: std::env::temp_dir(),
        }
    }

    fn build(&self, workload: &Workload, key: &str) -> std::io::Result<PathBuf> {
        let dir = self.root.join(format!(
            "intent-{}-{}",
            workload.agent_id,
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::create_dir_all(&dir)?;

        if let Err(e) = self.populate(&dir, workload, key) {
            let _ = std::fs::remove_dir_all(&dir);
            return Err(e);
        }
        Ok(dir)
    }

    fn populate(&self, dir: &Path, workload: &Workload, key: &str) -> std::io::Result<()> {
        copy_tree(&self.templates_dir, dir)?;
        std::fs::copy(
            self.intents_dir.join(&workload.intent.file),
            dir.join(&workload.intent.file),
        )?;
        substitute(&dir.join(".claude").join("mcp.json"), KEY_PLACEHOLDER, key)?;
        substitute(&dir.join("CLAUDE.md"), CITY_PLACEHOLDER, &workload.city_id)?;
        Ok(())
    }
}

impl WorkspacePreparer for TemplateWorkspace {
    fn prepare(&self, workload: &Workload, key: &str) -> Result<PathBuf> {
        self.build(workload, key)
            .map_err(|source| ExperimentError::WorkspacePrep {
                agent_id: workload.agent_id.clone(),
                source,
            })
    }

    fn discard(&self, path: &Path) {
        if let Err(e) = std::fs::remove_dir_all(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove workspace");
            }
        }
    }
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Replace `placeholder` in `path` if the file exists.
fn substitute(path: &Path, placeholder: &str, value: &str) -> std::io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let content = std::fs::read_to_string(path)?;
    if content.contains(placeholder) {
        std::fs::write(path, content.replace(placeholder, value))?;
    }
    Ok(())
}
