//! Credential discovery and the project lifecycle driven by it.
//!
//! A watcher walks a directory (non-recursively) for JSON credential files,
//! validates each one, and diffs the resulting `{project -> path}` set
//! against the live projects: removed or invalidated credentials fire the
//! project's cancellation token, new ones start a pipeline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::common::error::RunnerError;

pub const SCAN_INTERVAL: Duration = Duration::from_secs(15);
pub const FIRST_SCAN_INTERVAL: Duration = Duration::from_secs(1);
pub const VALIDATE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct CredentialFile {
    #[serde(rename = "type", default)]
    cred_type: String,
    #[serde(rename = "project_id", default)]
    project: String,
}

/// Validates a single credential file and yields the project it grants
/// access to.  Backend implementations construct a throwaway client here;
/// the bundled validator checks the file shape only.
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    async fn validate(&self, path: &Path, timeout: Duration) -> crate::Result<String>;
}

pub struct JsonValidator;

#[async_trait]
impl CredentialValidator for JsonValidator {
    async fn validate(&self, path: &Path, _timeout: Duration) -> crate::Result<String> {
        let raw = tokio::fs::read(path)
            .await
            .map_err(|e| RunnerError::Credential(format!("{}: {e}", path.display())))?;
        let cred: CredentialFile = serde_json::from_slice(&raw)
            .map_err(|e| RunnerError::Credential(format!("{}: {e}", path.display())))?;
        if cred.project.is_empty() {
            return Err(RunnerError::Credential(format!(
                "bad file format for credentials {}",
                path.display()
            )));
        }
        log::trace!("validated {} credential {}", cred.cred_type, path.display());
        Ok(cred.project)
    }
}

/// Starts the per-project pipeline (inventory + scheduler + consumer).
pub trait ProjectSpawner: Send + Sync {
    fn spawn(&self, project: &str, creds: &Path, cancel: CancellationToken);
}

struct ProjectHandle {
    cancel: CancellationToken,
    creds: PathBuf,
}

/// The live set of projects and their cancellation signals.
pub struct ProjectRegistry {
    parent: CancellationToken,
    projects: Mutex<HashMap<String, ProjectHandle>>,
}

impl ProjectRegistry {
    pub fn new(parent: CancellationToken) -> Self {
        ProjectRegistry {
            parent,
            projects: Mutex::new(HashMap::new()),
        }
    }

    pub fn live(&self) -> Vec<String> {
        let mut names: Vec<String> = self.projects.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Reconciles the live set against one scan result.  An empty scan is a
    /// no-op so that a briefly unreadable directory does not tear down
    /// running pipelines.
    pub fn lifecycle(&self, found: &HashMap<String, PathBuf>, spawner: &dyn ProjectSpawner) {
        if found.is_empty() {
            return;
        }

        let mut projects = self.projects.lock().unwrap();
        let gone: Vec<String> = projects
            .keys()
            .filter(|project| !found.contains_key(*project))
            .cloned()
            .collect();
        for project in gone {
            if let Some(handle) = projects.remove(&project) {
                handle.cancel.cancel();
                log::info!("project {project} no longer available");
            }
        }

        for (project, creds) in found {
            if projects.contains_key(project) {
                continue;
            }
            let cancel = self.parent.child_token();
            log::info!("started project {project}");
            spawner.spawn(project, creds, cancel.clone());
            projects.insert(
                project.clone(),
                ProjectHandle { cancel, creds: creds.clone() },
            );
        }
    }

    /// Drops a project whose pipeline ended on its own.
    pub fn forget(&self, project: &str) {
        self.projects.lock().unwrap().remove(project);
    }

    pub fn shutdown(&self) {
        let mut projects = self.projects.lock().unwrap();
        for (project, handle) in projects.drain() {
            log::debug!("stopping project {project}");
            handle.cancel.cancel();
        }
    }

    pub fn creds_for(&self, project: &str) -> Option<PathBuf> {
        self.projects
            .lock()
            .unwrap()
            .get(project)
            .map(|handle| handle.creds.clone())
    }
}

/// One scan pass: every `.json` file directly under `dir` that validates.
pub async fn scan_credentials(
    dir: &Path,
    validator: &dyn CredentialValidator,
    timeout: Duration,
) -> HashMap<String, PathBuf> {
    let mut found = HashMap::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            log::trace!("credential directory {}: {err}", dir.display());
            return found;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("json") {
            log::trace!("did not match {}", path.display());
            continue;
        }
        match validator.validate(&path, timeout).await {
            Ok(project) => {
                found.insert(project, path);
            }
            Err(err) => log::warn!("{err}"),
        }
    }

    if found.is_empty() {
        log::info!("no credentials found at {}", dir.display());
    }
    found
}

/// Watches a credential directory until cancelled, keeping the registry's
/// live set in step with the files on disk.
pub async fn watch(
    dir: PathBuf,
    scan_interval: Duration,
    validator: std::sync::Arc<dyn CredentialValidator>,
    registry: std::sync::Arc<ProjectRegistry>,
    spawner: std::sync::Arc<dyn ProjectSpawner>,
    cancel: CancellationToken,
) {
    // Until the directory appears the checks stay eager
    let mut pause = FIRST_SCAN_INTERVAL.min(scan_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                registry.shutdown();
                return;
            }
            _ = tokio::time::sleep(pause) => {}
        }

        if dir.is_dir() {
            pause = scan_interval;
            let found = scan_credentials(&dir, validator.as_ref(), VALIDATE_TIMEOUT).await;
            registry.lifecycle(&found, spawner.as_ref());
        } else {
            pause = FIRST_SCAN_INTERVAL.min(scan_interval);
        }
    }
}
