//! Per-notebook dependency sandboxes.
//!
//! Every notebook gets its own directory under the sandbox root. It holds the
//! dependency manifest, an entry file, the installed packages and a sidecar
//! recording the fingerprint of the last successful preparation, so that
//! "nothing changed, skip the install" survives process restarts.
//!
//! Layout:
//!   {sandbox_root}/{notebook_id}/package.json       : manifest
//!   {sandbox_root}/{notebook_id}/index.js           : entry file (written once)
//!   {sandbox_root}/{notebook_id}/.kernel-env.json   : sidecar {fingerprint, preparedAt}
//!   {sandbox_root}/{notebook_id}/node_modules/      : installed packages
//!
//! Preparations for one notebook run strictly one after another: each
//! notebook has an explicit FIFO job queue drained by a single task. A queue
//! lives only while it has work, so idle notebooks hold no task or entry.
pub mod installer;
pub mod manifest;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub use installer::{CommandInstaller, Installer};
pub use manifest::Manifest;

const MANIFEST_FILE: &str = "package.json";
const ENTRY_FILE: &str = "index.js";
const SIDECAR_FILE: &str = ".kernel-env.json";
const MODULES_DIR: &str = "node_modules";
const LOCK_FILE: &str = "package-lock.json";

#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("invalid notebook id {0:?}")]
    InvalidNotebookId(String),
    #[error("failed to {action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("dependency install failed (`{command}` exited with {status}){}", stderr_suffix(.stderr))]
    Install {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("dependency manager must be created inside a tokio runtime")]
    NoRuntime,
    #[error("preparation queue for notebook {0} shut down")]
    QueueClosed(String),
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

fn io_error(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> EnvironmentError {
    let path = path.to_path_buf();
    move |source| EnvironmentError::Io {
        action,
        path,
        source,
    }
}

/// A directory that is ready to execute code against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedEnvironment {
    pub notebook_id: String,
    pub fingerprint: String,
    /// Canonical absolute path of the sandbox directory
    pub directory: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Sidecar {
    fingerprint: String,
    prepared_at: DateTime<Utc>,
}

struct PrepareJob {
    manifest: Manifest,
    reply: oneshot::Sender<Result<PreparedEnvironment, EnvironmentError>>,
}

/// Notebook id → sender of its live queue. Jobs are sent with the lock held.
type Queues = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<PrepareJob>>>>;

/// Materializes and memoizes per-notebook dependency sandboxes.
pub struct EnvironmentManager {
    root: PathBuf,
    installer: Arc<dyn Installer>,
    /// Queue consumers are spawned here, not on the caller's runtime: engines
    /// call in from their own short-lived runtimes.
    runtime: tokio::runtime::Handle,
    queues: Queues,
}

impl EnvironmentManager {
    pub fn new(root: impl Into<PathBuf>, installer: Arc<dyn Installer>) -> Result<Self, EnvironmentError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| EnvironmentError::NoRuntime)?;
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(io_error("create", &root))?;
        let root = std::fs::canonicalize(&root).map_err(io_error("resolve", &root))?;
        info!("Sandbox root at {}", root.display());
        Ok(Self {
            root,
            installer,
            runtime,
            queues: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sandbox directory of a notebook (may not exist yet).
    pub fn directory_for(&self, notebook_id: &str) -> Result<PathBuf, EnvironmentError> {
        validate_notebook_id(notebook_id)?;
        Ok(self.root.join(notebook_id))
    }

    /// Brings the notebook's sandbox in line with `manifest`.
    ///
    /// Queued behind any preparation already pending for the same notebook.
    /// Installs only when the fingerprint differs from the sidecar's or
    /// nothing is installed yet.
    pub async fn prepare(
        &self,
        notebook_id: &str,
        manifest: &Manifest,
    ) -> Result<PreparedEnvironment, EnvironmentError> {
        let directory = self.directory_for(notebook_id)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = PrepareJob {
            manifest: manifest.clone(),
            reply: reply_tx,
        };

        self.enqueue(notebook_id, &directory, job)?;

        reply_rx
            .await
            .map_err(|_| EnvironmentError::QueueClosed(notebook_id.to_string()))?
    }

    fn enqueue(&self, notebook_id: &str, directory: &Path, job: PrepareJob) -> Result<(), EnvironmentError> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let job = match queues.get(notebook_id) {
            Some(queue) => match queue.send(job) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(job)) => {
                    warn!("Preparation queue for {notebook_id} was gone, restarting it");
                    job
                }
            },
            None => job,
        };

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        queue_tx
            .send(job)
            .map_err(|_| EnvironmentError::QueueClosed(notebook_id.to_string()))?;
        self.runtime.spawn(run_queue(
            notebook_id.to_string(),
            directory.to_path_buf(),
            self.installer.clone(),
            self.queues.clone(),
            queue_tx.downgrade(),
            queue_rx,
        ));
        queues.insert(notebook_id.to_string(), queue_tx);
        Ok(())
    }

    #[cfg(test)]
    fn live_queues(&self) -> usize {
        self.queues.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Only plain ids may become path components.
fn validate_notebook_id(notebook_id: &str) -> Result<(), EnvironmentError> {
    let valid = !notebook_id.is_empty()
        && notebook_id.len() <= 128
        && notebook_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(EnvironmentError::InvalidNotebookId(notebook_id.to_string()))
    }
}

/// Single consumer of one notebook's preparation queue.
///
/// Retires once the queue is empty. Callers only send while holding the
/// `queues` lock, so checking and unregistering under that lock cannot strand
/// a job.
async fn run_queue(
    notebook_id: String,
    directory: PathBuf,
    installer: Arc<dyn Installer>,
    queues: Queues,
    own: mpsc::WeakUnboundedSender<PrepareJob>,
    mut jobs: mpsc::UnboundedReceiver<PrepareJob>,
) {
    debug!("Preparation queue started for {notebook_id}");
    while let Some(job) = jobs.recv().await {
        let result = prepare_directory(&notebook_id, &directory, &job.manifest, installer.as_ref()).await;
        if let Err(e) = &result {
            warn!("Environment preparation failed for {notebook_id}: {e}");
        }
        if job.reply.send(result).is_err() {
            debug!("Preparation result for {notebook_id} dropped (caller went away)");
        }

        let mut live = queues.lock().unwrap_or_else(|e| e.into_inner());
        if jobs.is_empty() {
            let registered = match (live.get(&notebook_id), own.upgrade()) {
                (Some(queue), Some(own)) => queue.same_channel(&own),
                _ => false,
            };
            if registered {
                live.remove(&notebook_id);
            }
            break;
        }
    }
    debug!("Preparation queue stopped for {notebook_id}");
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn read_sidecar(directory: &Path) -> Option<String> {
    let raw = tokio::fs::read_to_string(directory.join(SIDECAR_FILE)).await.ok()?;
    match serde_json::from_str::<Sidecar>(&raw) {
        Ok(sidecar) => Some(sidecar.fingerprint),
        Err(e) => {
            warn!("Ignoring unreadable sidecar in {}: {e}", directory.display());
            None
        }
    }
}

async fn prepare_directory(
    notebook_id: &str,
    directory: &Path,
    manifest: &Manifest,
    installer: &dyn Installer,
) -> Result<PreparedEnvironment, EnvironmentError> {
    tokio::fs::create_dir_all(directory)
        .await
        .map_err(io_error("create", directory))?;
    let directory = tokio::fs::canonicalize(directory)
        .await
        .map_err(io_error("resolve", directory))?;

    let package = serde_json::json!({
        "name": format!("notebook-{}", notebook_id.to_lowercase()),
        "private": true,
        "dependencies": manifest.entries(),
    });
    let manifest_path = directory.join(MANIFEST_FILE);
    let package = serde_json::to_string_pretty(&package).unwrap_or_default();
    tokio::fs::write(&manifest_path, package)
        .await
        .map_err(io_error("write", &manifest_path))?;

    let entry_path = directory.join(ENTRY_FILE);
    if !exists(&entry_path).await {
        tokio::fs::write(&entry_path, "module.exports = {};\n")
            .await
            .map_err(io_error("write", &entry_path))?;
    }

    let fingerprint = manifest.fingerprint();
    let previous = read_sidecar(&directory).await;
    let modules = directory.join(MODULES_DIR);
    let sidecar_path = directory.join(SIDECAR_FILE);

    if manifest.is_empty() {
        if exists(&modules).await {
            tokio::fs::remove_dir_all(&modules)
                .await
                .map_err(io_error("remove", &modules))?;
            info!("Removed installed packages for {notebook_id}");
        }
        let lock_path = directory.join(LOCK_FILE);
        if exists(&lock_path).await {
            tokio::fs::remove_file(&lock_path)
                .await
                .map_err(io_error("remove", &lock_path))?;
        }
        if exists(&sidecar_path).await {
            tokio::fs::remove_file(&sidecar_path)
                .await
                .map_err(io_error("remove", &sidecar_path))?;
        }
    } else {
        let installed = exists(&modules).await;
        if previous.as_deref() != Some(fingerprint.as_str()) || !installed {
            info!(
                "Dependencies changed for {notebook_id} ({} → {fingerprint}), installing",
                previous.as_deref().unwrap_or("none")
            );
            installer.install(&directory, manifest).await?;
        } else {
            debug!("Dependencies for {notebook_id} up to date ({fingerprint})");
        }

        let sidecar = Sidecar {
            fingerprint: fingerprint.clone(),
            prepared_at: Utc::now(),
        };
        let sidecar = serde_json::to_string(&sidecar).unwrap_or_default();
        tokio::fs::write(&sidecar_path, sidecar)
            .await
            .map_err(io_error("write", &sidecar_path))?;
    }

    Ok(PreparedEnvironment {
        notebook_id: notebook_id.to_string(),
        fingerprint,
        directory,
    })
}
