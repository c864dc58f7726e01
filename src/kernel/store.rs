//! Persistence collaborators: notebook documents and kernel sessions.
//!
//! The notebook schema is owned elsewhere. Only the fields the kernel reads or
//! writes are typed; everything else round-trips through `extra`.
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid notebook id {0:?}")]
    InvalidId(String),
    #[error("failed to {action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("notebook document {} is not valid: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notebook {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Package name → version range
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub cells: Vec<Cell>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub id: String,
    #[serde(rename = "type", default = "default_cell_type")]
    pub cell_type: String,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub outputs: Vec<Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_cell_type() -> String {
    "code".to_string()
}

impl Notebook {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            language: None,
            dependencies: BTreeMap::new(),
            cells: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn cell(&self, cell_id: &str) -> Option<&Cell> {
        self.cells.iter().find(|cell| cell.id == cell_id)
    }

    /// The cell with `cell_id`, appended as an empty code cell if missing.
    pub fn upsert_cell(&mut self, cell_id: &str) -> &mut Cell {
        let index = match self.cells.iter().position(|cell| cell.id == cell_id) {
            Some(index) => index,
            None => {
                self.cells.push(Cell::new(cell_id));
                self.cells.len() - 1
            }
        };
        &mut self.cells[index]
    }
}

impl Cell {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cell_type: default_cell_type(),
            source: String::new(),
            language: None,
            outputs: Vec::new(),
            metadata: Map::new(),
            extra: Map::new(),
        }
    }
}

/// An edit applied to a notebook while the store holds it.
pub type NotebookEdit = Box<dyn FnOnce(&mut Notebook) + Send>;

#[async_trait]
pub trait NotebookStore: Send + Sync {
    async fn get(&self, notebook_id: &str) -> Result<Option<Notebook>, StoreError>;
    async fn save(&self, notebook: &Notebook) -> Result<(), StoreError>;
    /// Loads, edits and saves a notebook with no other writer in between.
    ///
    /// Returns the saved document, or `None` if the notebook does not exist.
    async fn update(&self, notebook_id: &str, edit: NotebookEdit) -> Result<Option<Notebook>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelSession {
    pub id: String,
    pub notebook_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

impl KernelSession {
    pub fn is_open(&self) -> bool {
        self.status == SessionStatus::Open
    }
}

#[async_trait]
pub trait SessionManager: Send + Sync {
    async fn list_sessions(&self) -> Vec<KernelSession>;
    async fn close_session(&self, session_id: &str);
}

// ── File-backed notebooks ─────────────────────────────────

/// One `<id>.json` document per notebook under a directory.
pub struct FileNotebookStore {
    directory: PathBuf,
    /// Held for every save and across each read-modify-write
    write_lock: tokio::sync::Mutex<()>,
}

impl FileNotebookStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, notebook_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !notebook_id.is_empty()
            && notebook_id.len() <= 128
            && notebook_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidId(notebook_id.to_string()));
        }
        Ok(self.directory.join(format!("{notebook_id}.json")))
    }

    /// Caller must hold `write_lock`.
    async fn write(&self, notebook: &Notebook) -> Result<(), StoreError> {
        let path = self.path_for(&notebook.id)?;
        let content = serde_json::to_string_pretty(notebook).map_err(|source| StoreError::Parse {
            path: path.clone(),
            source,
        })?;

        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|source| StoreError::Io {
                action: "create",
                path: self.directory.clone(),
                source,
            })?;

        // Write then rename so readers never see a half-written document
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|source| StoreError::Io {
                action: "write",
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| StoreError::Io {
                action: "replace",
                path: path.clone(),
                source,
            })?;
        debug!("Saved notebook {} to {}", notebook.id, path.display());
        Ok(())
    }
}

#[async_trait]
impl NotebookStore for FileNotebookStore {
    async fn get(&self, notebook_id: &str) -> Result<Option<Notebook>, StoreError> {
        let path = self.path_for(notebook_id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    action: "read",
                    path,
                    source,
                })
            }
        };
        let notebook = serde_json::from_str(&content)
            .map_err(|source| StoreError::Parse { path, source })?;
        Ok(Some(notebook))
    }

    async fn save(&self, notebook: &Notebook) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.write(notebook).await
    }

    async fn update(&self, notebook_id: &str, edit: NotebookEdit) -> Result<Option<Notebook>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let Some(mut notebook) = self.get(notebook_id).await? else {
            return Ok(None);
        };
        edit(&mut notebook);
        self.write(&notebook).await?;
        Ok(Some(notebook))
    }
}

// ── In-memory sessions ────────────────────────────────────

#[derive(Default)]
pub struct InMemorySessionManager {
    sessions: Mutex<HashMap<String, KernelSession>>,
}

impl InMemorySessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_session(&self, notebook_id: &str) -> KernelSession {
        let session = KernelSession {
            id: uuid::Uuid::new_v4().to_string(),
            notebook_id: notebook_id.to_string(),
            status: SessionStatus::Open,
            created_at: Utc::now(),
        };
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(session.id.clone(), session.clone());
        }
        info!("Opened session {} for notebook {notebook_id}", session.id);
        session
    }
}

#[async_trait]
impl SessionManager for InMemorySessionManager {
    async fn list_sessions(&self) -> Vec<KernelSession> {
        self.sessions
            .lock()
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Marks the session closed; the record stays listed.
    async fn close_session(&self, session_id: &str) {
        let closed = self.sessions.lock().ok().is_some_and(|mut sessions| {
            match sessions.get_mut(session_id) {
                Some(session) if session.is_open() => {
                    session.status = SessionStatus::Closed;
                    true
                }
                _ => false,
            }
        });
        if closed {
            info!("Closed session {session_id}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_missing_notebook_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileNotebookStore::new(dir.path());
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_and_reload_keeps_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileNotebookStore::new(dir.path().join("notebooks"));
        std::fs::create_dir_all(store.directory()).unwrap();
        std::fs::write(
            store.directory().join("nb1.json"),
            json!({
                "id": "nb1",
                "title": "Exploration",
                "dependencies": {"zod": "3.22.0"},
                "cells": [{"id": "c1", "type": "markdown", "source": "# hi", "collapsed": true}]
            })
            .to_string(),
        )
        .unwrap();

        let mut notebook = store.get("nb1").await.unwrap().unwrap();
        assert_eq!(notebook.extra["title"], "Exploration");
        assert_eq!(notebook.dependencies["zod"], "3.22.0");
        assert_eq!(notebook.cells[0].cell_type, "markdown");

        notebook.upsert_cell("c2").source = "1 + 1".to_string();
        store.save(&notebook).await.unwrap();

        let reloaded = store.get("nb1").await.unwrap().unwrap();
        assert_eq!(reloaded, notebook);
        assert_eq!(reloaded.cells[0].extra["collapsed"], true);
        assert_eq!(reloaded.cells[1].cell_type, "code");
        assert!(!store.directory().join("nb1.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_invalid_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileNotebookStore::new(dir.path());
        assert!(matches!(store.get("../etc").await, Err(StoreError::InvalidId(_))));
        assert!(matches!(
            store.save(&Notebook::new("a/b")).await,
            Err(StoreError::InvalidId(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_document_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{").unwrap();
        let store = FileNotebookStore::new(dir.path());
        assert!(matches!(store.get("bad").await, Err(StoreError::Parse { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(FileNotebookStore::new(dir.path()));
        store.save(&Notebook::new("nb1")).await.unwrap();

        let writers: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .update(
                            "nb1",
                            Box::new(move |notebook: &mut Notebook| {
                                notebook.upsert_cell(&format!("c{i}")).source = i.to_string();
                            }),
                        )
                        .await
                })
            })
            .collect();
        for writer in writers {
            assert!(writer.await.unwrap().unwrap().is_some());
        }

        let saved = store.get("nb1").await.unwrap().unwrap();
        assert_eq!(saved.cells.len(), 16);
        for i in 0..16 {
            assert_eq!(saved.cell(&format!("c{i}")).unwrap().source, i.to_string());
        }
    }

    #[tokio::test]
    async fn test_update_missing_notebook_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileNotebookStore::new(dir.path());
        let updated = store
            .update("ghost", Box::new(|notebook: &mut Notebook| notebook.language = Some("ts".to_string())))
            .await
            .unwrap();
        assert!(updated.is_none());
        assert!(!dir.path().join("ghost.json").exists());
    }

    #[test]
    fn test_upsert_existing_cell() {
        let mut notebook = Notebook::new("nb");
        notebook.upsert_cell("c1").source = "a".to_string();
        notebook.upsert_cell("c1").source = "b".to_string();
        assert_eq!(notebook.cells.len(), 1);
        assert_eq!(notebook.cell("c1").unwrap().source, "b");
    }

    #[tokio::test]
    async fn test_sessions_open_list_close() {
        let sessions = InMemorySessionManager::new();
        let a = sessions.open_session("nb1");
        let b = sessions.open_session("nb1");
        assert_ne!(a.id, b.id);
        assert_eq!(sessions.list_sessions().await.len(), 2);

        sessions.close_session(&a.id).await;
        sessions.close_session(&a.id).await;
        let mut listed = sessions.list_sessions().await;
        listed.sort_by_key(|session| session.is_open());
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, a.id);
        assert_eq!(listed[0].status, SessionStatus::Closed);
        assert_eq!(listed[1], b);
        assert_eq!(serde_json::to_value(&listed[1]).unwrap()["status"], "open");
    }
}
