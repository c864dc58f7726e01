//! HTTP edge: the kernel channel WebSocket plus the session bootstrap route.
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::kernel::{serve_connection, InMemorySessionManager, KernelContext, Outgoing};

#[derive(Clone)]
pub struct AppState {
    pub kernel: KernelContext,
    /// Concrete handle so the HTTP layer can open sessions
    pub sessions: Arc<InMemorySessionManager>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/notebooks/{notebook_id}/sessions", post(create_session))
        .route("/api/kernels/{session_id}/channels", get(channels))
        .with_state(state)
}

/// Serves until Ctrl-C.
pub async fn serve(address: &str, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received, exiting");
        })
        .await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn create_session(
    State(state): State<AppState>,
    Path(notebook_id): Path<String>,
) -> Response {
    match state.kernel.store.get(&notebook_id).await {
        Ok(Some(_)) => {
            let session = state.sessions.open_session(&notebook_id);
            (StatusCode::CREATED, Json(session)).into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("notebook {notebook_id} does not exist")})),
        )
            .into_response(),
        Err(e) => {
            warn!("Cannot open session for {notebook_id}: {e}");
            (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()}))).into_response()
        }
    }
}

async fn channels(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| bridge(socket, state.kernel, session_id))
}

/// Pumps one socket into [`serve_connection`]: a reader task feeds inbound
/// text, a writer task drains outgoing frames, whichever ends first wins.
async fn bridge(socket: WebSocket, ctx: KernelContext, session_id: String) {
    let (mut sink, mut stream) = socket.split();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outgoing>();

    let connection = tokio::spawn(serve_connection(
        ctx,
        session_id.clone(),
        inbound_rx,
        outbound_tx,
    ));

    let mut read_handle = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if inbound_tx.send(text.to_string()).is_err() {
                        break;
                    }
                }
                Ok(Message::Binary(_)) => debug!("Ignoring binary message"),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("Socket read error: {e}");
                    break;
                }
            }
        }
    });

    let mut write_handle = tokio::spawn(async move {
        while let Some(outgoing) = outbound_rx.recv().await {
            let message = match outgoing {
                Outgoing::Frame(frame) => match serde_json::to_string(&frame) {
                    Ok(text) => Message::Text(text.into()),
                    Err(e) => {
                        error!("Failed to encode frame: {e}");
                        continue;
                    }
                },
                Outgoing::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut read_handle => write_handle.abort(),
        _ = &mut write_handle => read_handle.abort(),
    }

    if let Err(e) = connection.await {
        error!("Connection task for session {session_id} failed: {e}");
    }
    debug!("Socket for session {session_id} closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::tests::FakeInstaller;
    use crate::environment::EnvironmentManager;
    use crate::kernel::store::{FileNotebookStore, Notebook, NotebookStore, SessionManager};
    use crate::kernel::KernelRegistry;
    use crate::sandbox::EngineConfig;

    async fn state(dir: &tempfile::TempDir) -> AppState {
        let store = Arc::new(FileNotebookStore::new(dir.path().join("notebooks")));
        store.save(&Notebook::new("nb1")).await.unwrap();
        let envs = Arc::new(
            EnvironmentManager::new(dir.path().join("sandboxes"), Arc::new(FakeInstaller::default()))
                .unwrap(),
        );
        let sessions = Arc::new(InMemorySessionManager::new());
        AppState {
            kernel: KernelContext {
                store,
                sessions: sessions.clone(),
                registry: Arc::new(KernelRegistry::new(envs, EngineConfig::default())),
                default_timeout_ms: 1_000,
            },
            sessions,
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_create_session_for_existing_notebook() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir).await;

        let response = create_session(State(state.clone()), Path("nb1".to_string())).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["notebookId"], "nb1");

        let sessions = state.kernel.sessions.list_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(body["id"], sessions[0].id);
    }

    #[tokio::test]
    async fn test_create_session_unknown_notebook() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir).await;

        let response = create_session(State(state.clone()), Path("ghost".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = create_session(State(state.clone()), Path("../x".to_string())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.kernel.sessions.list_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_healthz() {
        assert_eq!(healthz().await, "ok");
    }
}
