//! One kernel connection: `connecting → hello → idle ⇄ busy → closed`.
//!
//! The reader loop never runs code itself. Execute requests go to a
//! per-connection queue drained by a single executor task, so a second
//! request arriving mid-execution waits for the first cycle to finish and
//! the two cycles' frames never interleave.
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::frames::{ExecuteRequest, InboundFrame, KernelState, OutboundFrame, Outgoing};
use super::store::{KernelSession, Notebook};
use super::{KernelContext, CLOSE_NOT_FOUND};
use crate::environment::Manifest;
use crate::output::{ErrorOutput, ExecutionResult, ExecutionStatus};
use crate::sandbox::{EngineError, ExecutionRequest, Language};

/// Serves one connection until the client goes away.
///
/// `inbound` carries raw text messages from the client; everything for the
/// client goes to `outbound`. The caller owns the actual transport.
pub async fn serve_connection(
    ctx: KernelContext,
    session_id: String,
    mut inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<Outgoing>,
) {
    let Some(session) = ctx
        .sessions
        .list_sessions()
        .await
        .into_iter()
        .find(|session| session.id == session_id)
    else {
        warn!("Rejecting connection: unknown session {session_id}");
        reject(&outbound, "SessionNotFound", format!("session {session_id} does not exist"));
        return;
    };
    if !session.is_open() {
        warn!("Rejecting connection: session {session_id} is closed");
        reject(&outbound, "SessionNotFound", format!("session {session_id} is closed"));
        return;
    }

    match ctx.store.get(&session.notebook_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            warn!(
                "Rejecting session {session_id}: notebook {} not found",
                session.notebook_id
            );
            reject(
                &outbound,
                "NotebookNotFound",
                format!("notebook {} does not exist", session.notebook_id),
            );
            return;
        }
        Err(e) => {
            error!("Rejecting session {session_id}: {e}");
            reject(&outbound, "NotebookNotFound", e.to_string());
            return;
        }
    }

    info!(
        "Session {session_id} connected to notebook {}",
        session.notebook_id
    );
    send(
        &outbound,
        OutboundFrame::Hello {
            notebook_id: session.notebook_id.clone(),
            session_id: session.id.clone(),
        },
    );

    let (queue, pending) = mpsc::unbounded_channel::<ExecuteRequest>();
    let executor = tokio::spawn(run_executor(
        ctx.clone(),
        session.clone(),
        pending,
        outbound.clone(),
    ));

    while let Some(raw) = inbound.recv().await {
        match InboundFrame::parse(&raw) {
            Ok(InboundFrame::ExecuteRequest(request)) => {
                debug!("Queued execution of cell {}", request.cell_id);
                if queue.send(request).is_err() {
                    error!("Executor for session {session_id} stopped; closing connection");
                    break;
                }
            }
            Ok(InboundFrame::InterruptRequest(_)) => {
                // Acknowledged only: running code is not cancelled
                debug!("Interrupt requested for session {session_id}");
                send(&outbound, OutboundFrame::status(KernelState::Idle));
            }
            Err(message) => {
                warn!("Malformed frame on session {session_id}: {message}");
                send(&outbound, OutboundFrame::error(None, "ProtocolError", message));
            }
        }
    }

    // Let accepted requests finish so their results are persisted
    drop(queue);
    if let Err(e) = executor.await {
        error!("Executor for session {session_id} failed: {e}");
    }

    ctx.registry.evict(&session_id);
    ctx.sessions.close_session(&session_id).await;
    info!("Session {session_id} disconnected");
}

fn send(outbound: &mpsc::UnboundedSender<Outgoing>, frame: OutboundFrame) {
    if outbound.send(Outgoing::Frame(frame)).is_err() {
        debug!("Dropping frame for a closed connection");
    }
}

fn reject(outbound: &mpsc::UnboundedSender<Outgoing>, ename: &str, message: String) {
    send(outbound, OutboundFrame::error(None, ename, message.clone()));
    let close = Outgoing::Close {
        code: CLOSE_NOT_FOUND,
        reason: message,
    };
    if outbound.send(close).is_err() {
        debug!("Connection closed before the rejection was sent");
    }
}

async fn run_executor(
    ctx: KernelContext,
    session: KernelSession,
    mut pending: mpsc::UnboundedReceiver<ExecuteRequest>,
    outbound: mpsc::UnboundedSender<Outgoing>,
) {
    let mut execution_count = 0u64;
    while let Some(request) = pending.recv().await {
        execution_count += 1;
        run_cycle(&ctx, &session, request, execution_count, &outbound).await;
    }
}

/// What the cell runs with, resolved from the request, the cell and the notebook.
struct CellPlan {
    language: Language,
    timeout_ms: u64,
    manifest: Manifest,
}

impl CellPlan {
    fn resolve(request: &ExecuteRequest, notebook: Option<&Notebook>, default_timeout_ms: u64) -> Self {
        let cell = notebook.and_then(|nb| nb.cell(&request.cell_id));

        let language = request
            .language
            .or_else(|| cell.and_then(|c| c.language.as_deref()).and_then(Language::parse))
            .or_else(|| notebook.and_then(|nb| nb.language.as_deref()).and_then(Language::parse))
            .unwrap_or_default();

        let timeout_ms = request
            .timeout_ms
            .or_else(|| {
                cell.and_then(|c| c.metadata.get("timeoutMs"))
                    .and_then(Value::as_u64)
                    .filter(|ms| *ms > 0)
            })
            .unwrap_or(default_timeout_ms);

        let manifest = notebook
            .map(|nb| Manifest::new(nb.dependencies.iter()))
            .unwrap_or_default();

        Self {
            language,
            timeout_ms,
            manifest,
        }
    }
}

async fn run_cycle(
    ctx: &KernelContext,
    session: &KernelSession,
    request: ExecuteRequest,
    execution_count: u64,
    outbound: &mpsc::UnboundedSender<Outgoing>,
) {
    let cell_id = request.cell_id.clone();
    send(outbound, OutboundFrame::status(KernelState::Busy));
    let started = Utc::now();

    let notebook = match ctx.store.get(&session.notebook_id).await {
        Ok(notebook) => notebook,
        Err(e) => {
            warn!("Could not reload notebook {}: {e}", session.notebook_id);
            None
        }
    };
    let plan = CellPlan::resolve(&request, notebook.as_ref(), ctx.default_timeout_ms);
    info!(
        "Executing cell {cell_id} ({}, timeout {} ms) on session {}",
        plan.language.as_str(),
        plan.timeout_ms,
        session.id
    );

    let result = execute_streaming(
        ctx,
        session,
        ExecutionRequest {
            cell_id: cell_id.clone(),
            code: request.code.clone(),
            language: plan.language,
            notebook_id: session.notebook_id.clone(),
            manifest: plan.manifest.clone(),
            timeout_ms: Some(plan.timeout_ms),
        },
        outbound,
    )
    .await
    .unwrap_or_else(|e| failure_result(ctx, session, e, started));

    // Streams already went out live
    for output in result.outputs.iter().filter(|output| !output.is_stream()) {
        send(outbound, OutboundFrame::from_output(&cell_id, output));
    }
    send(
        outbound,
        OutboundFrame::ExecuteReply {
            cell_id: cell_id.clone(),
            status: result.status,
            exec_time_ms: result.exec_time_ms(),
        },
    );
    send(outbound, OutboundFrame::status(KernelState::Idle));
    info!(
        "Cell {cell_id} finished with status {:?} in {} ms",
        result.status,
        result.exec_time_ms()
    );

    persist(ctx, session, &request, plan.language, &result, execution_count).await;
}

/// Runs the request, relaying stream chunks as frames while it is in flight.
async fn execute_streaming(
    ctx: &KernelContext,
    session: &KernelSession,
    request: ExecutionRequest,
    outbound: &mpsc::UnboundedSender<Outgoing>,
) -> Result<ExecutionResult, EngineError> {
    let engine = ctx.registry.get_or_create(&session.id)?;
    let cell_id = request.cell_id.clone();
    let (sink, mut chunks) = mpsc::unbounded_channel();

    let execution = engine.execute(request, Some(sink));
    tokio::pin!(execution);

    let outcome = loop {
        tokio::select! {
            biased;
            Some(chunk) = chunks.recv() => {
                send(outbound, OutboundFrame::Stream { cell_id: cell_id.clone(), name: chunk.name, text: chunk.text });
            }
            outcome = &mut execution => break outcome,
        }
    };
    while let Ok(chunk) = chunks.try_recv() {
        send(
            outbound,
            OutboundFrame::Stream {
                cell_id: cell_id.clone(),
                name: chunk.name,
                text: chunk.text,
            },
        );
    }
    outcome
}

fn failure_result(
    ctx: &KernelContext,
    session: &KernelSession,
    error: EngineError,
    started: chrono::DateTime<Utc>,
) -> ExecutionResult {
    match error {
        EngineError::Environment(e) => {
            error!("Environment preparation failed for notebook {}: {e}", session.notebook_id);
            ExecutionResult::failed(
                ExecutionStatus::Error,
                ErrorOutput::new("EnvironmentError", e.to_string()),
                started,
            )
        }
        other => {
            error!("Execution engine lost for session {}: {other}", session.id);
            // The next request starts a fresh engine
            ctx.registry.evict(&session.id);
            ExecutionResult::failed(
                ExecutionStatus::Aborted,
                ErrorOutput::new("KernelError", other.to_string()),
                started,
            )
        }
    }
}

/// Writes the cell's source and outcome back, failed runs included.
async fn persist(
    ctx: &KernelContext,
    session: &KernelSession,
    request: &ExecuteRequest,
    language: Language,
    result: &ExecutionResult,
    execution_count: u64,
) {
    let cell_id = request.cell_id.clone();
    let source = request.code.clone();
    let outputs: Vec<Value> = result
        .outputs
        .iter()
        .filter_map(|output| serde_json::to_value(output).ok())
        .collect();
    let execution = json!({
        "status": result.status,
        "started": result.started,
        "ended": result.ended,
        "execTimeMs": result.exec_time_ms(),
        "executionCount": execution_count,
    });

    let edit = Box::new(move |notebook: &mut Notebook| {
        let cell = notebook.upsert_cell(&cell_id);
        cell.source = source;
        cell.language = Some(language.as_str().to_string());
        cell.outputs = outputs;
        cell.metadata.insert("execution".to_string(), execution);
    });

    match ctx.store.update(&session.notebook_id, edit).await {
        Ok(Some(_)) => {}
        Ok(None) => warn!(
            "Notebook {} disappeared; cell {} not saved",
            session.notebook_id, request.cell_id
        ),
        Err(e) => error!("Failed to persist cell {}: {e}", request.cell_id),
    }
}
