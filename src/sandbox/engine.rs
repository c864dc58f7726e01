use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use url::Url;

use super::ops::{self, RunSlot, SandboxCapabilities};
use super::transpile;
use super::{EngineConfig, EngineError, ExecutionRequest};
use crate::environment::{EnvironmentError, EnvironmentManager, Manifest, PreparedEnvironment};
use crate::output::{
    DisplayKind, ErrorOutput, ExecutionResult, ExecutionStatus, OutputEvent, StreamSink,
};

const BOOTSTRAP: &str = include_str!("bootstrap.js");

enum EngineCommand {
    Execute {
        request: ExecutionRequest,
        stream: Option<StreamSink>,
        reply: oneshot::Sender<Result<ExecutionResult, EnvironmentError>>,
    },
}

/// Handle to a session's execution engine.
///
/// The isolate lives on a dedicated thread and works through commands one at
/// a time, so two executions of the same session never interleave. Dropping
/// the last handle stops the thread once the running command finishes.
pub struct KernelEngine {
    session_id: String,
    commands: mpsc::UnboundedSender<EngineCommand>,
}

impl KernelEngine {
    pub fn spawn(
        session_id: &str,
        environments: Arc<EnvironmentManager>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let (commands, inbox) = mpsc::unbounded_channel();
        let thread_session = session_id.to_string();

        std::thread::Builder::new()
            .name(format!("kernel-{session_id}"))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Engine runtime for session {thread_session} failed to start: {e}");
                        return;
                    }
                };
                let bootstrap_session = thread_session.clone();
                rt.block_on(async move {
                    match EngineWorker::new(environments, config) {
                        Ok(worker) => worker.run(inbox).await,
                        Err(e) => error!("Engine bootstrap for session {bootstrap_session} failed: {e}"),
                    }
                });
                debug!("Engine thread for session {thread_session} exited");
            })
            .map_err(EngineError::Spawn)?;

        info!("Started execution engine for session {session_id}");
        Ok(Self {
            session_id: session_id.to_string(),
            commands,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Runs one cell. Stream output is forwarded to `stream` as it happens and
    /// also collected in the returned result.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        stream: Option<StreamSink>,
    ) -> Result<ExecutionResult, EngineError> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(EngineCommand::Execute {
                request,
                stream,
                reply,
            })
            .map_err(|_| EngineError::Unavailable(self.session_id.clone()))?;

        outcome
            .await
            .map_err(|_| EngineError::Unavailable(self.session_id.clone()))?
            .map_err(EngineError::from)
    }
}

/// How the driving future ended.
enum Settled {
    Done,
    /// Nothing left to poll but the run never reported back
    Stalled,
    Failed(String),
    TimedOut,
}

struct ActiveEnvironment {
    notebook_id: String,
    fingerprint: String,
    directory: PathBuf,
}

/// Harness entry points returned by the bootstrap script. Cells cannot reach
/// them: nothing in the global scope refers to these functions.
struct KernelHooks {
    run: v8::Global<v8::Function>,
    reset_modules: v8::Global<v8::Function>,
}

impl KernelHooks {
    fn from_bootstrap(runtime: &mut JsRuntime, exports: v8::Global<v8::Value>) -> Result<Self, String> {
        let scope = &mut runtime.handle_scope();
        let exports = v8::Local::new(scope, exports);
        let exports = v8::Local::<v8::Object>::try_from(exports)
            .map_err(|_| "bootstrap did not return the kernel hooks".to_string())?;
        Ok(Self {
            run: hook(scope, exports, "run")?,
            reset_modules: hook(scope, exports, "resetModules")?,
        })
    }
}

fn hook<'s>(
    scope: &mut v8::HandleScope<'s>,
    exports: v8::Local<'s, v8::Object>,
    name: &str,
) -> Result<v8::Global<v8::Function>, String> {
    let key = v8::String::new(scope, name).ok_or_else(|| format!("cannot allocate hook name {name}"))?;
    let value = exports
        .get(scope, key.into())
        .ok_or_else(|| format!("kernel hook {name} is missing"))?;
    let function = v8::Local::<v8::Function>::try_from(value)
        .map_err(|_| format!("kernel hook {name} is not a function"))?;
    Ok(v8::Global::new(scope, function))
}

struct EngineWorker {
    runtime: JsRuntime,
    hooks: KernelHooks,
    environments: Arc<EnvironmentManager>,
    config: EngineConfig,
    active: Option<ActiveEnvironment>,
    next_run: u32,
}

impl EngineWorker {
    fn new(environments: Arc<EnvironmentManager>, config: EngineConfig) -> Result<Self, String> {
        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![ops::kernel_ext::init()],
            ..Default::default()
        });
        let exports = runtime
            .execute_script("[kernel:bootstrap]", BOOTSTRAP.to_string())
            .map_err(|e| e.to_string())?;
        let hooks = KernelHooks::from_bootstrap(&mut runtime, exports)?;

        Ok(Self {
            runtime,
            hooks,
            environments,
            config,
            active: None,
            next_run: 0,
        })
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<EngineCommand>) {
        while let Some(command) = inbox.recv().await {
            match command {
                EngineCommand::Execute {
                    request,
                    stream,
                    reply,
                } => {
                    let result = self.execute(request, stream).await;
                    if reply.send(result).is_err() {
                        debug!("Execution finished after its caller went away");
                    }
                }
            }
        }
    }

    async fn execute(
        &mut self,
        request: ExecutionRequest,
        stream: Option<StreamSink>,
    ) -> Result<ExecutionResult, EnvironmentError> {
        self.ensure_environment(&request.notebook_id, &request.manifest)
            .await?;
        Ok(self.run_cell(request, stream).await)
    }

    /// Prepares and binds the notebook's environment unless it is already bound.
    async fn ensure_environment(
        &mut self,
        notebook_id: &str,
        manifest: &Manifest,
    ) -> Result<(), EnvironmentError> {
        let fingerprint = manifest.fingerprint();
        let current = self
            .active
            .as_ref()
            .is_some_and(|env| env.notebook_id == notebook_id && env.fingerprint == fingerprint);
        if current {
            return Ok(());
        }

        let prepared = self.environments.prepare(notebook_id, manifest).await?;
        self.bind(prepared).await;
        Ok(())
    }

    async fn bind(&mut self, prepared: PreparedEnvironment) {
        let capabilities = SandboxCapabilities::new(&prepared.directory, &self.config.env);
        self.runtime.op_state().borrow_mut().put(capabilities);
        // Modules loaded from the previous directory must not leak into this one
        if let Err(e) = self.runtime.call(&self.hooks.reset_modules).await {
            warn!("Resetting module cache failed: {e}");
        }
        debug!(
            "Bound notebook {} to {} ({})",
            prepared.notebook_id,
            prepared.directory.display(),
            prepared.fingerprint
        );
        self.active = Some(ActiveEnvironment {
            notebook_id: prepared.notebook_id,
            fingerprint: prepared.fingerprint,
            directory: prepared.directory,
        });
    }

    async fn run_cell(&mut self, request: ExecutionRequest, stream: Option<StreamSink>) -> ExecutionResult {
        let started = Utc::now();
        let timeout = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_timeout);

        let directory = self
            .active
            .as_ref()
            .map(|env| env.directory.clone())
            .unwrap_or_default();
        let filename = directory.join(format!(
            "cell-{}.{}",
            file_safe(&request.cell_id),
            request.language.as_str()
        ));
        let url = Url::from_file_path(&filename)
            .map(String::from)
            .unwrap_or_else(|_| format!("file:///cell-{}.js", file_safe(&request.cell_id)));

        let source = match transpile::to_javascript(&request.code, request.language, &url) {
            Ok(source) => source,
            Err(error) => return finish(started, Vec::new(), None, Some(error)),
        };

        self.next_run = self.next_run.wrapping_add(1);
        let run_id = self.next_run;
        self.runtime
            .op_state()
            .borrow_mut()
            .put(RunSlot::new(run_id, stream));

        let spec = serde_json::json!({
            "runId": run_id,
            "code": source,
            "filename": filename.display().to_string(),
            "dirname": directory.display().to_string(),
            "url": url,
        });
        debug!("Run {run_id}: cell {} ({:?})", request.cell_id, request.language);

        let argument = {
            let scope = &mut self.runtime.handle_scope();
            v8::String::new(scope, &spec.to_string())
                .map(|text| v8::Global::new(scope, v8::Local::<v8::Value>::from(text)))
        };

        let clock = Instant::now();
        let settled = match argument {
            Some(argument) => {
                let settle = self.runtime.call_with_args(&self.hooks.run, &[argument]);
                let remaining = timeout.saturating_sub(clock.elapsed());
                match tokio::time::timeout(
                    remaining,
                    self.runtime
                        .with_event_loop_promise(settle, PollEventLoopOptions::default()),
                )
                .await
                {
                    Ok(Ok(_)) => Settled::Done,
                    Ok(Err(e)) => {
                        let message = e.to_string();
                        if message.contains("pending") {
                            Settled::Stalled
                        } else {
                            Settled::Failed(message)
                        }
                    }
                    Err(_) => Settled::TimedOut,
                }
            }
            None => Settled::Failed("RangeError: cell source is too large".to_string()),
        };

        let slot = self
            .runtime
            .op_state()
            .borrow_mut()
            .try_take::<RunSlot>()
            .unwrap_or_else(|| RunSlot::new(run_id, None));

        let RunSlot {
            events, completion, ..
        } = slot;

        let mut result_output = None;
        let error = match (completion, settled) {
            (Some(completion), settled) => {
                result_output = completion
                    .result
                    .map(|payload| payload.into_output(DisplayKind::ExecuteResult));
                let engine_error = match settled {
                    Settled::Failed(message) => Some(ErrorOutput::from_engine_message(&message)),
                    _ => None,
                };
                completion.error.or(engine_error)
            }
            (None, Settled::Stalled) => {
                // A promise nothing can settle: hold the cell for its full budget
                tokio::time::sleep(timeout.saturating_sub(clock.elapsed())).await;
                Some(timeout_error(timeout))
            }
            (None, Settled::TimedOut) => Some(timeout_error(timeout)),
            (None, Settled::Failed(message)) => Some(ErrorOutput::from_engine_message(&message)),
            (None, Settled::Done) => Some(ErrorOutput::new(
                "InternalError",
                "execution finished without reporting a result",
            )),
        };

        finish(started, events, result_output, error)
    }
}

fn timeout_error(timeout: Duration) -> ErrorOutput {
    ErrorOutput::new(
        "TimeoutError",
        format!("Execution timed out after {} ms", timeout.as_millis()),
    )
}

fn finish(
    started: chrono::DateTime<Utc>,
    mut outputs: Vec<OutputEvent>,
    result: Option<OutputEvent>,
    error: Option<ErrorOutput>,
) -> ExecutionResult {
    outputs.extend(result);
    if let Some(error) = &error {
        outputs.push(OutputEvent::Error(error.clone()));
    }
    ExecutionResult {
        outputs,
        started,
        ended: Utc::now(),
        status: if error.is_some() {
            ExecutionStatus::Error
        } else {
            ExecutionStatus::Ok
        },
        error,
    }
}

fn file_safe(cell_id: &str) -> String {
    let safe: String = cell_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(64)
        .collect();
    if safe.is_empty() {
        "anonymous".to_string()
    } else {
        safe
    }
}
