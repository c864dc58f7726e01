//! Rust side of the JS harness.
//!
//! Ops exchange JSON strings; the harness in `bootstrap.js` does the
//! decoding. Capabilities live in the `OpState` as one value so rebinding to a
//! new sandbox directory is a single `put`.
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use deno_core::{op2, OpState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::fs::ScopedFs;
use super::resolver::ModuleResolver;
use crate::output::{
    DisplayKind, ErrorOutput, MimeBundle, OutputEvent, StreamChunk, StreamName, StreamSink,
};

/// What the `process` shim reports to cells.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub cwd: String,
    pub env: BTreeMap<String, String>,
    pub platform: &'static str,
    pub arch: &'static str,
    pub version: String,
    pub pid: u32,
}

/// Everything a cell may touch on the host, bound to one sandbox directory.
pub struct SandboxCapabilities {
    pub fs: ScopedFs,
    pub resolver: ModuleResolver,
    pub process: ProcessInfo,
}

impl SandboxCapabilities {
    pub fn new(directory: &Path, env: &[(String, String)]) -> Self {
        let fs = ScopedFs::new(directory);
        Self {
            resolver: ModuleResolver::new(fs.clone()),
            fs,
            process: ProcessInfo {
                cwd: directory.display().to_string(),
                env: env.iter().cloned().collect(),
                platform: node_platform(),
                arch: node_arch(),
                version: format!("v{}", env!("CARGO_PKG_VERSION")),
                pid: std::process::id(),
            },
        }
    }
}

fn node_platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    }
}

fn node_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        "x86" => "ia32",
        other => other,
    }
}

/// What the harness reports when a run settles.
#[derive(Debug, Default, Deserialize)]
pub struct Completion {
    #[serde(default)]
    pub result: Option<DisplayPayload>,
    #[serde(default)]
    pub error: Option<ErrorOutput>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayPayload {
    pub data: MimeBundle,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    #[serde(default)]
    pub display_id: Option<String>,
    #[serde(default)]
    pub update: bool,
}

impl DisplayPayload {
    pub fn into_output(self, kind: DisplayKind) -> OutputEvent {
        OutputEvent::Display {
            data: self.data,
            metadata: self.metadata,
            kind,
            display_id: self.display_id,
        }
    }
}

/// Collects the outputs of the execution currently in flight.
///
/// Only present in the `OpState` while a run is active: output produced
/// between runs (a stale timer firing) has nowhere to go and is dropped.
pub struct RunSlot {
    pub run_id: u32,
    pub events: Vec<OutputEvent>,
    pub completion: Option<Completion>,
    sink: Option<StreamSink>,
}

impl RunSlot {
    pub fn new(run_id: u32, sink: Option<StreamSink>) -> Self {
        Self {
            run_id,
            events: Vec::new(),
            completion: None,
            sink,
        }
    }

    fn push_stream(&mut self, name: StreamName, text: String) {
        if text.is_empty() {
            return;
        }
        if let Some(sink) = &self.sink {
            // Receiver gone means nobody is listening live; keep collecting
            let _ = sink.send(StreamChunk {
                name,
                text: text.clone(),
            });
        }
        self.events.push(OutputEvent::stream(name, text));
    }
}

#[op2(fast)]
fn op_kernel_stream(state: &mut OpState, #[string] name: String, #[string] text: String) {
    match state.try_borrow_mut::<RunSlot>() {
        Some(slot) => slot.push_stream(StreamName::parse(&name), text),
        None => debug!("Dropping {name} output written outside a run"),
    }
}

#[op2(fast)]
fn op_kernel_display(state: &mut OpState, #[string] payload: String) {
    let payload = match serde_json::from_str::<DisplayPayload>(&payload) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Ignoring malformed display payload: {e}");
            return;
        }
    };
    let kind = if payload.update {
        DisplayKind::UpdateDisplayData
    } else {
        DisplayKind::DisplayData
    };
    if let Some(slot) = state.try_borrow_mut::<RunSlot>() {
        slot.events.push(payload.into_output(kind));
    }
}

#[op2(fast)]
fn op_kernel_complete(state: &mut OpState, #[smi] run_id: u32, #[string] payload: String) {
    let completion = match serde_json::from_str::<Completion>(&payload) {
        Ok(completion) => completion,
        Err(e) => Completion {
            result: None,
            error: Some(ErrorOutput::new(
                "InternalError",
                format!("malformed completion from harness: {e}"),
            )),
        },
    };
    match state.try_borrow_mut::<RunSlot>() {
        Some(slot) if slot.run_id == run_id => slot.completion = Some(completion),
        _ => debug!("Ignoring late completion of run {run_id}"),
    }
}

#[op2]
#[string]
fn op_kernel_fs(state: &mut OpState, #[string] request: String) -> String {
    match state.try_borrow::<SandboxCapabilities>() {
        Some(caps) => caps.fs.handle_json(&request),
        None => unbound_reply(),
    }
}

#[op2]
#[string]
fn op_kernel_require(
    state: &mut OpState,
    #[string] specifier: String,
    #[string] parent: String,
) -> String {
    match state.try_borrow::<SandboxCapabilities>() {
        Some(caps) => caps.resolver.resolve_json(&specifier, &parent),
        None => serde_json::json!({
            "kind": "error",
            "code": "ERR_SANDBOX_UNBOUND",
            "message": "no sandbox directory is bound to this kernel",
        })
        .to_string(),
    }
}

#[op2]
#[string]
fn op_kernel_process(state: &mut OpState) -> String {
    state
        .try_borrow::<SandboxCapabilities>()
        .and_then(|caps| serde_json::to_string(&caps.process).ok())
        .unwrap_or_else(|| "null".to_string())
}

#[op2(async)]
async fn op_kernel_sleep(#[smi] millis: u32) {
    tokio::time::sleep(Duration::from_millis(u64::from(millis))).await;
}

fn unbound_reply() -> String {
    serde_json::json!({
        "ok": false,
        "error": { "code": "ERR_SANDBOX_UNBOUND", "message": "no sandbox directory is bound to this kernel" }
    })
    .to_string()
}

deno_core::extension!(
    kernel_ext,
    ops = [
        op_kernel_stream,
        op_kernel_display,
        op_kernel_complete,
        op_kernel_fs,
        op_kernel_require,
        op_kernel_process,
        op_kernel_sleep,
    ],
);
