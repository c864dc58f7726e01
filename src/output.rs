/// Execution output shapes shared by the engine, the protocol and the
/// persisted cell records.
///
/// Everything here is plain data. Outputs are append-only per execution and
/// their order is the order the cell produced them in.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MIME bundle: `text/plain`, `application/json`, ...
pub type MimeBundle = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

impl StreamName {
    /// Parses the stream name used by the console shim.
    pub fn parse(name: &str) -> Self {
        match name {
            "stderr" => StreamName::Stderr,
            _ => StreamName::Stdout,
        }
    }
}

/// Which outbound frame a display output maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayKind {
    /// Emitted by `display()` while the cell runs
    #[default]
    DisplayData,
    /// The rendered value of the cell's final expression
    ExecuteResult,
    /// `display(value, { displayId, update: true })`
    UpdateDisplayData,
}

/// A structured error: compile error, runtime exception or timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorOutput {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

impl ErrorOutput {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            traceback: Vec::new(),
        }
    }

    pub fn with_traceback(mut self, traceback: Vec<String>) -> Self {
        self.traceback = traceback;
        self
    }

    /// Builds an error from an engine message such as
    /// `Uncaught (in promise) TypeError: x is not a function\n    at ...`.
    pub fn from_engine_message(raw: &str) -> Self {
        let mut lines = raw.lines();
        let head = lines.next().unwrap_or_default();
        let head = head
            .trim_start_matches("Uncaught (in promise) ")
            .trim_start_matches("Uncaught ");

        let (name, message) = match head.split_once(": ") {
            Some((name, message)) if is_error_name(name) => (name, message),
            _ => ("Error", head),
        };

        let traceback = if raw.contains('\n') {
            raw.lines().map(str::to_string).collect()
        } else {
            Vec::new()
        };

        Self::new(name, message).with_traceback(traceback)
    }
}

fn is_error_name(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// One output produced by a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum OutputEvent {
    Stream {
        name: StreamName,
        text: String,
    },
    Display {
        data: MimeBundle,
        #[serde(default)]
        metadata: serde_json::Map<String, Value>,
        #[serde(default)]
        kind: DisplayKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_id: Option<String>,
    },
    Error(ErrorOutput),
}

impl OutputEvent {
    pub fn stream(name: StreamName, text: impl Into<String>) -> Self {
        OutputEvent::Stream {
            name,
            text: text.into(),
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, OutputEvent::Stream { .. })
    }
}

/// A stream write forwarded live while a cell is still running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub name: StreamName,
    pub text: String,
}

pub type StreamSink = tokio::sync::mpsc::UnboundedSender<StreamChunk>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Ok,
    Error,
    Aborted,
}

/// Terminal record of one execution request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub outputs: Vec<OutputEvent>,
    pub started: DateTime<Utc>,
    pub ended: DateTime<Utc>,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorOutput>,
}

impl ExecutionResult {
    /// A result that failed before any code ran (environment, engine loss).
    pub fn failed(status: ExecutionStatus, error: ErrorOutput, started: DateTime<Utc>) -> Self {
        Self {
            outputs: vec![OutputEvent::Error(error.clone())],
            started,
            ended: Utc::now(),
            status,
            error: Some(error),
        }
    }

    pub fn exec_time_ms(&self) -> u64 {
        (self.ended - self.started).num_milliseconds().max(0) as u64
    }
}
