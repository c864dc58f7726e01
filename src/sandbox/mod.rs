//! Sandboxed JavaScript / TypeScript execution.
//!
//! Each kernel session owns one [`KernelEngine`]: a V8 isolate on its own
//! thread whose globals persist across cells. Cells reach the host only
//! through the ops in [`ops`], which are bound to the notebook's sandbox
//! directory and rebound whenever its environment changes.
//!
//! Timeouts are cooperative. Code that awaits (timers, promises, I/O) is
//! abandoned at the deadline, but a synchronous busy loop keeps the engine
//! thread until it finishes; preempting it would need a process per kernel.
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod engine;
pub mod fs;
pub mod ops;
pub mod resolver;
pub mod transpile;

pub use engine::KernelEngine;

use crate::config::KernelConfig;
use crate::environment::{EnvironmentError, Manifest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    #[serde(alias = "javascript")]
    Js,
    #[serde(alias = "typescript")]
    Ts,
}

impl Language {
    /// Lenient parse for values stored on notebooks and cells.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "js" | "javascript" => Some(Language::Js),
            "ts" | "typescript" => Some(Language::Ts),
            _ => None,
        }
    }

    /// Name stored on persisted cells; doubles as the file extension.
    pub fn as_str(self) -> &'static str {
        match self {
            Language::Js => "js",
            Language::Ts => "ts",
        }
    }
}

/// One cell to run.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub cell_id: String,
    pub code: String,
    pub language: Language,
    pub notebook_id: String,
    pub manifest: Manifest,
    /// Falls back to [`EngineConfig::default_timeout`]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_timeout: Duration,
    /// Variables exposed through `process.env`
    pub env: Vec<(String, String)>,
}

impl EngineConfig {
    pub fn from_kernel(config: &KernelConfig) -> Self {
        Self {
            default_timeout: Duration::from_millis(config.default_timeout_ms),
            env: config.passthrough_env(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_kernel(&KernelConfig::default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
    #[error("execution engine for session {0} is no longer running")]
    Unavailable(String),
    #[error("failed to start execution engine thread: {0}")]
    Spawn(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_parse() {
        assert_eq!(Language::parse("TypeScript"), Some(Language::Ts));
        assert_eq!(Language::parse(" js "), Some(Language::Js));
        assert_eq!(Language::parse("python"), None);
    }

    #[test]
    fn test_language_serde_aliases() {
        let lang: Language = serde_json::from_str(r#""typescript""#).unwrap();
        assert_eq!(lang, Language::Ts);
        assert_eq!(serde_json::to_string(&Language::Js).unwrap(), r#""js""#);
    }
}
