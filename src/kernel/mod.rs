//! Kernel channel protocol: one WebSocket-style connection per session.
pub mod frames;
pub mod registry;
pub mod session;
pub mod store;

use std::sync::Arc;

pub use frames::{InboundFrame, OutboundFrame, Outgoing};
pub use registry::KernelRegistry;
pub use session::serve_connection;
pub use store::{FileNotebookStore, InMemorySessionManager, NotebookStore, SessionManager};

/// WebSocket close code for a connection to an unknown session or notebook.
pub const CLOSE_NOT_FOUND: u16 = 4404;

/// Collaborators shared by every connection.
#[derive(Clone)]
pub struct KernelContext {
    pub store: Arc<dyn NotebookStore>,
    pub sessions: Arc<dyn SessionManager>,
    pub registry: Arc<KernelRegistry>,
    /// Used when neither the request nor the cell sets a timeout
    pub default_timeout_ms: u64,
}
