mod config;
mod environment;
mod kernel;
mod output;
mod sandbox;
mod server;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::environment::{CommandInstaller, EnvironmentManager};
use crate::kernel::{FileNotebookStore, InMemorySessionManager, KernelContext, KernelRegistry};
use crate::sandbox::EngineConfig;
use crate::server::AppState;

fn print_help() {
    println!(
        "\
notebook-kernel v{}

A sandboxed JavaScript/TypeScript notebook kernel served over WebSocket.

USAGE:
    notebook-kernel [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/kernel.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing
                (e.g. debug, notebook_kernel=debug,warn)

ENDPOINTS:
    POST /api/notebooks/{{notebook_id}}/sessions    Open a kernel session
    GET  /api/kernels/{{session_id}}/channels       Kernel channel (WebSocket)
    GET  /healthz                                 Liveness

EXAMPLES:
    notebook-kernel                            # uses config/kernel.toml
    notebook-kernel /etc/kernel/kernel.toml    # custom config path
    RUST_LOG=debug notebook-kernel             # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("notebook-kernel v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("notebook_kernel=info")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/kernel.toml".to_string());

    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)?;

    info!("Listen address: {}", config.server.bind_address());
    info!("Sandbox root: {}", config.kernel.sandbox_root.display());
    info!("Notebook store: {}", config.store.path.display());
    info!("Default timeout: {} ms", config.kernel.default_timeout_ms);
    info!(
        "Dependency installer: {} {}",
        config.kernel.install.program,
        config.kernel.install.args.join(" ")
    );
    if !config.kernel.env_passthrough.is_empty() {
        info!(
            "Environment passthrough: {}",
            config.kernel.env_passthrough.join(", ")
        );
    }

    let installer = Arc::new(CommandInstaller::new(&config.kernel.install));
    let environments = Arc::new(EnvironmentManager::new(
        config.kernel.sandbox_root.clone(),
        installer,
    )?);
    let registry = Arc::new(KernelRegistry::new(
        environments,
        EngineConfig::from_kernel(&config.kernel),
    ));
    let sessions = Arc::new(InMemorySessionManager::new());

    let state = AppState {
        kernel: KernelContext {
            store: Arc::new(FileNotebookStore::new(config.store.path.clone())),
            sessions: sessions.clone(),
            registry,
            default_timeout_ms: config.kernel.default_timeout_ms,
        },
        sessions,
    };

    server::serve(&config.server.bind_address(), state).await
}
