use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub kernel: KernelConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KernelConfig {
    /// Per-cell wall-clock deadline when neither the request nor the cell sets one
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// One sub-directory per notebook is created here
    #[serde(default = "default_sandbox_root")]
    pub sandbox_root: PathBuf,
    /// Host environment variables visible to cells through `process.env`
    #[serde(default)]
    pub env_passthrough: Vec<String>,
    #[serde(default)]
    pub install: InstallConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InstallConfig {
    #[serde(default = "default_install_program")]
    pub program: String,
    #[serde(default = "default_install_args")]
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Directory of notebook JSON documents
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_sandbox_root() -> PathBuf {
    PathBuf::from("./data/sandboxes")
}

fn default_install_program() -> String {
    "npm".to_string()
}

fn default_install_args() -> Vec<String> {
    ["install", "--no-audit", "--no-fund", "--loglevel=error"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./data/notebooks")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            sandbox_root: default_sandbox_root(),
            env_passthrough: Vec::new(),
            install: InstallConfig::default(),
        }
    }
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            program: default_install_program(),
            args: default_install_args(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl ServerConfig {
    /// `host:port` for the listener
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl KernelConfig {
    /// Snapshot of the passthrough variables that are actually set.
    pub fn passthrough_env(&self) -> Vec<(String, String)> {
        self.env_passthrough
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|value| (name.clone(), value)))
            .collect()
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${SANDBOX_ROOT}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        if config.kernel.default_timeout_ms == 0 {
            anyhow::bail!("kernel.default_timeout_ms must be greater than zero");
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.bind_address(), "127.0.0.1:8765");
        assert_eq!(config.kernel.default_timeout_ms, 10_000);
        assert_eq!(config.kernel.install.program, "npm");
        assert_eq!(config.kernel.install.args[0], "install");
        assert_eq!(config.store.path, PathBuf::from("./data/notebooks"));
        assert!(config.kernel.env_passthrough.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
            [server]
            host = "0.0.0.0"
            port = 9000

            [kernel]
            default_timeout_ms = 2500
            sandbox_root = "/var/lib/kernel/sandboxes"
            env_passthrough = ["LANG", "TZ"]

            [kernel.install]
            program = "pnpm"
            args = ["install", "--silent"]

            [store]
            path = "/var/lib/kernel/notebooks"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind_address(), "0.0.0.0:9000");
        assert_eq!(config.kernel.default_timeout_ms, 2500);
        assert_eq!(config.kernel.sandbox_root, PathBuf::from("/var/lib/kernel/sandboxes"));
        assert_eq!(config.kernel.env_passthrough, vec!["LANG", "TZ"]);
        assert_eq!(config.kernel.install.program, "pnpm");
        assert_eq!(config.kernel.install.args, vec!["install", "--silent"]);
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("NOTEBOOK_KERNEL_TEST_ROOT", "/tmp/kernel-test-root");
        let config = Config::parse(
            r#"
            [kernel]
            sandbox_root = "${NOTEBOOK_KERNEL_TEST_ROOT}/sandboxes"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.kernel.sandbox_root,
            PathBuf::from("/tmp/kernel-test-root/sandboxes")
        );
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = Config::parse("[kernel]\ndefault_timeout_ms = 0\n").unwrap_err();
        assert!(err.to_string().contains("default_timeout_ms"));
    }

    #[test]
    fn test_passthrough_env_skips_unset() {
        std::env::set_var("NOTEBOOK_KERNEL_TEST_VISIBLE", "yes");
        let kernel = KernelConfig {
            env_passthrough: vec![
                "NOTEBOOK_KERNEL_TEST_VISIBLE".to_string(),
                "NOTEBOOK_KERNEL_TEST_UNSET_VAR".to_string(),
            ],
            ..Default::default()
        };
        assert_eq!(
            kernel.passthrough_env(),
            vec![("NOTEBOOK_KERNEL_TEST_VISIBLE".to_string(), "yes".to_string())]
        );
    }
}
