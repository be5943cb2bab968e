use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use toolgate_core::{
    ChatBackend, CircuitBreaker, OpenAiBackend, Orchestrator, OrchestratorConfig, Sandbox,
    ToolRegistry, UpstreamConfig,
};
use toolgate_mcp::{default_tools, Catalog, McpServer, ToolsConfig};

/// Environment variables that override file settings
const ENV_UPSTREAM_URL: &str = "TOOLGATE_UPSTREAM_URL";
const ENV_MODEL: &str = "TOOLGATE_MODEL";
const ENV_API_KEY: &str = "TOOLGATE_API_KEY";
const ENV_SANDBOX_ROOT: &str = "TOOLGATE_SANDBOX_ROOT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub upstream: UpstreamConfig,
    pub orchestrator: OrchestratorConfig,
    pub sandbox: SandboxConfig,
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Directory every file-touching tool is confined to
    pub root: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("workspace"),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path) -> Result<Self> {
        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Apply `TOOLGATE_*` overrides looked up through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_UPSTREAM_URL) {
            self.upstream.base_url = url;
        }
        if let Some(model) = lookup(ENV_MODEL) {
            self.upstream.model = model;
        }
        if let Some(key) = lookup(ENV_API_KEY) {
            self.upstream.api_key = Some(key);
        }
        if let Some(root) = lookup(ENV_SANDBOX_ROOT) {
            self.sandbox.root = PathBuf::from(root);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.max_iterations < 1 {
            bail!("orchestrator.max_iterations must be at least 1");
        }
        if self.upstream.circuit_breaker.failure_threshold < 1 {
            bail!("upstream.circuit_breaker.failure_threshold must be at least 1");
        }
        for (section, policy) in [
            ("upstream.retry", &self.upstream.retry),
            ("orchestrator.tool_retry", &self.orchestrator.tool_retry),
        ] {
            if policy.multiplier < 1.0 {
                bail!("{}.multiplier must be at least 1, got {}", section, policy.multiplier);
            }
        }
        if self.upstream.base_url.trim().is_empty() {
            bail!("upstream.base_url must not be empty");
        }
        Ok(())
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub breaker: Arc<CircuitBreaker>,
    pub registry: Arc<ToolRegistry>,
    pub backend: Arc<dyn ChatBackend>,
    pub orchestrator: Orchestrator,
    pub mcp: Arc<McpServer>,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let breaker = Arc::new(CircuitBreaker::new(
            "upstream",
            config.upstream.circuit_breaker.clone(),
        ));
        let backend = OpenAiBackend::new(config.upstream.clone(), breaker.clone())
            .context("Failed to create upstream client")?;
        tracing::info!(
            "Upstream: {} (model {})",
            config.upstream.base_url,
            config.upstream.model
        );

        Self::with_backend(config, Arc::new(backend), breaker)
    }

    /// Compose the state around an already-built backend.
    pub fn with_backend(
        config: &ServerConfig,
        backend: Arc<dyn ChatBackend>,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self> {
        let sandbox = Sandbox::new(&config.sandbox.root).context("Failed to create sandbox")?;

        let registry = ToolRegistry::new();
        registry.register(default_tools(&config.tools, sandbox)?);
        let registry = Arc::new(registry);
        tracing::info!("Registered {} tools: {}", registry.len(), registry.names().join(", "));

        let orchestrator =
            Orchestrator::new(backend.clone(), registry.clone(), config.orchestrator.clone());
        let mcp = Arc::new(McpServer::new(registry.clone(), Catalog::default()));

        Ok(Self {
            config: Arc::new(config.clone()),
            breaker,
            registry,
            backend,
            orchestrator,
            mcp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = ServerConfig::load(&temp_dir.path().join("absent.toml")).unwrap();

        assert_eq!(config.orchestrator.max_iterations, 5);
        assert_eq!(config.upstream.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.tools.max_output_bytes, ToolsConfig::default().max_output_bytes);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            [upstream]
            base_url = "http://llm.internal/v1"
            model = "qwen2.5"

            [upstream.retry]
            max_retries = 1

            [orchestrator]
            max_iterations = 8

            [sandbox]
            root = "/srv/toolgate"
            "#,
        )
        .unwrap();

        assert_eq!(config.upstream.base_url, "http://llm.internal/v1");
        assert_eq!(config.upstream.model, "qwen2.5");
        assert_eq!(config.upstream.retry.max_retries, 1);
        assert_eq!(config.upstream.retry.multiplier, 2.0);
        assert_eq!(config.orchestrator.max_iterations, 8);
        assert_eq!(config.sandbox.root, PathBuf::from("/srv/toolgate"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TOOLGATE_UPSTREAM_URL", "http://other/v1"),
            ("TOOLGATE_MODEL", "mistral"),
            ("TOOLGATE_API_KEY", "sk-test"),
            ("TOOLGATE_SANDBOX_ROOT", "/tmp/box"),
        ]
        .into_iter()
        .collect();

        let mut config = ServerConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.upstream.base_url, "http://other/v1");
        assert_eq!(config.upstream.model, "mistral");
        assert_eq!(config.upstream.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.sandbox.root, PathBuf::from("/tmp/box"));
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut config = ServerConfig::default();
        config.orchestrator.max_iterations = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.upstream.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.orchestrator.tool_retry.multiplier = 0.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("orchestrator.tool_retry.multiplier"));
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("toolgate.toml");
        std::fs::write(&path, "[orchestrator]\nmax_iterations = \"many\"\n").unwrap();

        let err = ServerConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse configuration file"));
    }

    #[tokio::test]
    async fn test_app_state_wires_shared_registry() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = ServerConfig::default();
        config.sandbox.root = temp_dir.path().join("box");

        let state = AppState::new(&config).unwrap();

        assert!(temp_dir.path().join("box").is_dir());
        assert_eq!(state.registry.len(), 11);
        assert!(Arc::ptr_eq(state.orchestrator.registry(), &state.registry));
        assert!(Arc::ptr_eq(state.mcp.registry(), &state.registry));
    }
}
