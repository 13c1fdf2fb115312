use crate::constants::{
    DEFAULT_BRANCH_PREFIX, DEFAULT_EXECUTOR_BINARY, DEFAULT_MAX_TURNS, DEFAULT_NETWORK,
    DEFAULT_ROLE_CONCURRENCY, DEFAULT_TASKS_DIR, DEFAULT_VERIFY_RETRIES, DEFAULT_WORKER_IMAGE,
    STATE_DIR,
};
use crate::{Result, TanukiError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

/// Top-level configuration, loaded from an optional `tanuki.yaml` at the
/// repository root with environment-variable overrides on top. Every field
/// has a default so a bare repository works with no config at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TanukiConfig {
    /// Repository the agents work on; also the anchor for `.tanuki/`.
    pub repo_root: PathBuf,
    /// Tasks root, relative to `repo_root` unless absolute.
    pub tasks_dir: PathBuf,
    /// Branch prefix for agent branches (`<prefix>/<name>`).
    pub branch_prefix: String,
    /// Shared container network name.
    pub network: String,
    /// Per-role concurrency overrides; roles not listed get
    /// `default_role_concurrency`.
    pub roles: HashMap<String, usize>,
    pub default_role_concurrency: usize,
    pub worker: WorkerConfig,
    pub executor: ExecutorConfig,
}

/// Worker container settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub image: String,
    /// CPU cap passed to the engine (e.g. `1.5`); unset means unlimited.
    pub cpus: Option<f64>,
    /// Memory cap passed to the engine (e.g. `2g`); unset means unlimited.
    pub memory: Option<String>,
    /// Extra environment for every worker container.
    pub env: HashMap<String, String>,
}

/// Executor settings: how the LLM CLI is invoked inside a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub binary: String,
    pub max_turns: u32,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    /// Per-task wall-clock budget in seconds; unset means unbounded.
    pub timeout_seconds: Option<u64>,
    pub verify_retries: u32,
}

impl Default for TanukiConfig {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            tasks_dir: PathBuf::from(DEFAULT_TASKS_DIR),
            branch_prefix: DEFAULT_BRANCH_PREFIX.to_string(),
            network: DEFAULT_NETWORK.to_string(),
            roles: HashMap::new(),
            default_role_concurrency: DEFAULT_ROLE_CONCURRENCY,
            worker: WorkerConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_WORKER_IMAGE.to_string(),
            cpus: None,
            memory: None,
            env: HashMap::new(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            binary: DEFAULT_EXECUTOR_BINARY.to_string(),
            max_turns: DEFAULT_MAX_TURNS,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            timeout_seconds: None,
            verify_retries: DEFAULT_VERIFY_RETRIES,
        }
    }
}

impl TanukiConfig {
    /// Load configuration: `.env`, then `tanuki.yaml` if present, then
    /// environment overrides. A missing file is not an error; a malformed
    /// one is.
    pub fn load(repo_root: &Path) -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded .env from {}", path.display());
        }

        let config_path = repo_root.join("tanuki.yaml");
        let mut config = if config_path.exists() {
            let raw = std::fs::read_to_string(&config_path)?;
            let parsed: TanukiConfig = serde_yaml::from_str(&raw).map_err(|e| {
                TanukiError::invalid(
                    "config",
                    format!("{}: {e}", config_path.display()),
                )
            })?;
            tracing::info!("Loaded config from {}", config_path.display());
            parsed
        } else {
            TanukiConfig::default()
        };

        config.repo_root = repo_root.to_path_buf();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("TANUKI_TASKS_DIR") {
            self.tasks_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("TANUKI_BRANCH_PREFIX") {
            self.branch_prefix = v;
        }
        if let Ok(v) = env::var("TANUKI_NETWORK") {
            self.network = v;
        }
        if let Ok(v) = env::var("TANUKI_WORKER_IMAGE") {
            self.worker.image = v;
        }
        if let Ok(v) = env::var("TANUKI_EXECUTOR_BINARY") {
            self.executor.binary = v;
        }
        if let Ok(v) = env::var("TANUKI_MAX_TURNS") {
            if let Ok(n) = v.parse() {
                self.executor.max_turns = n;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.branch_prefix.is_empty()
            || self
                .branch_prefix
                .chars()
                .any(|c| !c.is_ascii_alphanumeric() && c != '-' && c != '_')
        {
            return Err(TanukiError::invalid(
                "config",
                format!(
                    "branch_prefix {:?} must be non-empty alphanumeric/hyphen/underscore",
                    self.branch_prefix
                ),
            ));
        }
        if self.default_role_concurrency == 0 {
            return Err(TanukiError::invalid(
                "config",
                "default_role_concurrency must be at least 1",
            ));
        }
        if let Some(limit) = self.roles.iter().find(|(_, n)| **n == 0) {
            return Err(TanukiError::invalid(
                "config",
                format!("role {:?} has concurrency 0", limit.0),
            ));
        }
        Ok(())
    }

    /// Absolute tasks root.
    pub fn tasks_root(&self) -> PathBuf {
        if self.tasks_dir.is_absolute() {
            self.tasks_dir.clone()
        } else {
            self.repo_root.join(&self.tasks_dir)
        }
    }

    /// Path of the agent registry file.
    pub fn registry_path(&self) -> PathBuf {
        self.repo_root
            .join(STATE_DIR)
            .join(crate::constants::AGENTS_STATE_FILE)
    }

    /// Concurrency limit for a role.
    pub fn role_concurrency(&self, role: &str) -> usize {
        self.roles
            .get(role)
            .copied()
            .unwrap_or(self.default_role_concurrency)
    }
}
