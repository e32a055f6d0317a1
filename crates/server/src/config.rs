use crate::dispatch::HttpDispatcher;
use crate::operations;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shoal_core::engine::{DagExecutor, OperationRegistry, TaskRunner};
use shoal_core::storage::{JsonlEventLog, RedbDagStore};
use shoal_core::types::AgentInfo;
use shoal_sdk::{RetryConfig, ShoalClient};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,
}

/// Identity this agent advertises to its peers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_ip")]
    pub ip: String,

    #[serde(default = "default_agent_port")]
    pub port: u16,
}

fn default_agent_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_agent_port() -> u16 {
    2886
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            ip: default_agent_ip(),
            port: default_agent_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_dag_db")]
    pub dag_db: String,

    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,
}

fn default_dag_db() -> String {
    "dags.redb".to_string()
}

fn default_event_log_dir() -> String {
    "events".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dag_db: default_dag_db(),
            event_log_dir: default_event_log_dir(),
        }
    }
}

/// Shared bearer token. Unset disables authentication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Upper bound for one task run on a remote agent
    #[serde(default = "default_dispatch_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_dispatch_timeout_secs() -> u64 {
    3600
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_dispatch_timeout_secs(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self::with_data_dir(data_dir.clone())
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            agent: Default::default(),
            storage: Default::default(),
            auth: Default::default(),
            dispatch: Default::default(),
        }
    }

    pub fn agent_info(&self) -> AgentInfo {
        AgentInfo::new(self.agent.ip.clone(), self.agent.port)
    }

    /// Get the DAG database path
    pub fn dag_db_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.dag_db)
    }

    /// Get the event log path
    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.event_log_dir)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub agent: AgentInfo,
    pub token: Option<String>,
    pub journal: Arc<JsonlEventLog>,
    pub executor: DagExecutor,
    /// Runs tasks other agents dispatch to this one
    pub runner: TaskRunner,
    /// Cancelled on shutdown so inbound task runs stop
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let registry: Arc<OperationRegistry> =
            Arc::new(operations::registry().context("Failed to register operations")?);
        Self::with_registry(config, registry)
    }

    pub fn with_registry(config: &ServerConfig, registry: Arc<OperationRegistry>) -> Result<Self> {
        let agent = config.agent_info();

        let store = Arc::new(
            RedbDagStore::new(config.dag_db_path()).context("Failed to open dag store")?,
        );

        let journal = Arc::new(
            JsonlEventLog::new(config.event_log_path()).context("Failed to create event log")?,
        );

        // Peers are addressed through per-agent clones of this client
        let mut peers = ShoalClient::builder()
            .base_url(agent.base_url())
            .timeout(Duration::from_secs(config.dispatch.timeout_secs))
            .retry_config(RetryConfig::no_retry());
        if let Some(token) = &config.auth.token {
            peers = peers.token(token.clone());
        }
        let peers = peers.build().context("Failed to build agent client")?;

        let dispatcher = Arc::new(HttpDispatcher::new(
            agent.clone(),
            registry.clone(),
            store.clone(),
            peers,
        ));

        let executor = DagExecutor::new(store, journal.clone(), dispatcher, registry.clone());

        Ok(Self {
            agent,
            token: config.auth.token.clone(),
            journal,
            executor,
            runner: TaskRunner::new(registry),
            shutdown: CancellationToken::new(),
        })
    }
}
