use crate::{constants::*, models::ConsensusStrategy, QuorumError, Result};
use clap::Parser;
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Command-line flags. Flags override file and environment values.
#[derive(Debug, Clone, Parser, Default)]
#[command(name = "quorum-core", about = "Consensus orchestration server for AI coding agents")]
pub struct Cli {
    /// Path to a TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Bind host override
    #[arg(long)]
    pub host: Option<String>,

    /// Bind port override
    #[arg(long)]
    pub port: Option<u16>,

    /// Store database file override
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// Tracing filter, e.g. "quorum_core=debug,info"
    #[arg(long)]
    pub log_filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub transport: TransportConfig,
    pub routing: RoutingConfig,
    pub consensus: ConsensusConfig,
    pub agent_call: AgentCallConfig,
    pub health: HealthConfig,
    pub bus: BusConfig,
    pub metrics: MetricsConfig,
    /// Agents registered at startup.
    pub agents: Vec<AgentSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7400,
            allowed_origins: vec!["http://localhost:7400".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub pool_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quorum.db"),
            pool_size: DEFAULT_STORE_POOL_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub max_in_flight: usize,
    pub keep_alive_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            keep_alive_secs: DEFAULT_SSE_KEEP_ALIVE_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub solo_max_complexity: u8,
    pub solo_max_risk: u8,
    pub consensus_complexity: u8,
    pub consensus_risk: u8,
    pub parallel_fanout: usize,
    pub max_consensus_participants: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            solo_max_complexity: DEFAULT_SOLO_MAX_COMPLEXITY,
            solo_max_risk: DEFAULT_SOLO_MAX_RISK,
            consensus_complexity: DEFAULT_CONSENSUS_COMPLEXITY,
            consensus_risk: DEFAULT_CONSENSUS_RISK,
            parallel_fanout: DEFAULT_PARALLEL_FANOUT,
            max_consensus_participants: DEFAULT_MAX_CONSENSUS_PARTICIPANTS,
        }
    }
}

/// What the consensus engine does when no strategy reaches consensus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Record the decision with the consensus flag unset.
    Accept,
    /// Reopen the task for another proposal round, up to `max_rounds`.
    Refine,
    /// Park the task for an explicit human `complete_task`.
    Escalate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub default_strategy: ConsensusStrategy,
    pub approval_threshold: f64,
    pub quality_margin: f64,
    pub rrf_k: f64,
    pub solo_deadline_secs: u64,
    pub round_deadline_secs: u64,
    pub max_rounds: u32,
    pub on_no_consensus: ConflictPolicy,
    pub adaptive_upgrade_threshold: f64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            default_strategy: ConsensusStrategy::Voting,
            approval_threshold: DEFAULT_APPROVAL_THRESHOLD,
            quality_margin: DEFAULT_QUALITY_MARGIN,
            rrf_k: DEFAULT_RRF_K,
            solo_deadline_secs: DEFAULT_SOLO_DEADLINE_SECS,
            round_deadline_secs: DEFAULT_CONSENSUS_ROUND_SECS,
            max_rounds: DEFAULT_MAX_ROUNDS,
            on_no_consensus: ConflictPolicy::Accept,
            adaptive_upgrade_threshold: DEFAULT_ADAPTIVE_UPGRADE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentCallConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_start_ms: u64,
}

impl Default for AgentCallConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_AGENT_CALL_TIMEOUT_SECS,
            max_retries: DEFAULT_AGENT_MAX_RETRIES,
            backoff_start_ms: DEFAULT_AGENT_BACKOFF_START_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub offline_after: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: DEFAULT_HEALTH_PROBE_INTERVAL_SECS,
            probe_timeout_secs: DEFAULT_HEALTH_PROBE_TIMEOUT_SECS,
            offline_after: DEFAULT_OFFLINE_AFTER_FAILURES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub topic_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            topic_capacity: DEFAULT_TOPIC_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub flush_interval_secs: u64,
    pub events_log_retention: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: DEFAULT_METRICS_FLUSH_SECS,
            events_log_retention: DEFAULT_EVENTS_LOG_RETENTION,
        }
    }
}

/// Startup registration for one agent. Capability keys use the closed
/// vocabulary (`CODE_GENERATION`, ...) and are checked when the registry
/// seeds itself.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AgentSeed {
    pub id: String,
    pub kind: String,
    pub display_name: String,
    pub endpoint: Option<String>,
    pub capabilities: HashMap<String, f64>,
}

impl Settings {
    /// Layered load: built-in defaults, then the optional TOML file, then
    /// `QUORUM__SECTION__KEY` environment variables, then CLI flags.
    pub fn load(cli: &Cli) -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "loaded .env file");
        }

        let mut builder = config::Config::builder();
        if let Some(path) = &cli.config {
            builder = builder.add_source(
                File::from(path.clone())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        } else {
            builder = builder.add_source(File::new("quorum", FileFormat::Toml).required(false));
        }
        builder = builder.add_source(Environment::with_prefix("QUORUM").separator("__"));

        let mut settings: Settings = builder.build()?.try_deserialize()?;

        if let Some(host) = &cli.host {
            settings.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            settings.server.port = port;
        }
        if let Some(store) = &cli.store {
            settings.store.path = store.clone();
        }

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.store.pool_size == 0 {
            return Err(QuorumError::Configuration(
                "store.pool_size must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.consensus.approval_threshold) {
            return Err(QuorumError::Configuration(
                "consensus.approval_threshold must be in 0..=1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.consensus.adaptive_upgrade_threshold) {
            return Err(QuorumError::Configuration(
                "consensus.adaptive_upgrade_threshold must be in 0..=1".to_string(),
            ));
        }
        if self.routing.parallel_fanout == 0 {
            return Err(QuorumError::Configuration(
                "routing.parallel_fanout must be at least 1".to_string(),
            ));
        }
        for seed in &self.agents {
            if seed.id.trim().is_empty() {
                return Err(QuorumError::Configuration(
                    "agents[].id must not be empty".to_string(),
                ));
            }
            for (capability, strength) in &seed.capabilities {
                if !(0.0..=1.0).contains(strength) {
                    return Err(QuorumError::Configuration(format!(
                        "agent {} capability {capability} strength must be in 0..=1",
                        seed.id
                    )));
                }
            }
        }
        Ok(())
    }
}
