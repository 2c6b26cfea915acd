//! System-wide default values. Anything here can be overridden through the
//! configuration file or environment; these are the fallbacks.

/// Maximum size of a proposal content body in bytes.
pub const MAX_PROPOSAL_CONTENT_BYTES: usize = 100 * 1024;

/// Maximum length of a task title.
pub const MAX_TITLE_LENGTH: usize = 300;

/// Maximum length of a task description.
pub const MAX_DESCRIPTION_LENGTH: usize = 20_000;

/// Concurrent tool calls accepted before the transport answers Busy.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

/// SSE keep-alive ping interval in seconds.
pub const DEFAULT_SSE_KEEP_ALIVE_SECS: u64 = 30;

/// Event bus ring capacity per topic.
pub const DEFAULT_TOPIC_CAPACITY: usize = 2048;

/// Store connection pool size.
pub const DEFAULT_STORE_POOL_SIZE: usize = 4;

/// Solo tasks route below these scores; consensus at or above the
/// consensus thresholds.
pub const DEFAULT_SOLO_MAX_COMPLEXITY: u8 = 3;
pub const DEFAULT_SOLO_MAX_RISK: u8 = 3;
pub const DEFAULT_CONSENSUS_COMPLEXITY: u8 = 7;
pub const DEFAULT_CONSENSUS_RISK: u8 = 7;

/// Agents selected for PARALLEL routing.
pub const DEFAULT_PARALLEL_FANOUT: usize = 2;

/// Upper bound on CONSENSUS participants.
pub const DEFAULT_MAX_CONSENSUS_PARTICIPANTS: usize = 5;

/// Vote share required for VOTING consensus.
pub const DEFAULT_APPROVAL_THRESHOLD: f64 = 0.75;

/// Score gap required for REASONING_QUALITY consensus.
pub const DEFAULT_QUALITY_MARGIN: f64 = 0.1;

/// RRF rank-fusion constant.
pub const DEFAULT_RRF_K: f64 = 60.0;

/// Per-stage deadlines.
pub const DEFAULT_SOLO_DEADLINE_SECS: u64 = 30;
pub const DEFAULT_CONSENSUS_ROUND_SECS: u64 = 300;

/// Refinement rounds allowed before escalation.
pub const DEFAULT_MAX_ROUNDS: u32 = 2;

/// First-proposal confidence below this upgrades an ADAPTIVE task.
pub const DEFAULT_ADAPTIVE_UPGRADE_THRESHOLD: f64 = 0.6;

/// Agent call handling.
pub const DEFAULT_AGENT_CALL_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_AGENT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_AGENT_BACKOFF_START_MS: u64 = 500;

/// Health probing.
pub const DEFAULT_HEALTH_PROBE_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_HEALTH_PROBE_TIMEOUT_SECS: u64 = 1;
pub const DEFAULT_OFFLINE_AFTER_FAILURES: u32 = 3;

/// Smoothing factor for the per-agent latency EMA.
pub const LATENCY_EMA_ALPHA: f64 = 0.3;

/// Metrics flush cadence and audit-log retention (rows).
pub const DEFAULT_METRICS_FLUSH_SECS: u64 = 30;
pub const DEFAULT_EVENTS_LOG_RETENTION: u64 = 10_000;

/// Rough token estimate when an agent supplies none: four characters per
/// token.
pub const CHARS_PER_TOKEN: usize = 4;
