//! Live set of known agents: registration, capability lookup, health.
//!
//! Registration is idempotent and persisted; queries hand out snapshots.
//! The health loop probes agents through the transport, marks them OFFLINE
//! after consecutive failures with exponential back-off on re-probe, and
//! publishes `AgentStatusChanged` on every availability change.

use crate::{
    agents::AgentTransport,
    config::{AgentSeed, HealthConfig},
    constants::LATENCY_EMA_ALPHA,
    events::EventBus,
    models::{AgentAvailability, AgentRecord, Capability, DomainEvent},
    store::Store,
    QuorumError, Result,
};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct AgentState {
    record: AgentRecord,
    failure_streak: u32,
    next_probe: Instant,
}

pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentState>>,
    store: Store,
    bus: EventBus,
    config: HealthConfig,
}

impl AgentRegistry {
    pub fn new(store: Store, bus: EventBus, config: HealthConfig) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            store,
            bus,
            config,
        }
    }

    /// Load persisted agents, then apply configuration seeds on top.
    pub async fn bootstrap(&self, seeds: &[AgentSeed]) -> Result<()> {
        for record in self.store.load_agents().await? {
            self.insert(record).await;
        }
        for seed in seeds {
            let mut record = AgentRecord::new(&seed.id, &seed.kind, &seed.display_name);
            record.endpoint = seed.endpoint.clone();
            for (name, strength) in &seed.capabilities {
                let capability = Capability::from_str(name)
                    .map_err(|e| QuorumError::Configuration(format!("agent {}: {e}", seed.id)))?;
                record.capabilities.insert(capability, *strength);
            }
            self.register(record).await?;
        }
        let count = self.agents.read().await.len();
        info!(agents = count, "agent registry bootstrapped");
        Ok(())
    }

    /// Idempotent upsert. Capabilities and endpoint of an existing agent
    /// are replaced; health bookkeeping is preserved.
    pub async fn register(&self, record: AgentRecord) -> Result<()> {
        let persisted = {
            let mut agents = self.agents.write().await;
            match agents.get_mut(&record.id) {
                Some(state) => {
                    state.record.kind = record.kind;
                    state.record.display_name = record.display_name;
                    state.record.capabilities = record.capabilities;
                    state.record.endpoint = record.endpoint;
                    debug!(agent_id = %state.record.id, "agent re-registered");
                    state.record.clone()
                }
                None => {
                    info!(agent_id = %record.id, kind = %record.kind, "agent registered");
                    let snapshot = record.clone();
                    agents.insert(
                        record.id.clone(),
                        AgentState {
                            record,
                            failure_streak: 0,
                            next_probe: Instant::now(),
                        },
                    );
                    snapshot
                }
            }
        };
        self.store.upsert_agent(&persisted).await?;
        Ok(())
    }

    pub async fn lookup(&self, id: &str) -> Result<AgentRecord> {
        let agents = self.agents.read().await;
        agents
            .get(id)
            .map(|s| s.record.clone())
            .ok_or_else(|| QuorumError::NotFound(format!("agent {id}")))
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.agents.read().await.contains_key(id)
    }

    pub async fn all(&self) -> Vec<AgentRecord> {
        let mut records: Vec<AgentRecord> = self
            .agents
            .read()
            .await
            .values()
            .map(|s| s.record.clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Agents advertising `capability` at or above `min_strength`,
    /// regardless of availability. Callers filter on availability.
    pub async fn find_by_capability(
        &self,
        capability: Capability,
        min_strength: f64,
    ) -> Vec<AgentRecord> {
        let mut matches: Vec<AgentRecord> = self
            .agents
            .read()
            .await
            .values()
            .filter(|s| {
                s.record.capabilities.contains_key(&capability)
                    && s.record.strength(capability) >= min_strength
            })
            .map(|s| s.record.clone())
            .collect();
        matches.sort_by(|a, b| {
            b.strength(capability)
                .partial_cmp(&a.strength(capability))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        matches
    }

    /// Availability change with event publication; no-op when unchanged.
    pub async fn set_availability(&self, id: &str, to: AgentAvailability) -> Result<()> {
        let from = {
            let mut agents = self.agents.write().await;
            let state = agents
                .get_mut(id)
                .ok_or_else(|| QuorumError::NotFound(format!("agent {id}")))?;
            let from = state.record.availability;
            state.record.availability = to;
            from
        };
        if from != to {
            let record = self.lookup(id).await?;
            self.store.upsert_agent(&record).await?;
            self.bus.publish(DomainEvent::AgentStatusChanged {
                agent_id: id.to_string(),
                from,
                to,
            });
        }
        Ok(())
    }

    /// Exponential moving average of observed call latency.
    pub async fn record_latency(&self, id: &str, latency_ms: f64) {
        let mut agents = self.agents.write().await;
        if let Some(state) = agents.get_mut(id) {
            let ema = state.record.latency_ema_ms;
            state.record.latency_ema_ms = if ema == 0.0 {
                latency_ms
            } else {
                LATENCY_EMA_ALPHA * latency_ms + (1.0 - LATENCY_EMA_ALPHA) * ema
            };
        }
    }

    /// One probe pass over every agent whose back-off window has elapsed.
    pub async fn probe_once(&self, transport: &dyn AgentTransport) {
        let due: Vec<AgentRecord> = {
            let now = Instant::now();
            self.agents
                .read()
                .await
                .values()
                .filter(|s| s.next_probe <= now)
                .map(|s| s.record.clone())
                .collect()
        };

        for record in due {
            let started = Instant::now();
            let probe = tokio::time::timeout(
                Duration::from_secs(self.config.probe_timeout_secs),
                transport.ping(&record),
            )
            .await;
            let healthy = matches!(probe, Ok(Ok(())));
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            self.apply_probe_result(&record.id, healthy, latency_ms).await;
        }
    }

    async fn apply_probe_result(&self, id: &str, healthy: bool, latency_ms: f64) {
        let interval = Duration::from_secs(self.config.probe_interval_secs);
        let transition = {
            let mut agents = self.agents.write().await;
            let Some(state) = agents.get_mut(id) else {
                return;
            };
            state.record.last_health_check = Some(chrono::Utc::now());
            if healthy {
                state.failure_streak = 0;
                state.next_probe = Instant::now() + interval;
                if state.record.availability == AgentAvailability::Offline {
                    Some(AgentAvailability::Online)
                } else {
                    None
                }
            } else {
                state.failure_streak += 1;
                // Exponential back-off once the agent is considered down.
                let exponent = state
                    .failure_streak
                    .saturating_sub(self.config.offline_after)
                    .min(5);
                state.next_probe = Instant::now() + interval * 2u32.pow(exponent);
                if state.failure_streak >= self.config.offline_after
                    && state.record.availability != AgentAvailability::Offline
                {
                    warn!(agent_id = %id, streak = state.failure_streak, "agent marked offline");
                    Some(AgentAvailability::Offline)
                } else {
                    None
                }
            }
        };
        if healthy {
            self.record_latency(id, latency_ms).await;
        }
        if let Some(to) = transition {
            if let Err(e) = self.set_availability(id, to).await {
                warn!(agent_id = %id, error = %e, "failed to persist availability change");
            }
        }
    }

    /// Periodic health loop; runs until the handle is aborted.
    pub fn spawn_health_loop(
        self: &Arc<Self>,
        transport: Arc<dyn AgentTransport>,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = Duration::from_secs(registry.config.probe_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.probe_once(transport.as_ref()).await;
            }
        })
    }

    async fn insert(&self, record: AgentRecord) {
        self.agents.write().await.insert(
            record.id.clone(),
            AgentState {
                record,
                failure_streak: 0,
                next_probe: Instant::now(),
            },
        );
    }
}
