//! Routing: classify an incoming task, choose an execution strategy from
//! the decision table, and select assignees.
//!
//! The table is evaluated top-down, first match wins. Selection is
//! deterministic: strength vector on the required capabilities compared
//! lexicographically, then ascending latency EMA, then agent ID. The
//! chosen rule and any downgrade are reported so the orchestrator can
//! persist them in the task's audit metadata.

use crate::{
    config::RoutingConfig,
    models::{
        AgentAvailability, AgentRecord, Capability, Directives, RoutingStrategy, Task, TaskType,
    },
    registry::AgentRegistry,
    QuorumError, Result,
};
use regex::Regex;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

/// Keywords that force consensus regardless of scores.
const CRITICAL_KEYWORDS: &str = r"(?i)\b(security|auth|payment|data migration|critical)\b";

/// Outcome of routing one task.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub strategy: RoutingStrategy,
    pub assignees: Vec<String>,
    /// Which table rule matched, for the audit trail.
    pub reason: String,
    /// CONSENSUS was requested but only one agent was eligible.
    pub downgraded: bool,
    /// SOLO forced on a risky task through the emergency directives.
    pub emergency_bypass: bool,
}

pub struct RoutingEngine {
    registry: Arc<AgentRegistry>,
    config: RoutingConfig,
    critical: Regex,
}

impl RoutingEngine {
    pub fn new(registry: Arc<AgentRegistry>, config: RoutingConfig) -> Result<Self> {
        let critical = Regex::new(CRITICAL_KEYWORDS)
            .map_err(|e| QuorumError::Configuration(format!("keyword pattern: {e}")))?;
        Ok(Self {
            registry,
            config,
            critical,
        })
    }

    /// Apply the decision table and select assignees.
    pub async fn route(&self, task: &Task, directives: &Directives) -> Result<RoutingDecision> {
        let decision = self.classify(task, directives).await?;
        info!(
            task_id = %task.id,
            strategy = decision.strategy.as_str(),
            assignees = ?decision.assignees,
            reason = %decision.reason,
            "task routed"
        );
        Ok(decision)
    }

    async fn classify(&self, task: &Task, directives: &Directives) -> Result<RoutingDecision> {
        // Direct hand-off beats everything when the target is someone else.
        if let Some(target) = &directives.assign_to_agent {
            if target != &task.created_by {
                if !self.registry.contains(target).await {
                    return Err(QuorumError::invalid(
                        "directives.assignToAgent",
                        format!("unknown agent {target}"),
                    ));
                }
                return Ok(RoutingDecision {
                    strategy: RoutingStrategy::Assign,
                    assignees: vec![target.clone()],
                    reason: format!("direct hand-off to {target}"),
                    downgraded: false,
                    emergency_bypass: false,
                });
            }
        }

        if directives.force_consensus {
            return self
                .consensus_selection(task, "consensus forced by directive")
                .await;
        }

        if directives.prevent_consensus && directives.is_emergency {
            let mut decision = self
                .solo_selection(task, RoutingStrategy::Solo, "emergency consensus bypass")
                .await?;
            decision.emergency_bypass = true;
            return Ok(decision);
        }

        if directives.skip_consensus {
            return self
                .solo_selection(task, RoutingStrategy::Solo, "consensus skipped by directive")
                .await;
        }

        if task.complexity <= self.config.solo_max_complexity && task.risk <= self.config.solo_max_risk
        {
            return self
                .solo_selection(task, RoutingStrategy::Solo, "low complexity and risk")
                .await;
        }

        let keyword = self.critical_keyword(task);
        if task.risk >= self.config.consensus_risk
            || task.complexity >= self.config.consensus_complexity
            || keyword.is_some()
        {
            let reason = match keyword {
                Some(word) => format!("critical keyword '{word}'"),
                None => "high complexity or risk".to_string(),
            };
            return self.consensus_selection(task, &reason).await;
        }

        if task.task_type == TaskType::Review {
            return self.review_selection(task).await;
        }

        if directives.multi_stage {
            return self.sequential_selection(task).await;
        }

        // Everything else starts solo and may upgrade mid-workflow.
        self.solo_selection(task, RoutingStrategy::Adaptive, "adaptive default")
            .await
    }

    fn critical_keyword(&self, task: &Task) -> Option<String> {
        let haystack = format!("{} {}", task.title, task.description);
        self.critical
            .find(&haystack)
            .map(|m| m.as_str().to_lowercase())
    }

    // ---- selection -------------------------------------------------------

    /// ONLINE agents supporting every required capability, best first.
    async fn ranked_candidates(&self, required: &[Capability]) -> Vec<AgentRecord> {
        let mut candidates: Vec<AgentRecord> = self
            .registry
            .all()
            .await
            .into_iter()
            .filter(|a| a.availability == AgentAvailability::Online && a.supports_all(required))
            .collect();
        sort_by_strength(&mut candidates, required);
        candidates
    }

    async fn solo_selection(
        &self,
        task: &Task,
        strategy: RoutingStrategy,
        reason: &str,
    ) -> Result<RoutingDecision> {
        let required = task.task_type.required_capabilities();
        let candidates = self.ranked_candidates(&required).await;
        let best = candidates
            .first()
            .ok_or_else(|| no_eligible(&required))?;
        Ok(RoutingDecision {
            strategy,
            assignees: vec![best.id.clone()],
            reason: reason.to_string(),
            downgraded: false,
            emergency_bypass: false,
        })
    }

    /// All ONLINE agents whose capability set intersects the requirements,
    /// minimum 2. With exactly one eligible agent the strategy downgrades
    /// to SOLO and the downgrade is recorded in the audit trail.
    async fn consensus_selection(&self, task: &Task, reason: &str) -> Result<RoutingDecision> {
        let required = task.task_type.required_capabilities();
        let mut candidates: Vec<AgentRecord> = self
            .registry
            .all()
            .await
            .into_iter()
            .filter(|a| {
                a.availability == AgentAvailability::Online
                    && required.iter().any(|c| a.capabilities.contains_key(c))
            })
            .collect();
        sort_by_strength(&mut candidates, &required);
        candidates.truncate(self.config.max_consensus_participants.max(2));

        match candidates.len() {
            0 => Err(no_eligible(&required)),
            1 => {
                debug!(task_id = %task.id, "single eligible agent, downgrading consensus to solo");
                Ok(RoutingDecision {
                    strategy: RoutingStrategy::Solo,
                    assignees: vec![candidates[0].id.clone()],
                    reason: format!("{reason}; downgraded to solo, one eligible agent"),
                    downgraded: true,
                    emergency_bypass: false,
                })
            }
            _ => Ok(RoutingDecision {
                strategy: RoutingStrategy::Consensus,
                assignees: candidates.into_iter().map(|a| a.id).collect(),
                reason: reason.to_string(),
                downgraded: false,
                emergency_bypass: false,
            }),
        }
    }

    /// Top-K distinct agents by capability strength.
    pub async fn parallel_selection(&self, task: &Task) -> Result<RoutingDecision> {
        let required = task.task_type.required_capabilities();
        let mut candidates = self.ranked_candidates(&required).await;
        if candidates.is_empty() {
            return Err(no_eligible(&required));
        }
        candidates.truncate(self.config.parallel_fanout);
        Ok(RoutingDecision {
            strategy: RoutingStrategy::Parallel,
            assignees: candidates.into_iter().map(|a| a.id).collect(),
            reason: "parallel fan-out".to_string(),
            downgraded: false,
            emergency_bypass: false,
        })
    }

    /// Ordered [planner, implementer] pair, each the strongest on its
    /// capability; distinct agents when the registry allows it.
    async fn sequential_selection(&self, task: &Task) -> Result<RoutingDecision> {
        let planners = self.ranked_candidates(&[Capability::Planning]).await;
        let planner = planners
            .first()
            .ok_or_else(|| no_eligible(&[Capability::Planning]))?;

        let required = task.task_type.required_capabilities();
        let implementers = self.ranked_candidates(&required).await;
        let implementer = implementers
            .iter()
            .find(|a| a.id != planner.id)
            .or_else(|| implementers.first())
            .ok_or_else(|| no_eligible(&required))?;

        Ok(RoutingDecision {
            strategy: RoutingStrategy::Sequential,
            assignees: vec![planner.id.clone(), implementer.id.clone()],
            reason: "multi-stage plan".to_string(),
            downgraded: false,
            emergency_bypass: false,
        })
    }

    /// [author (caller), next-best reviewer].
    async fn review_selection(&self, task: &Task) -> Result<RoutingDecision> {
        let reviewers = self.ranked_candidates(&[Capability::CodeReview]).await;
        let reviewer = reviewers
            .iter()
            .find(|a| a.id != task.created_by)
            .ok_or_else(|| no_eligible(&[Capability::CodeReview]))?;
        Ok(RoutingDecision {
            strategy: RoutingStrategy::Review,
            assignees: vec![task.created_by.clone(), reviewer.id.clone()],
            reason: "review hand-off".to_string(),
            downgraded: false,
            emergency_bypass: false,
        })
    }

    /// Additional consensus participants for an adaptive upgrade,
    /// excluding agents that already contributed.
    pub async fn upgrade_selection(
        &self,
        task: &Task,
        exclude: &[String],
    ) -> Result<Vec<String>> {
        let required = task.task_type.required_capabilities();
        let mut candidates: Vec<AgentRecord> = self
            .registry
            .all()
            .await
            .into_iter()
            .filter(|a| {
                a.availability == AgentAvailability::Online
                    && required.iter().any(|c| a.capabilities.contains_key(c))
                    && !exclude.contains(&a.id)
            })
            .collect();
        sort_by_strength(&mut candidates, &required);
        candidates.truncate(self.config.max_consensus_participants.max(2));
        if candidates.is_empty() {
            return Err(no_eligible(&required));
        }
        Ok(candidates.into_iter().map(|a| a.id).collect())
    }
}

fn no_eligible(required: &[Capability]) -> QuorumError {
    let wanted: Vec<&str> = required.iter().map(|c| c.as_str()).collect();
    QuorumError::NoEligibleAgent(format!(
        "no online agent supports [{}]",
        wanted.join(", ")
    ))
}

/// Deterministic candidate order: strength vector on the required
/// capabilities (lexicographic, descending), then latency EMA ascending,
/// then agent ID.
fn sort_by_strength(candidates: &mut [AgentRecord], required: &[Capability]) {
    candidates.sort_by(|a, b| {
        for capability in required {
            match b
                .strength(*capability)
                .partial_cmp(&a.strength(*capability))
                .unwrap_or(Ordering::Equal)
            {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        a.latency_ema_ms
            .partial_cmp(&b.latency_ema_ms)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::HealthConfig, events::EventBus, store::Store};

    async fn engine_with(agents: Vec<AgentRecord>) -> RoutingEngine {
        let registry = Arc::new(AgentRegistry::new(
            Store::open_in_memory().unwrap(),
            EventBus::new(64),
            HealthConfig::default(),
        ));
        for agent in agents {
            registry.register(agent).await.unwrap();
        }
        RoutingEngine::new(registry, RoutingConfig::default()).unwrap()
    }

    fn coder(id: &str, strength: f64) -> AgentRecord {
        AgentRecord::new(id, "cli-agent", id)
            .with_capability(Capability::CodeGeneration, strength)
            .with_capability(Capability::Debugging, strength)
    }

    fn simple_task(complexity: u8, risk: u8) -> Task {
        Task::new(
            "Tidy the readme",
            "Plain cleanup",
            TaskType::Implementation,
            complexity,
            risk,
            "creator",
        )
    }

    #[tokio::test]
    async fn low_scores_route_solo_to_strongest() {
        let engine = engine_with(vec![coder("agent-a", 0.6), coder("agent-b", 0.9)]).await;
        let decision = engine
            .route(&simple_task(2, 2), &Directives::default())
            .await
            .unwrap();
        assert_eq!(decision.strategy, RoutingStrategy::Solo);
        assert_eq!(decision.assignees, vec!["agent-b".to_string()]);
    }

    #[tokio::test]
    async fn high_risk_routes_consensus() {
        let engine = engine_with(vec![coder("agent-a", 0.6), coder("agent-b", 0.9)]).await;
        let decision = engine
            .route(&simple_task(4, 8), &Directives::default())
            .await
            .unwrap();
        assert_eq!(decision.strategy, RoutingStrategy::Consensus);
        assert_eq!(decision.assignees.len(), 2);
    }

    #[tokio::test]
    async fn critical_keyword_forces_consensus() {
        let engine = engine_with(vec![coder("agent-a", 0.6), coder("agent-b", 0.9)]).await;
        let mut task = simple_task(4, 4);
        task.description = "Rotate the auth token signing key".to_string();
        let decision = engine.route(&task, &Directives::default()).await.unwrap();
        assert_eq!(decision.strategy, RoutingStrategy::Consensus);
        assert!(decision.reason.contains("auth"));
    }

    #[tokio::test]
    async fn forced_consensus_beats_low_scores() {
        let engine = engine_with(vec![coder("agent-a", 0.6), coder("agent-b", 0.9)]).await;
        let directives = Directives {
            force_consensus: true,
            ..Directives::default()
        };
        let decision = engine.route(&simple_task(2, 2), &directives).await.unwrap();
        assert_eq!(decision.strategy, RoutingStrategy::Consensus);
    }

    #[tokio::test]
    async fn emergency_bypass_routes_solo_and_flags_audit() {
        let engine = engine_with(vec![coder("agent-a", 0.6), coder("agent-b", 0.9)]).await;
        let directives = Directives {
            prevent_consensus: true,
            is_emergency: true,
            ..Directives::default()
        };
        let decision = engine.route(&simple_task(5, 9), &directives).await.unwrap();
        assert_eq!(decision.strategy, RoutingStrategy::Solo);
        assert!(decision.emergency_bypass);
    }

    #[tokio::test]
    async fn single_eligible_agent_downgrades_consensus() {
        let engine = engine_with(vec![coder("agent-a", 0.8)]).await;
        let decision = engine
            .route(&simple_task(8, 8), &Directives::default())
            .await
            .unwrap();
        assert_eq!(decision.strategy, RoutingStrategy::Solo);
        assert!(decision.downgraded);
    }

    #[tokio::test]
    async fn empty_registry_yields_no_eligible_agent() {
        let engine = engine_with(vec![]).await;
        let err = engine
            .route(&simple_task(8, 8), &Directives::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QuorumError::NoEligibleAgent(_)));
    }

    #[tokio::test]
    async fn assign_directive_hands_off_directly() {
        let engine = engine_with(vec![coder("agent-b", 0.9)]).await;
        let directives = Directives {
            assign_to_agent: Some("agent-b".to_string()),
            ..Directives::default()
        };
        let decision = engine.route(&simple_task(5, 5), &directives).await.unwrap();
        assert_eq!(decision.strategy, RoutingStrategy::Assign);
        assert_eq!(decision.assignees, vec!["agent-b".to_string()]);
    }

    #[tokio::test]
    async fn mid_scores_default_to_adaptive() {
        let engine = engine_with(vec![coder("agent-a", 0.8), coder("agent-b", 0.6)]).await;
        let decision = engine
            .route(&simple_task(5, 5), &Directives::default())
            .await
            .unwrap();
        assert_eq!(decision.strategy, RoutingStrategy::Adaptive);
        assert_eq!(decision.assignees, vec!["agent-a".to_string()]);
    }

    #[tokio::test]
    async fn tie_breaks_on_latency_then_id() {
        let mut slow = coder("agent-a", 0.8);
        slow.latency_ema_ms = 900.0;
        let mut fast = coder("agent-b", 0.8);
        fast.latency_ema_ms = 50.0;
        let engine = engine_with(vec![slow, fast]).await;
        let decision = engine
            .route(&simple_task(2, 2), &Directives::default())
            .await
            .unwrap();
        assert_eq!(decision.assignees, vec!["agent-b".to_string()]);
    }
}
