//! Proposal collection and decision making.
//!
//! When a task enters WAITING_INPUT the orchestrator registers an
//! expectation here: the agents it is waiting on and a deadline. Each
//! submitted proposal reduces the outstanding set; the engine fires when
//! the set is empty or the deadline elapses. Firing runs the task's
//! consensus strategy and writes the Decision together with the
//! DECIDING -> COMPLETED transition in one store transaction, so a failed
//! write leaves the task in DECIDING for the retry path.

pub mod strategies;

use crate::{
    config::{ConflictPolicy, ConsensusConfig},
    events::EventBus,
    models::{
        ConsensusStrategy, Decision, DomainEvent, Proposal, RoutingStrategy, Task, TaskStatus,
        WorkflowRole,
    },
    store::{Store, TaskPatch},
    QuorumError, Result,
};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use strategies::{estimate_tokens, proposal_tokens, StrategyOutcome};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Metadata key tracking the refinement round counter.
pub const ROUND_KEY: &str = "consensus.round";
/// Metadata key carrying a per-task strategy override.
pub const STRATEGY_KEY: &str = "consensus.strategy";

struct Expectation {
    expected: HashSet<String>,
    received: HashSet<String>,
    round: u32,
    timer: tokio::task::JoinHandle<()>,
}

pub struct ConsensusEngine {
    store: Store,
    bus: EventBus,
    config: ConsensusConfig,
    expectations: Mutex<HashMap<String, Expectation>>,
}

impl ConsensusEngine {
    pub fn new(store: Store, bus: EventBus, config: ConsensusConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            config,
            expectations: Mutex::new(HashMap::new()),
        })
    }

    /// Outstanding expectations, for introspection and tests.
    pub async fn pending_expectations(&self) -> usize {
        self.expectations.lock().await.len()
    }

    pub async fn has_expectation(&self, task_id: &str) -> bool {
        self.expectations.lock().await.contains_key(task_id)
    }

    /// Start (or restart) waiting on proposals from `expected` for a task.
    ///
    /// Boxed as a manual `Pin<Box<dyn Future>>` rather than an `async fn`:
    /// this function is part of a mutual-recursion cycle with `fire` (via
    /// the spawned timer task), and `async fn` would make the compiler try
    /// to inline an infinitely recursive opaque type when checking `Send`.
    pub fn register_expectation<'a>(
        self: &'a Arc<Self>,
        task_id: &'a str,
        expected: Vec<String>,
        deadline: Duration,
        round: u32,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let engine = Arc::clone(self);
            let timer_task = task_id.to_string();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                engine.fire(&timer_task, true).await;
            });

            let mut expectations = self.expectations.lock().await;
            if let Some(previous) = expectations.insert(
                task_id.to_string(),
                Expectation {
                    expected: expected.iter().cloned().collect(),
                    received: HashSet::new(),
                    round,
                    timer,
                },
            ) {
                previous.timer.abort();
            }
            debug!(task_id, agents = ?expected, round, "consensus expectation registered");
        })
    }

    /// Record one arrived proposal. Fires the evaluation when the
    /// expectation set is complete.
    pub async fn note_proposal(self: &Arc<Self>, task_id: &str, agent_id: &str) {
        let complete = {
            let mut expectations = self.expectations.lock().await;
            match expectations.get_mut(task_id) {
                Some(expectation) => {
                    expectation.received.insert(agent_id.to_string());
                    expectation
                        .expected
                        .iter()
                        .all(|agent| expectation.received.contains(agent))
                }
                None => return,
            }
        };
        if complete {
            self.fire(task_id, false).await;
        }
    }

    /// Extend an existing expectation with additional agents (adaptive
    /// upgrade). Proposals already received keep counting.
    pub async fn extend_expectation(&self, task_id: &str, additional: &[String]) {
        let mut expectations = self.expectations.lock().await;
        if let Some(expectation) = expectations.get_mut(task_id) {
            for agent in additional {
                expectation.expected.insert(agent.clone());
            }
        }
    }

    /// Drop any expectation for the task, cancelling its timer.
    pub async fn release(&self, task_id: &str) {
        if let Some(expectation) = self.expectations.lock().await.remove(task_id) {
            expectation.timer.abort();
            debug!(task_id, "consensus expectation released");
        }
    }

    /// Evaluate a task whose expectation completed or timed out.
    pub async fn fire(self: &Arc<Self>, task_id: &str, timed_out: bool) {
        let Some(expectation) = self.expectations.lock().await.remove(task_id) else {
            return;
        };
        expectation.timer.abort();
        let partial = timed_out
            && expectation
                .expected
                .iter()
                .any(|agent| !expectation.received.contains(agent));

        if let Err(e) = self
            .evaluate(task_id, partial, expectation.round, &expectation.expected)
            .await
        {
            match e {
                QuorumError::ConflictingState { .. } => {
                    debug!(task_id, "evaluation raced with another transition");
                }
                other => warn!(task_id, error = %other, "consensus evaluation failed"),
            }
        }
    }

    async fn evaluate(
        self: &Arc<Self>,
        task_id: &str,
        partial: bool,
        round: u32,
        expected: &HashSet<String>,
    ) -> Result<()> {
        let task = self.store.get_task(task_id).await?;
        if task.status.is_terminal() {
            return Ok(());
        }

        let deciding = self
            .store
            .update_task_status(task_id, task.status, TaskStatus::Deciding, TaskPatch::default())
            .await?;
        self.publish_transition(task_id, task.status, TaskStatus::Deciding);

        let proposals = self.store.active_proposals(task_id).await?;
        if proposals.is_empty() {
            let failure = QuorumError::NoProposals(task_id.to_string());
            let failed = self
                .store
                .update_task_status(
                    task_id,
                    TaskStatus::Deciding,
                    TaskStatus::Failed,
                    TaskPatch {
                        result_summary: Some(failure.to_string()),
                        ..TaskPatch::default()
                    },
                )
                .await?;
            self.publish_transition(task_id, TaskStatus::Deciding, TaskStatus::Failed);
            self.bus.publish(DomainEvent::TaskFailed {
                task_id: failed.id,
                reason: failure.to_string(),
            });
            return Ok(());
        }

        let strategy = self.strategy_for(&deciding);
        let outcome = strategies::execute(strategy, &proposals, &self.config);

        if !outcome.consensus {
            match self.config.on_no_consensus {
                ConflictPolicy::Accept => {}
                ConflictPolicy::Refine if round < self.config.max_rounds => {
                    return self.reopen_for_refinement(&deciding, round, expected).await;
                }
                _ => {
                    return self.escalate(&deciding).await;
                }
            }
        }

        self.record_decision(&deciding, strategy, outcome, &proposals, partial, expected.len())
            .await
    }

    /// Finalize a single-agent flow whose proposal just arrived. Used for
    /// SOLO, ASSIGN and un-upgraded ADAPTIVE tasks that were dispatched
    /// directly rather than through an expectation.
    pub async fn finalize_single(self: &Arc<Self>, task: &Task) -> Result<()> {
        let deciding = self
            .store
            .update_task_status(&task.id, task.status, TaskStatus::Deciding, TaskPatch::default())
            .await?;
        self.publish_transition(&task.id, task.status, TaskStatus::Deciding);

        let proposals = self.store.active_proposals(&task.id).await?;
        let outcome = strategies::execute(ConsensusStrategy::Solo, &proposals, &self.config);
        self.record_decision(&deciding, ConsensusStrategy::Solo, outcome, &proposals, false, 1)
            .await
    }

    async fn reopen_for_refinement(
        self: &Arc<Self>,
        task: &Task,
        round: u32,
        expected: &HashSet<String>,
    ) -> Result<()> {
        let next_round = round + 1;
        info!(task_id = %task.id, round = next_round, "no consensus, requesting refinements");
        let mut metadata = HashMap::new();
        metadata.insert(ROUND_KEY.to_string(), next_round.to_string());
        self.store
            .update_task_status(
                &task.id,
                TaskStatus::Deciding,
                TaskStatus::WaitingInput,
                TaskPatch {
                    metadata,
                    ..TaskPatch::default()
                },
            )
            .await?;
        self.publish_transition(&task.id, TaskStatus::Deciding, TaskStatus::WaitingInput);
        self.register_expectation(
            &task.id,
            expected.iter().cloned().collect(),
            Duration::from_secs(self.config.round_deadline_secs),
            next_round,
        )
        .await;
        Ok(())
    }

    async fn escalate(self: &Arc<Self>, task: &Task) -> Result<()> {
        warn!(task_id = %task.id, "no consensus, escalating for explicit completion");
        let mut metadata = HashMap::new();
        metadata.insert("consensus.escalated".to_string(), "true".to_string());
        self.store
            .update_task_status(
                &task.id,
                TaskStatus::Deciding,
                TaskStatus::WaitingInput,
                TaskPatch {
                    role: Some(WorkflowRole::Escalation),
                    metadata,
                    ..TaskPatch::default()
                },
            )
            .await?;
        self.publish_transition(&task.id, TaskStatus::Deciding, TaskStatus::WaitingInput);
        Ok(())
    }

    async fn record_decision(
        self: &Arc<Self>,
        task: &Task,
        strategy: ConsensusStrategy,
        outcome: StrategyOutcome,
        proposals: &[Proposal],
        partial: bool,
        expected_agents: usize,
    ) -> Result<()> {
        let (total_tokens, tokens_saved) =
            token_accounting(task, proposals, expected_agents.max(proposals.len()));

        let mut decision = Decision::new(&task.id, strategy);
        decision.consensus = outcome.consensus;
        decision.winning_proposal_id = outcome.winning_proposal_id;
        decision.runner_up_ids = outcome.runner_up_ids;
        decision.content = outcome.content;
        decision.confidence = outcome.confidence;
        decision.total_tokens = total_tokens;
        decision.tokens_saved = tokens_saved;
        decision.rationale = decision_rationale(task, &outcome.rationale);
        decision.partial = partial;

        let summary = summarize(&decision.content);
        let completed = self
            .store
            .complete_with_decision(&decision, TaskStatus::Deciding, Some(summary))
            .await?;

        if decision.consensus {
            self.bus.publish(DomainEvent::ConsensusReached {
                task_id: task.id.clone(),
                strategy,
            });
        }
        self.bus.publish(DomainEvent::DecisionMade {
            task_id: task.id.clone(),
            decision_id: decision.id.clone(),
            consensus: decision.consensus,
        });
        self.publish_transition(&task.id, TaskStatus::Deciding, TaskStatus::Completed);
        self.bus.publish(DomainEvent::TaskCompleted {
            task_id: completed.id,
        });
        info!(
            task_id = %task.id,
            strategy = strategy.as_str(),
            consensus = decision.consensus,
            partial,
            "decision recorded"
        );
        Ok(())
    }

    /// Strategy selection: per-task metadata override, otherwise derived
    /// from the routing strategy.
    fn strategy_for(&self, task: &Task) -> ConsensusStrategy {
        if let Some(name) = task.metadata.get(STRATEGY_KEY) {
            if let Ok(strategy) = ConsensusStrategy::from_str(name) {
                return strategy;
            }
            warn!(task_id = %task.id, name, "unknown strategy override, using default");
        }
        match task.strategy {
            RoutingStrategy::Consensus => self.config.default_strategy,
            RoutingStrategy::Parallel => ConsensusStrategy::RrfFusion,
            RoutingStrategy::Sequential => ConsensusStrategy::Merge,
            RoutingStrategy::Review => ConsensusStrategy::ReasoningQuality,
            RoutingStrategy::Solo | RoutingStrategy::Assign | RoutingStrategy::Adaptive => {
                ConsensusStrategy::Solo
            }
        }
    }

    fn publish_transition(&self, task_id: &str, from: TaskStatus, to: TaskStatus) {
        self.bus.publish(DomainEvent::TaskStatusChanged {
            task_id: task_id.to_string(),
            from,
            to,
        });
    }
}

/// Actual spend versus every participant solving the task alone: the
/// worst case is each one paying the task prompt again, and the saving is
/// that sum minus what collection actually consumed, clamped to zero when
/// collection outspent it.
fn token_accounting(task: &Task, proposals: &[Proposal], participants: usize) -> (u64, u64) {
    let actual: u64 = proposals.iter().map(proposal_tokens).sum();
    let prompt_estimate = estimate_tokens(&task.title) + estimate_tokens(&task.description);
    let worst_case = participants as u64 * prompt_estimate;
    (actual, worst_case.saturating_sub(actual))
}

fn decision_rationale(task: &Task, strategy_rationale: &str) -> String {
    let mut rationale = strategy_rationale.to_string();
    if task.metadata.get("routing.emergency_bypass").map(String::as_str) == Some("true") {
        rationale.push_str("; emergency consensus bypass was in effect");
    }
    if let Some(reason) = task.metadata.get("routing.reason") {
        rationale.push_str(&format!("; routed as: {reason}"));
    }
    rationale
}

fn summarize(content: &str) -> String {
    const MAX: usize = 400;
    if content.len() <= MAX {
        content.to_string()
    } else {
        let mut cut = MAX;
        while !content.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &content[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProposalKind, TaskType};

    fn engine() -> (Arc<ConsensusEngine>, Store, EventBus) {
        let store = Store::open_in_memory().unwrap();
        let bus = EventBus::new(256);
        let engine = ConsensusEngine::new(store.clone(), bus.clone(), ConsensusConfig::default());
        (engine, store, bus)
    }

    async fn waiting_task(store: &Store, assignees: &[&str]) -> Task {
        let mut task = Task::new(
            "Choose a cache eviction policy",
            "LRU or LFU for the hot path cache",
            TaskType::Architecture,
            8,
            6,
            "creator",
        );
        task.strategy = RoutingStrategy::Consensus;
        let id = store.create_task(&task).await.unwrap();
        store
            .update_task_status(&id, TaskStatus::Pending, TaskStatus::Assigned, TaskPatch {
                assignees: Some(assignees.iter().map(|s| s.to_string()).collect()),
                ..TaskPatch::default()
            })
            .await
            .unwrap();
        store
            .update_task_status(&id, TaskStatus::Assigned, TaskStatus::WaitingInput, TaskPatch::default())
            .await
            .unwrap()
    }

    async fn submit(store: &Store, task_id: &str, agent: &str, content: &str, confidence: f64) {
        let proposal = Proposal::new(task_id, agent, ProposalKind::ArchitecturalPlan, content, confidence);
        store.put_proposal(&proposal).await.unwrap();
    }

    #[tokio::test]
    async fn all_proposals_arriving_completes_the_task() {
        let (engine, store, _bus) = engine();
        let task = waiting_task(&store, &["agent-a", "agent-b"]).await;
        engine
            .register_expectation(&task.id, vec!["agent-a".into(), "agent-b".into()], Duration::from_secs(60), 0)
            .await;

        submit(&store, &task.id, "agent-a", "use LRU", 0.9).await;
        engine.note_proposal(&task.id, "agent-a").await;
        assert_eq!(store.get_task(&task.id).await.unwrap().status, TaskStatus::WaitingInput);

        submit(&store, &task.id, "agent-b", "use LRU", 0.8).await;
        engine.note_proposal(&task.id, "agent-b").await;

        let done = store.get_task(&task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        let decision = store.get_decision(&task.id).await.unwrap().unwrap();
        assert!(decision.consensus);
        assert_eq!(decision.strategy, ConsensusStrategy::Voting);
        assert!(!decision.partial);
        assert_eq!(engine.pending_expectations().await, 0);
    }

    #[tokio::test]
    async fn deadline_with_partial_proposals_records_partial_decision() {
        let (engine, store, _bus) = engine();
        let task = waiting_task(&store, &["agent-a", "agent-b", "agent-c"]).await;
        engine
            .register_expectation(
                &task.id,
                vec!["agent-a".into(), "agent-b".into(), "agent-c".into()],
                Duration::from_millis(50),
                0,
            )
            .await;

        submit(&store, &task.id, "agent-a", "use LRU", 0.9).await;
        engine.note_proposal(&task.id, "agent-a").await;
        submit(&store, &task.id, "agent-b", "use LRU", 0.7).await;
        engine.note_proposal(&task.id, "agent-b").await;

        tokio::time::sleep(Duration::from_millis(200)).await;

        let done = store.get_task(&task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        let decision = store.get_decision(&task.id).await.unwrap().unwrap();
        assert!(decision.partial);
    }

    #[tokio::test]
    async fn deadline_with_no_proposals_fails_the_task() {
        let (engine, store, _bus) = engine();
        let task = waiting_task(&store, &["agent-a", "agent-b"]).await;
        engine
            .register_expectation(&task.id, vec!["agent-a".into(), "agent-b".into()], Duration::from_millis(30), 0)
            .await;

        tokio::time::sleep(Duration::from_millis(150)).await;

        let failed = store.get_task(&task.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.result_summary.unwrap().contains("no proposals"));
        assert!(store.get_decision(&task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn released_expectation_never_fires() {
        let (engine, store, _bus) = engine();
        let task = waiting_task(&store, &["agent-a"]).await;
        engine
            .register_expectation(&task.id, vec!["agent-a".into()], Duration::from_millis(30), 0)
            .await;
        engine.release(&task.id).await;

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(
            store.get_task(&task.id).await.unwrap().status,
            TaskStatus::WaitingInput
        );
    }

    #[tokio::test]
    async fn tokens_saved_clamps_to_zero_when_collection_outspends() {
        // Prompt estimate is tiny (1 + 1 tokens) while the proposals cost
        // 200; two solo runs would have been cheaper, so nothing is saved.
        let task = Task::new("t", "d", TaskType::Implementation, 5, 5, "c");
        let proposals = vec![
            Proposal::new("t", "a", ProposalKind::InitialSolution, "x".repeat(400), 0.5),
            Proposal::new("t", "b", ProposalKind::InitialSolution, "y".repeat(400), 0.5),
        ];
        let (total, saved) = token_accounting(&task, &proposals, 2);
        assert_eq!(total, 200);
        assert_eq!(saved, 0);
    }

    #[tokio::test]
    async fn tokens_saved_reflects_shared_prompt_cost() {
        // A long task prompt shared across three participants beats three
        // solo runs that would each have paid it again.
        let task = Task::new("t", "d".repeat(800), TaskType::Implementation, 5, 5, "c");
        let proposals = vec![
            Proposal::new("t", "a", ProposalKind::InitialSolution, "use a queue", 0.8),
            Proposal::new("t", "b", ProposalKind::InitialSolution, "use a queue", 0.7),
            Proposal::new("t", "c", ProposalKind::InitialSolution, "use a stack", 0.6),
        ];
        let (total, saved) = token_accounting(&task, &proposals, 3);
        // 201-token prompt estimate, three participants, 9 actual tokens.
        assert_eq!(total, 9);
        assert_eq!(saved, 3 * 201 - 9);
    }
}
