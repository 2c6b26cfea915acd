//! The central task state machine.
//!
//! Every tool call lands here. The orchestrator owns the per-task control
//! flow: routing on creation, dispatch or expectation registration, stage
//! advancement for sequential and review work, adaptive upgrades, explicit
//! completion and cancellation. Per-task critical sections serialize state
//! transitions; the store's compare-and-set catches anything that races
//! past them.

use crate::{
    agents::{AgentTransport, ContextProvider, ContextSnippet},
    config::Settings,
    consensus::{ConsensusEngine, ROUND_KEY},
    events::EventBus,
    models::{
        ConsensusStrategy, Decision, Directives, DomainEvent, Proposal, ProposalKind,
        RoutingStrategy, Task, TaskStatus, TaskType, WorkflowRole,
    },
    registry::AgentRegistry,
    routing::{RoutingDecision, RoutingEngine},
    store::{Store, TaskFilter, TaskPatch},
    validation, QuorumError, Result,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Metadata key tracking which stage of a staged workflow is active.
const STAGE_KEY: &str = "workflow.stage";
/// Metadata key marking an adaptive task that was upgraded to consensus.
const UPGRADED_KEY: &str = "adaptive.upgraded";

/// Domain-level input for task creation.
#[derive(Debug, Clone)]
pub struct TaskIntake {
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub role: WorkflowRole,
    pub complexity: u8,
    pub risk: u8,
    pub creator: String,
    pub directives: Directives,
}

/// Task creation result: the stored task plus how it was routed.
#[derive(Debug, Clone)]
pub struct RoutedTask {
    pub task: Task,
    pub routing: RoutingDecision,
}

/// Domain-level input for a proposal submission.
#[derive(Debug, Clone)]
pub struct SubmissionInput {
    pub task_id: String,
    pub agent_id: String,
    pub kind: ProposalKind,
    pub confidence: f64,
    pub content: String,
    pub metadata: HashMap<String, String>,
}

/// Domain-level input for explicit completion.
#[derive(Debug, Clone)]
pub struct CompletionInput {
    pub task_id: String,
    pub caller: String,
    pub result_summary: String,
    pub considered: Vec<String>,
    pub selected: Option<String>,
    pub agreement_rate: f64,
    pub rationale: String,
}

/// Everything an agent needs to pick a task back up.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task: Task,
    pub proposals: Vec<Proposal>,
    pub decision: Option<Decision>,
    pub history: Vec<serde_json::Value>,
}

pub struct Orchestrator {
    store: Store,
    bus: EventBus,
    registry: Arc<AgentRegistry>,
    routing: RoutingEngine,
    consensus: Arc<ConsensusEngine>,
    transport: Arc<dyn AgentTransport>,
    context: Arc<dyn ContextProvider>,
    settings: Settings,
    task_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        bus: EventBus,
        registry: Arc<AgentRegistry>,
        routing: RoutingEngine,
        consensus: Arc<ConsensusEngine>,
        transport: Arc<dyn AgentTransport>,
        context: Arc<dyn ContextProvider>,
        settings: Settings,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            registry,
            routing,
            consensus,
            transport,
            context,
            settings,
            task_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn context_provider(&self) -> &Arc<dyn ContextProvider> {
        &self.context
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // ---- task creation ---------------------------------------------------

    pub async fn create_task(self: &Arc<Self>, intake: TaskIntake) -> Result<RoutedTask> {
        validation::validate_title("title", &intake.title)?;
        validation::validate_description("description", &intake.description)?;
        validation::validate_score("complexity", intake.complexity)?;
        validation::validate_score("risk", intake.risk)?;
        validation::validate_agent_id("agentId", &intake.creator)?;

        let task = Task::new(
            intake.title,
            intake.description,
            intake.task_type,
            intake.complexity,
            intake.risk,
            &intake.creator,
        )
        .with_role(intake.role);

        let routing = match self.routing.route(&task, &intake.directives).await {
            Ok(routing) => routing,
            Err(QuorumError::NoEligibleAgent(reason)) => {
                // Persist the dead-on-arrival task for the audit trail.
                let id = self.store.create_task(&task).await?;
                self.publish_created(&task);
                self.store
                    .update_task_status(
                        &id,
                        TaskStatus::Pending,
                        TaskStatus::Failed,
                        TaskPatch {
                            result_summary: Some(reason.clone()),
                            ..TaskPatch::default()
                        },
                    )
                    .await?;
                self.publish_transition(&id, TaskStatus::Pending, TaskStatus::Failed);
                self.bus.publish(DomainEvent::TaskFailed {
                    task_id: id,
                    reason: reason.clone(),
                });
                return Err(QuorumError::NoEligibleAgent(reason));
            }
            Err(e) => return Err(e),
        };

        let id = self.store.create_task(&task).await?;
        self.publish_created(&task);

        if routing.emergency_bypass {
            warn!(task_id = %id, creator = %task.created_by, "emergency consensus bypass");
        }

        let mut metadata = HashMap::new();
        metadata.insert("routing.reason".to_string(), routing.reason.clone());
        if routing.downgraded {
            metadata.insert("routing.downgraded".to_string(), "true".to_string());
        }
        if routing.emergency_bypass {
            metadata.insert("routing.emergency_bypass".to_string(), "true".to_string());
        }

        let assigned = self
            .store
            .update_task_status(
                &id,
                TaskStatus::Pending,
                TaskStatus::Assigned,
                TaskPatch {
                    assignees: Some(routing.assignees.clone()),
                    strategy: Some(routing.strategy),
                    metadata,
                    ..TaskPatch::default()
                },
            )
            .await?;
        self.publish_transition(&id, TaskStatus::Pending, TaskStatus::Assigned);
        self.bus.publish(DomainEvent::TaskAssigned {
            task_id: id.clone(),
            agents: routing.assignees.clone(),
        });

        let task = self.start_execution(assigned).await?;
        Ok(RoutedTask { task, routing })
    }

    /// Move a freshly assigned task into its collection phase.
    async fn start_execution(self: &Arc<Self>, task: Task) -> Result<Task> {
        match task.strategy {
            RoutingStrategy::Consensus | RoutingStrategy::Parallel => {
                let waiting = self
                    .store
                    .update_task_status(
                        &task.id,
                        TaskStatus::Assigned,
                        TaskStatus::WaitingInput,
                        TaskPatch::default(),
                    )
                    .await?;
                self.publish_transition(&task.id, TaskStatus::Assigned, TaskStatus::WaitingInput);
                self.consensus
                    .register_expectation(
                        &task.id,
                        waiting.assignees.clone(),
                        Duration::from_secs(self.settings.consensus.round_deadline_secs),
                        0,
                    )
                    .await;
                self.push_to_available(&waiting, &waiting.assignees).await;
                Ok(waiting)
            }
            RoutingStrategy::Sequential | RoutingStrategy::Review => {
                let mut metadata = HashMap::new();
                metadata.insert(STAGE_KEY.to_string(), "0".to_string());
                let waiting = self
                    .store
                    .update_task_status(
                        &task.id,
                        TaskStatus::Assigned,
                        TaskStatus::WaitingInput,
                        TaskPatch {
                            metadata,
                            ..TaskPatch::default()
                        },
                    )
                    .await?;
                self.publish_transition(&task.id, TaskStatus::Assigned, TaskStatus::WaitingInput);
                let first = waiting.assignees.first().cloned().unwrap_or_default();
                self.consensus
                    .register_expectation(
                        &task.id,
                        vec![first.clone()],
                        Duration::from_secs(self.settings.consensus.solo_deadline_secs),
                        0,
                    )
                    .await;
                self.push_to_available(&waiting, &[first]).await;
                Ok(waiting)
            }
            RoutingStrategy::Solo | RoutingStrategy::Assign | RoutingStrategy::Adaptive => {
                let primary = task.assignees.first().cloned().unwrap_or_default();
                let record = self.registry.lookup(&primary).await?;
                if self.transport.can_push(&record) {
                    let in_progress = self
                        .store
                        .update_task_status(
                            &task.id,
                            TaskStatus::Assigned,
                            TaskStatus::InProgress,
                            TaskPatch::default(),
                        )
                        .await?;
                    self.publish_transition(&task.id, TaskStatus::Assigned, TaskStatus::InProgress);
                    self.spawn_dispatch(&in_progress, primary, true);
                    Ok(in_progress)
                } else {
                    // Poll-only agent: park the task where get_pending_tasks
                    // will surface it and let the deadline backstop it.
                    let waiting = self
                        .store
                        .update_task_status(
                            &task.id,
                            TaskStatus::Assigned,
                            TaskStatus::WaitingInput,
                            TaskPatch::default(),
                        )
                        .await?;
                    self.publish_transition(&task.id, TaskStatus::Assigned, TaskStatus::WaitingInput);
                    self.consensus
                        .register_expectation(
                            &task.id,
                            vec![primary],
                            Duration::from_secs(self.settings.consensus.solo_deadline_secs),
                            0,
                        )
                        .await;
                    Ok(waiting)
                }
            }
        }
    }

    // ---- queries ---------------------------------------------------------

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.store.get_task(task_id).await
    }

    pub async fn pending_tasks(&self, agent_id: Option<&str>) -> Result<Vec<Task>> {
        match agent_id {
            Some(agent) => self.store.pending_for(agent).await,
            None => {
                let mut tasks = Vec::new();
                for status in [TaskStatus::Assigned, TaskStatus::WaitingInput] {
                    let (mut page, _) = self
                        .store
                        .list_tasks(&TaskFilter {
                            status: Some(status),
                            ..TaskFilter::default()
                        })
                        .await?;
                    tasks.append(&mut page);
                }
                tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                Ok(tasks)
            }
        }
    }

    pub async fn continue_task(&self, task_id: &str) -> Result<TaskContext> {
        let task = self.store.get_task(task_id).await?;
        let proposals = self.store.list_proposals(task_id).await?;
        let decision = self.store.get_decision(task_id).await?;
        let history = self.store.events_for_task(task_id, 200).await?;
        Ok(TaskContext {
            task,
            proposals,
            decision,
            history,
        })
    }

    /// Context snippets for an agent about to work a task. Provider
    /// failures degrade to an empty list.
    pub async fn context_for(&self, task: &Task, budget_tokens: usize) -> Vec<ContextSnippet> {
        let query = format!("{} {}", task.title, task.description);
        match self.context.query(&query, None, budget_tokens).await {
            Ok(snippets) => snippets,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "context provider unavailable, continuing without context");
                Vec::new()
            }
        }
    }

    // ---- proposal intake -------------------------------------------------

    pub async fn submit_input(self: &Arc<Self>, input: SubmissionInput) -> Result<String> {
        validation::validate_agent_id("agentId", &input.agent_id)?;
        validation::validate_confidence("confidence", input.confidence)?;
        validation::validate_proposal_content("content", &input.content)?;

        let _guard = self.task_lock(&input.task_id).await;
        let task = self.store.get_task(&input.task_id).await?;

        if task.status.is_terminal() {
            // Idempotence: an identical resubmission after completion still
            // answers with the stored proposal ID.
            if let Some(existing) = self
                .store
                .active_proposals(&task.id)
                .await?
                .into_iter()
                .find(|p| p.agent_id == input.agent_id && p.content == input.content)
            {
                return Ok(existing.id);
            }
            return Err(QuorumError::ConflictingState {
                task_id: task.id,
                expected: "an active task".to_string(),
                actual: task.status.as_str().to_string(),
            });
        }
        if !task.assignees.contains(&input.agent_id) {
            return Err(QuorumError::invalid(
                "agentId",
                format!("agent {} is not assigned to this task", input.agent_id),
            ));
        }
        if !matches!(
            task.status,
            TaskStatus::Assigned | TaskStatus::InProgress | TaskStatus::WaitingInput
        ) {
            return Err(QuorumError::ConflictingState {
                task_id: task.id,
                expected: "a task collecting input".to_string(),
                actual: task.status.as_str().to_string(),
            });
        }

        let mut proposal = Proposal::new(
            &input.task_id,
            &input.agent_id,
            input.kind,
            input.content,
            input.confidence,
        );
        proposal.metadata = input.metadata;
        let proposal_id = self.store.put_proposal(&proposal).await?;

        self.bus.publish(DomainEvent::ProposalSubmitted {
            task_id: input.task_id.clone(),
            proposal_id: proposal_id.clone(),
            agent_id: input.agent_id.clone(),
            confidence: input.confidence,
        });

        self.handle_proposal_arrival(task, &input.agent_id, input.confidence)
            .await?;
        Ok(proposal_id)
    }

    /// Post-submission control flow, shared by the polling path and the
    /// push-dispatch path. Caller holds the task lock.
    async fn handle_proposal_arrival(
        self: &Arc<Self>,
        task: Task,
        agent_id: &str,
        confidence: f64,
    ) -> Result<()> {
        match task.strategy {
            RoutingStrategy::Consensus | RoutingStrategy::Parallel => {
                self.consensus.note_proposal(&task.id, agent_id).await;
                Ok(())
            }
            RoutingStrategy::Sequential | RoutingStrategy::Review => {
                self.advance_stage(task, agent_id).await
            }
            RoutingStrategy::Adaptive => {
                let proposals = self.store.active_proposals(&task.id).await?;
                let threshold = self.settings.consensus.adaptive_upgrade_threshold;
                if proposals.len() == 1
                    && confidence < threshold
                    && !task.metadata.contains_key(UPGRADED_KEY)
                {
                    info!(
                        task_id = %task.id,
                        confidence,
                        threshold,
                        "low-confidence first proposal, upgrading to consensus"
                    );
                    return self.upgrade_to_consensus(task, agent_id).await;
                }
                self.finish_single(task, agent_id).await
            }
            RoutingStrategy::Solo | RoutingStrategy::Assign => {
                self.finish_single(task, agent_id).await
            }
        }
    }

    async fn finish_single(self: &Arc<Self>, task: Task, agent_id: &str) -> Result<()> {
        if self.consensus.has_expectation(&task.id).await {
            self.consensus.note_proposal(&task.id, agent_id).await;
            Ok(())
        } else {
            let fresh = self.store.get_task(&task.id).await?;
            self.consensus.finalize_single(&fresh).await
        }
    }

    /// Sequential and review workflows: the first proposal hands off to the
    /// second agent; the second proposal lets the expectation fire and the
    /// stage outputs are combined by the task's consensus strategy.
    async fn advance_stage(self: &Arc<Self>, task: Task, agent_id: &str) -> Result<()> {
        let stage: u32 = task
            .metadata
            .get(STAGE_KEY)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let first = task.assignees.first().cloned().unwrap_or_default();
        let second = task.assignees.get(1).cloned().unwrap_or_default();

        if stage == 0 && agent_id == first && !second.is_empty() {
            self.consensus.release(&task.id).await;
            let mut metadata = HashMap::new();
            metadata.insert(STAGE_KEY.to_string(), "1".to_string());
            let fresh = self
                .store
                .patch_task(
                    &task.id,
                    task.status,
                    TaskPatch {
                        metadata,
                        ..TaskPatch::default()
                    },
                )
                .await?;
            self.consensus
                .register_expectation(
                    &task.id,
                    vec![second.clone()],
                    Duration::from_secs(self.settings.consensus.solo_deadline_secs),
                    0,
                )
                .await;
            debug!(task_id = %task.id, to = %second, "stage handed off");
            self.push_to_available(&fresh, &[second]).await;
            Ok(())
        } else {
            self.consensus.note_proposal(&task.id, agent_id).await;
            Ok(())
        }
    }

    /// Convert an adaptive task to consensus without losing the proposal
    /// already collected; only agents that have not submitted are added.
    async fn upgrade_to_consensus(self: &Arc<Self>, task: Task, submitted: &str) -> Result<()> {
        let additional = match self
            .routing
            .upgrade_selection(&task, &[submitted.to_string()])
            .await
        {
            Ok(agents) => agents,
            Err(QuorumError::NoEligibleAgent(reason)) => {
                // Nobody to add; the single proposal has to stand.
                debug!(task_id = %task.id, %reason, "no upgrade candidates, finishing solo");
                return self.finish_single(task, submitted).await;
            }
            Err(e) => return Err(e),
        };

        let mut assignees = task.assignees.clone();
        for agent in &additional {
            if !assignees.contains(agent) {
                assignees.push(agent.clone());
            }
        }
        let mut metadata = HashMap::new();
        metadata.insert(UPGRADED_KEY.to_string(), "true".to_string());

        let patch = TaskPatch {
            assignees: Some(assignees),
            strategy: Some(RoutingStrategy::Consensus),
            metadata,
            ..TaskPatch::default()
        };
        let fresh = if task.status == TaskStatus::InProgress {
            let t = self
                .store
                .update_task_status(&task.id, TaskStatus::InProgress, TaskStatus::WaitingInput, patch)
                .await?;
            self.publish_transition(&task.id, TaskStatus::InProgress, TaskStatus::WaitingInput);
            t
        } else {
            self.store.patch_task(&task.id, task.status, patch).await?
        };

        self.bus.publish(DomainEvent::TaskAssigned {
            task_id: task.id.clone(),
            agents: additional.clone(),
        });

        if self.consensus.has_expectation(&task.id).await {
            self.consensus.extend_expectation(&task.id, &additional).await;
        } else {
            self.consensus
                .register_expectation(
                    &task.id,
                    additional.clone(),
                    Duration::from_secs(self.settings.consensus.round_deadline_secs),
                    0,
                )
                .await;
        }
        // The proposal that triggered the upgrade counts toward the
        // expectation; without this the round would only close on timeout.
        self.consensus.note_proposal(&task.id, submitted).await;
        self.push_to_available(&fresh, &additional).await;
        Ok(())
    }

    // ---- explicit completion and cancellation ----------------------------

    /// Only the creator may complete a task; completing an already-terminal
    /// task returns its current state unchanged.
    pub async fn complete_task(self: &Arc<Self>, input: CompletionInput) -> Result<Task> {
        let _guard = self.task_lock(&input.task_id).await;
        let task = self.store.get_task(&input.task_id).await?;
        if task.created_by != input.caller {
            return Err(QuorumError::Unauthorized(format!(
                "only the creator {} may complete this task",
                task.created_by
            )));
        }
        if task.status.is_terminal() {
            return Ok(task);
        }

        self.consensus.release(&task.id).await;

        // Walk the lifecycle to DECIDING so the decision write stays atomic
        // with the final transition.
        let mut current = task.clone();
        while current.status != TaskStatus::Deciding {
            let next = match current.status {
                TaskStatus::Pending => TaskStatus::Assigned,
                TaskStatus::Assigned => TaskStatus::InProgress,
                TaskStatus::InProgress | TaskStatus::WaitingInput => TaskStatus::Deciding,
                _ => break,
            };
            let from = current.status;
            current = self
                .store
                .update_task_status(&task.id, from, next, TaskPatch::default())
                .await?;
            self.publish_transition(&task.id, from, next);
        }

        let strategy = match task.strategy {
            RoutingStrategy::Consensus | RoutingStrategy::Parallel => {
                self.settings.consensus.default_strategy
            }
            _ => ConsensusStrategy::Solo,
        };
        let mut decision = Decision::new(&task.id, strategy);
        decision.consensus = input.agreement_rate >= self.settings.consensus.approval_threshold;
        decision.winning_proposal_id = input.selected.clone();
        decision.runner_up_ids = input
            .considered
            .iter()
            .filter(|id| Some(*id) != input.selected.as_ref())
            .cloned()
            .collect();
        decision.content = input.result_summary.clone();
        decision.confidence = input.agreement_rate.clamp(0.0, 1.0);
        decision.rationale = input.rationale;
        let proposals = self.store.active_proposals(&task.id).await?;
        decision.total_tokens = proposals
            .iter()
            .map(crate::consensus::strategies::proposal_tokens)
            .sum();

        let completed = self
            .store
            .complete_with_decision(&decision, TaskStatus::Deciding, Some(input.result_summary))
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
            task_id: completed.id.clone(),
        });
        self.drop_task_lock(&task.id).await;
        Ok(completed)
    }

    /// Atomically cancel a non-terminal task and release its expectation.
    /// Cancelling an already-terminal task returns its current state.
    pub async fn cancel_task(self: &Arc<Self>, task_id: &str, reason: &str) -> Result<Task> {
        let _guard = self.task_lock(task_id).await;
        let task = self.store.get_task(task_id).await?;
        if task.status.is_terminal() {
            return Ok(task);
        }
        self.consensus.release(task_id).await;
        let reason = if reason.is_empty() { "cancelled" } else { reason };
        let cancelled = self
            .store
            .update_task_status(
                task_id,
                task.status,
                TaskStatus::Cancelled,
                TaskPatch {
                    result_summary: Some(reason.to_string()),
                    ..TaskPatch::default()
                },
            )
            .await?;
        self.publish_transition(task_id, task.status, TaskStatus::Cancelled);
        self.bus.publish(DomainEvent::TaskFailed {
            task_id: task_id.to_string(),
            reason: format!("cancelled: {reason}"),
        });
        self.drop_task_lock(task_id).await;
        Ok(cancelled)
    }

    // ---- push dispatch ---------------------------------------------------

    /// Push the task prompt to any assignee with a push channel. Errors are
    /// logged; the collection deadline is the backstop for silent agents.
    async fn push_to_available(self: &Arc<Self>, task: &Task, agents: &[String]) {
        for agent_id in agents {
            match self.registry.lookup(agent_id).await {
                Ok(record) if self.transport.can_push(&record) => {
                    self.spawn_dispatch(task, agent_id.clone(), false);
                }
                Ok(_) => {}
                Err(e) => warn!(task_id = %task.id, agent_id, error = %e, "assignee missing from registry"),
            }
        }
    }

    /// Fire-and-track dispatch worker for one (task, agent) pair.
    /// `fail_task_on_error` is set for single-agent flows where the push is
    /// the only path to progress.
    fn spawn_dispatch(self: &Arc<Self>, task: &Task, agent_id: String, fail_task_on_error: bool) {
        let orchestrator = Arc::clone(self);
        let task = task.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.dispatch_with_retry(&task, &agent_id).await {
                error!(task_id = %task.id, agent_id, error = %e, "agent dispatch failed");
                if fail_task_on_error {
                    orchestrator.fail_task(&task.id, &format!("dispatch failed: {e}")).await;
                }
            }
        });
    }

    async fn dispatch_with_retry(self: &Arc<Self>, task: &Task, agent_id: &str) -> Result<()> {
        let record = self.registry.lookup(agent_id).await?;
        let prompt = self.build_prompt(task).await?;
        let deadline = Duration::from_secs(self.settings.agent_call.timeout_secs);
        let mut delay = Duration::from_millis(self.settings.agent_call.backoff_start_ms);

        let mut attempt = 0;
        let response = loop {
            let started = std::time::Instant::now();
            match self.transport.call(&record, &prompt, deadline).await {
                Ok(response) => {
                    self.registry
                        .record_latency(agent_id, started.elapsed().as_secs_f64() * 1000.0)
                        .await;
                    break response;
                }
                Err(e) if e.is_transient() && attempt < self.settings.agent_call.max_retries => {
                    attempt += 1;
                    warn!(
                        task_id = %task.id,
                        agent_id,
                        attempt,
                        error = %e,
                        "transient agent failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        };

        validation::validate_confidence("confidence", response.confidence)?;
        validation::validate_proposal_content("content", &response.content)?;

        let _guard = self.task_lock(&task.id).await;
        let fresh = self.store.get_task(&task.id).await?;
        if fresh.status.is_terminal() {
            debug!(task_id = %task.id, "response arrived after task settled, dropping");
            return Ok(());
        }
        let mut proposal = Proposal::new(
            &task.id,
            agent_id,
            default_kind(task),
            response.content,
            response.confidence,
        );
        proposal.tokens_in = response.tokens_in;
        proposal.tokens_out = response.tokens_out;
        let proposal_id = self.store.put_proposal(&proposal).await?;
        self.bus.publish(DomainEvent::ProposalSubmitted {
            task_id: task.id.clone(),
            proposal_id,
            agent_id: agent_id.to_string(),
            confidence: proposal.confidence,
        });
        self.handle_proposal_arrival(fresh, agent_id, proposal.confidence)
            .await
    }

    /// Prompt assembly: task framing, retrieved context, and any prior
    /// stage output for staged workflows.
    async fn build_prompt(&self, task: &Task) -> Result<String> {
        let mut prompt = format!(
            "Task: {}\nKind: {}\n\n{}",
            task.title,
            task.task_type.as_str(),
            task.description
        );

        let snippets = self.context_for(task, 2000).await;
        if !snippets.is_empty() {
            prompt.push_str("\n\nRelevant context:");
            for snippet in snippets {
                prompt.push_str(&format!("\n--- {}\n{}", snippet.source, snippet.content));
            }
        }

        let prior = self.store.active_proposals(&task.id).await?;
        if !prior.is_empty() {
            prompt.push_str("\n\nEarlier contributions:");
            for proposal in prior {
                prompt.push_str(&format!(
                    "\n--- from {} ({})\n{}",
                    proposal.agent_id,
                    proposal.kind.as_str(),
                    proposal.content
                ));
            }
        }
        if task.metadata.get(ROUND_KEY).is_some_and(|r| r != "0") {
            prompt.push_str("\n\nNo consensus was reached; refine your earlier answer.");
        }
        Ok(prompt)
    }

    async fn fail_task(self: &Arc<Self>, task_id: &str, reason: &str) {
        let _guard = self.task_lock(task_id).await;
        let Ok(task) = self.store.get_task(task_id).await else {
            return;
        };
        if task.status.is_terminal() {
            return;
        }
        self.consensus.release(task_id).await;
        match self
            .store
            .update_task_status(
                task_id,
                task.status,
                TaskStatus::Failed,
                TaskPatch {
                    result_summary: Some(reason.to_string()),
                    ..TaskPatch::default()
                },
            )
            .await
        {
            Ok(_) => {
                self.publish_transition(task_id, task.status, TaskStatus::Failed);
                self.bus.publish(DomainEvent::TaskFailed {
                    task_id: task_id.to_string(),
                    reason: reason.to_string(),
                });
            }
            Err(e) => warn!(task_id, error = %e, "could not mark task failed"),
        }
    }

    // ---- plumbing --------------------------------------------------------

    /// Terminal tasks never transition again; their lock entry can go.
    /// Holders of an outstanding guard keep the mutex alive through its Arc.
    async fn drop_task_lock(&self, task_id: &str) {
        self.task_locks.lock().await.remove(task_id);
    }

    async fn task_lock(&self, task_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.task_locks.lock().await;
            locks
                .entry(task_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    fn publish_created(&self, task: &Task) {
        self.bus.publish(DomainEvent::TaskCreated {
            task_id: task.id.clone(),
            task_type: task.task_type,
            strategy: task.strategy,
            created_by: task.created_by.clone(),
        });
    }

    fn publish_transition(&self, task_id: &str, from: TaskStatus, to: TaskStatus) {
        self.bus.publish(DomainEvent::TaskStatusChanged {
            task_id: task_id.to_string(),
            from,
            to,
        });
    }
}

/// Proposal kind an agent response defaults to, by task category.
fn default_kind(task: &Task) -> ProposalKind {
    match task.task_type {
        TaskType::Architecture => ProposalKind::ArchitecturalPlan,
        TaskType::Review => ProposalKind::CodeReview,
        TaskType::Research => ProposalKind::ResearchSummary,
        _ => ProposalKind::InitialSolution,
    }
}
