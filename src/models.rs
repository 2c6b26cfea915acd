use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr};
use uuid::Uuid;

/// A unit of work requested by an agent
///
/// Tasks are the fundamental record in Quorum Core. One agent opens a task,
/// the routing engine picks a strategy and assignees, other agents respond
/// with proposals, and a decision closes it. Once a task reaches a terminal
/// status it is immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    /// 1..=10, validated before persistence.
    pub complexity: u8,
    /// 1..=10, validated before persistence.
    pub risk: u8,
    pub strategy: RoutingStrategy,
    pub created_by: String,
    pub assignees: Vec<String>,
    pub status: TaskStatus,
    pub role: WorkflowRole,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub due_at: Option<chrono::DateTime<chrono::Utc>>,
    pub metadata: HashMap<String, String>,
    pub parent_id: Option<String>,
    pub result_summary: Option<String>,
}

impl Task {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        task_type: TaskType,
        complexity: u8,
        risk: u8,
        created_by: impl Into<String>,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            task_type,
            complexity,
            risk,
            strategy: RoutingStrategy::Adaptive,
            created_by: created_by.into(),
            assignees: Vec::new(),
            status: TaskStatus::Pending,
            role: WorkflowRole::Execution,
            created_at: now,
            updated_at: now,
            completed_at: None,
            due_at: None,
            metadata: HashMap::new(),
            parent_id: None,
            result_summary: None,
        }
    }

    pub fn with_role(mut self, role: WorkflowRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Closed set of task categories used for capability matching.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Implementation,
    Architecture,
    Review,
    Research,
    Bugfix,
    Documentation,
    Refactoring,
    Testing,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Implementation => "IMPLEMENTATION",
            TaskType::Architecture => "ARCHITECTURE",
            TaskType::Review => "REVIEW",
            TaskType::Research => "RESEARCH",
            TaskType::Bugfix => "BUGFIX",
            TaskType::Documentation => "DOCUMENTATION",
            TaskType::Refactoring => "REFACTORING",
            TaskType::Testing => "TESTING",
        }
    }

    /// Capabilities an assignee must support for this kind of work.
    pub fn required_capabilities(&self) -> Vec<Capability> {
        match self {
            TaskType::Implementation => vec![Capability::CodeGeneration],
            TaskType::Architecture => vec![Capability::Architecture, Capability::Planning],
            TaskType::Review => vec![Capability::CodeReview],
            TaskType::Research => vec![Capability::Research],
            TaskType::Bugfix => vec![Capability::Debugging, Capability::CodeGeneration],
            TaskType::Documentation => vec![Capability::Documentation],
            TaskType::Refactoring => vec![Capability::CodeGeneration, Capability::CodeReview],
            TaskType::Testing => vec![Capability::Testing, Capability::CodeGeneration],
        }
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IMPLEMENTATION" => Ok(TaskType::Implementation),
            "ARCHITECTURE" => Ok(TaskType::Architecture),
            "REVIEW" => Ok(TaskType::Review),
            "RESEARCH" => Ok(TaskType::Research),
            "BUGFIX" => Ok(TaskType::Bugfix),
            "DOCUMENTATION" => Ok(TaskType::Documentation),
            "REFACTORING" => Ok(TaskType::Refactoring),
            "TESTING" => Ok(TaskType::Testing),
            _ => Err(format!("unknown task type: {s}")),
        }
    }
}

/// Status lifecycle of a task
///
/// Transitions outside `can_transition` are rejected by the store as
/// conflicting state. `Completed`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    WaitingInput,
    Deciding,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Assigned => "ASSIGNED",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::WaitingInput => "WAITING_INPUT",
            TaskStatus::Deciding => "DECIDING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the lifecycle permits moving from `self` to `to`.
    pub fn can_transition(&self, to: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        // Any non-terminal task may fail or be cancelled.
        if matches!(to, TaskStatus::Failed | TaskStatus::Cancelled) {
            return true;
        }
        match (self, to) {
            (TaskStatus::Pending, TaskStatus::Assigned) => true,
            (TaskStatus::Assigned, TaskStatus::InProgress) => true,
            (TaskStatus::Assigned, TaskStatus::WaitingInput) => true,
            (TaskStatus::InProgress, TaskStatus::WaitingInput) => true,
            (TaskStatus::InProgress, TaskStatus::Deciding) => true,
            (TaskStatus::InProgress, TaskStatus::Completed) => true,
            (TaskStatus::WaitingInput, TaskStatus::InProgress) => true,
            (TaskStatus::WaitingInput, TaskStatus::Deciding) => true,
            (TaskStatus::Deciding, TaskStatus::Completed) => true,
            (TaskStatus::Deciding, TaskStatus::WaitingInput) => true,
            _ => false,
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "ASSIGNED" => Ok(TaskStatus::Assigned),
            "IN_PROGRESS" => Ok(TaskStatus::InProgress),
            "WAITING_INPUT" => Ok(TaskStatus::WaitingInput),
            "DECIDING" => Ok(TaskStatus::Deciding),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            "CANCELLED" => Ok(TaskStatus::Cancelled),
            _ => Err(format!("unknown task status: {s}")),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a task sits in a wider workflow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowRole {
    Execution,
    Review,
    FollowUp,
    Escalation,
}

impl WorkflowRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowRole::Execution => "EXECUTION",
            WorkflowRole::Review => "REVIEW",
            WorkflowRole::FollowUp => "FOLLOW_UP",
            WorkflowRole::Escalation => "ESCALATION",
        }
    }
}

impl FromStr for WorkflowRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EXECUTION" => Ok(WorkflowRole::Execution),
            "REVIEW" => Ok(WorkflowRole::Review),
            "FOLLOW_UP" => Ok(WorkflowRole::FollowUp),
            "ESCALATION" => Ok(WorkflowRole::Escalation),
            _ => Err(format!("unknown workflow role: {s}")),
        }
    }
}

/// How a task is executed across agents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoutingStrategy {
    Solo,
    Sequential,
    Parallel,
    Review,
    Consensus,
    Adaptive,
    Assign,
}

impl RoutingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingStrategy::Solo => "SOLO",
            RoutingStrategy::Sequential => "SEQUENTIAL",
            RoutingStrategy::Parallel => "PARALLEL",
            RoutingStrategy::Review => "REVIEW",
            RoutingStrategy::Consensus => "CONSENSUS",
            RoutingStrategy::Adaptive => "ADAPTIVE",
            RoutingStrategy::Assign => "ASSIGN",
        }
    }

    /// Strategies that collect proposals from several agents before a
    /// decision can be made.
    pub fn is_multi_agent(&self) -> bool {
        matches!(self, RoutingStrategy::Consensus | RoutingStrategy::Parallel)
    }
}

impl FromStr for RoutingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SOLO" => Ok(RoutingStrategy::Solo),
            "SEQUENTIAL" => Ok(RoutingStrategy::Sequential),
            "PARALLEL" => Ok(RoutingStrategy::Parallel),
            "REVIEW" => Ok(RoutingStrategy::Review),
            "CONSENSUS" => Ok(RoutingStrategy::Consensus),
            "ADAPTIVE" => Ok(RoutingStrategy::Adaptive),
            "ASSIGN" => Ok(RoutingStrategy::Assign),
            _ => Err(format!("unknown routing strategy: {s}")),
        }
    }
}

/// Caller-supplied routing hints carried on task creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Directives {
    pub force_consensus: bool,
    pub prevent_consensus: bool,
    pub skip_consensus: bool,
    pub assign_to_agent: Option<String>,
    pub is_emergency: bool,
    pub multi_stage: bool,
    pub original_text: Option<String>,
    pub notes: Option<String>,
}

/// An agent's response to a task
///
/// Immutable once submitted; a revision is a new proposal linked through
/// `revises`, and the store marks the earlier row superseded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub task_id: String,
    pub agent_id: String,
    pub kind: ProposalKind,
    pub content: String,
    /// 0..=1, validated before persistence.
    pub confidence: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub revises: Option<String>,
    pub superseded: bool,
    pub metadata: HashMap<String, String>,
}

impl Proposal {
    pub fn new(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        kind: ProposalKind,
        content: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            kind,
            content: content.into(),
            confidence,
            tokens_in: 0,
            tokens_out: 0,
            created_at: chrono::Utc::now(),
            revises: None,
            superseded: false,
            metadata: HashMap::new(),
        }
    }

    /// Agent-declared vote choice, when present. Voting falls back to
    /// content equality otherwise.
    pub fn choice(&self) -> Option<&str> {
        self.metadata.get("choice").map(String::as_str)
    }
}

/// Closed set of proposal content categories.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalKind {
    ArchitecturalPlan,
    CodeReview,
    ResearchSummary,
    InitialSolution,
    Refinement,
}

impl ProposalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalKind::ArchitecturalPlan => "ARCHITECTURAL_PLAN",
            ProposalKind::CodeReview => "CODE_REVIEW",
            ProposalKind::ResearchSummary => "RESEARCH_SUMMARY",
            ProposalKind::InitialSolution => "INITIAL_SOLUTION",
            ProposalKind::Refinement => "REFINEMENT",
        }
    }
}

impl FromStr for ProposalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ARCHITECTURAL_PLAN" => Ok(ProposalKind::ArchitecturalPlan),
            "CODE_REVIEW" => Ok(ProposalKind::CodeReview),
            "RESEARCH_SUMMARY" => Ok(ProposalKind::ResearchSummary),
            "INITIAL_SOLUTION" => Ok(ProposalKind::InitialSolution),
            "REFINEMENT" => Ok(ProposalKind::Refinement),
            _ => Err(format!("unknown proposal kind: {s}")),
        }
    }
}

/// The final record of how a task concluded; exactly one per terminal task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub task_id: String,
    pub strategy: ConsensusStrategy,
    pub consensus: bool,
    pub winning_proposal_id: Option<String>,
    pub runner_up_ids: Vec<String>,
    pub content: String,
    pub confidence: f64,
    pub total_tokens: u64,
    pub tokens_saved: u64,
    pub rationale: String,
    /// Set when the deadline fired before every expected proposal arrived.
    pub partial: bool,
    pub decided_at: chrono::DateTime<chrono::Utc>,
}

impl Decision {
    pub fn new(task_id: impl Into<String>, strategy: ConsensusStrategy) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            strategy,
            consensus: false,
            winning_proposal_id: None,
            runner_up_ids: Vec::new(),
            content: String::new(),
            confidence: 0.0,
            total_tokens: 0,
            tokens_saved: 0,
            rationale: String::new(),
            partial: false,
            decided_at: chrono::Utc::now(),
        }
    }
}

/// Named algorithm mapping a set of proposals to a Decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsensusStrategy {
    Solo,
    Voting,
    ReasoningQuality,
    Merge,
    TokenOptimization,
    RrfFusion,
}

impl ConsensusStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsensusStrategy::Solo => "SOLO",
            ConsensusStrategy::Voting => "VOTING",
            ConsensusStrategy::ReasoningQuality => "REASONING_QUALITY",
            ConsensusStrategy::Merge => "MERGE",
            ConsensusStrategy::TokenOptimization => "TOKEN_OPTIMIZATION",
            ConsensusStrategy::RrfFusion => "RRF_FUSION",
        }
    }
}

impl FromStr for ConsensusStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SOLO" => Ok(ConsensusStrategy::Solo),
            "VOTING" => Ok(ConsensusStrategy::Voting),
            "REASONING_QUALITY" => Ok(ConsensusStrategy::ReasoningQuality),
            "MERGE" => Ok(ConsensusStrategy::Merge),
            "TOKEN_OPTIMIZATION" => Ok(ConsensusStrategy::TokenOptimization),
            "RRF_FUSION" => Ok(ConsensusStrategy::RrfFusion),
            _ => Err(format!("unknown consensus strategy: {s}")),
        }
    }
}

/// Closed capability vocabulary agents advertise strengths for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    CodeGeneration,
    Architecture,
    CodeReview,
    Research,
    Debugging,
    Documentation,
    Planning,
    Testing,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::CodeGeneration => "CODE_GENERATION",
            Capability::Architecture => "ARCHITECTURE",
            Capability::CodeReview => "CODE_REVIEW",
            Capability::Research => "RESEARCH",
            Capability::Debugging => "DEBUGGING",
            Capability::Documentation => "DOCUMENTATION",
            Capability::Planning => "PLANNING",
            Capability::Testing => "TESTING",
        }
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CODE_GENERATION" => Ok(Capability::CodeGeneration),
            "ARCHITECTURE" => Ok(Capability::Architecture),
            "CODE_REVIEW" => Ok(Capability::CodeReview),
            "RESEARCH" => Ok(Capability::Research),
            "DEBUGGING" => Ok(Capability::Debugging),
            "DOCUMENTATION" => Ok(Capability::Documentation),
            "PLANNING" => Ok(Capability::Planning),
            "TESTING" => Ok(Capability::Testing),
            _ => Err(format!("unknown capability: {s}")),
        }
    }
}

/// Agent liveness as seen by the registry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentAvailability {
    Online,
    Busy,
    Offline,
}

impl AgentAvailability {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentAvailability::Online => "ONLINE",
            AgentAvailability::Busy => "BUSY",
            AgentAvailability::Offline => "OFFLINE",
        }
    }
}

impl FromStr for AgentAvailability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ONLINE" => Ok(AgentAvailability::Online),
            "BUSY" => Ok(AgentAvailability::Busy),
            "OFFLINE" => Ok(AgentAvailability::Offline),
            _ => Err(format!("unknown availability: {s}")),
        }
    }
}

/// Registry record for a participating agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    /// Free-form type tag, e.g. "terminal-assistant" or "cli-agent".
    pub kind: String,
    pub display_name: String,
    /// Per-capability strength score in 0..=1.
    pub capabilities: HashMap<Capability, f64>,
    pub availability: AgentAvailability,
    pub endpoint: Option<String>,
    pub last_health_check: Option<chrono::DateTime<chrono::Utc>>,
    pub latency_ema_ms: f64,
}

impl AgentRecord {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            display_name: display_name.into(),
            capabilities: HashMap::new(),
            availability: AgentAvailability::Online,
            endpoint: None,
            last_health_check: None,
            latency_ema_ms: 0.0,
        }
    }

    pub fn with_capability(mut self, capability: Capability, strength: f64) -> Self {
        self.capabilities.insert(capability, strength);
        self
    }

    pub fn strength(&self, capability: Capability) -> f64 {
        self.capabilities.get(&capability).copied().unwrap_or(0.0)
    }

    pub fn supports_all(&self, required: &[Capability]) -> bool {
        required.iter().all(|c| self.capabilities.contains_key(c))
    }
}

/// Tagged sum over the domain events carried by the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    TaskCreated {
        task_id: String,
        task_type: TaskType,
        strategy: RoutingStrategy,
        created_by: String,
    },
    TaskStatusChanged {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    TaskAssigned {
        task_id: String,
        agents: Vec<String>,
    },
    ProposalSubmitted {
        task_id: String,
        proposal_id: String,
        agent_id: String,
        confidence: f64,
    },
    ConsensusReached {
        task_id: String,
        strategy: ConsensusStrategy,
    },
    DecisionMade {
        task_id: String,
        decision_id: String,
        consensus: bool,
    },
    TaskCompleted {
        task_id: String,
    },
    TaskFailed {
        task_id: String,
        reason: String,
    },
    AgentStatusChanged {
        agent_id: String,
        from: AgentAvailability,
        to: AgentAvailability,
    },
}

impl DomainEvent {
    /// SSE event name and metrics key for this variant.
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::TaskCreated { .. } => "task_created",
            DomainEvent::TaskStatusChanged { .. } => "task_status_changed",
            DomainEvent::TaskAssigned { .. } => "task_assigned",
            DomainEvent::ProposalSubmitted { .. } => "proposal_submitted",
            DomainEvent::ConsensusReached { .. } => "consensus_reached",
            DomainEvent::DecisionMade { .. } => "decision_made",
            DomainEvent::TaskCompleted { .. } => "task_completed",
            DomainEvent::TaskFailed { .. } => "task_failed",
            DomainEvent::AgentStatusChanged { .. } => "agent_status_changed",
        }
    }

    pub fn topic(&self) -> Topic {
        match self {
            DomainEvent::TaskCreated { .. }
            | DomainEvent::TaskStatusChanged { .. }
            | DomainEvent::TaskAssigned { .. }
            | DomainEvent::TaskCompleted { .. }
            | DomainEvent::TaskFailed { .. } => Topic::Tasks,
            DomainEvent::ProposalSubmitted { .. } => Topic::Proposals,
            DomainEvent::ConsensusReached { .. } | DomainEvent::DecisionMade { .. } => {
                Topic::Decisions
            }
            DomainEvent::AgentStatusChanged { .. } => Topic::Agents,
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            DomainEvent::TaskCreated { task_id, .. }
            | DomainEvent::TaskStatusChanged { task_id, .. }
            | DomainEvent::TaskAssigned { task_id, .. }
            | DomainEvent::ProposalSubmitted { task_id, .. }
            | DomainEvent::ConsensusReached { task_id, .. }
            | DomainEvent::DecisionMade { task_id, .. }
            | DomainEvent::TaskCompleted { task_id }
            | DomainEvent::TaskFailed { task_id, .. } => Some(task_id),
            DomainEvent::AgentStatusChanged { .. } => None,
        }
    }
}

/// Event bus topics. `All` receives every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Tasks,
    Proposals,
    Decisions,
    Agents,
    Metrics,
    All,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Tasks => "tasks",
            Topic::Proposals => "proposals",
            Topic::Decisions => "decisions",
            Topic::Agents => "agents",
            Topic::Metrics => "metrics",
            Topic::All => "*",
        }
    }

    /// The concrete topics an event is fanned out to (its own plus `*`).
    pub const CONCRETE: [Topic; 5] = [
        Topic::Tasks,
        Topic::Proposals,
        Topic::Decisions,
        Topic::Agents,
        Topic::Metrics,
    ];
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tasks" => Ok(Topic::Tasks),
            "proposals" => Ok(Topic::Proposals),
            "decisions" => Ok(Topic::Decisions),
            "agents" => Ok(Topic::Agents),
            "metrics" => Ok(Topic::Metrics),
            "*" => Ok(Topic::All),
            _ => Err(format!("unknown topic: {s}")),
        }
    }
}

/// An event with its bus-assigned sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(flatten)]
    pub event: DomainEvent,
}
