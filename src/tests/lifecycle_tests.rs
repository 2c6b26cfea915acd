//! Full task lifecycles across orchestrator, consensus engine, store and
//! event bus: happy paths, forced and degraded consensus, timeouts,
//! upgrades, staged workflows, and cancellation.

use super::test_helpers::*;
use crate::{
    config::Settings,
    models::*,
    orchestrator::{CompletionInput, SubmissionInput, TaskIntake},
    QuorumError,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn intake(title: &str, task_type: TaskType, complexity: u8, risk: u8, creator: &str) -> TaskIntake {
    TaskIntake {
        title: title.to_string(),
        description: format!("{title} - details"),
        task_type,
        role: WorkflowRole::Execution,
        complexity,
        risk,
        creator: creator.to_string(),
        directives: Directives::default(),
    }
}

fn submission(task_id: &str, agent: &str, content: &str, confidence: f64) -> SubmissionInput {
    SubmissionInput {
        task_id: task_id.to_string(),
        agent_id: agent.to_string(),
        kind: ProposalKind::InitialSolution,
        confidence,
        content: content.to_string(),
        metadata: HashMap::new(),
    }
}

async fn wait_for_status(stack: &Stack, task_id: &str, wanted: TaskStatus) -> Task {
    timeout(Duration::from_secs(5), async {
        loop {
            let task = stack.store.get_task(task_id).await.unwrap();
            if task.status == wanted {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("task did not reach expected status in time")
}

#[tokio::test]
async fn solo_happy_path_via_push_dispatch() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script("agent-a", "Fixed the typo.", 0.9);
    let stack = stack_with(
        Settings::default(),
        transport.clone(),
        vec![versatile_agent("agent-a", 0.9)],
    )
    .await;

    let mut rx = stack.bus.subscribe_raw(Topic::Tasks);

    let routed = stack
        .orchestrator
        .create_task(intake("Fix typo in README", TaskType::Documentation, 1, 1, "agent-a"))
        .await
        .unwrap();
    assert_eq!(routed.routing.strategy, RoutingStrategy::Solo);

    let done = wait_for_status(&stack, &routed.task.id, TaskStatus::Completed).await;
    assert_eq!(done.assignees, vec!["agent-a".to_string()]);
    // Event publication trails the final commit by a moment.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let decision = stack.store.get_decision(&done.id).await.unwrap().unwrap();
    assert_eq!(decision.strategy, ConsensusStrategy::Solo);
    assert!(decision.consensus);
    let proposals = stack.store.active_proposals(&done.id).await.unwrap();
    assert_eq!(proposals.len(), 1);
    assert_eq!(decision.winning_proposal_id.as_deref(), Some(proposals[0].id.as_str()));

    // Status timeline arrives on the tasks topic in publish order.
    let mut transitions = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        if let DomainEvent::TaskStatusChanged { from, to, .. } = envelope.event {
            transitions.push((from, to));
        }
    }
    assert_eq!(transitions.first(), Some(&(TaskStatus::Pending, TaskStatus::Assigned)));
    assert_eq!(transitions.get(1), Some(&(TaskStatus::Assigned, TaskStatus::InProgress)));
    assert_eq!(
        transitions.last(),
        Some(&(TaskStatus::Deciding, TaskStatus::Completed))
    );

    // The dispatched prompt framed the task for the agent.
    let prompts = transport.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].1.contains("Fix typo in README"));
}

#[tokio::test]
async fn forced_consensus_on_low_risk_task() {
    let stack = polling_stack(vec![
        versatile_agent("agent-a", 0.9),
        versatile_agent("agent-b", 0.8),
    ])
    .await;

    let mut task_intake = intake("Tiny tweak", TaskType::Implementation, 2, 2, "agent-a");
    task_intake.directives.force_consensus = true;
    let routed = stack.orchestrator.create_task(task_intake).await.unwrap();
    assert_eq!(routed.routing.strategy, RoutingStrategy::Consensus);
    assert_eq!(routed.task.assignees.len(), 2);
    assert_eq!(routed.task.status, TaskStatus::WaitingInput);

    stack
        .orchestrator
        .submit_input(submission(&routed.task.id, "agent-a", "rename the flag", 0.9))
        .await
        .unwrap();
    stack
        .orchestrator
        .submit_input(submission(&routed.task.id, "agent-b", "rename the flag", 0.8))
        .await
        .unwrap();

    let done = wait_for_status(&stack, &routed.task.id, TaskStatus::Completed).await;
    let decision = stack.store.get_decision(&done.id).await.unwrap().unwrap();
    assert_eq!(decision.strategy, ConsensusStrategy::Voting);
    assert!(decision.consensus);
    assert_eq!(decision.runner_up_ids.len(), 1);
}

#[tokio::test]
async fn emergency_bypass_routes_solo_with_audit_trail() {
    let stack = polling_stack(vec![
        versatile_agent("agent-a", 0.9),
        versatile_agent("agent-b", 0.8),
    ])
    .await;

    let mut task_intake = intake("Hotfix prod crash", TaskType::Bugfix, 6, 9, "agent-a");
    task_intake.directives.prevent_consensus = true;
    task_intake.directives.is_emergency = true;
    let routed = stack.orchestrator.create_task(task_intake).await.unwrap();
    assert_eq!(routed.routing.strategy, RoutingStrategy::Solo);
    assert!(routed.routing.emergency_bypass);
    assert_eq!(
        routed.task.metadata.get("routing.emergency_bypass").map(String::as_str),
        Some("true")
    );

    stack
        .orchestrator
        .submit_input(submission(&routed.task.id, "agent-a", "rolled back the commit", 0.95))
        .await
        .unwrap();

    let done = wait_for_status(&stack, &routed.task.id, TaskStatus::Completed).await;
    let decision = stack.store.get_decision(&done.id).await.unwrap().unwrap();
    assert!(decision.rationale.contains("emergency consensus bypass"));
}

#[tokio::test]
async fn non_creator_completion_is_unauthorized() {
    let stack = polling_stack(vec![
        versatile_agent("agent-a", 0.9),
        versatile_agent("agent-b", 0.8),
    ])
    .await;
    let routed = stack
        .orchestrator
        .create_task(intake("Investigate latency", TaskType::Research, 5, 5, "agent-a"))
        .await
        .unwrap();

    let err = stack
        .orchestrator
        .complete_task(CompletionInput {
            task_id: routed.task.id.clone(),
            caller: "agent-b".to_string(),
            result_summary: "done".to_string(),
            considered: Vec::new(),
            selected: None,
            agreement_rate: 1.0,
            rationale: "not mine to close".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, QuorumError::Unauthorized(_)));

    let unchanged = stack.store.get_task(&routed.task.id).await.unwrap();
    assert!(!unchanged.status.is_terminal());
}

#[tokio::test]
async fn voting_tie_is_deterministic_and_records_runner_up() {
    let stack = polling_stack(vec![
        versatile_agent("agent-a", 0.9),
        versatile_agent("agent-b", 0.8),
    ])
    .await;

    let mut task_intake = intake("Pick serialization format", TaskType::Architecture, 2, 2, "agent-a");
    task_intake.directives.force_consensus = true;
    let routed = stack.orchestrator.create_task(task_intake).await.unwrap();

    stack
        .orchestrator
        .submit_input(submission(&routed.task.id, "agent-a", "use protobuf", 0.9))
        .await
        .unwrap();
    stack
        .orchestrator
        .submit_input(submission(&routed.task.id, "agent-b", "use json", 0.6))
        .await
        .unwrap();

    let done = wait_for_status(&stack, &routed.task.id, TaskStatus::Completed).await;
    let decision = stack.store.get_decision(&done.id).await.unwrap().unwrap();
    // One vote each: the tie breaks toward the higher-confidence group and
    // the 0.75 approval threshold is not met.
    assert!(!decision.consensus);
    assert_eq!(decision.runner_up_ids.len(), 1);
    let winner_id = decision.winning_proposal_id.unwrap();
    let proposals = stack.store.active_proposals(&done.id).await.unwrap();
    let winner = proposals.iter().find(|p| p.id == winner_id).unwrap();
    assert_eq!(winner.agent_id, "agent-a");
}

#[tokio::test]
async fn consensus_deadline_proceeds_with_partial_proposals() {
    let mut settings = Settings::default();
    settings.consensus.round_deadline_secs = 1;
    let stack = stack_with(
        settings,
        Arc::new(PollOnlyTransport),
        vec![
            versatile_agent("agent-a", 0.9),
            versatile_agent("agent-b", 0.8),
            versatile_agent("agent-c", 0.7),
        ],
    )
    .await;

    let mut task_intake = intake("Design retry policy", TaskType::Architecture, 8, 8, "agent-a");
    task_intake.directives.force_consensus = true;
    let routed = stack.orchestrator.create_task(task_intake).await.unwrap();
    assert_eq!(routed.task.assignees.len(), 3);

    stack
        .orchestrator
        .submit_input(submission(&routed.task.id, "agent-a", "exponential backoff", 0.9))
        .await
        .unwrap();
    stack
        .orchestrator
        .submit_input(submission(&routed.task.id, "agent-b", "exponential backoff", 0.8))
        .await
        .unwrap();
    // agent-c never answers; the deadline fires instead.

    let done = wait_for_status(&stack, &routed.task.id, TaskStatus::Completed).await;
    let decision = stack.store.get_decision(&done.id).await.unwrap().unwrap();
    assert!(decision.partial);
    assert!(decision.consensus);
    assert_eq!(stack.consensus.pending_expectations().await, 0);
}

#[tokio::test]
async fn consensus_deadline_with_no_proposals_fails_task() {
    let mut settings = Settings::default();
    settings.consensus.round_deadline_secs = 1;
    let stack = stack_with(
        settings,
        Arc::new(PollOnlyTransport),
        vec![versatile_agent("agent-a", 0.9), versatile_agent("agent-b", 0.8)],
    )
    .await;

    let mut task_intake = intake("Unanswered question", TaskType::Research, 8, 8, "agent-a");
    task_intake.directives.force_consensus = true;
    let routed = stack.orchestrator.create_task(task_intake).await.unwrap();

    let failed = wait_for_status(&stack, &routed.task.id, TaskStatus::Failed).await;
    assert!(failed.result_summary.unwrap().contains("no proposals"));
}

#[tokio::test]
async fn adaptive_task_upgrades_on_low_confidence() {
    let stack = polling_stack(vec![
        versatile_agent("agent-a", 0.9),
        versatile_agent("agent-b", 0.8),
    ])
    .await;

    let routed = stack
        .orchestrator
        .create_task(intake("Refactor the config loader", TaskType::Implementation, 5, 5, "agent-a"))
        .await
        .unwrap();
    assert_eq!(routed.routing.strategy, RoutingStrategy::Adaptive);
    assert_eq!(routed.task.assignees, vec!["agent-a".to_string()]);

    // First proposal is shaky: below the 0.6 upgrade threshold.
    stack
        .orchestrator
        .submit_input(submission(&routed.task.id, "agent-a", "maybe split the file?", 0.3))
        .await
        .unwrap();

    let upgraded = stack.store.get_task(&routed.task.id).await.unwrap();
    assert_eq!(upgraded.strategy, RoutingStrategy::Consensus);
    assert!(upgraded.assignees.contains(&"agent-b".to_string()));
    assert_eq!(
        upgraded.metadata.get("adaptive.upgraded").map(String::as_str),
        Some("true")
    );
    // The shaky proposal was kept.
    assert_eq!(stack.store.active_proposals(&routed.task.id).await.unwrap().len(), 1);

    stack
        .orchestrator
        .submit_input(submission(&routed.task.id, "agent-b", "split into three modules", 0.8))
        .await
        .unwrap();

    let done = wait_for_status(&stack, &routed.task.id, TaskStatus::Completed).await;
    let decision = stack.store.get_decision(&done.id).await.unwrap().unwrap();
    assert_eq!(decision.strategy, ConsensusStrategy::Voting);
}

#[tokio::test]
async fn adaptive_task_with_confident_proposal_stays_solo() {
    let stack = polling_stack(vec![
        versatile_agent("agent-a", 0.9),
        versatile_agent("agent-b", 0.8),
    ])
    .await;

    let routed = stack
        .orchestrator
        .create_task(intake("Add a retry helper", TaskType::Implementation, 5, 5, "agent-a"))
        .await
        .unwrap();
    stack
        .orchestrator
        .submit_input(submission(&routed.task.id, "agent-a", "added with tests", 0.9))
        .await
        .unwrap();

    let done = wait_for_status(&stack, &routed.task.id, TaskStatus::Completed).await;
    assert_eq!(done.strategy, RoutingStrategy::Adaptive);
    let decision = stack.store.get_decision(&done.id).await.unwrap().unwrap();
    assert_eq!(decision.strategy, ConsensusStrategy::Solo);
}

#[tokio::test]
async fn sequential_workflow_hands_off_between_stages() {
    let stack = polling_stack(vec![
        versatile_agent("agent-a", 0.9),
        versatile_agent("agent-b", 0.8),
    ])
    .await;

    let mut task_intake = intake("Build importer", TaskType::Implementation, 5, 5, "creator-x");
    task_intake.directives.multi_stage = true;
    let routed = stack.orchestrator.create_task(task_intake).await.unwrap();
    assert_eq!(routed.routing.strategy, RoutingStrategy::Sequential);
    assert_eq!(routed.task.assignees.len(), 2);
    let planner = routed.task.assignees[0].clone();
    let implementer = routed.task.assignees[1].clone();
    assert_ne!(planner, implementer);

    // Only the planner's stage is awaited at first.
    let mut plan = submission(&routed.task.id, &planner, "# Plan\n1. parse\n2. load", 0.85);
    plan.kind = ProposalKind::ArchitecturalPlan;
    stack.orchestrator.submit_input(plan).await.unwrap();
    let mid = stack.store.get_task(&routed.task.id).await.unwrap();
    assert_eq!(mid.status, TaskStatus::WaitingInput);
    assert_eq!(mid.metadata.get("workflow.stage").map(String::as_str), Some("1"));

    stack
        .orchestrator
        .submit_input(submission(&routed.task.id, &implementer, "# Implementation\ndone per plan", 0.8))
        .await
        .unwrap();

    let done = wait_for_status(&stack, &routed.task.id, TaskStatus::Completed).await;
    let decision = stack.store.get_decision(&done.id).await.unwrap().unwrap();
    assert_eq!(decision.strategy, ConsensusStrategy::Merge);
    assert!(decision.content.contains("Plan"));
    assert!(decision.content.contains("Implementation"));
}

#[tokio::test]
async fn review_workflow_pairs_author_with_reviewer() {
    let stack = polling_stack(vec![
        versatile_agent("agent-a", 0.9),
        versatile_agent("agent-b", 0.8),
    ])
    .await;

    let routed = stack
        .orchestrator
        .create_task(intake("Review the parser changes", TaskType::Review, 5, 5, "agent-a"))
        .await
        .unwrap();
    assert_eq!(routed.routing.strategy, RoutingStrategy::Review);
    assert_eq!(routed.task.assignees[0], "agent-a");
    assert_eq!(routed.task.assignees[1], "agent-b");

    stack
        .orchestrator
        .submit_input(submission(&routed.task.id, "agent-a", "here is the diff to review", 0.8))
        .await
        .unwrap();
    let mut review = submission(
        &routed.task.id,
        "agent-b",
        "Looks correct because the boundary cases are covered; similar to the existing lexer.",
        0.85,
    );
    review.kind = ProposalKind::CodeReview;
    stack.orchestrator.submit_input(review).await.unwrap();

    let done = wait_for_status(&stack, &routed.task.id, TaskStatus::Completed).await;
    let decision = stack.store.get_decision(&done.id).await.unwrap().unwrap();
    assert_eq!(decision.strategy, ConsensusStrategy::ReasoningQuality);
}

#[tokio::test]
async fn duplicate_submission_is_idempotent() {
    let stack = polling_stack(vec![
        versatile_agent("agent-a", 0.9),
        versatile_agent("agent-b", 0.8),
    ])
    .await;

    let mut task_intake = intake("Stable ids", TaskType::Implementation, 2, 2, "agent-a");
    task_intake.directives.force_consensus = true;
    let routed = stack.orchestrator.create_task(task_intake).await.unwrap();

    let first = stack
        .orchestrator
        .submit_input(submission(&routed.task.id, "agent-a", "same answer", 0.9))
        .await
        .unwrap();
    let second = stack
        .orchestrator
        .submit_input(submission(&routed.task.id, "agent-a", "same answer", 0.9))
        .await
        .unwrap();
    assert_eq!(first, second);

    // Still waiting on agent-b; the duplicate did not fire the round.
    assert_eq!(
        stack.store.get_task(&routed.task.id).await.unwrap().status,
        TaskStatus::WaitingInput
    );
}

#[tokio::test]
async fn empty_registry_fails_creation_with_no_eligible_agent() {
    let stack = polling_stack(vec![]).await;
    let err = stack
        .orchestrator
        .create_task(intake("Anything", TaskType::Implementation, 8, 8, "agent-x"))
        .await
        .unwrap_err();
    assert!(matches!(err, QuorumError::NoEligibleAgent(_)));

    // The dead-on-arrival task is persisted as FAILED for the audit trail.
    let (tasks, total) = stack
        .store
        .list_tasks(&crate::store::TaskFilter {
            status: Some(TaskStatus::Failed),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert!(tasks[0].result_summary.as_ref().unwrap().contains("no online agent"));
}

#[tokio::test]
async fn cancellation_releases_consensus_expectations() {
    let stack = polling_stack(vec![
        versatile_agent("agent-a", 0.9),
        versatile_agent("agent-b", 0.8),
    ])
    .await;

    let mut task_intake = intake("Doomed work", TaskType::Implementation, 8, 8, "agent-a");
    task_intake.directives.force_consensus = true;
    let routed = stack.orchestrator.create_task(task_intake).await.unwrap();
    assert_eq!(stack.consensus.pending_expectations().await, 1);

    let cancelled = stack
        .orchestrator
        .cancel_task(&routed.task.id, "priorities changed")
        .await
        .unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert_eq!(stack.consensus.pending_expectations().await, 0);

    // Late submissions bounce off the terminal task.
    let err = stack
        .orchestrator
        .submit_input(submission(&routed.task.id, "agent-a", "too late", 0.9))
        .await
        .unwrap_err();
    assert!(matches!(err, QuorumError::ConflictingState { .. }));
}

#[tokio::test]
async fn creator_completes_escalated_task_explicitly() {
    let mut settings = Settings::default();
    settings.consensus.on_no_consensus = crate::config::ConflictPolicy::Escalate;
    let stack = stack_with(
        settings,
        Arc::new(PollOnlyTransport),
        vec![versatile_agent("agent-a", 0.9), versatile_agent("agent-b", 0.8)],
    )
    .await;

    let mut task_intake = intake("Contested choice", TaskType::Architecture, 2, 2, "agent-a");
    task_intake.directives.force_consensus = true;
    let routed = stack.orchestrator.create_task(task_intake).await.unwrap();

    stack
        .orchestrator
        .submit_input(submission(&routed.task.id, "agent-a", "option one", 0.9))
        .await
        .unwrap();
    stack
        .orchestrator
        .submit_input(submission(&routed.task.id, "agent-b", "option two", 0.9))
        .await
        .unwrap();

    // Split vote, escalation policy: the task waits for a human ruling.
    let parked = stack.store.get_task(&routed.task.id).await.unwrap();
    assert_eq!(parked.status, TaskStatus::WaitingInput);
    assert_eq!(parked.role, WorkflowRole::Escalation);

    let proposals = stack.store.active_proposals(&routed.task.id).await.unwrap();
    let chosen = proposals.iter().find(|p| p.agent_id == "agent-a").unwrap();
    let done = stack
        .orchestrator
        .complete_task(CompletionInput {
            task_id: routed.task.id.clone(),
            caller: "agent-a".to_string(),
            result_summary: "went with option one".to_string(),
            considered: proposals.iter().map(|p| p.id.clone()).collect(),
            selected: Some(chosen.id.clone()),
            agreement_rate: 0.5,
            rationale: "tie broken by the requester".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);

    let decision = stack.store.get_decision(&done.id).await.unwrap().unwrap();
    assert_eq!(decision.winning_proposal_id.as_deref(), Some(chosen.id.as_str()));
    assert!(!decision.consensus);
}
