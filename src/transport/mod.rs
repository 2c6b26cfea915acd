//! HTTP surface: JSON-RPC 2.0 tool dispatch on `POST /mcp`, server-sent
//! event streams on `GET /sse/{topic}`, and a health probe.
//!
//! Every tool call is validated before dispatch and answers either a
//! result or a structured error object. A semaphore bounds in-flight tool
//! calls; exhaustion answers `Busy` with a retry hint instead of queueing.

pub mod rpc;

use crate::{
    config::Settings,
    events::EventBus,
    metrics::MetricsRecorder,
    models::{AgentRecord, Capability, Topic, WorkflowRole},
    orchestrator::{CompletionInput, Orchestrator, SubmissionInput, TaskIntake},
    validation, QuorumError, Result,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use rpc::*;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

const ROUTE_MCP: &str = "/mcp";
const ROUTE_SSE: &str = "/sse/{topic}";
const ROUTE_HEALTH: &str = "/health";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub bus: EventBus,
    pub metrics: Arc<MetricsRecorder>,
    pub limiter: Arc<Semaphore>,
    pub keep_alive: Duration,
}

pub struct ApiServer {
    state: AppState,
    allowed_origins: Vec<String>,
}

impl ApiServer {
    pub fn new(
        settings: &Settings,
        orchestrator: Arc<Orchestrator>,
        bus: EventBus,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        let state = AppState {
            orchestrator,
            bus,
            metrics,
            limiter: Arc::new(Semaphore::new(settings.transport.max_in_flight)),
            keep_alive: Duration::from_secs(settings.transport.keep_alive_secs),
        };
        Self {
            state,
            allowed_origins: settings.server.allowed_origins.clone(),
        }
    }

    pub fn build_router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(
                self.allowed_origins
                    .iter()
                    .filter_map(|origin| origin.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([axum::http::header::CONTENT_TYPE]);

        Router::new()
            .route(ROUTE_MCP, post(handle_mcp))
            .route(ROUTE_SSE, get(handle_sse))
            .route(ROUTE_HEALTH, get(handle_health))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
            .with_state(self.state.clone())
    }

    /// Serve on an already-bound listener (binding happens at startup so
    /// bind failures map to their own exit code).
    pub async fn run(self, listener: tokio::net::TcpListener) -> Result<()> {
        let addr = listener
            .local_addr()
            .map_err(|e| QuorumError::Internal(e.into()))?;
        info!(%addr, "transport listening");
        axum::serve(listener, self.build_router())
            .await
            .map_err(|e| QuorumError::Internal(e.into()))?;
        Ok(())
    }
}

async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "eventSeq": state.bus.current_seq(),
        "droppedEvents": state.bus.dropped(),
    }))
}

async fn handle_mcp(
    State(state): State<AppState>,
    Json(request): Json<RpcRequest>,
) -> Json<RpcResponse> {
    let id = request.id.clone();
    if request.jsonrpc != JSONRPC_VERSION {
        return Json(RpcResponse::failure(
            id,
            &QuorumError::invalid("jsonrpc", "must be \"2.0\""),
        ));
    }

    let _permit = match state.limiter.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => return Json(RpcResponse::failure(id, &QuorumError::Busy)),
    };

    match dispatch(&state, &request.method, request.params).await {
        Ok(result) => Json(RpcResponse::success(id, result)),
        Err(e) => {
            warn!(method = %request.method, error = %e, code = e.rpc_code(), "tool call failed");
            Json(RpcResponse::failure(id, &e))
        }
    }
}

fn parse<T: DeserializeOwned>(params: serde_json::Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| QuorumError::invalid("params", e.to_string()))
}

fn require_agent_id(agent_id: Option<String>) -> Result<String> {
    let id = agent_id.ok_or_else(|| QuorumError::invalid("agentId", "is required"))?;
    validation::validate_agent_id("agentId", &id)?;
    Ok(id)
}

async fn dispatch(state: &AppState, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
    match method {
        "create_consensus_task" => create_consensus_task(state, parse(params)?).await,
        "create_simple_task" => create_simple_task(state, parse(params)?).await,
        "assign_task" => assign_task(state, parse(params)?).await,
        "get_pending_tasks" => get_pending_tasks(state, parse(params)?).await,
        "get_task_status" => get_task_status(state, parse(params)?).await,
        "continue_task" => continue_task(state, parse(params)?).await,
        "respond_to_task" => respond_to_task(state, parse(params)?).await,
        "submit_input" => submit_input(state, parse(params)?).await,
        "complete_task" => complete_task(state, parse(params)?).await,
        "cancel_task" => cancel_task(state, parse(params)?).await,
        "register_agent" => register_agent(state, parse(params)?).await,
        "list_agents" => list_agents(state).await,
        "get_metrics" => get_metrics(state, parse(params)?).await,
        "query_context" => query_context(state, parse(params)?).await,
        "refresh_context" => refresh_context(state).await,
        "rebuild_context" => rebuild_context(state).await,
        "get_rebuild_status" => get_rebuild_status(state).await,
        "get_context_stats" => get_context_stats(state).await,
        other => Err(QuorumError::MethodNotFound(other.to_string())),
    }
}

// ---- task tools ----------------------------------------------------------

fn create_result(routed: &crate::orchestrator::RoutedTask) -> Result<serde_json::Value> {
    let result = CreateTaskResult {
        task_id: routed.task.id.clone(),
        status: routed.task.status,
        routing: routed.routing.strategy.as_str().to_string(),
        primary_agent_id: routed.task.assignees.first().cloned(),
        participant_agent_ids: routed.task.assignees.clone(),
    };
    Ok(serde_json::to_value(result)?)
}

async fn create_consensus_task(
    state: &AppState,
    params: CreateConsensusTaskParams,
) -> Result<serde_json::Value> {
    let creator = require_agent_id(params.agent_id)?;
    let intake = TaskIntake {
        title: params.title,
        description: params.description,
        task_type: params.task_type,
        role: params.role_in_workflow.unwrap_or(WorkflowRole::Execution),
        complexity: params.complexity,
        risk: params.risk,
        creator,
        directives: params.directives.unwrap_or_default(),
    };
    let routed = state.orchestrator.create_task(intake).await?;
    create_result(&routed)
}

async fn create_simple_task(
    state: &AppState,
    params: CreateSimpleTaskParams,
) -> Result<serde_json::Value> {
    let creator = require_agent_id(params.agent_id)?;
    let mut directives = params.directives.unwrap_or_default();
    directives.skip_consensus = directives.skip_consensus || params.skip_consensus;
    let intake = TaskIntake {
        title: params.title,
        description: params.description,
        task_type: params.task_type,
        role: params.role_in_workflow.unwrap_or(WorkflowRole::Execution),
        complexity: params.complexity.unwrap_or(2),
        risk: params.risk.unwrap_or(2),
        creator,
        directives,
    };
    let routed = state.orchestrator.create_task(intake).await?;
    let result = SimpleTaskResult {
        task_id: routed.task.id.clone(),
        status: routed.task.status,
    };
    Ok(serde_json::to_value(result)?)
}

async fn assign_task(state: &AppState, params: AssignTaskParams) -> Result<serde_json::Value> {
    let creator = require_agent_id(params.agent_id)?;
    validation::validate_agent_id("targetAgent", &params.target_agent)?;
    let mut directives = params.directives.unwrap_or_default();
    directives.assign_to_agent = Some(params.target_agent);
    let intake = TaskIntake {
        title: params.title,
        description: params.description,
        task_type: params.task_type.unwrap_or(crate::models::TaskType::Implementation),
        role: WorkflowRole::Execution,
        complexity: params.complexity.unwrap_or(3),
        risk: params.risk.unwrap_or(3),
        creator,
        directives,
    };
    let routed = state.orchestrator.create_task(intake).await?;
    let result = SimpleTaskResult {
        task_id: routed.task.id.clone(),
        status: routed.task.status,
    };
    Ok(serde_json::to_value(result)?)
}

async fn get_pending_tasks(
    state: &AppState,
    params: GetPendingTasksParams,
) -> Result<serde_json::Value> {
    let tasks = state
        .orchestrator
        .pending_tasks(params.agent_id.as_deref())
        .await?;
    let entries: Vec<PendingTaskEntry> = tasks.iter().map(PendingTaskEntry::from).collect();
    Ok(json!({ "tasks": entries }))
}

async fn get_task_status(state: &AppState, params: TaskIdParams) -> Result<serde_json::Value> {
    let task = state.orchestrator.get_task(&params.task_id).await?;
    Ok(serde_json::to_value(TaskStatusResult::from(&task))?)
}

async fn continue_task(state: &AppState, params: TaskIdParams) -> Result<serde_json::Value> {
    let context = state.orchestrator.continue_task(&params.task_id).await?;
    Ok(json!({
        "task": context.task,
        "proposals": context.proposals,
        "decision": context.decision,
        "history": context.history,
    }))
}

async fn respond_to_task(
    state: &AppState,
    params: RespondToTaskParams,
) -> Result<serde_json::Value> {
    let agent_id = require_agent_id(params.agent_id)?;
    let submission = SubmissionInput {
        task_id: params.task_id.clone(),
        agent_id,
        kind: params.response.input_type,
        confidence: params.response.confidence,
        content: params.response.content,
        metadata: params.response.metadata.unwrap_or_default(),
    };
    let proposal_id = state.orchestrator.submit_input(submission).await?;

    let task = state.orchestrator.get_task(&params.task_id).await?;
    let snippets = state
        .orchestrator
        .context_for(&task, params.max_tokens.unwrap_or(2000))
        .await;
    Ok(json!({
        "proposalId": proposal_id,
        "taskId": params.task_id,
        "status": task.status,
        "context": snippets,
    }))
}

async fn submit_input(state: &AppState, params: SubmitInputParams) -> Result<serde_json::Value> {
    let submission = SubmissionInput {
        task_id: params.task_id,
        agent_id: params.agent_id,
        kind: params.input_type,
        confidence: params.confidence,
        content: params.content,
        metadata: params.metadata.unwrap_or_default(),
    };
    let proposal_id = state.orchestrator.submit_input(submission).await?;
    Ok(json!({ "proposalId": proposal_id }))
}

async fn complete_task(state: &AppState, params: CompleteTaskParams) -> Result<serde_json::Value> {
    let caller = require_agent_id(params.agent_id)?;
    validation::validate_confidence("decision.agreementRate", params.decision.agreement_rate)?;
    let input = CompletionInput {
        task_id: params.task_id,
        caller,
        result_summary: params.result_summary,
        considered: params.decision.considered,
        selected: params.decision.selected,
        agreement_rate: params.decision.agreement_rate,
        rationale: params.decision.rationale,
    };
    let task = state.orchestrator.complete_task(input).await?;
    Ok(json!({ "taskId": task.id, "status": task.status }))
}

async fn cancel_task(state: &AppState, params: CancelTaskParams) -> Result<serde_json::Value> {
    let task = state
        .orchestrator
        .cancel_task(&params.task_id, params.reason.as_deref().unwrap_or(""))
        .await?;
    Ok(json!({ "taskId": task.id, "status": task.status }))
}

// ---- registry tools ------------------------------------------------------

async fn register_agent(
    state: &AppState,
    params: RegisterAgentParams,
) -> Result<serde_json::Value> {
    validation::validate_agent_id("agentId", &params.agent_id)?;
    let mut record = AgentRecord::new(&params.agent_id, &params.agent_kind, &params.display_name);
    record.endpoint = params.endpoint;
    for (name, strength) in &params.capabilities {
        let capability = Capability::from_str(name)
            .map_err(|e| QuorumError::invalid(format!("capabilities.{name}"), e))?;
        validation::validate_confidence(&format!("capabilities.{name}"), *strength)?;
        record.capabilities.insert(capability, *strength);
    }
    state.orchestrator.registry().register(record).await?;
    Ok(json!({ "agentId": params.agent_id, "status": "REGISTERED" }))
}

async fn list_agents(state: &AppState) -> Result<serde_json::Value> {
    let agents = state.orchestrator.registry().all().await;
    Ok(json!({ "agents": agents }))
}

async fn get_metrics(state: &AppState, params: GetMetricsParams) -> Result<serde_json::Value> {
    let counters = state.metrics.snapshot();
    let series = match params.name {
        Some(name) => {
            let until = chrono::Utc::now().timestamp_millis();
            let since = params.since_ms.unwrap_or(until - 3_600_000);
            state
                .metrics
                .query(&name, since, until, params.bucket_secs.unwrap_or(60))
                .await?
        }
        None => Vec::new(),
    };
    Ok(json!({ "counters": counters, "series": series }))
}

// ---- context tools (forwarded to the provider) ---------------------------

async fn query_context(state: &AppState, params: QueryContextParams) -> Result<serde_json::Value> {
    let snippets = state
        .orchestrator
        .context_provider()
        .query(&params.query, params.scope.as_deref(), params.budget.unwrap_or(2000))
        .await?;
    Ok(json!({ "snippets": snippets }))
}

async fn refresh_context(state: &AppState) -> Result<serde_json::Value> {
    state.orchestrator.context_provider().refresh().await?;
    Ok(json!({ "status": "ok" }))
}

async fn rebuild_context(state: &AppState) -> Result<serde_json::Value> {
    let job_id = state.orchestrator.context_provider().rebuild().await?;
    Ok(json!({ "jobId": job_id }))
}

async fn get_rebuild_status(state: &AppState) -> Result<serde_json::Value> {
    let status = state.orchestrator.context_provider().rebuild_status().await?;
    Ok(serde_json::to_value(status)?)
}

async fn get_context_stats(state: &AppState) -> Result<serde_json::Value> {
    let stats = state.orchestrator.context_provider().stats().await?;
    Ok(serde_json::to_value(stats)?)
}

// ---- SSE -----------------------------------------------------------------

async fn handle_sse(Path(topic): Path<String>, State(state): State<AppState>) -> Response {
    let topic = match Topic::from_str(&topic) {
        Ok(topic) => topic,
        Err(e) => return (StatusCode::NOT_FOUND, e).into_response(),
    };

    let receiver = state.bus.subscribe_raw(topic);
    let stream = BroadcastStream::new(receiver).filter_map(move |message| match message {
        Ok(envelope) => {
            let data = serde_json::to_string(&envelope).unwrap_or_default();
            Some(Ok::<Event, std::convert::Infallible>(
                Event::default()
                    .id(envelope.seq.to_string())
                    .event(envelope.event.kind())
                    .data(data),
            ))
        }
        Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(lost)) => {
            warn!(topic = topic.as_str(), lost, "sse client lagged, oldest frames dropped");
            None
        }
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(state.keep_alive))
        .into_response()
}

#[cfg(test)]
mod tests;
