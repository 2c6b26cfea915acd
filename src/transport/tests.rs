use super::*;
use crate::{
    agents::{AgentResponse, AgentTransport, ContextProvider, NullContextProvider},
    config::Settings,
    consensus::ConsensusEngine,
    models::{AgentAvailability, AgentRecord, Capability},
    registry::AgentRegistry,
    routing::RoutingEngine,
    store::Store,
};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

struct PollOnlyTransport;

#[async_trait]
impl AgentTransport for PollOnlyTransport {
    fn can_push(&self, _agent: &AgentRecord) -> bool {
        false
    }

    async fn call(
        &self,
        agent: &AgentRecord,
        _prompt: &str,
        _deadline: std::time::Duration,
    ) -> crate::Result<AgentResponse> {
        Err(QuorumError::AgentTransport {
            agent_id: agent.id.clone(),
            message: "poll-only".into(),
            transient: false,
        })
    }

    async fn ping(&self, _agent: &AgentRecord) -> crate::Result<()> {
        Ok(())
    }
}

async fn stack() -> (axum::Router, AppState) {
    let settings = Settings::default();
    let store = Store::open_in_memory().unwrap();
    let bus = EventBus::new(256);
    let registry = Arc::new(AgentRegistry::new(
        store.clone(),
        bus.clone(),
        settings.health.clone(),
    ));
    for (id, strength) in [("agent-a", 0.9), ("agent-b", 0.7)] {
        let record = AgentRecord::new(id, "terminal-assistant", id)
            .with_capability(Capability::CodeGeneration, strength)
            .with_capability(Capability::Documentation, strength)
            .with_capability(Capability::Debugging, strength);
        registry.register(record).await.unwrap();
    }
    let routing = RoutingEngine::new(registry.clone(), settings.routing.clone()).unwrap();
    let consensus = ConsensusEngine::new(store.clone(), bus.clone(), settings.consensus.clone());
    let transport: Arc<dyn AgentTransport> = Arc::new(PollOnlyTransport);
    let context: Arc<dyn ContextProvider> = Arc::new(NullContextProvider);
    let orchestrator = crate::orchestrator::Orchestrator::new(
        store.clone(),
        bus.clone(),
        registry,
        routing,
        consensus,
        transport,
        context,
        settings.clone(),
    );
    let metrics = MetricsRecorder::new(store, bus.clone(), settings.metrics.clone());
    let api = ApiServer::new(&settings, orchestrator, bus, metrics);
    let state = api.state.clone();
    (api.build_router(), state)
}

async fn call(router: &axum::Router, method: &str, params: Value) -> Value {
    let body = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
    let request = Request::builder()
        .method("POST")
        .uri(ROUTE_MCP)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn unknown_method_answers_method_not_found() {
    let (router, _state) = stack().await;
    let response = call(&router, "no_such_tool", json!({})).await;
    assert_eq!(response["error"]["code"], -32601);
}

#[tokio::test]
async fn wrong_jsonrpc_version_is_rejected() {
    let (router, _state) = stack().await;
    let body = json!({ "jsonrpc": "1.0", "id": 1, "method": "list_agents", "params": {} });
    let request = Request::builder()
        .method("POST")
        .uri(ROUTE_MCP)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["error"]["code"], -32602);
}

#[tokio::test]
async fn out_of_range_complexity_is_invalid_argument() {
    let (router, _state) = stack().await;
    let response = call(
        &router,
        "create_consensus_task",
        json!({
            "title": "x", "description": "y", "type": "IMPLEMENTATION",
            "complexity": 11, "risk": 1, "agentId": "agent-a"
        }),
    )
    .await;
    assert_eq!(response["error"]["code"], -32602);

    let response = call(
        &router,
        "create_consensus_task",
        json!({
            "title": "x", "description": "y", "type": "IMPLEMENTATION",
            "complexity": 0, "risk": 1, "agentId": "agent-a"
        }),
    )
    .await;
    assert_eq!(response["error"]["code"], -32602);
}

#[tokio::test]
async fn solo_task_flows_through_polling_agents() {
    let (router, _state) = stack().await;

    let created = call(
        &router,
        "create_simple_task",
        json!({
            "title": "Fix typo in README",
            "description": "The word 'teh' appears twice.",
            "type": "DOCUMENTATION",
            "complexity": 1,
            "risk": 1,
            "agentId": "agent-a"
        }),
    )
    .await;
    let task_id = created["result"]["taskId"].as_str().unwrap().to_string();
    assert_eq!(created["result"]["status"], "WAITING_INPUT");

    // The assignee discovers the task by polling.
    let pending = call(&router, "get_pending_tasks", json!({ "agentId": "agent-a" })).await;
    assert_eq!(pending["result"]["tasks"][0]["id"], task_id.as_str());

    let submitted = call(
        &router,
        "submit_input",
        json!({
            "taskId": task_id,
            "agentId": "agent-a",
            "inputType": "INITIAL_SOLUTION",
            "confidence": 0.95,
            "content": "Fixed both occurrences."
        }),
    )
    .await;
    assert!(submitted["result"]["proposalId"].is_string());

    let status = call(&router, "get_task_status", json!({ "taskId": task_id })).await;
    assert_eq!(status["result"]["status"], "COMPLETED");

    let context = call(&router, "continue_task", json!({ "taskId": task_id })).await;
    assert_eq!(context["result"]["decision"]["strategy"], "SOLO");
    assert_eq!(context["result"]["decision"]["consensus"], true);
}

#[tokio::test]
async fn non_creator_cannot_complete() {
    let (router, _state) = stack().await;
    let created = call(
        &router,
        "create_simple_task",
        json!({
            "title": "Investigate cache misses",
            "description": "Hit rate dropped.",
            "type": "IMPLEMENTATION",
            "complexity": 5,
            "risk": 5,
            "agentId": "agent-a"
        }),
    )
    .await;
    let task_id = created["result"]["taskId"].as_str().unwrap();

    let denied = call(
        &router,
        "complete_task",
        json!({
            "taskId": task_id,
            "agentId": "agent-b",
            "resultSummary": "done",
            "decision": { "considered": [], "agreementRate": 1.0, "rationale": "n/a" }
        }),
    )
    .await;
    assert_eq!(denied["error"]["code"], -32005);

    let status = call(&router, "get_task_status", json!({ "taskId": task_id })).await;
    assert_ne!(status["result"]["status"], "COMPLETED");
}

#[tokio::test]
async fn complete_task_is_idempotent_on_terminal_tasks() {
    let (router, _state) = stack().await;
    let created = call(
        &router,
        "create_simple_task",
        json!({
            "title": "Small chore",
            "description": "Rename a file.",
            "type": "IMPLEMENTATION",
            "complexity": 1,
            "risk": 1,
            "agentId": "agent-a"
        }),
    )
    .await;
    let task_id = created["result"]["taskId"].as_str().unwrap();

    let first = call(
        &router,
        "complete_task",
        json!({
            "taskId": task_id,
            "agentId": "agent-a",
            "resultSummary": "renamed",
            "decision": { "considered": [], "agreementRate": 1.0, "rationale": "trivial" }
        }),
    )
    .await;
    assert_eq!(first["result"]["status"], "COMPLETED");

    let again = call(
        &router,
        "complete_task",
        json!({
            "taskId": task_id,
            "agentId": "agent-a",
            "resultSummary": "renamed twice?",
            "decision": { "considered": [], "agreementRate": 1.0, "rationale": "noop" }
        }),
    )
    .await;
    assert_eq!(again["result"]["status"], "COMPLETED");
    assert!(again["error"].is_null());
}

#[tokio::test]
async fn cancel_task_releases_and_reports() {
    let (router, _state) = stack().await;
    let created = call(
        &router,
        "create_consensus_task",
        json!({
            "title": "Risky migration",
            "description": "Move the data store.",
            "type": "IMPLEMENTATION",
            "complexity": 8,
            "risk": 8,
            "agentId": "agent-a"
        }),
    )
    .await;
    let task_id = created["result"]["taskId"].as_str().unwrap();
    assert_eq!(created["result"]["routing"], "CONSENSUS");

    let cancelled = call(
        &router,
        "cancel_task",
        json!({ "taskId": task_id, "reason": "superseded" }),
    )
    .await;
    assert_eq!(cancelled["result"]["status"], "CANCELLED");

    // Cancellation is idempotent.
    let again = call(&router, "cancel_task", json!({ "taskId": task_id })).await;
    assert_eq!(again["result"]["status"], "CANCELLED");
}

#[tokio::test]
async fn exhausted_limiter_answers_busy() {
    let (_router, state) = stack().await;
    state.limiter.forget_permits(state.limiter.available_permits());

    let request = RpcRequest {
        jsonrpc: JSONRPC_VERSION.to_string(),
        id: Some(json!(7)),
        method: "list_agents".to_string(),
        params: json!({}),
    };
    let Json(response) = handle_mcp(State(state), Json(request)).await;
    let error = response.error.unwrap();
    assert_eq!(error.code, -32004);
    assert_eq!(error.data.unwrap()["retryAfterMs"], 250);
}

#[tokio::test]
async fn unknown_sse_topic_is_not_found() {
    let (router, _state) = stack().await;
    let request = Request::builder()
        .method("GET")
        .uri("/sse/nonsense")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn register_agent_rejects_bad_strengths() {
    let (router, _state) = stack().await;
    let response = call(
        &router,
        "register_agent",
        json!({
            "agentId": "agent-c",
            "agentKind": "cli-agent",
            "displayName": "Agent C",
            "capabilities": { "CODE_GENERATION": 1.5 }
        }),
    )
    .await;
    assert_eq!(response["error"]["code"], -32602);

    let ok = call(
        &router,
        "register_agent",
        json!({
            "agentId": "agent-c",
            "agentKind": "cli-agent",
            "displayName": "Agent C",
            "capabilities": { "CODE_GENERATION": 0.8 }
        }),
    )
    .await;
    assert_eq!(ok["result"]["status"], "REGISTERED");

    let agents = call(&router, "list_agents", json!({})).await;
    assert_eq!(agents["result"]["agents"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn health_endpoint_reports_sequence() {
    let (router, state) = stack().await;
    state.bus.publish(crate::models::DomainEvent::TaskCompleted {
        task_id: "t1".into(),
    });
    let request = Request::builder()
        .method("GET")
        .uri(ROUTE_HEALTH)
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["status"], "ok");
    assert!(value["eventSeq"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn registry_snapshot_reports_online_agents() {
    let (_router, state) = stack().await;
    let agents = state.orchestrator.registry().all().await;
    assert!(agents
        .iter()
        .all(|a| a.availability == AgentAvailability::Online));
}
