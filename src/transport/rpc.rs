//! JSON-RPC 2.0 envelope and the tool parameter/result shapes.
//! Wire names are camelCase; enums ride their SCREAMING_SNAKE_CASE forms.

use crate::{
    models::{Directives, ProposalKind, Task, TaskStatus, TaskType, WorkflowRole},
    QuorumError,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<serde_json::Value>, error: &QuorumError) -> Self {
        let data = error
            .retry_after_ms()
            .map(|ms| serde_json::json!({ "retryAfterMs": ms }));
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(RpcError {
                code: error.rpc_code(),
                message: error.to_string(),
                data,
            }),
        }
    }
}

// ---- tool parameters -----------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConsensusTaskParams {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub role_in_workflow: Option<WorkflowRole>,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub complexity: u8,
    pub risk: u8,
    #[serde(default)]
    pub directives: Option<Directives>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSimpleTaskParams {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub role_in_workflow: Option<WorkflowRole>,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub complexity: Option<u8>,
    #[serde(default)]
    pub risk: Option<u8>,
    #[serde(default)]
    pub skip_consensus: bool,
    #[serde(default)]
    pub directives: Option<Directives>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignTaskParams {
    pub title: String,
    pub description: String,
    pub target_agent: String,
    #[serde(rename = "type", default)]
    pub task_type: Option<TaskType>,
    #[serde(default)]
    pub complexity: Option<u8>,
    #[serde(default)]
    pub risk: Option<u8>,
    #[serde(default)]
    pub directives: Option<Directives>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPendingTasksParams {
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskIdParams {
    pub task_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondBody {
    pub content: String,
    pub input_type: ProposalKind,
    pub confidence: f64,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondToTaskParams {
    pub task_id: String,
    pub response: RespondBody,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitInputParams {
    pub task_id: String,
    pub agent_id: String,
    pub input_type: ProposalKind,
    pub confidence: f64,
    pub content: String,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionParams {
    #[serde(default)]
    pub considered: Vec<String>,
    #[serde(default)]
    pub selected: Option<String>,
    #[serde(default)]
    pub agreement_rate: f64,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteTaskParams {
    pub task_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub result_summary: String,
    pub decision: DecisionParams,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelTaskParams {
    pub task_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAgentParams {
    pub agent_id: String,
    pub agent_kind: String,
    pub display_name: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub capabilities: HashMap<String, f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryContextParams {
    pub query: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub budget: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetMetricsParams {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub since_ms: Option<i64>,
    #[serde(default)]
    pub bucket_secs: Option<u64>,
}

// ---- tool results --------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub routing: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_agent_id: Option<String>,
    pub participant_agent_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleTaskResult {
    pub task_id: String,
    pub status: TaskStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusResult {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub assignees: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<&Task> for TaskStatusResult {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            status: task.status,
            task_type: task.task_type,
            assignees: task.assignees.clone(),
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTaskEntry {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub complexity: u8,
    pub risk: u8,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<&Task> for PendingTaskEntry {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            status: task.status,
            task_type: task.task_type,
            complexity: task.complexity,
            risk: task.risk,
            created_at: task.created_at,
        }
    }
}
