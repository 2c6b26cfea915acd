//! Contracts to the external collaborators: the transport used to reach
//! participating agents and the context-retrieval subsystem. The core only
//! depends on these traits; concrete adapters live behind them.

use crate::{models::AgentRecord, QuorumError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// What an agent returned for a dispatched prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentResponse {
    pub content: String,
    pub confidence: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl Default for AgentResponse {
    fn default() -> Self {
        Self {
            content: String::new(),
            confidence: 0.5,
            tokens_in: 0,
            tokens_out: 0,
        }
    }
}

/// Outbound channel to a participating agent.
///
/// Errors are classified transient (retried with back-off) or permanent
/// (fail the task) through `QuorumError::is_transient`.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Whether work can be pushed to this agent. Agents without a push
    /// channel poll `get_pending_tasks` instead.
    fn can_push(&self, agent: &AgentRecord) -> bool;

    async fn call(
        &self,
        agent: &AgentRecord,
        prompt: &str,
        deadline: Duration,
    ) -> Result<AgentResponse>;

    async fn ping(&self, agent: &AgentRecord) -> Result<()>;
}

/// One retrieved context snippet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnippet {
    pub source: String,
    pub content: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildStatus {
    pub job_id: Option<String>,
    pub state: String,
    pub progress: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextStats {
    pub documents: u64,
    pub chunks: u64,
    pub last_refresh: Option<chrono::DateTime<chrono::Utc>>,
}

/// Context-retrieval subsystem. Failures are non-fatal for task flow: the
/// orchestrator degrades to an empty snippet list.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn query(
        &self,
        query: &str,
        scope: Option<&str>,
        budget_tokens: usize,
    ) -> Result<Vec<ContextSnippet>>;

    async fn refresh(&self) -> Result<()>;

    /// Kick off a full rebuild; returns a job ID for status polling.
    async fn rebuild(&self) -> Result<String>;

    async fn rebuild_status(&self) -> Result<RebuildStatus>;

    async fn stats(&self) -> Result<ContextStats>;
}

/// Provider used when no context subsystem is attached.
#[derive(Debug, Default, Clone)]
pub struct NullContextProvider;

#[async_trait]
impl ContextProvider for NullContextProvider {
    async fn query(
        &self,
        _query: &str,
        _scope: Option<&str>,
        _budget_tokens: usize,
    ) -> Result<Vec<ContextSnippet>> {
        Ok(Vec::new())
    }

    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn rebuild(&self) -> Result<String> {
        Err(QuorumError::NotFound("context provider".to_string()))
    }

    async fn rebuild_status(&self) -> Result<RebuildStatus> {
        Ok(RebuildStatus {
            job_id: None,
            state: "unavailable".to_string(),
            progress: 0.0,
        })
    }

    async fn stats(&self) -> Result<ContextStats> {
        Ok(ContextStats::default())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CallRequest<'a> {
    prompt: &'a str,
}

/// Default HTTP transport: JSON POST to the agent's endpoint, GET for the
/// health probe.
pub struct HttpAgentTransport {
    client: reqwest::Client,
}

impl HttpAgentTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn endpoint<'a>(&self, agent: &'a AgentRecord) -> Result<&'a str> {
        agent
            .endpoint
            .as_deref()
            .ok_or_else(|| QuorumError::AgentTransport {
                agent_id: agent.id.clone(),
                message: "agent has no push endpoint".to_string(),
                transient: false,
            })
    }
}

impl Default for HttpAgentTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    fn can_push(&self, agent: &AgentRecord) -> bool {
        agent.endpoint.is_some()
    }

    async fn call(
        &self,
        agent: &AgentRecord,
        prompt: &str,
        deadline: Duration,
    ) -> Result<AgentResponse> {
        let endpoint = self.endpoint(agent)?;
        debug!(agent_id = %agent.id, %endpoint, "dispatching prompt");
        let response = self
            .client
            .post(format!("{}/tasks", endpoint.trim_end_matches('/')))
            .timeout(deadline)
            .json(&CallRequest { prompt })
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(QuorumError::AgentTransport {
                agent_id: agent.id.clone(),
                message: format!("agent answered {status}"),
                transient: status.is_server_error(),
            });
        }
        Ok(response.json::<AgentResponse>().await?)
    }

    async fn ping(&self, agent: &AgentRecord) -> Result<()> {
        // Poll-only agents have nothing to probe; treat them as reachable.
        let Some(endpoint) = agent.endpoint.as_deref() else {
            return Ok(());
        };
        let response = self
            .client
            .get(format!("{}/health", endpoint.trim_end_matches('/')))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(QuorumError::AgentTransport {
                agent_id: agent.id.clone(),
                message: format!("health probe answered {}", response.status()),
                transient: true,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentRecord;

    fn agent(endpoint: Option<&str>) -> AgentRecord {
        let mut record = AgentRecord::new("agent-a", "cli-agent", "Agent A");
        record.endpoint = endpoint.map(str::to_string);
        record
    }

    #[tokio::test]
    async fn call_round_trips_through_http() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/tasks")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"content":"done","confidence":0.9,"tokensIn":12,"tokensOut":34}"#)
            .create_async()
            .await;

        let transport = HttpAgentTransport::new();
        let record = agent(Some(&server.url()));
        let response = transport
            .call(&record, "fix the bug", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.content, "done");
        assert_eq!(response.tokens_out, 34);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/tasks")
            .with_status(503)
            .create_async()
            .await;

        let transport = HttpAgentTransport::new();
        let record = agent(Some(&server.url()));
        let err = transport
            .call(&record, "anything", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn poll_only_agent_cannot_push_but_pings_ok() {
        let transport = HttpAgentTransport::new();
        let record = agent(None);
        assert!(!transport.can_push(&record));
        assert!(transport.ping(&record).await.is_ok());
        assert!(transport
            .call(&record, "anything", Duration::from_secs(1))
            .await
            .is_err());
    }
}
