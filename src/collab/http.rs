//! HTTP-backed collaborators: issue tracker, telemetry, alerting.
//!
//! The tracker speaks a GraphQL API keyed by a team identifier. Telemetry
//! queries a project-stats endpoint for error counts. Alerts go to a plain
//! webhook, or to the log when none is configured.

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};

use super::{Alerter, IssueTracker, Severity, Telemetry, lifecycle};
use crate::errors::StageError;
use crate::state::TicketRef;

/// Map an engine lifecycle state to the tracker's workflow state name.
fn workflow_state_name(target_state: &str) -> &str {
    match target_state {
        lifecycle::READY => "Ready",
        lifecycle::IN_PROGRESS => "In Progress",
        lifecycle::FAILED => "Failed",
        lifecycle::DONE => "Done",
        other => other,
    }
}

pub struct HttpIssueTracker {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    team_key: String,
}

impl HttpIssueTracker {
    pub fn from_env() -> anyhow::Result<Self> {
        let endpoint = std::env::var("CONVEYOR_TRACKER_URL")
            .context("CONVEYOR_TRACKER_URL not set")?;
        let api_key = std::env::var("CONVEYOR_TRACKER_KEY")
            .context("CONVEYOR_TRACKER_KEY not set")?;
        let team_key = std::env::var("CONVEYOR_TEAM_KEY")
            .context("CONVEYOR_TEAM_KEY not set")?;
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
            team_key,
        })
    }

    async fn graphql(&self, call: &str, query: &str, variables: Value) -> Result<Value, StageError> {
        debug!(call, "tracker graphql request");
        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", &self.api_key)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| StageError::unavailable(call, format!("request failed: {e}")))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(StageError::unavailable(call, format!("auth rejected: {status}")));
        }
        if !status.is_success() {
            return Err(StageError::transient(call, format!("http {status}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| StageError::transient(call, format!("invalid response body: {e}")))?;
        if let Some(errors) = body.get("errors")
            && !errors.as_array().map(Vec::is_empty).unwrap_or(true)
        {
            return Err(StageError::transient(call, format!("graphql errors: {errors}")));
        }
        Ok(body)
    }

    async fn workflow_state_id(&self, call: &str, name: &str) -> Result<String, StageError> {
        let query = r#"
            query States($team: String!) {
                workflowStates(filter: { team: { key: { eq: $team } } }) {
                    nodes { id name }
                }
            }
        "#;
        let body = self
            .graphql(call, query, json!({ "team": self.team_key }))
            .await?;
        body["data"]["workflowStates"]["nodes"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|node| node["name"].as_str() == Some(name))
            .and_then(|node| node["id"].as_str())
            .map(String::from)
            .ok_or_else(|| {
                StageError::transient(call, format!("no workflow state named '{name}'"))
            })
    }
}

#[async_trait]
impl IssueTracker for HttpIssueTracker {
    async fn fetch_ready_tickets(&self) -> Result<Vec<TicketRef>, StageError> {
        let call = "tracker.fetch_ready_tickets";
        let query = r#"
            query Ready($team: String!, $state: String!) {
                issues(filter: {
                    team: { key: { eq: $team } },
                    state: { name: { eq: $state } }
                }) {
                    nodes {
                        id identifier title description priority
                        state { name }
                        parent { identifier }
                    }
                }
            }
        "#;
        let body = self
            .graphql(
                call,
                query,
                json!({
                    "team": self.team_key,
                    "state": workflow_state_name(lifecycle::READY),
                }),
            )
            .await?;

        let nodes = body["data"]["issues"]["nodes"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let tickets = nodes
            .iter()
            .filter_map(|node| {
                Some(TicketRef {
                    id: node["id"].as_str()?.to_string(),
                    identifier: node["identifier"].as_str()?.to_string(),
                    title: node["title"].as_str().unwrap_or_default().to_string(),
                    description: node["description"].as_str().map(String::from),
                    state: node["state"]["name"].as_str().unwrap_or_default().to_string(),
                    priority: node["priority"].as_i64().unwrap_or(0),
                    parent_ref: node["parent"]["identifier"].as_str().map(String::from),
                })
            })
            .collect();
        Ok(tickets)
    }

    async fn transition(&self, ticket_id: &str, target_state: &str) -> Result<(), StageError> {
        let call = "tracker.transition";
        let state_id = self
            .workflow_state_id(call, workflow_state_name(target_state))
            .await?;
        let mutation = r#"
            mutation Move($issue: String!, $state: String!) {
                issueUpdate(id: $issue, input: { stateId: $state }) { success }
            }
        "#;
        self.graphql(call, mutation, json!({ "issue": ticket_id, "state": state_id }))
            .await?;
        Ok(())
    }

    async fn add_note(&self, ticket_id: &str, text: &str) -> Result<(), StageError> {
        let call = "tracker.add_note";
        let mutation = r#"
            mutation Note($issue: String!, $body: String!) {
                commentCreate(input: { issueId: $issue, body: $body }) { success }
            }
        "#;
        self.graphql(call, mutation, json!({ "issue": ticket_id, "body": text }))
            .await?;
        Ok(())
    }
}

/// Error-rate source backed by a project-stats HTTP endpoint. Unconfigured
/// instances report themselves unreachable so the health stage can skip
/// instead of guessing.
pub struct HttpTelemetry {
    client: reqwest::Client,
    base_url: Option<String>,
    token: Option<String>,
}

impl HttpTelemetry {
    pub fn from_env() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: std::env::var("CONVEYOR_TELEMETRY_URL").ok(),
            token: std::env::var("CONVEYOR_TELEMETRY_TOKEN").ok(),
        }
    }
}

#[async_trait]
impl Telemetry for HttpTelemetry {
    async fn query_error_rate(&self, window: Duration) -> Result<u64, StageError> {
        let call = "telemetry.query_error_rate";
        let (base_url, token) = match (&self.base_url, &self.token) {
            (Some(url), Some(token)) => (url, token),
            _ => return Err(StageError::unavailable(call, "telemetry not configured")),
        };

        let response = self
            .client
            .get(base_url)
            .bearer_auth(token)
            .query(&[("statsPeriod", format!("{}s", window.as_secs()))])
            .send()
            .await
            .map_err(|e| StageError::unavailable(call, format!("request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(StageError::transient(call, format!("http {}", response.status())));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| StageError::transient(call, format!("invalid response body: {e}")))?;
        // Buckets arrive as [timestamp, count] pairs; sum the counts.
        let total = body["intervals"]
            .as_array()
            .or_else(|| body.as_array())
            .into_iter()
            .flatten()
            .filter_map(|bucket| bucket.get(1).and_then(Value::as_u64))
            .sum();
        Ok(total)
    }
}

/// Webhook alerter. Falls back to the log when no webhook is configured so
/// escalation paths never fail outright.
pub struct WebhookAlerter {
    client: reqwest::Client,
    webhook_url: Option<String>,
}

impl WebhookAlerter {
    pub fn from_env() -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: std::env::var("CONVEYOR_ALERT_WEBHOOK").ok(),
        }
    }
}

#[async_trait]
impl Alerter for WebhookAlerter {
    async fn notify(&self, message: &str, severity: Severity) -> Result<(), StageError> {
        let Some(url) = &self.webhook_url else {
            warn!(%severity, message, "no alert webhook configured");
            return Ok(());
        };
        let call = "alerter.notify";
        let response = self
            .client
            .post(url)
            .json(&json!({ "severity": severity.to_string(), "message": message }))
            .send()
            .await
            .map_err(|e| StageError::unavailable(call, format!("request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(StageError::transient(call, format!("http {}", response.status())));
        }
        Ok(())
    }
}
