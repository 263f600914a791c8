//! External content generator used by authoring sessions.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::model::{Approved, Phase};

/// Everything the generator needs to produce the payload of `phase`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GenerationRequest {
    pub session_id: Uuid,
    pub phase: Phase,
    pub url: String,
    /// Earlier phases in order, with the feedback given when each was approved.
    pub approved: Vec<ApprovedPhase>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ApprovedPhase {
    pub phase: Phase,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl ApprovedPhase {
    pub fn new(phase: Phase, approved: &Approved) -> Self {
        Self {
            phase,
            data: approved.data.clone(),
            feedback: approved.feedback.clone(),
        }
    }
}

#[async_trait]
pub trait PhaseGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Value>;
}

/// Posts generation requests to an HTTP endpoint and returns its `payload`.
#[derive(Clone)]
pub struct HttpPhaseGenerator {
    http: Client,
    endpoint: Url,
    api_key: Option<String>,
}

impl fmt::Debug for HttpPhaseGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpPhaseGenerator")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl HttpPhaseGenerator {
    pub fn new(endpoint: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint).context("invalid generator url")?;
        let http = Client::builder()
            .user_agent("scrape-tracker/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build generator http client")?;
        let api_key = api_key.filter(|k| !k.trim().is_empty());
        Ok(Self {
            http,
            endpoint,
            api_key,
        })
    }

    pub fn build_request(&self, request: &GenerationRequest) -> Result<reqwest::Request> {
        let mut builder = self.http.post(self.endpoint.clone()).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder.build().context("failed to build generator request")
    }
}

fn parse_generator_response(success: bool, status: u16, body: &str) -> Result<Value> {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    if !success {
        let detail = parsed
            .as_ref()
            .and_then(|v| v.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("generator responded with status {}", status));
        return Err(anyhow!(detail));
    }
    let mut parsed = parsed.ok_or_else(|| anyhow!("invalid generator response JSON"))?;
    match parsed.get_mut("payload").map(Value::take) {
        Some(Value::Null) | None => Err(anyhow!("generator response has no payload")),
        Some(payload) => Ok(payload),
    }
}

#[async_trait]
impl PhaseGenerator for HttpPhaseGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Value> {
        let req = self.build_request(request)?;
        info!(session_id = %request.session_id, phase = request.phase.as_str(), "requesting generation");
        let res = self
            .http
            .execute(req)
            .await
            .context("failed to reach generator")?;
        let status = res.status();
        let body = res.text().await.context("failed to read generator response")?;
        debug!(status = status.as_u16(), len = body.len(), "generator responded");
        parse_generator_response(status.is_success(), status.as_u16(), &body)
    }
}
