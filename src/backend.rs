//! HTTP client for the session backend: agent settings, socket credentials
//! and resolution of function calls no panel handles.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;

use crate::error::BackendError;
use crate::protocol::{AgentConfig, FunctionCall, FunctionCallResponse};

/// Issues the short-lived credential used to open the agent socket.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn access_token(&self) -> Result<String, BackendError>;
}

/// Resolves function calls that no panel handles locally.
#[async_trait]
pub trait FunctionResolver: Send + Sync {
    async fn resolve(&self, calls: &[FunctionCall]) -> Result<Vec<FunctionCallResponse>, BackendError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

// The backend has answered with both shapes.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ResolverReply {
    List(Vec<FunctionCallResponse>),
    Wrapped { responses: Vec<FunctionCallResponse> },
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

/// HTTP client for the companion backend.
#[derive(Clone)]
pub struct BackendClient {
    client: Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    pub async fn fetch_access_token(&self) -> Result<String, BackendError> {
        let url = self.endpoint("/deepgram/api-key");
        log::debug!("Requesting agent credential from {}", url);
        let resp = self
            .client
            .get(&url)
            .header("ngrok-skip-browser-warning", "true")
            .send()
            .await?;
        let token: TokenResponse = check_status(resp).await?.json().await?;
        if token.access_token.is_empty() {
            return Err(BackendError::Malformed("empty access_token".into()));
        }
        Ok(token.access_token)
    }

    /// Fetch the handshake payload for `agent_id`.
    pub async fn fetch_agent_config(&self, agent_id: &str) -> Result<AgentConfig, BackendError> {
        let url = self.endpoint("/deepgram/config");
        let resp = self
            .client
            .post(&url)
            .header("ngrok-skip-browser-warning", "true")
            .json(&json!({ "agent_id": agent_id }))
            .send()
            .await?;
        let body = check_status(resp).await?.text().await?;
        serde_json::from_str(&body).map_err(|e| BackendError::Malformed(e.to_string()))
    }

    pub async fn resolve_functions(
        &self,
        calls: &[FunctionCall],
    ) -> Result<Vec<FunctionCallResponse>, BackendError> {
        let url = self.endpoint("/voice/function-calls");
        let resp = self
            .client
            .post(&url)
            .header("ngrok-skip-browser-warning", "true")
            .json(&json!({ "functions": calls }))
            .send()
            .await?;
        let body = check_status(resp).await?.text().await?;
        match serde_json::from_str::<ResolverReply>(&body) {
            Ok(ResolverReply::List(responses)) | Ok(ResolverReply::Wrapped { responses }) => {
                Ok(responses)
            }
            Err(e) => Err(BackendError::Malformed(e.to_string())),
        }
    }
}

async fn check_status(resp: Response) -> Result<Response, BackendError> {
    let status = resp.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(BackendError::RateLimited);
    }
    if !status.is_success() {
        let detail = resp
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(|body| body.error)
            .unwrap_or_else(|| "unknown error".to_string());
        log::warn!("Backend returned {}: {}", status, detail);
        return Err(BackendError::Status(status.as_u16()));
    }
    Ok(resp)
}

#[async_trait]
impl CredentialSource for BackendClient {
    async fn access_token(&self) -> Result<String, BackendError> {
        self.fetch_access_token().await
    }
}

#[async_trait]
impl FunctionResolver for BackendClient {
    async fn resolve(&self, calls: &[FunctionCall]) -> Result<Vec<FunctionCallResponse>, BackendError> {
        self.resolve_functions(calls).await
    }
}
