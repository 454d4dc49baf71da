//! Session API client.
//!
//! Thin request/response wrapper over the analysis service. No retries, no
//! user notification, no scheduling — callers own all of that.

use crate::model::{DriverConfig, SessionSnapshot};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Network-level failure: no usable response was received.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The server responded with a non-success status.
    #[error("server error ({status}): {detail}")]
    Server { status: u16, detail: String },
}

/// Remote operations consumed by the driver.
///
/// `trigger_iteration` is not idempotent: two concurrent calls for the same
/// session produce two iterations. Serializing calls is the driver's job.
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn start_session(
        &self,
        task: &str,
        iteration_budget: Option<u32>,
    ) -> Result<String, ApiError>;

    async fn trigger_iteration(&self, session_id: &str) -> Result<(), ApiError>;

    async fn fetch_status(&self, session_id: &str) -> Result<SessionSnapshot, ApiError>;

    async fn update_system_prompt(
        &self,
        session_id: &str,
        new_prompt: &str,
    ) -> Result<(), ApiError>;
}

#[derive(Serialize)]
struct StartRequest<'a> {
    task: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    iteration_count: Option<u32>,
}

#[derive(Deserialize)]
struct StartResponse {
    session_id: String,
}

#[derive(Serialize)]
struct PromptUpdateRequest<'a> {
    session_id: &'a str,
    new_prompt: &'a str,
}

#[derive(Clone)]
pub struct SessionClient {
    http: reqwest::Client,
    base_url: String,
}

impl SessionClient {
    pub fn new(cfg: &DriverConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .build()?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(ApiError::Server {
            status,
            detail: extract_detail(&body),
        })
    }
}

/// Pull the error detail out of a FastAPI-style `{"detail": ...}` body,
/// falling back to the raw body text.
fn extract_detail(body: &str) -> String {
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(detail) = v.get("detail").and_then(|d| d.as_str()) {
            return detail.to_string();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "no error detail".to_string()
    } else {
        trimmed.to_string()
    }
}

#[async_trait]
impl SessionApi for SessionClient {
    async fn start_session(
        &self,
        task: &str,
        iteration_budget: Option<u32>,
    ) -> Result<String, ApiError> {
        let url = format!("{}/start_analysis", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&StartRequest {
                task,
                iteration_count: iteration_budget,
            })
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let parsed: StartResponse = resp.json().await?;
        Ok(parsed.session_id)
    }

    async fn trigger_iteration(&self, session_id: &str) -> Result<(), ApiError> {
        let url = format!("{}/process_iteration/{}", self.base_url, session_id);
        let resp = self.http.post(&url).send().await?;
        // Response body is ignored; only the status matters.
        Self::check(resp).await?;
        Ok(())
    }

    async fn fetch_status(&self, session_id: &str) -> Result<SessionSnapshot, ApiError> {
        let url = format!("{}/analysis_status/{}", self.base_url, session_id);
        let resp = self.http.get(&url).send().await?;
        let resp = Self::check(resp).await?;
        let snapshot: SessionSnapshot = resp.json().await?;
        Ok(snapshot)
    }

    async fn update_system_prompt(
        &self,
        session_id: &str,
        new_prompt: &str,
    ) -> Result<(), ApiError> {
        let url = format!("{}/update_system_prompt", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&PromptUpdateRequest {
                session_id,
                new_prompt,
            })
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }
}
