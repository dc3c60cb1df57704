//! Orchestrator Client.
//!
//! Typed HTTP request/response over the orchestrator's REST surface: one
//! method per endpoint, never panics, always returns a typed `Result`.
//! Exactly two status codes are success: `200` (operation performed) and
//! `303` (resource already existed with the same key) — every other
//! status, and every transport failure, becomes an `Err` that the caller's
//! retry loop handles.

use std::collections::HashMap;
use std::net::IpAddr;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use oa_proto::{Node, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    /// HTTP 200 — operation performed.
    Performed,
    /// HTTP 303 — resource already existed with the same key.
    AlreadyExists,
}

#[derive(Debug, Error)]
pub enum OrchError {
    #[error("transport error calling orchestrator: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("orchestrator returned unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
}

/// Addresses the orchestrator at `http://<server_ip>:<server_api_port>`.
pub struct OrchClient {
    http: reqwest::Client,
    base_url: String,
}

impl OrchClient {
    pub fn new(server_ip: IpAddr, api_port: u16) -> Self {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: format!("http://{server_ip}:{api_port}"),
        }
    }

    pub async fn get_config(&self) -> Result<HashMap<String, Option<Value>>, OrchError> {
        let url = format!("{}/config", self.base_url);
        let resp = self.http.get(&url).send().await?;
        if resp.status().as_u16() == 200 {
            Ok(resp.json().await?)
        } else {
            Err(Self::unexpected(resp).await)
        }
    }

    pub async fn add_node(&self, node: &Node) -> Result<StatusOutcome, OrchError> {
        let url = format!("{}/node", self.base_url);
        self.post_json(&url, node).await
    }

    pub async fn delete_node(&self, id: &str) -> Result<StatusOutcome, OrchError> {
        let url = format!("{}/node/{}", self.base_url, id);
        let resp = self.http.delete(&url).send().await?;
        Self::status_outcome(resp).await
    }

    pub async fn update_node_specs(&self, node: &Node) -> Result<StatusOutcome, OrchError> {
        let url = format!("{}/node_specs/{}", self.base_url, node.id);
        let resp = self.http.put(&url).json(node).send().await?;
        Self::status_outcome(resp).await
    }

    pub async fn add_request(&self, req: &Request) -> Result<StatusOutcome, OrchError> {
        let url = format!("{}/request", self.base_url);
        self.post_json(&url, req).await
    }

    async fn post_json(&self, url: &str, body: &impl Serialize) -> Result<StatusOutcome, OrchError> {
        let resp = self.http.post(url).json(body).send().await?;
        Self::status_outcome(resp).await
    }

    async fn status_outcome(resp: reqwest::Response) -> Result<StatusOutcome, OrchError> {
        match resp.status().as_u16() {
            200 => Ok(StatusOutcome::Performed),
            303 => Ok(StatusOutcome::AlreadyExists),
            _ => Err(Self::unexpected(resp).await),
        }
    }

    async fn unexpected(resp: reqwest::Response) -> OrchError {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        debug!(status, %body, "orchestrator call failed");
        OrchError::UnexpectedStatus { status, body }
    }
}
