//! HTTP identification service and health probe.

use async_trait::async_trait;
use cardscan_core::{ConnectionStatus, Prediction};
use reqwest::StatusCode;
use std::time::Duration;

use super::{CardIdentifier, HealthProbe};
use crate::error::DependencyError;

/// Calls a remote identification endpoint with the raw image bytes.
///
/// The endpoint answers with a JSON prediction:
/// `{"name": "...", "set": "...", "rarity": "...", "confidence": 0.93, ...}`.
#[derive(Debug, Clone)]
pub struct HttpIdentifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpIdentifier {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CardIdentifier for HttpIdentifier {
    async fn identify(&self, image: &[u8]) -> Result<Prediction, DependencyError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        response
            .json::<Prediction>()
            .await
            .map_err(|e| DependencyError::Internal(format!("Invalid prediction payload: {}", e)))
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Probes a health URL.
///
/// 2xx is online, any other answer is degraded, no answer is offline.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self) -> ConnectionStatus {
        match self.client.get(&self.url).send().await {
            Ok(response) => status_to_connection(response.status()),
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "Health probe failed");
                ConnectionStatus::Offline
            }
        }
    }
}

fn request_error(error: reqwest::Error) -> DependencyError {
    if error.is_timeout() {
        DependencyError::unavailable(format!("request timed out: {}", error))
    } else {
        DependencyError::unavailable(error.to_string())
    }
}

/// Rate limiting and server errors are transient; other client errors mean
/// the service rejected the image.
fn status_error(status: StatusCode, body: &str) -> DependencyError {
    let message = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    };
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        DependencyError::unavailable(message)
    } else {
        DependencyError::rejected(message)
    }
}

fn status_to_connection(status: StatusCode) -> ConnectionStatus {
    if status.is_success() {
        ConnectionStatus::Online
    } else {
        ConnectionStatus::Degraded
    }
}
