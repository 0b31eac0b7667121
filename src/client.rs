// HTTP client for the backend's challenge instance endpoints.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{Config, DEFAULT_STATUS_PATH};
use crate::error::ApiError;
use crate::metrics;
use crate::models::{ChallengeId, InstanceResponse, InstanceStatus, Operation};

/// The four instance lifecycle calls plus the admin image build.
///
/// Implementations report failures as `Err` and never show anything to the
/// user themselves; that is the caller's job.
#[async_trait]
pub trait InstanceApi: Send + Sync {
    /// Provision (or restart) the team's instance for a challenge.
    async fn start(&self, id: ChallengeId) -> Result<InstanceResponse, ApiError>;

    /// Stop the running container. The instance can be started again.
    async fn stop(&self, id: ChallengeId) -> Result<Value, ApiError>;

    /// Force-remove the instance. A fresh `start` is needed afterwards.
    async fn kill(&self, id: ChallengeId) -> Result<Value, ApiError>;

    /// Read the current instance status. Never mutates backend state.
    async fn status(&self, id: ChallengeId) -> Result<InstanceStatus, ApiError>;

    /// Build the challenge image ahead of time (admin only).
    async fn build(&self, id: ChallengeId) -> Result<Value, ApiError>;
}

#[async_trait]
impl<T: InstanceApi + ?Sized> InstanceApi for Arc<T> {
    async fn start(&self, id: ChallengeId) -> Result<InstanceResponse, ApiError> {
        (**self).start(id).await
    }
    async fn stop(&self, id: ChallengeId) -> Result<Value, ApiError> {
        (**self).stop(id).await
    }
    async fn kill(&self, id: ChallengeId) -> Result<Value, ApiError> {
        (**self).kill(id).await
    }
    async fn status(&self, id: ChallengeId) -> Result<InstanceStatus, ApiError> {
        (**self).status(id).await
    }
    async fn build(&self, id: ChallengeId) -> Result<Value, ApiError> {
        (**self).build(id).await
    }
}

/// `reqwest`-backed implementation talking to a real backend.
#[derive(Debug, Clone)]
pub struct HttpInstanceClient {
    base_url: String,
    client: reqwest::Client,
    token: Option<String>,
    status_path: String,
}

impl HttpInstanceClient {
    /// Client with a cookie store and no request timeout.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().cookie_store(true).build()?;
        Ok(Self {
            base_url: trim_base(base_url.into()),
            client,
            token: None,
            status_path: DEFAULT_STATUS_PATH.to_string(),
        })
    }

    /// Build a client from application configuration. The session cookie, if
    /// any, is seeded into the cookie jar for the backend origin.
    pub fn from_config(config: &Config) -> Result<Self, ApiError> {
        let base_url = trim_base(config.base_url.clone());
        let jar = Arc::new(reqwest::cookie::Jar::default());
        if let Some(cookie) = &config.session_cookie {
            let origin: Url = base_url
                .parse()
                .map_err(|e| ApiError::Decode(format!("invalid base url {base_url:?}: {e}")))?;
            jar.add_cookie_str(cookie, &origin);
        }

        let mut builder = reqwest::Client::builder().cookie_provider(jar);
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            base_url,
            client: builder.build()?,
            token: config.token.clone(),
            status_path: config.status_path.clone(),
        })
    }

    /// Send `Authorization: Bearer <token>` with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Read status from `/api/challenges/{id}/<path>` instead of `status`.
    pub fn with_status_path(mut self, path: impl Into<String>) -> Self {
        self.status_path = path.into().trim_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn path(&self, id: ChallengeId, op: Operation) -> String {
        let segment = match op {
            Operation::Status => self.status_path.as_str(),
            _ => op.as_str(),
        };
        format!("/api/challenges/{id}/{segment}")
    }

    /// Issue one request and return the body of a 2xx response.
    async fn send(&self, id: ChallengeId, op: Operation) -> Result<String, ApiError> {
        let path = self.path(id, op);
        let endpoint = metrics::normalize_path(&path);
        let method = match op {
            Operation::Status => Method::GET,
            _ => Method::POST,
        };
        let request_id = Uuid::new_v4().to_string();

        let mut request = self
            .client
            .request(method.clone(), format!("{}{}", self.base_url, path))
            .header("X-Request-Id", &request_id);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        debug!(challenge_id = %id, op = %op, %request_id, "sending instance request");
        let timer = metrics::API_REQUEST_DURATION_SECONDS
            .with_label_values(&[endpoint.as_str()])
            .start_timer();
        let result = request.send().await;
        timer.observe_duration();

        let response = match result {
            Ok(r) => r,
            Err(e) => {
                metrics::API_REQUESTS_TOTAL
                    .with_label_values(&[method.as_str(), endpoint.as_str(), "transport_error"])
                    .inc();
                warn!(challenge_id = %id, op = %op, %request_id, "instance request failed: {e}");
                return Err(e.into());
            }
        };

        let status = response.status();
        metrics::API_REQUESTS_TOTAL
            .with_label_values(&[method.as_str(), endpoint.as_str(), status.as_str()])
            .inc();
        let body = response.text().await?;

        if !status.is_success() {
            warn!(
                challenge_id = %id,
                op = %op,
                %request_id,
                status = status.as_u16(),
                "backend rejected instance request: {body}"
            );
            return Err(ApiError::from_response(op, status.as_u16(), &body));
        }

        debug!(challenge_id = %id, op = %op, %request_id, "instance request ok");
        Ok(body)
    }
}

fn trim_base(mut base: String) -> String {
    while base.ends_with('/') {
        base.pop();
    }
    base
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T, ApiError> {
    serde_json::from_str(body).map_err(|e| ApiError::Decode(e.to_string()))
}

/// Acks are opaque; an empty body is a valid ack.
fn decode_ack(body: &str) -> Result<Value, ApiError> {
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    decode(body)
}

#[async_trait]
impl InstanceApi for HttpInstanceClient {
    async fn start(&self, id: ChallengeId) -> Result<InstanceResponse, ApiError> {
        let body = self.send(id, Operation::Start).await?;
        decode(&body)
    }

    async fn stop(&self, id: ChallengeId) -> Result<Value, ApiError> {
        let body = self.send(id, Operation::Stop).await?;
        decode_ack(&body)
    }

    async fn kill(&self, id: ChallengeId) -> Result<Value, ApiError> {
        let body = self.send(id, Operation::Kill).await?;
        decode_ack(&body)
    }

    async fn status(&self, id: ChallengeId) -> Result<InstanceStatus, ApiError> {
        let body = self.send(id, Operation::Status).await?;
        decode(&body)
    }

    async fn build(&self, id: ChallengeId) -> Result<Value, ApiError> {
        let body = self.send(id, Operation::Build).await?;
        decode_ack(&body)
    }
}
