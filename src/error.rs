// Error types for the instance API client.

use serde::Deserialize;
use thiserror::Error;

use crate::models::Operation;

/// Errors returned by [`crate::client::InstanceApi`] implementations.
#[derive(Debug, Error)]
pub enum ApiError {
    /// No response was received (connection refused, DNS, TLS, timeout).
    #[error("Network error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The backend answered with a non-2xx status.
    #[error("{message} (HTTP {status})")]
    Backend {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// The backend answered 2xx but the body was not what we expected.
    #[error("Malformed response: {0}")]
    Decode(String),

    #[error("Invalid challenge id: {0:?}")]
    InvalidChallengeId(String),
}

impl ApiError {
    /// HTTP status, when the backend produced one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ApiError::Backend { status, .. } => Some(*status),
            ApiError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether retrying the same request later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Transport(_) => true,
            ApiError::Backend { status, .. } => *status >= 500 || *status == 425 || *status == 429,
            ApiError::Decode(_) | ApiError::InvalidChallengeId(_) => false,
        }
    }

    /// Text suitable for a user-facing notice.
    pub fn user_message(&self, op: Operation) -> String {
        match self {
            ApiError::Backend { message, .. } => message.clone(),
            ApiError::InvalidChallengeId(_) => self.to_string(),
            _ => op.default_error_message().to_string(),
        }
    }

    /// Build a `Backend` error from a failed response body.
    pub fn from_response(op: Operation, status: u16, body: &str) -> Self {
        let parsed = serde_json::from_str::<ErrorBody>(body).ok();
        let code = parsed
            .as_ref()
            .and_then(|b| b.error.clone())
            .filter(|c| !c.is_empty());
        let remaining = parsed.as_ref().and_then(|b| b.remaining_seconds);
        let message = match code.as_deref() {
            Some(code) => describe_error_code(code, remaining),
            None => op.default_error_message().to_string(),
        };
        ApiError::Backend {
            status,
            code,
            message,
        }
    }
}

/// JSON error body the backend sends on failure: `{"error": "...", ...}`.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    remaining_seconds: Option<i64>,
}

/// Map a backend error code to the message shown to players.
/// Unknown codes are shown verbatim.
pub fn describe_error_code(code: &str, remaining_seconds: Option<i64>) -> String {
    let msg = match code {
        "team_required" => "You must be in a team to start an instance",
        "instance_already_running" => "An instance is already running for this challenge",
        "max_instances_by_user_reached" => "You have reached the maximum number of instances",
        "max_instances_by_team_reached" => "Your team has reached the maximum number of instances",
        "docker_build_failed" => "Failed to build Docker image",
        "challenge_not_docker_type" => "This challenge is not a Docker challenge",
        "docker_config_not_found" => "Docker configuration not found",
        "instance_create_failed" => "Failed to create instance",
        "instance_not_found" => "No instance is running for this challenge",
        "instance_cooldown_not_elapsed" => {
            return match remaining_seconds {
                Some(secs) => format!("Please wait {secs}s before restarting this instance"),
                None => "Please wait before restarting this instance".to_string(),
            };
        }
        other => other,
    };
    msg.to_string()
}
