// Wire types exchanged with the pwnthemall backend for challenge instances.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ApiError;

/// Backend id of a challenge. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct ChallengeId(u64);

impl ChallengeId {
    /// Returns `None` for zero, which the backend never assigns.
    pub fn new(id: u64) -> Option<Self> {
        (id > 0).then_some(Self(id))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChallengeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChallengeId {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .ok()
            .and_then(ChallengeId::new)
            .ok_or_else(|| ApiError::InvalidChallengeId(s.to_string()))
    }
}

impl TryFrom<u64> for ChallengeId {
    type Error = ApiError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        ChallengeId::new(value).ok_or_else(|| ApiError::InvalidChallengeId(value.to_string()))
    }
}

impl From<ChallengeId> for u64 {
    fn from(id: ChallengeId) -> Self {
        id.0
    }
}

impl TryFrom<i64> for ChallengeId {
    type Error = ApiError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u64::try_from(value)
            .ok()
            .and_then(ChallengeId::new)
            .ok_or_else(|| ApiError::InvalidChallengeId(value.to_string()))
    }
}

/// The instance lifecycle operations the client can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Start,
    Stop,
    Kill,
    Status,
    Build,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Kill => "kill",
            Operation::Status => "status",
            Operation::Build => "build",
        }
    }

    /// Message shown when the backend gives no usable error code.
    pub fn default_error_message(&self) -> &'static str {
        match self {
            Operation::Start => "Failed to start instance",
            Operation::Stop => "Failed to stop instance",
            Operation::Kill => "Failed to kill instance",
            Operation::Status => "Failed to get instance status",
            Operation::Build => "Failed to build image",
        }
    }

    pub fn success_message(&self) -> &'static str {
        match self {
            Operation::Start => "Instance started successfully",
            Operation::Stop => "Instance stopped successfully",
            Operation::Kill => "Instance killed successfully",
            Operation::Status => "Instance status received",
            Operation::Build => "Image built successfully",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of `GET /api/challenges/{id}/status`.
///
/// Every field is optional on the wire. An empty object decodes to the same
/// value the backend sends for "no instance".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    #[serde(default)]
    pub has_instance: bool,
    #[serde(default = "default_raw_status")]
    pub status: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_expired: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub container: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub connection_info: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub ports: Vec<u16>,
}

fn default_raw_status() -> String {
    NO_INSTANCE.to_string()
}

/// Raw status the backend reports when the team has no instance.
pub const NO_INSTANCE: &str = "no_instance";

impl InstanceStatus {
    /// The status used when a poll returns something unusable.
    pub fn no_instance() -> Self {
        Self {
            status: default_raw_status(),
            ..Default::default()
        }
    }
}

/// Body of `POST /api/challenges/{id}/start`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub image_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub container_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub connection_info: Vec<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub ports: Vec<u16>,
}

/// Minimal challenge description used to drive batch polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeSummary {
    pub id: ChallengeId,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub challenge_type: String,
}

impl ChallengeSummary {
    pub fn docker(id: ChallengeId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            challenge_type: "docker".to_string(),
        }
    }

    /// Only docker challenges have instances to poll.
    pub fn is_docker(&self) -> bool {
        self.challenge_type.eq_ignore_ascii_case("docker")
    }
}

/// Treat an explicit `null` the same as a missing field.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Accept RFC 3339 strings; anything else (empty, null, garbage) becomes `None`.
pub(crate) fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(serde_json::Value::String(s)) => DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
        _ => None,
    })
}
