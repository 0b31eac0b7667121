// Maps raw backend instance status to the narrow state shown to players.
//
// Every place that turns an `InstanceStatus` into displayed state goes through
// `reconcile`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::InstanceStatus;

/// Displayed state of a challenge instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalStatus {
    Running,
    #[default]
    Stopped,
    Building,
    Expired,
}

impl LocalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocalStatus::Running => "running",
            LocalStatus::Stopped => "stopped",
            LocalStatus::Building => "building",
            LocalStatus::Expired => "expired",
        }
    }

    /// Map a raw backend status string. Exact match; anything unknown is stopped.
    pub fn from_raw(raw: &str) -> Self {
        match raw {
            "running" => LocalStatus::Running,
            "building" => LocalStatus::Building,
            "expired" => LocalStatus::Expired,
            _ => LocalStatus::Stopped,
        }
    }
}

impl fmt::Display for LocalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of [`reconcile`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Reconciled {
    pub local_status: LocalStatus,
    /// Empty unless `local_status` is `Running`.
    pub connection_info: Vec<String>,
}

/// Reconcile a fetched status.
///
/// Only `status` decides the state. `is_expired` is not consulted, so a
/// `"running"` status with `is_expired` set stays `Running`.
pub fn reconcile(raw: &InstanceStatus) -> Reconciled {
    let local_status = LocalStatus::from_raw(&raw.status);
    let connection_info = if local_status == LocalStatus::Running {
        raw.connection_info.clone()
    } else {
        Vec::new()
    };
    Reconciled {
        local_status,
        connection_info,
    }
}

/// Badge text for a status, as the instance controls show it.
pub fn status_label(raw: &InstanceStatus) -> &str {
    if !raw.has_instance {
        return "No Instance";
    }
    if raw.is_expired {
        return "Expired";
    }
    match raw.status.as_str() {
        "running" => "Running",
        "stopped" => "Stopped",
        other => other,
    }
}

/// Human readable time left before `expires_at`.
pub fn time_remaining(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<String> {
    let expires_at = expires_at?;
    let diff = expires_at - now;
    if diff.num_milliseconds() <= 0 {
        return Some("Expired".to_string());
    }
    let minutes = diff.num_minutes();
    let hours = minutes / 60;
    let remaining_minutes = minutes % 60;
    if hours > 0 {
        Some(format!("{hours}h {remaining_minutes}m remaining"))
    } else {
        Some(format!("{remaining_minutes}m remaining"))
    }
}

/// Something the player can do to an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Start,
    Restart,
    Stop,
    Kill,
}

impl Action {
    pub fn label(&self) -> &'static str {
        match self {
            Action::Start => "Start Instance",
            Action::Restart => "Restart Instance",
            Action::Stop => "Stop Instance",
            Action::Kill => "Kill Instance",
        }
    }
}

/// Actions offered for a displayed state. `has_instance` distinguishes a
/// stopped-but-existing instance (restart) from none at all (start).
pub fn available_actions(status: LocalStatus, has_instance: bool) -> Vec<Action> {
    match status {
        LocalStatus::Running => vec![Action::Stop, Action::Kill],
        LocalStatus::Building => Vec::new(),
        LocalStatus::Stopped if has_instance => vec![Action::Restart],
        LocalStatus::Stopped | LocalStatus::Expired => vec![Action::Start],
    }
}
