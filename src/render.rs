// Terminal rendering of instance state: badges, connection info, actions.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};

use crate::models::{ChallengeId, Operation};
use crate::reconcile::{status_label, time_remaining, Action, LocalStatus};
use crate::store::{InFlight, InstanceView, Notice, NoticeLevel, StoreEvent};

/// The operation an action button issues.
pub fn action_operation(action: Action) -> Operation {
    match action {
        Action::Start | Action::Restart => Operation::Start,
        Action::Stop => Operation::Stop,
        Action::Kill => Operation::Kill,
    }
}

/// Whether any user action on `id` is still in flight. Polling does not count.
pub fn actions_locked(in_flight: &InFlight, id: ChallengeId) -> bool {
    [Operation::Start, Operation::Stop, Operation::Kill]
        .into_iter()
        .any(|op| in_flight.is_busy(id, op))
}

/// Badge text. A pending action shows its optimistic state.
pub fn badge(view: &InstanceView) -> String {
    if view.pending.is_some() {
        return match view.local_status {
            LocalStatus::Building => "Starting...".to_string(),
            LocalStatus::Stopped => "Stopping...".to_string(),
            other => other.to_string(),
        };
    }
    match &view.confirmed {
        Some(raw) => status_label(raw).to_string(),
        None => "No Instance".to_string(),
    }
}

fn timestamp(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Multi-line detail block for one challenge.
pub fn detail(view: &InstanceView, in_flight: &InFlight, now: DateTime<Utc>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Challenge {}: {}", view.id, badge(view));
    let _ = writeln!(out, "  state:      {}", view.local_status);

    if let Some(raw) = &view.confirmed {
        let _ = writeln!(out, "  status:     {}", raw.status);
        if !raw.container.is_empty() {
            let _ = writeln!(out, "  container:  {}", raw.container);
        }
        if raw.has_instance {
            let _ = writeln!(out, "  created:    {}", timestamp(raw.created_at));
            let _ = write!(out, "  expires:    {}", timestamp(raw.expires_at));
            if let Some(left) = time_remaining(raw.expires_at, now) {
                let _ = write!(out, " ({left})");
            }
            out.push('\n');
        }
    }

    for (i, info) in view.connection_info.iter().enumerate() {
        let label = if i == 0 { "connect:" } else { "" };
        let _ = writeln!(out, "  {label:<11} {info}");
    }

    let locked = actions_locked(in_flight, view.id);
    let actions: Vec<String> = view
        .actions()
        .into_iter()
        .map(|a| {
            if locked {
                format!("({})", a.label())
            } else {
                format!("[{}]", a.label())
            }
        })
        .collect();
    if actions.is_empty() {
        let _ = writeln!(out, "  actions:    none");
    } else {
        let _ = writeln!(out, "  actions:    {}", actions.join(" "));
    }
    out
}

/// One line for a collection grid.
pub fn row(view: &InstanceView, name: Option<&str>) -> String {
    let name = name.unwrap_or("");
    let connect = view.connection_info.first().map(String::as_str).unwrap_or("-");
    format!(
        "{:>6}  {:<24} {:<12} {}",
        view.id,
        name,
        badge(view),
        connect
    )
}

pub fn notice(notice: &Notice) -> String {
    let tag = match notice.level {
        NoticeLevel::Success => "ok",
        NoticeLevel::Info => "info",
        NoticeLevel::Error => "error",
    };
    match notice.challenge_id {
        Some(id) => format!("[{tag}] challenge {id}: {}", notice.message),
        None => format!("[{tag}] {}", notice.message),
    }
}

/// One line per store event, as `watch` prints them.
pub fn event(event: &StoreEvent) -> String {
    match event {
        StoreEvent::Updated(view) => {
            let mut line = format!("challenge {} -> {}", view.id, badge(view));
            if !view.connection_info.is_empty() {
                let _ = write!(line, " ({})", view.connection_info.join(", "));
            }
            line
        }
        StoreEvent::Notice(n) => notice(n),
    }
}
