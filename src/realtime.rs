// Backend push channel. Events are treated as invalidation signals: they
// trigger a status re-fetch, or merge a teammate's instance change directly.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{self, header, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::client::InstanceApi;
use crate::config::{Config, DEFAULT_WS_RECONNECT_DELAY};
use crate::metrics;
use crate::models::{lenient_timestamp, null_as_default, ChallengeId, InstanceStatus, NO_INSTANCE};
use crate::poller::Mounted;
use crate::store::{InstanceStore, NoticeLevel};

const EVENT_CAPACITY: usize = 128;
const MAX_JITTER_MS: u64 = 1000;

/// `instance_update` pushed on the notifications channel when a teammate
/// starts, stops or kills an instance.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceUpdate {
    #[serde(default)]
    pub team_id: Option<u64>,
    #[serde(default)]
    pub user_id: Option<u64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub username: String,
    pub challenge_id: ChallengeId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub connection_info: Vec<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub container: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub ports: Vec<u16>,
}

impl InstanceUpdate {
    /// The status this event implies, in the shape a poll would return.
    pub fn to_status(&self) -> InstanceStatus {
        // Zero times mean "unset" on the wire.
        let set = |t: Option<DateTime<Utc>>| t.filter(|t| t.timestamp() > 0);
        InstanceStatus {
            has_instance: !self.status.is_empty() && self.status != NO_INSTANCE,
            status: if self.status.is_empty() {
                NO_INSTANCE.to_string()
            } else {
                self.status.clone()
            },
            created_at: set(self.created_at),
            expires_at: set(self.expires_at),
            is_expired: false,
            container: self.container.clone(),
            connection_info: self.connection_info.clone(),
            ports: self.ports.clone(),
        }
    }
}

/// A teammate solved a challenge.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamSolve {
    #[serde(default, deserialize_with = "null_as_default")]
    pub username: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub challenge_name: String,
    #[serde(default)]
    pub challenge_id: Option<ChallengeId>,
    #[serde(default)]
    pub points: i64,
}

impl TeamSolve {
    pub fn message(&self) -> String {
        let who = if self.username.is_empty() {
            "A teammate"
        } else {
            &self.username
        };
        let what = match (&self.challenge_name, self.challenge_id) {
            (name, _) if !name.is_empty() => name.clone(),
            (_, Some(id)) => format!("challenge #{id}"),
            (_, None) => "a challenge".to_string(),
        };
        format!("{who} solved {what} (+{} pts)", self.points)
    }
}

/// A decoded message from either push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    InstanceUpdate(InstanceUpdate),
    /// Instance state changed server-side; re-fetch `challenge_id`, or every
    /// tracked challenge when absent.
    Invalidate {
        challenge_id: Option<ChallengeId>,
        action: Option<String>,
    },
    CtfStatus {
        action: Option<String>,
        data: Option<Value>,
    },
    CategoryChanged {
        action: Option<String>,
    },
    TeamSolve(TeamSolve),
    Notification {
        title: String,
        message: String,
    },
    /// Any other named event.
    Other(String),
}

impl PushEvent {
    /// Metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            PushEvent::InstanceUpdate(_) => "instance_update",
            PushEvent::Invalidate { .. } => "instance",
            PushEvent::CtfStatus { .. } => "ctf_status",
            PushEvent::CategoryChanged { .. } => "challenge_category",
            PushEvent::TeamSolve(_) => "team_solve",
            PushEvent::Notification { .. } => "notification",
            PushEvent::Other(_) => "other",
        }
    }
}

fn id_field(value: &Value) -> Option<ChallengeId> {
    match value {
        Value::Number(n) => n.as_u64().and_then(ChallengeId::new),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Decode one text frame. `None` for anything that is not a JSON object we
/// recognise.
pub fn parse_message(text: &str) -> Option<PushEvent> {
    let value: Value = serde_json::from_str(text).ok()?;
    if !value.is_object() {
        return None;
    }
    let action = str_field(&value, "action");
    let name = str_field(&value, "event");

    let event = match name.as_deref() {
        Some("instance_update") => match serde_json::from_value(value) {
            Ok(update) => PushEvent::InstanceUpdate(update),
            Err(e) => {
                debug!("ignoring malformed instance_update: {e}");
                return None;
            }
        },
        Some("instance") => {
            let challenge_id = value.get("data").and_then(|d| {
                d.get("challengeId")
                    .or_else(|| d.get("challenge_id"))
                    .or_else(|| d.get("id"))
                    .and_then(id_field)
            });
            PushEvent::Invalidate {
                challenge_id,
                action,
            }
        }
        Some("ctf-status") | Some("ctf_status") => PushEvent::CtfStatus {
            action,
            data: value.get("data").cloned(),
        },
        Some("challenge-category") => PushEvent::CategoryChanged { action },
        Some("team_solve") => PushEvent::TeamSolve(serde_json::from_value(value).ok()?),
        Some(other) => PushEvent::Other(other.to_string()),
        // Plain notification objects carry no event name.
        None => {
            value.get("id")?;
            PushEvent::Notification {
                title: str_field(&value, "title")?,
                message: str_field(&value, "message").unwrap_or_default(),
            }
        }
    };
    Some(event)
}

/// Applies push events to the store.
#[derive(Clone)]
pub struct Dispatcher {
    api: Arc<dyn InstanceApi>,
    store: InstanceStore,
    events: broadcast::Sender<PushEvent>,
    mounted: Mounted,
}

impl Dispatcher {
    pub fn new(api: Arc<dyn InstanceApi>, store: InstanceStore) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            api,
            store,
            events,
            mounted: Mounted::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.events.subscribe()
    }

    pub fn handle_text(&self, text: &str) {
        match parse_message(text) {
            Some(event) => self.dispatch(event),
            None => debug!("ignoring unrecognised push message"),
        }
    }

    pub fn dispatch(&self, event: PushEvent) {
        metrics::REALTIME_EVENTS_TOTAL
            .with_label_values(&[event.kind()])
            .inc();

        match &event {
            PushEvent::InstanceUpdate(update) => {
                debug!(
                    challenge_id = %update.challenge_id,
                    status = %update.status,
                    user = %update.username,
                    "instance update pushed"
                );
                self.store
                    .apply_push(update.challenge_id, update.to_status());
                self.refetch(vec![update.challenge_id]);
            }
            PushEvent::Invalidate { challenge_id, .. } => {
                let ids = match challenge_id {
                    Some(id) => vec![*id],
                    None => self.store.tracked_ids(),
                };
                self.refetch(ids);
            }
            PushEvent::TeamSolve(solve) => {
                self.store
                    .notify(NoticeLevel::Info, solve.challenge_id, solve.message());
            }
            PushEvent::Notification { title, message } => {
                let text = if message.is_empty() {
                    title.clone()
                } else {
                    format!("{title}: {message}")
                };
                self.store.notify(NoticeLevel::Info, None, text);
            }
            PushEvent::CtfStatus { .. } | PushEvent::CategoryChanged { .. } | PushEvent::Other(_) => {}
        }

        let _ = self.events.send(event);
    }

    fn refetch(&self, ids: Vec<ChallengeId>) {
        if ids.is_empty() {
            return;
        }
        let api = self.api.clone();
        let store = self.store.clone();
        let live = self.mounted.clone();
        tokio::spawn(async move {
            for id in ids {
                let still = live.clone();
                store
                    .refresh_while(api.as_ref(), id, move || still.is_live())
                    .await;
            }
        });
    }

    fn shutdown(&self) {
        self.mounted.unmount();
    }
}

/// Connects to the backend push endpoints and feeds a [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct RealtimeListener {
    endpoints: Vec<String>,
    reconnect_delay: Duration,
    token: Option<String>,
    session_cookie: Option<String>,
}

impl RealtimeListener {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            reconnect_delay: DEFAULT_WS_RECONNECT_DELAY,
            token: None,
            session_cookie: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            endpoints: config.ws_endpoints(),
            reconnect_delay: config.ws_reconnect_delay,
            token: config.token.clone(),
            session_cookie: config.session_cookie.clone(),
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    fn request(&self, url: &str) -> Result<Request, tokio_tungstenite::tungstenite::Error> {
        let mut request = url.into_client_request()?;
        let headers = request.headers_mut();
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(http::Error::from)?;
            headers.insert(header::AUTHORIZATION, value);
        }
        if let Some(cookie) = &self.session_cookie {
            let value = HeaderValue::from_str(cookie).map_err(http::Error::from)?;
            headers.insert(header::COOKIE, value);
        }
        Ok(request)
    }

    /// Start one session per endpoint. Sessions stop when the handle is dropped.
    pub fn spawn(self, api: Arc<dyn InstanceApi>, store: InstanceStore) -> RealtimeHandle {
        let dispatcher = Dispatcher::new(api, store);
        let listener = Arc::new(self);
        let tasks = listener
            .endpoints
            .iter()
            .cloned()
            .map(|url| {
                let listener = listener.clone();
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move { listener.session(url, dispatcher).await })
            })
            .collect();
        RealtimeHandle { tasks, dispatcher }
    }

    async fn session(&self, url: String, dispatcher: Dispatcher) {
        loop {
            match self.request(&url) {
                Ok(request) => match connect_async(request).await {
                    Ok((stream, _)) => {
                        info!(%url, "realtime connected");
                        let _connected = ConnectedGauge::new();
                        if read_until_closed(stream, &dispatcher).await {
                            info!(%url, "realtime closed by server, not reconnecting");
                            return;
                        }
                        warn!(%url, "realtime connection lost");
                    }
                    Err(e) => warn!(%url, "realtime connect failed: {e}"),
                },
                Err(e) => {
                    warn!(%url, "invalid realtime request: {e}");
                    return;
                }
            }

            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_JITTER_MS));
            let delay = self.reconnect_delay + jitter;
            debug!(%url, delay_ms = delay.as_millis() as u64, "realtime reconnecting");
            metrics::REALTIME_RECONNECTS_TOTAL.inc();
            tokio::time::sleep(delay).await;
        }
    }
}

/// Reads frames until the connection ends. True when the server closed it
/// normally (1000) or is going away (1001).
async fn read_until_closed<S>(mut stream: S, dispatcher: &Dispatcher) -> bool
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => dispatcher.handle_text(&text),
            Ok(Message::Close(frame)) => {
                return frame.is_some_and(|f| matches!(f.code, CloseCode::Normal | CloseCode::Away));
            }
            Ok(_) => {}
            Err(e) => {
                warn!("realtime read failed: {e}");
                return false;
            }
        }
    }
    false
}

/// Holds the connected gauge up for the lifetime of a connection.
struct ConnectedGauge;

impl ConnectedGauge {
    fn new() -> Self {
        metrics::REALTIME_CONNECTED.inc();
        Self
    }
}

impl Drop for ConnectedGauge {
    fn drop(&mut self) {
        metrics::REALTIME_CONNECTED.dec();
    }
}

/// Running realtime sessions. Dropping it closes them.
pub struct RealtimeHandle {
    tasks: Vec<JoinHandle<()>>,
    dispatcher: Dispatcher,
}

impl RealtimeHandle {
    /// Every decoded push event, after it has been applied to the store.
    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.dispatcher.subscribe()
    }

    /// True once every session has ended on its own.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(JoinHandle::is_finished)
    }
}

impl Drop for RealtimeHandle {
    fn drop(&mut self) {
        self.dispatcher.shutdown();
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeApi, CONNECTION};
    use crate::models::Operation;
    use crate::reconcile::LocalStatus;
    use crate::store::StoreEvent;
    use serde_json::json;

    fn id(n: u64) -> ChallengeId {
        ChallengeId::new(n).unwrap()
    }

    #[test]
    fn test_parse_instance_update() {
        let text = json!({
            "event": "instance_update",
            "teamId": 3,
            "userId": 8,
            "username": "alice",
            "challengeId": 42,
            "status": "running",
            "connectionInfo": ["tcp://1.2.3.4:31337"],
            "createdAt": "2025-01-01T10:00:00Z",
            "expiresAt": "0001-01-01T00:00:00Z",
            "container": "ctr-9",
            "ports": [31337]
        })
        .to_string();

        let Some(PushEvent::InstanceUpdate(update)) = parse_message(&text) else {
            panic!("expected instance update");
        };
        assert_eq!(update.challenge_id, id(42));
        assert_eq!(update.username, "alice");

        let status = update.to_status();
        assert!(status.has_instance);
        assert_eq!(status.status, "running");
        assert_eq!(status.connection_info, vec!["tcp://1.2.3.4:31337"]);
        assert!(status.created_at.is_some());
        assert!(status.expires_at.is_none());
        assert_eq!(status.ports, vec![31337]);
    }

    #[test]
    fn test_parse_instance_invalidation() {
        assert_eq!(
            parse_message(r#"{"event":"instance","action":"update","data":{"challengeId":7}}"#),
            Some(PushEvent::Invalidate {
                challenge_id: Some(id(7)),
                action: Some("update".into())
            })
        );
        assert_eq!(
            parse_message(r#"{"event":"instance","data":{"challenge_id":"8"}}"#),
            Some(PushEvent::Invalidate {
                challenge_id: Some(id(8)),
                action: None
            })
        );
        assert_eq!(
            parse_message(r#"{"event":"instance"}"#),
            Some(PushEvent::Invalidate {
                challenge_id: None,
                action: None
            })
        );
    }

    #[test]
    fn test_parse_other_events() {
        assert!(matches!(
            parse_message(r#"{"event":"ctf-status","action":"update","data":{"status":"active"}}"#),
            Some(PushEvent::CtfStatus { .. })
        ));
        assert_eq!(
            parse_message(r#"{"event":"challenge-category","action":"create"}"#),
            Some(PushEvent::CategoryChanged {
                action: Some("create".into())
            })
        );
        assert_eq!(
            parse_message(r#"{"event":"first_blood"}"#),
            Some(PushEvent::Other("first_blood".into()))
        );
        assert_eq!(
            parse_message(r#"{"id":4,"title":"Hint released","message":"check web-2"}"#),
            Some(PushEvent::Notification {
                title: "Hint released".into(),
                message: "check web-2".into()
            })
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_message("not json"), None);
        assert_eq!(parse_message("[1,2]"), None);
        assert_eq!(parse_message(r#"{"title":"no id"}"#), None);
        assert_eq!(parse_message(r#"{"event":"instance_update","challengeId":0}"#), None);
    }

    #[test]
    fn test_team_solve_message() {
        let Some(PushEvent::TeamSolve(solve)) = parse_message(
            r#"{"event":"team_solve","username":"bob","challengeName":"pwn-1","challengeId":5,"points":300}"#,
        ) else {
            panic!("expected team solve");
        };
        assert_eq!(solve.message(), "bob solved pwn-1 (+300 pts)");

        let anonymous = TeamSolve {
            username: String::new(),
            challenge_name: String::new(),
            challenge_id: Some(id(5)),
            points: 50,
        };
        assert_eq!(anonymous.message(), "A teammate solved challenge #5 (+50 pts)");
    }

    #[tokio::test]
    async fn test_instance_update_merges_then_refetches() {
        let api = FakeApi::new();
        api.set_status(id(42), FakeApi::running());
        let store = InstanceStore::new();
        let dispatcher = Dispatcher::new(api.clone(), store.clone());
        let mut pushed = dispatcher.subscribe();

        dispatcher.handle_text(
            &json!({
                "event": "instance_update",
                "challengeId": 42,
                "status": "running",
                "connectionInfo": [CONNECTION]
            })
            .to_string(),
        );

        // Merged before any fetch completes.
        let view = store.view(id(42));
        assert_eq!(view.local_status, LocalStatus::Running);
        assert_eq!(view.connection_info, vec![CONNECTION]);
        assert!(matches!(pushed.try_recv(), Ok(PushEvent::InstanceUpdate(_))));

        while api.calls(Operation::Status).is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(api.calls(Operation::Status), vec![id(42)]);
    }

    #[tokio::test]
    async fn test_invalidate_without_id_refetches_tracked() {
        let api = FakeApi::new();
        let store = InstanceStore::new();
        store.apply_push(id(1), InstanceStatus::no_instance());
        store.apply_push(id(2), InstanceStatus::no_instance());
        let dispatcher = Dispatcher::new(api.clone(), store.clone());

        dispatcher.handle_text(r#"{"event":"instance","action":"delete"}"#);
        while api.calls(Operation::Status).len() < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(api.calls(Operation::Status), vec![id(1), id(2)]);
    }

    #[tokio::test]
    async fn test_team_solve_becomes_notice() {
        let store = InstanceStore::new();
        let mut rx = store.subscribe();
        let dispatcher = Dispatcher::new(FakeApi::new(), store.clone());

        dispatcher.handle_text(
            r#"{"event":"team_solve","username":"bob","challengeName":"pwn-1","points":100}"#,
        );
        match rx.try_recv() {
            Ok(StoreEvent::Notice(n)) => {
                assert_eq!(n.level, NoticeLevel::Info);
                assert_eq!(n.message, "bob solved pwn-1 (+100 pts)");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_listener_request_headers() {
        let config = Config {
            token: Some("tok".into()),
            session_cookie: Some("session=abc".into()),
            ..Config::with_base_url("https://ctf.example.com")
        };
        let listener = RealtimeListener::from_config(&config);
        assert_eq!(
            listener.endpoints(),
            [
                "wss://ctf.example.com/api/ws/updates".to_string(),
                "wss://ctf.example.com/api/ws/notifications".to_string()
            ]
        );
        let request = listener.request(&listener.endpoints()[0]).unwrap();
        assert_eq!(request.headers()[header::AUTHORIZATION], "Bearer tok");
        assert_eq!(request.headers()[header::COOKIE], "session=abc");
    }

    #[test]
    fn test_connected_gauge_counts_each_session() {
        let before = metrics::REALTIME_CONNECTED.get();
        let updates = ConnectedGauge::new();
        let notifications = ConnectedGauge::new();
        assert_eq!(metrics::REALTIME_CONNECTED.get(), before + 2);
        drop(updates);
        assert_eq!(metrics::REALTIME_CONNECTED.get(), before + 1);
        drop(notifications);
        assert_eq!(metrics::REALTIME_CONNECTED.get(), before);
    }
}
