// Client configuration, loaded from environment variables and CLI flags.

use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_REFETCH_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_WS_RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Last path segment of the status endpoint, `/api/challenges/{id}/<this>`.
pub const DEFAULT_STATUS_PATH: &str = "status";

/// WebSocket paths tried in order when realtime updates are enabled.
pub const DEFAULT_WS_PATHS: [&str; 2] = ["/api/ws/updates", "/api/ws/notifications"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Backend origin, e.g. `https://ctf.example.org`. Configured once for the
    /// whole client, never per request.
    pub base_url: String,
    /// Bearer token sent as `Authorization` on every request.
    pub token: Option<String>,
    /// Raw `name=value` session cookie seeded into the cookie jar.
    pub session_cookie: Option<String>,
    /// Period of the fixed-interval poller.
    pub poll_interval: Duration,
    /// Delay between a successful action and the confirming status fetch.
    pub refetch_delay: Duration,
    /// Per-request timeout. `None` leaves it to the HTTP stack.
    pub request_timeout: Option<Duration>,
    /// Wait before reconnecting a dropped WebSocket.
    pub ws_reconnect_delay: Duration,
    /// Whether to listen for push events at all.
    pub realtime: bool,
    /// Status endpoint segment after `/api/challenges/{id}/`.
    pub status_path: String,
}

/// Values given on the command line. They win over the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub poll_interval_secs: Option<u64>,
    pub realtime: bool,
}

impl Config {
    /// Defaults pointed at the given backend.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Config {
            base_url: base_url.into(),
            token: None,
            session_cookie: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            refetch_delay: DEFAULT_REFETCH_DELAY,
            request_timeout: None,
            ws_reconnect_delay: DEFAULT_WS_RECONNECT_DELAY,
            realtime: false,
            status_path: DEFAULT_STATUS_PATH.to_string(),
        }
    }

    /// Load configuration from the process environment and CLI overrides.
    ///
    /// Environment variables:
    /// - `PTA_BASE_URL` - backend origin (default: `http://localhost:8080`)
    /// - `PTA_TOKEN` - bearer token
    /// - `PTA_SESSION_COOKIE` - `name=value` session cookie
    /// - `PTA_POLL_INTERVAL_SECS` - interval poll period (default: 30)
    /// - `PTA_REFETCH_DELAY_MS` - delay before the post-action re-fetch (default: 1000)
    /// - `PTA_REQUEST_TIMEOUT_SECS` - request timeout (default: none)
    /// - `PTA_WS_RECONNECT_SECS` - WebSocket reconnect delay (default: 5)
    /// - `PTA_REALTIME` - `true`/`1` to enable push updates
    /// - `PTA_STATUS_PATH` - status endpoint segment (default: `status`)
    pub fn load(overrides: &Overrides) -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok(), overrides)
    }

    /// Same as [`Config::load`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F, overrides: &Overrides) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::with_base_url(DEFAULT_BASE_URL);

        if let Some(url) = overrides.base_url.clone().or_else(|| lookup("PTA_BASE_URL")) {
            config.base_url = validate_base_url(url)?;
        }
        config.token = overrides
            .token
            .clone()
            .or_else(|| lookup("PTA_TOKEN"))
            .filter(|t| !t.is_empty());
        config.session_cookie = lookup("PTA_SESSION_COOKIE").filter(|c| !c.is_empty());

        // Interval: CLI flag takes precedence, then env var, then default
        let interval = match overrides.poll_interval_secs {
            Some(secs) => Some(secs),
            None => parse_number(&lookup, "PTA_POLL_INTERVAL_SECS")?,
        };
        if let Some(secs) = interval {
            if secs == 0 {
                return Err(ConfigError::InvalidValue {
                    name: "PTA_POLL_INTERVAL_SECS",
                    value: secs.to_string(),
                    reason: "must be at least 1",
                });
            }
            config.poll_interval = Duration::from_secs(secs);
        }

        if let Some(ms) = parse_number(&lookup, "PTA_REFETCH_DELAY_MS")? {
            config.refetch_delay = Duration::from_millis(ms);
        }
        config.request_timeout =
            parse_number(&lookup, "PTA_REQUEST_TIMEOUT_SECS")?.map(Duration::from_secs);
        if let Some(secs) = parse_number(&lookup, "PTA_WS_RECONNECT_SECS")? {
            config.ws_reconnect_delay = Duration::from_secs(secs);
        }

        config.realtime = overrides.realtime
            || lookup("PTA_REALTIME")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(false);

        if let Some(path) = lookup("PTA_STATUS_PATH") {
            config.status_path = validate_status_path(path)?;
        }

        Ok(config)
    }

    /// WebSocket endpoints derived from the base URL (`http` -> `ws`, `https` -> `wss`).
    pub fn ws_endpoints(&self) -> Vec<String> {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https") {
            format!("wss{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http") {
            format!("ws{rest}")
        } else {
            self.base_url.clone()
        };
        let ws_base = ws_base.trim_end_matches('/');
        DEFAULT_WS_PATHS
            .iter()
            .map(|path| format!("{ws_base}{path}"))
            .collect()
    }
}

fn validate_base_url(url: String) -> Result<String, ConfigError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(url.trim_end_matches('/').to_string())
    } else {
        Err(ConfigError::InvalidValue {
            name: "PTA_BASE_URL",
            value: url,
            reason: "must start with http:// or https://",
        })
    }
}

fn validate_status_path(path: String) -> Result<String, ConfigError> {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() || trimmed.contains(char::is_whitespace) {
        return Err(ConfigError::InvalidValue {
            name: "PTA_STATUS_PATH",
            value: path,
            reason: "expected a non-empty path segment",
        });
    }
    Ok(trimmed.to_string())
}

fn parse_number<F>(lookup: &F, name: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(v) if v.trim().is_empty() => Ok(None),
        Some(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                name,
                value: v,
                reason: "expected a non-negative integer",
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(env(&[]), &Overrides::default()).unwrap();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.ws_reconnect_delay, Duration::from_secs(5));
        assert!(config.token.is_none());
        assert!(config.request_timeout.is_none());
        assert!(!config.realtime);
        assert_eq!(config.status_path, "status");
    }

    #[test]
    fn test_status_path_from_env() {
        let config = Config::from_lookup(
            env(&[("PTA_STATUS_PATH", "/instance-status/")]),
            &Overrides::default(),
        )
        .unwrap();
        assert_eq!(config.status_path, "instance-status");

        let err = Config::from_lookup(env(&[("PTA_STATUS_PATH", "/")]), &Overrides::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "PTA_STATUS_PATH", .. }));
    }

    #[test]
    fn test_env_values() {
        let config = Config::from_lookup(
            env(&[
                ("PTA_BASE_URL", "https://ctf.example.org/"),
                ("PTA_TOKEN", "tok"),
                ("PTA_POLL_INTERVAL_SECS", "10"),
                ("PTA_REFETCH_DELAY_MS", "250"),
                ("PTA_REQUEST_TIMEOUT_SECS", "15"),
                ("PTA_REALTIME", "1"),
            ]),
            &Overrides::default(),
        )
        .unwrap();
        assert_eq!(config.base_url, "https://ctf.example.org");
        assert_eq!(config.token.as_deref(), Some("tok"));
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.refetch_delay, Duration::from_millis(250));
        assert_eq!(config.request_timeout, Some(Duration::from_secs(15)));
        assert!(config.realtime);
    }

    #[test]
    fn test_cli_overrides_env() {
        let overrides = Overrides {
            base_url: Some("http://127.0.0.1:9000".into()),
            token: None,
            poll_interval_secs: Some(5),
            realtime: false,
        };
        let config = Config::from_lookup(
            env(&[
                ("PTA_BASE_URL", "https://ctf.example.org"),
                ("PTA_POLL_INTERVAL_SECS", "60"),
            ]),
            &overrides,
        )
        .unwrap();
        assert_eq!(config.base_url, "http://127.0.0.1:9000");
        assert_eq!(config.poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = Config::from_lookup(env(&[("PTA_BASE_URL", "ctf.local")]), &Overrides::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "PTA_BASE_URL", .. }));

        let err = Config::from_lookup(
            env(&[("PTA_POLL_INTERVAL_SECS", "soon")]),
            &Overrides::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { name: "PTA_POLL_INTERVAL_SECS", .. }
        ));

        let err = Config::from_lookup(
            env(&[("PTA_POLL_INTERVAL_SECS", "0")]),
            &Overrides::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_ws_endpoints_follow_scheme() {
        let config = Config::with_base_url("https://ctf.example.org");
        assert_eq!(
            config.ws_endpoints(),
            vec![
                "wss://ctf.example.org/api/ws/updates".to_string(),
                "wss://ctf.example.org/api/ws/notifications".to_string(),
            ]
        );
        let config = Config::with_base_url("http://localhost:8080");
        assert_eq!(config.ws_endpoints()[0], "ws://localhost:8080/api/ws/updates");
    }
}
