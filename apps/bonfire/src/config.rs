//! Client configuration: broker endpoint, credentials, and connection
//! policies.

use std::time::Duration;

use url::Url;

use crate::session::SessionError;

/// Connect-time shared secret the broker expects alongside the username.
/// A known simplification: this is not a per-user credential.
const DEFAULT_PASSCODE: &str = "secret-key-123";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(4);

#[derive(Clone, Debug)]
pub struct ChatConfig {
    broker_url: Url,
    passcode: String,
    connect_timeout: Duration,
    reconnect_delay: Option<Duration>,
    heartbeat_interval: Option<Duration>,
    fallback_enabled: bool,
}

impl ChatConfig {
    pub fn new(broker_url: impl AsRef<str>) -> Result<Self, SessionError> {
        // Centralized override so callers and env stay consistent.
        let mut base = std::env::var("BONFIRE_BROKER_URL")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| broker_url.as_ref().trim().to_string());
        if base.is_empty() {
            return Err(SessionError::InvalidConfig(
                "broker url cannot be empty".into(),
            ));
        }
        if !base.contains("://") {
            let inferred_scheme = infer_scheme(&base);
            base = format!("{inferred_scheme}{base}");
        }
        let parsed = Url::parse(&base)
            .map_err(|err| SessionError::InvalidConfig(format!("invalid broker url: {err}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(SessionError::InvalidConfig(format!(
                "broker url scheme must be ws or wss, got {}",
                parsed.scheme()
            )));
        }
        let passcode = std::env::var("BONFIRE_PASSCODE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PASSCODE.to_string());
        Ok(Self {
            broker_url: parsed,
            passcode,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_delay: Some(DEFAULT_RECONNECT_DELAY),
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
            fallback_enabled: false,
        })
    }

    pub fn broker_url(&self) -> &Url {
        &self.broker_url
    }

    pub fn passcode(&self) -> &str {
        &self.passcode
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn reconnect_delay(&self) -> Option<Duration> {
        self.reconnect_delay
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    /// Whether a failed connect degrades to the local loop-back backend
    /// instead of surfacing the error.
    pub fn fallback_enabled(&self) -> bool {
        self.fallback_enabled
    }

    pub fn with_passcode(mut self, passcode: impl Into<String>) -> Self {
        self.passcode = passcode.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// `None` disables redialing after a dropped link.
    pub fn with_reconnect_delay(mut self, delay: Option<Duration>) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// `None` disables the websocket ping heartbeat.
    pub fn with_heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        self
    }
}

fn infer_scheme(base: &str) -> &'static str {
    let host_part = base
        .split('/')
        .next()
        .unwrap_or(base)
        .trim_start_matches('[')
        .split(']')
        .next()
        .unwrap_or(base);
    let host_lower = host_part.to_ascii_lowercase();
    if host_lower.starts_with("localhost")
        || host_lower == "0.0.0.0"
        || host_lower.starts_with("127.")
        || host_lower == "::1"
        || host_lower.starts_with("10.")
        || host_lower.starts_with("192.168.")
        || host_lower
            .strip_prefix("172.")
            .and_then(|rest| rest.split('.').next())
            .and_then(|octet| octet.parse::<u8>().ok())
            .map(|octet| (16..32).contains(&octet))
            .unwrap_or(false)
    {
        "ws://"
    } else {
        "wss://"
    }
}
