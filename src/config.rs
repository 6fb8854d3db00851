use std::env;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use url::Url;

pub const DEFAULT_SUPABASE_URL: &str = "http://127.0.0.1:54321";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// Connection settings for a Supabase project plus client timing knobs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub supabase_url: Url,
    pub anon_key: String,
    pub realtime_url: Url,
    pub poll_interval: Duration,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    pub event_capacity: usize,
}

impl ClientConfig {
    pub fn new(supabase_url: &str, anon_key: impl Into<String>) -> Result<Self, ConfigError> {
        let anon_key = anon_key.into();
        let supabase_url = parse_url(supabase_url)?;
        let realtime_url = build_realtime_url(&supabase_url, &anon_key)?;
        Ok(Self {
            supabase_url,
            anon_key,
            realtime_url,
            poll_interval: DEFAULT_POLL_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        })
    }

    /// Reads `SUPABASE_URL`, `SUPABASE_ANON_KEY`, `SUPABASE_REALTIME_URL` and
    /// `DIRTY_PIG_POLL_MS`. Call [`load_dotenv`] first to pick up `.env` files.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base = env::var("SUPABASE_URL").unwrap_or_else(|_| DEFAULT_SUPABASE_URL.to_string());
        let key = env::var("SUPABASE_ANON_KEY").map_err(|_| ConfigError::Missing("SUPABASE_ANON_KEY"))?;
        let mut config = Self::new(&base, key)?;

        if let Ok(raw) = env::var("SUPABASE_REALTIME_URL") {
            config.realtime_url = parse_url(&raw)?;
        }
        if let Ok(raw) = env::var("DIRTY_PIG_POLL_MS") {
            let millis: u64 = raw.parse().map_err(|_| ConfigError::InvalidValue {
                name: "DIRTY_PIG_POLL_MS",
                value: raw.clone(),
            })?;
            config.poll_interval = Duration::from_millis(millis);
        }
        Ok(config)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_realtime_url(mut self, url: Url) -> Self {
        self.realtime_url = url;
        self
    }

    /// PostgREST endpoint, `<base>/rest/v1`.
    pub fn rest_url(&self) -> String {
        join_path(&self.supabase_url, "rest/v1")
    }

    /// GoTrue endpoint, `<base>/auth/v1`.
    pub fn auth_url(&self) -> String {
        join_path(&self.supabase_url, "auth/v1")
    }
}

/// Loads `.env` from the crate root, then from the working directory.
pub fn load_dotenv() {
    let manifest_env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    dotenv::from_filename(manifest_env_path).ok();
    dotenv::dotenv().ok();
}

/// Derives the realtime websocket URL from the project URL:
/// `http(s)://host` becomes `ws(s)://host/realtime/v1/websocket?apikey=..&vsn=1.0.0`.
pub fn build_realtime_url(base: &Url, api_key: &str) -> Result<Url, ConfigError> {
    let mut url = base.clone();
    let scheme = match base.scheme() {
        "http" => Some("ws"),
        "https" => Some("wss"),
        "ws" | "wss" => None,
        other => {
            return Err(ConfigError::InvalidUrl {
                url: base.to_string(),
                reason: format!("unsupported scheme '{other}'"),
            })
        }
    };
    if let Some(scheme) = scheme {
        url.set_scheme(scheme).map_err(|_| ConfigError::InvalidUrl {
            url: base.to_string(),
            reason: "scheme conversion failed".to_string(),
        })?;
    }

    {
        let mut segments = url.path_segments_mut().map_err(|_| ConfigError::InvalidUrl {
            url: base.to_string(),
            reason: "cannot be a base URL".to_string(),
        })?;
        segments.pop_if_empty();
        segments.extend(&["realtime", "v1", "websocket"]);
    }

    url.set_query(None);
    url.query_pairs_mut()
        .append_pair("apikey", api_key)
        .append_pair("vsn", "1.0.0");
    Ok(url)
}

fn parse_url(raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|err| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })
}

fn join_path(base: &Url, suffix: &str) -> String {
    format!("{}/{}", base.as_str().trim_end_matches('/'), suffix)
}
