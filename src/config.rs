use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://localhost:8000/api/";
/// Display fallback only; the server's `attempts_left` wins.
pub const ATTEMPT_CAP: u32 = 2;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub storage_dir: PathBuf,
    pub http_timeout: Duration,
    pub refresh: RefreshPolicy,
    /// Countdown ticks between server timer syncs.
    pub timer_sync_every: u32,
    /// How often a file-backed storage dir is checked for other processes' writes.
    pub storage_poll: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    pub poll_interval: Duration,
    pub focus_rate_limit: Duration,
    pub hard_timeout: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            focus_rate_limit: Duration::from_secs(10),
            hard_timeout: Duration::from_secs(15),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.into(),
            storage_dir: PathBuf::from("./.videoquiz"),
            http_timeout: Duration::from_secs(10),
            refresh: RefreshPolicy::default(),
            timer_sync_every: 10,
            storage_poll: Duration::from_secs(1),
        }
    }
}

impl ClientConfig {
    /// Reads `VIDEOQUIZ_*` variables; call `dotenvy::dotenv()` first to pick up `.env`.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| env::var(k).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(url) = get("VIDEOQUIZ_API_URL").filter(|u| !u.trim().is_empty()) {
            cfg.api_url = url;
        }
        cfg.api_url = normalize_base(&cfg.api_url);
        if let Some(dir) = get("VIDEOQUIZ_STORAGE_DIR").filter(|d| !d.is_empty()) {
            cfg.storage_dir = PathBuf::from(dir);
        }
        if let Some(raw) = get("VIDEOQUIZ_HTTP_TIMEOUT_SECS") {
            match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => cfg.http_timeout = Duration::from_secs(secs),
                _ => tracing::warn!(value = %raw, "ignoring invalid VIDEOQUIZ_HTTP_TIMEOUT_SECS"),
            }
        }
        cfg
    }

    /// Scheme and host of the API, used to resolve media paths.
    pub fn origin(&self) -> String {
        match reqwest::Url::parse(&self.api_url) {
            Ok(url) => url.origin().ascii_serialization(),
            Err(_) => self.api_url.trim_end_matches('/').to_string(),
        }
    }
}

fn normalize_base(url: &str) -> String {
    let trimmed = url.trim();
    if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}
