//! Configuration module for tagwatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::ads::AmsNetId;

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "tagwatch.db")
    pub db_path: String,
    pub poller: PollerConfig,
}

/// Tuning for the polling and alerting core.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Source AMS net ID; derived from the local IP when unset.
    pub local_net_id: Option<AmsNetId>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Links unused this long are closed.
    pub idle_close: Duration,
    pub registry_refresh: Duration,
    /// Backoff ceiling as a multiple of the tag's interval.
    pub backoff_ceiling_factor: u32,
    /// Consecutive failures before a site is offline.
    pub offline_after: u32,
    /// Consecutive failures before a site is in warning.
    pub warning_after: u32,
    /// Successful reads slower than this put the site in warning.
    pub slow_read: Duration,
    /// Relative epsilon for REAL/LREAL comparison.
    pub real_epsilon: f64,
    /// Pending writes kept per tag before shedding.
    pub write_queue_capacity: usize,
    pub persist_retries: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "tagwatch.db".to_string(),
            poller: PollerConfig::default(),
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            local_net_id: None,
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(2),
            idle_close: Duration::from_secs(300),
            registry_refresh: Duration::from_secs(30),
            backoff_ceiling_factor: 10,
            offline_after: 3,
            warning_after: 2,
            slow_read: Duration::from_secs(1),
            real_epsilon: 1e-6,
            write_queue_capacity: 64,
            persist_retries: 3,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `TAGWATCH_HTTP_PORT`: HTTP port (default: 8080)
    /// - `TAGWATCH_DB_PATH`: Database file path (default: "tagwatch.db")
    /// - `TAGWATCH_LOCAL_AMS_NET_ID`: source AMS net ID (default: derived)
    /// - `TAGWATCH_CONNECT_TIMEOUT_MS`, `TAGWATCH_READ_TIMEOUT_MS`
    /// - `TAGWATCH_IDLE_CLOSE_SECS`, `TAGWATCH_REGISTRY_REFRESH_SECS`
    /// - `TAGWATCH_BACKOFF_CEILING_FACTOR`
    /// - `TAGWATCH_OFFLINE_AFTER`, `TAGWATCH_WARNING_AFTER`, `TAGWATCH_SLOW_READ_MS`
    /// - `TAGWATCH_REAL_EPSILON`
    /// - `TAGWATCH_WRITE_QUEUE_CAPACITY`, `TAGWATCH_PERSIST_RETRIES`
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Some(port) = env_parse("TAGWATCH_HTTP_PORT") {
            cfg.http_port = port;
        }

        if let Ok(db_path) = env::var("TAGWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }

        let p = &mut cfg.poller;
        if let Some(id) = env_parse("TAGWATCH_LOCAL_AMS_NET_ID") {
            p.local_net_id = Some(id);
        }
        if let Some(ms) = env_parse("TAGWATCH_CONNECT_TIMEOUT_MS") {
            p.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("TAGWATCH_READ_TIMEOUT_MS") {
            p.read_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse("TAGWATCH_IDLE_CLOSE_SECS") {
            p.idle_close = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("TAGWATCH_REGISTRY_REFRESH_SECS") {
            p.registry_refresh = Duration::from_secs(secs);
        }
        if let Some(f) = env_parse("TAGWATCH_BACKOFF_CEILING_FACTOR") {
            p.backoff_ceiling_factor = f;
        }
        if let Some(n) = env_parse("TAGWATCH_OFFLINE_AFTER") {
            p.offline_after = n;
        }
        if let Some(n) = env_parse("TAGWATCH_WARNING_AFTER") {
            p.warning_after = n;
        }
        if let Some(ms) = env_parse("TAGWATCH_SLOW_READ_MS") {
            p.slow_read = Duration::from_millis(ms);
        }
        if let Some(eps) = env_parse("TAGWATCH_REAL_EPSILON") {
            p.real_epsilon = eps;
        }
        if let Some(n) = env_parse("TAGWATCH_WRITE_QUEUE_CAPACITY") {
            p.write_queue_capacity = n;
        }
        if let Some(n) = env_parse("TAGWATCH_PERSIST_RETRIES") {
            p.persist_retries = n;
        }

        cfg.poller.sanitize();
        cfg
    }
}

impl PollerConfig {
    /// Clamp values that would break the poller.
    fn sanitize(&mut self) {
        let defaults = PollerConfig::default();
        if self.backoff_ceiling_factor == 0 {
            self.backoff_ceiling_factor = 1;
        }
        if self.offline_after == 0 {
            self.offline_after = defaults.offline_after;
        }
        if self.warning_after == 0 || self.warning_after > self.offline_after {
            self.warning_after = self.offline_after.min(defaults.warning_after);
        }
        if !(self.real_epsilon.is_finite() && self.real_epsilon >= 0.0) {
            self.real_epsilon = defaults.real_epsilon;
        }
        if self.write_queue_capacity == 0 {
            self.write_queue_capacity = 1;
        }
        if self.read_timeout.is_zero() {
            self.read_timeout = defaults.read_timeout;
        }
        if self.connect_timeout.is_zero() {
            self.connect_timeout = defaults.connect_timeout;
        }
        if self.registry_refresh.is_zero() {
            self.registry_refresh = defaults.registry_refresh;
        }
        if self.idle_close.is_zero() {
            self.idle_close = defaults.idle_close;
        }
    }
}

/// Parse an environment variable, logging and ignoring invalid values.
fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring invalid value {:?} for {}", raw, key);
            None
        }
    }
}
