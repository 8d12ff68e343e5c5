use haip_protocol::defaults;
use std::time::Duration;

/// Engine tunables.  Defaults follow the protocol constants; every value can
/// be overridden through `HAIP_*` environment variables in `main`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Cadence of server-initiated `PING`s while a session is Open.
    pub heartbeat_interval: Duration,
    /// How long an unanswered `PING` may stay outstanding before the session
    /// is closed with reason `heartbeat_timeout`.
    pub heartbeat_timeout: Duration,
    /// How long a freshly attached peer has to send its `HAI`.
    pub hello_timeout: Duration,
    pub replay_window_time: Duration,
    pub replay_window_size: usize,
    pub initial_credit_messages: u64,
    pub initial_credit_bytes: u64,
    pub max_concurrent_runs: usize,
    /// Whether this deployment accepts binary continuation frames.
    pub binary_frames: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            heartbeat_interval: defaults::HEARTBEAT_INTERVAL,
            heartbeat_timeout: defaults::HEARTBEAT_TIMEOUT,
            hello_timeout: Duration::from_secs(10),
            replay_window_time: defaults::REPLAY_WINDOW_TIME,
            replay_window_size: defaults::REPLAY_WINDOW_SIZE,
            initial_credit_messages: defaults::INITIAL_CREDIT_MESSAGES,
            initial_credit_bytes: defaults::INITIAL_CREDIT_BYTES,
            max_concurrent_runs: defaults::MAX_CONCURRENT_RUNS,
            binary_frames: true,
        }
    }
}

impl ServerConfig {
    /// Reads overrides from the environment on top of the defaults.
    pub fn from_env() -> Self {
        let mut config = ServerConfig::default();
        if let Some(ms) = env_u64("HAIP_HEARTBEAT_INTERVAL_MS") {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("HAIP_HEARTBEAT_TIMEOUT_MS") {
            config.heartbeat_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("HAIP_HELLO_TIMEOUT_MS") {
            config.hello_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("HAIP_REPLAY_WINDOW_SECS") {
            config.replay_window_time = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("HAIP_REPLAY_WINDOW_SIZE") {
            config.replay_window_size = n as usize;
        }
        if let Some(n) = env_u64("HAIP_INITIAL_CREDIT_MESSAGES") {
            config.initial_credit_messages = n;
        }
        if let Some(n) = env_u64("HAIP_INITIAL_CREDIT_BYTES") {
            config.initial_credit_bytes = n;
        }
        if let Some(n) = env_u64("HAIP_MAX_CONCURRENT_RUNS") {
            config.max_concurrent_runs = n as usize;
        }
        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
