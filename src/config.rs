use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
    /// Seconds without a heartbeat before a connection counts as stale.
    pub heartbeat_timeout_secs: u64,
    /// Seconds between sweeper ticks.
    pub sweep_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("SYNC_HUB_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            heartbeat_timeout_secs: env::var("HEARTBEAT_TIMEOUT")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(300),
            sweep_interval_secs: env::var("SWEEP_INTERVAL")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(300),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            redis_url: "redis://localhost:6379".to_string(),
            heartbeat_timeout_secs: 300,
            sweep_interval_secs: 300,
        }
    }
}
