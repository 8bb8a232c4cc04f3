use shared::{DEFAULT_PORT, MAX_FRAME_LEN, READ_CHUNK_SIZE};
use std::time::Duration;

/// Delay between a `disconnect_warning` and the forced teardown.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_SPAWN_POINTS: usize = 100;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub grace_period: Duration,
    pub monitor_interval: Duration,
    /// Receive loop gives up on a silent client after this long. `None` waits forever.
    pub idle_timeout: Option<Duration>,
    pub read_chunk_size: usize,
    pub max_frame_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{}", DEFAULT_PORT),
            grace_period: DEFAULT_GRACE_PERIOD,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            idle_timeout: None,
            read_chunk_size: READ_CHUNK_SIZE,
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

impl ServerConfig {
    /// Warning sent on every forced disconnect, whatever triggered it.
    pub fn disconnect_warning(&self) -> String {
        format!("Disconnecting in {} seconds.", self.grace_period.as_secs_f32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:52399");
        assert_eq!(config.grace_period, Duration::from_secs(5));
        assert!(config.idle_timeout.is_none());
    }

    #[test]
    fn test_warning_states_grace_period() {
        let config = ServerConfig {
            grace_period: Duration::from_millis(2500),
            ..ServerConfig::default()
        };
        assert_eq!(config.disconnect_warning(), "Disconnecting in 2.5 seconds.");
    }
}
