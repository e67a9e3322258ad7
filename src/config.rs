/// Configuration for the connection pool.
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of client worker threads.
    pub workers: usize,
    /// Maximum number of concurrent client connections. Connections accepted
    /// beyond this limit are closed immediately.
    pub max_clients: usize,
    /// Client inactivity timeout in milliseconds. 0 disables the reaper.
    pub idle_timeout_ms: u64,
    /// TCP listen backlog.
    pub backlog: i32,
    /// Size of each slot's inbound receive buffer in bytes. A single
    /// `on_data` callback never delivers more than this many bytes.
    pub recv_buffer_size: usize,
    /// Maximum number of readiness events drained per poll.
    pub max_events: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 1,
            max_clients: 100_000,
            idle_timeout_ms: 0,
            backlog: 1000,
            recv_buffer_size: 4096,
            max_events: 65_536,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.workers, 1);
        assert_eq!(config.max_clients, 100_000);
        assert_eq!(config.idle_timeout_ms, 0);
        assert_eq!(config.recv_buffer_size, 4096);
    }
}
