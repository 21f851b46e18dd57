use std::time::Duration;

use polynet::RudpConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_peers: usize,
    pub peer_timeout: Duration,
    pub read_buffer: usize,
    pub rudp: RudpConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_peers: 256,
            peer_timeout: Duration::from_secs(60),
            read_buffer: 8 * 1024,
            rudp: RudpConfig::default(),
        }
    }
}
