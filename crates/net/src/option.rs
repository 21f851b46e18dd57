use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::{Codec, JsonCodec};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 10086;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SEND_QUEUE_LIMIT: usize = 1024;

/// Everything a connection needs, fixed at construction.
///
/// A zero `timeout` disables the idle timeout, a zero `connect_timeout`
/// leaves the handshake unbounded and a zero `send_queue_limit` leaves the
/// outbound queue unbounded.
#[derive(Clone)]
pub struct ConnOption {
    pub host: String,
    pub port: u16,
    pub codec: Arc<dyn Codec>,
    pub connect_timeout: Duration,
    pub timeout: Duration,
    pub ws_path: String,
    pub send_queue_limit: usize,
    pub rudp: RudpConfig,
}

impl ConnOption {
    pub fn new(host: impl Into<String>, port: u16, codec: Arc<dyn Codec>) -> Self {
        Self {
            host: host.into(),
            port,
            codec,
            ..Default::default()
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ws_url(&self) -> String {
        let path = if self.ws_path.starts_with('/') {
            self.ws_path.clone()
        } else {
            format!("/{}", self.ws_path)
        };
        format!("ws://{}:{}{}", self.host, self.port, path)
    }
}

impl Default for ConnOption {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            codec: Arc::new(JsonCodec::new()),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            timeout: DEFAULT_TIMEOUT,
            ws_path: "/".to_string(),
            send_queue_limit: DEFAULT_SEND_QUEUE_LIMIT,
            rudp: RudpConfig::default(),
        }
    }
}

impl fmt::Debug for ConnOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnOption")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("connect_timeout", &self.connect_timeout)
            .field("timeout", &self.timeout)
            .field("ws_path", &self.ws_path)
            .field("send_queue_limit", &self.send_queue_limit)
            .field("rudp", &self.rudp)
            .finish_non_exhaustive()
    }
}

/// Shortest timer period the reliable-UDP session runs with; zero intervals
/// are raised to it.
pub const MIN_RUDP_INTERVAL: Duration = Duration::from_millis(1);

/// Tuning for the reliable-UDP session.
#[derive(Debug, Clone)]
pub struct RudpConfig {
    pub interval: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,
    pub send_window: usize,
    pub max_retransmits: u32,
    pub handshake_interval: Duration,
}

impl Default for RudpConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(20),
            min_rto: Duration::from_millis(50),
            max_rto: Duration::from_secs(2),
            send_window: 128,
            max_retransmits: 20,
            handshake_interval: Duration::from_millis(200),
        }
    }
}

impl RudpConfig {
    pub(crate) fn tick_interval(&self) -> Duration {
        self.interval.max(MIN_RUDP_INTERVAL)
    }

    pub(crate) fn handshake_retry(&self) -> Duration {
        self.handshake_interval.max(MIN_RUDP_INTERVAL)
    }
}
