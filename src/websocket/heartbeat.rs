//! Heartbeat configuration and dead-peer detection
//!
//! The session pings on a fixed interval and treats the connection as dead
//! once no traffic of any kind has arrived within
//! `interval * miss_threshold`. Counting all traffic, not just pongs,
//! avoids false positives on a busy connection where heartbeat replies can
//! lag behind data frames.

use std::time::Duration;

use tokio::time::Instant;

/// Heartbeat timing configuration
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between client pings
    pub interval: Duration,
    /// Number of silent intervals after which the connection is declared dead
    pub miss_threshold: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            miss_threshold: 3,
        }
    }
}

impl HeartbeatConfig {
    /// The silence window after which the connection is considered dead
    pub fn liveness_timeout(&self) -> Duration {
        self.interval * self.miss_threshold
    }
}

/// Tracks inbound traffic to detect a silently dead connection
#[derive(Debug)]
pub(crate) struct HeartbeatMonitor {
    config: HeartbeatConfig,
    last_traffic: Instant,
}

impl HeartbeatMonitor {
    pub(crate) fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            last_traffic: Instant::now(),
        }
    }

    /// Reset the liveness clock; called for every inbound frame
    pub(crate) fn record_traffic(&mut self) {
        self.last_traffic = Instant::now();
    }

    /// Whether the silence window has elapsed without any traffic
    pub(crate) fn is_stale(&self) -> bool {
        self.last_traffic.elapsed() >= self.config.liveness_timeout()
    }
}
