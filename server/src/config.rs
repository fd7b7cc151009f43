use shared::HEARTBEAT_INTERVAL_SECS;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("heartbeat interval must be greater than zero")]
    ZeroHeartbeatInterval,
    #[error("miss threshold must be at least 1")]
    ZeroMissThreshold,
    #[error("max sessions must be at least 1")]
    ZeroMaxSessions,
    #[error("max objects must be at least 1")]
    ZeroMaxObjects,
    #[error("outbound queue capacity must be at least 1")]
    ZeroOutboundCapacity,
}

/// Runtime settings for the relay server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the UDP socket binds to
    pub bind_addr: String,
    /// Maximum concurrent sessions
    pub max_sessions: usize,
    /// Time between heartbeat probes
    pub heartbeat_interval: Duration,
    /// Consecutive unanswered probes before a session is dead
    pub miss_threshold: u32,
    /// Datagrams buffered per session before sends to it start failing
    pub outbound_capacity: usize,
    /// Distinct scene objects the relay tracks before refusing new ones
    pub max_objects: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            max_sessions: 32,
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            miss_threshold: 3,
            outbound_capacity: 256,
            max_objects: 1024,
        }
    }
}

impl ServerConfig {
    pub fn with_bind_addr(mut self, bind_addr: impl Into<String>) -> Self {
        self.bind_addr = bind_addr.into();
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, miss_threshold: u32) -> Self {
        self.heartbeat_interval = interval;
        self.miss_threshold = miss_threshold;
        self
    }

    /// Time a silent session survives before it is declared dead
    pub fn session_timeout(&self) -> Duration {
        self.heartbeat_interval * self.miss_threshold
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroHeartbeatInterval);
        }
        if self.miss_threshold == 0 {
            return Err(ConfigError::ZeroMissThreshold);
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::ZeroMaxSessions);
        }
        if self.max_objects == 0 {
            return Err(ConfigError::ZeroMaxObjects);
        }
        if self.outbound_capacity == 0 {
            return Err(ConfigError::ZeroOutboundCapacity);
        }
        Ok(())
    }
}
