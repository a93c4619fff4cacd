//! Server configuration.

use std::time::Duration;

use lipsync_settings::ServerSettings;

/// Runtime configuration of the WebSocket server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port; `0` picks a free one.
    pub port: u16,
    /// Concurrent sessions before upgrades are refused with 503.
    pub max_connections: usize,
    /// Largest accepted inbound message.
    pub max_message_bytes: usize,
    /// Ping cadence.
    pub heartbeat_interval: Duration,
    /// Close a session after this long without inbound traffic.
    pub heartbeat_timeout: Duration,
    /// Requests a session may queue behind the running one.
    pub max_queued_requests: usize,
    /// Time allowed for in-flight cleanup on close and shutdown.
    pub shutdown_grace: Duration,
    /// Outbound frame buffer per session.
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&ServerSettings::default())
    }
}

impl ServerConfig {
    /// Convert the `server` settings section.
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            max_connections: settings.max_connections,
            max_message_bytes: settings.max_message_bytes,
            heartbeat_interval: Duration::from_secs(settings.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(settings.heartbeat_timeout_secs),
            max_queued_requests: settings.max_queued_requests,
            shutdown_grace: Duration::from_secs(settings.shutdown_grace_secs),
            outbound_queue: 256,
        }
    }

    /// `host:port`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
