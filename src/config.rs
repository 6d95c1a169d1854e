//! # Transport Configuration
//!
//! Builder-style settings for the slave server and the master client.
//!
//! ## Defaults
//!
//! | Setting | Slave | Master |
//! |---------|-------|--------|
//! | Listening / local address | `0.0.0.0:502` | `0.0.0.0:10502` |
//! | Remote port | n/a | 502 |
//! | Maximum PDU length | 200 | 200 |
//! | Connections | 8 (stream only) | 1 |
//! | Partial frame timeout | 5 s (stream only) | n/a |
//!
//! The master's local port is kept apart from 502 so a slave and a master can
//! run on the same host. Port 0 asks the OS for an ephemeral port.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_FRAME_TIMEOUT_MS, DEFAULT_MASTER_PORT, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MAX_FRAME, MAX_PDU_SIZE, MODBUS_PORT,
};
use crate::error::{ModbusError, ModbusResult};
use crate::mbap::UnitId;

fn check_max_frame(max_frame: usize) -> ModbusResult<()> {
    if max_frame == 0 || max_frame > MAX_PDU_SIZE {
        return Err(ModbusError::configuration(format!(
            "max_frame must be within 1..={}, got {}",
            MAX_PDU_SIZE, max_frame
        )));
    }
    Ok(())
}

/// Slave server settings.
///
/// # Example
///
/// ```rust
/// use modbus_ip::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig::new()
///     .with_bind_address("127.0.0.1:1502".parse().unwrap())
///     .with_max_frame(128)
///     .with_frame_timeout(Some(Duration::from_secs(2)));
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.max_frame, 128);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address the listener or datagram socket binds to
    pub bind_address: SocketAddr,
    /// Largest PDU accepted; longer frames are dropped
    pub max_frame: usize,
    /// Simultaneous stream connections; further connects are refused
    pub max_connections: usize,
    /// How long a stream connection may hold a partial frame without progress.
    /// `None` keeps it forever.
    pub frame_timeout: Option<Duration>,
    /// Keep stream connections open after a reply
    pub keep_alive: bool,
    /// Log every frame in hex at info level
    pub packet_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MODBUS_PORT)),
            max_frame: DEFAULT_MAX_FRAME,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            frame_timeout: Some(Duration::from_millis(DEFAULT_FRAME_TIMEOUT_MS)),
            keep_alive: true,
            packet_logging: false,
        }
    }
}

impl ServerConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address
    pub fn with_bind_address(mut self, address: SocketAddr) -> Self {
        self.bind_address = address;
        self
    }

    /// Set the listening port, keeping the bind IP
    pub fn with_port(mut self, port: u16) -> Self {
        self.bind_address.set_port(port);
        self
    }

    /// Set the maximum accepted PDU length
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// Set the connection limit
    pub fn with_max_connections(mut self, count: usize) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the partial frame timeout
    pub fn with_frame_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.frame_timeout = timeout;
        self
    }

    /// Enable or disable keep-alive
    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Enable or disable hex packet logging
    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }

    /// Check the settings for consistency
    pub fn validate(&self) -> ModbusResult<()> {
        check_max_frame(self.max_frame)?;
        if self.max_connections == 0 {
            return Err(ModbusError::configuration("max_connections must be at least 1"));
        }
        if self.frame_timeout == Some(Duration::ZERO) {
            return Err(ModbusError::configuration(
                "frame_timeout must be positive, use None to disable it",
            ));
        }
        Ok(())
    }
}

/// Master client settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterConfig {
    /// Local address; the datagram master binds it once at construction
    pub local_address: SocketAddr,
    /// Port requests are sent to
    pub remote_port: u16,
    /// Unit id placed in outgoing headers
    pub unit_id: UnitId,
    /// Bound on a single connect attempt (stream only)
    pub connect_timeout: Duration,
    /// Largest reply PDU accepted by `poll_reply`
    pub max_frame: usize,
    /// Log every frame in hex at info level
    pub packet_logging: bool,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            local_address: SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::UNSPECIFIED,
                DEFAULT_MASTER_PORT,
            )),
            remote_port: MODBUS_PORT,
            unit_id: 1,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            max_frame: DEFAULT_MAX_FRAME,
            packet_logging: false,
        }
    }
}

impl MasterConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the local address
    pub fn with_local_address(mut self, address: SocketAddr) -> Self {
        self.local_address = address;
        self
    }

    /// Set the local port, keeping the local IP
    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_address.set_port(port);
        self
    }

    /// Set the destination port
    pub fn with_remote_port(mut self, port: u16) -> Self {
        self.remote_port = port;
        self
    }

    /// Set the unit id
    pub fn with_unit_id(mut self, unit_id: UnitId) -> Self {
        self.unit_id = unit_id;
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the maximum accepted reply PDU length
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// Enable or disable hex packet logging
    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }

    /// Check the settings for consistency
    pub fn validate(&self) -> ModbusResult<()> {
        check_max_frame(self.max_frame)?;
        let local_port = self.local_address.port();
        if local_port != 0 && local_port == self.remote_port {
            return Err(ModbusError::configuration(format!(
                "local port {} collides with remote port",
                local_port
            )));
        }
        if self.remote_port == 0 {
            return Err(ModbusError::configuration("remote_port must not be 0"));
        }
        if self.connect_timeout.is_zero() {
            return Err(ModbusError::configuration("connect_timeout must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address.port(), 502);
        assert_eq!(config.max_frame, 200);
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.frame_timeout, Some(Duration::from_secs(5)));
        assert!(config.keep_alive);
        assert!(!config.packet_logging);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_builder() {
        let config = ServerConfig::new()
            .with_port(1502)
            .with_max_connections(2)
            .with_keep_alive(false)
            .with_frame_timeout(None)
            .with_packet_logging(true);

        assert_eq!(config.bind_address.port(), 1502);
        assert_eq!(config.max_connections, 2);
        assert!(!config.keep_alive);
        assert!(config.frame_timeout.is_none());
        assert!(config.packet_logging);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_validate_rejects() {
        assert_err!(ServerConfig::new().with_max_frame(0).validate());
        assert_err!(ServerConfig::new().with_max_frame(254).validate());
        assert_ok!(ServerConfig::new().with_max_frame(253).validate());
        assert_err!(ServerConfig::new().with_max_connections(0).validate());

        let err = ServerConfig::new()
            .with_frame_timeout(Some(Duration::ZERO))
            .validate()
            .unwrap_err();
        assert!(matches!(err, ModbusError::Configuration { .. }));
    }

    #[test]
    fn test_master_defaults() {
        let config = MasterConfig::default();
        assert_eq!(config.local_address.port(), 10502);
        assert_eq!(config.remote_port, 502);
        assert_eq!(config.unit_id, 1);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_master_port_collision() {
        assert_err!(MasterConfig::new().with_local_port(502).validate());
        assert_err!(MasterConfig::new().with_local_port(0).with_remote_port(0).validate());
        assert_ok!(MasterConfig::new().with_local_port(0).validate());
    }
}
