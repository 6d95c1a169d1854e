//! # Modbus/IP Error Handling
//!
//! Errors raised by the MBAP codec, the transports and the slave/master loops.
//!
//! ## Error Categories
//!
//! ### Framing Errors
//! - **Foreign Protocol**: the MBAP protocol identifier is not zero
//! - **Frame Too Large**: the declared PDU length exceeds the configured maximum
//! - **Invalid Length**: the declared length leaves no room for a PDU
//! - **Short Read**: fewer bytes are available than the header announced
//!
//! Framing errors are never answered on the wire. The slave loop reports them
//! through [`CycleOutcome::Dropped`](crate::server::CycleOutcome::Dropped) and
//! its statistics instead.
//!
//! ### Transport Errors
//! - **I/O Errors**: socket failures
//! - **Connection Errors**: connect/accept problems, lost peers
//! - **Timeout Errors**: connect timeouts
//!
//! ### Usage Errors
//! - **Configuration Errors**: invalid [`ServerConfig`](crate::config::ServerConfig)
//!   or [`MasterConfig`](crate::config::MasterConfig) values
//! - **Invalid Data / Function**: PDU construction failures
//!
//! ## Error Classification
//!
//! ```rust
//! use modbus_ip::ModbusError;
//!
//! fn classify(error: &ModbusError) -> &'static str {
//!     if error.is_framing_error() {
//!         "dropped frame"
//!     } else if error.is_transport_error() {
//!         "network issue"
//!     } else {
//!         "other"
//!     }
//! }
//!
//! assert_eq!(classify(&ModbusError::foreign_protocol(1)), "dropped frame");
//! ```

use thiserror::Error;

/// Result type alias for Modbus/IP operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Modbus/IP error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModbusError {
    /// I/O related errors (socket read/write)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection establishment and maintenance problems
    ///
    /// # Examples
    /// - Connection refused by remote host
    /// - Peer closed the connection in the middle of a cycle
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Operation exceeded its configured timeout
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// General protocol violations that don't fit a more specific variant
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// MBAP protocol identifier is not the Modbus identifier (0)
    ///
    /// The datagram or stream content belongs to some other protocol and is
    /// discarded without a reply.
    #[error("Foreign protocol id: 0x{protocol_id:04X}")]
    ForeignProtocol { protocol_id: u16 },

    /// Declared PDU length exceeds the configured maximum frame size
    #[error("Frame too large: {length} bytes (max {max})")]
    FrameTooLarge { length: usize, max: usize },

    /// Declared MBAP length leaves no PDU after the unit id
    #[error("Invalid MBAP length field: {declared}")]
    InvalidLength { declared: u16 },

    /// Fewer bytes available than the frame requires
    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    /// Invalid data value
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Invalid function code
    #[error("Invalid function code: {code}")]
    InvalidFunction { code: u8 },

    /// Client or server configuration issues
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a foreign protocol error
    pub fn foreign_protocol(protocol_id: u16) -> Self {
        Self::ForeignProtocol { protocol_id }
    }

    /// Create a frame too large error
    pub fn frame_too_large(length: usize, max: usize) -> Self {
        Self::FrameTooLarge { length, max }
    }

    /// Create an invalid length error
    pub fn invalid_length(declared: u16) -> Self {
        Self::InvalidLength { declared }
    }

    /// Create a short read error
    pub fn short_read(expected: usize, actual: usize) -> Self {
        Self::ShortRead { expected, actual }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Check if the error is a framing-layer failure.
    ///
    /// Framing failures are local and silent: the offending frame is dropped
    /// and nothing is sent to the peer.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use modbus_ip::ModbusError;
    ///
    /// assert!(ModbusError::frame_too_large(202, 200).is_framing_error());
    /// assert!(!ModbusError::io("broken pipe").is_framing_error());
    /// ```
    pub fn is_framing_error(&self) -> bool {
        matches!(
            self,
            Self::ForeignProtocol { .. }
                | Self::FrameTooLarge { .. }
                | Self::InvalidLength { .. }
                | Self::ShortRead { .. }
        )
    }

    /// Check if the error is a network/transport issue
    ///
    /// # Examples
    ///
    /// ```rust
    /// use modbus_ip::ModbusError;
    ///
    /// let connection_error = ModbusError::connection("Connection refused");
    /// assert!(connection_error.is_transport_error());
    ///
    /// let foreign = ModbusError::foreign_protocol(0x0001);
    /// assert!(!foreign.is_transport_error());
    /// ```
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. }
        )
    }

    /// Check if the error is recoverable (the next cycle or send may succeed)
    pub fn is_recoverable(&self) -> bool {
        self.is_transport_error() || self.is_framing_error()
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe => Self::connection(err.to_string()),
            _ => Self::io(err.to_string()),
        }
    }
}

/// Convert from tokio timeout errors
///
/// The elapsed error carries no duration; callers that know it should build
/// [`ModbusError::timeout`] themselves.
impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = ModbusError::foreign_protocol(0x0001);
        assert!(err.is_framing_error());
        assert!(!err.is_transport_error());
        assert!(err.is_recoverable());

        let err = ModbusError::timeout("connect", 5000);
        assert!(err.is_transport_error());
        assert!(!err.is_framing_error());

        let err = ModbusError::configuration("max_frame out of range");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let msg = ModbusError::frame_too_large(201, 200).to_string();
        assert!(msg.contains("201"));
        assert!(msg.contains("200"));

        let msg = ModbusError::foreign_protocol(0x1234).to_string();
        assert!(msg.contains("0x1234"));
    }

    #[test]
    fn test_io_error_mapping() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            ModbusError::from(refused),
            ModbusError::Connection { .. }
        ));

        let other = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert!(matches!(ModbusError::from(other), ModbusError::Io { .. }));
    }
}
