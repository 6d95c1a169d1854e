//! Modbus/IP protocol constants
//!
//! Values follow the Modbus Messaging on TCP/IP Implementation Guide:
//! - The MBAP header is 7 bytes and always precedes the PDU
//! - The PDU limit of 253 bytes is inherited from the RS485 ADU limit of 256 bytes
//! - The frame size accepted by this crate is further bounded by a configurable
//!   maximum (200 bytes by default)

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Modbus MBAP header length
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2) + Unit ID(1) = 7 bytes
pub const MBAP_HEADER_LEN: usize = 7;

/// Protocol identifier carried by every Modbus frame
pub const MODBUS_PROTOCOL_ID: u16 = 0x0000;

/// Maximum PDU (Protocol Data Unit) size per Modbus specification
/// RS485 ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Default maximum PDU length accepted by the slave loop
pub const DEFAULT_MAX_FRAME: usize = 200;

/// Scratch buffer size for one inbound datagram or stream read
///
/// Calculation:
/// - MBAP Header: 7 bytes
/// - Max PDU: 253 bytes
/// - Theoretical max frame: 260 bytes
/// - Buffer size: 512 bytes (provides safety margin)
pub const RECEIVE_BUFFER_SIZE: usize = 512;

// ============================================================================
// Ports
// ============================================================================

/// Well-known Modbus/IP server port
pub const MODBUS_PORT: u16 = 502;

/// Fixed local port of the connectionless master.
///
/// Kept apart from [`MODBUS_PORT`] so a master and a slave can share one host.
pub const DEFAULT_MASTER_PORT: u16 = 10502;

// ============================================================================
// Timing and connection limits
// ============================================================================

/// Default time a stream connection may hold a partial frame without progress
pub const DEFAULT_FRAME_TIMEOUT_MS: u64 = 5000;

/// Default connect timeout for the connection-oriented master
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Default number of simultaneous slave connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 8;

// ============================================================================
// Modbus Function Codes used by the default framer
// ============================================================================

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Write Single Coil (FC05)
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;

/// Write Single Register (FC06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Coil ON value for FC05
pub const COIL_ON: u16 = 0xFF00;

/// Coil OFF value for FC05
pub const COIL_OFF: u16 = 0x0000;
