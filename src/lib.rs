//! # Modbus IP - MBAP Transport for Modbus over TCP and UDP
//!
//! **Author:** Evan Liu <liuyifanz.1996@gmail.com>
//! **License:** MIT
//!
//! The transport layer that carries Modbus PDUs over IP networks, for both the
//! slave (server) and the master (client) role.
//!
//! ## Features
//!
//! - **MBAP framing**: header encode/decode, length validation, header-first
//!   frame inspection
//! - **Two transports**: persistent TCP connections and connectionless UDP
//!   datagrams behind one slave loop and one master API
//! - **Cooperative polling**: [`ModbusSlave::task`] never waits for data and
//!   serves at most one request per call
//! - **Pluggable core**: function codes are interpreted by your
//!   [`PduHandler`]; the master's request PDUs come from a [`PduFramer`]
//! - **Built-in Monitoring**: transport and slave loop statistics, optional
//!   hex packet logging through `tracing`
//!
//! ## Wire Format
//!
//! | Transaction ID | Protocol ID | Length | Unit ID | PDU |
//! |----------------|-------------|--------|---------|-----|
//! | 2 bytes | 2 bytes (0) | 2 bytes | 1 byte | Length - 1 bytes |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use modbus_ip::{ModbusPdu, ModbusSlave, ReplyDisposition, ServerConfig, ModbusResult};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let mut registers = [0u16; 16];
//!
//!     // Minimal core: FC06 writes a register and echoes the request
//!     let handler = move |pdu: &mut ModbusPdu| {
//!         let data = pdu.as_slice();
//!         if data.len() == 5 && data[0] == 0x06 {
//!             let offset = u16::from_be_bytes([data[1], data[2]]) as usize;
//!             if let Some(slot) = registers.get_mut(offset) {
//!                 *slot = u16::from_be_bytes([data[3], data[4]]);
//!             }
//!             return ReplyDisposition::Echo;
//!         }
//!         ReplyDisposition::Off
//!     };
//!
//!     let mut slave = ModbusSlave::tcp(ServerConfig::default(), handler).await?;
//!     loop {
//!         if slave.task().await?.is_idle() {
//!             tokio::time::sleep(std::time::Duration::from_millis(5)).await;
//!         }
//!     }
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Modbus/IP protocol constants
pub mod constants;

/// MBAP header codec and frame inspection
pub mod mbap;

/// PDU with stack-allocated fixed array
pub mod pdu;

/// Interfaces to the Modbus application core
pub mod core;

/// Slave and master settings
pub mod config;

/// Network transport layer for TCP and UDP
pub mod transport;

/// Slave polling loop
pub mod server;

/// Master client
pub mod client;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime (users can use modbus_ip::tokio) ===
pub use tokio;

// === Slave and master ===
pub use client::{MasterReply, ModbusMaster};
pub use server::{CycleOutcome, ModbusSlave, ServerStats};

// === Error handling ===
pub use error::{ModbusError, ModbusResult};

// === Core types ===
pub use self::core::{PduFramer, PduHandler, ReplyDisposition, StandardFramer};
pub use mbap::{MbapHeader, UnitId};
pub use pdu::{ModbusPdu, PduBuilder};

// === Configuration ===
pub use config::{MasterConfig, ServerConfig};

// === Transports and monitoring ===
pub use transport::{
    Inbound, MasterTransport, SlaveTransport, TcpMasterTransport, TcpSlaveTransport, TransportKind,
    TransportStats, UdpMasterTransport, UdpSlaveTransport,
};

// === Protocol limits (commonly needed constants) ===
pub use constants::{DEFAULT_MASTER_PORT, DEFAULT_MAX_FRAME, MAX_PDU_SIZE, MBAP_HEADER_LEN, MODBUS_PORT};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!(
        "Modbus IP v{} - MBAP transport for Modbus over TCP and UDP by Evan Liu",
        VERSION
    )
}
