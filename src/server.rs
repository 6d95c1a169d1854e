//! # Modbus Slave
//!
//! The slave side of the MBAP transport: a polling loop that performs at most
//! one request/response cycle per call to [`ModbusSlave::task`].
//!
//! ## Cycle
//!
//! 1. Poll the transport; nothing buffered means [`CycleOutcome::Idle`].
//! 2. Classify the buffered bytes with [`inspect_frame`]. Foreign, oversized
//!    and malformed frames are dropped without a reply.
//! 3. Strip the header and hand the PDU to the [`PduHandler`].
//! 4. Unless the handler suppressed the reply, re-frame the reply PDU with the
//!    request's transaction and unit id and write it to the request's peer.
//!
//! A stream transport may hold a partial frame between calls; the cycle then
//! reports [`CycleOutcome::Pending`] and resumes when more bytes arrive.
//!
//! ## Example
//!
//! ```rust,no_run
//! use modbus_ip::{ModbusPdu, ModbusSlave, ReplyDisposition, ServerConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> modbus_ip::ModbusResult<()> {
//!     // Echo every request back to the master
//!     let handler = |_pdu: &mut ModbusPdu| ReplyDisposition::Echo;
//!
//!     let mut slave = ModbusSlave::udp(ServerConfig::default(), handler).await?;
//!     slave
//!         .run_until(Duration::from_millis(5), async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//! }
//! ```

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::constants::MBAP_HEADER_LEN;
use crate::core::{PduHandler, ReplyDisposition};
use crate::error::{ModbusError, ModbusResult};
use crate::mbap::{encode_frame, inspect_frame, Discard, FrameStatus, UnitId};
use crate::pdu::ModbusPdu;
use crate::transport::{
    SlaveTransport, TcpSlaveTransport, TransportKind, TransportStats, UdpSlaveTransport,
};

/// Result of one slave cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No bytes were waiting
    Idle,
    /// A stream holds part of a frame; the rest is awaited on later calls
    Pending { buffered: usize },
    /// The request was answered
    Replied {
        transaction_id: u16,
        unit_id: UnitId,
        pdu_len: usize,
    },
    /// The handler processed the request but asked for no reply
    Suppressed { transaction_id: u16, unit_id: UnitId },
    /// The frame was rejected and dropped without a reply
    Dropped(ModbusError),
}

impl CycleOutcome {
    /// Check if the cycle found no complete frame to work on
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle | Self::Pending { .. })
    }
}

/// Slave loop statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Frames handed to the handler
    pub requests: u64,
    pub replies: u64,
    pub suppressed: u64,
    pub dropped_foreign_protocol: u64,
    pub dropped_oversized: u64,
    pub dropped_invalid_length: u64,
    pub dropped_short: u64,
    /// Transport failures while polling or replying
    pub io_errors: u64,
}

impl ServerStats {
    /// Total frames dropped for any reason
    pub fn dropped(&self) -> u64 {
        self.dropped_foreign_protocol
            + self.dropped_oversized
            + self.dropped_invalid_length
            + self.dropped_short
    }
}

/// Modbus slave bound to one transport and one application core
pub struct ModbusSlave<T: SlaveTransport, H: PduHandler> {
    transport: T,
    handler: H,
    max_frame: usize,
    stats: ServerStats,
}

impl<T: SlaveTransport, H: PduHandler> ModbusSlave<T, H> {
    /// Create a slave over an existing transport
    pub fn new(transport: T, handler: H, max_frame: usize) -> ModbusResult<Self> {
        ServerConfig::new().with_max_frame(max_frame).validate()?;
        Ok(Self {
            transport,
            handler,
            max_frame,
            stats: ServerStats::default(),
        })
    }

    /// Run one request/response cycle without waiting for data
    pub async fn task(&mut self) -> ModbusResult<CycleOutcome> {
        match self.transport.poll_incoming().await {
            Ok(true) => {}
            Ok(false) => return Ok(CycleOutcome::Idle),
            Err(e) => {
                self.stats.io_errors += 1;
                return Err(e);
            }
        }

        let result = self.serve_current().await;
        match &result {
            Ok(CycleOutcome::Pending { .. }) => {}
            Ok(_) => self.transport.finish_cycle(),
            Err(e) => {
                warn!("Modbus cycle aborted: {}", e);
                self.stats.io_errors += 1;
                self.transport.discard_pending();
                self.transport.finish_cycle();
            }
        }
        result
    }

    async fn serve_current(&mut self) -> ModbusResult<CycleOutcome> {
        let kind = self.transport.kind();

        let (header, pdu_len) = match inspect_frame(self.transport.peek(), self.max_frame) {
            FrameStatus::Complete { header, pdu_len } => (header, pdu_len),
            FrameStatus::Incomplete { needed } => {
                let buffered = self.transport.available();
                if kind.is_stream() {
                    return Ok(CycleOutcome::Pending { buffered });
                }
                self.transport.discard_pending();
                return Ok(self.drop_frame(ModbusError::short_read(buffered + needed, buffered)));
            }
            FrameStatus::Invalid { error, discard } => {
                match (kind, discard) {
                    (TransportKind::Stream, Discard::Bytes(n)) => self.transport.discard(n),
                    _ => self.transport.discard_pending(),
                }
                return Ok(self.drop_frame(error));
            }
        };

        self.transport.read_exact(MBAP_HEADER_LEN)?;
        let request = self.transport.read_exact(pdu_len)?;
        let mut pdu = ModbusPdu::from_slice(&request)?;
        self.stats.requests += 1;

        debug!(
            "Request tid={} unit={} fc={:02X?} len={} from {:?}",
            header.transaction_id,
            header.unit_id,
            pdu.function_code(),
            pdu_len,
            self.transport.sender_endpoint()
        );

        let disposition = self.handler.process_pdu(&mut pdu);
        let reply: &[u8] = match disposition {
            ReplyDisposition::Off => {
                self.stats.suppressed += 1;
                debug!("Reply suppressed for tid={}", header.transaction_id);
                return Ok(CycleOutcome::Suppressed {
                    transaction_id: header.transaction_id,
                    unit_id: header.unit_id,
                });
            }
            ReplyDisposition::Echo => &request,
            ReplyDisposition::Normal => pdu.as_slice(),
        };

        let frame = encode_frame(header.transaction_id, header.unit_id, reply);
        self.transport.write(&frame).await?;
        self.stats.replies += 1;

        Ok(CycleOutcome::Replied {
            transaction_id: header.transaction_id,
            unit_id: header.unit_id,
            pdu_len: reply.len(),
        })
    }

    fn drop_frame(&mut self, error: ModbusError) -> CycleOutcome {
        match &error {
            ModbusError::ForeignProtocol { .. } => self.stats.dropped_foreign_protocol += 1,
            ModbusError::FrameTooLarge { .. } => self.stats.dropped_oversized += 1,
            ModbusError::InvalidLength { .. } => self.stats.dropped_invalid_length += 1,
            _ => self.stats.dropped_short += 1,
        }
        warn!(
            "Dropping frame from {:?}: {}",
            self.transport.sender_endpoint(),
            error
        );
        CycleOutcome::Dropped(error)
    }

    /// Call [`task`](Self::task) until `shutdown` resolves, sleeping
    /// `poll_interval` whenever no complete frame was waiting.
    ///
    /// Transport errors are logged and the loop keeps polling.
    pub async fn run_until<S>(&mut self, poll_interval: Duration, shutdown: S) -> ModbusResult<()>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(
            "Modbus {} slave running on {:?}",
            self.transport.kind().label(),
            self.transport.local_addr().ok()
        );

        loop {
            // Shutdown is checked between cycles only, so a reply is never
            // cut off half written
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = std::future::ready(()) => {}
            }

            let idle = match self.task().await {
                Ok(outcome) => outcome.is_idle(),
                Err(e) if e.is_recoverable() => {
                    warn!("Modbus slave cycle failed: {}", e);
                    true
                }
                Err(e) => return Err(e),
            };

            if idle {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }

        info!("Modbus slave stopped");
        Ok(())
    }

    /// Get the underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Get the underlying transport mutably
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Get the application core
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Get the application core mutably
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Slave loop statistics
    pub fn get_stats(&self) -> ServerStats {
        self.stats.clone()
    }

    /// Transport statistics
    pub fn transport_stats(&self) -> TransportStats {
        self.transport.get_stats()
    }

    /// Split into transport and handler
    pub fn into_parts(self) -> (T, H) {
        (self.transport, self.handler)
    }
}

impl<H: PduHandler> ModbusSlave<UdpSlaveTransport, H> {
    /// Bind a datagram slave
    pub async fn udp(config: ServerConfig, handler: H) -> ModbusResult<Self> {
        config.validate()?;
        let transport = UdpSlaveTransport::bind(&config).await?;
        Self::new(transport, handler, config.max_frame)
    }
}

impl<H: PduHandler> ModbusSlave<TcpSlaveTransport, H> {
    /// Bind a stream slave
    pub async fn tcp(config: ServerConfig, handler: H) -> ModbusResult<Self> {
        config.validate()?;
        let transport = TcpSlaveTransport::bind(&config).await?;
        Self::new(transport, handler, config.max_frame)
    }
}
