//! # Modbus/IP Transport Layer
//!
//! Byte-level plumbing underneath the slave loop and the master client. The
//! transports never parse MBAP themselves; they only buffer, hand out and
//! write bytes.
//!
//! ## Slave Side
//!
//! [`SlaveTransport`] is polled, never awaited for data. Each call to
//! [`poll_incoming`](SlaveTransport::poll_incoming) takes whatever the OS has
//! already received and selects the "current unit" the next cycle works on:
//!
//! - **Datagram** ([`UdpSlaveTransport`]): one datagram is one unit. Trailing
//!   bytes after the frame are dropped when the cycle finishes, and the reply
//!   goes back to the datagram's sender.
//! - **Stream** ([`TcpSlaveTransport`]): every connection owns a receive
//!   buffer that persists across cycles, so a frame split over several TCP
//!   segments is assembled over several polls. Connections with buffered bytes
//!   are served round-robin.
//!
//! ## Master Side
//!
//! [`MasterTransport`] sends frames to a peer endpoint and offers a
//! non-blocking receive. [`UdpMasterTransport`] binds its fixed local port once;
//! [`TcpMasterTransport`] connects on demand.
//!
//! ## Packet Logging
//!
//! Every transport can log raw frames in hex at info level:
//!
//! ```text
//! [MODBUS-UDP] RX 00 01 00 00 00 06 01 03 00 00 00 01
//! [MODBUS-UDP] TX 00 01 00 00 00 05 01 03 02 00 2A
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::task::Poll;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::{MasterConfig, ServerConfig};
use crate::constants::{DEFAULT_FRAME_TIMEOUT_MS, RECEIVE_BUFFER_SIZE};
use crate::error::{ModbusError, ModbusResult};
use crate::mbap::{inspect_frame, FrameStatus};

/// Format raw bytes as hex string for packet logging
fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Log packet with direction and protocol tag
fn log_packet(direction: &str, data: &[u8], kind: TransportKind) {
    info!("[MODBUS-{}] {} {}", kind.label(), direction, format_hex_packet(data));
}

/// Transient datagram errors: ICMP port unreachable reported back on a later
/// receive, or no data ready yet.
fn is_transient_datagram_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
    )
}

// ============================================================================
// Shared types
// ============================================================================

/// Network transport variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Connection-oriented byte stream (TCP)
    Stream,
    /// Connectionless datagrams (UDP)
    Datagram,
}

impl TransportKind {
    /// Short protocol tag used in log lines
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stream => "TCP",
            Self::Datagram => "UDP",
        }
    }

    /// Check if the transport keeps bytes across polling cycles
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream)
    }
}

/// Bytes handed to the master by [`MasterTransport::try_receive`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub data: Bytes,
    /// Endpoint the bytes came from
    pub peer: SocketAddr,
    /// Connection the bytes arrived on. A stream transport bumps it on every
    /// new connection, so bytes from different connections never join into
    /// one frame. Always 0 for datagrams.
    pub session: u64,
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Frames written to the wire
    pub frames_sent: u64,
    /// Datagrams or stream reads that delivered bytes
    pub packets_received: u64,
    /// Socket errors
    pub errors: u64,
    /// Connect attempts, writes or partial frames that timed out
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Stream connections established (accepted or connected)
    pub connections: u64,
    /// Stream connections closed or refused
    pub disconnects: u64,
}

// ============================================================================
// Slave transport
// ============================================================================

/// Byte source and sink driven by the slave loop.
///
/// The slave uses the transport in this order within one cycle:
/// `poll_incoming` → `peek` → `read_exact`/`discard` → `write` →
/// `finish_cycle`. Only the current unit selected by the last
/// `poll_incoming` is visible.
pub trait SlaveTransport: Send {
    /// Transport variant
    fn kind(&self) -> TransportKind;

    /// Pull whatever has already arrived without waiting for more, then select
    /// the current unit. Returns `true` when the current unit holds bytes.
    fn poll_incoming(&mut self) -> impl Future<Output = ModbusResult<bool>> + Send;

    /// Bytes buffered in the current unit
    fn available(&self) -> usize {
        self.peek().len()
    }

    /// Buffered bytes of the current unit, without consuming them
    fn peek(&self) -> &[u8];

    /// Consume exactly `n` bytes from the current unit.
    ///
    /// Fails with [`ModbusError::ShortRead`] if fewer are buffered; nothing is
    /// consumed in that case.
    fn read_exact(&mut self, n: usize) -> ModbusResult<Bytes>;

    /// Drop `n` bytes of the current unit. A stream transport also drains
    /// bytes that have not arrived yet.
    fn discard(&mut self, n: usize);

    /// Drop everything buffered for the current unit
    fn discard_pending(&mut self);

    /// Peer of the current unit, the reply destination
    fn sender_endpoint(&self) -> Option<SocketAddr>;

    /// Write a complete frame to the current peer
    fn write(&mut self, frame: &[u8]) -> impl Future<Output = ModbusResult<()>> + Send;

    /// End the current cycle: a datagram's trailing bytes are dropped, a stream
    /// connection without keep-alive is closed.
    fn finish_cycle(&mut self);

    /// Address the transport is bound to
    fn local_addr(&self) -> ModbusResult<SocketAddr>;

    /// Enable or disable hex packet logging
    fn set_packet_logging(&mut self, enabled: bool);

    /// Get transport statistics
    fn get_stats(&self) -> TransportStats;
}

// ----------------------------------------------------------------------------
// UDP slave
// ----------------------------------------------------------------------------

/// Datagram slave transport bound to the server port
pub struct UdpSlaveTransport {
    socket: UdpSocket,
    rx: BytesMut,
    sender: Option<SocketAddr>,
    scratch: Box<[u8]>,
    stats: TransportStats,
    packet_logging: bool,
}

impl UdpSlaveTransport {
    /// Bind to `config.bind_address`
    pub async fn bind(config: &ServerConfig) -> ModbusResult<Self> {
        let socket = UdpSocket::bind(config.bind_address).await.map_err(|e| {
            ModbusError::connection(format!("Failed to bind UDP {}: {}", config.bind_address, e))
        })?;
        info!("Modbus UDP slave listening on {}", socket.local_addr()?);

        Ok(Self::from_socket(socket, config.packet_logging))
    }

    /// Wrap an already bound socket
    pub fn from_socket(socket: UdpSocket, packet_logging: bool) -> Self {
        Self {
            socket,
            rx: BytesMut::with_capacity(RECEIVE_BUFFER_SIZE),
            sender: None,
            scratch: vec![0u8; RECEIVE_BUFFER_SIZE].into_boxed_slice(),
            stats: TransportStats::default(),
            packet_logging,
        }
    }
}

impl SlaveTransport for UdpSlaveTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    async fn poll_incoming(&mut self) -> ModbusResult<bool> {
        if !self.rx.is_empty() {
            return Ok(true);
        }

        loop {
            match self.socket.try_recv_from(&mut self.scratch) {
                Ok((0, peer)) => {
                    debug!("Ignoring empty datagram from {}", peer);
                }
                Ok((n, peer)) => {
                    self.rx.extend_from_slice(&self.scratch[..n]);
                    self.sender = Some(peer);
                    self.stats.packets_received += 1;
                    self.stats.bytes_received += n as u64;

                    if self.packet_logging {
                        log_packet("RX", &self.rx, TransportKind::Datagram);
                    }
                    return Ok(true);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if is_transient_datagram_error(&e) => {
                    debug!("Transient UDP receive error: {}", e);
                }
                Err(e) => {
                    self.stats.errors += 1;
                    return Err(e.into());
                }
            }
        }
    }

    fn peek(&self) -> &[u8] {
        &self.rx
    }

    fn read_exact(&mut self, n: usize) -> ModbusResult<Bytes> {
        if self.rx.len() < n {
            return Err(ModbusError::short_read(n, self.rx.len()));
        }
        Ok(self.rx.split_to(n).freeze())
    }

    fn discard(&mut self, n: usize) {
        let n = n.min(self.rx.len());
        self.rx.advance(n);
    }

    fn discard_pending(&mut self) {
        self.rx.clear();
    }

    fn sender_endpoint(&self) -> Option<SocketAddr> {
        self.sender
    }

    async fn write(&mut self, frame: &[u8]) -> ModbusResult<()> {
        let peer = self
            .sender
            .ok_or_else(|| ModbusError::protocol("No datagram sender to reply to"))?;

        if self.packet_logging {
            log_packet("TX", frame, TransportKind::Datagram);
        }

        match self.socket.send_to(frame, peer).await {
            Ok(_) => {
                self.stats.frames_sent += 1;
                self.stats.bytes_sent += frame.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.stats.errors += 1;
                Err(e.into())
            }
        }
    }

    fn finish_cycle(&mut self) {
        self.rx.clear();
        self.sender = None;
    }

    fn local_addr(&self) -> ModbusResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

// ----------------------------------------------------------------------------
// TCP slave
// ----------------------------------------------------------------------------

/// One accepted client connection with its own receive buffer
struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    rx: BytesMut,
    /// Bytes still to be drained from the wire (tail of a dropped frame)
    skip: usize,
    last_progress: Instant,
    /// Peer shut down its write side; buffered frames are still served
    eof: bool,
    closed: bool,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            rx: BytesMut::with_capacity(RECEIVE_BUFFER_SIZE),
            skip: 0,
            last_progress: Instant::now(),
            eof: false,
            closed: false,
        }
    }

    /// Waiting on the wire: part of a frame is buffered, or the tail of a
    /// dropped frame is still to be drained.
    fn awaiting_bytes(&self, max_frame: usize) -> bool {
        self.skip > 0
            || (!self.rx.is_empty()
                && matches!(inspect_frame(&self.rx, max_frame), FrameStatus::Incomplete { .. }))
    }

    /// Buffered bytes the slave can act on without reading more
    fn has_servable(&self, max_frame: usize) -> bool {
        !self.rx.is_empty()
            && !matches!(inspect_frame(&self.rx, max_frame), FrameStatus::Incomplete { .. })
    }

    /// Read what the socket already holds. Returns the byte count read;
    /// sets `eof` when the peer shuts down and `closed` on a socket error.
    fn fill(&mut self, scratch: &mut [u8]) -> ModbusResult<usize> {
        let mut total = 0;
        if self.eof {
            return Ok(0);
        }

        // Stop at one receive buffer; TCP flow control holds the rest back
        while self.rx.len() < RECEIVE_BUFFER_SIZE {
            let room = RECEIVE_BUFFER_SIZE - self.rx.len();
            match self.stream.try_read(&mut scratch[..room]) {
                Ok(0) => {
                    debug!("Peer {} shut down its side of the connection", self.peer);
                    self.eof = true;
                    break;
                }
                Ok(n) => {
                    let skipped = n.min(self.skip);
                    self.skip -= skipped;
                    self.rx.extend_from_slice(&scratch[skipped..n]);
                    self.last_progress = Instant::now();
                    total += n;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.closed = true;
                    return Err(e.into());
                }
            }
        }

        Ok(total)
    }
}

/// Stream slave transport: a listener plus up to `max_connections` clients
pub struct TcpSlaveTransport {
    listener: TcpListener,
    connections: Vec<Connection>,
    current: Option<usize>,
    cursor: usize,
    max_connections: usize,
    max_frame: usize,
    frame_timeout: Option<Duration>,
    keep_alive: bool,
    scratch: Box<[u8]>,
    stats: TransportStats,
    packet_logging: bool,
}

impl TcpSlaveTransport {
    /// Bind the listener to `config.bind_address`
    pub async fn bind(config: &ServerConfig) -> ModbusResult<Self> {
        let listener = TcpListener::bind(config.bind_address).await.map_err(|e| {
            ModbusError::connection(format!("Failed to bind TCP {}: {}", config.bind_address, e))
        })?;
        info!("Modbus TCP slave listening on {}", listener.local_addr()?);

        Ok(Self::from_listener(listener, config))
    }

    /// Wrap an already bound listener
    pub fn from_listener(listener: TcpListener, config: &ServerConfig) -> Self {
        Self {
            listener,
            connections: Vec::with_capacity(config.max_connections),
            current: None,
            cursor: 0,
            max_connections: config.max_connections,
            max_frame: config.max_frame,
            frame_timeout: config.frame_timeout,
            keep_alive: config.keep_alive,
            scratch: vec![0u8; RECEIVE_BUFFER_SIZE].into_boxed_slice(),
            stats: TransportStats::default(),
            packet_logging: config.packet_logging,
        }
    }

    /// Number of open client connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Take every connection waiting in the accept queue
    async fn accept_pending(&mut self) {
        loop {
            let accepted = std::future::poll_fn(|cx| match self.listener.poll_accept(cx) {
                Poll::Ready(result) => Poll::Ready(Some(result)),
                Poll::Pending => Poll::Ready(None),
            })
            .await;

            match accepted {
                Some(Ok((stream, peer))) => {
                    if self.connections.len() >= self.max_connections {
                        warn!(
                            "Refusing connection from {}: limit of {} reached",
                            peer, self.max_connections
                        );
                        self.stats.disconnects += 1;
                        drop(stream);
                        continue;
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                    }
                    info!("Accepted Modbus TCP connection from {}", peer);
                    self.stats.connections += 1;
                    self.connections.push(Connection::new(stream, peer));
                }
                Some(Err(e)) => {
                    warn!("Accept failed: {}", e);
                    self.stats.errors += 1;
                    break;
                }
                None => break,
            }
        }
    }

    fn sweep_closed(&mut self) {
        let before = self.connections.len();
        self.connections.retain(|conn| {
            if conn.closed {
                debug!("Dropping connection to {}", conn.peer);
            }
            !conn.closed
        });
        self.stats.disconnects += (before - self.connections.len()) as u64;
    }

    /// Drop the current connection right away so the peer sees the close
    fn close_current(&mut self) {
        let Some(idx) = self.current.take() else {
            return;
        };
        if idx < self.connections.len() {
            let conn = self.connections.remove(idx);
            debug!("Closing connection to {}", conn.peer);
            self.stats.disconnects += 1;
            if self.cursor > idx {
                self.cursor -= 1;
            }
        }
    }

    fn current_connection(&self) -> Option<&Connection> {
        self.current.and_then(|idx| self.connections.get(idx))
    }

    fn current_connection_mut(&mut self) -> Option<&mut Connection> {
        self.current.and_then(|idx| self.connections.get_mut(idx))
    }
}

impl SlaveTransport for TcpSlaveTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn poll_incoming(&mut self) -> ModbusResult<bool> {
        self.current = None;
        self.sweep_closed();
        self.accept_pending().await;

        let now = Instant::now();
        for conn in self.connections.iter_mut() {
            match conn.fill(&mut self.scratch) {
                Ok(0) => {}
                Ok(n) => {
                    self.stats.packets_received += 1;
                    self.stats.bytes_received += n as u64;
                }
                Err(e) => {
                    warn!("Read from {} failed: {}", conn.peer, e);
                    self.stats.errors += 1;
                }
            }

            if conn.eof && !conn.closed && !conn.has_servable(self.max_frame) {
                debug!("Connection from {} drained after shutdown", conn.peer);
                conn.closed = true;
            }

            if let Some(limit) = self.frame_timeout {
                if !conn.closed
                    && conn.awaiting_bytes(self.max_frame)
                    && now.duration_since(conn.last_progress) > limit
                {
                    warn!(
                        "Closing {}: partial frame stalled for more than {:?}",
                        conn.peer, limit
                    );
                    self.stats.timeouts += 1;
                    conn.closed = true;
                }
            }
        }
        self.sweep_closed();

        let count = self.connections.len();
        if count == 0 {
            self.cursor = 0;
            return Ok(false);
        }

        for step in 0..count {
            let idx = (self.cursor + step) % count;
            if !self.connections[idx].rx.is_empty() {
                self.current = Some(idx);
                self.cursor = (idx + 1) % count;

                if self.packet_logging {
                    log_packet("RX", &self.connections[idx].rx, TransportKind::Stream);
                }
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn peek(&self) -> &[u8] {
        self.current_connection().map(|conn| &conn.rx[..]).unwrap_or(&[])
    }

    fn read_exact(&mut self, n: usize) -> ModbusResult<Bytes> {
        let conn = self
            .current_connection_mut()
            .ok_or_else(|| ModbusError::short_read(n, 0))?;
        if conn.rx.len() < n {
            return Err(ModbusError::short_read(n, conn.rx.len()));
        }
        conn.last_progress = Instant::now();
        Ok(conn.rx.split_to(n).freeze())
    }

    fn discard(&mut self, n: usize) {
        if let Some(conn) = self.current_connection_mut() {
            let buffered = conn.rx.len();
            if n <= buffered {
                conn.rx.advance(n);
            } else {
                conn.rx.clear();
                conn.skip += n - buffered;
            }
            conn.last_progress = Instant::now();
        }
    }

    fn discard_pending(&mut self) {
        if let Some(conn) = self.current_connection_mut() {
            conn.rx.clear();
        }
    }

    fn sender_endpoint(&self) -> Option<SocketAddr> {
        self.current_connection().map(|conn| conn.peer)
    }

    async fn write(&mut self, frame: &[u8]) -> ModbusResult<()> {
        let limit = self
            .frame_timeout
            .unwrap_or(Duration::from_millis(DEFAULT_FRAME_TIMEOUT_MS));
        let packet_logging = self.packet_logging;

        let idx = self
            .current
            .ok_or_else(|| ModbusError::connection("No current connection to reply to"))?;
        let conn = self
            .connections
            .get_mut(idx)
            .ok_or_else(|| ModbusError::connection("Connection no longer open"))?;

        if packet_logging {
            log_packet("TX", frame, TransportKind::Stream);
        }

        let result = match timeout(limit, conn.stream.write_all(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                conn.closed = true;
                Err(ModbusError::from(e))
            }
            Err(_) => {
                conn.closed = true;
                Err(ModbusError::timeout(
                    format!("write reply to {}", conn.peer),
                    limit.as_millis() as u64,
                ))
            }
        };

        match &result {
            Ok(()) => {
                self.stats.frames_sent += 1;
                self.stats.bytes_sent += frame.len() as u64;
            }
            Err(ModbusError::Timeout { .. }) => {
                self.stats.timeouts += 1;
                self.stats.errors += 1;
            }
            Err(_) => self.stats.errors += 1,
        }
        result
    }

    fn finish_cycle(&mut self) {
        if self.keep_alive {
            self.current = None;
        } else {
            self.close_current();
        }
    }

    fn local_addr(&self) -> ModbusResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

// ============================================================================
// Master transport
// ============================================================================

/// Outbound side used by the master client
pub trait MasterTransport: Send {
    /// Transport variant
    fn kind(&self) -> TransportKind;

    /// Send one complete frame to `peer`
    fn send_to(
        &mut self,
        peer: SocketAddr,
        frame: &[u8],
    ) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Take bytes that have already arrived, without waiting
    fn try_receive(&mut self) -> ModbusResult<Option<Inbound>>;

    /// Check if a socket is open. A stream closed by the peer is only noticed
    /// on the next send or receive.
    fn is_connected(&self) -> bool;

    /// Release the socket
    fn close(&mut self) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Address the transport is bound to, if any
    fn local_addr(&self) -> ModbusResult<SocketAddr>;

    /// Enable or disable hex packet logging
    fn set_packet_logging(&mut self, enabled: bool);

    /// Get transport statistics
    fn get_stats(&self) -> TransportStats;
}

// ----------------------------------------------------------------------------
// UDP master
// ----------------------------------------------------------------------------

/// Datagram master bound once to a fixed local port
pub struct UdpMasterTransport {
    socket: Option<UdpSocket>,
    scratch: Box<[u8]>,
    stats: TransportStats,
    packet_logging: bool,
}

impl UdpMasterTransport {
    /// Bind to `config.local_address`
    pub async fn bind(config: &MasterConfig) -> ModbusResult<Self> {
        let socket = UdpSocket::bind(config.local_address).await.map_err(|e| {
            ModbusError::connection(format!(
                "Failed to bind UDP master {}: {}",
                config.local_address, e
            ))
        })?;
        info!("Modbus UDP master bound to {}", socket.local_addr()?);

        Ok(Self {
            socket: Some(socket),
            scratch: vec![0u8; RECEIVE_BUFFER_SIZE].into_boxed_slice(),
            stats: TransportStats::default(),
            packet_logging: config.packet_logging,
        })
    }

    fn socket(&self) -> ModbusResult<&UdpSocket> {
        self.socket
            .as_ref()
            .ok_or_else(|| ModbusError::connection("UDP master socket is closed"))
    }
}

impl MasterTransport for UdpMasterTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    async fn send_to(&mut self, peer: SocketAddr, frame: &[u8]) -> ModbusResult<()> {
        if self.packet_logging {
            log_packet("TX", frame, TransportKind::Datagram);
        }

        let result = match self.socket() {
            Ok(socket) => socket.send_to(frame, peer).await.map_err(ModbusError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(_) => {
                self.stats.frames_sent += 1;
                self.stats.bytes_sent += frame.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.stats.errors += 1;
                Err(e)
            }
        }
    }

    fn try_receive(&mut self) -> ModbusResult<Option<Inbound>> {
        let Some(socket) = self.socket.as_ref() else {
            return Err(ModbusError::connection("UDP master socket is closed"));
        };

        loop {
            match socket.try_recv_from(&mut self.scratch) {
                Ok((0, _)) => continue,
                Ok((n, peer)) => {
                    let data = Bytes::copy_from_slice(&self.scratch[..n]);
                    self.stats.packets_received += 1;
                    self.stats.bytes_received += n as u64;
                    if self.packet_logging {
                        log_packet("RX", &data, TransportKind::Datagram);
                    }
                    return Ok(Some(Inbound {
                        data,
                        peer,
                        session: 0,
                    }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if is_transient_datagram_error(&e) => {
                    debug!("Transient UDP receive error: {}", e);
                }
                Err(e) => {
                    self.stats.errors += 1;
                    return Err(e.into());
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.socket = None;
        Ok(())
    }

    fn local_addr(&self) -> ModbusResult<SocketAddr> {
        Ok(self.socket()?.local_addr()?)
    }

    fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

// ----------------------------------------------------------------------------
// TCP master
// ----------------------------------------------------------------------------

/// Stream master that connects to the destination on demand
pub struct TcpMasterTransport {
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    /// Incremented on every established connection
    session: u64,
    /// Bytes read while checking a connection before reuse
    backlog: VecDeque<Inbound>,
    connect_timeout: Duration,
    scratch: Box<[u8]>,
    stats: TransportStats,
    packet_logging: bool,
}

impl TcpMasterTransport {
    /// Create an unconnected transport
    pub fn new(config: &MasterConfig) -> Self {
        Self {
            stream: None,
            peer: None,
            session: 0,
            backlog: VecDeque::new(),
            connect_timeout: config.connect_timeout,
            scratch: vec![0u8; RECEIVE_BUFFER_SIZE].into_boxed_slice(),
            stats: TransportStats::default(),
            packet_logging: config.packet_logging,
        }
    }

    /// Peer of the open connection
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer.filter(|_| self.stream.is_some())
    }

    /// Open a connection to `peer` unless one is already open, with a single
    /// attempt bounded by the connect timeout. A connection to another peer is
    /// dropped first.
    pub async fn connect(&mut self, peer: SocketAddr) -> ModbusResult<()> {
        if self.stream.is_some() && self.peer == Some(peer) {
            // Give the reactor a turn to report a close that already arrived
            tokio::task::yield_now().await;
            if self.check_alive() {
                return Ok(());
            }
            info!("Modbus TCP slave {} closed the connection, reconnecting", peer);
            self.drop_stream();
        }
        if let Some(old) = self.peer.filter(|_| self.stream.is_some()) {
            info!("Switching Modbus TCP connection from {} to {}", old, peer);
            self.drop_stream();
        }

        let stream = match timeout(self.connect_timeout, TcpStream::connect(peer)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.stats.errors += 1;
                return Err(ModbusError::connection(format!(
                    "Failed to connect to {}: {}",
                    peer, e
                )));
            }
            Err(_) => {
                self.stats.timeouts += 1;
                self.stats.errors += 1;
                return Err(ModbusError::timeout(
                    format!("connect to {}", peer),
                    self.connect_timeout.as_millis() as u64,
                ));
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        info!("Connected to Modbus TCP slave {}", peer);
        self.stats.connections += 1;
        self.session += 1;
        self.stream = Some(stream);
        self.peer = Some(peer);
        Ok(())
    }

    /// Check the open stream without waiting. Bytes that already arrived are
    /// kept for [`try_receive`](MasterTransport::try_receive); EOF or a socket
    /// error means the connection is gone.
    fn check_alive(&mut self) -> bool {
        let (Some(stream), Some(peer)) = (self.stream.as_ref(), self.peer) else {
            return false;
        };

        loop {
            match stream.try_read(&mut self.scratch) {
                Ok(0) => return false,
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&self.scratch[..n]);
                    self.stats.packets_received += 1;
                    self.stats.bytes_received += n as u64;
                    if self.packet_logging {
                        log_packet("RX", &data, TransportKind::Stream);
                    }
                    self.backlog.push_back(Inbound {
                        data,
                        peer,
                        session: self.session,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Connection to {} failed: {}", peer, e);
                    self.stats.errors += 1;
                    return false;
                }
            }
        }
    }

    fn drop_stream(&mut self) {
        if self.stream.take().is_some() {
            self.stats.disconnects += 1;
        }
    }
}

impl MasterTransport for TcpMasterTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn send_to(&mut self, peer: SocketAddr, frame: &[u8]) -> ModbusResult<()> {
        self.connect(peer).await?;

        if self.packet_logging {
            log_packet("TX", frame, TransportKind::Stream);
        }

        let Some(stream) = self.stream.as_mut() else {
            return Err(ModbusError::connection("Not connected"));
        };

        match stream.write_all(frame).await {
            Ok(()) => {
                self.stats.frames_sent += 1;
                self.stats.bytes_sent += frame.len() as u64;
                Ok(())
            }
            Err(e) => {
                warn!("Write to {} failed, dropping connection: {}", peer, e);
                self.stats.errors += 1;
                self.drop_stream();
                Err(e.into())
            }
        }
    }

    fn try_receive(&mut self) -> ModbusResult<Option<Inbound>> {
        if let Some(inbound) = self.backlog.pop_front() {
            return Ok(Some(inbound));
        }

        let (Some(stream), Some(peer)) = (self.stream.as_ref(), self.peer) else {
            return Ok(None);
        };

        match stream.try_read(&mut self.scratch) {
            Ok(0) => {
                info!("Modbus TCP slave {} closed the connection", peer);
                self.drop_stream();
                Ok(None)
            }
            Ok(n) => {
                let data = Bytes::copy_from_slice(&self.scratch[..n]);
                self.stats.packets_received += 1;
                self.stats.bytes_received += n as u64;
                if self.packet_logging {
                    log_packet("RX", &data, TransportKind::Stream);
                }
                Ok(Some(Inbound {
                    data,
                    peer,
                    session: self.session,
                }))
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                Ok(None)
            }
            Err(e) => {
                self.stats.errors += 1;
                self.drop_stream();
                Err(e.into())
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.backlog.clear();
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            self.stats.disconnects += 1;
        }
        Ok(())
    }

    fn local_addr(&self) -> ModbusResult<SocketAddr> {
        match self.stream.as_ref() {
            Some(stream) => Ok(stream.local_addr()?),
            None => Err(ModbusError::connection("Not connected")),
        }
    }

    fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn loopback_config() -> ServerConfig {
        ServerConfig::new().with_bind_address("127.0.0.1:0".parse().unwrap())
    }

    async fn wait_for_bytes<T: SlaveTransport>(transport: &mut T, at_least: usize) -> bool {
        for _ in 0..200 {
            if transport.poll_incoming().await.unwrap() && transport.available() >= at_least {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn test_format_hex_packet() {
        assert_eq!(format_hex_packet(&[0x00, 0x01, 0xAB]), "00 01 AB");
        assert_eq!(format_hex_packet(&[]), "");
    }

    #[test]
    fn test_transport_kind() {
        assert_eq!(TransportKind::Datagram.label(), "UDP");
        assert_eq!(TransportKind::Stream.label(), "TCP");
        assert!(TransportKind::Stream.is_stream());
        assert!(!TransportKind::Datagram.is_stream());
    }

    #[tokio::test]
    async fn test_udp_slave_idle_without_data() {
        let mut transport = UdpSlaveTransport::bind(&loopback_config()).await.unwrap();
        assert!(!transport.poll_incoming().await.unwrap());
        assert!(transport.peek().is_empty());
        assert!(transport.sender_endpoint().is_none());
    }

    #[tokio::test]
    async fn test_udp_slave_receive_and_reply() {
        let mut transport = UdpSlaveTransport::bind(&loopback_config()).await.unwrap();
        let server_addr = transport.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let request = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        client.send_to(&request, server_addr).await.unwrap();

        assert!(wait_for_bytes(&mut transport, request.len()).await);
        assert_eq!(transport.peek(), &request);
        assert_eq!(transport.sender_endpoint(), Some(client.local_addr().unwrap()));

        let header = transport.read_exact(7).unwrap();
        assert_eq!(header.len(), 7);
        assert!(transport.read_exact(6).is_err());
        assert_eq!(transport.available(), 5);

        let reply = [0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x2A];
        transport.write(&reply).await.unwrap();
        transport.finish_cycle();
        assert!(transport.peek().is_empty());

        let mut buf = [0u8; 64];
        let (n, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], &reply);

        let stats = transport.get_stats();
        assert_eq!(stats.packets_received, 1);
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.bytes_sent, reply.len() as u64);
    }

    #[tokio::test]
    async fn test_udp_slave_write_without_sender_fails() {
        let mut transport = UdpSlaveTransport::bind(&loopback_config()).await.unwrap();
        assert!(transport.write(&[0x00]).await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_slave_assembles_split_frame() {
        let mut transport = TcpSlaveTransport::bind(&loopback_config()).await.unwrap();
        let server_addr = transport.local_addr().unwrap();

        let mut client = TcpStream::connect(server_addr).await.unwrap();
        client.write_all(&[0x00, 0x01, 0x00, 0x00]).await.unwrap();
        assert!(wait_for_bytes(&mut transport, 4).await);
        assert_eq!(transport.connection_count(), 1);

        client
            .write_all(&[0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01])
            .await
            .unwrap();
        assert!(wait_for_bytes(&mut transport, 12).await);
        assert_eq!(transport.peek().len(), 12);

        transport.read_exact(12).unwrap();
        transport.write(&[0xAA, 0xBB]).await.unwrap();
        transport.finish_cycle();

        let mut buf = [0u8; 2];
        timeout(Duration::from_secs(2), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, [0xAA, 0xBB]);
        assert_eq!(transport.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_tcp_slave_discard_drains_future_bytes() {
        let mut transport = TcpSlaveTransport::bind(&loopback_config()).await.unwrap();
        let server_addr = transport.local_addr().unwrap();

        let mut client = TcpStream::connect(server_addr).await.unwrap();
        client.write_all(&[0x01, 0x02, 0x03]).await.unwrap();
        assert!(wait_for_bytes(&mut transport, 3).await);

        // Drop 3 buffered + 4 bytes still on the way
        transport.discard(7);
        assert!(transport.peek().is_empty());

        client
            .write_all(&[0x04, 0x05, 0x06, 0x07, 0xF0, 0xF1])
            .await
            .unwrap();
        assert!(wait_for_bytes(&mut transport, 2).await);
        assert_eq!(transport.peek(), &[0xF0, 0xF1]);
    }

    #[tokio::test]
    async fn test_tcp_slave_closes_without_keep_alive() {
        let config = loopback_config().with_keep_alive(false);
        let mut transport = TcpSlaveTransport::bind(&config).await.unwrap();
        let server_addr = transport.local_addr().unwrap();

        let mut client = TcpStream::connect(server_addr).await.unwrap();
        client.write_all(&[0x01]).await.unwrap();
        assert!(wait_for_bytes(&mut transport, 1).await);

        transport.discard_pending();
        transport.finish_cycle();
        transport.poll_incoming().await.unwrap();
        assert_eq!(transport.connection_count(), 0);

        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_tcp_slave_stalled_partial_frame_times_out() {
        let config = loopback_config().with_frame_timeout(Some(Duration::from_millis(50)));
        let mut transport = TcpSlaveTransport::bind(&config).await.unwrap();
        let server_addr = transport.local_addr().unwrap();

        let mut client = TcpStream::connect(server_addr).await.unwrap();
        client.write_all(&[0x00, 0x01, 0x00]).await.unwrap();
        assert!(wait_for_bytes(&mut transport, 3).await);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!transport.poll_incoming().await.unwrap());
        assert_eq!(transport.connection_count(), 0);
        assert_eq!(transport.get_stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_tcp_slave_complete_frame_survives_slow_polling() {
        let config = loopback_config().with_frame_timeout(Some(Duration::from_millis(50)));
        let mut transport = TcpSlaveTransport::bind(&config).await.unwrap();
        let server_addr = transport.local_addr().unwrap();

        let mut client = TcpStream::connect(server_addr).await.unwrap();
        let request = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        client.write_all(&request).await.unwrap();
        assert!(wait_for_bytes(&mut transport, request.len()).await);

        // The host comes back long after the frame timeout
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(transport.poll_incoming().await.unwrap());
        assert_eq!(transport.peek(), &request);
        assert_eq!(transport.connection_count(), 1);
        assert_eq!(transport.get_stats().timeouts, 0);
    }

    #[tokio::test]
    async fn test_tcp_slave_serves_frame_after_peer_shutdown() {
        let mut transport = TcpSlaveTransport::bind(&loopback_config()).await.unwrap();
        let server_addr = transport.local_addr().unwrap();

        let mut client = TcpStream::connect(server_addr).await.unwrap();
        let request = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x01, 0x00, 0x02];
        client.write_all(&request).await.unwrap();
        client.shutdown().await.unwrap();

        assert!(wait_for_bytes(&mut transport, request.len()).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(transport.poll_incoming().await.unwrap());
        assert_eq!(transport.connection_count(), 1);

        transport.read_exact(request.len()).unwrap();
        transport.write(&request).await.unwrap();
        transport.finish_cycle();

        let mut buf = [0u8; 12];
        timeout(Duration::from_secs(2), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, request);

        // Nothing left to serve: the connection goes away
        assert!(!transport.poll_incoming().await.unwrap());
        assert_eq!(transport.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_tcp_slave_connection_limit() {
        let config = loopback_config().with_max_connections(1);
        let mut transport = TcpSlaveTransport::bind(&config).await.unwrap();
        let server_addr = transport.local_addr().unwrap();

        let mut first = TcpStream::connect(server_addr).await.unwrap();
        first.write_all(&[0x01]).await.unwrap();
        assert!(wait_for_bytes(&mut transport, 1).await);

        let _second = TcpStream::connect(server_addr).await.unwrap();
        for _ in 0..20 {
            transport.poll_incoming().await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(transport.connection_count(), 1);
        assert!(transport.get_stats().disconnects >= 1);
    }

    #[tokio::test]
    async fn test_udp_master_send_and_receive() {
        let config = MasterConfig::new().with_local_address("127.0.0.1:0".parse().unwrap());
        let mut master = UdpMasterTransport::bind(&config).await.unwrap();
        let master_addr = master.local_addr().unwrap();
        assert!(master.is_connected());

        let slave = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        master.send_to(slave.local_addr().unwrap(), &[0x01, 0x02]).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = timeout(Duration::from_secs(2), slave.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], &[0x01, 0x02]);
        assert_eq!(from, master_addr);

        slave.send_to(&[0x03], master_addr).await.unwrap();
        let mut received = None;
        for _ in 0..200 {
            if let Some(data) = master.try_receive().unwrap() {
                received = Some(data);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let inbound = received.unwrap();
        assert_eq!(inbound.data.as_ref(), &[0x03]);
        assert_eq!(inbound.peer, slave.local_addr().unwrap());
        assert_eq!(inbound.session, 0);
        let peer = inbound.peer;

        master.close().await.unwrap();
        assert!(!master.is_connected());
        assert!(master.send_to(peer, &[0x00]).await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_master_connects_on_demand() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut master = TcpMasterTransport::new(&MasterConfig::default());
        assert!(!master.is_connected());
        assert!(master.try_receive().unwrap().is_none());

        master.send_to(addr, &[0x0A, 0x0B]).await.unwrap();
        assert!(master.is_connected());
        assert_eq!(master.peer(), Some(addr));

        let (mut accepted, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 2];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x0A, 0x0B]);

        master.close().await.unwrap();
        assert!(!master.is_connected());
        assert_eq!(master.get_stats().connections, 1);
    }

    #[tokio::test]
    async fn test_tcp_master_reconnects_after_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut master = TcpMasterTransport::new(&MasterConfig::default());

        master.send_to(addr, &[0x01]).await.unwrap();
        let (mut first, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1];
        first.read_exact(&mut buf).await.unwrap();
        first.write_all(&[0xA1, 0xA2]).await.unwrap();
        drop(first);
        tokio::time::sleep(Duration::from_millis(20)).await;

        master.send_to(addr, &[0x02]).await.unwrap();
        let (mut second, _) = timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        second.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x02]);
        assert_eq!(master.get_stats().connections, 2);

        // The reply sent before the close is still delivered, tagged with the
        // old connection
        let inbound = master.try_receive().unwrap().unwrap();
        assert_eq!(inbound.data.as_ref(), &[0xA1, 0xA2]);
        assert_eq!(inbound.peer, addr);
        assert_eq!(inbound.session, 1);

        second.write_all(&[0xB1]).await.unwrap();
        let mut received = None;
        for _ in 0..200 {
            if let Some(inbound) = master.try_receive().unwrap() {
                received = Some(inbound);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let inbound = received.unwrap();
        assert_eq!(inbound.data.as_ref(), &[0xB1]);
        assert_eq!(inbound.session, 2);
    }

    #[tokio::test]
    async fn test_tcp_master_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut master = TcpMasterTransport::new(&MasterConfig::default());
        let err = master.send_to(addr, &[0x00]).await.unwrap_err();
        assert!(err.is_transport_error());
        assert!(!master.is_connected());
    }
}
