//! Modbus master over MBAP
//!
//! The master frames a request PDU with an MBAP header and sends it to a
//! slave. It does not wait for or correlate replies; an application that
//! cares about them polls [`ModbusMaster::poll_reply`] and matches the
//! transaction id itself.
//!
//! # Architecture
//!
//! The PDU comes from a [`PduFramer`] (FC06/FC05 by default), so the master
//! only deals with transport concerns:
//! - **UDP**: datagrams from a fixed local port (10502 by default) to port 502
//! - **TCP**: a connection opened on demand and reused while the peer stays
//!   the same
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use modbus_ip::{MasterConfig, ModbusMaster, ModbusResult};
//! use std::net::{IpAddr, Ipv4Addr};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let mut master = ModbusMaster::udp(MasterConfig::default()).await?;
//!
//!     // Write 42 to holding register 10 of the slave at 192.168.1.20:502
//!     let slave = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));
//!     let tid = master.send_holding_register(slave, 10, 42).await?;
//!     println!("Sent transaction {}", tid);
//!
//!     master.send_coil(slave, 3, true).await?;
//!     Ok(())
//! }
//! ```

use std::net::{IpAddr, SocketAddr};

use bytes::{Buf, BytesMut};
use tracing::{debug, warn};

use crate::config::MasterConfig;
use crate::constants::MBAP_HEADER_LEN;
use crate::core::{PduFramer, StandardFramer};
use crate::error::{ModbusError, ModbusResult};
use crate::mbap::{encode_frame, inspect_frame, Discard, FrameStatus, UnitId};
use crate::pdu::ModbusPdu;
use crate::transport::{
    MasterTransport, TcpMasterTransport, TransportStats, UdpMasterTransport,
};

/// Frame received by the master
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterReply {
    /// Slave the frame came from
    pub peer: SocketAddr,
    pub transaction_id: u16,
    pub unit_id: UnitId,
    /// Reply PDU, header stripped
    pub pdu: ModbusPdu,
}

/// Modbus master bound to one transport
pub struct ModbusMaster<T: MasterTransport, F: PduFramer = StandardFramer> {
    transport: T,
    framer: F,
    config: MasterConfig,
    transaction_id: u16,
    rx: BytesMut,
    /// Peer and connection session the buffered bytes came from
    rx_source: Option<(SocketAddr, u64)>,
}

impl<T: MasterTransport, F: PduFramer> ModbusMaster<T, F> {
    /// Create a master over an existing transport
    pub fn new(transport: T, framer: F, config: MasterConfig) -> ModbusResult<Self> {
        config.validate()?;
        Ok(Self {
            transport,
            framer,
            config,
            transaction_id: 0,
            rx: BytesMut::new(),
            rx_source: None,
        })
    }

    /// Next transaction id: wraps around and never yields 0
    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        if self.transaction_id == 0 {
            self.transaction_id = 1;
        }
        self.transaction_id
    }

    /// Write `value` to holding register `offset` of the slave at `peer`.
    ///
    /// Returns the transaction id of the request.
    pub async fn send_holding_register(
        &mut self,
        peer: IpAddr,
        offset: u16,
        value: u16,
    ) -> ModbusResult<u16> {
        let pdu = self.framer.frame_holding_register(offset, value)?;
        let dest = SocketAddr::new(peer, self.config.remote_port);
        self.send_pdu(dest, &pdu).await
    }

    /// Write `value` to coil `offset` of the slave at `peer`.
    ///
    /// Returns the transaction id of the request.
    pub async fn send_coil(&mut self, peer: IpAddr, offset: u16, value: bool) -> ModbusResult<u16> {
        let pdu = self.framer.frame_coil(offset, value)?;
        let dest = SocketAddr::new(peer, self.config.remote_port);
        self.send_pdu(dest, &pdu).await
    }

    /// Frame an arbitrary PDU and send it to `peer`
    pub async fn send_pdu(&mut self, peer: SocketAddr, pdu: &ModbusPdu) -> ModbusResult<u16> {
        if pdu.is_empty() {
            return Err(ModbusError::invalid_data("Cannot send an empty PDU"));
        }

        let transaction_id = self.next_transaction_id();
        let frame = encode_frame(transaction_id, self.config.unit_id, pdu.as_slice());
        self.transport.send_to(peer, &frame).await?;

        debug!(
            "Sent tid={} unit={} fc={:02X?} to {}",
            transaction_id,
            self.config.unit_id,
            pdu.function_code(),
            peer
        );
        Ok(transaction_id)
    }

    /// Decode one reply frame that has already arrived, without waiting.
    ///
    /// Malformed frames are logged and skipped.
    pub fn poll_reply(&mut self) -> ModbusResult<Option<MasterReply>> {
        loop {
            if let Some(reply) = self.take_buffered_reply()? {
                return Ok(Some(reply));
            }

            let Some(inbound) = self.transport.try_receive()? else {
                return Ok(None);
            };

            // A datagram is a unit of its own; a new stream peer or connection
            // starts afresh
            let source = (inbound.peer, inbound.session);
            if !self.transport.kind().is_stream() || self.rx_source != Some(source) {
                if !self.rx.is_empty() {
                    debug!("Discarding {} stale reply bytes", self.rx.len());
                }
                self.rx.clear();
            }
            self.rx_source = Some(source);
            self.rx.extend_from_slice(&inbound.data);
        }
    }

    fn take_buffered_reply(&mut self) -> ModbusResult<Option<MasterReply>> {
        let Some((peer, _)) = self.rx_source else {
            return Ok(None);
        };
        if self.rx.is_empty() {
            return Ok(None);
        }

        match inspect_frame(&self.rx, self.config.max_frame) {
            FrameStatus::Complete { header, pdu_len } => {
                let mut frame = self.rx.split_to(MBAP_HEADER_LEN + pdu_len);
                frame.advance(MBAP_HEADER_LEN);
                if !self.transport.kind().is_stream() {
                    self.rx.clear();
                }

                Ok(Some(MasterReply {
                    peer,
                    transaction_id: header.transaction_id,
                    unit_id: header.unit_id,
                    pdu: ModbusPdu::from_slice(&frame)?,
                }))
            }
            FrameStatus::Incomplete { needed } => {
                if !self.transport.kind().is_stream() {
                    warn!(
                        "Dropping truncated reply from {}: {} bytes missing",
                        peer, needed
                    );
                    self.rx.clear();
                }
                Ok(None)
            }
            FrameStatus::Invalid { error, discard } => {
                warn!("Dropping reply from {}: {}", peer, error);
                match discard {
                    Discard::Bytes(n) if n <= self.rx.len() && self.transport.kind().is_stream() => {
                        self.rx.advance(n)
                    }
                    _ => self.rx.clear(),
                }
                Ok(None)
            }
        }
    }

    /// Check if the transport can send without connecting first
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Release the transport's socket
    pub async fn close(&mut self) -> ModbusResult<()> {
        self.rx.clear();
        self.rx_source = None;
        self.transport.close().await
    }

    /// Master settings
    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// Get a reference to the underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Get a mutable reference to the underlying transport
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Transport statistics
    pub fn get_stats(&self) -> TransportStats {
        self.transport.get_stats()
    }
}

impl ModbusMaster<UdpMasterTransport> {
    /// Bind a datagram master to `config.local_address`
    pub async fn udp(config: MasterConfig) -> ModbusResult<Self> {
        config.validate()?;
        let transport = UdpMasterTransport::bind(&config).await?;
        Self::new(transport, StandardFramer, config)
    }
}

impl ModbusMaster<TcpMasterTransport> {
    /// Create a stream master; the connection opens on the first send
    pub fn tcp(config: MasterConfig) -> ModbusResult<Self> {
        config.validate()?;
        let transport = TcpMasterTransport::new(&config);
        Self::new(transport, StandardFramer, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::PduBuilder;
    use crate::transport::{Inbound, TransportKind};
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;

    /// Mock transport for testing
    struct MockTransport {
        kind: TransportKind,
        sent: Vec<(SocketAddr, Vec<u8>)>,
        incoming: VecDeque<Inbound>,
        connected: bool,
    }

    impl MockTransport {
        fn new(kind: TransportKind) -> Self {
            Self {
                kind,
                sent: Vec::new(),
                incoming: VecDeque::new(),
                connected: true,
            }
        }

        fn add_incoming(&mut self, data: &[u8], peer: SocketAddr) {
            self.add_incoming_on(data, peer, 0);
        }

        fn add_incoming_on(&mut self, data: &[u8], peer: SocketAddr, session: u64) {
            self.incoming.push_back(Inbound {
                data: Bytes::copy_from_slice(data),
                peer,
                session,
            });
        }

        fn get_sent(&self) -> &[(SocketAddr, Vec<u8>)] {
            &self.sent
        }
    }

    impl MasterTransport for MockTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        async fn send_to(&mut self, peer: SocketAddr, frame: &[u8]) -> ModbusResult<()> {
            if !self.connected {
                return Err(ModbusError::connection("closed"));
            }
            self.sent.push((peer, frame.to_vec()));
            Ok(())
        }

        fn try_receive(&mut self) -> ModbusResult<Option<Inbound>> {
            Ok(self.incoming.pop_front())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn close(&mut self) -> ModbusResult<()> {
            self.connected = false;
            Ok(())
        }

        fn local_addr(&self) -> ModbusResult<SocketAddr> {
            Ok("0.0.0.0:10502".parse().unwrap())
        }

        fn set_packet_logging(&mut self, _enabled: bool) {}

        fn get_stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    const SLAVE_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));

    fn slave_addr() -> SocketAddr {
        SocketAddr::new(SLAVE_IP, 502)
    }

    fn master(kind: TransportKind) -> ModbusMaster<MockTransport> {
        ModbusMaster::new(MockTransport::new(kind), StandardFramer, MasterConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_send_holding_register() {
        let mut master = master(TransportKind::Datagram);

        let tid = master.send_holding_register(SLAVE_IP, 10, 42).await.unwrap();
        assert_eq!(tid, 1);

        let sent = master.transport().get_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, slave_addr());
        assert_eq!(
            sent[0].1,
            vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x0A, 0x00, 0x2A]
        );
    }

    #[tokio::test]
    async fn test_send_coil() {
        let mut master = master(TransportKind::Datagram);
        master.send_holding_register(SLAVE_IP, 0, 0).await.unwrap();

        let tid = master.send_coil(SLAVE_IP, 0x00AC, true).await.unwrap();
        assert_eq!(tid, 2);
        assert_eq!(
            master.transport().get_sent()[1].1,
            vec![0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x05, 0x00, 0xAC, 0xFF, 0x00]
        );
    }

    #[tokio::test]
    async fn test_custom_port_and_unit() {
        let config = MasterConfig::new().with_remote_port(1502).with_unit_id(0x11);
        let mut master =
            ModbusMaster::new(MockTransport::new(TransportKind::Stream), StandardFramer, config)
                .unwrap();

        master.send_coil(SLAVE_IP, 1, false).await.unwrap();
        let (peer, frame) = &master.transport().get_sent()[0];
        assert_eq!(peer.port(), 1502);
        assert_eq!(frame[6], 0x11);
    }

    #[test]
    fn test_transaction_id_wraps_and_skips_zero() {
        let mut master = master(TransportKind::Datagram);
        assert_eq!(master.next_transaction_id(), 1);
        assert_eq!(master.next_transaction_id(), 2);

        master.transaction_id = u16::MAX - 1;
        assert_eq!(master.next_transaction_id(), u16::MAX);
        assert_eq!(master.next_transaction_id(), 1);
    }

    #[tokio::test]
    async fn test_send_empty_pdu_rejected() {
        let mut master = master(TransportKind::Datagram);
        let err = master.send_pdu(slave_addr(), &ModbusPdu::new()).await.unwrap_err();
        assert!(matches!(err, ModbusError::InvalidData { .. }));
        assert!(master.transport().get_sent().is_empty());
    }

    #[tokio::test]
    async fn test_send_pdu_general_form() {
        let mut master = master(TransportKind::Datagram);
        let pdu = PduBuilder::build_read_holding_registers(0, 1).unwrap();
        let dest: SocketAddr = "10.0.0.5:5020".parse().unwrap();

        master.send_pdu(dest, &pdu).await.unwrap();
        assert_eq!(
            master.transport().get_sent()[0],
            (dest, vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01])
        );
    }

    #[tokio::test]
    async fn test_custom_framer() {
        struct ReadFramer;
        impl PduFramer for ReadFramer {
            fn frame_holding_register(&mut self, offset: u16, _value: u16) -> ModbusResult<ModbusPdu> {
                PduBuilder::build_read_holding_registers(offset, 1)
            }
        }

        let mut master = ModbusMaster::new(
            MockTransport::new(TransportKind::Datagram),
            ReadFramer,
            MasterConfig::default(),
        )
        .unwrap();
        master.send_holding_register(SLAVE_IP, 7, 99).await.unwrap();
        assert_eq!(master.transport().get_sent()[0].1[7], 0x03);
    }

    #[test]
    fn test_poll_reply_datagram() {
        let mut master = master(TransportKind::Datagram);
        assert_eq!(master.poll_reply().unwrap(), None);

        master.transport_mut().add_incoming(
            &[0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x2A, 0xEE],
            slave_addr(),
        );

        let reply = master.poll_reply().unwrap().unwrap();
        assert_eq!(reply.peer, slave_addr());
        assert_eq!(reply.transaction_id, 1);
        assert_eq!(reply.unit_id, 1);
        assert_eq!(reply.pdu.as_slice(), &[0x03, 0x02, 0x00, 0x2A]);

        // Trailing byte belonged to the same datagram and is gone
        assert_eq!(master.poll_reply().unwrap(), None);
    }

    #[test]
    fn test_poll_reply_skips_bad_datagrams() {
        let mut master = master(TransportKind::Datagram);
        master
            .transport_mut()
            .add_incoming(&[0x00, 0x01, 0x00, 0x05, 0x00, 0x02, 0x01, 0x03], slave_addr());
        master
            .transport_mut()
            .add_incoming(&[0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06], slave_addr());
        master.transport_mut().add_incoming(
            &[0x00, 0x03, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x0A, 0x00, 0x2A],
            slave_addr(),
        );

        let reply = master.poll_reply().unwrap().unwrap();
        assert_eq!(reply.transaction_id, 3);
    }

    #[test]
    fn test_poll_reply_stream_reassembly() {
        let mut master = master(TransportKind::Stream);
        let frame = [0x00, 0x09, 0x00, 0x00, 0x00, 0x06, 0x01, 0x05, 0x00, 0x01, 0xFF, 0x00];

        master.transport_mut().add_incoming(&frame[..4], slave_addr());
        assert_eq!(master.poll_reply().unwrap(), None);

        master.transport_mut().add_incoming(&frame[4..], slave_addr());
        let reply = master.poll_reply().unwrap().unwrap();
        assert_eq!(reply.transaction_id, 9);
        assert_eq!(reply.pdu.function_code(), Some(0x05));
    }

    #[test]
    fn test_poll_reply_new_connection_drops_stale_partial() {
        let mut master = master(TransportKind::Stream);
        let frame = [0x00, 0x0B, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x02, 0x00, 0x07];

        // Connection 1 dies half way through a reply
        master.transport_mut().add_incoming_on(&frame[..5], slave_addr(), 1);
        assert_eq!(master.poll_reply().unwrap(), None);

        // Connection 2 to the same slave delivers a whole reply
        master.transport_mut().add_incoming_on(&frame, slave_addr(), 2);
        let reply = master.poll_reply().unwrap().unwrap();
        assert_eq!(reply.transaction_id, 0x0B);
        assert_eq!(reply.pdu.as_slice(), &frame[7..]);
        assert_eq!(master.poll_reply().unwrap(), None);
    }

    #[tokio::test]
    async fn test_close() {
        let mut master = master(TransportKind::Datagram);
        assert!(master.is_connected());
        master.close().await.unwrap();
        assert!(!master.is_connected());
        assert!(master.send_coil(SLAVE_IP, 0, true).await.is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = MasterConfig::new().with_local_port(502);
        assert!(ModbusMaster::new(MockTransport::new(TransportKind::Datagram), StandardFramer, config).is_err());
    }
}
