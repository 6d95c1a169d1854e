//! Seam between the transport layer and the Modbus application core
//!
//! The transport never interprets function codes. On the slave side it hands
//! each received PDU to a [`PduHandler`], which rewrites the buffer in place and
//! says whether a reply goes out. On the master side a [`PduFramer`] builds the
//! request PDU for a register or coil write.

use crate::error::ModbusResult;
use crate::pdu::{ModbusPdu, PduBuilder};

/// What the slave does with the PDU buffer after the core processed it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyDisposition {
    /// Send the rewritten buffer as the reply
    #[default]
    Normal,
    /// Send the buffer back unchanged (write requests echo the request)
    Echo,
    /// Send nothing (broadcast or listen-only)
    Off,
}

impl ReplyDisposition {
    /// Check if a reply frame goes out on the wire
    #[inline]
    pub fn should_reply(&self) -> bool {
        !matches!(self, Self::Off)
    }
}

/// Application core invoked by the slave once per received frame.
///
/// On entry `pdu` holds the request PDU (header stripped). On return it holds
/// the reply PDU, unless the disposition is [`ReplyDisposition::Off`].
///
/// Any `FnMut(&mut ModbusPdu) -> ReplyDisposition` closure is a handler:
///
/// ```rust
/// use modbus_ip::{ModbusPdu, PduHandler, ReplyDisposition};
///
/// let mut handler = |pdu: &mut ModbusPdu| {
///     pdu.replace(&[0x03, 0x02, 0x00, 0x2A]).ok();
///     ReplyDisposition::Normal
/// };
///
/// let mut pdu = ModbusPdu::from_slice(&[0x03, 0x00, 0x00, 0x00, 0x01]).unwrap();
/// assert_eq!(handler.process_pdu(&mut pdu), ReplyDisposition::Normal);
/// assert_eq!(pdu.as_slice(), &[0x03, 0x02, 0x00, 0x2A]);
/// ```
pub trait PduHandler: Send {
    /// Process one request PDU in place
    fn process_pdu(&mut self, pdu: &mut ModbusPdu) -> ReplyDisposition;
}

impl<F> PduHandler for F
where
    F: FnMut(&mut ModbusPdu) -> ReplyDisposition + Send,
{
    fn process_pdu(&mut self, pdu: &mut ModbusPdu) -> ReplyDisposition {
        self(pdu)
    }
}

/// Builds request PDUs for the master's single-point writes.
///
/// The default methods produce Write Single Register (FC06) and Write Single
/// Coil (FC05) requests. Override them to target a different function code.
pub trait PduFramer: Send {
    /// Frame a write of `value` to holding register `offset`
    fn frame_holding_register(&mut self, offset: u16, value: u16) -> ModbusResult<ModbusPdu> {
        PduBuilder::build_write_single_register(offset, value)
    }

    /// Frame a write of `value` to coil `offset`
    fn frame_coil(&mut self, offset: u16, value: bool) -> ModbusResult<ModbusPdu> {
        PduBuilder::build_write_single_coil(offset, value)
    }
}

/// Framer using the standard single-write function codes
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardFramer;

impl PduFramer for StandardFramer {}
