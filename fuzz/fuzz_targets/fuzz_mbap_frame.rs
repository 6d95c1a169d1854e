#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use modbus_ip::mbap::{encode_frame, inspect_frame, Discard, FrameStatus, MbapHeader};
use modbus_ip::{ModbusPdu, MAX_PDU_SIZE, MBAP_HEADER_LEN};

#[derive(Debug, Arbitrary)]
struct Input {
    max_frame: u8,
    data: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let max_frame = (input.max_frame as usize).clamp(1, MAX_PDU_SIZE);

    match inspect_frame(&input.data, max_frame) {
        FrameStatus::Complete { header, pdu_len } => {
            assert!(pdu_len >= 1 && pdu_len <= max_frame);
            assert!(input.data.len() >= MBAP_HEADER_LEN + pdu_len);

            let body = &input.data[MBAP_HEADER_LEN..MBAP_HEADER_LEN + pdu_len];
            let pdu = ModbusPdu::from_slice(body).expect("pdu within limits");

            // Re-framing a complete frame reproduces its bytes
            let frame = encode_frame(header.transaction_id, header.unit_id, pdu.as_slice());
            assert_eq!(&frame[..], &input.data[..MBAP_HEADER_LEN + pdu_len]);
            assert_eq!(MbapHeader::from_slice(&frame).ok(), Some(header));
        }
        FrameStatus::Incomplete { needed } => {
            assert!(needed > 0);
        }
        FrameStatus::Invalid { error, discard } => {
            assert!(error.is_framing_error());
            if let Discard::Bytes(n) = discard {
                assert!(n >= MBAP_HEADER_LEN);
            }
        }
    }
});
