//! CoAP message codec and the CoAP protocol state machine.
//!
//! CoAP runs over datagrams only; each datagram is one message.
//! Instead of failing on the first problem, the parser accumulates
//! field-presence and error bits in [`CoapFlags`], mirroring the
//! message layout: a handler can see exactly which fields were
//! decoded before the error position.

use crate::buf::Buf;
use crate::conn::{Conn, Handler, deliver_user};
use crate::event::Event;

use bitflags::bitflags;
use std::mem;

bitflags! {
    /// Field-presence and error bits of a [`CoapMessage`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CoapFlags: u32 {
        /// `msg_type` was decoded.
        const MSG_TYPE = 1 << 1;
        /// `code_class` was decoded.
        const CODE_CLASS = 1 << 2;
        /// `code_detail` was decoded.
        const CODE_DETAIL = 1 << 3;
        /// `msg_id` was decoded.
        const MSG_ID = 1 << 4;
        /// A non-empty token was decoded.
        const TOKEN = 1 << 5;
        /// At least one option was decoded.
        const OPTIONS = 1 << 6;
        /// A payload was decoded.
        const PAYLOAD = 1 << 7;

        /// Something went wrong; one of the bits below says what.
        const ERROR = 1 << 16;
        /// The message violates the encoding rules.
        const FORMAT_ERROR = 1 << 17;
        /// Unknown protocol version; drop silently.
        const IGNORE = 1 << 18;
        /// The datagram ended before the message did.
        const NOT_ENOUGH_DATA = 1 << 19;
        /// Sending the composed message failed.
        const NETWORK_ERROR = 1 << 20;
    }
}

/// CoAP message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoapType {
    Confirmable = 0,
    NonConfirmable = 1,
    Ack = 2,
    Reset = 3,
}

impl CoapType {
    fn from_bits(v: u8) -> Self {
        match v & 0x3 {
            0 => Self::Confirmable,
            1 => Self::NonConfirmable,
            2 => Self::Ack,
            _ => Self::Reset,
        }
    }
}

/// One CoAP option. Numbers must be non-descending within a message.
#[derive(Debug, Clone)]
pub struct CoapOption<'a> {
    pub number: u32,
    pub value: &'a [u8],
}

/// A CoAP message, parsed or under composition.
#[derive(Debug)]
pub struct CoapMessage<'a> {
    /// Presence and error bits.
    pub flags: CoapFlags,

    pub msg_type: CoapType,
    pub code_class: u8,
    pub code_detail: u8,
    pub msg_id: u16,
    pub token: &'a [u8],
    pub options: Vec<CoapOption<'a>>,
    pub payload: &'a [u8],
}

impl Default for CoapMessage<'_> {
    fn default() -> Self {
        Self {
            flags: CoapFlags::empty(),
            msg_type: CoapType::Confirmable,
            code_class: 0,
            code_detail: 0,
            msg_id: 0,
            token: &[],
            options: Vec::new(),
            payload: &[],
        }
    }
}

impl<'a> CoapMessage<'a> {
    /// Appends an option, keeping the list sorted by number.
    pub fn add_option(&mut self, number: u32, value: &'a [u8]) {
        let at = self
            .options
            .iter()
            .position(|o| o.number > number)
            .unwrap_or(self.options.len());
        self.options.insert(at, CoapOption { number, value });
    }
}

/// Reads an option nibble's extended form.
///
/// Returns the decoded value and the bytes consumed, or `None` when
/// the datagram is short.
fn ext_value(data: &[u8], pos: usize, nibble: u8) -> Option<(u32, usize)> {
    match nibble {
        13 => {
            let b = *data.get(pos)?;
            Some((u32::from(b) + 13, 1))
        }
        14 => {
            let hi = *data.get(pos)?;
            let lo = *data.get(pos + 1)?;
            Some((u32::from(u16::from_be_bytes([hi, lo])) + 269, 2))
        }
        n => Some((u32::from(n), 0)),
    }
}

/// Parses one datagram into a message.
///
/// Errors are reported through `flags`, with the fields decoded so
/// far populated.
pub fn parse_coap(data: &[u8]) -> CoapMessage<'_> {
    let mut msg = CoapMessage::default();

    if data.len() < 4 {
        msg.flags |= CoapFlags::ERROR | CoapFlags::NOT_ENOUGH_DATA;
        return msg;
    }

    if data[0] >> 6 != 1 {
        // Unknown version: not ours to answer.
        msg.flags |= CoapFlags::ERROR | CoapFlags::IGNORE;
        return msg;
    }

    msg.msg_type = CoapType::from_bits(data[0] >> 4);
    msg.flags |= CoapFlags::MSG_TYPE;

    let token_len = (data[0] & 0x0f) as usize;
    if token_len > 8 {
        msg.flags |= CoapFlags::ERROR | CoapFlags::FORMAT_ERROR;
        return msg;
    }

    msg.code_class = data[1] >> 5;
    msg.flags |= CoapFlags::CODE_CLASS;
    msg.code_detail = data[1] & 0x1f;
    msg.flags |= CoapFlags::CODE_DETAIL;
    msg.msg_id = u16::from_be_bytes([data[2], data[3]]);
    msg.flags |= CoapFlags::MSG_ID;

    let mut pos = 4;

    let Some(token) = data.get(pos..pos + token_len) else {
        msg.flags |= CoapFlags::ERROR | CoapFlags::NOT_ENOUGH_DATA;
        return msg;
    };
    if token_len > 0 {
        msg.token = token;
        msg.flags |= CoapFlags::TOKEN;
    }
    pos += token_len;

    let mut number = 0u32;

    while pos < data.len() && data[pos] != 0xff {
        let delta_nibble = data[pos] >> 4;
        let len_nibble = data[pos] & 0x0f;
        pos += 1;

        // Nibble 15 is reserved for the payload marker.
        if delta_nibble == 15 || len_nibble == 15 {
            msg.flags |= CoapFlags::ERROR | CoapFlags::FORMAT_ERROR;
            return msg;
        }

        let Some((delta, used)) = ext_value(data, pos, delta_nibble) else {
            msg.flags |= CoapFlags::ERROR | CoapFlags::NOT_ENOUGH_DATA;
            return msg;
        };
        pos += used;

        let Some((value_len, used)) = ext_value(data, pos, len_nibble) else {
            msg.flags |= CoapFlags::ERROR | CoapFlags::NOT_ENOUGH_DATA;
            return msg;
        };
        pos += used;

        let Some(value) = data.get(pos..pos + value_len as usize) else {
            msg.flags |= CoapFlags::ERROR | CoapFlags::NOT_ENOUGH_DATA;
            return msg;
        };
        pos += value_len as usize;

        number += delta;
        msg.options.push(CoapOption { number, value });
        msg.flags |= CoapFlags::OPTIONS;
    }

    if pos < data.len() {
        // Payload marker: a marker with nothing behind it is illegal.
        pos += 1;
        if pos < data.len() {
            msg.payload = &data[pos..];
            msg.flags |= CoapFlags::PAYLOAD;
        } else {
            msg.flags |= CoapFlags::ERROR | CoapFlags::FORMAT_ERROR;
        }
    }

    msg
}

fn nibble_for(value: u32) -> (u8, [u8; 2], usize) {
    if value < 13 {
        (value as u8, [0; 2], 0)
    } else if value < 269 {
        (13, [(value - 13) as u8, 0], 1)
    } else {
        let ext = ((value - 269) as u16).to_be_bytes();
        (14, ext, 2)
    }
}

/// Validates and serializes a message into `out`.
///
/// Returns the empty flag set on success; otherwise `ERROR` plus the
/// field bits that failed validation. Options must be sorted by
/// number.
pub fn compose_coap(msg: &CoapMessage<'_>, out: &mut Buf) -> CoapFlags {
    let mut err = CoapFlags::empty();

    if msg.token.len() > 8 {
        err |= CoapFlags::TOKEN;
    }
    if msg.code_class > 7 {
        err |= CoapFlags::CODE_CLASS;
    }
    if msg.code_detail > 31 {
        err |= CoapFlags::CODE_DETAIL;
    }
    for pair in msg.options.windows(2) {
        if pair[0].number > pair[1].number {
            err |= CoapFlags::OPTIONS;
        }
    }
    if !err.is_empty() {
        return err | CoapFlags::ERROR;
    }

    out.append(&[
        0x40 | ((msg.msg_type as u8) << 4) | msg.token.len() as u8,
        (msg.code_class << 5) | msg.code_detail,
    ]);
    out.append(&msg.msg_id.to_be_bytes());
    out.append(msg.token);

    let mut number = 0u32;
    for opt in &msg.options {
        let (delta_nibble, delta_ext, delta_ext_len) = nibble_for(opt.number - number);
        let (len_nibble, len_ext, len_ext_len) = nibble_for(opt.value.len() as u32);

        out.append(&[(delta_nibble << 4) | len_nibble]);
        out.append(&delta_ext[..delta_ext_len]);
        out.append(&len_ext[..len_ext_len]);
        out.append(opt.value);

        number = opt.number;
    }

    if !msg.payload.is_empty() {
        out.append(&[0xff]);
        out.append(msg.payload);
    }

    CoapFlags::empty()
}

/// Composes and sends a message on a datagram connection.
pub fn send_coap(conn: &mut Conn, msg: &CoapMessage<'_>) -> CoapFlags {
    let mut out = Buf::with_capacity(32);
    let err = compose_coap(msg, &mut out);
    if !err.is_empty() {
        return err;
    }

    if conn.send(&out) == 0 {
        return CoapFlags::ERROR | CoapFlags::NETWORK_ERROR;
    }

    CoapFlags::empty()
}

/// Sends an empty acknowledgement for `msg_id`.
pub fn send_ack(conn: &mut Conn, msg_id: u16) -> CoapFlags {
    let msg = CoapMessage {
        msg_type: CoapType::Ack,
        msg_id,
        ..CoapMessage::default()
    };
    send_coap(conn, &msg)
}

/// Drives the CoAP state machine for one connection event.
pub(crate) fn coap_event(conn: &mut Conn, user: &Handler, ev: Event<'_>) {
    match ev {
        Event::Recv { .. } => {
            deliver_user(conn, user, ev);

            let buf = mem::take(&mut conn.recv_buf);
            let mut msg = parse_coap(&buf);

            if !msg.flags.contains(CoapFlags::IGNORE) {
                // A short datagram cannot complete: no more bytes are
                // coming for it.
                if msg.flags.contains(CoapFlags::NOT_ENOUGH_DATA) {
                    msg.flags |= CoapFlags::FORMAT_ERROR;
                }
                deliver_user(conn, user, Event::Coap { msg: &msg });
            }

            conn.recv_buf = buf;
            conn.recv_buf.clear();
        }
        other => deliver_user(conn, user, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: &CoapMessage<'_>) -> (Vec<u8>, CoapFlags) {
        let mut out = Buf::new();
        let err = compose_coap(msg, &mut out);
        (out.into_vec(), err)
    }

    #[test]
    fn empty_ack_roundtrip() {
        let msg = CoapMessage {
            msg_type: CoapType::Ack,
            msg_id: 0xbeef,
            ..CoapMessage::default()
        };
        let (wire, err) = roundtrip(&msg);
        assert!(err.is_empty());
        assert_eq!(wire, [0x60, 0x00, 0xbe, 0xef]);

        let parsed = parse_coap(&wire);
        assert!(!parsed.flags.contains(CoapFlags::ERROR));
        assert_eq!(parsed.msg_type, CoapType::Ack);
        assert_eq!(parsed.msg_id, 0xbeef);
    }

    #[test]
    fn full_message_roundtrip() {
        let mut msg = CoapMessage {
            msg_type: CoapType::Confirmable,
            code_class: 0,
            code_detail: 1, // GET
            msg_id: 7,
            token: b"tok",
            payload: b"hello",
            ..CoapMessage::default()
        };
        msg.add_option(11, b"temp"); // Uri-Path
        msg.add_option(300, b"x"); // needs the two-byte extended delta

        let (wire, err) = roundtrip(&msg);
        assert!(err.is_empty());

        let parsed = parse_coap(&wire);
        assert!(!parsed.flags.contains(CoapFlags::ERROR));
        assert!(parsed.flags.contains(
            CoapFlags::TOKEN | CoapFlags::OPTIONS | CoapFlags::PAYLOAD
        ));
        assert_eq!(parsed.token, b"tok");
        assert_eq!(parsed.payload, b"hello");
        assert_eq!(parsed.options.len(), 2);
        assert_eq!(parsed.options[0].number, 11);
        assert_eq!(parsed.options[0].value, b"temp");
        assert_eq!(parsed.options[1].number, 300);
    }

    #[test]
    fn add_option_keeps_numbers_sorted() {
        let mut msg = CoapMessage::default();
        msg.add_option(7, b"b");
        msg.add_option(3, b"a");
        msg.add_option(15, b"c");

        let numbers: Vec<u32> = msg.options.iter().map(|o| o.number).collect();
        assert_eq!(numbers, [3, 7, 15]);
    }

    #[test]
    fn out_of_order_options_fail_composition() {
        let mut msg = CoapMessage::default();
        msg.options.push(CoapOption {
            number: 9,
            value: b"",
        });
        msg.options.push(CoapOption {
            number: 4,
            value: b"",
        });

        let (_, err) = roundtrip(&msg);
        assert!(err.contains(CoapFlags::ERROR | CoapFlags::OPTIONS));
    }

    #[test]
    fn oversized_token_fails_both_ways() {
        let msg = CoapMessage {
            token: b"way-too-long!",
            ..CoapMessage::default()
        };
        let (_, err) = roundtrip(&msg);
        assert!(err.contains(CoapFlags::ERROR | CoapFlags::TOKEN));

        // TKL 9 on the wire.
        let parsed = parse_coap(&[0x49, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(parsed.flags.contains(CoapFlags::ERROR | CoapFlags::FORMAT_ERROR));
    }

    #[test]
    fn wrong_version_is_ignored() {
        let parsed = parse_coap(&[0x80, 0x00, 0x00, 0x01]);
        assert!(parsed.flags.contains(CoapFlags::IGNORE));
    }

    #[test]
    fn payload_marker_without_payload_is_a_format_error() {
        let parsed = parse_coap(&[0x40, 0x00, 0x00, 0x01, 0xff]);
        assert!(parsed.flags.contains(CoapFlags::ERROR | CoapFlags::FORMAT_ERROR));
    }

    #[test]
    fn short_datagram_reports_missing_data() {
        let parsed = parse_coap(&[0x40, 0x00]);
        assert!(parsed.flags.contains(CoapFlags::ERROR | CoapFlags::NOT_ENOUGH_DATA));

        // Reserved nibble 15 outside the payload marker.
        let parsed = parse_coap(&[0x40, 0x00, 0x00, 0x01, 0xf0]);
        assert!(parsed.flags.contains(CoapFlags::ERROR | CoapFlags::FORMAT_ERROR));
    }
}
