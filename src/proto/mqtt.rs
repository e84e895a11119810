//! MQTT 3.1 framing: message parsing, composers, and the protocol
//! state machine.
//!
//! Inbound messages are parsed straight out of the receive buffer;
//! composers queue bytes on the send buffer. The fixed header is
//! prepended after the body is composed, since the remaining-length
//! varint depends on the body size.

use crate::conn::{Conn, Handler, ConnFlags, deliver_user};
use crate::event::Event;

use std::mem;

/// MQTT control packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MqttCmd {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl MqttCmd {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Connect,
            2 => Self::Connack,
            3 => Self::Publish,
            4 => Self::Puback,
            5 => Self::Pubrec,
            6 => Self::Pubrel,
            7 => Self::Pubcomp,
            8 => Self::Subscribe,
            9 => Self::Suback,
            10 => Self::Unsubscribe,
            11 => Self::Unsuback,
            12 => Self::Pingreq,
            13 => Self::Pingresp,
            14 => Self::Disconnect,
            _ => return None,
        })
    }
}

/// CONNACK return codes.
pub const CONNACK_ACCEPTED: u8 = 0;
pub const CONNACK_UNACCEPTABLE_VERSION: u8 = 1;
pub const CONNACK_IDENTIFIER_REJECTED: u8 = 2;
pub const CONNACK_SERVER_UNAVAILABLE: u8 = 3;
pub const CONNACK_BAD_AUTH: u8 = 4;
pub const CONNACK_NOT_AUTHORIZED: u8 = 5;

/// CONNECT flag bits.
pub const CONNECT_CLEAN_SESSION: u8 = 0x02;
pub const CONNECT_WILL_FLAG: u8 = 0x04;
pub const CONNECT_WILL_RETAIN: u8 = 0x20;
pub const CONNECT_HAS_PASSWORD: u8 = 0x40;
pub const CONNECT_HAS_USER_NAME: u8 = 0x80;

/// Fixed-header flag helpers.
pub const FLAG_DUP: u8 = 0x08;
pub const FLAG_RETAIN: u8 = 0x01;

/// Encodes a QoS level into fixed-header flag bits.
pub const fn qos(level: u8) -> u8 {
    (level & 0x3) << 1
}

/// One parsed MQTT message. `topic` and `payload` borrow from the
/// receive buffer.
#[derive(Debug, Default)]
pub struct MqttMessage<'a> {
    /// Control packet type.
    pub cmd: Option<MqttCmd>,

    /// Fixed-header flags (low nibble: DUP, QoS, RETAIN).
    pub flags: u8,

    /// QoS level extracted from the fixed-header flags.
    pub qos: u8,

    /// Packet identifier, where the packet type carries one.
    pub message_id: u16,

    /// CONNACK return code.
    pub connack_code: u8,

    /// PUBLISH topic.
    pub topic: &'a str,

    /// Bytes after the variable header.
    pub payload: &'a [u8],
}

/// Parser verdict for the bytes buffered so far.
#[derive(Debug)]
pub(crate) enum MqttParse<'a> {
    /// Not enough bytes for a complete message.
    Incomplete,

    /// The framing is broken and the connection should close.
    Invalid,

    /// One complete message spanning `total` buffered bytes.
    Complete {
        total: usize,
        msg: MqttMessage<'a>,
    },
}

enum VarInt {
    Incomplete,
    Invalid,
    Done { value: usize, consumed: usize },
}

/// Decodes the base-128 remaining-length varint.
///
/// More than four length bytes is a framing error, which also bounds
/// the decoded value below 2^28.
fn decode_remaining_len(buf: &[u8]) -> VarInt {
    let mut value: usize = 0;
    let mut shift = 0;

    for (i, &b) in buf.iter().enumerate() {
        if i == 4 {
            return VarInt::Invalid;
        }
        value |= ((b & 0x7f) as usize) << shift;
        shift += 7;
        if b & 0x80 == 0 {
            return VarInt::Done {
                value,
                consumed: i + 1,
            };
        }
    }

    if buf.len() >= 4 {
        VarInt::Invalid
    } else {
        VarInt::Incomplete
    }
}

/// Encodes a remaining-length varint.
fn encode_remaining_len(mut len: usize, out: &mut [u8; 4]) -> usize {
    let mut n = 0;
    loop {
        let mut b = (len & 0x7f) as u8;
        len >>= 7;
        if len > 0 {
            b |= 0x80;
        }
        out[n] = b;
        n += 1;
        if len == 0 {
            return n;
        }
    }
}

/// Parses one MQTT message from the front of `buf`.
pub(crate) fn parse_mqtt(buf: &[u8]) -> MqttParse<'_> {
    if buf.len() < 2 {
        return MqttParse::Incomplete;
    }

    let header = buf[0];
    let Some(cmd) = MqttCmd::from_u8(header >> 4) else {
        return MqttParse::Invalid;
    };

    let (remaining, len_bytes) = match decode_remaining_len(&buf[1..]) {
        VarInt::Incomplete => return MqttParse::Incomplete,
        VarInt::Invalid => return MqttParse::Invalid,
        VarInt::Done { value, consumed } => (value, consumed),
    };

    let total = 1 + len_bytes + remaining;
    if buf.len() < total {
        return MqttParse::Incomplete;
    }

    let var = &buf[1 + len_bytes..total];

    let mut msg = MqttMessage {
        cmd: Some(cmd),
        flags: header & 0x0f,
        qos: (header & 0x06) >> 1,
        ..MqttMessage::default()
    };

    let var_len = match cmd {
        MqttCmd::Connack => {
            if var.len() < 2 {
                return MqttParse::Invalid;
            }
            msg.connack_code = var[1];
            2
        }
        MqttCmd::Puback
        | MqttCmd::Pubrec
        | MqttCmd::Pubrel
        | MqttCmd::Pubcomp
        | MqttCmd::Suback
        | MqttCmd::Unsuback
        | MqttCmd::Subscribe
        | MqttCmd::Unsubscribe => {
            if var.len() < 2 {
                return MqttParse::Invalid;
            }
            msg.message_id = u16::from_be_bytes([var[0], var[1]]);
            2
        }
        MqttCmd::Publish => {
            if var.len() < 2 {
                return MqttParse::Invalid;
            }
            let topic_len = u16::from_be_bytes([var[0], var[1]]) as usize;
            let Some(topic) = var.get(2..2 + topic_len) else {
                return MqttParse::Invalid;
            };
            let Ok(topic) = std::str::from_utf8(topic) else {
                return MqttParse::Invalid;
            };
            msg.topic = topic;

            let mut var_len = 2 + topic_len;
            if msg.qos > 0 {
                let Some(id) = var.get(var_len..var_len + 2) else {
                    return MqttParse::Invalid;
                };
                msg.message_id = u16::from_be_bytes([id[0], id[1]]);
                var_len += 2;
            }
            var_len
        }
        // CONNECT, PINGREQ, PINGRESP, DISCONNECT: the whole variable
        // region is left as payload.
        _ => 0,
    };

    msg.payload = &var[var_len..];

    MqttParse::Complete { total, msg }
}

/// Drives the MQTT state machine for one connection event.
pub(crate) fn mqtt_event(conn: &mut Conn, user: &Handler, ev: Event<'_>) {
    match ev {
        Event::Recv { .. } => {
            deliver_user(conn, user, ev);

            loop {
                let buf = mem::take(&mut conn.recv_buf);
                match parse_mqtt(&buf) {
                    MqttParse::Incomplete => {
                        conn.recv_buf = buf;
                        return;
                    }
                    MqttParse::Invalid => {
                        conn.recv_buf = buf;
                        conn.flags |= ConnFlags::CLOSE_IMMEDIATELY;
                        return;
                    }
                    MqttParse::Complete { total, msg } => {
                        deliver_user(conn, user, Event::Mqtt { msg: &msg });
                        conn.recv_buf = buf;
                        conn.recv_buf.remove(total);
                        if conn.close_or_closing() {
                            return;
                        }
                    }
                }
            }
        }
        other => deliver_user(conn, user, other),
    }
}

/// Prepends the fixed header for the `len` most recently queued
/// bytes.
fn prepend_header(conn: &mut Conn, cmd: MqttCmd, flags: u8, len: usize) {
    let mut var = [0u8; 4];
    let n = encode_remaining_len(len, &mut var);

    let mut header = [0u8; 5];
    header[0] = ((cmd as u8) << 4) | (flags & 0x0f);
    header[1..1 + n].copy_from_slice(&var[..n]);

    let at = conn.send_buf.len() - len;
    conn.send_buf.insert(at, &header[..1 + n]);
}

fn append_u16(conn: &mut Conn, v: u16) -> usize {
    conn.send_buf.append(&v.to_be_bytes())
}

fn append_str(conn: &mut Conn, s: &str) -> usize {
    append_u16(conn, s.len() as u16) + conn.send_buf.append(s.as_bytes())
}

/// Options for the client CONNECT message.
#[derive(Debug, Clone)]
pub struct MqttHandshakeOpts {
    /// CONNECT flag bits (`CONNECT_*`).
    pub flags: u8,

    /// Keep-alive interval in seconds.
    pub keep_alive: u16,
}

impl Default for MqttHandshakeOpts {
    fn default() -> Self {
        Self {
            flags: 0,
            keep_alive: 60,
        }
    }
}

/// Queues a CONNECT message with default options.
pub fn send_handshake(conn: &mut Conn, client_id: &str) {
    send_handshake_opt(conn, client_id, MqttHandshakeOpts::default());
}

/// Queues a CONNECT message.
pub fn send_handshake_opt(conn: &mut Conn, client_id: &str, opts: MqttHandshakeOpts) {
    let mut len = conn.send_buf.append(b"\x00\x06MQIsdp\x03");
    len += conn.send_buf.append(&[opts.flags]);
    len += append_u16(conn, opts.keep_alive);
    len += append_str(conn, client_id);

    prepend_header(conn, MqttCmd::Connect, 0, len);
}

/// Queues a CONNACK with the given return code.
pub fn send_connack(conn: &mut Conn, return_code: u8) {
    let len = conn.send_buf.append(&[0, return_code]);
    prepend_header(conn, MqttCmd::Connack, 0, len);
}

/// Queues a PUBLISH. `flags` carries DUP/QoS/RETAIN bits; the packet
/// identifier is written only for QoS above zero.
pub fn send_publish(conn: &mut Conn, topic: &str, message_id: u16, flags: u8, payload: &[u8]) {
    let mut len = append_str(conn, topic);
    if (flags & 0x06) >> 1 > 0 {
        len += append_u16(conn, message_id);
    }
    len += conn.send_buf.append(payload);

    prepend_header(conn, MqttCmd::Publish, flags, len);
}

fn send_ack_family(conn: &mut Conn, cmd: MqttCmd, flags: u8, message_id: u16) {
    let len = append_u16(conn, message_id);
    prepend_header(conn, cmd, flags, len);
}

pub fn send_puback(conn: &mut Conn, message_id: u16) {
    send_ack_family(conn, MqttCmd::Puback, 0, message_id);
}

pub fn send_pubrec(conn: &mut Conn, message_id: u16) {
    send_ack_family(conn, MqttCmd::Pubrec, 0, message_id);
}

pub fn send_pubrel(conn: &mut Conn, message_id: u16) {
    // PUBREL is the one ack sent at QoS 1.
    send_ack_family(conn, MqttCmd::Pubrel, qos(1), message_id);
}

pub fn send_pubcomp(conn: &mut Conn, message_id: u16) {
    send_ack_family(conn, MqttCmd::Pubcomp, 0, message_id);
}

/// Queues a SUBACK granting the given QoS levels.
pub fn send_suback(conn: &mut Conn, message_id: u16, granted: &[u8]) {
    let mut len = append_u16(conn, message_id);
    len += conn.send_buf.append(granted);
    prepend_header(conn, MqttCmd::Suback, qos(1), len);
}

pub fn send_unsuback(conn: &mut Conn, message_id: u16) {
    send_ack_family(conn, MqttCmd::Unsuback, 0, message_id);
}

/// Queues a SUBSCRIBE for `topics` as `(filter, qos)` pairs.
pub fn send_subscribe(conn: &mut Conn, topics: &[(&str, u8)], message_id: u16) {
    let mut len = append_u16(conn, message_id);
    for &(topic, level) in topics {
        len += append_str(conn, topic);
        len += conn.send_buf.append(&[level]);
    }

    prepend_header(conn, MqttCmd::Subscribe, qos(1), len);
}

/// Queues an UNSUBSCRIBE for `topics`.
pub fn send_unsubscribe(conn: &mut Conn, topics: &[&str], message_id: u16) {
    let mut len = append_u16(conn, message_id);
    for &topic in topics {
        len += append_str(conn, topic);
    }

    prepend_header(conn, MqttCmd::Unsubscribe, qos(1), len);
}

pub fn send_pingreq(conn: &mut Conn) {
    prepend_header(conn, MqttCmd::Pingreq, 0, 0);
}

pub fn send_pingresp(conn: &mut Conn) {
    prepend_header(conn, MqttCmd::Pingresp, 0, 0);
}

pub fn send_disconnect(conn: &mut Conn) {
    prepend_header(conn, MqttCmd::Disconnect, 0, 0);
}

/// Iterates over the topic filters of a SUBSCRIBE payload.
///
/// Pass `0` first, then the returned position, until `None`.
pub fn next_subscribe_topic<'a>(
    msg: &MqttMessage<'a>,
    pos: usize,
) -> Option<(&'a str, u8, usize)> {
    let len = msg.payload.get(pos..pos + 2)?;
    let topic_len = u16::from_be_bytes([len[0], len[1]]) as usize;

    let topic = msg.payload.get(pos + 2..pos + 2 + topic_len)?;
    let topic = std::str::from_utf8(topic).ok()?;
    let level = *msg.payload.get(pos + 2 + topic_len)?;

    Some((topic, level, pos + 3 + topic_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::handler;

    fn test_conn() -> Conn {
        Conn::new(handler(|_, _| {}))
    }

    fn parse_complete(buf: &[u8]) -> (usize, MqttMessage<'_>) {
        match parse_mqtt(buf) {
            MqttParse::Complete { total, msg } => (total, msg),
            other => panic!("expected complete message, got {other:?}"),
        }
    }

    #[test]
    fn publish_roundtrip() {
        let mut conn = test_conn();
        send_publish(&mut conn, "a/b", 99, qos(1), b"data");

        let (total, msg) = parse_complete(&conn.send_buf);
        assert_eq!(total, conn.send_buf.len());
        assert_eq!(msg.cmd, Some(MqttCmd::Publish));
        assert_eq!(msg.qos, 1);
        assert_eq!(msg.topic, "a/b");
        assert_eq!(msg.message_id, 99);
        assert_eq!(msg.payload, b"data");
    }

    #[test]
    fn qos0_publish_has_no_message_id() {
        let mut conn = test_conn();
        send_publish(&mut conn, "t", 42, 0, b"x");

        let (_, msg) = parse_complete(&conn.send_buf);
        assert_eq!(msg.qos, 0);
        assert_eq!(msg.message_id, 0);
        assert_eq!(msg.payload, b"x");
    }

    #[test]
    fn subscribe_carries_id_and_topic_list() {
        let mut conn = test_conn();
        send_subscribe(&mut conn, &[("sensors/#", 1), ("logs", 0)], 7);

        let (_, msg) = parse_complete(&conn.send_buf);
        assert_eq!(msg.cmd, Some(MqttCmd::Subscribe));
        assert_eq!(msg.message_id, 7);

        let (topic, level, pos) = next_subscribe_topic(&msg, 0).unwrap();
        assert_eq!((topic, level), ("sensors/#", 1));
        let (topic, level, pos) = next_subscribe_topic(&msg, pos).unwrap();
        assert_eq!((topic, level), ("logs", 0));
        assert!(next_subscribe_topic(&msg, pos).is_none());
    }

    #[test]
    fn connack_code_is_extracted() {
        let mut conn = test_conn();
        send_connack(&mut conn, CONNACK_BAD_AUTH);

        let (_, msg) = parse_complete(&conn.send_buf);
        assert_eq!(msg.cmd, Some(MqttCmd::Connack));
        assert_eq!(msg.connack_code, CONNACK_BAD_AUTH);
    }

    #[test]
    fn handshake_has_protocol_preamble() {
        let mut conn = test_conn();
        send_handshake(&mut conn, "dev-1");

        let (_, msg) = parse_complete(&conn.send_buf);
        assert_eq!(msg.cmd, Some(MqttCmd::Connect));
        assert!(msg.payload.starts_with(b"\x00\x06MQIsdp\x03"));
        // flags, keepalive 60, then the client id.
        assert!(msg.payload.ends_with(b"\x00\x05dev-1"));
        assert_eq!(msg.payload[9], 0);
        assert_eq!(&msg.payload[10..12], [0, 60]);
    }

    #[test]
    fn large_body_uses_multibyte_varint() {
        let mut conn = test_conn();
        send_publish(&mut conn, "t", 0, 0, &[0u8; 200]);

        // 3-byte topic field + 200 payload bytes = 203 > 127, so the
        // remaining length takes two bytes.
        assert_eq!(conn.send_buf[1] & 0x80, 0x80);
        let (total, msg) = parse_complete(&conn.send_buf);
        assert_eq!(total, conn.send_buf.len());
        assert_eq!(msg.payload.len(), 200);
    }

    #[test]
    fn truncated_message_is_incomplete() {
        let mut conn = test_conn();
        send_publish(&mut conn, "topic", 0, 0, b"payload");

        for n in 0..conn.send_buf.len() {
            assert!(
                matches!(parse_mqtt(&conn.send_buf[..n]), MqttParse::Incomplete),
                "verdict changed early at {n} bytes"
            );
        }
    }

    #[test]
    fn overlong_varint_is_invalid() {
        // Five continuation bytes exceed the four-byte bound.
        let buf = [0x30, 0x80, 0x80, 0x80, 0x80, 0x01];
        assert!(matches!(parse_mqtt(&buf), MqttParse::Invalid));
    }

    #[test]
    fn unknown_packet_type_is_invalid() {
        assert!(matches!(parse_mqtt(&[0xf0, 0x00]), MqttParse::Invalid));
    }
}
