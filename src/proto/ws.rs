//! WebSocket framing and the WebSocket protocol state machine.
//!
//! Frames are unmasked in place inside the receive buffer. Fragmented
//! messages are reassembled into a side buffer and delivered as one
//! frame unless the connection opts out with
//! [`ConnFlags::WS_NO_DEFRAG`].

use crate::conn::{Conn, ConnFlags, Handler, deliver_user};
use crate::event::Event;
use crate::proto::Proto;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};
use std::mem;
use std::time::Duration;

pub const OP_CONTINUE: u8 = 0;
pub const OP_TEXT: u8 = 1;
pub const OP_BINARY: u8 = 2;
pub const OP_CLOSE: u8 = 8;
pub const OP_PING: u8 = 9;
pub const OP_PONG: u8 = 10;

/// GUID every server concatenates to the client key before hashing,
/// fixed by RFC 6455.
const HANDSHAKE_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Idle time after which the machine sends a keepalive ping.
const PING_INTERVAL: Duration = Duration::from_secs(5);

/// One WebSocket frame, unmasked.
#[derive(Debug)]
pub struct WsFrame<'a> {
    /// First header byte: FIN, reserved bits and opcode.
    pub flags: u8,

    /// Frame payload.
    pub data: &'a [u8],
}

impl WsFrame<'_> {
    /// Returns the 4-bit opcode.
    pub fn opcode(&self) -> u8 {
        self.flags & 0x0f
    }

    /// Whether this frame ends its message.
    pub fn fin(&self) -> bool {
        self.flags & 0x80 != 0
    }
}

/// Reassembly state for fragmented messages.
#[derive(Default)]
pub(crate) struct WsState {
    frag: Option<Fragment>,
}

struct Fragment {
    opcode: u8,
    data: Vec<u8>,
}

/// Drives the WebSocket state machine for one connection event.
pub(crate) fn ws_event(me: &mut Proto, conn: &mut Conn, user: &Handler, ev: Event<'_>) {
    match ev {
        Event::Recv { .. } => {
            deliver_user(conn, user, ev);
            if let Proto::Ws(st) = me {
                deliver_frames(st, conn, user);
            }
        }
        Event::Poll { now } => {
            deliver_user(conn, user, ev);
            if conn.flags.contains(ConnFlags::IS_WEBSOCKET)
                && now.duration_since(conn.last_io) > PING_INTERVAL
            {
                conn.last_io = now;
                send_frame(conn, OP_PING, b"");
            }
        }
        other => deliver_user(conn, user, other),
    }
}

/// Delivers every complete frame currently buffered.
pub(crate) fn deliver_frames(st: &mut WsState, conn: &mut Conn, user: &Handler) {
    while deliver_one(st, conn, user) {}
}

fn deliver_one(st: &mut WsState, conn: &mut Conn, user: &Handler) -> bool {
    let buf_len = conn.recv_buf.len();
    if buf_len < 2 {
        return false;
    }

    let b0 = conn.recv_buf[0];
    let b1 = conn.recv_buf[1];
    let mask_len = if b1 & 0x80 != 0 { 4 } else { 0 };
    let len7 = (b1 & 0x7f) as usize;

    let (header_len, data_len): (usize, u64) = if len7 < 126 {
        if buf_len < 2 + mask_len {
            return false;
        }
        (2 + mask_len, len7 as u64)
    } else if len7 == 126 {
        if buf_len < 4 + mask_len {
            return false;
        }
        let n = u16::from_be_bytes([conn.recv_buf[2], conn.recv_buf[3]]);
        (4 + mask_len, u64::from(n))
    } else {
        if buf_len < 10 + mask_len {
            return false;
        }
        let mut n = [0u8; 8];
        n.copy_from_slice(&conn.recv_buf[2..10]);
        (10 + mask_len, u64::from_be_bytes(n))
    };

    // A declared length the receive cap can never hold will never
    // complete; treat it as hostile and drop the connection.
    let Some(frame_len) = (header_len as u64).checked_add(data_len) else {
        conn.flags |= ConnFlags::CLOSE_IMMEDIATELY;
        return false;
    };
    if frame_len > conn.recv_limit as u64 {
        conn.flags |= ConnFlags::CLOSE_IMMEDIATELY;
        return false;
    }
    if frame_len > buf_len as u64 {
        return false;
    }
    let frame_len = frame_len as usize;

    if mask_len > 0 {
        let mut mask = [0u8; 4];
        mask.copy_from_slice(&conn.recv_buf[header_len - 4..header_len]);
        for (i, b) in conn.recv_buf.as_mut_slice()[header_len..frame_len]
            .iter_mut()
            .enumerate()
        {
            *b ^= mask[i % 4];
        }
    }

    let opcode = b0 & 0x0f;
    let fin = b0 & 0x80 != 0;
    let fragment = !fin || opcode == OP_CONTINUE;
    let defrag = !conn.flags.contains(ConnFlags::WS_NO_DEFRAG);

    let buf = mem::take(&mut conn.recv_buf);
    let payload = &buf[header_len..frame_len];

    if fragment && defrag {
        match st.frag.as_mut() {
            Some(frag) => frag.data.extend_from_slice(payload),
            None if opcode != OP_CONTINUE => {
                st.frag = Some(Fragment {
                    opcode,
                    data: payload.to_vec(),
                });
            }
            // A continuation with nothing started is dropped.
            None => {}
        }

        if fin {
            if let Some(frag) = st.frag.take() {
                let frame = WsFrame {
                    flags: 0x80 | frag.opcode,
                    data: &frag.data,
                };
                dispatch(conn, user, &frame);
            }
        }
    } else {
        let frame = WsFrame {
            flags: b0,
            data: payload,
        };
        dispatch(conn, user, &frame);
    }

    conn.recv_buf = buf;
    conn.recv_buf.remove(frame_len);

    if opcode == OP_CLOSE {
        conn.flags |= ConnFlags::SEND_AND_CLOSE;
    }

    true
}

fn dispatch(conn: &mut Conn, user: &Handler, frame: &WsFrame<'_>) {
    let ev = if frame.opcode() & 0x8 != 0 {
        Event::WsControl { frame }
    } else {
        Event::WsFrame { frame }
    };
    deliver_user(conn, user, ev);
}

/// Queues one frame with the FIN bit set.
///
/// Sending a close frame also schedules the connection for a flush
/// and close.
pub fn send_frame(conn: &mut Conn, opcode: u8, data: &[u8]) {
    let mut header = [0u8; 10];
    header[0] = 0x80 | (opcode & 0x0f);

    let header_len = if data.len() < 126 {
        header[1] = data.len() as u8;
        2
    } else if data.len() < 65535 {
        header[1] = 126;
        header[2..4].copy_from_slice(&(data.len() as u16).to_be_bytes());
        4
    } else {
        header[1] = 127;
        header[2..10].copy_from_slice(&(data.len() as u64).to_be_bytes());
        10
    };

    conn.send(&header[..header_len]);
    conn.send(data);

    if opcode & 0x0f == OP_CLOSE {
        conn.flags |= ConnFlags::SEND_AND_CLOSE;
    }
}

/// Computes the `Sec-WebSocket-Accept` token for a client key.
pub fn accept_token(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(HANDSHAKE_GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

/// Queues the server's `101 Switching Protocols` reply.
pub(crate) fn send_handshake_reply(conn: &mut Conn, key: &str) {
    let reply = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_token(key)
    );
    conn.send(reply.as_bytes());
}

/// Queues a client upgrade request for `uri`.
///
/// `extra_headers` is appended verbatim to the head and must be
/// CRLF-terminated lines when present. The connection needs the HTTP
/// protocol attached; the machine switches to WebSocket when the
/// server's reply arrives.
pub fn send_handshake(conn: &mut Conn, uri: &str, extra_headers: Option<&str>) {
    let nonce: [u8; 16] = rand::random();
    let request = format!(
        "GET {uri} HTTP/1.1\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: {}\r\n\
         {}\r\n",
        BASE64.encode(nonce),
        extra_headers.unwrap_or(""),
    );
    conn.send(request.as_bytes());
}
