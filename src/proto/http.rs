//! HTTP/1.x framing and the HTTP protocol state machine.
//!
//! The parser produces borrowed views into the receive buffer: header
//! names, values, the request line pieces and the body all point at
//! buffered bytes and stay valid for one handler call.
//!
//! The state machine delivers one event per complete message, handles
//! pipelined requests, and swaps itself for the WebSocket machine
//! when an upgrade handshake completes.

use crate::conn::{Conn, ConnFlags, Handler, deliver_user};
use crate::event::Event;
use crate::proto::{Proto, ws};

use std::mem;

/// Maximum number of headers retained per message; the rest of the
/// head is dropped.
pub const MAX_HEADERS: usize = 40;

/// A message head larger than this closes the connection.
pub const MAX_REQUEST_SIZE: usize = 8192;

/// A parsed HTTP message. All string and byte fields borrow from the
/// connection's receive buffer.
#[derive(Debug, Default)]
pub struct HttpMessage<'a> {
    /// Request method, empty for responses.
    pub method: &'a str,

    /// Request URI with the query string stripped.
    pub uri: &'a str,

    /// Query string portion of the URI, without the `?`.
    pub query_string: &'a str,

    /// Protocol version token, e.g. `HTTP/1.1`.
    pub proto: &'a str,

    /// Response status code, `0` for requests.
    pub resp_code: u16,

    /// Response status text, empty for requests.
    pub resp_status_msg: &'a str,

    /// Header name/value pairs in wire order.
    pub headers: Vec<(&'a str, &'a str)>,

    /// Message body, as far as it is buffered.
    pub body: &'a [u8],
}

impl<'a> HttpMessage<'a> {
    /// Finds a header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|&(_, v)| v)
    }
}

/// Parser verdict for the bytes buffered so far.
#[derive(Debug)]
pub(crate) enum HttpParse<'a> {
    /// Not enough bytes for a full head yet.
    Incomplete,

    /// The bytes cannot be the start of a valid message.
    Invalid,

    /// A complete head was parsed. `body_len` is the declared body
    /// length; `None` means "until the connection closes".
    Complete {
        head_len: usize,
        body_len: Option<usize>,
        msg: HttpMessage<'a>,
    },
}

enum HeadScan {
    Incomplete,
    Invalid,
    Complete(usize),
}

/// Locates the end of the message head (blank line), rejecting
/// non-printable bytes on the way.
fn scan_head(buf: &[u8]) -> HeadScan {
    for (i, &c) in buf.iter().enumerate() {
        if c < 0x20 && c != b'\r' && c != b'\n' {
            return HeadScan::Invalid;
        }
        if c == 0x7f {
            return HeadScan::Invalid;
        }
        if c == b'\n' {
            if buf.len() > i + 1 && buf[i + 1] == b'\n' {
                return HeadScan::Complete(i + 2);
            }
            if buf.len() > i + 2 && buf[i + 1] == b'\r' && buf[i + 2] == b'\n' {
                return HeadScan::Complete(i + 3);
            }
        }
    }
    HeadScan::Incomplete
}

/// Splits off the next token, ending at any byte from `delims`, then
/// skips the run of delimiter bytes that follows it.
fn token<'a>(s: &mut &'a [u8], delims: &[u8]) -> &'a [u8] {
    let end = s
        .iter()
        .position(|b| delims.contains(b))
        .unwrap_or(s.len());
    let tok = &s[..end];

    let mut rest = end;
    while rest < s.len() && delims.contains(&s[rest]) {
        rest += 1;
    }
    *s = &s[rest..];

    tok
}

fn as_str(bytes: &[u8]) -> Option<&str> {
    std::str::from_utf8(bytes).ok()
}

/// Parses an HTTP message head out of `buf`.
///
/// `is_req` selects the request-line grammar; responses use the
/// status-line grammar. The returned message has an empty body; the
/// caller decides how much body is deliverable.
pub(crate) fn parse_http(buf: &[u8], is_req: bool) -> HttpParse<'_> {
    let head_len = match scan_head(buf) {
        HeadScan::Incomplete => return HttpParse::Incomplete,
        HeadScan::Invalid => return HttpParse::Invalid,
        HeadScan::Complete(n) => n,
    };

    let mut s = &buf[..head_len];
    while let Some((&c, rest)) = s.split_first() {
        if c != b' ' && c != b'\r' && c != b'\n' {
            break;
        }
        s = rest;
    }

    let mut msg = HttpMessage::default();

    if is_req {
        let Some(method) = as_str(token(&mut s, b" ")) else {
            return HttpParse::Invalid;
        };
        let Some(uri) = as_str(token(&mut s, b" ")) else {
            return HttpParse::Invalid;
        };
        let Some(proto) = as_str(token(&mut s, b"\r\n")) else {
            return HttpParse::Invalid;
        };

        if method.is_empty() || uri.is_empty() || proto.is_empty() {
            return HttpParse::Invalid;
        }

        msg.method = method;
        msg.proto = proto;
        match uri.split_once('?') {
            Some((path, query)) => {
                msg.uri = path;
                msg.query_string = query;
            }
            None => msg.uri = uri,
        }
    } else {
        let Some(proto) = as_str(token(&mut s, b" ")) else {
            return HttpParse::Invalid;
        };
        if proto.is_empty() {
            return HttpParse::Invalid;
        }
        msg.proto = proto;

        let code_tok = token(&mut s, b" \r\n");
        let code: u16 = match as_str(code_tok).and_then(|t| t.parse().ok()) {
            Some(c) => c,
            None => return HttpParse::Invalid,
        };
        if !(100..600).contains(&code) {
            return HttpParse::Invalid;
        }
        msg.resp_code = code;

        let Some(status) = as_str(token(&mut s, b"\r\n")) else {
            return HttpParse::Invalid;
        };
        msg.resp_status_msg = status;
    }

    let mut content_len: Option<usize> = None;

    for _ in 0..MAX_HEADERS {
        if s.is_empty() || s[0] == b'\r' || s[0] == b'\n' {
            break;
        }

        let Some(name) = as_str(token(&mut s, b": ")) else {
            return HttpParse::Invalid;
        };
        let raw_value = token(&mut s, b"\r\n");
        let Some(value) = as_str(raw_value).map(|v| v.trim_end_matches(' ')) else {
            return HttpParse::Invalid;
        };

        if name.is_empty() {
            break;
        }
        msg.headers.push((name, value));

        if name.eq_ignore_ascii_case("Content-Length") {
            content_len = value.trim().parse().ok();
        }
    }

    let body_len = match content_len {
        Some(n) => Some(n),
        None if is_req => {
            // Without Content-Length only uploads have a body, of
            // unknown length; everything else has none.
            if msg.method.eq_ignore_ascii_case("PUT") || msg.method.eq_ignore_ascii_case("POST") {
                None
            } else {
                Some(0)
            }
        }
        // Responses without Content-Length run until close.
        None => None,
    };

    HttpParse::Complete {
        head_len,
        body_len,
        msg,
    }
}

/// Drives the HTTP state machine for one connection event.
pub(crate) fn http_event(me: &mut Proto, conn: &mut Conn, user: &Handler, ev: Event<'_>) {
    let is_req = conn.listener.is_some();

    match ev {
        Event::Recv { .. } => {
            deliver_user(conn, user, ev);
            drive(me, conn, user, is_req);
        }
        Event::Close => {
            deliver_user(conn, user, Event::Close);
            if !conn.recv_buf.is_empty() {
                finalize(conn, user, is_req);
            }
        }
        other => deliver_user(conn, user, other),
    }
}

/// Parses and delivers as many complete messages as are buffered,
/// switching to the WebSocket machine on upgrade.
fn drive(me: &mut Proto, conn: &mut Conn, user: &Handler, is_req: bool) {
    loop {
        let buf = mem::take(&mut conn.recv_buf);

        let (head_len, body_len, mut msg) = match parse_http(&buf, is_req) {
            HttpParse::Incomplete => {
                conn.recv_buf = buf;
                if conn.recv_buf.len() >= MAX_REQUEST_SIZE {
                    conn.flags |= ConnFlags::CLOSE_IMMEDIATELY;
                }
                return;
            }
            HttpParse::Invalid => {
                conn.recv_buf = buf;
                conn.flags |= ConnFlags::CLOSE_IMMEDIATELY;
                return;
            }
            HttpParse::Complete {
                head_len,
                body_len,
                msg,
            } => (head_len, body_len, msg),
        };

        if is_req {
            if let Some(key) = msg.header("Sec-WebSocket-Key") {
                let key = key.to_owned();
                conn.flags |= ConnFlags::IS_WEBSOCKET;
                deliver_user(conn, user, Event::WsHandshakeRequest { msg: &msg });

                conn.recv_buf = buf;
                conn.recv_buf.remove(head_len);
                *me = Proto::Ws(ws::WsState::default());

                if !conn.flags.contains(ConnFlags::CLOSE_IMMEDIATELY) {
                    // Reply for the handler unless it already did.
                    if conn.send_buf.is_empty() {
                        ws::send_handshake_reply(conn, &key);
                    }
                    deliver_user(conn, user, Event::WsHandshakeDone);
                    if let Proto::Ws(st) = me {
                        ws::deliver_frames(st, conn, user);
                    }
                }
                return;
            }
        } else if msg.header("Sec-WebSocket-Accept").is_some() {
            conn.flags |= ConnFlags::IS_WEBSOCKET;
            conn.recv_buf = buf;
            conn.recv_buf.remove(head_len);
            *me = Proto::Ws(ws::WsState::default());

            deliver_user(conn, user, Event::WsHandshakeDone);
            if let Proto::Ws(st) = me {
                ws::deliver_frames(st, conn, user);
            }
            return;
        }

        let total = body_len.and_then(|n| head_len.checked_add(n));
        match total {
            Some(t) if t <= buf.len() => {
                msg.body = &buf[head_len..t];
                let ev = if is_req {
                    Event::HttpRequest { msg: &msg }
                } else {
                    Event::HttpReply { msg: &msg }
                };
                deliver_user(conn, user, ev);

                conn.recv_buf = buf;
                conn.recv_buf.remove(t);

                if conn.close_or_closing() {
                    return;
                }
            }
            _ => {
                // Waiting for more body bytes, or for the close that
                // ends an unbounded body.
                conn.recv_buf = buf;
                return;
            }
        }
    }
}

/// On close, delivers whatever message is buffered with the remaining
/// bytes as its body.
fn finalize(conn: &mut Conn, user: &Handler, is_req: bool) {
    let buf = mem::take(&mut conn.recv_buf);

    if let HttpParse::Complete {
        head_len, mut msg, ..
    } = parse_http(&buf, is_req)
    {
        msg.body = &buf[head_len..];
        let ev = if is_req {
            Event::HttpRequest { msg: &msg }
        } else {
            Event::HttpReply { msg: &msg }
        };
        deliver_user(conn, user, ev);
    }

    conn.recv_buf = buf;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(buf: &[u8], is_req: bool) -> (usize, Option<usize>, HttpMessage<'_>) {
        match parse_http(buf, is_req) {
            HttpParse::Complete {
                head_len,
                body_len,
                msg,
            } => (head_len, body_len, msg),
            other => panic!("expected complete message, got {other:?}"),
        }
    }

    #[test]
    fn parses_request_line_and_query() {
        let (head_len, body_len, msg) =
            complete(b"GET /search?q=1&p=2 HTTP/1.1\r\nHost: x\r\n\r\n", true);

        assert_eq!(msg.method, "GET");
        assert_eq!(msg.uri, "/search");
        assert_eq!(msg.query_string, "q=1&p=2");
        assert_eq!(msg.proto, "HTTP/1.1");
        assert_eq!(msg.header("host"), Some("x"));
        assert_eq!(head_len, 41);
        assert_eq!(body_len, Some(0));
    }

    #[test]
    fn parses_response_status_line() {
        let (_, body_len, msg) = complete(b"HTTP/1.0 404 Not Found\r\n\r\n", false);

        assert_eq!(msg.proto, "HTTP/1.0");
        assert_eq!(msg.resp_code, 404);
        assert_eq!(msg.resp_status_msg, "Not Found");
        // No Content-Length on a response: body runs until close.
        assert_eq!(body_len, None);
    }

    #[test]
    fn content_length_bounds_the_body() {
        let (head_len, body_len, _) =
            complete(b"POST /u HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello", true);
        assert_eq!(body_len, Some(5));
        assert_eq!(head_len + 5, 44);
    }

    #[test]
    fn upload_without_length_is_unbounded() {
        let (_, body_len, _) = complete(b"PUT /f HTTP/1.1\r\n\r\n", true);
        assert_eq!(body_len, None);
    }

    #[test]
    fn header_values_lose_trailing_spaces() {
        let (_, _, msg) = complete(b"GET / HTTP/1.1\r\nX-Pad: v   \r\n\r\n", true);
        assert_eq!(msg.header("X-Pad"), Some("v"));
    }

    #[test]
    fn bare_lf_terminates_the_head() {
        let (head_len, _, msg) = complete(b"GET / HTTP/1.1\nHost: x\n\n", true);
        assert_eq!(msg.method, "GET");
        assert_eq!(head_len, 24);
    }

    #[test]
    fn incremental_feed_stays_incomplete_until_blank_line() {
        let full = b"GET /p HTTP/1.1\r\nHost: h\r\n\r\n";
        for n in 0..full.len() {
            assert!(
                matches!(parse_http(&full[..n], true), HttpParse::Incomplete),
                "verdict changed early at {n} bytes"
            );
        }
        assert!(matches!(
            parse_http(full, true),
            HttpParse::Complete { .. }
        ));
    }

    #[test]
    fn control_bytes_invalidate_the_head() {
        assert!(matches!(
            parse_http(b"GET /\x01 HTTP/1.1\r\n\r\n", true),
            HttpParse::Invalid
        ));
    }

    #[test]
    fn status_code_out_of_range_is_invalid() {
        assert!(matches!(
            parse_http(b"HTTP/1.1 042 Odd\r\n\r\n", false),
            HttpParse::Invalid
        ));
        assert!(matches!(
            parse_http(b"HTTP/1.1 612 Odd\r\n\r\n", false),
            HttpParse::Invalid
        ));
    }

    #[test]
    fn headers_beyond_the_cap_are_dropped() {
        let mut req = String::from("GET / HTTP/1.1\r\n");
        for i in 0..MAX_HEADERS + 5 {
            req.push_str(&format!("H{i}: v\r\n"));
        }
        req.push_str("\r\n");

        let (_, _, msg) = complete(req.as_bytes(), true);
        assert_eq!(msg.headers.len(), MAX_HEADERS);
    }
}
