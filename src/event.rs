//! Events delivered to connection handlers.
//!
//! Every connection owns a handler closure that receives [`Event`]
//! values from the reactor. Transport events fire on every
//! connection; protocol events fire once a protocol state machine is
//! attached and a complete protocol unit has been parsed out of the
//! receive buffer.
//!
//! Protocol payloads are borrowed views into buffered bytes, valid
//! only for the duration of the handler call.

use crate::error::ConnectError;
use crate::proto::coap::CoapMessage;
use crate::proto::dns::DnsMessage;
use crate::proto::http::HttpMessage;
use crate::proto::mqtt::MqttMessage;
use crate::proto::ws::WsFrame;

use std::net::SocketAddr;
use std::time::Instant;

/// An event delivered to a connection handler.
#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    /// Periodic tick, delivered once per reactor pass.
    Poll { now: Instant },

    /// A listener accepted a new connection; fires on the *accepted*
    /// connection.
    Accept { peer: SocketAddr },

    /// An outbound connection finished, successfully or not.
    Connect { result: Result<(), ConnectError> },

    /// `len` new bytes were appended to the receive buffer.
    Recv { len: usize },

    /// `len` bytes were flushed from the send buffer to the socket.
    Sent { len: usize },

    /// The connection is about to be destroyed.
    Close,

    /// A message posted from another thread through a
    /// [`Broadcaster`](crate::mgr::Broadcaster).
    Broadcast { data: &'a [u8] },

    /// A complete HTTP request was parsed (server side).
    HttpRequest { msg: &'a HttpMessage<'a> },

    /// A complete HTTP response was parsed (client side).
    HttpReply { msg: &'a HttpMessage<'a> },

    /// A WebSocket upgrade request arrived; the handler may reply
    /// itself or leave the 101 response to the reactor.
    WsHandshakeRequest { msg: &'a HttpMessage<'a> },

    /// The WebSocket handshake completed on either side.
    WsHandshakeDone,

    /// A complete WebSocket data frame, unmasked and defragmented.
    WsFrame { frame: &'a WsFrame<'a> },

    /// A WebSocket control frame (ping, pong, close).
    WsControl { frame: &'a WsFrame<'a> },

    /// A complete MQTT message.
    Mqtt { msg: &'a MqttMessage<'a> },

    /// A complete DNS message (server side).
    Dns { msg: &'a DnsMessage<'a> },

    /// A CoAP message, or a parse-level error flagged on the message.
    Coap { msg: &'a CoapMessage<'a> },
}
