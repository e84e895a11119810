//! Protocol state machines attachable to connections.
//!
//! A protocol sits between the reactor and the user handler: raw
//! transport events pass through it, and whenever a complete protocol
//! unit is buffered it emits the corresponding protocol event. The
//! HTTP machine swaps itself for the WebSocket machine when an
//! upgrade completes.

pub mod coap;
pub mod dns;
pub mod http;
pub mod mqtt;
pub mod resolver;
pub mod ws;

use crate::conn::{Conn, Handler};
use crate::event::Event;

/// Protocol state attached to a connection.
pub(crate) enum Proto {
    Http,
    Ws(ws::WsState),
    Mqtt,
    Dns,
    Coap,
    Resolver(resolver::ResolverState),
}

impl Proto {
    /// Returns the fresh protocol state an accepted connection or
    /// datagram pseudo-connection inherits from its listener.
    pub(crate) fn inherit(&self) -> Option<Proto> {
        match self {
            // Accepted connections always start with the handshake
            // machine, even if the listener already upgraded.
            Proto::Http | Proto::Ws(_) => Some(Proto::Http),
            Proto::Mqtt => Some(Proto::Mqtt),
            Proto::Dns => Some(Proto::Dns),
            Proto::Coap => Some(Proto::Coap),
            Proto::Resolver(_) => None,
        }
    }

    /// Routes one event through the protocol machine.
    pub(crate) fn on_event(&mut self, conn: &mut Conn, user: &Handler, ev: Event<'_>) {
        match self {
            Proto::Http => http::http_event(self, conn, user, ev),
            Proto::Ws(_) => ws::ws_event(self, conn, user, ev),
            Proto::Mqtt => mqtt::mqtt_event(conn, user, ev),
            Proto::Dns => dns::dns_event(conn, user, ev),
            Proto::Coap => coap::coap_event(conn, user, ev),
            Proto::Resolver(_) => resolver::resolver_event(self, conn, ev),
        }
    }
}
