//! Connection state and event delivery.
//!
//! A [`Conn`] bundles a socket with its receive/send buffers, a flag
//! word, an optional protocol state machine, and the user handler
//! closure. Accepted connections share the listener's handler through
//! a reference-counted cell, so one closure can serve a listener and
//! every connection it spawns.

use crate::buf::Buf;
use crate::error::Error;
use crate::event::Event;
use crate::proto::Proto;
use crate::sys::sys_sendto;
use crate::tls::{TlsConfig, TlsFactory, TlsSession};

use bitflags::bitflags;
use std::cell::RefCell;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Instant;

bitflags! {
    /// Per-connection state and control flags.
    ///
    /// The reactor maintains the state flags; handlers communicate
    /// back through the control flags (`SEND_AND_CLOSE`,
    /// `CLOSE_IMMEDIATELY`, `DONT_SEND`, `WS_NO_DEFRAG`). The `USER_*`
    /// bits are reserved for application use and never touched by the
    /// crate.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConnFlags: u32 {
        /// Accepting connections or datagrams.
        const LISTENING = 1 << 0;
        /// Datagram transport.
        const UDP = 1 << 1;
        /// Parked while a hostname lookup is in flight.
        const RESOLVING = 1 << 2;
        /// Non-blocking connect still in progress.
        const CONNECTING = 1 << 3;
        /// TLS handshake finished.
        const TLS_HANDSHAKE_DONE = 1 << 4;
        /// TLS layer needs socket readability.
        const WANT_READ = 1 << 5;
        /// TLS layer needs socket writability.
        const WANT_WRITE = 1 << 6;
        /// Connection upgraded to WebSocket.
        const IS_WEBSOCKET = 1 << 7;

        /// Flush the send buffer, then close.
        const SEND_AND_CLOSE = 1 << 10;
        /// Suppress writes while set.
        const DONT_SEND = 1 << 11;
        /// Close without flushing.
        const CLOSE_IMMEDIATELY = 1 << 12;
        /// Deliver WebSocket fragments without reassembly.
        const WS_NO_DEFRAG = 1 << 13;

        const USER_1 = 1 << 20;
        const USER_2 = 1 << 21;
        const USER_3 = 1 << 22;
        const USER_4 = 1 << 23;
        const USER_5 = 1 << 24;
        const USER_6 = 1 << 25;
    }
}

/// Handler closure shared between a listener and the connections it
/// spawns.
pub type Handler = Rc<RefCell<dyn FnMut(&mut Conn, Event<'_>)>>;

/// Wraps a closure into the shared [`Handler`] form.
pub fn handler(f: impl FnMut(&mut Conn, Event<'_>) + 'static) -> Handler {
    Rc::new(RefCell::new(f))
}

/// One connection managed by the reactor.
pub struct Conn {
    /// Slab token; stable for the life of the connection.
    pub(crate) token: usize,

    /// Manager-wide sequence number, telling apart connections that
    /// reuse the same token.
    pub(crate) id: u64,

    /// Socket descriptor, `-1` while parked for resolution.
    pub(crate) fd: RawFd,

    /// Peer address for outbound and accepted connections, local
    /// address for listeners.
    pub sa: SocketAddr,

    /// Bytes received and not yet consumed.
    pub recv_buf: Buf,

    /// Bytes queued for transmission.
    pub send_buf: Buf,

    /// Receive buffer cap; reads pause once `recv_buf` reaches it.
    pub(crate) recv_limit: usize,

    /// State and control flags.
    pub flags: ConnFlags,

    /// Time of the last socket read or write.
    pub(crate) last_io: Instant,

    pub(crate) proto: Option<Proto>,
    pub(crate) handler: Option<Handler>,
    pub(crate) tls: Option<Box<dyn TlsSession>>,
    pub(crate) tls_factory: Option<Rc<dyn TlsFactory>>,
    pub(crate) tls_config: TlsConfig,

    /// Token of the spawning listener, for accepted connections.
    pub(crate) listener: Option<usize>,
}

impl Conn {
    pub(crate) fn new(handler: Handler) -> Self {
        Self {
            token: usize::MAX,
            id: 0,
            fd: -1,
            sa: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            recv_buf: Buf::new(),
            send_buf: Buf::new(),
            recv_limit: usize::MAX,
            flags: ConnFlags::empty(),
            last_io: Instant::now(),
            proto: None,
            handler: Some(handler),
            tls: None,
            tls_factory: None,
            tls_config: TlsConfig::default(),
            listener: None,
        }
    }

    /// Returns the slab token identifying this connection.
    pub fn token(&self) -> usize {
        self.token
    }

    /// Returns the peer address (local address for listeners).
    pub fn peer_addr(&self) -> SocketAddr {
        self.sa
    }

    /// Returns the token of the listener this connection came from.
    pub fn listener(&self) -> Option<usize> {
        self.listener
    }

    /// Returns the time of the last socket read or write.
    pub fn last_io(&self) -> Instant {
        self.last_io
    }

    /// Caps the receive buffer at `limit` bytes.
    ///
    /// Once the buffer reaches the cap the reactor stops expressing
    /// read interest, pushing backpressure to the peer. On a
    /// listener, the cap is inherited by accepted connections.
    pub fn set_recv_limit(&mut self, limit: usize) {
        self.recv_limit = limit;
    }

    /// Returns the current receive buffer cap.
    pub fn recv_limit(&self) -> usize {
        self.recv_limit
    }

    /// Queues `data` for transmission.
    ///
    /// On stream connections the bytes are appended to the send
    /// buffer and flushed by the reactor as the socket allows. On
    /// datagram connections the bytes are sent immediately as one
    /// datagram. Returns the number of bytes accepted.
    pub fn send(&mut self, data: &[u8]) -> usize {
        if self.flags.contains(ConnFlags::UDP) {
            match sys_sendto(self.fd, data, &self.sa) {
                Ok(n) => n,
                Err(_) => 0,
            }
        } else {
            self.send_buf.append(data)
        }
    }

    /// Attaches the HTTP/WebSocket protocol state machine.
    pub fn set_proto_http(&mut self) {
        self.proto = Some(Proto::Http);
    }

    /// Attaches the MQTT protocol state machine.
    pub fn set_proto_mqtt(&mut self) {
        self.proto = Some(Proto::Mqtt);
    }

    /// Attaches the DNS server protocol state machine.
    pub fn set_proto_dns(&mut self) {
        self.proto = Some(Proto::Dns);
    }

    /// Attaches the CoAP protocol state machine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UdpRequired`] on a stream connection; CoAP
    /// framing assumes datagram boundaries.
    pub fn set_proto_coap(&mut self) -> Result<(), Error> {
        if !self.flags.contains(ConnFlags::UDP) {
            return Err(Error::UdpRequired);
        }
        self.proto = Some(Proto::Coap);
        Ok(())
    }

    /// Installs a TLS factory and its certificate material on this
    /// connection.
    ///
    /// On a listener, accepted connections get a server session each,
    /// created from the same factory and config. On an outbound
    /// connection the client session is created when the socket
    /// exists and the handshake is driven by the reactor.
    pub fn set_tls(&mut self, factory: Rc<dyn TlsFactory>, config: TlsConfig) {
        self.tls_factory = Some(factory);
        self.tls_config = config;
    }

    /// Whether a TLS factory or live session is attached.
    pub fn is_tls(&self) -> bool {
        self.tls.is_some() || self.tls_factory.is_some()
    }

    pub(crate) fn close_or_closing(&self) -> bool {
        self.flags
            .intersects(ConnFlags::CLOSE_IMMEDIATELY | ConnFlags::SEND_AND_CLOSE)
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("token", &self.token)
            .field("fd", &self.fd)
            .field("sa", &self.sa)
            .field("flags", &self.flags)
            .field("recv", &self.recv_buf.len())
            .field("send", &self.send_buf.len())
            .finish()
    }
}

/// Runs one event through the connection's protocol layer (if any)
/// and user handler.
///
/// The protocol state machine is taken out of the connection for the
/// duration of the call so it can hand `&mut Conn` to the user
/// handler without aliasing itself. A handler that attaches a new
/// protocol during the event wins over the restore.
pub(crate) fn deliver(conn: &mut Conn, ev: Event<'_>) {
    let Some(user) = conn.handler.clone() else {
        return;
    };

    let mut proto = conn.proto.take();
    match proto.as_mut() {
        Some(p) => p.on_event(conn, &user, ev),
        None => (&mut *user.borrow_mut())(conn, ev),
    }

    if conn.proto.is_none() {
        conn.proto = proto;
    }
}

/// Invokes the user handler directly, bypassing the protocol layer.
pub(crate) fn deliver_user(conn: &mut Conn, user: &Handler, ev: Event<'_>) {
    (&mut *user.borrow_mut())(conn, ev);
}
