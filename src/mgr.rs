//! The event manager: connection table, readiness loop, and event
//! dispatch.
//!
//! A [`Mgr`] owns every connection and drives them all from a single
//! thread through repeated [`poll`](Mgr::poll) calls. One pass ticks
//! every connection with [`Event::Poll`], waits for socket readiness,
//! performs the pending reads, writes, accepts and connect
//! completions, and finally destroys connections whose close flags
//! are set.
//!
//! The manager itself is single-threaded. The one cross-thread entry
//! point is the [`Broadcaster`] returned by
//! [`broadcast_handle`](Mgr::broadcast_handle), which queues a
//! callback for every connection and interrupts a blocking poll.

use crate::addr::{HostPort, parse_address};
use crate::conn::{Conn, ConnFlags, Handler, deliver};
use crate::error::{ConnectError, Error, Result};
use crate::event::Event;
use crate::poll::{Interest, PollEvent, Poller, Waker};
use crate::proto::Proto;
use crate::proto::dns::RecordType;
use crate::proto::resolver::{
    self, DEFAULT_NAMESERVER, ResolveCallback, ResolveOptions, ResolverState,
};
use crate::slab::Slab;
use crate::sys::{
    Transport, connect_in_progress, sys_accept, sys_bind, sys_close, sys_connect, sys_domain,
    sys_listen, sys_peername, sys_read, sys_recvfrom, sys_set_nonblocking, sys_set_reuseaddr,
    sys_sockname, sys_socket, sys_write,
};
use crate::tls::TlsStatus;

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::fd::RawFd;
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

/// Upper bound on a broadcast payload.
const CTL_MSG_MAX: usize = 8192;

/// Chunk size for stream reads.
const READ_BUF_SIZE: usize = 2048;

/// Receive buffer for a single datagram.
const UDP_BUF_SIZE: usize = 1500;

/// Handler-set flags that a transient datagram connection propagates
/// back to its listener.
const SYNC_FLAGS: ConnFlags = ConnFlags::SEND_AND_CLOSE
    .union(ConnFlags::DONT_SEND)
    .union(ConnFlags::CLOSE_IMMEDIATELY)
    .union(ConnFlags::USER_1)
    .union(ConnFlags::USER_2)
    .union(ConnFlags::USER_3)
    .union(ConnFlags::USER_4)
    .union(ConnFlags::USER_5)
    .union(ConnFlags::USER_6);

/// Manager construction options.
#[derive(Debug, Clone, Default)]
pub struct MgrConfig {
    /// Nameserver used for hostname lookups, e.g. `udp://1.1.1.1:53`.
    /// When unset, `/etc/resolv.conf` is consulted and a public
    /// resolver used as the last resort.
    pub dns_server: Option<String>,
}

/// One queued broadcast: a callback to run against every connection,
/// plus its payload.
struct CtlMsg {
    cb: Box<dyn FnMut(&mut Conn, Event<'_>) + Send>,
    data: Vec<u8>,
}

/// Cross-thread handle that posts a callback to every connection of a
/// manager.
///
/// The callback runs on the manager thread during the next poll pass,
/// receiving each connection and an [`Event::Broadcast`] carrying the
/// payload. Payloads are truncated to 8 KiB.
pub struct Broadcaster {
    tx: mpsc::Sender<CtlMsg>,
    waker: Arc<Waker>,
}

impl Broadcaster {
    /// Queues `cb` to run for every connection with `data` attached,
    /// and wakes the manager if it is blocked in a poll.
    pub fn broadcast(
        &self,
        cb: impl FnMut(&mut Conn, Event<'_>) + Send + 'static,
        data: &[u8],
    ) {
        let data = data[..data.len().min(CTL_MSG_MAX)].to_vec();
        let msg = CtlMsg {
            cb: Box::new(cb),
            data,
        };

        if self.tx.send(msg).is_ok() {
            self.waker.wake();
        }
    }
}

/// Connection manager and event loop.
pub struct Mgr {
    conns: Slab<Conn>,
    poller: Poller,
    events: Vec<PollEvent>,

    tx: mpsc::Sender<CtlMsg>,
    rx: mpsc::Receiver<CtlMsg>,

    dns_server: Option<String>,

    /// Source of per-connection sequence numbers.
    next_id: u64,
}

impl Mgr {
    /// Creates a manager with default configuration.
    ///
    /// # Errors
    ///
    /// Fails when the internal wake-up descriptor cannot be created.
    pub fn new() -> Result<Self> {
        Self::with_config(MgrConfig::default())
    }

    /// Creates a manager with the given configuration.
    ///
    /// # Errors
    ///
    /// Fails when the internal wake-up descriptor cannot be created.
    pub fn with_config(config: MgrConfig) -> Result<Self> {
        let poller = Poller::new()?;
        let (tx, rx) = mpsc::channel();

        Ok(Self {
            conns: Slab::new(),
            poller,
            events: Vec::new(),
            tx,
            rx,
            dns_server: config.dns_server,
            next_id: 1,
        })
    }

    /// Returns a cross-thread broadcast handle.
    pub fn broadcast_handle(&self) -> Broadcaster {
        Broadcaster {
            tx: self.tx.clone(),
            waker: self.poller.waker(),
        }
    }

    /// Returns a connection by token.
    pub fn conn(&self, token: usize) -> Option<&Conn> {
        self.conns.get(token)
    }

    /// Returns a connection by token, mutably.
    pub fn conn_mut(&mut self, token: usize) -> Option<&mut Conn> {
        self.conns.get_mut(token)
    }

    /// Returns the tokens of all live connections.
    pub fn tokens(&self) -> Vec<usize> {
        self.conns.indices()
    }

    /// Returns the number of live connections.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Whether the manager has no live connections.
    pub fn is_empty(&self) -> bool {
        self.conns.len() == 0
    }

    /// Creates a listening connection on `address`
    /// (`[PROTO://][HOST]:PORT`).
    ///
    /// TCP listeners accept connections; each accepted connection
    /// inherits the handler, the protocol state machine, the receive
    /// limit, and the TLS factory of the listener. UDP listeners
    /// deliver each datagram through a transient connection addressed
    /// at the sender.
    ///
    /// Binding port `0` picks an ephemeral port; the actual address is
    /// available through [`Conn::peer_addr`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Addr`] for a malformed or non-numeric address
    /// and [`Error::Io`] when socket setup fails.
    pub fn bind(&mut self, address: &str, handler: Handler) -> Result<usize> {
        let parsed = parse_address(address)?;
        let HostPort::Addr(sa) = parsed.host else {
            return Err(Error::Addr(address.to_string()));
        };

        let fd = sys_socket(sys_domain(&sa), parsed.transport)?;

        let setup = sys_set_reuseaddr(fd)
            .and_then(|_| sys_bind(fd, &sa))
            .and_then(|_| match parsed.transport {
                Transport::Tcp => sys_listen(fd),
                Transport::Udp => Ok(()),
            })
            .and_then(|_| sys_sockname(fd));

        let local = match setup {
            Ok(local) => local,
            Err(e) => {
                sys_close(fd);
                return Err(Error::Io(e));
            }
        };

        let mut conn = Conn::new(handler);
        conn.fd = fd;
        conn.sa = local;
        conn.flags = ConnFlags::LISTENING;
        if parsed.transport == Transport::Udp {
            conn.flags |= ConnFlags::UDP;
        }

        let token = self.install(conn);
        tracing::debug!(token, addr = %local, "listening");
        Ok(token)
    }

    /// Creates an outbound connection to `address`
    /// (`[PROTO://]HOST:PORT`).
    ///
    /// With a numeric host the connection starts immediately; a
    /// hostname first goes through an asynchronous DNS lookup, during
    /// which the connection exists but has no socket. Either way the
    /// handler is told the outcome through [`Event::Connect`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Addr`] for a malformed address, [`Error::Io`]
    /// when the socket cannot be created or the connect fails
    /// outright, and [`Error::Resolve`] when the lookup cannot be
    /// scheduled. Asynchronous failures are reported through
    /// [`Event::Connect`] instead.
    pub fn connect(&mut self, address: &str, handler: Handler) -> Result<usize> {
        let parsed = parse_address(address)?;

        match parsed.host {
            HostPort::Addr(sa) => self.connect_addr(parsed.transport, sa, handler),
            HostPort::Name(name, port) => {
                // Park the connection so the caller gets a stable
                // token before the lookup completes.
                let mut conn = Conn::new(handler);
                conn.sa = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
                conn.flags = ConnFlags::RESOLVING;
                if parsed.transport == Transport::Udp {
                    conn.flags |= ConnFlags::UDP;
                }
                let token = self.install(conn);
                let id = self.conns.get(token).map_or(0, |c| c.id);
                tracing::debug!(token, host = %name, "resolving");

                let scheduled = self.resolve(
                    &name,
                    RecordType::A,
                    Box::new(move |mgr, msg| match msg.and_then(|m| m.first_ip()) {
                        Some(ip) => mgr.finish_connect_resolved(token, id, ip),
                        None => mgr.fail_connect(token, id),
                    }),
                );

                if scheduled.is_err() {
                    self.fail_connect(token, id);
                    return Err(Error::Resolve);
                }

                Ok(token)
            }
        }
    }

    fn connect_addr(
        &mut self,
        transport: Transport,
        sa: SocketAddr,
        handler: Handler,
    ) -> Result<usize> {
        let fd = sys_socket(sys_domain(&sa), transport)?;

        let mut conn = Conn::new(handler);
        conn.fd = fd;
        conn.sa = sa;

        let mut connected = false;
        match transport {
            // Datagram sockets are usable right away; the peer
            // address is applied per send.
            Transport::Udp => {
                conn.flags |= ConnFlags::UDP;
                connected = true;
            }
            Transport::Tcp => match sys_connect(fd, &sa) {
                Ok(()) => connected = true,
                Err(e) if connect_in_progress(&e) => {
                    conn.flags |= ConnFlags::CONNECTING;
                }
                Err(e) => {
                    let errno = e.raw_os_error().unwrap_or(-1);
                    deliver(&mut conn, Event::Connect {
                        result: Err(ConnectError::Os(errno)),
                    });
                    deliver(&mut conn, Event::Close);
                    sys_close(fd);
                    return Err(Error::Io(e));
                }
            },
        }

        let token = self.install(conn);
        tracing::debug!(token, addr = %sa, "connecting");

        if connected {
            self.dispatch(token, Event::Connect { result: Ok(()) });
        }

        Ok(token)
    }

    /// Wraps an already-connected socket into a managed connection.
    ///
    /// The descriptor is switched to non-blocking mode and owned by
    /// the manager from here on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the descriptor cannot be made
    /// non-blocking.
    pub fn add_socket(&mut self, fd: RawFd, handler: Handler) -> Result<usize> {
        sys_set_nonblocking(fd)?;

        let mut conn = Conn::new(handler);
        conn.fd = fd;
        if let Ok(peer) = sys_peername(fd) {
            conn.sa = peer;
        }

        Ok(self.install(conn))
    }

    /// Starts an asynchronous DNS lookup with default options.
    ///
    /// The callback runs on a later poll pass with the parsed reply,
    /// or `None` when every attempt timed out or no reply could be
    /// parsed. A reply with an empty answer section is delivered as a
    /// message, distinct from a timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Resolve`] when no numeric nameserver address
    /// is available.
    pub fn resolve(&mut self, name: &str, rtype: RecordType, cb: ResolveCallback) -> Result<usize> {
        self.resolve_opt(name, rtype, ResolveOptions::default(), cb)
    }

    /// Starts an asynchronous DNS lookup with explicit options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Resolve`] when no numeric nameserver address
    /// is available, or an address/socket error from connecting to
    /// the nameserver.
    pub fn resolve_opt(
        &mut self,
        name: &str,
        rtype: RecordType,
        opts: ResolveOptions,
        cb: ResolveCallback,
    ) -> Result<usize> {
        let nameserver = opts
            .nameserver
            .clone()
            .or_else(|| self.dns_server.clone())
            .or_else(resolver::discover_nameserver)
            .unwrap_or_else(|| DEFAULT_NAMESERVER.to_string());

        // The nameserver itself must be numeric, otherwise lookups
        // would recurse.
        let parsed = parse_address(&nameserver)?;
        let HostPort::Addr(sa) = parsed.host else {
            return Err(Error::Resolve);
        };

        let state = ResolverState::new(name.to_string(), rtype, &opts, cb);
        let token = self.connect_addr(parsed.transport, sa, crate::conn::handler(|_, _| {}))?;

        if let Some(conn) = self.conns.get_mut(token) {
            conn.proto = Some(Proto::Resolver(state));
        }

        tracing::debug!(token, %name, %sa, "lookup started");
        Ok(token)
    }

    /// Runs one reactor pass, waiting at most `timeout` for socket
    /// activity.
    ///
    /// A pass ticks every non-listening, non-connecting connection
    /// with [`Event::Poll`], waits for readiness, services the ready
    /// sockets, runs at most one queued broadcast, and destroys
    /// connections flagged for close. Returns the pass timestamp.
    pub fn poll(&mut self, timeout: Duration) -> Instant {
        let now = Instant::now();

        for token in self.conns.indices() {
            let tick = self.conns.get(token).is_some_and(|c| {
                !c.flags
                    .intersects(ConnFlags::LISTENING | ConnFlags::CONNECTING)
            });
            if tick {
                self.dispatch(token, Event::Poll { now });
            }
        }

        self.sweep_closed();

        self.poller.begin_pass();
        for token in self.conns.indices() {
            let Some(conn) = self.conns.get(token) else {
                continue;
            };
            // Parked for resolution: no socket yet.
            if conn.fd < 0 {
                continue;
            }

            let flags = conn.flags;
            let interest = Interest {
                read: !flags.contains(ConnFlags::WANT_WRITE)
                    && conn.recv_buf.len() < conn.recv_limit,
                write: (flags.contains(ConnFlags::CONNECTING)
                    && !flags.contains(ConnFlags::WANT_READ))
                    || flags.contains(ConnFlags::WANT_WRITE)
                    || (!conn.send_buf.is_empty()
                        && !flags.contains(ConnFlags::CONNECTING)
                        && !flags.contains(ConnFlags::DONT_SEND)),
            };
            self.poller.watch(conn.fd, token, interest);
        }

        if let Err(e) = self.poller.wait(&mut self.events, timeout) {
            tracing::debug!(error = %e, "wait failed");
        }

        let now = Instant::now();

        // Eventfd wakes coalesce, so the queue is checked every pass;
        // a message queued behind another runs on the following pass.
        self.run_one_broadcast();

        let events = mem::take(&mut self.events);
        for pe in &events {
            if pe.readable {
                self.handle_read(pe.token, now);
            }
            if pe.writable {
                self.handle_write(pe.token, now);
            }
        }
        self.events = events;

        self.sweep_closed();

        now
    }

    /// Inserts a connection and stamps its token and sequence number.
    fn install(&mut self, conn: Conn) -> usize {
        let token = self.conns.insert(conn);
        let id = self.next_id;
        self.next_id += 1;
        if let Some(c) = self.conns.get_mut(token) {
            c.token = token;
            c.id = id;
        }
        token
    }

    /// Takes a connection out of the table, delivers one event, and
    /// puts it back.
    fn dispatch(&mut self, token: usize, ev: Event<'_>) {
        let Some(mut conn) = self.conns.take(token) else {
            return;
        };
        deliver(&mut conn, ev);
        self.conns.restore(token, conn);
    }

    /// Runs at most one queued broadcast against every connection.
    ///
    /// One message per pass keeps a chatty broadcaster from starving
    /// socket traffic.
    fn run_one_broadcast(&mut self) {
        let Ok(mut msg) = self.rx.try_recv() else {
            return;
        };

        for token in self.conns.indices() {
            let Some(mut conn) = self.conns.take(token) else {
                continue;
            };
            (msg.cb)(&mut conn, Event::Broadcast { data: &msg.data });
            self.conns.restore(token, conn);
        }
    }

    fn handle_read(&mut self, token: usize, now: Instant) {
        let flags = match self.conns.get(token) {
            Some(c) => c.flags,
            None => return,
        };

        if flags.contains(ConnFlags::LISTENING) {
            if flags.contains(ConnFlags::UDP) {
                self.udp_listener_read(token, now);
            } else {
                self.accept_one(token, now);
            }
            return;
        }

        let Some(mut conn) = self.conns.take(token) else {
            return;
        };

        if conn.flags.contains(ConnFlags::CONNECTING) {
            finish_connect(&mut conn, now);
        } else if conn.flags.contains(ConnFlags::UDP) {
            udp_read(&mut conn, now);
        } else if conn.tls.is_some() && !conn.flags.contains(ConnFlags::TLS_HANDSHAKE_DONE) {
            drive_tls_handshake(&mut conn);
        } else {
            stream_read(&mut conn, now);
        }

        self.conns.restore(token, conn);
    }

    fn handle_write(&mut self, token: usize, now: Instant) {
        let Some(mut conn) = self.conns.take(token) else {
            return;
        };

        if conn.flags.contains(ConnFlags::CONNECTING) {
            finish_connect(&mut conn, now);
        } else if conn.tls.is_some() && !conn.flags.contains(ConnFlags::TLS_HANDSHAKE_DONE) {
            drive_tls_handshake(&mut conn);
        } else if !conn.send_buf.is_empty()
            && !conn
                .flags
                .intersects(ConnFlags::DONT_SEND | ConnFlags::CLOSE_IMMEDIATELY)
        {
            conn.flags.remove(ConnFlags::WANT_WRITE);
            stream_write(&mut conn, now);
        } else {
            conn.flags.remove(ConnFlags::WANT_WRITE);
        }

        self.conns.restore(token, conn);
    }

    /// Accepts one pending connection on a TCP listener.
    ///
    /// One accept per pass; the listener stays readable while more
    /// connections are pending.
    fn accept_one(&mut self, token: usize, now: Instant) {
        let Some(listener) = self.conns.get(token) else {
            return;
        };
        let fd = listener.fd;
        let Some(handler) = listener.handler.clone() else {
            return;
        };
        let proto = listener.proto.as_ref().and_then(Proto::inherit);
        let recv_limit = listener.recv_limit;
        let tls_factory = listener.tls_factory.clone();
        let tls_config = listener.tls_config.clone();

        let (cfd, peer) = match sys_accept(fd) {
            Ok(accepted) => accepted,
            Err(e) => {
                if e.kind() != io::ErrorKind::WouldBlock {
                    tracing::debug!(token, error = %e, "accept failed");
                }
                return;
            }
        };

        let mut conn = Conn::new(handler);
        conn.fd = cfd;
        conn.sa = peer;
        conn.proto = proto;
        conn.recv_limit = recv_limit;
        conn.listener = Some(token);
        conn.last_io = now;

        if let Some(factory) = tls_factory {
            match factory.server_session(cfd, &tls_config) {
                Ok(session) => {
                    conn.tls = Some(session);
                    conn.tls_factory = Some(factory);
                    conn.tls_config = tls_config;
                }
                Err(e) => {
                    tracing::debug!(token, error = %e, "tls session failed");
                    sys_close(cfd);
                    return;
                }
            }
        }

        let ctoken = self.install(conn);
        tracing::debug!(listener = token, token = ctoken, %peer, "accepted");
        self.dispatch(ctoken, Event::Accept { peer });
    }

    /// Receives one datagram on a UDP listener and delivers it
    /// through a transient connection addressed at the sender.
    ///
    /// The transient connection shares the listener's socket, handler
    /// and inherited protocol state; it lives for this one event and
    /// its replies go straight out via `sendto`. Flags the handler
    /// sets on it are carried back onto the listener.
    fn udp_listener_read(&mut self, token: usize, now: Instant) {
        let Some(listener) = self.conns.get(token) else {
            return;
        };
        let fd = listener.fd;
        let Some(handler) = listener.handler.clone() else {
            return;
        };
        let proto = listener.proto.as_ref().and_then(Proto::inherit);
        let recv_limit = listener.recv_limit;

        let mut chunk = [0u8; UDP_BUF_SIZE];
        let (n, from) = match sys_recvfrom(fd, &mut chunk) {
            Ok(datagram) => datagram,
            Err(e) => {
                if e.kind() != io::ErrorKind::WouldBlock {
                    tracing::debug!(token, error = %e, "recvfrom failed");
                }
                return;
            }
        };

        let mut conn = Conn::new(handler);
        conn.token = token;
        conn.fd = fd;
        conn.sa = from;
        conn.proto = proto;
        conn.recv_limit = recv_limit;
        conn.flags = ConnFlags::UDP;
        conn.listener = Some(token);
        conn.last_io = now;
        conn.recv_buf.append(&chunk[..n]);

        tracing::trace!(token, len = n, peer = %from, "datagram");
        deliver(&mut conn, Event::Recv { len: n });

        let sync = conn.flags & SYNC_FLAGS;
        if let Some(listener) = self.conns.get_mut(token) {
            listener.flags |= sync;
        }
    }

    /// Evaluates the close flags of every connection and destroys the
    /// ones due.
    fn sweep_closed(&mut self) {
        for token in self.conns.indices() {
            let due = self.conns.get(token).is_some_and(|c| {
                c.flags.contains(ConnFlags::CLOSE_IMMEDIATELY)
                    || (c.send_buf.is_empty() && c.flags.contains(ConnFlags::SEND_AND_CLOSE))
            });
            if due {
                self.close_conn(token);
            }
        }
    }

    /// Destroys one connection: delivers [`Event::Close`], closes the
    /// socket, frees the token, and completes an attached lookup.
    fn close_conn(&mut self, token: usize) {
        let Some(mut conn) = self.conns.take(token) else {
            return;
        };

        tracing::debug!(token, "closing");
        deliver(&mut conn, Event::Close);

        let proto = conn.proto.take();
        if conn.fd >= 0 {
            sys_close(conn.fd);
        }
        drop(conn);
        self.conns.release(token);

        // The lookup callback runs last so it can freely open new
        // connections, including reusing this token.
        if let Some(Proto::Resolver(state)) = proto {
            state.finish(self);
        }
    }

    /// Completes a parked hostname connection once its lookup
    /// produced an address.
    ///
    /// `id` is the sequence number captured when the lookup started;
    /// a mismatch means the token was released and reused while the
    /// lookup was in flight, and the result is discarded.
    pub(crate) fn finish_connect_resolved(&mut self, token: usize, id: u64, ip: IpAddr) {
        let (port, transport) = match self.conns.get(token) {
            Some(c) if c.id == id && c.flags.contains(ConnFlags::RESOLVING) => (
                c.sa.port(),
                if c.flags.contains(ConnFlags::UDP) {
                    Transport::Udp
                } else {
                    Transport::Tcp
                },
            ),
            // Token reused or connection gone; the lookup outlived it.
            _ => return,
        };

        let sa = SocketAddr::new(ip, port);
        tracing::debug!(token, addr = %sa, "resolved");

        let fd = match sys_socket(sys_domain(&sa), transport) {
            Ok(fd) => fd,
            Err(e) => {
                let errno = e.raw_os_error().unwrap_or(-1);
                self.connect_failed(token, ConnectError::Os(errno));
                return;
            }
        };

        let Some(mut conn) = self.conns.take(token) else {
            sys_close(fd);
            return;
        };
        conn.flags.remove(ConnFlags::RESOLVING);
        conn.fd = fd;
        conn.sa = sa;

        let mut connected = transport == Transport::Udp;
        if transport == Transport::Tcp {
            match sys_connect(fd, &sa) {
                Ok(()) => connected = true,
                Err(e) if connect_in_progress(&e) => {
                    conn.flags.insert(ConnFlags::CONNECTING);
                }
                Err(e) => {
                    let errno = e.raw_os_error().unwrap_or(-1);
                    deliver(&mut conn, Event::Connect {
                        result: Err(ConnectError::Os(errno)),
                    });
                    deliver(&mut conn, Event::Close);
                    sys_close(fd);
                    self.conns.release(token);
                    return;
                }
            }
        }

        self.conns.restore(token, conn);
        if connected {
            self.dispatch(token, Event::Connect { result: Ok(()) });
        }
    }

    /// Fails a parked hostname connection whose lookup produced no
    /// address. A stale `id` (token reused meanwhile) is a no-op.
    pub(crate) fn fail_connect(&mut self, token: usize, id: u64) {
        if self.conns.get(token).is_some_and(|c| c.id == id) {
            self.connect_failed(token, ConnectError::Resolve);
        }
    }

    fn connect_failed(&mut self, token: usize, err: ConnectError) {
        let Some(mut conn) = self.conns.take(token) else {
            return;
        };

        tracing::debug!(token, error = %err, "connect failed");
        deliver(&mut conn, Event::Connect { result: Err(err) });
        deliver(&mut conn, Event::Close);

        if conn.fd >= 0 {
            sys_close(conn.fd);
        }
        self.conns.release(token);
    }
}

impl Drop for Mgr {
    fn drop(&mut self) {
        // One final pass so pending close flags deliver their events
        // before everything is torn down.
        self.poll(Duration::ZERO);
        for token in self.conns.indices() {
            self.close_conn(token);
        }
    }
}

/// Resolves the outcome of a non-blocking connect once the socket
/// reports readiness.
fn finish_connect(conn: &mut Conn, now: Instant) {
    conn.flags.remove(ConnFlags::CONNECTING);
    conn.last_io = now;

    let errno = match crate::sys::sys_take_error(conn.fd) {
        Ok(errno) => errno,
        Err(e) => e.raw_os_error().unwrap_or(-1),
    };

    if errno != 0 {
        tracing::debug!(token = conn.token, errno, "connect failed");
        deliver(conn, Event::Connect {
            result: Err(ConnectError::Os(errno)),
        });
        conn.flags.insert(ConnFlags::CLOSE_IMMEDIATELY);
        return;
    }

    // Client TLS sessions start once the transport is up.
    if conn.tls.is_none() {
        if let Some(factory) = conn.tls_factory.clone() {
            match factory.client_session(conn.fd, &conn.tls_config) {
                Ok(session) => conn.tls = Some(session),
                Err(e) => {
                    let errno = e.raw_os_error().unwrap_or(-1);
                    deliver(conn, Event::Connect {
                        result: Err(ConnectError::Os(errno)),
                    });
                    conn.flags.insert(ConnFlags::CLOSE_IMMEDIATELY);
                    return;
                }
            }
        }
    }

    tracing::debug!(token = conn.token, addr = %conn.sa, "connected");
    deliver(conn, Event::Connect { result: Ok(()) });
}

/// Advances a pending TLS handshake one step, translating its
/// readiness needs into the `WANT_READ`/`WANT_WRITE` flags.
fn drive_tls_handshake(conn: &mut Conn) {
    let server = conn.listener.is_some();
    let Some(tls) = conn.tls.as_mut() else {
        return;
    };

    let step = if server { tls.accept() } else { tls.connect() };

    conn.flags.remove(ConnFlags::WANT_READ | ConnFlags::WANT_WRITE);
    match step {
        Ok(()) => {
            conn.flags.insert(ConnFlags::TLS_HANDSHAKE_DONE);
            tracing::debug!(token = conn.token, "tls handshake done");
        }
        Err(TlsStatus::WantRead) => {
            conn.flags.insert(ConnFlags::WANT_READ);
        }
        Err(TlsStatus::WantWrite) => {
            conn.flags.insert(ConnFlags::WANT_WRITE);
        }
        Err(TlsStatus::Failed) => {
            tracing::debug!(token = conn.token, "tls handshake failed");
            conn.flags.insert(ConnFlags::CLOSE_IMMEDIATELY);
        }
    }
}

enum ReadOutcome {
    Data(usize),
    Eof,
    Again,
    WantWrite,
    Fail,
}

fn read_chunk(conn: &mut Conn, chunk: &mut [u8]) -> ReadOutcome {
    if let Some(tls) = conn.tls.as_mut() {
        match tls.read(chunk) {
            Ok(0) => ReadOutcome::Eof,
            Ok(n) => ReadOutcome::Data(n),
            Err(TlsStatus::WantRead) => ReadOutcome::Again,
            Err(TlsStatus::WantWrite) => ReadOutcome::WantWrite,
            Err(TlsStatus::Failed) => ReadOutcome::Fail,
        }
    } else {
        match sys_read(conn.fd, chunk) {
            Ok(0) => ReadOutcome::Eof,
            Ok(n) => ReadOutcome::Data(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::Again,
            Err(_) => ReadOutcome::Fail,
        }
    }
}

/// Drains a readable stream socket, delivering [`Event::Recv`] per
/// chunk until the socket empties or the receive limit is reached.
fn stream_read(conn: &mut Conn, now: Instant) {
    let mut chunk = [0u8; READ_BUF_SIZE];

    loop {
        if conn.recv_buf.len() >= conn.recv_limit {
            break;
        }

        match read_chunk(conn, &mut chunk) {
            ReadOutcome::Data(n) => {
                conn.recv_buf.append(&chunk[..n]);
                conn.last_io = now;
                tracing::trace!(token = conn.token, len = n, "read");
                deliver(conn, Event::Recv { len: n });
                if conn.flags.contains(ConnFlags::CLOSE_IMMEDIATELY) {
                    break;
                }
            }
            ReadOutcome::Again => break,
            ReadOutcome::WantWrite => {
                conn.flags.insert(ConnFlags::WANT_WRITE);
                break;
            }
            ReadOutcome::Eof | ReadOutcome::Fail => {
                conn.flags.insert(ConnFlags::CLOSE_IMMEDIATELY);
                break;
            }
        }
    }
}

/// Receives one datagram on a connected UDP socket.
fn udp_read(conn: &mut Conn, now: Instant) {
    let mut chunk = [0u8; UDP_BUF_SIZE];

    match sys_recvfrom(conn.fd, &mut chunk) {
        Ok((n, from)) => {
            conn.sa = from;
            conn.recv_buf.append(&chunk[..n]);
            conn.last_io = now;
            tracing::trace!(token = conn.token, len = n, "datagram");
            deliver(conn, Event::Recv { len: n });
        }
        Err(e) => {
            if e.kind() != io::ErrorKind::WouldBlock {
                tracing::debug!(token = conn.token, error = %e, "recvfrom failed");
            }
        }
    }
}

/// Performs one write from the send buffer, delivering
/// [`Event::Sent`] for the bytes flushed.
fn stream_write(conn: &mut Conn, now: Instant) {
    let result = if let Some(tls) = conn.tls.as_mut() {
        match tls.write(&conn.send_buf) {
            Ok(n) => Ok(n),
            Err(TlsStatus::WantRead) => {
                conn.flags.insert(ConnFlags::WANT_READ);
                return;
            }
            Err(TlsStatus::WantWrite) => return,
            Err(TlsStatus::Failed) => Err(()),
        }
    } else {
        match sys_write(conn.fd, &conn.send_buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(_) => Err(()),
        }
    };

    match result {
        Ok(n) if n > 0 => {
            conn.send_buf.remove(n);
            conn.last_io = now;
            tracing::trace!(token = conn.token, len = n, "wrote");
            deliver(conn, Event::Sent { len: n });
        }
        Ok(_) => {}
        Err(()) => {
            conn.flags.insert(ConnFlags::CLOSE_IMMEDIATELY);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::handler;

    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn bind_picks_an_ephemeral_port() {
        let mut mgr = Mgr::new().unwrap();
        let token = mgr.bind("127.0.0.1:0", handler(|_, _| {})).unwrap();

        let addr = mgr.conn(token).unwrap().peer_addr();
        assert_ne!(addr.port(), 0);
        assert!(mgr.conn(token).unwrap().flags.contains(ConnFlags::LISTENING));
    }

    #[test]
    fn bind_rejects_hostnames() {
        let mut mgr = Mgr::new().unwrap();
        let err = mgr.bind("nosuchhost.invalid:1234", handler(|_, _| {}));
        assert!(matches!(err, Err(Error::Addr(_))));
    }

    #[test]
    fn udp_connect_reports_success_immediately() {
        let mut mgr = Mgr::new().unwrap();

        let connected = Rc::new(RefCell::new(false));
        let seen = connected.clone();
        let token = mgr
            .connect(
                "udp://127.0.0.1:9",
                handler(move |_, ev| {
                    if matches!(ev, Event::Connect { result: Ok(()) }) {
                        *seen.borrow_mut() = true;
                    }
                }),
            )
            .unwrap();

        assert!(*connected.borrow());
        assert!(mgr.conn(token).unwrap().flags.contains(ConnFlags::UDP));
    }

    #[test]
    fn close_immediately_destroys_on_next_pass() {
        let mut mgr = Mgr::new().unwrap();

        let closed = Rc::new(RefCell::new(false));
        let seen = closed.clone();
        let token = mgr
            .connect(
                "udp://127.0.0.1:9",
                handler(move |_, ev| {
                    if matches!(ev, Event::Close) {
                        *seen.borrow_mut() = true;
                    }
                }),
            )
            .unwrap();

        mgr.conn_mut(token).unwrap().flags |= ConnFlags::CLOSE_IMMEDIATELY;
        mgr.poll(Duration::from_millis(1));

        assert!(*closed.borrow());
        assert!(mgr.conn(token).is_none());
    }

    #[test]
    fn broadcast_reaches_every_connection() {
        let mut mgr = Mgr::new().unwrap();
        mgr.bind("127.0.0.1:0", handler(|_, _| {})).unwrap();
        mgr.bind("127.0.0.1:0", handler(|_, _| {})).unwrap();

        let hits = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = hits.clone();

        let caster = mgr.broadcast_handle();
        std::thread::spawn(move || {
            caster.broadcast(
                move |conn, ev| {
                    if let Event::Broadcast { data } = ev {
                        sink.lock().unwrap().push((conn.token(), data.to_vec()));
                    }
                },
                b"tick",
            );
        })
        .join()
        .unwrap();

        mgr.poll(Duration::from_secs(2));

        let hits = hits.lock().unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|(_, data)| data == b"tick"));
    }

    #[test]
    fn queued_broadcasts_survive_a_coalesced_wake() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let mut mgr = Mgr::new().unwrap();
        mgr.bind("127.0.0.1:0", handler(|_, _| {})).unwrap();

        // Two messages, one eventfd wake between polls.
        let count = Arc::new(AtomicUsize::new(0));
        let caster = mgr.broadcast_handle();
        for _ in 0..2 {
            let n = count.clone();
            caster.broadcast(
                move |_, _| {
                    n.fetch_add(1, Ordering::SeqCst);
                },
                b"",
            );
        }

        for _ in 0..4 {
            mgr.poll(Duration::from_millis(10));
        }

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stale_lookup_cannot_hijack_a_reused_token() {
        let mut mgr = Mgr::new().unwrap();

        let mut parked = Conn::new(handler(|_, _| {}));
        parked.flags = ConnFlags::RESOLVING;
        let token = mgr.install(parked);
        let stale_id = mgr.conn(token).unwrap().id;

        // Close the parked connection while its lookup is still out,
        // then park another one that reuses the freed token.
        mgr.close_conn(token);
        let mut replacement = Conn::new(handler(|_, _| {}));
        replacement.flags = ConnFlags::RESOLVING;
        let reused = mgr.install(replacement);
        assert_eq!(reused, token);

        mgr.finish_connect_resolved(token, stale_id, IpAddr::V4(Ipv4Addr::LOCALHOST));

        // The replacement stays parked for its own lookup.
        let conn = mgr.conn(token).unwrap();
        assert!(conn.flags.contains(ConnFlags::RESOLVING));
        assert!(conn.fd < 0);

        mgr.fail_connect(token, stale_id);
        assert!(mgr.conn(token).is_some());
    }

    #[test]
    fn accepted_sessions_get_the_listener_tls_config() {
        use crate::tls::{TlsConfig, TlsFactory, TlsSession};
        use std::path::PathBuf;

        // Factory with no real stack behind it; records the config it
        // was handed and declines the session.
        struct Recording(Rc<RefCell<Option<Option<PathBuf>>>>);

        impl TlsFactory for Recording {
            fn server_session(
                &self,
                _fd: RawFd,
                config: &TlsConfig,
            ) -> io::Result<Box<dyn TlsSession>> {
                *self.0.borrow_mut() = Some(config.cert.clone());
                Err(io::Error::other("no stack"))
            }

            fn client_session(
                &self,
                _fd: RawFd,
                _config: &TlsConfig,
            ) -> io::Result<Box<dyn TlsSession>> {
                Err(io::Error::other("no stack"))
            }
        }

        let mut mgr = Mgr::new().unwrap();
        let token = mgr.bind("127.0.0.1:0", handler(|_, _| {})).unwrap();

        let seen: Rc<RefCell<Option<Option<PathBuf>>>> = Rc::default();
        mgr.conn_mut(token).unwrap().set_tls(
            Rc::new(Recording(seen.clone())),
            TlsConfig {
                cert: Some("server.pem".into()),
                ca_cert: None,
            },
        );

        let addr = mgr.conn(token).unwrap().peer_addr();
        let _client = std::net::TcpStream::connect(addr).unwrap();

        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) && seen.borrow().is_none() {
            mgr.poll(Duration::from_millis(10));
        }

        assert_eq!(*seen.borrow(), Some(Some(PathBuf::from("server.pem"))));
    }

    #[test]
    fn resolve_rejects_hostname_nameservers() {
        let mut mgr = Mgr::with_config(MgrConfig {
            dns_server: Some("udp://ns.example.com:53".into()),
        })
        .unwrap();

        let err = mgr.resolve("example.com", RecordType::A, Box::new(|_, _| {}));
        assert!(matches!(err, Err(Error::Resolve)));
    }
}
