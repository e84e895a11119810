//! End-to-end reactor tests driving real sockets against clients
//! running in plain std threads.

use weir::{Conn, ConnFlags, Event, Mgr, handler};

use std::io::{Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Polls the manager until the client thread finishes or the deadline
/// passes, then joins it.
fn drive_until_done<T>(mgr: &mut Mgr, client: JoinHandle<T>) -> T {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(10) && !client.is_finished() {
        mgr.poll(Duration::from_millis(10));
    }
    client.join().unwrap()
}

#[test]
fn tcp_listener_echoes() {
    let mut mgr = Mgr::new().unwrap();
    let token = mgr
        .bind(
            "tcp://127.0.0.1:0",
            handler(|conn: &mut Conn, ev| {
                if let Event::Recv { .. } = ev {
                    let bytes = conn.recv_buf.to_vec();
                    conn.send(&bytes);
                    conn.recv_buf.clear();
                }
            }),
        )
        .unwrap();
    let addr = mgr.conn(token).unwrap().peer_addr();

    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"hello reactor").unwrap();

        let mut buf = [0u8; 13];
        stream.read_exact(&mut buf).unwrap();
        buf
    });

    let echoed = drive_until_done(&mut mgr, client);
    assert_eq!(&echoed, b"hello reactor");
}

#[test]
fn accepted_connections_know_their_listener() {
    let mut mgr = Mgr::new().unwrap();

    let (tx, rx) = mpsc::channel();
    let token = mgr
        .bind(
            "tcp://127.0.0.1:0",
            handler(move |conn: &mut Conn, ev| {
                if let Event::Accept { peer } = ev {
                    tx.send((conn.token(), conn.listener(), peer)).unwrap();
                }
            }),
        )
        .unwrap();
    let addr = mgr.conn(token).unwrap().peer_addr();

    let client = thread::spawn(move || {
        let _stream = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(50));
    });
    drive_until_done(&mut mgr, client);

    let (accepted_token, listener, peer) = rx.try_recv().unwrap();
    assert_ne!(accepted_token, token);
    assert_eq!(listener, Some(token));
    assert_eq!(peer.ip(), addr.ip());
}

#[test]
fn send_and_close_flushes_first() {
    let mut mgr = Mgr::new().unwrap();
    let token = mgr
        .bind(
            "tcp://127.0.0.1:0",
            handler(|conn: &mut Conn, ev| {
                if let Event::Recv { .. } = ev {
                    conn.send(b"bye");
                    conn.flags |= ConnFlags::SEND_AND_CLOSE;
                }
            }),
        )
        .unwrap();
    let addr = mgr.conn(token).unwrap().peer_addr();

    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"x").unwrap();

        // The reply must arrive in full, then the peer must close.
        let mut all = Vec::new();
        stream.read_to_end(&mut all).unwrap();
        all
    });

    let reply = drive_until_done(&mut mgr, client);
    assert_eq!(reply, b"bye");
}

#[test]
fn recv_limit_applies_backpressure() {
    const LIMIT: usize = 1024;

    let mut mgr = Mgr::new().unwrap();
    let token = mgr
        .bind(
            "tcp://127.0.0.1:0",
            handler(|conn: &mut Conn, ev| {
                // Never consume: the buffer must stop growing at the
                // limit plus at most one read chunk.
                if let Event::Accept { .. } = ev {
                    conn.set_recv_limit(LIMIT);
                }
            }),
        )
        .unwrap();
    let addr = mgr.conn(token).unwrap().peer_addr();

    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_write_timeout(Some(Duration::from_millis(200)))
            .unwrap();

        // Push until the kernel buffers fill up; a timeout here means
        // the reactor stopped reading.
        let chunk = [0u8; 4096];
        loop {
            match stream.write(&chunk) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });
    drive_until_done(&mut mgr, client);

    let buffered = mgr
        .tokens()
        .into_iter()
        .filter(|&t| t != token)
        .filter_map(|t| mgr.conn(t).map(|c| c.recv_buf.len()))
        .max()
        .unwrap();
    assert!(buffered >= LIMIT, "peer data never arrived");
    assert!(
        buffered < LIMIT + 2048,
        "recv buffer grew past the limit: {buffered}"
    );
}

#[test]
fn outbound_connect_completes() {
    let mut mgr = Mgr::new().unwrap();
    let listener = mgr
        .bind(
            "tcp://127.0.0.1:0",
            handler(|conn: &mut Conn, ev| {
                if let Event::Recv { .. } = ev {
                    let bytes = conn.recv_buf.to_vec();
                    conn.send(&bytes);
                    conn.recv_buf.clear();
                }
            }),
        )
        .unwrap();
    let addr = mgr.conn(listener).unwrap().peer_addr();

    let got = Rc::new(std::cell::RefCell::new(Vec::new()));
    let sink = got.clone();
    mgr.connect(
        &format!("tcp://{addr}"),
        handler(move |conn: &mut Conn, ev| match ev {
            Event::Connect { result } => {
                assert!(result.is_ok());
                conn.send(b"ping");
            }
            Event::Recv { .. } => {
                sink.borrow_mut().extend_from_slice(&conn.recv_buf);
                conn.recv_buf.clear();
            }
            _ => {}
        }),
    )
    .unwrap();

    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(10) && got.borrow().len() < 4 {
        mgr.poll(Duration::from_millis(10));
    }

    assert_eq!(*got.borrow(), b"ping");
}

#[test]
fn connect_to_dead_port_reports_failure() {
    let mut mgr = Mgr::new().unwrap();

    // Bind and drop so the port is known-dead.
    let dead = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap()
    };

    let failed = Rc::new(std::cell::RefCell::new(false));
    let seen = failed.clone();
    let result = mgr.connect(
        &format!("tcp://{dead}"),
        handler(move |_, ev| {
            if let Event::Connect { result: Err(_) } = ev {
                *seen.borrow_mut() = true;
            }
        }),
    );

    // A synchronous refusal also reports through the handler before
    // `connect` returns.
    if result.is_ok() {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(10) && !*failed.borrow() {
            mgr.poll(Duration::from_millis(10));
        }
    }

    assert!(*failed.borrow());
}

#[test]
fn broadcast_wakes_a_blocked_poll() {
    let mut mgr = Mgr::new().unwrap();
    mgr.bind("tcp://127.0.0.1:0", handler(|_, _| {})).unwrap();

    let caster = mgr.broadcast_handle();
    let sender = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        caster.broadcast(|conn, ev| {
            if let Event::Broadcast { data } = ev {
                assert_eq!(data, b"wake");
                conn.flags |= ConnFlags::USER_1;
            }
        }, b"wake");
    });

    let start = Instant::now();
    mgr.poll(Duration::from_secs(30));
    assert!(start.elapsed() < Duration::from_secs(5), "poll never woke");
    sender.join().unwrap();

    let token = mgr.tokens()[0];
    assert!(mgr.conn(token).unwrap().flags.contains(ConnFlags::USER_1));
}

#[test]
fn udp_listener_replies_to_sender() {
    let mut mgr = Mgr::new().unwrap();
    let token = mgr
        .bind(
            "udp://127.0.0.1:0",
            handler(|conn: &mut Conn, ev| {
                if let Event::Recv { .. } = ev {
                    let bytes = conn.recv_buf.to_vec();
                    conn.send(&bytes);
                    conn.recv_buf.clear();
                }
            }),
        )
        .unwrap();
    let addr = mgr.conn(token).unwrap().peer_addr();

    let client = thread::spawn(move || {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        socket.send_to(b"datagram", addr).unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = socket.recv_from(&mut buf).unwrap();
        buf[..n].to_vec()
    });

    let reply = drive_until_done(&mut mgr, client);
    assert_eq!(reply, b"datagram");
}
