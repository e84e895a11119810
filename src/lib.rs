//! Single-threaded, event-driven networking with pluggable protocol
//! state machines.
//!
//! A [`Mgr`] owns a table of connections and drives them all from one
//! thread by repeated [`Mgr::poll`] calls. Each connection carries a
//! handler closure that receives [`Event`] values; attaching a
//! protocol state machine (HTTP/WebSocket, MQTT, DNS, CoAP) upgrades
//! the raw byte events into parsed protocol events.
//!
//! ```no_run
//! use weir::{Event, Mgr, handler};
//! use std::time::Duration;
//!
//! let mut mgr = Mgr::new().unwrap();
//! mgr.bind("tcp://127.0.0.1:8080", handler(|conn, ev| {
//!     if let Event::Recv { .. } = ev {
//!         let echoed = conn.recv_buf.len();
//!         let bytes = conn.recv_buf.to_vec();
//!         conn.send(&bytes);
//!         conn.recv_buf.remove(echoed);
//!     }
//! }))
//! .unwrap();
//!
//! loop {
//!     mgr.poll(Duration::from_millis(100));
//! }
//! ```

mod poll;
mod slab;
mod sys;

pub mod addr;
pub mod buf;
pub mod conn;
pub mod error;
pub mod event;
pub mod mgr;
pub mod proto;
pub mod tls;

pub use addr::{HostPort, ParsedAddr, parse_address};
pub use buf::Buf;
pub use conn::{Conn, ConnFlags, Handler, handler};
pub use error::{ConnectError, Error, Result};
pub use event::Event;
pub use mgr::{Broadcaster, Mgr, MgrConfig};
pub use sys::Transport;
pub use tls::{TlsConfig, TlsFactory, TlsSession, TlsStatus};
