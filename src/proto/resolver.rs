//! Asynchronous stub resolver built on the reactor's own machinery.
//!
//! A lookup is an ordinary UDP connection to a nameserver with the
//! resolver state machine attached: the periodic poll event drives
//! the first send and the retransmit/give-up timers, and the first
//! reply (or exhaustion of retries) completes the lookup. The
//! completion callback runs with full access to the reactor, so it
//! can open the connection the lookup was for.

use crate::conn::{Conn, ConnFlags};
use crate::event::Event;
use crate::mgr::Mgr;
use crate::proto::Proto;
use crate::proto::dns::{self, DnsMessage, RecordType};

use std::fs;
use std::mem;
use std::time::{Duration, Instant};

/// Nameserver used when discovery finds nothing.
pub const DEFAULT_NAMESERVER: &str = "udp://8.8.8.8:53";

/// Completion callback of a lookup. `None` means no parseable reply
/// arrived; a reply with an empty answer section is still delivered.
pub type ResolveCallback = Box<dyn FnOnce(&mut Mgr, Option<&DnsMessage<'_>>)>;

/// Tuning knobs for one lookup.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Nameserver address; defaults to the reactor's configured or
    /// discovered one.
    pub nameserver: Option<String>,

    /// Retransmissions after the initial query.
    pub max_retries: usize,

    /// Time to wait for a reply before retransmitting.
    pub timeout: Duration,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            nameserver: None,
            max_retries: 2,
            timeout: Duration::from_secs(5),
        }
    }
}

/// State machine of one in-flight lookup.
pub(crate) struct ResolverState {
    pub(crate) name: String,
    pub(crate) rtype: RecordType,
    pub(crate) cb: Option<ResolveCallback>,
    pub(crate) max_retries: usize,
    pub(crate) timeout: Duration,

    sends: usize,
    last_send: Option<Instant>,

    /// Raw reply packet, kept until the close path parses it.
    reply: Option<Vec<u8>>,
}

impl ResolverState {
    pub(crate) fn new(name: String, rtype: RecordType, opts: &ResolveOptions, cb: ResolveCallback) -> Self {
        Self {
            name,
            rtype,
            cb: Some(cb),
            max_retries: opts.max_retries,
            timeout: opts.timeout,
            sends: 0,
            last_send: None,
            reply: None,
        }
    }

    /// Runs the completion callback. Called by the reactor's close
    /// path, once the lookup connection has left the table.
    pub(crate) fn finish(mut self, mgr: &mut Mgr) {
        let Some(cb) = self.cb.take() else {
            return;
        };

        match self.reply.as_deref().and_then(|pkt| dns::parse_dns(pkt).ok()) {
            Some(msg) => cb(mgr, Some(&msg)),
            None => cb(mgr, None),
        }
    }
}

/// Drives one lookup connection. The user handler on these
/// connections is a placeholder; events terminate here.
pub(crate) fn resolver_event(me: &mut Proto, conn: &mut Conn, ev: Event<'_>) {
    let Proto::Resolver(st) = me else {
        return;
    };

    match ev {
        Event::Poll { now } => {
            if st.sends > st.max_retries {
                tracing::debug!(name = %st.name, "lookup timed out");
                conn.flags |= ConnFlags::CLOSE_IMMEDIATELY;
                return;
            }

            let due = match st.last_send {
                None => true,
                Some(at) => now.duration_since(at) > st.timeout,
            };
            if due {
                dns::send_query(conn, &st.name, st.rtype);
                st.last_send = Some(now);
                st.sends += 1;
            }
        }
        Event::Recv { .. } => {
            let buf = mem::take(&mut conn.recv_buf);

            // Any parseable reply completes the lookup; the caller
            // can tell an empty answer section from no reply at all.
            if dns::parse_dns(&buf).is_ok() {
                st.reply = Some(buf.into_vec());
            }

            conn.flags |= ConnFlags::CLOSE_IMMEDIATELY;
        }
        _ => {}
    }
}

/// Finds the system nameserver in `/etc/resolv.conf`.
pub(crate) fn discover_nameserver() -> Option<String> {
    nameserver_from(&fs::read_to_string("/etc/resolv.conf").ok()?)
}

fn nameserver_from(resolv_conf: &str) -> Option<String> {
    for line in resolv_conf.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        let mut fields = line.split_whitespace();
        if fields.next() == Some("nameserver") {
            if let Some(addr) = fields.next() {
                return Some(format!("udp://{addr}:53"));
            }
        }
    }

    None
}
