//! DNS wire codec and the DNS server protocol state machine.
//!
//! Parsed records keep their name and rdata as byte ranges into the
//! packet, so compressed names can be expanded later against the full
//! packet. Reply composition appends answer records behind the echoed
//! question section and inserts the header last, once the counts are
//! known.

use crate::buf::Buf;
use crate::conn::{Conn, ConnFlags, Handler, deliver_user};
use crate::event::Event;
use crate::sys::sys_sendto;

use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::ops::Range;

/// Parsed questions and answers are capped at this count each.
pub const MAX_RECORDS: usize = 32;

const HEADER_LEN: usize = 12;

/// Flag word of a standard query.
const QUERY_FLAGS: u16 = 0x0100;

/// Bits OR-ed into the flags of a reply: response + recursion
/// available.
const REPLY_FLAGS: u16 = 0x8080;

/// Flag word of a format-error reply.
const ERROR_FLAGS: u16 = 0x8081;

/// Record types the crate composes queries for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RecordType {
    A = 0x01,
    Cname = 0x05,
    Mx = 0x0f,
    Aaaa = 0x1c,
}

/// Which message section a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Question,
    Answer,
}

/// One resource record, with `name` and `rdata` as ranges into the
/// packet it was parsed from.
#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub kind: RecordKind,
    pub name: Range<usize>,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: Range<usize>,
}

/// Interpreted rdata of an answer record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
}

/// A parsed DNS message over its packet bytes.
#[derive(Debug)]
pub struct DnsMessage<'a> {
    /// The raw packet, referenced by record ranges.
    pub pkt: &'a [u8],

    pub transaction_id: u16,
    pub flags: u16,
    pub questions: Vec<DnsRecord>,
    pub answers: Vec<DnsRecord>,
}

/// DNS packet decoding errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DnsError {
    #[error("packet shorter than the DNS header")]
    Truncated,
}

impl<'a> DnsMessage<'a> {
    /// Expands a record's possibly-compressed name to dotted form.
    pub fn name(&self, rr: &DnsRecord) -> Option<String> {
        uncompress(self.pkt, rr.name.start)
    }

    /// Returns the raw rdata bytes of a record.
    pub fn rdata(&self, rr: &DnsRecord) -> &'a [u8] {
        &self.pkt[rr.rdata.clone()]
    }

    /// Interprets the rdata of an answer according to its type.
    pub fn record_data(&self, rr: &DnsRecord) -> Option<RecordData> {
        let data = self.rdata(rr);
        match rr.rtype {
            t if t == RecordType::A as u16 => {
                let octets: [u8; 4] = data.get(..4)?.try_into().ok()?;
                Some(RecordData::A(Ipv4Addr::from(octets)))
            }
            t if t == RecordType::Aaaa as u16 => {
                let octets: [u8; 16] = data.get(..16)?.try_into().ok()?;
                Some(RecordData::Aaaa(Ipv6Addr::from(octets)))
            }
            t if t == RecordType::Cname as u16 => {
                Some(RecordData::Cname(uncompress(self.pkt, rr.rdata.start)?))
            }
            _ => None,
        }
    }

    /// Returns the first answer's address, following no indirection.
    pub fn first_ip(&self) -> Option<std::net::IpAddr> {
        self.answers.iter().find_map(|rr| match self.record_data(rr) {
            Some(RecordData::A(ip)) => Some(std::net::IpAddr::V4(ip)),
            Some(RecordData::Aaaa(ip)) => Some(std::net::IpAddr::V6(ip)),
            _ => None,
        })
    }
}

/// Expands a possibly-compressed name starting at `pos`.
fn uncompress(pkt: &[u8], mut pos: usize) -> Option<String> {
    let mut out = String::new();
    let mut jumps = 0;

    loop {
        let len = *pkt.get(pos)? as usize;

        if len == 0 {
            break;
        }

        if len & 0xc0 == 0xc0 {
            let low = *pkt.get(pos + 1)? as usize;
            let target = ((len & 0x3f) << 8) | low;
            if target >= pkt.len() {
                return None;
            }
            pos = target;

            // A chain longer than this is a compression loop.
            jumps += 1;
            if jumps > 32 {
                return None;
            }
            continue;
        }

        let label = pkt.get(pos + 1..pos + 1 + len)?;
        if !out.is_empty() {
            out.push('.');
        }
        out.push_str(std::str::from_utf8(label).ok()?);
        pos += 1 + len;
    }

    Some(out)
}

/// Skips over an encoded name, returning the position after it.
fn skip_name(pkt: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *pkt.get(pos)? as usize;
        if len & 0xc0 == 0xc0 {
            pkt.get(pos + 1)?;
            return Some(pos + 2);
        }
        if len == 0 {
            return Some(pos + 1);
        }
        pos += 1 + len;
    }
}

fn parse_record(pkt: &[u8], pos: &mut usize, kind: RecordKind) -> Option<DnsRecord> {
    let name_start = *pos;
    let name_end = skip_name(pkt, name_start)?;

    let fixed = pkt.get(name_end..name_end + 4)?;
    let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
    let rclass = u16::from_be_bytes([fixed[2], fixed[3]]);
    let mut cursor = name_end + 4;

    let (ttl, rdata) = match kind {
        RecordKind::Question => (0, cursor..cursor),
        RecordKind::Answer => {
            let fixed = pkt.get(cursor..cursor + 6)?;
            let ttl = u32::from_be_bytes([fixed[0], fixed[1], fixed[2], fixed[3]]);
            let rdlen = u16::from_be_bytes([fixed[4], fixed[5]]) as usize;
            cursor += 6;

            pkt.get(cursor..cursor + rdlen)?;
            let rdata = cursor..cursor + rdlen;
            cursor += rdlen;
            (ttl, rdata)
        }
    };

    *pos = cursor;
    Some(DnsRecord {
        kind,
        name: name_start..name_end,
        rtype,
        rclass,
        ttl,
        rdata,
    })
}

/// Parses a DNS packet.
///
/// Truncated trailing records are dropped rather than failing the
/// whole message; only a packet shorter than the header is an error.
pub fn parse_dns(pkt: &[u8]) -> Result<DnsMessage<'_>, DnsError> {
    if pkt.len() < HEADER_LEN {
        return Err(DnsError::Truncated);
    }

    let word = |i: usize| u16::from_be_bytes([pkt[i], pkt[i + 1]]);
    let num_questions = (word(4) as usize).min(MAX_RECORDS);
    let num_answers = (word(6) as usize).min(MAX_RECORDS);

    let mut msg = DnsMessage {
        pkt,
        transaction_id: word(0),
        flags: word(2),
        questions: Vec::with_capacity(num_questions),
        answers: Vec::with_capacity(num_answers),
    };

    let mut pos = HEADER_LEN;

    for _ in 0..num_questions {
        match parse_record(pkt, &mut pos, RecordKind::Question) {
            Some(rr) => msg.questions.push(rr),
            None => return Ok(msg),
        }
    }
    for _ in 0..num_answers {
        match parse_record(pkt, &mut pos, RecordKind::Answer) {
            Some(rr) => msg.answers.push(rr),
            None => return Ok(msg),
        }
    }

    Ok(msg)
}

/// Appends `name` in label form. Fails on empty or oversized labels.
fn encode_name(out: &mut Buf, name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name);

    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            return false;
        }
        out.append(&[label.len() as u8]);
        out.append(label.as_bytes());
    }
    out.append(&[0]);

    true
}

fn encode_header(
    out: &mut Buf,
    at: usize,
    transaction_id: u16,
    flags: u16,
    num_questions: u16,
    num_answers: u16,
) {
    let mut header = [0u8; HEADER_LEN];
    header[0..2].copy_from_slice(&transaction_id.to_be_bytes());
    header[2..4].copy_from_slice(&flags.to_be_bytes());
    header[4..6].copy_from_slice(&num_questions.to_be_bytes());
    header[6..8].copy_from_slice(&num_answers.to_be_bytes());
    out.insert(at, &header);
}

/// Composes a query for `name` into `out`, returning its transaction
/// id. The TCP length prefix is **not** included.
pub fn compose_query(out: &mut Buf, name: &str, rtype: RecordType) -> Option<u16> {
    let transaction_id: u16 = rand::random();
    let start = out.len();

    encode_header(out, start, transaction_id, QUERY_FLAGS, 1, 0);
    if !encode_name(out, name) {
        out.truncate(start);
        return None;
    }
    out.append(&(rtype as u16).to_be_bytes());
    out.append(&1u16.to_be_bytes()); // IN class

    Some(transaction_id)
}

/// Queues (UDP: sends) a query for `name` on a connection.
pub fn send_query(conn: &mut Conn, name: &str, rtype: RecordType) -> Option<u16> {
    let mut pkt = Buf::with_capacity(64);
    let transaction_id = compose_query(&mut pkt, name, rtype)?;

    if !conn.flags.contains(ConnFlags::UDP) {
        pkt.insert(0, &(pkt.len() as u16).to_be_bytes());
    }
    conn.send(&pkt);

    Some(transaction_id)
}

/// An in-progress reply, composed over the connection's send buffer.
#[derive(Debug)]
pub struct DnsReply {
    start: usize,
    transaction_id: u16,
    flags: u16,
    num_questions: u16,
    num_answers: u16,
}

/// Answer rdata accepted by [`add_reply_record`].
#[derive(Debug)]
pub enum ReplyData<'a> {
    /// Raw rdata bytes (A/AAAA addresses, etc.).
    Raw(&'a [u8]),

    /// A name, encoded in label form (CNAME targets).
    Name(&'a str),
}

/// Starts a reply to `msg` on the connection's send buffer, echoing
/// the question section.
pub fn create_reply(conn: &mut Conn, msg: &DnsMessage<'_>) -> DnsReply {
    let start = conn.send_buf.len();
    conn.send_buf.append(&msg.pkt[HEADER_LEN.min(msg.pkt.len())..]);

    DnsReply {
        start,
        transaction_id: msg.transaction_id,
        flags: msg.flags | REPLY_FLAGS,
        num_questions: msg.questions.len() as u16,
        num_answers: 0,
    }
}

/// Appends one answer record to a reply.
///
/// The record answers `question`; `name` overrides the owner name,
/// defaulting to the question's. Returns `false` when the name cannot
/// be encoded.
pub fn add_reply_record(
    conn: &mut Conn,
    reply: &mut DnsReply,
    msg: &DnsMessage<'_>,
    question: &DnsRecord,
    name: Option<&str>,
    ttl: u32,
    data: ReplyData<'_>,
) -> bool {
    let owner = match name {
        Some(n) => n.to_string(),
        None => match msg.name(question) {
            Some(n) => n,
            None => return false,
        },
    };

    let out = &mut conn.send_buf;
    let record_start = out.len();

    if !encode_name(out, &owner) {
        out.truncate(record_start);
        return false;
    }
    out.append(&question.rtype.to_be_bytes());
    out.append(&question.rclass.to_be_bytes());
    out.append(&ttl.to_be_bytes());

    match data {
        ReplyData::Raw(bytes) => {
            out.append(&(bytes.len() as u16).to_be_bytes());
            out.append(bytes);
        }
        ReplyData::Name(target) => {
            // Length prefix is patched once the encoded size is known.
            out.append(&[0, 0]);
            let data_start = out.len();
            if !encode_name(out, target) {
                out.truncate(record_start);
                return false;
            }
            let encoded = ((out.len() - data_start) as u16).to_be_bytes();
            out.as_mut_slice()[data_start - 2..data_start].copy_from_slice(&encoded);
        }
    }

    reply.num_answers += 1;
    true
}

/// Finishes a reply: inserts the header (and the TCP length prefix)
/// and, on datagram connections, sends it.
pub fn send_reply(conn: &mut Conn, reply: DnsReply) {
    encode_header(
        &mut conn.send_buf,
        reply.start,
        reply.transaction_id,
        reply.flags,
        reply.num_questions,
        reply.num_answers,
    );

    if conn.flags.contains(ConnFlags::UDP) {
        let fd = conn.fd;
        let sa = conn.sa;
        let _ = sys_sendto(fd, &conn.send_buf[reply.start..], &sa);
        conn.send_buf.truncate(reply.start);
    } else {
        let len = (conn.send_buf.len() - reply.start) as u16;
        conn.send_buf.insert(reply.start, &len.to_be_bytes());
    }
}

/// Drives the DNS server state machine for one connection event.
pub(crate) fn dns_event(conn: &mut Conn, user: &Handler, ev: Event<'_>) {
    match ev {
        Event::Recv { .. } => {
            deliver_user(conn, user, ev);

            if !conn.flags.contains(ConnFlags::UDP) {
                if conn.recv_buf.len() < 2 {
                    return;
                }
                conn.recv_buf.remove(2);
            }

            let buf = mem::take(&mut conn.recv_buf);
            match parse_dns(&buf) {
                Ok(msg) => deliver_user(conn, user, Event::Dns { msg: &msg }),
                Err(_) => {
                    let mut out = Buf::with_capacity(HEADER_LEN);
                    encode_header(&mut out, 0, 0, ERROR_FLAGS, 0, 0);
                    conn.send(&out);
                }
            }

            conn.recv_buf = buf;
            conn.recv_buf.clear();
        }
        other => deliver_user(conn, user, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::handler;

    fn test_conn() -> Conn {
        Conn::new(handler(|_, _| {}))
    }

    #[test]
    fn query_roundtrip() {
        let mut out = Buf::new();
        let transaction_id = compose_query(&mut out, "example.com", RecordType::A).unwrap();

        let msg = parse_dns(&out).unwrap();
        assert_eq!(msg.transaction_id, transaction_id);
        assert_eq!(msg.flags, QUERY_FLAGS);
        assert_eq!(msg.questions.len(), 1);
        assert!(msg.answers.is_empty());

        let q = &msg.questions[0];
        assert_eq!(q.rtype, RecordType::A as u16);
        assert_eq!(q.rclass, 1);
        assert_eq!(msg.name(q).as_deref(), Some("example.com"));
    }

    #[test]
    fn reply_with_a_record() {
        let mut query = Buf::new();
        compose_query(&mut query, "host.test", RecordType::A).unwrap();
        let msg = parse_dns(&query).unwrap();
        let question = msg.questions[0].clone();

        let mut conn = test_conn();
        let mut reply = create_reply(&mut conn, &msg);
        assert!(add_reply_record(
            &mut conn,
            &mut reply,
            &msg,
            &question,
            None,
            300,
            ReplyData::Raw(&[10, 0, 0, 42]),
        ));
        send_reply(&mut conn, reply);

        // Stream connections get a two-byte length prefix.
        let wire = conn.send_buf.as_slice();
        let declared = u16::from_be_bytes([wire[0], wire[1]]) as usize;
        assert_eq!(declared, wire.len() - 2);

        let parsed = parse_dns(&wire[2..]).unwrap();
        assert_eq!(parsed.transaction_id, msg.transaction_id);
        assert_eq!(parsed.flags & REPLY_FLAGS, REPLY_FLAGS);
        assert_eq!(parsed.answers.len(), 1);

        let answer = &parsed.answers[0];
        assert_eq!(parsed.name(answer).as_deref(), Some("host.test"));
        assert_eq!(answer.ttl, 300);
        assert_eq!(
            parsed.record_data(answer),
            Some(RecordData::A(Ipv4Addr::new(10, 0, 0, 42)))
        );
    }

    #[test]
    fn cname_rdata_gets_length_patched() {
        let mut query = Buf::new();
        compose_query(&mut query, "alias.test", RecordType::Cname).unwrap();
        let msg = parse_dns(&query).unwrap();
        let question = msg.questions[0].clone();

        let mut conn = test_conn();
        let mut reply = create_reply(&mut conn, &msg);
        assert!(add_reply_record(
            &mut conn,
            &mut reply,
            &msg,
            &question,
            None,
            60,
            ReplyData::Name("real.test"),
        ));
        send_reply(&mut conn, reply);

        let parsed = parse_dns(&conn.send_buf[2..]).unwrap();
        let answer = &parsed.answers[0];
        assert_eq!(
            parsed.record_data(answer),
            Some(RecordData::Cname("real.test".to_string()))
        );
    }

    #[test]
    fn compressed_names_are_expanded() {
        // Hand-built packet: one answer whose name is a pointer to
        // the question name at offset 12.
        let mut pkt = Vec::new();
        pkt.extend_from_slice(&0x1234u16.to_be_bytes());
        pkt.extend_from_slice(&0x8180u16.to_be_bytes());
        pkt.extend_from_slice(&1u16.to_be_bytes());
        pkt.extend_from_slice(&1u16.to_be_bytes());
        pkt.extend_from_slice(&[0, 0, 0, 0]);

        pkt.extend_from_slice(b"\x03www\x04test\x00");
        pkt.extend_from_slice(&1u16.to_be_bytes());
        pkt.extend_from_slice(&1u16.to_be_bytes());

        pkt.extend_from_slice(&[0xc0, 12]); // pointer to offset 12
        pkt.extend_from_slice(&1u16.to_be_bytes());
        pkt.extend_from_slice(&1u16.to_be_bytes());
        pkt.extend_from_slice(&600u32.to_be_bytes());
        pkt.extend_from_slice(&4u16.to_be_bytes());
        pkt.extend_from_slice(&[192, 0, 2, 1]);

        let msg = parse_dns(&pkt).unwrap();
        assert_eq!(msg.answers.len(), 1);
        assert_eq!(msg.name(&msg.answers[0]).as_deref(), Some("www.test"));
        assert_eq!(
            msg.first_ip(),
            Some(std::net::IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)))
        );
    }

    #[test]
    fn pointer_loop_is_rejected() {
        let mut pkt = vec![0u8; HEADER_LEN];
        pkt[5] = 1; // one question
        pkt.extend_from_slice(&[0xc0, 12]); // points at itself
        pkt.extend_from_slice(&1u16.to_be_bytes());
        pkt.extend_from_slice(&1u16.to_be_bytes());

        let msg = parse_dns(&pkt).unwrap();
        assert_eq!(msg.questions.len(), 1);
        assert_eq!(msg.name(&msg.questions[0]), None);
    }

    #[test]
    fn truncated_records_are_dropped() {
        let mut query = Buf::new();
        compose_query(&mut query, "cut.test", RecordType::A).unwrap();

        let cut = &query[..query.len() - 3];
        let msg = parse_dns(cut).unwrap();
        assert!(msg.questions.is_empty());
    }

    #[test]
    fn short_packet_is_an_error() {
        assert!(matches!(parse_dns(&[0; 5]), Err(DnsError::Truncated)));
    }

    #[test]
    fn record_counts_are_capped() {
        let mut pkt = vec![0u8; HEADER_LEN];
        pkt[4] = 0xff;
        pkt[5] = 0xff; // 65535 claimed questions
        let msg = parse_dns(&pkt).unwrap();
        assert!(msg.questions.len() <= MAX_RECORDS);
    }
}
