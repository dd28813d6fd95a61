// Copyright 2024 dshield developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! DNS wire parsing and response synthesis.
//!
//! Parsing and construction go through the `domain` crate; the TTL rewrite
//! used when serving cached responses patches the raw packet instead, since
//! it must preserve the upstream message byte-for-byte apart from the TTL
//! fields.

use crate::MAX_LEN;
use bytes::{Bytes, BytesMut};
use domain::base::{
    iana::{Class, Rcode},
    name::{PushError, ToDname},
    octets::ParseError,
    Dname, Message, MessageBuilder, Record, Rtype, ShortBuf,
};
use domain::rdata::{AllRecordData, A, Aaaa};
use std::net::{Ipv4Addr, Ipv6Addr};

/// A shorthand for returning codec errors.
pub type Result<T> = std::result::Result<T, CodecError>;

/// All possible errors that may incur when parsing or building packets.
/// Hostile input yields an error here, never a panic.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The packet is shorter than its structure claims.
    #[error("truncated or malformed DNS packet")]
    Malformed,

    /// The packet carries no question to echo.
    #[error("DNS packet has no question section")]
    NoQuestion,

    /// Buffer too short while composing.
    #[error(transparent)]
    ShortBuf(#[from] ShortBuf),

    /// Failed to push a record while composing.
    #[error(transparent)]
    Push(#[from] PushError),

    /// Failed to parse a section of the message.
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// The question a client asked, with the raw packet kept alongside.
#[derive(Clone)]
pub struct ParsedQuery {
    /// Transaction id to echo in any response.
    pub txid: u16,
    /// Lower-cased query name without the trailing dot.
    pub qname: String,
    /// Query type.
    pub qtype: Rtype,
    /// Query class.
    pub qclass: Class,
    /// The parsed message, usable for `start_answer`.
    pub message: Message<Bytes>,
}

impl std::fmt::Debug for ParsedQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParsedQuery")
            .field("txid", &self.txid)
            .field("qname", &self.qname)
            .field("qtype", &self.qtype)
            .field("qclass", &self.qclass)
            .field("message", &self.message.as_slice())
            .finish()
    }
}

/// Normalize a domain name into the form used as cache and store key.
pub fn name_key(name: &impl ToDname) -> String {
    let mut s = name.to_bytes().to_string().to_ascii_lowercase();
    while s.len() > 1 && s.ends_with('.') {
        s.pop();
    }
    s
}

/// Parse an inbound query packet.
pub fn parse_query(payload: Bytes) -> Result<ParsedQuery> {
    let message = Message::from_octets(payload).map_err(|_| CodecError::Malformed)?;
    // Not trusting the header counts: hostile packets lie in them. Parse the
    // first question for real.
    let (txid, qname, qtype, qclass) = {
        let question = message.first_question().ok_or(CodecError::NoQuestion)?;
        (
            message.header().id(),
            name_key(&question.qname()),
            question.qtype(),
            question.qclass(),
        )
    };
    Ok(ParsedQuery {
        txid,
        qname,
        qtype,
        qclass,
        message,
    })
}

fn answer_builder(
    query: &Message<Bytes>,
    rcode: Rcode,
) -> Result<domain::base::message_builder::AnswerBuilder<BytesMut>> {
    let mut builder =
        MessageBuilder::from_target(BytesMut::with_capacity(MAX_LEN))?.start_answer(query, rcode)?;
    builder.header_mut().set_ra(true);
    Ok(builder)
}

/// Synthesized A answer pointing the client at the sinkhole address.
pub fn blocked_a(query: &ParsedQuery, sinkhole: Ipv4Addr, ttl: u32) -> Result<Message<Bytes>> {
    let name = owned_qname(query)?;
    let mut builder = answer_builder(&query.message, Rcode::NoError)?;
    builder.push((name, ttl, A::new(sinkhole)))?;
    Ok(builder.into_message())
}

/// Synthesized AAAA answer pointing the client at the sinkhole address.
pub fn blocked_aaaa(query: &ParsedQuery, sinkhole: Ipv6Addr, ttl: u32) -> Result<Message<Bytes>> {
    let name = owned_qname(query)?;
    let mut builder = answer_builder(&query.message, Rcode::NoError)?;
    builder.push((name, ttl, Aaaa::new(sinkhole)))?;
    Ok(builder.into_message())
}

/// Header-only NXDOMAIN preserving the question.
pub fn nxdomain(query: &ParsedQuery) -> Result<Message<Bytes>> {
    Ok(answer_builder(&query.message, Rcode::NXDomain)?.into_message())
}

/// Header-only SERVFAIL preserving the question.
pub fn servfail(query: &Message<Bytes>) -> Result<Message<Bytes>> {
    Ok(answer_builder(query, Rcode::ServFail)?.into_message())
}

/// Header-only FORMERR preserving the question.
pub fn formerr(query: &Message<Bytes>) -> Result<Message<Bytes>> {
    Ok(answer_builder(query, Rcode::FormErr)?.into_message())
}

/// Header-only NOTIMP preserving the question.
pub fn notimp(query: &ParsedQuery) -> Result<Message<Bytes>> {
    Ok(answer_builder(&query.message, Rcode::NotImp)?.into_message())
}

/// FORMERR for packets too broken to echo a question; only the transaction
/// id survives.
pub fn formerr_raw(txid: u16) -> Result<Message<Bytes>> {
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(12))?;
    let header = builder.header_mut();
    header.set_id(txid);
    header.set_qr(true);
    header.set_rcode(Rcode::FormErr);
    Ok(builder.into_message())
}

/// Generic response with pre-built answer records.
pub fn respond_with(
    query: &ParsedQuery,
    rcode: Rcode,
    answers: &[Record<Dname<Bytes>, AllRecordData<Bytes, Dname<Bytes>>>],
) -> Result<Message<Bytes>> {
    let mut builder = answer_builder(&query.message, rcode)?;
    for r in answers {
        builder.push(r)?;
    }
    Ok(builder.into_message())
}

fn owned_qname(query: &ParsedQuery) -> Result<Dname<Bytes>> {
    let question = query.message.first_question().ok_or(CodecError::NoQuestion)?;
    Ok(question.qname().to_bytes())
}

/// Peek the transaction id without a full parse.
pub fn extract_txid(packet: &[u8]) -> Option<u16> {
    Some(u16::from_be_bytes([*packet.first()?, *packet.get(1)?]))
}

/// Smallest TTL across the answer section, if there are any answers.
pub fn min_ttl(response: &Message<Bytes>) -> Option<u32> {
    response
        .answer()
        .ok()?
        .filter_map(|r| r.ok())
        .map(|r| r.ttl())
        .min()
}

// Skips over a (possibly compressed) name starting at `pos`, returning the
// position just past it.
fn skip_name(packet: &[u8], mut pos: usize) -> Result<usize> {
    loop {
        let len = *packet.get(pos).ok_or(CodecError::Malformed)? as usize;
        if len == 0 {
            return Ok(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            // Compression pointer: two bytes, then the name is done.
            if pos + 1 >= packet.len() {
                return Err(CodecError::Malformed);
            }
            return Ok(pos + 2);
        }
        if len & 0xC0 != 0 {
            return Err(CodecError::Malformed);
        }
        pos += 1 + len;
        if pos > packet.len() {
            return Err(CodecError::Malformed);
        }
    }
}

fn read_u16(packet: &[u8], pos: usize) -> Result<u16> {
    Ok(u16::from_be_bytes([
        *packet.get(pos).ok_or(CodecError::Malformed)?,
        *packet.get(pos + 1).ok_or(CodecError::Malformed)?,
    ]))
}

/// Rewrite every resource-record TTL in `response` down by `elapsed` seconds,
/// flooring at zero. Used to serve cached responses with decayed TTLs.
pub fn decay_ttl(response: &[u8], elapsed: u32) -> Result<Bytes> {
    if response.len() < 12 {
        return Err(CodecError::Malformed);
    }
    let mut out = BytesMut::from(response);
    let qdcount = read_u16(response, 4)?;
    let record_total = read_u16(response, 6)?
        .saturating_add(read_u16(response, 8)?)
        .saturating_add(read_u16(response, 10)?);

    let mut pos = 12;
    for _ in 0..qdcount {
        pos = skip_name(response, pos)?;
        pos += 4; // qtype + qclass
        if pos > response.len() {
            return Err(CodecError::Malformed);
        }
    }
    for _ in 0..record_total {
        pos = skip_name(response, pos)?;
        // type(2) class(2) ttl(4) rdlength(2)
        let rtype = read_u16(response, pos)?;
        let ttl_at = pos + 4;
        let rdlen = read_u16(response, pos + 8)? as usize;
        let ttl = u32::from_be_bytes([
            *response.get(ttl_at).ok_or(CodecError::Malformed)?,
            *response.get(ttl_at + 1).ok_or(CodecError::Malformed)?,
            *response.get(ttl_at + 2).ok_or(CodecError::Malformed)?,
            *response.get(ttl_at + 3).ok_or(CodecError::Malformed)?,
        ]);
        // OPT's "TTL" field carries flags, not a lifetime.
        if rtype != 41 {
            out[ttl_at..ttl_at + 4].copy_from_slice(&ttl.saturating_sub(elapsed).to_be_bytes());
        }
        pos += 10 + rdlen;
        if pos > response.len() {
            return Err(CodecError::Malformed);
        }
    }
    Ok(out.freeze())
}

/// Overwrite the transaction id of a response packet in place.
pub fn rewrite_txid(response: &[u8], txid: u16) -> Result<Bytes> {
    if response.len() < 12 {
        return Err(CodecError::Malformed);
    }
    let mut out = BytesMut::from(response);
    out[0..2].copy_from_slice(&txid.to_be_bytes());
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::build_query;

    #[test]
    fn parse_roundtrip() {
        let query = build_query("ads.Example.COM", Rtype::A, 0x1234);
        let parsed = parse_query(Bytes::copy_from_slice(query.as_slice())).unwrap();
        assert_eq!(parsed.txid, 0x1234);
        assert_eq!(parsed.qname, "ads.example.com");
        assert_eq!(parsed.qtype, Rtype::A);
    }

    #[test]
    fn blocked_a_echoes_question() {
        let query = build_query("ads.example.com", Rtype::A, 42);
        let parsed = parse_query(Bytes::copy_from_slice(query.as_slice())).unwrap();
        let resp = blocked_a(&parsed, Ipv4Addr::UNSPECIFIED, 60).unwrap();

        assert_eq!(resp.header().id(), 42);
        assert!(resp.header().qr());
        assert_eq!(resp.header().rcode(), Rcode::NoError);
        let answer = resp.answer().unwrap().next().unwrap().unwrap();
        assert_eq!(answer.ttl(), 60);
        let a = answer.into_record::<A>().unwrap().unwrap();
        assert_eq!(a.data().addr(), Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn blocked_aaaa_uses_unspecified() {
        let query = build_query("ads.example.com", Rtype::Aaaa, 7);
        let parsed = parse_query(Bytes::copy_from_slice(query.as_slice())).unwrap();
        let resp = blocked_aaaa(&parsed, Ipv6Addr::UNSPECIFIED, 60).unwrap();
        let answer = resp.answer().unwrap().next().unwrap().unwrap();
        let aaaa = answer.into_record::<Aaaa>().unwrap().unwrap();
        assert_eq!(aaaa.data().addr(), Ipv6Addr::UNSPECIFIED);
    }

    #[test]
    fn header_only_rcodes() {
        let query = build_query("x.example.com", Rtype::A, 9);
        let parsed = parse_query(Bytes::copy_from_slice(query.as_slice())).unwrap();
        assert_eq!(nxdomain(&parsed).unwrap().header().rcode(), Rcode::NXDomain);
        assert_eq!(
            servfail(&parsed.message).unwrap().header().rcode(),
            Rcode::ServFail
        );
        assert_eq!(
            formerr(&parsed.message).unwrap().header().rcode(),
            Rcode::FormErr
        );
        assert_eq!(notimp(&parsed).unwrap().header().rcode(), Rcode::NotImp);
    }

    #[test]
    fn malformed_inputs_error_not_panic() {
        for bad in [
            &[][..],
            &[0u8; 3][..],
            &[0u8; 11][..],
            // Claims one question but carries none.
            &[0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0][..],
        ] {
            assert!(parse_query(Bytes::copy_from_slice(bad)).is_err());
            assert!(decay_ttl(bad, 10).is_err() || bad.len() >= 12);
        }
        // A label running past the end of the packet.
        let mut evil = vec![0, 1, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0];
        evil.extend_from_slice(&[63, b'a']);
        assert!(decay_ttl(&evil, 10).is_err());
    }

    #[test]
    fn ttl_decays_and_floors() {
        let query = build_query("cdn.example.com", Rtype::A, 3);
        let parsed = parse_query(Bytes::copy_from_slice(query.as_slice())).unwrap();
        let resp = blocked_a(&parsed, Ipv4Addr::new(1, 2, 3, 4), 300).unwrap();

        let decayed = decay_ttl(resp.as_slice(), 120).unwrap();
        let msg = Message::from_octets(decayed).unwrap();
        assert_eq!(min_ttl(&msg), Some(180));

        let floored = decay_ttl(msg.as_slice(), 10_000).unwrap();
        let msg = Message::from_octets(floored).unwrap();
        assert_eq!(min_ttl(&msg), Some(0));
    }

    #[test]
    fn txid_helpers() {
        let query = build_query("a.example.com", Rtype::A, 0xBEEF);
        assert_eq!(extract_txid(query.as_slice()), Some(0xBEEF));
        assert_eq!(extract_txid(&[1]), None);
        let rewritten = rewrite_txid(query.as_slice(), 0x1111).unwrap();
        assert_eq!(extract_txid(&rewritten), Some(0x1111));
    }
}
