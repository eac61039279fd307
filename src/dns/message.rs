//! RFC 1035 wire format.
//!
//! One question per query, UDP, 512-byte messages. Names are kept in
//! their wire ("dn") form: length-prefixed labels ending with a zero
//! byte. Decompression only follows pointers that aim strictly
//! backwards, so a crafted pointer loop dies immediately instead of
//! spinning.

use std::net::{Ipv4Addr, Ipv6Addr};

/// Maximum DNS message size in or out.
pub(crate) const MAX_MESSAGE_SIZE: usize = 512;

/// Cap on answer records examined in one response.
pub(crate) const MAX_ANSWER_RECORDS: usize = 30;

/// Maximum encoded name length, including the final zero byte.
pub(crate) const MAX_NAME_LEN: usize = 255;

const CLASS_IN: u16 = 1;

/// Record types the resolver cares about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum QueryType {
    A,
    Aaaa,
    Cname,
}

impl QueryType {
    pub(crate) fn to_u16(self) -> u16 {
        match self {
            QueryType::A => 1,
            QueryType::Cname => 5,
            QueryType::Aaaa => 28,
        }
    }

    pub(crate) fn other_family(self) -> QueryType {
        match self {
            QueryType::A => QueryType::Aaaa,
            QueryType::Aaaa => QueryType::A,
            QueryType::Cname => QueryType::Cname,
        }
    }
}

/// Response codes the resolver distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Rcode {
    NoError,
    NxDomain,
    Refused,
    Other(u8),
}

impl Rcode {
    fn from_u8(code: u8) -> Rcode {
        match code {
            0 => Rcode::NoError,
            3 => Rcode::NxDomain,
            5 => Rcode::Refused,
            other => Rcode::Other(other),
        }
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum RData {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Cname(Vec<u8>),
    Other,
}

#[derive(Debug)]
pub(crate) struct Answer {
    /// Owner name, decompressed, wire form.
    pub(crate) name: Vec<u8>,
    pub(crate) rtype: u16,
    pub(crate) ttl: u32,
    pub(crate) data: RData,
}

#[derive(Debug)]
pub(crate) struct Response {
    pub(crate) id: u16,
    pub(crate) truncated: bool,
    pub(crate) rcode: Rcode,
    pub(crate) qdcount: u16,
    pub(crate) answers: Vec<Answer>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum WireError {
    Short,
    BadName,
    ForwardPointer,
    TooLarge,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WireError::Short => "message truncated mid-field",
            WireError::BadName => "malformed domain name",
            WireError::ForwardPointer => "compression pointer does not aim backwards",
            WireError::TooLarge => "name or message over size limit",
        };
        f.write_str(s)
    }
}

impl std::error::Error for WireError {}

/// `www.example.org` -> `\x03www\x07example\x03org\x00`.
pub(crate) fn encode_domain_name(host: &str) -> Result<Vec<u8>, WireError> {
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() {
        return Err(WireError::BadName);
    }
    let mut out = Vec::with_capacity(host.len() + 2);
    for label in host.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(WireError::BadName);
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    if out.len() > MAX_NAME_LEN {
        return Err(WireError::TooLarge);
    }
    Ok(out)
}

/// Wire name back to presentation form, for logs.
pub(crate) fn display_name(dn: &[u8]) -> String {
    let mut out = String::new();
    let mut i = 0;
    while i < dn.len() {
        let len = dn[i] as usize;
        if len == 0 {
            break;
        }
        if !out.is_empty() {
            out.push('.');
        }
        let end = std::cmp::min(i + 1 + len, dn.len());
        out.push_str(&String::from_utf8_lossy(&dn[i + 1..end]));
        i = end;
    }
    out
}

/// Build one recursive query (RD=1) for `qname_dn`.
pub(crate) fn build_query(id: u16, qname_dn: &[u8], qtype: QueryType) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + qname_dn.len() + 4);
    out.extend_from_slice(&id.to_be_bytes());
    // QR=0 OPCODE=0 AA=0 TC=0 RD=1 / RA=0 Z=0 RCODE=0
    out.extend_from_slice(&0x0100u16.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    out.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    out.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    out.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT
    out.extend_from_slice(qname_dn);
    out.extend_from_slice(&qtype.to_u16().to_be_bytes());
    out.extend_from_slice(&CLASS_IN.to_be_bytes());
    debug_assert!(out.len() <= MAX_MESSAGE_SIZE);
    out
}

fn read_u16(buf: &[u8], at: usize) -> Result<u16, WireError> {
    let hi = *buf.get(at).ok_or(WireError::Short)?;
    let lo = *buf.get(at + 1).ok_or(WireError::Short)?;
    Ok(u16::from_be_bytes([hi, lo]))
}

fn read_u32(buf: &[u8], at: usize) -> Result<u32, WireError> {
    if at + 4 > buf.len() {
        return Err(WireError::Short);
    }
    Ok(u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]))
}

/// Decompress the name at `offset`.
///
/// Returns the wire-form name and how many bytes the name occupies at
/// its original position. Pointers may only aim strictly before the
/// position they occur at; each jump therefore lands strictly earlier
/// than the last, so the walk always terminates.
pub(crate) fn read_name(buf: &[u8], offset: usize) -> Result<(Vec<u8>, usize), WireError> {
    let mut name = Vec::with_capacity(32);
    let mut pos = offset;
    let mut consumed = None;

    loop {
        let len = *buf.get(pos).ok_or(WireError::Short)?;
        match len {
            0 => {
                name.push(0);
                if consumed.is_none() {
                    consumed = Some(pos + 1 - offset);
                }
                break;
            }
            l if l & 0xc0 == 0xc0 => {
                let lo = *buf.get(pos + 1).ok_or(WireError::Short)?;
                let target = (usize::from(l & 0x3f) << 8) | usize::from(lo);
                if target >= pos {
                    debug!("dns name pointer {} does not aim backwards from {}", target, pos);
                    return Err(WireError::ForwardPointer);
                }
                if consumed.is_none() {
                    consumed = Some(pos + 2 - offset);
                }
                pos = target;
            }
            l if l & 0xc0 != 0 => return Err(WireError::BadName),
            l => {
                let l = usize::from(l);
                if pos + 1 + l > buf.len() {
                    return Err(WireError::Short);
                }
                name.push(l as u8);
                name.extend_from_slice(&buf[pos + 1..pos + 1 + l]);
                if name.len() > MAX_NAME_LEN {
                    return Err(WireError::TooLarge);
                }
                pos += 1 + l;
            }
        }
    }

    Ok((name, consumed.unwrap_or(0)))
}

/// Parse a response message: header, the echoed question, and up to
/// `MAX_ANSWER_RECORDS` answers.
pub(crate) fn parse_response(buf: &[u8]) -> Result<Response, WireError> {
    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::TooLarge);
    }
    let id = read_u16(buf, 0)?;
    let flags = read_u16(buf, 2)?;
    let qdcount = read_u16(buf, 4)?;
    let ancount = read_u16(buf, 6)?;

    let truncated = flags & 0x0200 != 0;
    let rcode = Rcode::from_u8((flags & 0x000f) as u8);

    let mut pos = 12;
    // Skip the echoed question section.
    for _ in 0..qdcount {
        let (_, used) = read_name(buf, pos)?;
        pos += used + 4; // qtype + qclass
        if pos > buf.len() {
            return Err(WireError::Short);
        }
    }

    let take = std::cmp::min(usize::from(ancount), MAX_ANSWER_RECORDS);
    let mut answers = Vec::with_capacity(take);
    for _ in 0..take {
        let (name, used) = read_name(buf, pos)?;
        pos += used;
        let rtype = read_u16(buf, pos)?;
        let _class = read_u16(buf, pos + 2)?;
        let ttl = read_u32(buf, pos + 4)?;
        let rdlength = usize::from(read_u16(buf, pos + 8)?);
        pos += 10;
        if pos + rdlength > buf.len() {
            return Err(WireError::Short);
        }
        let data = match rtype {
            1 if rdlength == 4 => {
                RData::Ipv4(Ipv4Addr::new(buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]))
            }
            28 if rdlength == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[pos..pos + 16]);
                RData::Ipv6(Ipv6Addr::from(octets))
            }
            5 => {
                let (target, _) = read_name(buf, pos)?;
                RData::Cname(target)
            }
            _ => RData::Other,
        };
        pos += rdlength;
        answers.push(Answer {
            name,
            rtype,
            ttl,
            data,
        });
    }

    Ok(Response {
        id,
        truncated,
        rcode,
        qdcount,
        answers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_name_round_trip() {
        let dn = encode_domain_name("www.example.org").unwrap();
        assert_eq!(dn, b"\x03www\x07example\x03org\x00");
        assert_eq!(display_name(&dn), "www.example.org");

        // Trailing dot is accepted and normalized.
        assert_eq!(encode_domain_name("example.org.").unwrap(), encode_domain_name("example.org").unwrap());

        assert!(encode_domain_name("").is_err());
        assert!(encode_domain_name("a..b").is_err());
        let long_label = "a".repeat(64);
        assert!(encode_domain_name(&long_label).is_err());
    }

    #[test]
    fn query_layout() {
        let dn = encode_domain_name("x.io").unwrap();
        let q = build_query(0xabcd, &dn, QueryType::A);
        assert_eq!(&q[0..2], &[0xab, 0xcd]);
        assert_eq!(&q[2..4], &[0x01, 0x00], "RD set");
        assert_eq!(&q[4..6], &[0x00, 0x01], "one question");
        assert_eq!(&q[12..12 + dn.len()], &dn[..]);
        assert_eq!(&q[q.len() - 4..], &[0x00, 0x01, 0x00, 0x01], "A IN");
    }

    fn response_with(answers: &[u8], ancount: u16) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(&0x1234u16.to_be_bytes());
        msg.extend_from_slice(&0x8180u16.to_be_bytes()); // QR RD RA
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&ancount.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.extend_from_slice(b"\x01x\x02io\x00");
        msg.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        msg.extend_from_slice(answers);
        msg
    }

    #[test]
    fn parse_a_record_with_compression() {
        // Answer name is a pointer back to the question name at 12.
        let mut answer = Vec::new();
        answer.extend_from_slice(&[0xc0, 12]);
        answer.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // A IN
        answer.extend_from_slice(&60u32.to_be_bytes());
        answer.extend_from_slice(&4u16.to_be_bytes());
        answer.extend_from_slice(&[192, 0, 2, 7]);

        let msg = response_with(&answer, 1);
        let res = parse_response(&msg).unwrap();
        assert_eq!(res.id, 0x1234);
        assert_eq!(res.rcode, Rcode::NoError);
        assert!(!res.truncated);
        assert_eq!(res.answers.len(), 1);
        assert_eq!(display_name(&res.answers[0].name), "x.io");
        assert_eq!(res.answers[0].data, RData::Ipv4("192.0.2.7".parse().unwrap()));
        assert_eq!(res.answers[0].ttl, 60);
    }

    #[test]
    fn forward_pointer_rejected() {
        // Pointer at the answer name aiming at itself.
        let mut answer = Vec::new();
        let self_offset = 12 + 5 + 4; // question name + qtype/qclass
        answer.extend_from_slice(&[0xc0 | ((self_offset >> 8) as u8), self_offset as u8]);
        answer.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        answer.extend_from_slice(&60u32.to_be_bytes());
        answer.extend_from_slice(&4u16.to_be_bytes());
        answer.extend_from_slice(&[192, 0, 2, 7]);

        let msg = response_with(&answer, 1);
        assert_eq!(parse_response(&msg).unwrap_err(), WireError::ForwardPointer);
    }

    #[test]
    fn pointer_loop_terminates_with_error() {
        // Two names pointing at each other cannot be expressed with
        // backward-only pointers; craft the closest thing: a pointer
        // chain that tries to jump forward mid-walk.
        let mut msg = Vec::new();
        msg.extend_from_slice(&0x1u16.to_be_bytes());
        msg.extend_from_slice(&0x8000u16.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());
        // Question name: label then pointer to itself (offset 12).
        msg.extend_from_slice(b"\x01a");
        msg.extend_from_slice(&[0xc0, 12]);
        msg.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);

        assert_eq!(parse_response(&msg).unwrap_err(), WireError::ForwardPointer);
    }

    #[test]
    fn truncated_flag_surfaces() {
        let mut msg = response_with(&[], 0);
        // Set TC.
        msg[2] |= 0x02;
        let res = parse_response(&msg).unwrap();
        assert!(res.truncated);
    }

    #[test]
    fn cname_answer_parses() {
        let mut answer = Vec::new();
        answer.extend_from_slice(&[0xc0, 12]);
        answer.extend_from_slice(&[0x00, 0x05, 0x00, 0x01]); // CNAME IN
        answer.extend_from_slice(&300u32.to_be_bytes());
        let target = b"\x03cdn\x02io\x00";
        answer.extend_from_slice(&(target.len() as u16).to_be_bytes());
        answer.extend_from_slice(target);

        let msg = response_with(&answer, 1);
        let res = parse_response(&msg).unwrap();
        match &res.answers[0].data {
            RData::Cname(dn) => assert_eq!(display_name(dn), "cdn.io"),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn ancount_is_capped() {
        // Claims 1000 answers but carries one; the parser reads what
        // fits and errors on the missing bytes rather than trusting
        // the count.
        let mut answer = Vec::new();
        answer.extend_from_slice(&[0xc0, 12]);
        answer.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        answer.extend_from_slice(&60u32.to_be_bytes());
        answer.extend_from_slice(&4u16.to_be_bytes());
        answer.extend_from_slice(&[192, 0, 2, 7]);
        let msg = response_with(&answer, 1000);
        assert!(parse_response(&msg).is_err());
    }
}
