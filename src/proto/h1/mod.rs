use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method};

use crate::proto::{DecodedLength, MessageHead};

pub(crate) mod conn;
pub(crate) mod decode;
pub(crate) mod encode;
pub(crate) mod io;
pub(crate) mod parse;
pub(crate) mod role;

pub(crate) use self::conn::Mux;
pub(crate) use self::decode::BodyFramer;
pub(crate) use self::encode::BodyWriter;
pub(crate) use self::parse::Parser;
pub(crate) use self::role::{ClientTransaction, ServerTransaction};

pub(crate) type ParseResult<T> = Result<Option<ParsedMessage<T>>, crate::error::Parse>;

/// A complete message head, with the framing facts the parser learned
/// along the way.
#[derive(Debug)]
pub(crate) struct ParsedMessage<T> {
    pub(crate) head: MessageHead<T>,
    /// Bytes the head occupied in the read buffer.
    pub(crate) len: usize,
    pub(crate) flags: parse::Flags,
    /// Parsed `Content-Length`, meaningful when the CLEN flag is set.
    pub(crate) body_len: u64,
}

/// How the incoming body is to be framed.
#[derive(Debug)]
pub(crate) enum Decode {
    /// Frame normally.
    Normal(BodyFramer),
    /// After this body, HTTP on the connection is over.
    Final(BodyFramer),
    /// A message to skip entirely (1xx interim responses).
    Ignore,
}

/// One unit of body handed between the mux and the stream.
#[derive(Debug)]
pub(crate) enum Frame {
    Data(Bytes),
    Trailers(HeaderMap),
}

pub(crate) struct ParseContext<'a> {
    pub(crate) h1m: &'a mut Parser,
    pub(crate) req_method: &'a mut Option<Method>,
}

/// A role of a mux: the frontend side parses requests and emits
/// responses, the backend side emits requests and parses responses.
pub(crate) trait Http1Transaction {
    type Incoming;
    type Outgoing: Default;
    const LOG: &'static str;

    fn parse(buf: &mut BytesMut, ctx: ParseContext<'_>) -> ParseResult<Self::Incoming>;

    fn decoder(
        parsed: &ParsedMessage<Self::Incoming>,
        req_method: &mut Option<Method>,
    ) -> Result<Decode, crate::error::Parse>;

    fn encode(
        head: &mut MessageHead<Self::Outgoing>,
        body: DecodedLength,
        dst: &mut Vec<u8>,
    ) -> BodyWriter;

    fn is_server() -> bool {
        false
    }
}
