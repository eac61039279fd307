//! The two roles of an H1 mux.
//!
//! A frontend mux is a `ServerTransaction`: it parses requests and
//! encodes responses. A backend mux is a `ClientTransaction`: it
//! encodes requests and parses responses. Both materialize the
//! indexed header view produced by the parser into typed heads.

use bytes::{Bytes, BytesMut};
use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Uri, Version};

use crate::error::Parse;
use crate::proto::h1::parse::{
    Flags, HeaderIndex, Output, ParseStatus, Span, StartLine, MAX_HEADERS,
};
use crate::proto::h1::{
    BodyFramer, BodyWriter, Decode, Http1Transaction, ParseContext, ParseResult, ParsedMessage,
};
use crate::proto::{DecodedLength, MessageHead, RequestLine};

const AVERAGE_HEADER_SIZE: usize = 30;

pub(crate) struct ServerTransaction;

pub(crate) struct ClientTransaction;

impl Http1Transaction for ServerTransaction {
    type Incoming = RequestLine;
    type Outgoing = StatusCode;
    const LOG: &'static str = "{role=frontend}";

    fn parse(buf: &mut BytesMut, ctx: ParseContext<'_>) -> ParseResult<RequestLine> {
        if buf.is_empty() {
            return Ok(None);
        }
        let mut headers = [HeaderIndex::default(); MAX_HEADERS];
        let mut out = Output::new(&mut headers);
        let len = match ctx.h1m.parse_headers(&buf[..], &mut out)? {
            ParseStatus::Complete(len) => len,
            ParseStatus::Partial => return Ok(None),
            ParseStatus::TooManyHeaders => return Err(Parse::TooLarge),
        };
        trace!("request head complete ({} bytes, {} headers)", len, out.num_headers);
        debug_assert!(ctx.h1m.is_done());

        let flags = ctx.h1m.flags;
        let body_len = ctx.h1m.body_len;
        let num_headers = out.num_headers;
        let (method_span, uri_span) = match out.start_line {
            StartLine::Req { method, uri } => (method, uri),
            _ => return Err(Parse::Internal),
        };
        let slice = buf.split_to(len).freeze();

        let method =
            Method::from_bytes(span(&slice, method_span)).map_err(|_| Parse::Method)?;
        if flags.contains(Flags::HTTP_09) && method != Method::GET {
            debug!("HTTP/0.9 request with non-GET method");
            return Err(Parse::Version);
        }
        let uri = Uri::from_maybe_shared(slice.slice(uri_span.0..uri_span.1))
            .map_err(|_| Parse::Uri)?;
        // Simple requests are promoted to HTTP/1.0 internally.
        let version = if flags.contains(Flags::VER_11) {
            Version::HTTP_11
        } else {
            Version::HTTP_10
        };

        let mut header_map = HeaderMap::with_capacity(num_headers);
        fill_headers(&slice, &headers[..num_headers], &mut header_map)?;

        Ok(Some(ParsedMessage {
            head: MessageHead {
                version,
                subject: RequestLine(method, uri),
                headers: header_map,
            },
            len,
            flags,
            body_len,
        }))
    }

    fn decoder(
        parsed: &ParsedMessage<RequestLine>,
        req_method: &mut Option<Method>,
    ) -> Result<Decode, Parse> {
        *req_method = Some(parsed.head.subject.0.clone());

        // A CONNECT request has no body; the tunnel only opens once
        // the server answers 2xx.
        if parsed.head.subject.0 == Method::CONNECT {
            return Ok(Decode::Normal(BodyFramer::length(0)));
        }

        if parsed.flags.contains(Flags::XFER_ENC) {
            if !parsed.flags.contains(Flags::VER_11) {
                debug!("HTTP/1.0 request with transfer-encoding");
                return Err(Parse::Header(
                    crate::error::Header::TransferEncodingUnexpected,
                ));
            }
            if parsed.flags.contains(Flags::CHNK) {
                return Ok(Decode::Normal(BodyFramer::chunked()));
            }
            // A request whose final encoding is not chunked has no
            // reliable length.
            debug!("request transfer-encoding does not end with chunked");
            return Err(Parse::Header(
                crate::error::Header::TransferEncodingInvalid,
            ));
        }
        if parsed.flags.contains(Flags::CLEN) {
            let len = DecodedLength::checked_new(parsed.body_len)?;
            return Ok(Decode::Normal(BodyFramer::length(len.danger_len())));
        }
        Ok(Decode::Normal(BodyFramer::length(0)))
    }

    fn encode(
        head: &mut MessageHead<StatusCode>,
        body: DecodedLength,
        dst: &mut Vec<u8>,
    ) -> BodyWriter {
        trace!(
            "ServerTransaction::encode status={:?} body={:?}",
            head.subject,
            body
        );
        let init_cap = 30 + head.headers.len() * AVERAGE_HEADER_SIZE;
        dst.reserve(init_cap);

        match head.version {
            Version::HTTP_10 => extend(dst, b"HTTP/1.0 "),
            _ => extend(dst, b"HTTP/1.1 "),
        }
        extend(dst, head.subject.as_str().as_bytes());
        extend(dst, b" ");
        extend(
            dst,
            head.subject
                .canonical_reason()
                .unwrap_or("<none>")
                .as_bytes(),
        );
        extend(dst, b"\r\n");

        write_headers(&head.headers, dst);
        if !head.headers.contains_key(header::DATE) {
            extend(dst, b"date: ");
            extend(
                dst,
                httpdate::fmt_http_date(std::time::SystemTime::now()).as_bytes(),
            );
            extend(dst, b"\r\n");
        }
        extend(dst, b"\r\n");

        BodyWriter::for_length(body)
    }

    fn is_server() -> bool {
        true
    }
}

impl Http1Transaction for ClientTransaction {
    type Incoming = StatusCode;
    type Outgoing = RequestLine;
    const LOG: &'static str = "{role=backend}";

    fn parse(buf: &mut BytesMut, ctx: ParseContext<'_>) -> ParseResult<StatusCode> {
        if buf.is_empty() {
            return Ok(None);
        }
        let mut headers = [HeaderIndex::default(); MAX_HEADERS];
        let mut out = Output::new(&mut headers);
        let len = match ctx.h1m.parse_headers(&buf[..], &mut out)? {
            ParseStatus::Complete(len) => len,
            ParseStatus::Partial => return Ok(None),
            ParseStatus::TooManyHeaders => return Err(Parse::TooLarge),
        };
        trace!("response head complete ({} bytes, {} headers)", len, out.num_headers);
        debug_assert!(ctx.h1m.is_done());

        let flags = ctx.h1m.flags;
        let body_len = ctx.h1m.body_len;
        let num_headers = out.num_headers;
        let code = match out.start_line {
            StartLine::Res { code, .. } => code,
            _ => return Err(Parse::Internal),
        };
        let slice = buf.split_to(len).freeze();

        let status = StatusCode::from_u16(code).map_err(|_| Parse::Status)?;
        let version = if flags.contains(Flags::VER_11) {
            Version::HTTP_11
        } else {
            Version::HTTP_10
        };

        let mut header_map = HeaderMap::with_capacity(num_headers);
        fill_headers(&slice, &headers[..num_headers], &mut header_map)?;

        Ok(Some(ParsedMessage {
            head: MessageHead {
                version,
                subject: status,
                headers: header_map,
            },
            len,
            flags,
            body_len,
        }))
    }

    fn decoder(
        parsed: &ParsedMessage<StatusCode>,
        req_method: &mut Option<Method>,
    ) -> Result<Decode, Parse> {
        // RFC 7230 §3.3.3, response side.
        match parsed.head.subject.as_u16() {
            101 => {
                // Switching protocols: the rest of the connection is a
                // tunnel, delimited by close.
                return Ok(Decode::Final(BodyFramer::until_close()));
            }
            100..=199 => {
                trace!("ignoring informational response: {}", parsed.head.subject);
                return Ok(Decode::Ignore);
            }
            204 | 304 => return Ok(Decode::Normal(BodyFramer::length(0))),
            _ => (),
        }
        match *req_method {
            Some(Method::HEAD) => {
                return Ok(Decode::Normal(BodyFramer::length(0)));
            }
            Some(Method::CONNECT) => {
                if parsed.head.subject.is_success() {
                    // Successful CONNECT: tunnel follows immediately.
                    return Ok(Decode::Final(BodyFramer::until_close()));
                }
            }
            Some(_) => {}
            None => {
                trace!("ClientTransaction::decoder is missing the Method");
            }
        }

        if parsed.flags.contains(Flags::XFER_ENC) {
            if !parsed.flags.contains(Flags::VER_11) {
                debug!("HTTP/1.0 response with transfer-encoding");
                return Err(Parse::Header(
                    crate::error::Header::TransferEncodingUnexpected,
                ));
            }
            if parsed.flags.contains(Flags::CHNK) {
                return Ok(Decode::Normal(BodyFramer::chunked()));
            }
            // Not chunked-final: the body runs to connection close.
            return Ok(Decode::Normal(BodyFramer::until_close()));
        }
        if parsed.flags.contains(Flags::CLEN) {
            let len = DecodedLength::checked_new(parsed.body_len)?;
            return Ok(Decode::Normal(BodyFramer::length(len.danger_len())));
        }
        // A missing transfer length forces close-delimited.
        Ok(Decode::Normal(BodyFramer::until_close()))
    }

    fn encode(
        head: &mut MessageHead<RequestLine>,
        body: DecodedLength,
        dst: &mut Vec<u8>,
    ) -> BodyWriter {
        trace!(
            "ClientTransaction::encode method={:?} body={:?}",
            head.subject.0,
            body
        );
        let init_cap = 30 + head.headers.len() * AVERAGE_HEADER_SIZE;
        dst.reserve(init_cap);

        extend(dst, head.subject.0.as_str().as_bytes());
        extend(dst, b" ");
        if head.subject.0 == Method::CONNECT {
            if let Some(authority) = head.subject.1.authority() {
                extend(dst, authority.as_str().as_bytes());
            }
        } else {
            match head.subject.1.path_and_query() {
                Some(pq) => extend(dst, pq.as_str().as_bytes()),
                None => extend(dst, b"/"),
            }
        }
        match head.version {
            Version::HTTP_10 => extend(dst, b" HTTP/1.0\r\n"),
            _ => extend(dst, b" HTTP/1.1\r\n"),
        }

        write_headers(&head.headers, dst);
        extend(dst, b"\r\n");

        BodyWriter::for_length(body)
    }
}

fn span<'a>(slice: &'a Bytes, (start, end): Span) -> &'a [u8] {
    &slice[start..end]
}

fn fill_headers(
    slice: &Bytes,
    indices: &[HeaderIndex],
    map: &mut HeaderMap,
) -> Result<(), Parse> {
    for idx in indices {
        let name = HeaderName::from_bytes(span(slice, idx.name))
            .map_err(|_| Parse::Header(crate::error::Header::Token))?;
        let raw = span(slice, idx.value);
        let value = if raw.iter().any(|&b| b == b'\r' || b == b'\n') {
            // Folded value: collapse CR/LF/HT runs into single spaces.
            HeaderValue::from_maybe_shared(Bytes::from(unfold(raw)))
        } else {
            HeaderValue::from_maybe_shared(slice.slice(idx.value.0..idx.value.1))
        };
        let value = value.map_err(|_| Parse::Header(crate::error::Header::Token))?;
        map.append(name, value);
    }
    Ok(())
}

fn unfold(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut in_ws = false;
    for &b in raw {
        match b {
            b'\r' | b'\n' | b'\t' | b' ' => {
                in_ws = true;
            }
            _ => {
                if in_ws && !out.is_empty() {
                    out.push(b' ');
                }
                in_ws = false;
                out.push(b);
            }
        }
    }
    out
}

fn write_headers(headers: &HeaderMap, dst: &mut Vec<u8>) {
    for (name, value) in headers {
        extend(dst, name.as_str().as_bytes());
        extend(dst, b": ");
        extend(dst, value.as_bytes());
        extend(dst, b"\r\n");
    }
}

#[inline]
fn extend(dst: &mut Vec<u8>, data: &[u8]) {
    dst.extend_from_slice(data);
}
