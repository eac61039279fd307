//! Incoming body framing.
//!
//! Once a head is parsed, the mux knows how the body is delimited: an
//! exact content-length, chunked, or nothing but connection close.
//! The framer walks the connection's receive buffer in place and
//! carves it into data frames for the stream's channel, the same
//! byte-at-a-time restartable discipline as the head parser: state
//! survives across buffer refills, and every body byte handed out is
//! counted so the forwarded total always matches the advertised
//! length.

use bytes::{Buf, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue};

use crate::common::pool::{BUFFER_RESERVE, BUFFER_SIZE};
use crate::proto::DecodedLength;

/// Extension bytes tolerated across all of one body's size lines.
const CHUNK_EXT_LIMIT: usize = 16 * 1024;

/// Raw bytes tolerated for the whole trailer section.
const TRAILER_BYTES_LIMIT: usize = 16 * 1024;

/// Trailer fields tolerated per message.
const TRAILER_FIELDS_LIMIT: usize = 32;

/// Largest data frame carved out in one step: what a pooled channel
/// buffer can absorb, so a frame never has to spill twice.
const MAX_FRAME: usize = BUFFER_SIZE - BUFFER_RESERVE;

/// What one framing step produced.
#[derive(Debug, PartialEq)]
pub(crate) enum BodyEvent {
    /// A run of body bytes for the peer channel.
    Data(Bytes),
    /// The trailer fields closing a chunked body.
    Trailers(HeaderMap),
    /// The message body is complete.
    Done,
    /// The receive buffer ran dry mid-message; fill it and retry.
    NeedMore,
}

/// Violations of the body framing on the wire.
#[derive(Debug, PartialEq)]
pub(crate) enum FramingError {
    /// A chunk-size line held something other than hex digits.
    ChunkSize,
    /// The hex chunk size overflowed.
    ChunkSizeOverflow,
    /// Chunk data was not followed by CRLF.
    ChunkSeparator,
    /// A chunk extension was oversized or held a bare LF.
    Extension,
    /// The trailer section was oversized or malformed.
    Trailers,
    /// The peer closed before the advertised length arrived.
    PeerClosed,
}

impl std::fmt::Display for FramingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FramingError::ChunkSize => "invalid chunk size line",
            FramingError::ChunkSizeOverflow => "chunk size overflow",
            FramingError::ChunkSeparator => "chunk data not closed by CRLF",
            FramingError::Extension => "invalid chunk extension",
            FramingError::Trailers => "invalid chunk trailers",
            FramingError::PeerClosed => "peer closed before body completed",
        };
        f.write_str(s)
    }
}

impl std::error::Error for FramingError {}

impl From<FramingError> for std::io::Error {
    fn from(err: FramingError) -> std::io::Error {
        let kind = match err {
            FramingError::PeerClosed => std::io::ErrorKind::UnexpectedEof,
            _ => std::io::ErrorKind::InvalidData,
        };
        std::io::Error::new(kind, err)
    }
}

/// The body half of a mux side's parser state: how the message is
/// delimited, where a chunked body stands, and how much has passed.
#[derive(Debug, PartialEq)]
pub(crate) struct BodyFramer {
    framing: Framing,
    /// Body bytes handed to the channel so far.
    curr_len: u64,
}

#[derive(Debug, PartialEq)]
enum Framing {
    /// An exact `Content-Length`: `body_len` bytes pass, then done.
    Length { body_len: u64 },
    /// `Transfer-Encoding: chunked`: size lines, data, trailers.
    Chunked {
        step: ChunkStep,
        /// Unconsumed data bytes of the current chunk.
        chunk_len: u64,
        /// Extension bytes seen so far, across the whole body.
        ext_len: usize,
        /// Raw trailer section, collected until its blank line.
        trailers: Vec<u8>,
    },
    /// No advertised length: the body runs until the peer closes.
    UntilClose { eof: bool },
}

/// Position inside the chunked framing.
#[derive(Clone, Copy, Debug, PartialEq)]
enum ChunkStep {
    /// At a size line; at least one hex digit is required.
    Size,
    /// Past the first digit; digits, LWS, `;`, or CR may follow.
    SizeDigits,
    /// LWS after the size; no more digits allowed.
    SizeLws,
    /// Inside an extension, skipped up to its CR.
    SizeExt,
    /// CR of the size line seen, expecting LF.
    SizeLf,
    /// Passing `chunk_len` data bytes through.
    Data,
    /// Expecting the CR closing the chunk data.
    DataCr,
    /// Expecting the LF closing the chunk data.
    DataLf,
    /// Collecting the trailer section after the last-chunk line.
    Trailers,
    /// Everything consumed.
    Done,
}

impl BodyFramer {
    pub(crate) fn length(body_len: u64) -> BodyFramer {
        BodyFramer {
            framing: Framing::Length { body_len },
            curr_len: 0,
        }
    }

    pub(crate) fn chunked() -> BodyFramer {
        BodyFramer {
            framing: Framing::Chunked {
                step: ChunkStep::Size,
                chunk_len: 0,
                ext_len: 0,
                trailers: Vec::new(),
            },
            curr_len: 0,
        }
    }

    pub(crate) fn until_close() -> BodyFramer {
        BodyFramer {
            framing: Framing::UntilClose { eof: false },
            curr_len: 0,
        }
    }

    /// The wire framing this body uses, for re-framing the message on
    /// the other side of the stream.
    pub(crate) fn advertised(&self) -> DecodedLength {
        match self.framing {
            Framing::Length { body_len } => DecodedLength::new(body_len),
            Framing::Chunked { .. } => DecodedLength::CHUNKED,
            Framing::UntilClose { .. } => DecodedLength::CLOSE_DELIMITED,
        }
    }

    /// Body bytes handed out so far.
    pub(crate) fn bytes_seen(&self) -> u64 {
        self.curr_len
    }

    pub(crate) fn is_done(&self) -> bool {
        match self.framing {
            Framing::Length { body_len } => self.curr_len == body_len,
            Framing::Chunked { step, .. } => step == ChunkStep::Done,
            Framing::UntilClose { eof } => eof,
        }
    }

    /// Whether the body legitimately ends when the peer closes.
    pub(crate) fn is_close_delimited(&self) -> bool {
        matches!(self.framing, Framing::UntilClose { .. })
    }

    /// Record that the peer closed. Only valid on a close-delimited
    /// body; anywhere else an early close is a framing error.
    pub(crate) fn note_eof(&mut self) {
        debug_assert!(self.is_close_delimited());
        if let Framing::UntilClose { ref mut eof } = self.framing {
            *eof = true;
        }
    }

    /// One framing step over the receive buffer, consuming what it
    /// accounts for.
    pub(crate) fn decode(&mut self, buf: &mut BytesMut) -> Result<BodyEvent, FramingError> {
        match self.framing {
            Framing::Length { body_len } => {
                let remaining = body_len - self.curr_len;
                if remaining == 0 {
                    return Ok(BodyEvent::Done);
                }
                if buf.is_empty() {
                    return Ok(BodyEvent::NeedMore);
                }
                let take = frame_size(remaining, buf.len());
                self.curr_len += take as u64;
                trace!("length body: {} of {} through", self.curr_len, body_len);
                Ok(BodyEvent::Data(buf.split_to(take).freeze()))
            }
            Framing::UntilClose { eof } => {
                if buf.is_empty() {
                    return Ok(if eof {
                        BodyEvent::Done
                    } else {
                        BodyEvent::NeedMore
                    });
                }
                let take = std::cmp::min(buf.len(), MAX_FRAME);
                self.curr_len += take as u64;
                Ok(BodyEvent::Data(buf.split_to(take).freeze()))
            }
            Framing::Chunked {
                ref mut step,
                ref mut chunk_len,
                ref mut ext_len,
                ref mut trailers,
            } => loop {
                match *step {
                    ChunkStep::Data => {
                        if buf.is_empty() {
                            return Ok(BodyEvent::NeedMore);
                        }
                        let take = frame_size(*chunk_len, buf.len());
                        *chunk_len -= take as u64;
                        if *chunk_len == 0 {
                            *step = ChunkStep::DataCr;
                        }
                        self.curr_len += take as u64;
                        return Ok(BodyEvent::Data(buf.split_to(take).freeze()));
                    }
                    ChunkStep::Trailers => {
                        // Collect raw trailer bytes up to the blank
                        // line; `0\r\n` immediately followed by CRLF
                        // means there are none.
                        while let Some(&b) = buf.first() {
                            buf.advance(1);
                            trailers.push(b);
                            if trailers.len() > TRAILER_BYTES_LIMIT {
                                return Err(FramingError::Trailers);
                            }
                            let done = trailers.ends_with(b"\r\n")
                                && (trailers.len() == 2 || trailers.ends_with(b"\r\n\r\n"));
                            if done {
                                *step = ChunkStep::Done;
                                if trailers.len() > 2 {
                                    trace!("chunked body ends with trailers");
                                    return parse_trailer_fields(trailers)
                                        .map(BodyEvent::Trailers);
                                }
                                return Ok(BodyEvent::Done);
                            }
                        }
                        return Ok(BodyEvent::NeedMore);
                    }
                    ChunkStep::Done => return Ok(BodyEvent::Done),
                    line_step => {
                        let b = match buf.first() {
                            Some(&b) => b,
                            None => return Ok(BodyEvent::NeedMore),
                        };
                        buf.advance(1);
                        *step = step_line(line_step, b, chunk_len, ext_len)?;
                    }
                }
            },
        }
    }
}

/// Advance the line-oriented part of the chunked framing by one byte.
fn step_line(
    step: ChunkStep,
    b: u8,
    chunk_len: &mut u64,
    ext_len: &mut usize,
) -> Result<ChunkStep, FramingError> {
    match step {
        ChunkStep::Size => match hex_digit(b) {
            Some(d) => {
                *chunk_len = u64::from(d);
                Ok(ChunkStep::SizeDigits)
            }
            None => Err(FramingError::ChunkSize),
        },
        ChunkStep::SizeDigits => match b {
            b'\r' => Ok(ChunkStep::SizeLf),
            b' ' | b'\t' => Ok(ChunkStep::SizeLws),
            b';' => Ok(ChunkStep::SizeExt),
            _ => match hex_digit(b) {
                Some(d) => {
                    *chunk_len = chunk_len
                        .checked_mul(16)
                        .and_then(|n| n.checked_add(u64::from(d)))
                        .ok_or(FramingError::ChunkSizeOverflow)?;
                    Ok(ChunkStep::SizeDigits)
                }
                None => Err(FramingError::ChunkSize),
            },
        },
        ChunkStep::SizeLws => match b {
            b' ' | b'\t' => Ok(ChunkStep::SizeLws),
            b';' => Ok(ChunkStep::SizeExt),
            b'\r' => Ok(ChunkStep::SizeLf),
            _ => Err(FramingError::ChunkSize),
        },
        ChunkStep::SizeExt => match b {
            b'\r' => Ok(ChunkStep::SizeLf),
            // A bare LF inside an extension is how size-line smuggling
            // starts; reject it outright.
            b'\n' => Err(FramingError::Extension),
            _ => {
                *ext_len += 1;
                if *ext_len > CHUNK_EXT_LIMIT {
                    Err(FramingError::Extension)
                } else {
                    Ok(ChunkStep::SizeExt)
                }
            }
        },
        ChunkStep::SizeLf => match b {
            b'\n' if *chunk_len > 0 => {
                trace!("chunk of {} bytes", chunk_len);
                Ok(ChunkStep::Data)
            }
            b'\n' => Ok(ChunkStep::Trailers),
            _ => Err(FramingError::ChunkSize),
        },
        ChunkStep::DataCr => match b {
            b'\r' => Ok(ChunkStep::DataLf),
            _ => Err(FramingError::ChunkSeparator),
        },
        ChunkStep::DataLf => match b {
            b'\n' => Ok(ChunkStep::Size),
            _ => Err(FramingError::ChunkSeparator),
        },
        ChunkStep::Data | ChunkStep::Trailers | ChunkStep::Done => {
            unreachable!("step_line on non-line step {:?}", step)
        }
    }
}

/// Clamp one data frame to what remains, what is buffered, and what a
/// channel buffer can take.
fn frame_size(remaining: u64, buffered: usize) -> usize {
    let cap = std::cmp::min(remaining, MAX_FRAME as u64) as usize;
    std::cmp::min(cap, buffered)
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// The raw trailer section (blank line included) into a header map.
/// The field syntax is ordinary header syntax, so this leans on the
/// same helper the rest of the ecosystem uses for that.
fn parse_trailer_fields(raw: &[u8]) -> Result<HeaderMap, FramingError> {
    let mut fields = [httparse::EMPTY_HEADER; TRAILER_FIELDS_LIMIT];
    match httparse::parse_headers(raw, &mut fields) {
        Ok(httparse::Status::Complete((_, parsed))) => {
            let mut map = HeaderMap::with_capacity(parsed.len());
            for field in parsed {
                let name = HeaderName::from_bytes(field.name.as_bytes())
                    .map_err(|_| FramingError::Trailers)?;
                let value = HeaderValue::from_bytes(field.value)
                    .map_err(|_| FramingError::Trailers)?;
                map.append(name, value);
            }
            Ok(map)
        }
        Ok(httparse::Status::Partial) | Err(_) => Err(FramingError::Trailers),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(framer: &mut BodyFramer, input: &[u8]) -> (Vec<u8>, Option<HeaderMap>, bool) {
        let mut buf = BytesMut::from(input);
        let mut data = Vec::new();
        let mut trailers = None;
        loop {
            match framer.decode(&mut buf).expect("framing") {
                BodyEvent::Data(b) => data.extend_from_slice(&b),
                BodyEvent::Trailers(t) => trailers = Some(t),
                BodyEvent::Done => return (data, trailers, true),
                BodyEvent::NeedMore => return (data, trailers, false),
            }
        }
    }

    #[test]
    fn length_framing_counts_every_byte() {
        let mut framer = BodyFramer::length(7);
        let (data, _, done) = drain(&mut framer, b"hello world");
        assert_eq!(data, b"hello w");
        assert!(done);
        assert!(framer.is_done());
        // The forwarded total matches the advertised length exactly.
        assert_eq!(framer.bytes_seen(), 7);
    }

    #[test]
    fn length_framing_waits_for_missing_bytes() {
        let mut framer = BodyFramer::length(5);
        let (data, _, done) = drain(&mut framer, b"abc");
        assert_eq!(data, b"abc");
        assert!(!done, "two bytes still owed");
        assert!(!framer.is_done());

        let (data, _, done) = drain(&mut framer, b"de");
        assert_eq!(data, b"de");
        assert!(done);
        assert_eq!(framer.bytes_seen(), 5);
    }

    #[test]
    fn chunked_single_chunk() {
        let mut framer = BodyFramer::chunked();
        let (data, trailers, done) = drain(&mut framer, b"5\r\nhello\r\n0\r\n\r\n");
        assert_eq!(data, b"hello");
        assert!(trailers.is_none());
        assert!(done);
        assert_eq!(framer.bytes_seen(), 5);
    }

    #[test]
    fn chunked_restarts_at_any_byte_boundary() {
        // The framer must produce identical output no matter how the
        // bytes dribble in; feed the whole body one byte at a time.
        let wire = b"4\r\nwiki\r\n5\r\npedia\r\nE\r\n in\r\n\r\nchunks.\r\n0\r\n\r\n";
        let mut framer = BodyFramer::chunked();
        let mut buf = BytesMut::new();
        let mut data = Vec::new();
        let mut done = false;
        for &b in wire.iter() {
            buf.extend_from_slice(&[b]);
            loop {
                match framer.decode(&mut buf).expect("framing") {
                    BodyEvent::Data(d) => data.extend_from_slice(&d),
                    BodyEvent::Trailers(_) => {}
                    BodyEvent::Done => {
                        done = true;
                        break;
                    }
                    BodyEvent::NeedMore => break,
                }
            }
        }
        assert!(done);
        assert_eq!(data, b"wikipedia in\r\n\r\nchunks.");
        assert_eq!(framer.bytes_seen(), data.len() as u64);
    }

    #[test]
    fn chunked_uppercase_size_and_extension_ignored() {
        let mut framer = BodyFramer::chunked();
        let (data, _, done) = drain(&mut framer, b"A;name=value\r\n0123456789\r\n0\r\n\r\n");
        assert_eq!(data, b"0123456789");
        assert!(done);
    }

    #[test]
    fn chunked_size_with_trailing_lws() {
        let mut framer = BodyFramer::chunked();
        let (data, _, done) = drain(&mut framer, b"5 \t\r\nhello\r\n0\r\n\r\n");
        assert_eq!(data, b"hello");
        assert!(done);

        // Digits after LWS would reopen the size; refuse them.
        let mut framer = BodyFramer::chunked();
        let mut buf = BytesMut::from(&b"5 5\r\n"[..]);
        let mut err = None;
        loop {
            match framer.decode(&mut buf) {
                Ok(BodyEvent::NeedMore) | Ok(BodyEvent::Done) => break,
                Ok(_) => {}
                Err(e) => {
                    err = Some(e);
                    break;
                }
            }
        }
        assert_eq!(err, Some(FramingError::ChunkSize));
    }

    #[test]
    fn chunked_trailers_become_fields() {
        let mut framer = BodyFramer::chunked();
        let (data, trailers, done) =
            drain(&mut framer, b"5\r\nhello\r\n0\r\nExpires: never\r\nX-Sum: 1\r\n\r\n");
        assert_eq!(data, b"hello");
        assert!(done);
        let trailers = trailers.expect("trailer fields");
        assert_eq!(trailers.get("expires").unwrap(), "never");
        assert_eq!(trailers.get("x-sum").unwrap(), "1");
    }

    #[test]
    fn chunked_size_overflow_rejected() {
        let mut framer = BodyFramer::chunked();
        let mut buf = BytesMut::from(&b"f0000000000000003\r\n"[..]);
        let err = loop {
            match framer.decode(&mut buf) {
                Ok(BodyEvent::NeedMore) => panic!("must error before running dry"),
                Ok(_) => {}
                Err(e) => break e,
            }
        };
        assert_eq!(err, FramingError::ChunkSizeOverflow);
    }

    #[test]
    fn chunked_extension_with_bare_lf_rejected() {
        let mut framer = BodyFramer::chunked();
        let mut buf = BytesMut::from(&b"5;ext\nno\r\n"[..]);
        let err = loop {
            match framer.decode(&mut buf) {
                Ok(BodyEvent::NeedMore) => panic!("must error before running dry"),
                Ok(_) => {}
                Err(e) => break e,
            }
        };
        assert_eq!(err, FramingError::Extension);
    }

    #[test]
    fn chunked_missing_separator_rejected() {
        let mut framer = BodyFramer::chunked();
        let mut buf = BytesMut::from(&b"5\r\nhelloXY"[..]);
        let err = loop {
            match framer.decode(&mut buf) {
                Ok(BodyEvent::NeedMore) => panic!("must error before running dry"),
                Ok(_) => {}
                Err(e) => break e,
            }
        };
        assert_eq!(err, FramingError::ChunkSeparator);
    }

    #[test]
    fn until_close_runs_to_eof() {
        let mut framer = BodyFramer::until_close();
        assert!(framer.is_close_delimited());

        let (data, _, done) = drain(&mut framer, b"some data");
        assert_eq!(data, b"some data");
        assert!(!done, "still waiting on the peer");

        framer.note_eof();
        let (data, _, done) = drain(&mut framer, b"");
        assert!(data.is_empty());
        assert!(done);
        assert_eq!(framer.bytes_seen(), 9);
    }

    #[test]
    fn zero_length_body_is_born_done() {
        let mut framer = BodyFramer::length(0);
        assert!(framer.is_done());
        let mut buf = BytesMut::from(&b"leftover"[..]);
        assert_eq!(framer.decode(&mut buf).unwrap(), BodyEvent::Done);
        assert_eq!(&buf[..], b"leftover", "nothing past the body is touched");
    }

    #[test]
    fn advertised_reports_the_framing() {
        assert_eq!(BodyFramer::length(9).advertised(), DecodedLength::new(9));
        assert_eq!(BodyFramer::chunked().advertised(), DecodedLength::CHUNKED);
        assert_eq!(
            BodyFramer::until_close().advertised(),
            DecodedLength::CLOSE_DELIMITED
        );
    }
}
