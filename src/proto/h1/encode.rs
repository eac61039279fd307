//! Outgoing body re-framing.
//!
//! The stream decides how each relayed message is delimited on the
//! way out, and that decision can differ from how the bytes arrived
//! (a chunked upstream body may leave close-delimited toward an old
//! client, a sized body stays sized). The writer turns channel chunks
//! into wire segments on the connection's transmit queue: framing
//! prefixes are tiny owned segments, the payload itself is queued
//! as-is, so nothing is copied twice.

use bytes::Bytes;
use http::HeaderMap;

use super::io::TxQueue;
use crate::proto::DecodedLength;

/// The body half of a mux side's transmit state.
#[derive(Debug, PartialEq)]
pub(crate) struct BodyWriter {
    framing: TxFraming,
    /// Payload bytes queued so far.
    sent: u64,
}

#[derive(Debug, PartialEq)]
enum TxFraming {
    /// An exact `Content-Length`: exactly `body_len` bytes go out.
    Length { body_len: u64 },
    /// Re-chunked: each channel chunk becomes one wire chunk.
    Chunked { terminated: bool },
    /// No advertised length: closing the connection ends the body.
    UntilClose,
}

impl BodyWriter {
    pub(crate) fn length(body_len: u64) -> BodyWriter {
        BodyWriter {
            framing: TxFraming::Length { body_len },
            sent: 0,
        }
    }

    pub(crate) fn chunked() -> BodyWriter {
        BodyWriter {
            framing: TxFraming::Chunked { terminated: false },
            sent: 0,
        }
    }

    pub(crate) fn until_close() -> BodyWriter {
        BodyWriter {
            framing: TxFraming::UntilClose,
            sent: 0,
        }
    }

    /// The writer matching a decided outgoing length.
    pub(crate) fn for_length(len: DecodedLength) -> BodyWriter {
        match len {
            DecodedLength::CHUNKED => BodyWriter::chunked(),
            DecodedLength::CLOSE_DELIMITED => BodyWriter::until_close(),
            exact => BodyWriter::length(exact.danger_len()),
        }
    }

    /// Whether every owed byte is queued and no terminator remains.
    pub(crate) fn is_done(&self) -> bool {
        match self.framing {
            TxFraming::Length { body_len } => self.sent == body_len,
            TxFraming::Chunked { terminated } => terminated,
            TxFraming::UntilClose => false,
        }
    }

    pub(crate) fn is_close_delimited(&self) -> bool {
        matches!(self.framing, TxFraming::UntilClose)
    }

    /// Queue one channel chunk, framed for the wire.
    pub(crate) fn write_chunk(&mut self, mut chunk: Bytes, tx: &mut TxQueue) {
        if chunk.is_empty() {
            return;
        }
        match self.framing {
            TxFraming::Length { body_len } => {
                // Never send past the advertised length.
                let room = body_len - self.sent;
                if room == 0 {
                    debug!("sized body already complete, dropping {} bytes", chunk.len());
                    return;
                }
                if (chunk.len() as u64) > room {
                    debug!(
                        "sized body overrun, truncating {} bytes to {}",
                        chunk.len(),
                        room
                    );
                    chunk.truncate(room as usize);
                }
                self.sent += chunk.len() as u64;
                tx.push_segment(chunk);
            }
            TxFraming::Chunked { terminated } => {
                debug_assert!(!terminated, "chunk written after the last-chunk line");
                trace!("re-chunking {} bytes", chunk.len());
                self.sent += chunk.len() as u64;
                tx.push_segment(size_line(chunk.len()));
                tx.push_segment(chunk);
                tx.push_segment(Bytes::from_static(b"\r\n"));
            }
            TxFraming::UntilClose => {
                self.sent += chunk.len() as u64;
                tx.push_segment(chunk);
            }
        }
    }

    /// Queue the trailer fields. Only the chunked framing has a place
    /// for them; elsewhere they are dropped. Returns whether the body
    /// is now terminated.
    pub(crate) fn write_trailers(&mut self, trailers: &HeaderMap, tx: &mut TxQueue) -> bool {
        match self.framing {
            TxFraming::Chunked { ref mut terminated } => {
                let mut tail = Vec::with_capacity(16 + trailers.len() * 32);
                tail.extend_from_slice(b"0\r\n");
                for (name, value) in trailers {
                    tail.extend_from_slice(name.as_str().as_bytes());
                    tail.extend_from_slice(b": ");
                    tail.extend_from_slice(value.as_bytes());
                    tail.extend_from_slice(b"\r\n");
                }
                tail.extend_from_slice(b"\r\n");
                tx.push_segment(Bytes::from(tail));
                *terminated = true;
                true
            }
            _ => {
                trace!("no chunked framing out, dropping trailers");
                false
            }
        }
    }

    /// Close the body: queue the chunked terminator, or verify a sized
    /// body was fully written. An underrun reports how many bytes the
    /// peer was still owed.
    pub(crate) fn finish(&mut self, tx: &mut TxQueue) -> Result<(), u64> {
        match self.framing {
            TxFraming::Length { body_len } => {
                if self.sent < body_len {
                    Err(body_len - self.sent)
                } else {
                    Ok(())
                }
            }
            TxFraming::Chunked { ref mut terminated } => {
                if !*terminated {
                    tx.push_segment(Bytes::from_static(b"0\r\n\r\n"));
                    *terminated = true;
                }
                Ok(())
            }
            TxFraming::UntilClose => Ok(()),
        }
    }
}

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// A chunk-size line, e.g. `1F\r\n`, as its own small segment.
fn size_line(len: usize) -> Bytes {
    // 16 hex digits cover a u64, plus CRLF.
    let mut tmp = [0u8; 18];
    let mut pos = 16;
    let mut n = len;
    loop {
        pos -= 1;
        tmp[pos] = HEX_DIGITS[n & 0xf];
        n >>= 4;
        if n == 0 {
            break;
        }
    }
    tmp[16] = b'\r';
    tmp[17] = b'\n';
    Bytes::copy_from_slice(&tmp[pos..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn queue() -> TxQueue {
        TxQueue::new(false)
    }

    #[test]
    fn size_lines_are_uppercase_hex() {
        assert_eq!(&size_line(0)[..], b"0\r\n");
        assert_eq!(&size_line(7)[..], b"7\r\n");
        assert_eq!(&size_line(13)[..], b"D\r\n");
        assert_eq!(&size_line(0x1f3a)[..], b"1F3A\r\n");
    }

    #[test]
    fn rechunking_frames_each_chunk() {
        let mut tx = queue();
        let mut writer = BodyWriter::chunked();

        writer.write_chunk(Bytes::from_static(b"foo bar"), &mut tx);
        writer.write_chunk(Bytes::from_static(b"baz quux herp"), &mut tx);
        writer.finish(&mut tx).unwrap();

        assert_eq!(
            tx.take_queued(),
            b"7\r\nfoo bar\r\nD\r\nbaz quux herp\r\n0\r\n\r\n".to_vec()
        );
        assert!(writer.is_done());
    }

    #[test]
    fn sized_body_is_capped_at_its_length() {
        let mut tx = queue();
        let mut writer = BodyWriter::length(8);

        writer.write_chunk(Bytes::from_static(b"foo bar"), &mut tx);
        assert!(!writer.is_done());
        writer.finish(&mut tx).expect_err("one byte still owed");

        // The overrun is cut at the advertised length.
        writer.write_chunk(Bytes::from_static(b"baz"), &mut tx);
        assert_eq!(tx.take_queued(), b"foo barb".to_vec());
        assert!(writer.is_done());
        writer.finish(&mut tx).unwrap();

        // Anything more is silently dropped.
        writer.write_chunk(Bytes::from_static(b"extra"), &mut tx);
        assert!(tx.take_queued().is_empty());
    }

    #[test]
    fn short_sized_body_reports_missing_bytes() {
        let mut tx = queue();
        let mut writer = BodyWriter::length(10);
        writer.write_chunk(Bytes::from_static(b"abc"), &mut tx);
        assert_eq!(writer.finish(&mut tx), Err(7));
    }

    #[test]
    fn until_close_passes_bytes_through() {
        let mut tx = queue();
        let mut writer = BodyWriter::until_close();
        writer.write_chunk(Bytes::from_static(b"raw bytes"), &mut tx);
        writer.finish(&mut tx).unwrap();
        assert_eq!(tx.take_queued(), b"raw bytes".to_vec());
        assert!(writer.is_close_delimited());
        assert!(!writer.is_done(), "only the close ends it");
    }

    #[test]
    fn trailers_ride_the_chunked_terminator() {
        let mut tx = queue();
        let mut writer = BodyWriter::chunked();
        writer.write_chunk(Bytes::from_static(b"hi"), &mut tx);

        let mut trailers = HeaderMap::new();
        trailers.insert(
            http::header::HeaderName::from_static("expires"),
            HeaderValue::from_static("never"),
        );
        assert!(writer.write_trailers(&trailers, &mut tx));
        assert!(writer.is_done());
        // `finish` after trailers must not emit a second terminator.
        writer.finish(&mut tx).unwrap();

        assert_eq!(
            tx.take_queued(),
            b"2\r\nhi\r\n0\r\nexpires: never\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn trailers_dropped_without_chunked_framing() {
        let mut tx = queue();
        let mut writer = BodyWriter::length(10);
        assert!(!writer.write_trailers(&HeaderMap::new(), &mut tx));
        assert!(tx.take_queued().is_empty());
    }
}
