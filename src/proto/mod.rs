//! Pieces pertaining to the HTTP message protocol.

use http::{HeaderMap, Method, StatusCode, Uri, Version};

pub(crate) mod h1;

/// An incoming message head. Includes request/status line, and headers.
#[derive(Debug, Default)]
pub(crate) struct MessageHead<S> {
    /// HTTP version of the message.
    pub(crate) version: Version,
    /// Subject (request line or status line) of the message.
    pub(crate) subject: S,
    /// Headers of the message.
    pub(crate) headers: HeaderMap,
}

/// An incoming request message head.
pub(crate) type RequestHead = MessageHead<RequestLine>;

#[derive(Debug, Default, PartialEq)]
pub(crate) struct RequestLine(pub(crate) Method, pub(crate) Uri);

/// An incoming response message head.
pub(crate) type ResponseHead = MessageHead<StatusCode>;

/// The length of a message body, as framed on the wire.
///
/// A `u64` with two reserved sentinel values, so the common case stays
/// a plain integer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct DecodedLength(u64);

impl DecodedLength {
    pub(crate) const CLOSE_DELIMITED: DecodedLength = DecodedLength(u64::MAX);
    pub(crate) const CHUNKED: DecodedLength = DecodedLength(u64::MAX - 1);
    pub(crate) const ZERO: DecodedLength = DecodedLength(0);

    const MAX_LEN: u64 = u64::MAX - 2;

    pub(crate) fn new(len: u64) -> Self {
        debug_assert!(len <= Self::MAX_LEN);
        DecodedLength(len)
    }

    /// Takes the length as a content-length without other checks.
    ///
    /// Should only be called if previously confirmed this isn't
    /// CLOSE_DELIMITED or CHUNKED.
    #[inline]
    pub(crate) fn danger_len(self) -> u64 {
        debug_assert!(self.0 < Self::CHUNKED.0);
        self.0
    }

    /// Checks the `u64` is within the maximum allowed for content-length.
    pub(crate) fn checked_new(len: u64) -> Result<Self, crate::error::Parse> {
        if len <= Self::MAX_LEN {
            Ok(DecodedLength(len))
        } else {
            warn!("content-length bigger than maximum: {} > {}", len, Self::MAX_LEN);
            Err(crate::error::Parse::Header(
                crate::error::Header::ContentLengthInvalid,
            ))
        }
    }
}

impl std::fmt::Debug for DecodedLength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            DecodedLength::CLOSE_DELIMITED => f.write_str("CLOSE_DELIMITED"),
            DecodedLength::CHUNKED => f.write_str("CHUNKED"),
            DecodedLength(n) => f.debug_tuple("DecodedLength").field(&n).finish(),
        }
    }
}

impl std::fmt::Display for DecodedLength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            DecodedLength::CLOSE_DELIMITED => f.write_str("close-delimited"),
            DecodedLength::CHUNKED => f.write_str("chunked encoding"),
            DecodedLength(n) => write!(f, "content-length ({} bytes)", n),
        }
    }
}

/// How a connection should behave once the current transaction is done.
///
/// Decided once per side of the transaction, then enforced by header
/// rewriting when the message head is re-emitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnectionMode {
    /// Reset for another transaction on the same connection.
    KeepAlive,
    /// Half of `server-close`: the frontend side keeps alive, the
    /// backend connection closes after the response.
    ServerClose,
    /// Close once the transaction completes.
    Close,
    /// Pass bytes opaquely in both directions (CONNECT, 101).
    Tunnel,
}

impl ConnectionMode {
    pub(crate) fn is_keep_alive(self) -> bool {
        matches!(self, ConnectionMode::KeepAlive)
    }

    pub(crate) fn is_tunnel(self) -> bool {
        matches!(self, ConnectionMode::Tunnel)
    }
}
