//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can have crossbar `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur while proxying streams.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    Parse(Parse),
    /// A message reached EOF, but is not complete.
    IncompleteMessage,
    /// A connection received a message (or bytes) when not waiting for one.
    #[allow(unused)]
    UnexpectedMessage,
    /// A deadline elapsed before the guarded operation finished.
    Timeout(Timeout),
    /// Error occurred while connecting to an upstream server.
    Connect,
    /// The connect retry budget was exhausted.
    RetriesExhausted,
    /// A backend had no server able to take the stream.
    NoServerAvailable,
    /// A pending item was dropped before ever being processed.
    #[allow(unused)]
    Canceled,
    /// An `io::Error` that occurred while trying to read or write to a
    /// network stream.
    Io,
    /// Error creating a TcpListener.
    Listen,
    /// Error accepting a frontend connection.
    Accept,
    /// The shared buffer pool was exhausted and the deadline passed
    /// before a buffer was offered back.
    #[allow(unused)]
    BufferExhausted,
    /// A DNS resolution failed.
    Dns(Dns),
    /// Error calling AsyncWrite::shutdown().
    #[allow(unused)]
    Shutdown,
}

#[derive(Debug)]
pub(crate) enum Parse {
    Method,
    Version,
    Uri,
    Header(Header),
    TooLarge,
    Status,
    #[allow(unused)]
    Internal,
}

#[derive(Debug)]
pub(crate) enum Header {
    Token,
    ContentLengthInvalid,
    TransferEncodingInvalid,
    TransferEncodingUnexpected,
}

/// Which guarded operation timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// The client took too long to send a complete request.
    Client,
    /// The server took too long to produce a response.
    Server,
    /// The upstream TCP connect did not complete in time.
    Connect,
    /// The stream spent too long queued at a server or backend.
    Queue,
    /// The tarpit hold expired (this one is deliberate).
    Tarpit,
}

#[derive(Debug)]
pub(crate) enum Dns {
    /// The nameserver answered NXDOMAIN.
    NxDomain,
    /// The nameserver refused the query.
    Refused,
    /// The response had the TC bit set.
    Truncated,
    /// The response did not parse, or broke a protocol rule.
    Invalid,
    /// A CNAME chain ended without an address record.
    Cname,
    /// No nameserver answered within the retry budget.
    NoAnswer,
}

impl Error {
    /// Returns true if this was an HTTP parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this was a parse error caused by a message that
    /// was too large.
    pub fn is_parse_too_large(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(Parse::TooLarge))
    }

    /// Returns true if the error was caused by a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout(_))
    }

    /// Returns which deadline elapsed, if this is a timeout error.
    pub fn timeout_kind(&self) -> Option<Timeout> {
        match self.inner.kind {
            Kind::Timeout(which) => Some(which),
            _ => None,
        }
    }

    /// Returns true if this was an error from an upstream connect.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect | Kind::RetriesExhausted)
    }

    /// Returns true if the connect retry budget was used up.
    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self.inner.kind, Kind::RetriesExhausted)
    }

    /// Returns true if this was about a stream that was canceled.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// Returns true if the connection closed before a message could
    /// complete.
    pub fn is_incomplete_message(&self) -> bool {
        matches!(self.inner.kind, Kind::IncompleteMessage)
    }

    /// Returns true if this was a DNS resolution error.
    pub fn is_dns(&self) -> bool {
        matches!(self.inner.kind, Kind::Dns(_))
    }

    /// Returns true if this was an I/O error on a transport.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    #[allow(unused)]
    pub(crate) fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    pub(crate) fn new_incomplete() -> Error {
        Error::new(Kind::IncompleteMessage)
    }

    pub(crate) fn new_too_large() -> Error {
        Error::new(Kind::Parse(Parse::TooLarge))
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_listen<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(crate) fn new_accept<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Accept).with(cause)
    }

    pub(crate) fn new_connect<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Connect).with(cause)
    }

    pub(crate) fn new_retries_exhausted<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::RetriesExhausted).with(cause)
    }

    pub(crate) fn new_no_server() -> Error {
        Error::new(Kind::NoServerAvailable)
    }

    pub(crate) fn new_timeout(which: Timeout) -> Error {
        Error::new(Kind::Timeout(which))
    }

    pub(crate) fn new_dns(kind: Dns) -> Error {
        Error::new(Kind::Dns(kind))
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Method) => "invalid HTTP method parsed",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Uri) => "invalid URI",
            Kind::Parse(Parse::Header(Header::Token)) => "invalid HTTP header parsed",
            Kind::Parse(Parse::Header(Header::ContentLengthInvalid)) => {
                "invalid content-length parsed"
            }
            Kind::Parse(Parse::Header(Header::TransferEncodingInvalid)) => {
                "invalid transfer-encoding parsed"
            }
            Kind::Parse(Parse::Header(Header::TransferEncodingUnexpected)) => {
                "unexpected transfer-encoding parsed"
            }
            Kind::Parse(Parse::TooLarge) => "message head is too large",
            Kind::Parse(Parse::Status) => "invalid HTTP status-code parsed",
            Kind::Parse(Parse::Internal) => "internal error inside crossbar",
            Kind::IncompleteMessage => "connection closed before message completed",
            Kind::UnexpectedMessage => "received unexpected message from connection",
            Kind::Timeout(Timeout::Client) => "client timeout",
            Kind::Timeout(Timeout::Server) => "server timeout",
            Kind::Timeout(Timeout::Connect) => "connect timeout",
            Kind::Timeout(Timeout::Queue) => "queue timeout",
            Kind::Timeout(Timeout::Tarpit) => "tarpit hold elapsed",
            Kind::Connect => "error trying to connect",
            Kind::RetriesExhausted => "connect retries exhausted",
            Kind::NoServerAvailable => "no server is available to handle the stream",
            Kind::Canceled => "operation was canceled",
            Kind::Io => "connection error",
            Kind::Listen => "error creating frontend listener",
            Kind::Accept => "error accepting connection",
            Kind::BufferExhausted => "buffer pool exhausted",
            Kind::Dns(Dns::NxDomain) => "dns: non-existent domain",
            Kind::Dns(Dns::Refused) => "dns: query refused",
            Kind::Dns(Dns::Truncated) => "dns: response truncated",
            Kind::Dns(Dns::Invalid) => "dns: invalid response",
            Kind::Dns(Dns::Cname) => "dns: CNAME chain without address record",
            Kind::Dns(Dns::NoAnswer) => "dns: no nameserver answered",
            Kind::Shutdown => "error shutting down connection",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("crossbar::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<Parse> for Error {
    fn from(err: Parse) -> Error {
        Error::new(Kind::Parse(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn error_size_of() {
        assert_eq!(mem::size_of::<Error>(), mem::size_of::<usize>());
    }

    #[test]
    fn timeout_kinds_surface() {
        let err = Error::new_timeout(Timeout::Connect);
        assert!(err.is_timeout());
        assert_eq!(err.timeout_kind(), Some(Timeout::Connect));
        assert!(!err.is_parse());
    }

    #[test]
    fn cause_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "nope");
        let err = Error::new_connect(io);
        assert!(err.is_connect());
        assert!(err.into_cause().is_some());
    }
}
