//! Analyser bookkeeping and termination accounting.

/// The per-channel analyser bitmask. Bit order is execution order;
/// the stream's driver clears each bit as that analyser finishes its
/// work for the transaction, and a pass that clears nothing while no
/// interface changed state is the fixed point.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct AnMask(u32);

impl AnMask {
    /// Wait for and parse the request head; admission checks.
    pub(crate) const REQ_WAIT_HTTP: AnMask = AnMask(1 << 0);
    /// Stick-counter tracking of the request.
    pub(crate) const REQ_TRACK: AnMask = AnMask(1 << 1);
    /// Server selection, queueing, upstream connect.
    pub(crate) const REQ_LB: AnMask = AnMask(1 << 2);
    /// Forward the request head and body upstream.
    pub(crate) const REQ_FWD: AnMask = AnMask(1 << 3);
    /// Wait for and parse the response head.
    pub(crate) const RES_WAIT_HTTP: AnMask = AnMask(1 << 16);
    /// Forward the response downstream.
    pub(crate) const RES_FWD: AnMask = AnMask(1 << 17);

    pub(crate) fn request_set() -> AnMask {
        AnMask::REQ_WAIT_HTTP | AnMask::REQ_TRACK | AnMask::REQ_LB | AnMask::REQ_FWD
    }

    pub(crate) fn response_set() -> AnMask {
        AnMask::RES_WAIT_HTTP | AnMask::RES_FWD
    }

    pub(crate) fn contains(self, other: AnMask) -> bool {
        (self.0 & other.0) == other.0
    }

    pub(crate) fn insert(&mut self, other: AnMask) {
        self.0 |= other.0;
    }

    pub(crate) fn remove(&mut self, other: AnMask) {
        self.0 &= !other.0;
    }

    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for AnMask {
    type Output = AnMask;
    fn bitor(self, rhs: AnMask) -> AnMask {
        AnMask(self.0 | rhs.0)
    }
}

impl std::fmt::Debug for AnMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AnMask")
            .field(&format_args!("{:#b}", self.0))
            .finish()
    }
}

/// Who ended the stream first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TermInitiator {
    Client,
    Server,
    Proxy,
    Resource,
    Internal,
    Local,
    Killed,
    Up,
}

impl TermInitiator {
    fn as_char(self) -> char {
        match self {
            TermInitiator::Client => 'C',
            TermInitiator::Server => 'S',
            TermInitiator::Proxy => 'P',
            TermInitiator::Resource => 'R',
            TermInitiator::Internal => 'I',
            TermInitiator::Local => 'L',
            TermInitiator::Killed => 'K',
            TermInitiator::Up => 'U',
        }
    }
}

/// Where the stream was when it ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TermPhase {
    Request,
    Queue,
    Connect,
    Headers,
    Data,
    Tarpit,
    Last,
}

impl TermPhase {
    fn as_char(self) -> char {
        match self {
            TermPhase::Request => 'R',
            TermPhase::Queue => 'Q',
            TermPhase::Connect => 'C',
            TermPhase::Headers => 'H',
            TermPhase::Data => 'D',
            TermPhase::Tarpit => 'T',
            TermPhase::Last => 'L',
        }
    }
}

/// Termination accounting: the first initiator and phase stick, later
/// reports are ignored. `timeout` marks a deadline as the trigger.
#[derive(Debug, Default)]
pub(crate) struct Termination {
    first: Option<(TermInitiator, TermPhase)>,
    pub(crate) timeout: bool,
}

impl Termination {
    pub(crate) fn set(&mut self, initiator: TermInitiator, phase: TermPhase) {
        if self.first.is_none() {
            self.first = Some((initiator, phase));
        }
    }

    pub(crate) fn set_timeout(&mut self, initiator: TermInitiator, phase: TermPhase) {
        if self.first.is_none() {
            self.timeout = true;
        }
        self.set(initiator, phase);
    }

    pub(crate) fn initiator(&self) -> Option<TermInitiator> {
        self.first.map(|(i, _)| i)
    }

    pub(crate) fn is_clean(&self) -> bool {
        self.first.is_none()
    }

    /// The two-character code carried into logs, `--` for a clean end.
    pub(crate) fn code(&self) -> [char; 2] {
        match self.first {
            Some((i, p)) => [i.as_char(), p.as_char()],
            None => ['-', '-'],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_order_and_ops() {
        let mut mask = AnMask::request_set();
        assert!(mask.contains(AnMask::REQ_WAIT_HTTP));
        assert!(mask.contains(AnMask::REQ_FWD));
        assert!(!mask.contains(AnMask::RES_FWD));

        mask.remove(AnMask::REQ_WAIT_HTTP);
        assert!(!mask.contains(AnMask::REQ_WAIT_HTTP));
        mask.remove(AnMask::REQ_TRACK | AnMask::REQ_LB | AnMask::REQ_FWD);
        assert!(mask.is_empty());
    }

    #[test]
    fn first_termination_wins() {
        let mut term = Termination::default();
        assert_eq!(term.code(), ['-', '-']);
        assert!(term.is_clean());

        term.set_timeout(TermInitiator::Client, TermPhase::Request);
        term.set(TermInitiator::Server, TermPhase::Data);
        assert_eq!(term.code(), ['C', 'R']);
        assert!(term.timeout);
        assert_eq!(term.initiator(), Some(TermInitiator::Client));
    }
}
