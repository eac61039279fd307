//! Stream interfaces: the per-side endpoints of a stream.

use tokio::time::Instant;

/// Progression of one side of a stream.
///
/// The server side walks the whole ladder; the client side only ever
/// sees `Ini -> Est -> Dis -> Clo`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum SiState {
    /// Not started.
    Ini,
    /// Waiting for a server assignment.
    Req,
    /// Parked in a pending queue.
    Que,
    /// Held in the tarpit before an error reply.
    Tar,
    /// A server has been assigned.
    Ass,
    /// TCP connect in progress.
    Con,
    /// Connect failed, a retry is pending.
    Cer,
    /// Transport ready, not yet exchanging data.
    Rdy,
    /// Established, data flowing.
    Est,
    /// Tearing down.
    Dis,
    /// Fully closed.
    Clo,
}

/// Why an interface failed, when it did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SiError {
    None,
    /// Connection refused or reset during setup.
    ConnRefused,
    /// An operation ran past its deadline.
    Timeout,
    /// The peer aborted mid-transfer.
    Abort,
    /// Everything else.
    Internal,
}

#[derive(Debug)]
pub(crate) struct StreamInterface {
    pub(crate) state: SiState,
    pub(crate) prev_state: SiState,
    pub(crate) err: SiError,
    /// Deadline of the operation the interface is blocked on
    /// (connect, queue wait, tarpit hold).
    pub(crate) exp: Option<Instant>,
}

impl StreamInterface {
    pub(crate) fn new() -> StreamInterface {
        StreamInterface {
            state: SiState::Ini,
            prev_state: SiState::Ini,
            err: SiError::None,
            exp: None,
        }
    }

    /// Move to `state`, remembering where we came from so a pass can
    /// detect that something changed.
    pub(crate) fn set_state(&mut self, state: SiState) {
        if self.state != state {
            trace!("si {:?} -> {:?}", self.state, state);
            self.prev_state = self.state;
            self.state = state;
        }
    }

    /// Whether the last pass changed this interface.
    pub(crate) fn state_changed(&self) -> bool {
        self.prev_state != self.state
    }

    pub(crate) fn settle(&mut self) {
        self.prev_state = self.state;
    }

    pub(crate) fn fail(&mut self, err: SiError) {
        if self.err == SiError::None {
            self.err = err;
        }
        self.set_state(SiState::Dis);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_record_previous_state() {
        let mut si = StreamInterface::new();
        si.set_state(SiState::Req);
        assert!(si.state_changed());
        si.settle();
        assert!(!si.state_changed());

        si.set_state(SiState::Req);
        assert!(!si.state_changed(), "same-state set is not a change");
    }

    #[test]
    fn first_error_wins() {
        let mut si = StreamInterface::new();
        si.fail(SiError::Timeout);
        si.fail(SiError::Abort);
        assert_eq!(si.err, SiError::Timeout);
        assert_eq!(si.state, SiState::Dis);
    }

    #[test]
    fn ladder_is_ordered() {
        // The queue states sit strictly between request and assign.
        assert!(SiState::Req < SiState::Que);
        assert!(SiState::Que < SiState::Ass);
        assert!(SiState::Con < SiState::Est);
        assert!(SiState::Est < SiState::Clo);
    }
}
