use std::fmt;

/// Lifecycle state of the single connection owned by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Closed,
    Probing,
    Connecting,
    Open,
    Reconnecting,
    Disposed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Probing => write!(f, "probing"),
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Disposed => write!(f, "disposed"),
        }
    }
}

/// Inputs driving [`transition`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A new attempt begins; any previous socket is neutralized first
    AttemptStarted,
    ProbePassed,
    ProbeFailed,
    SocketOpened,
    /// Connect failed or the connect guard fired
    SocketFailed,
    /// An open socket closed or errored
    SocketClosed,
    /// The backoff controller is waiting before the next attempt
    RetryScheduled,
    Dispose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub event: ConnectionEvent,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid transition from {} on {:?}", self.from, self.event)
    }
}

impl std::error::Error for InvalidTransition {}

/// Pure transition function of the connection state machine.
///
/// `Disposed` is absorbing: every event other than a repeated `Dispose`
/// is rejected once it is reached.
pub const fn transition(
    from: ConnectionState,
    event: ConnectionEvent,
) -> Result<ConnectionState, InvalidTransition> {
    use ConnectionEvent as E;
    use ConnectionState as S;

    let next = match (from, event) {
        (_, E::Dispose) => S::Disposed,
        (S::Disposed, _) => return Err(InvalidTransition { from, event }),

        (S::Closed | S::Open | S::Reconnecting, E::AttemptStarted) => S::Probing,
        (S::Probing, E::ProbePassed) => S::Connecting,
        (S::Probing, E::ProbeFailed) | (S::Connecting, E::SocketFailed) => S::Closed,
        (S::Connecting, E::SocketOpened) => S::Open,
        (S::Open, E::SocketClosed) => S::Closed,
        (S::Closed | S::Reconnecting, E::RetryScheduled) => S::Reconnecting,

        _ => return Err(InvalidTransition { from, event }),
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionEvent as E;
    use ConnectionState as S;

    fn run(events: &[ConnectionEvent]) -> Result<ConnectionState, InvalidTransition> {
        events
            .iter()
            .try_fold(S::Closed, |state, event| transition(state, *event))
    }

    #[test]
    fn test_happy_path() {
        assert_eq!(
            run(&[E::AttemptStarted, E::ProbePassed, E::SocketOpened]),
            Ok(S::Open)
        );
    }

    #[test]
    fn test_probe_failure_returns_to_closed() {
        assert_eq!(run(&[E::AttemptStarted, E::ProbeFailed]), Ok(S::Closed));
    }

    #[test]
    fn test_retry_cycle() {
        assert_eq!(
            run(&[
                E::AttemptStarted,
                E::ProbePassed,
                E::SocketFailed,
                E::RetryScheduled,
                E::AttemptStarted,
                E::ProbePassed,
                E::SocketOpened,
                E::SocketClosed,
            ]),
            Ok(S::Closed)
        );
    }

    #[test]
    fn test_reinitialize_from_open() {
        assert_eq!(transition(S::Open, E::AttemptStarted), Ok(S::Probing));
    }

    #[test]
    fn test_open_requires_connecting() {
        assert!(transition(S::Closed, E::SocketOpened).is_err());
        assert!(transition(S::Probing, E::SocketOpened).is_err());
    }

    #[test]
    fn test_disposed_is_absorbing() {
        for event in [
            E::AttemptStarted,
            E::ProbePassed,
            E::ProbeFailed,
            E::SocketOpened,
            E::SocketFailed,
            E::SocketClosed,
            E::RetryScheduled,
        ] {
            assert!(transition(S::Disposed, event).is_err(), "{:?}", event);
        }
        assert_eq!(transition(S::Disposed, E::Dispose), Ok(S::Disposed));
    }
}
