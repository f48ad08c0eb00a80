//! Registration state machine.

use std::fmt;

/// Lifecycle state of an export or import.
///
/// ```text
/// PreInit ──► Open ──► Closed
///               │        ▲
///               ▼        │
///             Error ─────┘
/// ```
///
/// `Error → Open` is legal for exports only (an update clears a transient
/// failure). `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationState {
    /// Created, not yet published.
    PreInit,
    /// Live.
    Open,
    /// Failed; resources may be gone.
    Error,
    /// Closed for good.
    Closed,
}

impl RegistrationState {
    /// True for `Closed`.
    pub fn is_terminal(self) -> bool {
        self == RegistrationState::Closed
    }

    /// Whether `self → next` is allowed. `export` enables `Error → Open`.
    pub fn can_transition(self, next: RegistrationState, export: bool) -> bool {
        use RegistrationState::*;
        match (self, next) {
            (PreInit, Open) | (PreInit, Error) | (PreInit, Closed) => true,
            (Open, Error) | (Open, Closed) => true,
            (Error, Closed) => true,
            (Error, Open) => export,
            _ => false,
        }
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegistrationState::PreInit => "PRE_INIT",
            RegistrationState::Open => "OPEN",
            RegistrationState::Error => "ERROR",
            RegistrationState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::RegistrationState::*;

    #[test]
    fn test_transitions() {
        assert!(PreInit.can_transition(Open, false));
        assert!(Open.can_transition(Error, false));
        assert!(Error.can_transition(Closed, false));
        assert!(Error.can_transition(Open, true));
        assert!(!Error.can_transition(Open, false));
        assert!(!Closed.can_transition(Open, true));
        assert!(!Closed.can_transition(Closed, true));
        assert!(!Open.can_transition(PreInit, true));
        assert!(Closed.is_terminal());
        assert_eq!(Error.to_string(), "ERROR");
    }
}
