pub mod queue;

/// Tracks a single upstream operation that may be requested again while it runs.
///
/// At most one operation is ever in flight; requests that arrive meanwhile collapse into a
/// single repeat.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum OperationState {
    #[default]
    Idle,
    InFlight,
    InFlightPendingRepeat,
}

impl OperationState {
    /// Returns true if the caller should start the operation now. Otherwise a repeat is
    /// recorded.
    pub(crate) fn begin(&mut self) -> bool {
        match self {
            OperationState::Idle => {
                *self = OperationState::InFlight;
                true
            },
            OperationState::InFlight | OperationState::InFlightPendingRepeat => {
                *self = OperationState::InFlightPendingRepeat;
                false
            },
        }
    }

    /// Marks the operation done, returning whether a repeat was requested while it ran.
    pub(crate) fn finish(&mut self) -> bool {
        let repeat = *self == OperationState::InFlightPendingRepeat;
        *self = OperationState::Idle;
        repeat
    }

    pub(crate) fn is_in_flight(&self) -> bool {
        *self != OperationState::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::OperationState;

    #[test]
    fn coalesces_repeats() {
        let mut state = OperationState::default();
        assert!(state.begin());
        assert!(!state.begin());
        assert!(!state.begin());
        assert_eq!(state, OperationState::InFlightPendingRepeat);
        assert!(state.finish());
        assert!(!state.is_in_flight());
        assert!(state.begin());
        assert!(!state.finish());
    }
}
