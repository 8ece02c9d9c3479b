//! Element states and transitions.

use crate::error::StateChangeError;
use std::fmt;

/// Lifecycle state of an element, in ascending order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum State {
    /// No pending state. Only appears as the `pending` part of a state query.
    VoidPending = 0,
    /// Initial state: no resources held.
    #[default]
    Null = 1,
    /// Resources acquired, no dataflow.
    Ready = 2,
    /// Dataflow prepared and prerolled, clock stopped.
    Paused = 3,
    /// Dataflow running against the clock.
    Playing = 4,
}

impl State {
    /// The state one step from `self` in the direction of `target`.
    ///
    /// Returns `self` when already there.
    pub fn next_towards(self, target: State) -> State {
        use State::*;
        match self.cmp(&target) {
            std::cmp::Ordering::Less => match self {
                VoidPending | Null => Ready,
                Ready => Paused,
                _ => Playing,
            },
            std::cmp::Ordering::Greater => match self {
                Playing => Paused,
                Paused => Ready,
                _ => Null,
            },
            std::cmp::Ordering::Equal => self,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::VoidPending => "VOID_PENDING",
            State::Null => "NULL",
            State::Ready => "READY",
            State::Paused => "PAUSED",
            State::Playing => "PLAYING",
        };
        f.write_str(name)
    }
}

/// A single step between adjacent states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StateChange {
    /// Acquire resources.
    NullToReady,
    /// Activate pads, prepare streaming, preroll.
    ReadyToPaused,
    /// Start the clock.
    PausedToPlaying,
    /// Stop the clock.
    PlayingToPaused,
    /// Deactivate pads, stop streaming.
    PausedToReady,
    /// Release resources.
    ReadyToNull,
}

impl StateChange {
    /// The step from `current` to the adjacent `next`, if they are adjacent.
    pub fn new(current: State, next: State) -> Option<StateChange> {
        use State::*;
        Some(match (current, next) {
            (Null, Ready) => StateChange::NullToReady,
            (Ready, Paused) => StateChange::ReadyToPaused,
            (Paused, Playing) => StateChange::PausedToPlaying,
            (Playing, Paused) => StateChange::PlayingToPaused,
            (Paused, Ready) => StateChange::PausedToReady,
            (Ready, Null) => StateChange::ReadyToNull,
            _ => return None,
        })
    }

    /// The first step from `current` towards `target`.
    pub fn towards(current: State, target: State) -> Option<StateChange> {
        Self::new(current, current.next_towards(target))
    }

    /// State before the step.
    pub fn current(self) -> State {
        match self {
            StateChange::NullToReady => State::Null,
            StateChange::ReadyToPaused | StateChange::ReadyToNull => State::Ready,
            StateChange::PausedToPlaying | StateChange::PausedToReady => State::Paused,
            StateChange::PlayingToPaused => State::Playing,
        }
    }

    /// State after the step.
    pub fn next(self) -> State {
        match self {
            StateChange::ReadyToNull => State::Null,
            StateChange::NullToReady | StateChange::PausedToReady => State::Ready,
            StateChange::ReadyToPaused | StateChange::PlayingToPaused => State::Paused,
            StateChange::PausedToPlaying => State::Playing,
        }
    }

    /// Whether the step goes up.
    pub fn is_upward(self) -> bool {
        self.next() > self.current()
    }
}

impl fmt::Display for StateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.current(), self.next())
    }
}

/// Successful outcome of a state change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StateChangeSuccess {
    /// The state was reached.
    #[default]
    Success,
    /// The element will finish the change later and post `AsyncDone`.
    Async,
    /// Reached, but the element cannot preroll (live source) so PAUSED
    /// does not imply data is available.
    NoPreroll,
}

/// Result of a state change.
pub type StateChangeResult = Result<StateChangeSuccess, StateChangeError>;

fn rank(result: &StateChangeResult) -> u8 {
    match result {
        Ok(StateChangeSuccess::Success) => 0,
        Ok(StateChangeSuccess::Async) => 1,
        Ok(StateChangeSuccess::NoPreroll) => 2,
        Err(_) => 3,
    }
}

/// Combine two results, worst one wins.
///
/// Failure beats no-preroll, which beats async, which beats success.
pub fn combine(a: StateChangeResult, b: StateChangeResult) -> StateChangeResult {
    if rank(&b) > rank(&a) { b } else { a }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_order() {
        assert!(State::Null < State::Ready);
        assert!(State::Ready < State::Paused);
        assert!(State::Paused < State::Playing);
        assert!(State::VoidPending < State::Null);
    }

    #[test]
    fn test_next_towards() {
        assert_eq!(State::Null.next_towards(State::Playing), State::Ready);
        assert_eq!(State::Playing.next_towards(State::Null), State::Paused);
        assert_eq!(State::Paused.next_towards(State::Paused), State::Paused);
    }

    #[test]
    fn test_state_change() {
        let t = StateChange::towards(State::Null, State::Playing).unwrap();
        assert_eq!(t, StateChange::NullToReady);
        assert!(t.is_upward());
        assert_eq!(t.to_string(), "NULL -> READY");

        let t = StateChange::new(State::Paused, State::Ready).unwrap();
        assert!(!t.is_upward());
        assert_eq!(t.current(), State::Paused);
        assert_eq!(t.next(), State::Ready);

        assert!(StateChange::new(State::Null, State::Paused).is_none());
        assert!(StateChange::towards(State::Ready, State::Ready).is_none());
    }

    #[test]
    fn test_combine() {
        let ok = Ok(StateChangeSuccess::Success);
        let asy = Ok(StateChangeSuccess::Async);
        let live = Ok(StateChangeSuccess::NoPreroll);
        let err = Err(StateChangeError);
        assert_eq!(combine(ok, asy), asy);
        assert_eq!(combine(asy, ok), asy);
        assert_eq!(combine(asy, live), live);
        assert_eq!(combine(live, err), err);
        assert_eq!(combine(err, ok), err);
        assert_eq!(combine(ok, ok), ok);
    }
}
