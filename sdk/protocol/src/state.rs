/// Outcome of a state machine operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<S> {
    pub from: S,
    pub to: S,
}

impl<S: Copy + PartialEq> Transition<S> {
    pub fn new(from: S, to: S) -> Self {
        Self { from, to }
    }

    /// No state change
    pub fn stay(state: S) -> Self {
        Self {
            from: state,
            to: state,
        }
    }

    pub fn changed(&self) -> bool {
        self.from != self.to
    }

    /// True only for the operation that moved the record into `state`
    pub fn entered(&self, state: S) -> bool {
        self.changed() && self.to == state
    }
}
