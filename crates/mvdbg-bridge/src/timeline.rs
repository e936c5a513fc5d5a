//! Debugging timeline.
//!
//! An append-only history of snapshots. Each refresh appends a new state;
//! moving backward only re-selects an earlier entry. Nothing is deleted
//! or mutated in place, so the whole session stays replayable.

use mvdbg_protocol::RuntimeState;

#[derive(Debug, Default)]
pub struct Timeline {
    states: Vec<RuntimeState>,
    cursor: usize,
}

impl Timeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a snapshot and select it.
    pub fn push(&mut self, state: RuntimeState) {
        self.states.push(state);
        self.cursor = self.states.len() - 1;
    }

    /// The selected snapshot.
    #[must_use]
    pub fn current(&self) -> Option<&RuntimeState> {
        self.states.get(self.cursor)
    }

    /// Re-select the previous snapshot. Returns the new selection.
    pub fn back(&mut self) -> Option<&RuntimeState> {
        if self.cursor > 0 {
            self.cursor -= 1;
        }
        self.current()
    }

    /// Re-select the next snapshot. Returns the new selection.
    pub fn forward(&mut self) -> Option<&RuntimeState> {
        if self.cursor + 1 < self.states.len() {
            self.cursor += 1;
        }
        self.current()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pc(value: u32) -> RuntimeState {
        RuntimeState {
            pc: Some(value),
            ..RuntimeState::default()
        }
    }

    #[test]
    fn stepping_back_keeps_later_states() {
        let mut timeline = Timeline::new();
        timeline.push(pc(1));
        timeline.push(pc(2));
        timeline.push(pc(3));

        assert_eq!(timeline.back().unwrap().pc, Some(2));
        assert_eq!(timeline.len(), 3, "nothing deleted");
        assert_eq!(timeline.forward().unwrap().pc, Some(3));
    }

    #[test]
    fn bounds_are_clamped() {
        let mut timeline = Timeline::new();
        assert!(timeline.current().is_none());
        timeline.push(pc(1));
        assert_eq!(timeline.back().unwrap().pc, Some(1));
        assert_eq!(timeline.forward().unwrap().pc, Some(1));
    }
}
