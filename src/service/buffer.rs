use parking_lot::Mutex;

use crate::model::InputStats;

/// Double-buffered ingest queue.
///
/// Writers append to the active slot under one short critical section;
/// aggregation swaps slots and walks the drained batch without blocking
/// ingestion. The previous batch length seeds the next slot's capacity, so
/// the hot path stops allocating once traffic is steady.
pub struct IngestBuffer {
    inner: Mutex<State>,
}

struct State {
    slots: [Vec<InputStats>; 2],
    active: usize,
    prev_len: usize,
}

impl Default for IngestBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestBuffer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(State {
                slots: [Vec::new(), Vec::new()],
                active: 0,
                prev_len: 0,
            }),
        }
    }

    /// Appends one batch to the active slot.
    pub fn submit(&self, input: InputStats) {
        let mut state = self.inner.lock();
        let active = state.active;
        if state.slots[active].is_empty() {
            let hint = state.prev_len;
            state.slots[active].reserve(hint);
        }
        state.slots[active].push(input);
    }

    /// Swaps slots and returns everything submitted since the last drain.
    pub fn drain(&self) -> Vec<InputStats> {
        let mut state = self.inner.lock();
        let drained_idx = state.active;
        state.active ^= 1;
        let drained = std::mem::take(&mut state.slots[drained_idx]);
        state.prev_len = drained.len();
        drained
    }

    /// Length of the active slot, for diagnostics only.
    pub fn len(&self) -> usize {
        let state = self.inner.lock();
        state.slots[state.active].len()
    }

    /// Whether the active slot is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
