//! The pipeline: a mutex-guarded, counted, growable FIFO queue of values.
//!
//! Pipelines are the only channel between workers. A single mutex guards both
//! the circular item window and the use counter that governs the pipeline's
//! lifetime, so every operation is a short in-memory critical section and the
//! order of `pop`s is exactly the order of `push`es, whichever threads
//! performed them.
//!
//! Lifetime states:
//! - `Live(n)` — n holders may still push, pop, acquire and release.
//! - `Sealed` — frozen by `seal`; permanently exempt from counting, usable
//!   forever, reclaimed only when the last handle drops at teardown.
//! - `Dead` — the last holder released it; the queue has been drained.
//!
//! Draining is the safety net for asynchronous failures nobody observed: any
//! error-kind value still queued when the pipeline dies is printed to stderr
//! and recorded as an ignored error on the process context before being
//! released.

use std::mem;
use std::sync::{Arc, Mutex};

use crate::process::Process;
use crate::text;
use crate::value::Value;
use crate::worker::WorkerContext;

/// Slot count every pipeline starts with.
pub const INITIAL_CAPACITY: usize = 32;

pub type PipelineRef = Arc<Pipeline>;

pub struct Pipeline {
    state: Mutex<State>,
}

struct State {
    lifetime: Lifetime,
    ring: Ring,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifetime {
    Live(u64),
    Sealed,
    Dead,
}

/// Circular window over a growable slot vector. The occupied region is
/// `slots[first .. first + count)`; vacated slots are reset to `Nothing` so
/// they hold no stale references.
struct Ring {
    slots: Vec<Value>,
    first: usize,
    count: usize,
}

impl Ring {
    fn new() -> Self {
        Self {
            slots: vec![Value::Nothing; INITIAL_CAPACITY],
            first: 0,
            count: 0,
        }
    }

    fn push(&mut self, value: Value) {
        if self.first + self.count == self.slots.len() {
            if self.first == 0 {
                // Window already starts at zero: double the storage.
                let capacity = self.slots.len() * 2;
                self.slots.resize(capacity, Value::Nothing);
            } else {
                // Compact the window back to index zero before growing.
                for offset in 0..self.count {
                    self.slots[offset] = mem::take(&mut self.slots[self.first + offset]);
                }
                self.first = 0;
            }
        }
        self.slots[self.first + self.count] = value;
        self.count += 1;
    }

    fn pop(&mut self) -> Value {
        if self.count == 0 {
            return Value::Nothing;
        }
        let value = mem::take(&mut self.slots[self.first]);
        self.first += 1;
        self.count -= 1;
        value
    }

    fn drain_all(&mut self) -> Vec<Value> {
        let mut drained = Vec::with_capacity(self.count);
        while self.count != 0 {
            drained.push(self.pop());
        }
        drained
    }
}

impl Pipeline {
    pub fn new() -> PipelineRef {
        Arc::new(Self {
            state: Mutex::new(State {
                lifetime: Lifetime::Live(1),
                ring: Ring::new(),
            }),
        })
    }

    /// Adds a holder (the runtime's `use` operation). No-op once sealed.
    pub fn acquire(&self) {
        let mut state = self.state.lock().unwrap();
        if let Lifetime::Live(ref mut holders) = state.lifetime {
            *holders += 1;
        }
    }

    /// Drops a holder (the runtime's `free` operation). The last holder
    /// drains the queue and kills the pipeline; sealed pipelines ignore this
    /// entirely.
    pub fn release(&self, process: &Process, ctx: &mut WorkerContext) {
        let drained = {
            let mut state = self.state.lock().unwrap();
            match state.lifetime {
                Lifetime::Live(1) => {
                    state.lifetime = Lifetime::Dead;
                    Some(state.ring.drain_all())
                }
                Lifetime::Live(ref mut holders) => {
                    *holders -= 1;
                    None
                }
                Lifetime::Sealed | Lifetime::Dead => None,
            }
        };
        // The hooks run outside the critical section; they may take their
        // own locks.
        if let Some(items) = drained {
            for item in items {
                match item {
                    Value::Error(error) => {
                        text::println_as_error(error.message());
                        process.note_ignored_error();
                        process.release_error(error, ctx, false);
                    }
                    other => process.hooks().release(&other, ctx, false),
                }
            }
        }
    }

    /// Freezes the use counter (the runtime's `to_const`). Idempotent; a
    /// sealed pipeline is never destroyed by `release`.
    pub fn seal(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(state.lifetime, Lifetime::Live(_)) {
            state.lifetime = Lifetime::Sealed;
        }
    }

    pub fn push(&self, value: Value) {
        let mut state = self.state.lock().unwrap();
        if state.lifetime == Lifetime::Dead {
            return;
        }
        state.ring.push(value);
    }

    /// Removes and returns the head value, or `Nothing` when the queue is
    /// empty. Never blocks; callers needing backpressure poll and retry.
    pub fn pop(&self) -> Value {
        let mut state = self.state.lock().unwrap();
        state.ring.pop()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().ring.count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The queued item count as an int value.
    pub fn items_count(&self) -> Value {
        Value::Int(self.len() as i64)
    }

    /// Current holder count, or `None` once the pipeline is sealed or dead.
    pub fn holders(&self) -> Option<u64> {
        match self.state.lock().unwrap().lifetime {
            Lifetime::Live(holders) => Some(holders),
            Lifetime::Sealed | Lifetime::Dead => None,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.state.lock().unwrap().lifetime == Lifetime::Sealed
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.state.lock().unwrap().lifetime == Lifetime::Dead
    }
}
