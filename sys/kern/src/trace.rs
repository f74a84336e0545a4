// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel event trace.
//!
//! Each kernel instance carries a small ring of recent scheduling events, for
//! inspection from a debugger or from tests. Recording an event identical to
//! the most recent one (same source line, same payload) bumps that entry's
//! `count` instead of taking a new slot, so a tight loop doesn't wash out the
//! interesting history.

use abi::{ContextId, ObjectId, Timestamp};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Event {
    None,
    /// A message was allocated and queued.
    Posted {
        msg: u8,
        to: ObjectId,
        baseline: Timestamp,
        deadline: Timestamp,
    },
    /// `expired` promoted messages due at this time.
    Expired(Timestamp),
    /// A message began running.
    Dispatched { msg: u8, to: ObjectId },
    /// A message's method returned and its slot was freed.
    Retired(u8),
    Cancelled(u8),
    /// A context found an object locked and gave way to its owner.
    Blocked { context: ContextId, on: ObjectId },
    /// An object's single waiter was overwritten by a newer one.
    Displaced { context: ContextId, on: ObjectId },
    /// An object was released to a waiting context.
    Unblocked { context: ContextId, on: ObjectId },
    /// Control moved between execution contexts.
    Switched { from: ContextId, to: ContextId },
}

#[derive(Copy, Clone, Debug)]
pub struct Entry {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub event: Event,
}

impl Entry {
    const EMPTY: Self = Self {
        line: 0,
        generation: 0,
        count: 0,
        event: Event::None,
    };
}

#[derive(Debug)]
pub struct Trace<const N: usize> {
    last: Option<usize>,
    buffer: [Entry; N],
}

impl<const N: usize> Default for Trace<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Trace<N> {
    pub const fn new() -> Self {
        Self {
            last: None,
            buffer: [Entry::EMPTY; N],
        }
    }

    pub fn record(&mut self, line: u16, event: Event) {
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.event == event {
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        let ndx = {
            let last_plus_1 = last.wrapping_add(1);
            if last_plus_1 >= self.buffer.len() {
                0
            } else {
                last_plus_1
            }
        };

        let ent = &mut self.buffer[ndx];
        *ent = Entry {
            line,
            event,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };

        self.last = Some(ndx);
    }

    /// Iterates over recorded entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Entry> + '_ {
        let start = self.last.map(|l| l + 1).unwrap_or(0);
        let (newer, older) = self.buffer.split_at(start.min(N));
        older
            .iter()
            .chain(newer.iter())
            .filter(|e| e.event != Event::None)
    }

    /// Iterates over recorded events, oldest first, expanding repeats.
    pub fn events(&self) -> impl Iterator<Item = Event> + '_ {
        self.iter()
            .flat_map(|e| core::iter::repeat(e.event).take(e.count as usize))
    }
}

/// Records `$event` in `$trace`, tagged with the current source line.
macro_rules! trace {
    ($trace:expr, $event:expr) => {
        $trace.record(line!() as u16, $event)
    };
}
pub(crate) use trace;
