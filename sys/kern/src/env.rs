// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The contract between the kernel and the target it runs on.
//!
//! Neither scheduling policy touches hardware directly. Everything
//! target-specific (the alarm timer, interrupt masking, context switching,
//! sleeping) sits behind these traits, implemented once per target. The
//! hosted simulation in `arch::sim` implements all of them.

use abi::{ContextId, Ticks, Timestamp};

use crate::fail::Fatal;

/// The kernel's only synchronization primitive.
pub trait EnvironmentCriticalSection {
    /// Enters (`true`) or leaves (`false`) the protected section, in which
    /// interrupts are held off. Calls do not nest: the kernel saves and
    /// restores the state it found rather than counting.
    fn protect(&self, on: bool);

    fn is_protected(&self) -> bool;
}

/// Receives the one-shot alarm.
pub trait AlarmHandler: Sync {
    /// Called in interrupt context, protected, when the alarm goes off.
    fn alarm(&'static self, now: Timestamp);
}

/// The monotonic clock and the one-shot alarm.
pub trait EnvironmentClock {
    /// Clock ticks per second.
    const TICK_HZ: u32;

    /// Starts the clock, delivering alarms to `handler` from now on.
    fn timer_start(&self, handler: &'static dyn AlarmHandler);

    /// Arms the alarm for `alarm`, replacing any earlier setting. The alarm
    /// must go off at or after `alarm` and must never be dropped, even if
    /// `alarm` has already passed.
    fn timer_set(&self, alarm: Timestamp);

    fn timer_get(&self) -> Timestamp;

    /// The time the current interrupt was raised. Outside an interrupt,
    /// the current time.
    fn timestamp(&self) -> Timestamp;

    fn usec(n: u32) -> Ticks {
        ticks_for(n, 1_000_000, Self::TICK_HZ)
    }

    fn msec(n: u32) -> Ticks {
        ticks_for(n, 1_000, Self::TICK_HZ)
    }

    fn sec(n: u32) -> Ticks {
        ticks_for(n, 1, Self::TICK_HZ)
    }
}

/// The code a worker context starts running when first dispatched.
pub trait ContextEntry: Sync {
    fn enter(&'static self, ctx: ContextId) -> !;
}

/// Stackful execution contexts, needed by the dynamic kernel only.
pub trait EnvironmentContext {
    /// Prepares a suspended context that will begin at `entry` when first
    /// dispatched.
    fn context_init(
        &self,
        ctx: ContextId,
        stack_size: usize,
        entry: &'static dyn ContextEntry,
    );

    /// Suspends the caller and resumes `ctx`. Returns only once some context
    /// dispatches back to the caller.
    fn context_dispatch(&self, ctx: ContextId);
}

pub trait Environment: EnvironmentClock + EnvironmentCriticalSection {
    /// One-time bring-up; must complete before any other call. Leaves the
    /// caller protected.
    fn init(&self);

    /// Reports a fatal kernel condition and halts.
    fn panic(&self, fatal: Fatal) -> !;

    /// Sleeps with interrupts enabled, delivering alarms as they come due.
    ///
    /// On hardware this never returns. A hosted environment may return once
    /// it has nothing left to deliver.
    fn idle(&self);
}

/// Converts `n` units of `per_second` to ticks of a `hz` clock. A nonzero
/// request never converts to zero ticks.
pub fn ticks_for(n: u32, per_second: u32, hz: u32) -> Ticks {
    let t = u64::from(n) * u64::from(hz) / u64::from(per_second);
    match t {
        0 if n != 0 => Ticks(1),
        t => Ticks(u32::try_from(t).unwrap_or(u32::MAX)),
    }
}
