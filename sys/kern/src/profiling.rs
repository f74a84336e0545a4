// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel online profiling support.
//!
//! This is intended to help measure the timing of kernel events, such as how
//! long the alarm handler takes and when messages start running, as an aid to
//! debugging or optimization work.
//!
//! Because the kernel is target-independent, this module does not assume any
//! particular way of getting profiling information out of the kernel. Instead,
//! any target that wants to use profiling needs to populate an `EventsTable`
//! struct and provide it to `kern::profiling::configure_events_table` from its
//! startup routine. A typical implementation toggles GPIOs for an external
//! logic analyzer; keep the handler functions fast.

use core::sync::atomic::{AtomicPtr, Ordering};

/// Hooks that must be provided by the board setup code if it wants to enable
/// kernel profiling.
///
/// If you provide an `EventsTable`, you have to provide every hook. If you
/// would like to omit (say) the `isr_enter` event, the simplest method is:
///
/// ```ignore
///   isr_enter: || (),
/// ```
pub struct EventsTable {
    /// Called on entry to the kernel's alarm handler.
    pub alarm_enter: fn(),
    /// Called on exit from the kernel's alarm handler.
    pub alarm_exit: fn(),
    /// Called on entry to any other interrupt handler that reports itself.
    pub isr_enter: fn(),
    /// Called on exit from any other interrupt handler that reports itself.
    pub isr_exit: fn(),
    /// Called when a message starts running, with its pool index.
    pub dispatch: fn(u8),
    /// Called whenever the current context changes, with the index of the new
    /// context (`ContextId::IDLE` for the idle context).
    pub context_switch: fn(u8),
}

/// Supplies the kernel with an events table.
pub fn configure_events_table(table: &'static EventsTable) {
    EVENTS_TABLE.store(table as *const _ as *mut _, Ordering::Relaxed);
}

/// Internal pointer written by `configure_events_table` and read by `table`. If
/// this is null, no event table has been provided.
static EVENTS_TABLE: AtomicPtr<EventsTable> =
    AtomicPtr::new(core::ptr::null_mut());

fn table() -> Option<&'static EventsTable> {
    let p = EVENTS_TABLE.load(Ordering::Relaxed);
    if p.is_null() {
        None
    } else {
        // We only write this pointer from a valid `&'static`, and we're handing
        // out a shared reference.
        unsafe { Some(&*p) }
    }
}

pub(crate) fn event_alarm_enter() {
    if let Some(t) = table() {
        (t.alarm_enter)()
    }
}

pub(crate) fn event_alarm_exit() {
    if let Some(t) = table() {
        (t.alarm_exit)()
    }
}

/// Signals entry to an ISR. This is `pub` so environments can include their
/// own interrupt handlers in ISR statistics.
pub fn event_isr_enter() {
    if let Some(t) = table() {
        (t.isr_enter)()
    }
}

/// Signals exit from an ISR.
pub fn event_isr_exit() {
    if let Some(t) = table() {
        (t.isr_exit)()
    }
}

pub(crate) fn event_dispatch(msg: u8) {
    if let Some(t) = table() {
        (t.dispatch)(msg)
    }
}

pub(crate) fn event_context_switch(ctx: u8) {
    if let Some(t) = table() {
        (t.context_switch)(ctx)
    }
}
