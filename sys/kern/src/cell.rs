// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Exclusive access to kernel state.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

/// A container for scheduler state that hands out one `&mut` at a time.
///
/// This forms a sort of ad-hoc Mutex around the state: the kernel only ever
/// touches it from one execution context at a time (the environment's
/// protected section sees to that), so a second concurrent borrow means the
/// kernel has recursed into itself, which is a bug. That is detected and
/// turned into a panic rather than an aliasing `&mut`.
pub struct StateCell<T> {
    in_use: AtomicBool,
    cell: UnsafeCell<T>,
}

impl<T> StateCell<T> {
    pub const fn new(contents: T) -> Self {
        Self {
            in_use: AtomicBool::new(false),
            cell: UnsafeCell::new(contents),
        }
    }

    /// Runs `body` with a reference to the contents.
    ///
    /// To preserve uniqueness of the `&mut` reference passed into `body`, this
    /// function will detect any attempts to call it recursively and panic.
    pub fn with<R>(&self, body: impl FnOnce(&mut T) -> R) -> R {
        if self.in_use.swap(true, Ordering::Acquire) {
            panic!(); // recursive use of kernel state
        }
        let _release = Release(&self.in_use);

        // Safety: we have observed `in_use` being false, and we hold it true
        // until `_release` drops, so no other reference to the contents
        // exists.
        body(unsafe { &mut *self.cell.get() })
    }
}

// Safety: access to the contents is serialized by `in_use`.
unsafe impl<T: Send> Sync for StateCell<T> {}

struct Release<'a>(&'a AtomicBool);

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
