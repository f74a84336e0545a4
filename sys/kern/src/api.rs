// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The application-facing call interface, implemented by both kernels.
//!
//! Times passed to `action` and friends are relative. The baseline offset is
//! added to the caller's own baseline, or to the interrupt timestamp when
//! called from an interrupt handler, and the result is never allowed to fall
//! behind the current time. The deadline offset is added to the resulting
//! baseline.

use abi::{ObjectId, ResultCode, Ticks};

use crate::args::Args;
use crate::msg::Receipt;

/// A method on an object.
///
/// `K` is the kernel type. It is passed back in so that a method can post
/// messages and make requests of its own.
pub type Method<K> = fn(&'static K, ObjectId, &Args) -> ResultCode;

pub trait Reflex: Sized + 'static {
    /// Posts a message to run `method` on `to`, with `args` copied into the
    /// message. Returns a receipt that can cancel the message until it starts.
    fn action_with_receipt(
        &'static self,
        bl: Ticks,
        dl: Ticks,
        to: ObjectId,
        method: Method<Self>,
        args: &[u8],
    ) -> Receipt;

    /// Calls `method` on `to` synchronously, under the kernel's mutual
    /// exclusion protocol, and returns its result.
    fn request(
        &'static self,
        to: ObjectId,
        method: Method<Self>,
        args: &[u8],
    ) -> ResultCode;

    /// Withdraws a message that has not started running yet. Returns `false`
    /// if the receipt no longer refers to a waiting message, which is not an
    /// error. Either way the receipt is used up.
    fn cancel(&self, receipt: &mut Receipt) -> bool;

    /// Runs the earliest-deadline eligible message if the policy lets it
    /// preempt what is running now. Interrupt handlers that post messages
    /// call this last.
    fn schedule(&'static self);

    fn action(
        &'static self,
        bl: Ticks,
        dl: Ticks,
        to: ObjectId,
        method: Method<Self>,
        args: &[u8],
    ) {
        self.action_with_receipt(bl, dl, to, method, args);
    }

    /// Posts with the caller's baseline and no slack.
    fn async_call(&'static self, to: ObjectId, method: Method<Self>, args: &[u8]) {
        self.action(Ticks::ZERO, Ticks::ZERO, to, method, args);
    }

    fn async_with_receipt(
        &'static self,
        to: ObjectId,
        method: Method<Self>,
        args: &[u8],
    ) -> Receipt {
        self.action_with_receipt(Ticks::ZERO, Ticks::ZERO, to, method, args)
    }

    /// Posts to start `bl` after the caller's baseline.
    fn after(
        &'static self,
        bl: Ticks,
        to: ObjectId,
        method: Method<Self>,
        args: &[u8],
    ) {
        self.action(bl, Ticks::ZERO, to, method, args);
    }

    fn after_with_receipt(
        &'static self,
        bl: Ticks,
        to: ObjectId,
        method: Method<Self>,
        args: &[u8],
    ) -> Receipt {
        self.action_with_receipt(bl, Ticks::ZERO, to, method, args)
    }

    /// Posts to finish within `dl` of the caller's baseline.
    fn before(
        &'static self,
        dl: Ticks,
        to: ObjectId,
        method: Method<Self>,
        args: &[u8],
    ) {
        self.action(Ticks::ZERO, dl, to, method, args);
    }

    fn before_with_receipt(
        &'static self,
        dl: Ticks,
        to: ObjectId,
        method: Method<Self>,
        args: &[u8],
    ) -> Receipt {
        self.action_with_receipt(Ticks::ZERO, dl, to, method, args)
    }

    fn after_before(
        &'static self,
        bl: Ticks,
        dl: Ticks,
        to: ObjectId,
        method: Method<Self>,
        args: &[u8],
    ) {
        self.action(bl, dl, to, method, args);
    }

    fn after_before_with_receipt(
        &'static self,
        bl: Ticks,
        dl: Ticks,
        to: ObjectId,
        method: Method<Self>,
        args: &[u8],
    ) -> Receipt {
        self.action_with_receipt(bl, dl, to, method, args)
    }

    /// Same as `after_before`; reads better for periodic work ("run again one
    /// period on, within half a period").
    fn within(
        &'static self,
        bl: Ticks,
        dl: Ticks,
        to: ObjectId,
        method: Method<Self>,
        args: &[u8],
    ) {
        self.action(bl, dl, to, method, args);
    }
}
