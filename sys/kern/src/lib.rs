// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reflex kernel.
//!
//! A small real-time kernel for reactive programs. An application is a set
//! of objects whose methods run in response to messages. Each message
//! carries a baseline (the earliest time it may run) and a deadline, and the
//! kernel always runs the eligible message with the earliest deadline,
//! preempting work with a later one.
//!
//! Two scheduling policies share the same message machinery and the same
//! application interface (`api::Reflex`):
//!
//! - `dynamic::Kernel` gives each running message its own execution context,
//!   and serializes access to objects with locks that hand control to the
//!   holder when contended.
//! - `srp::SrpKernel` runs everything on one stack under the stack resource
//!   policy, admitting a message only when every resource it may need is
//!   free, so that nothing ever waits.
//!
//! # Design principles
//!
//! 1. Static configuration. Pool sizes are fixed at build time (see
//!    `build.rs`), and nothing is allocated at runtime.
//! 2. Portability. Everything target-specific sits behind the traits in
//!    `env`; `arch::sim` implements them on a hosted OS for testing.
//! 3. A strong preference for safe code where reasonable.
//! 4. A preference for simple and clear algorithms over fast and clever
//!    ones. Queues are sorted linked lists; nothing here is large enough for
//!    anything smarter to pay.

#![cfg_attr(target_os = "none", no_std)]

pub mod api;
pub mod arch;
pub mod args;
pub mod ceiling;
pub mod cell;
pub mod dynamic;
pub mod env;
pub mod fail;
pub mod msg;
pub mod profiling;
pub mod srp;
pub mod startup;
pub mod trace;

pub use abi::{ContextId, ObjectId, ResourceSet, ResultCode, Ticks, Timestamp};
pub use api::{Method, Reflex};
pub use args::{Args, NO_ARGS};
pub use fail::Fatal;
pub use msg::Receipt;

include!(concat!(env!("OUT_DIR"), "/kconfig.rs"));

// Pool indices are `u8`, and the all-ones context id is reserved for idle.
static_assertions::const_assert!(NUM_MESSAGES > 0 && NUM_MESSAGES <= 255);
static_assertions::const_assert!(NUM_THREADS > 0 && NUM_THREADS < 255);
static_assertions::const_assert!(NUM_OBJECTS <= 255);
static_assertions::const_assert!(ARGS_SIZE > 0);
static_assertions::const_assert!(TRACE_DEPTH > 0);
