// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.

use crate::api::Reflex;

/// Bring-up and main loop of a kernel.
pub trait Start: Reflex {
    /// Initializes the environment and the kernel's own tables. Fatal
    /// configuration errors surface here. Leaves the caller protected.
    fn init(&'static self);

    /// Arms the alarm for whatever was posted before the call, starts the
    /// clock and idles. On hardware this never returns.
    fn run(&'static self);
}

/// The main kernel entry point.
///
/// We expect an application to provide its own `main`-equivalent function,
/// which does basic hardware setup, builds a kernel over its environment,
/// and then calls this function. `app_init` runs protected between the
/// kernel's initialization and the start of the clock, and is where the
/// application posts its first messages.
///
/// This function may not be called reentrantly, or more than once per
/// kernel.
pub fn start_kernel<K: Start>(kernel: &'static K, app_init: impl FnOnce(&'static K)) {
    kernel.init();
    app_init(kernel);
    kernel.run();
}
