// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Target environments.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, the environment types for the current target show up right here in
//! the `arch` module. Bare-metal targets supply their own implementation of
//! the `env` traits from board support code.

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "none"))] {
        pub mod sim;
        pub use sim::*;
    }
}
