// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Message argument buffers.
//!
//! Every message carries its argument inline, as up to `ARGS_SIZE` bytes
//! copied at the time the message is posted. Senders pass any byte slice
//! (typically `value.as_bytes()` through `zerocopy::IntoBytes`), and methods
//! decode with `Args::read`. Posting an argument that does not fit is fatal.

use zerocopy::FromBytes;

use crate::fail::Fatal;
use crate::ARGS_SIZE;

/// The "no argument" sentinel. Nothing is copied for it.
pub const NO_ARGS: &[u8] = &[];

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Args(heapless::Vec<u8, ARGS_SIZE>);

impl Args {
    pub const NONE: Self = Self(heapless::Vec::new());

    pub fn copy_from(bytes: &[u8]) -> Result<Self, Fatal> {
        if bytes.is_empty() {
            return Ok(Self::NONE);
        }
        heapless::Vec::from_slice(bytes)
            .map(Self)
            .map_err(|()| Fatal::ArgsTooLarge { len: bytes.len() })
    }

    /// Decodes a `T` from the front of the argument, if it holds enough bytes.
    pub fn read<T: FromBytes>(&self) -> Option<T> {
        T::read_from_prefix(&self.0).ok().map(|(value, _rest)| value)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_none(&self) -> bool {
        self.0.is_empty()
    }
}
