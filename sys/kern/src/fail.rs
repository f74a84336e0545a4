// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for reporting kernel failures.
//!
//! The kernel has no recoverable errors. Every internal inconsistency is
//! described by a `Fatal` and handed to `Environment::panic`, which does not
//! return. Internal routines that can fail return `Result<_, Fatal>` so the
//! kernel can release its state before calling into the environment.
//!
//! For environments that want to leave a record for a debugger, an `Epitaph`
//! renders a failure into a fixed-size buffer as UTF-8, truncating if the
//! buffer fills.

use core::fmt::{self, Display, Write};

use abi::ObjectId;

/// Every way the kernel can fail.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Fatal {
    /// `action` found the message pool empty.
    OutOfMessages,
    /// `schedule` needed a worker context and none was idle.
    OutOfThreads,
    /// A lock request would wait on itself, directly or through a chain of
    /// blocked contexts.
    Deadlock,
    /// The object table entry at `slot` declares a different id.
    ObjectIdMismatch { slot: u8, id: ObjectId },
    /// The object table holds more objects than there are resource bits.
    TooManyObjects { count: usize },
    /// A message argument did not fit in the argument buffer.
    ArgsTooLarge { len: usize },
    /// A request under the stack resource policy found its object's
    /// resource already held. The object table's requirements are wrong.
    ResourceBusy(ObjectId),
    /// A message or request named an object outside the object table.
    UnknownObject(ObjectId),
    /// A debug-build consistency check failed.
    Sanity(&'static str),
}

impl Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fatal::OutOfMessages => f.write_str("out of messages"),
            Fatal::OutOfThreads => f.write_str("out of threads"),
            Fatal::Deadlock => f.write_str("deadlock"),
            Fatal::ObjectIdMismatch { slot, id } => {
                write!(f, "object id mismatch: slot {slot} holds id {}", id.0)
            }
            Fatal::TooManyObjects { count } => write!(
                f,
                "too many objects: {count} declared, {} supported",
                abi::ResourceSet::CAPACITY.min(crate::NUM_OBJECTS)
            ),
            Fatal::ArgsTooLarge { len } => write!(
                f,
                "argument of {len} bytes exceeds {} byte buffer",
                crate::ARGS_SIZE
            ),
            Fatal::ResourceBusy(id) => {
                write!(f, "deadlock: resource {} already held", id.0)
            }
            Fatal::UnknownObject(id) => write!(f, "unknown object {}", id.0),
            Fatal::Sanity(what) => write!(f, "sanity check failed: {what}"),
        }
    }
}

/// Debug-build consistency check, for use in routines returning
/// `Result<_, Fatal>`. Compiles to nothing without `debug_assertions`.
#[macro_export]
macro_rules! sanity {
    ($cond:expr) => {
        if cfg!(debug_assertions) && !($cond) {
            return Err($crate::fail::Fatal::Sanity(concat!(
                file!(),
                ":",
                line!(),
                ": ",
                stringify!($cond)
            )));
        }
    };
}

pub const EPITAPH_LEN: usize = 128;

/// Up to `EPITAPH_LEN` bytes of description of a failure.
#[derive(Copy, Clone)]
pub struct Epitaph {
    text: [u8; EPITAPH_LEN],
    len: usize,
}

impl Epitaph {
    pub fn new(msg: impl Display) -> Self {
        let mut epitaph = Self {
            text: [0; EPITAPH_LEN],
            len: 0,
        };
        write!(epitaph, "{msg}").ok();
        epitaph
    }

    pub fn as_str(&self) -> &str {
        let text = &self.text[..self.len];
        match core::str::from_utf8(text) {
            Ok(s) => s,
            // Truncation split a character; drop the partial one.
            Err(e) => {
                core::str::from_utf8(&text[..e.valid_up_to()]).unwrap_or("")
            }
        }
    }
}

impl Write for Epitaph {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(EPITAPH_LEN - self.len);
        self.text[self.len..self.len + n].copy_from_slice(&s[..n]);
        self.len += n;
        Ok(())
    }
}

impl fmt::Debug for Epitaph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epitaph_records_failure_text() {
        let e = Epitaph::new(Fatal::ResourceBusy(ObjectId(3)));
        assert_eq!(e.as_str(), "deadlock: resource 3 already held");
    }

    #[test]
    fn epitaph_truncates() {
        let long = "x".repeat(EPITAPH_LEN * 2);
        assert_eq!(Epitaph::new(&long).as_str().len(), EPITAPH_LEN);
    }

    #[test]
    fn epitaph_drops_split_character() {
        let mut text = "a".repeat(EPITAPH_LEN - 1);
        text.push('é');
        let e = Epitaph::new(&text);
        assert_eq!(e.as_str().len(), EPITAPH_LEN - 1);
    }
}
