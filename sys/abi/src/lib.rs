// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel, environment
//! implementations and applications.

#![cfg_attr(not(test), no_std)]

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// An instant on the kernel's wrapping tick clock.
///
/// The clock is a free-running 32-bit counter of environment-defined ticks
/// that wraps around. Two instants can only be ordered if they are within half
/// the counter range of each other, so this type *deliberately* does not
/// implement `PartialOrd`/`Ord`: use `is_before` and `is_at_or_before`, which
/// compare using serial-number arithmetic.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct Timestamp(pub u32);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    /// Checks whether `self` happens no later than `other`, treating the
    /// clock as wrapping.
    pub fn is_at_or_before(self, other: Self) -> bool {
        other.0.wrapping_sub(self.0) as i32 >= 0
    }

    /// Checks whether `self` happens strictly before `other`, treating the
    /// clock as wrapping.
    pub fn is_before(self, other: Self) -> bool {
        other.0.wrapping_sub(self.0) as i32 > 0
    }

    /// Number of ticks from `earlier` to `self`, modulo the clock range.
    pub fn ticks_since(self, earlier: Self) -> Ticks {
        Ticks(self.0.wrapping_sub(earlier.0))
    }

    /// Returns whichever of `self` and `other` happens later.
    pub fn later_of(self, other: Self) -> Self {
        if self.is_before(other) {
            other
        } else {
            self
        }
    }
}

impl From<u32> for Timestamp {
    fn from(v: u32) -> Self {
        Timestamp(v)
    }
}

impl From<Timestamp> for u32 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}

impl core::ops::Add<Ticks> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Ticks) -> Timestamp {
        Timestamp(self.0.wrapping_add(rhs.0))
    }
}

/// A span of clock ticks, used for baseline and deadline offsets.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct Ticks(pub u32);

impl Ticks {
    pub const ZERO: Self = Self(0);
}

impl From<u32> for Ticks {
    fn from(v: u32) -> Self {
        Ticks(v)
    }
}

impl core::ops::Add for Ticks {
    type Output = Ticks;

    fn add(self, rhs: Ticks) -> Ticks {
        Ticks(self.0.wrapping_add(rhs.0))
    }
}

/// Names an object: a unit of mutual exclusion guarding application state.
///
/// Objects are numbered densely from zero in the order of the application's
/// object table. Under the stack resource policy the number doubles as the
/// object's resource bit.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct ObjectId(pub u8);

impl ObjectId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// A set of resources, one bit per object.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct ResourceSet(pub u32);

impl ResourceSet {
    pub const EMPTY: Self = Self(0);

    /// Number of distinct resources a set can name.
    pub const CAPACITY: usize = 32;

    /// The one-hot set naming the resource that belongs to `id`.
    ///
    /// `id` must be below `CAPACITY`.
    pub const fn of(id: ObjectId) -> Self {
        Self(1 << id.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, id: ObjectId) -> bool {
        usize::from(id.0) < Self::CAPACITY && self.0 & (1 << id.0) != 0
    }

    /// Checks that every resource in `other` is also in `self`.
    pub fn contains_all(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_disjoint(self, other: Self) -> bool {
        self.0 & other.0 == 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Iterates over the objects named in this set, lowest first.
    pub fn iter(self) -> impl Iterator<Item = ObjectId> {
        let mut bits = self.0;
        core::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let n = bits.trailing_zeros();
            bits &= bits - 1;
            Some(ObjectId(n as u8))
        })
    }
}

impl core::ops::BitOr for ResourceSet {
    type Output = ResourceSet;

    fn bitor(self, rhs: ResourceSet) -> ResourceSet {
        ResourceSet(self.0 | rhs.0)
    }
}

impl From<ObjectId> for ResourceSet {
    fn from(id: ObjectId) -> Self {
        Self::of(id)
    }
}

/// Names an execution context of the dynamic kernel.
///
/// Worker contexts are numbered densely from zero. The all-ones value is
/// reserved for the permanent idle context, which is whatever context the
/// kernel was started on.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ContextId(pub u8);

impl ContextId {
    pub const IDLE: Self = Self(!0);

    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    pub fn is_idle(self) -> bool {
        self == Self::IDLE
    }
}

/// Value returned by an object method.
///
/// The kernel attaches no meaning to these beyond passing them back to
/// whoever made a synchronous request.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct ResultCode(pub i32);

impl ResultCode {
    pub const OK: Self = Self(0);
}

impl From<i32> for ResultCode {
    fn from(v: i32) -> Self {
        ResultCode(v)
    }
}
