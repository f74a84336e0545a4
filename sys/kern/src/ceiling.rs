// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Object tables and resource ceilings for the stack resource policy.
//!
//! Each object is a resource, identified by its own bit in a `ResourceSet`,
//! and declares the objects its methods call directly. Before the kernel
//! runs, those declarations are closed over transitive calls, so that each
//! object's entry names every resource a message to it could end up holding.

use abi::{ObjectId, ResourceSet};

use crate::fail::Fatal;

/// An entry in the application's object table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ObjectDecl {
    /// Must equal the entry's position in the table.
    pub id: ObjectId,
    /// Objects this object's methods make requests of.
    pub requires: ResourceSet,
}

impl ObjectDecl {
    pub const fn new(id: ObjectId, requires: ResourceSet) -> Self {
        Self { id, requires }
    }
}

/// Computes the requirement closure of each object in `decls` into the
/// matching entry of `closures`. Each closure includes the object itself.
///
/// Cycles in the declarations are tolerated: every member of a cycle ends up
/// requiring the whole cycle.
pub fn close_requirements(
    decls: &[ObjectDecl],
    closures: &mut [ResourceSet],
) -> Result<(), Fatal> {
    let count = decls.len();
    if count > ResourceSet::CAPACITY || count > closures.len() {
        return Err(Fatal::TooManyObjects { count });
    }
    for (slot, decl) in decls.iter().enumerate() {
        if decl.id.index() != slot {
            return Err(Fatal::ObjectIdMismatch {
                slot: slot as u8,
                id: decl.id,
            });
        }
        if let Some(unknown) = decl.requires.iter().find(|r| r.index() >= count) {
            return Err(Fatal::UnknownObject(unknown));
        }
    }

    // An entry counts as finished once it contains its own bit.
    for (closure, decl) in closures.iter_mut().zip(decls) {
        let mut direct = decl.requires;
        direct.remove(ResourceSet::of(decl.id));
        *closure = direct;
    }
    let mut in_progress = ResourceSet::EMPTY;
    for slot in 0..count {
        let own = ObjectId(slot as u8);
        if !closures[slot].contains(own) {
            close(own, closures, &mut in_progress);
        }
    }

    // A cycle member finished while part of its cycle was still in progress
    // may be missing what the rest of the cycle requires.
    loop {
        let mut changed = false;
        for slot in 0..count {
            let mut closure = closures[slot];
            for r in closures[slot].iter() {
                closure.insert(closures[r.index()]);
            }
            if closure != closures[slot] {
                closures[slot] = closure;
                changed = true;
            }
        }
        if !changed {
            return Ok(());
        }
    }
}

fn close(
    own: ObjectId,
    closures: &mut [ResourceSet],
    in_progress: &mut ResourceSet,
) {
    in_progress.insert(ResourceSet::of(own));
    let mut closure = closures[own.index()];
    for r in closures[own.index()].iter() {
        if !closures[r.index()].contains(r) && !in_progress.contains(r) {
            close(r, closures, in_progress);
        }
        closure.insert(closures[r.index()]);
    }
    closures[own.index()] = closure | ResourceSet::of(own);
    in_progress.remove(ResourceSet::of(own));
}
