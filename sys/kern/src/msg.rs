// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The message pool and its queues.
//!
//! All messages live in one fixed array. Queues are singly linked lists
//! threaded through the array by index:
//!
//! - `free`: unused slots, in no particular order.
//! - `inactive`: posted messages whose baseline has not arrived, sorted by
//!   baseline.
//! - `active`: messages eligible to run, sorted by deadline.
//! - `running`: under the stack resource policy, the stack of messages being
//!   run, most recently started first.
//!
//! A message is on exactly one of these at any time, with one exception: a
//! message being run by a dynamic-kernel context is tagged `Running` but held
//! by that context rather than linked into `running`.
//!
//! Sorted insertion is stable, placing a new message after any existing ones
//! with an equal key. Both sorts compare times with wraparound, so the lists
//! stay correct as the clock wraps.

use abi::{ObjectId, Ticks, Timestamp};

use crate::args::Args;
use crate::fail::Fatal;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Queue {
    Free,
    Inactive,
    Active,
    Running,
}

/// Names a particular use of a message slot.
///
/// The generation is bumped every time a slot is allocated, so an id left
/// over from an earlier use of the slot no longer matches.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MessageId {
    index: u8,
    generation: u32,
}

impl MessageId {
    pub fn index(self) -> u8 {
        self.index
    }
}

/// Handle to a posted message, for cancelling it before it starts running.
///
/// A receipt is emptied by a cancel attempt. Once the message has started
/// running (or was already cancelled) the receipt no longer refers to it, and
/// cancelling fails.
#[derive(Debug, Default)]
pub struct Receipt {
    msg: Option<MessageId>,
}

impl Receipt {
    pub const fn new() -> Self {
        Self { msg: None }
    }

    pub(crate) fn linked(id: MessageId) -> Self {
        Self { msg: Some(id) }
    }

    pub(crate) fn take(&mut self) -> Option<MessageId> {
        self.msg.take()
    }

    /// Checks whether this receipt has been spent on a cancel attempt. A
    /// receipt whose message has since run is not emptied by the run, but
    /// cancelling it fails.
    pub fn is_empty(&self) -> bool {
        self.msg.is_none()
    }
}

#[derive(Debug)]
pub struct Message<M> {
    pub baseline: Timestamp,
    pub deadline: Timestamp,
    pub to: ObjectId,
    pub method: Option<M>,
    pub args: Args,
    next: Option<u8>,
    queue: Queue,
    generation: u32,
}

impl<M> Message<M> {
    pub fn queue(&self) -> Queue {
        self.queue
    }
}

/// Result of posting a message.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Posted {
    pub index: u8,
    /// Set when the message became the head of `inactive`: the alarm must be
    /// moved to this time.
    pub alarm: Option<Timestamp>,
}

/// A message that has been taken off `active` to run, copied out so that its
/// method can run without holding the pool.
#[derive(Clone, Debug)]
pub struct Job<M> {
    pub msg: u8,
    pub to: ObjectId,
    pub method: M,
    pub args: Args,
}

pub struct MessagePool<M, const N: usize> {
    slots: [Message<M>; N],
    free: Option<u8>,
    inactive: Option<u8>,
    active: Option<u8>,
    running: Option<u8>,
}

impl<M: Copy, const N: usize> Default for MessagePool<M, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Copy, const N: usize> MessagePool<M, N> {
    pub fn new() -> Self {
        let slots = core::array::from_fn(|i| Message {
            baseline: Timestamp::ZERO,
            deadline: Timestamp::ZERO,
            to: ObjectId(0),
            method: None,
            args: Args::NONE,
            next: if i + 1 < N { Some(i as u8 + 1) } else { None },
            queue: Queue::Free,
            generation: 0,
        });
        Self {
            slots,
            free: if N > 0 { Some(0) } else { None },
            inactive: None,
            active: None,
            running: None,
        }
    }

    fn parts(
        &mut self,
        q: Queue,
    ) -> (&mut [Message<M>; N], &mut Option<u8>) {
        match q {
            Queue::Free => (&mut self.slots, &mut self.free),
            Queue::Inactive => (&mut self.slots, &mut self.inactive),
            Queue::Active => (&mut self.slots, &mut self.active),
            Queue::Running => (&mut self.slots, &mut self.running),
        }
    }

    pub fn head(&self, q: Queue) -> Option<u8> {
        match q {
            Queue::Free => self.free,
            Queue::Inactive => self.inactive,
            Queue::Active => self.active,
            Queue::Running => self.running,
        }
    }

    pub fn peek(&self, q: Queue) -> Option<&Message<M>> {
        self.head(q).map(|i| self.get(i))
    }

    pub fn is_empty(&self, q: Queue) -> bool {
        self.head(q).is_none()
    }

    pub fn get(&self, idx: u8) -> &Message<M> {
        &self.slots[usize::from(idx)]
    }

    pub fn get_mut(&mut self, idx: u8) -> &mut Message<M> {
        &mut self.slots[usize::from(idx)]
    }

    pub fn id(&self, idx: u8) -> MessageId {
        MessageId {
            index: idx,
            generation: self.get(idx).generation,
        }
    }

    /// Takes a slot off the free list for a new message. The caller must fill
    /// it in and queue it.
    pub fn alloc(&mut self) -> Result<u8, Fatal> {
        let idx = self.pop(Queue::Free).ok_or(Fatal::OutOfMessages)?;
        let m = self.get_mut(idx);
        m.generation = m.generation.wrapping_add(1);
        Ok(idx)
    }

    /// Returns a slot to the free list.
    pub fn release(&mut self, idx: u8) {
        self.get_mut(idx).method = None;
        self.push_front(Queue::Free, idx);
    }

    /// Fills in and queues a new message.
    ///
    /// `base` is the time the offsets count from. The baseline is never
    /// allowed to fall behind `now`, and a message whose baseline has arrived
    /// goes straight onto `active`.
    pub fn post(
        &mut self,
        base: Timestamp,
        now: Timestamp,
        bl: Ticks,
        dl: Ticks,
        to: ObjectId,
        method: M,
        args: Args,
    ) -> Result<Posted, Fatal> {
        let idx = self.alloc()?;
        let baseline = (base + bl).later_of(now);
        let m = self.get_mut(idx);
        m.baseline = baseline;
        m.deadline = baseline + dl;
        m.to = to;
        m.method = Some(method);
        m.args = args;

        let alarm = if baseline.is_at_or_before(now) {
            self.enqueue_by_deadline(idx);
            None
        } else {
            self.enqueue_by_baseline(idx);
            (self.inactive == Some(idx)).then_some(baseline)
        };
        Ok(Posted { index: idx, alarm })
    }

    /// Withdraws and frees the message named by `id`. Returns `None` if it
    /// was no longer waiting, and otherwise whether the head of `inactive`
    /// changed.
    pub fn cancel(&mut self, id: MessageId) -> Result<Option<bool>, Fatal> {
        let old_head = self.inactive;
        if self.unlink(id)?.is_none() {
            return Ok(None);
        }
        self.release(id.index);
        Ok(Some(old_head != self.inactive))
    }

    /// Copies out a message that is about to run.
    pub fn job(&self, idx: u8) -> Result<Job<M>, Fatal> {
        let m = self.get(idx);
        let method = m.method.ok_or(Fatal::Sanity("message has no method"))?;
        Ok(Job {
            msg: idx,
            to: m.to,
            method,
            args: m.args.clone(),
        })
    }

    /// Inserts into `inactive`, by baseline.
    pub fn enqueue_by_baseline(&mut self, idx: u8) {
        self.insert_sorted(Queue::Inactive, idx, |m| m.baseline);
    }

    /// Inserts into `active`, by deadline.
    pub fn enqueue_by_deadline(&mut self, idx: u8) {
        self.insert_sorted(Queue::Active, idx, |m| m.deadline);
    }

    /// Pops the head of `q`.
    pub fn dequeue(&mut self, q: Queue) -> Option<u8> {
        self.pop(q)
    }

    pub fn push_running(&mut self, idx: u8) {
        self.push_front(Queue::Running, idx);
    }

    pub fn pop_running(&mut self) -> Option<u8> {
        self.pop(Queue::Running)
    }

    /// Tags a message as running without linking it into `running`, for
    /// contexts that hold their message themselves.
    pub fn mark_running(&mut self, idx: u8) {
        let m = self.get_mut(idx);
        m.queue = Queue::Running;
        m.next = None;
    }

    /// Withdraws the message named by `id` if it is still waiting in
    /// `inactive` or `active`, returning the queue it was taken from.
    pub fn unlink(&mut self, id: MessageId) -> Result<Option<Queue>, Fatal> {
        let q = match self.slots.get(usize::from(id.index)) {
            Some(m) if m.generation == id.generation => m.queue,
            _ => return Ok(None),
        };
        if !matches!(q, Queue::Inactive | Queue::Active) {
            return Ok(None);
        }

        let (slots, head) = self.parts(q);
        let mut prev = None;
        let mut cur = *head;
        while let Some(c) = cur {
            if c == id.index {
                break;
            }
            prev = cur;
            cur = slots[usize::from(c)].next;
        }
        if cur.is_none() {
            return Err(Fatal::Sanity("message missing from its queue"));
        }

        let idx = usize::from(id.index);
        let next = slots[idx].next.take();
        match prev {
            Some(p) => slots[usize::from(p)].next = next,
            None => *head = next,
        }
        Ok(Some(q))
    }

    /// Moves every inactive message whose baseline is at or before `now`
    /// into `active`. Returns whether the head of `active` changed.
    pub fn expire(&mut self, now: Timestamp) -> bool {
        let old_head = self.active;
        while let Some(m) = self.peek(Queue::Inactive) {
            if !m.baseline.is_at_or_before(now) {
                break;
            }
            if let Some(idx) = self.pop(Queue::Inactive) {
                self.enqueue_by_deadline(idx);
            }
        }
        old_head != self.active
    }

    /// Iterates over `q` from the head.
    pub fn iter(&self, q: Queue) -> impl Iterator<Item = (u8, &Message<M>)> {
        let mut cur = self.head(q);
        core::iter::from_fn(move || {
            let idx = cur?;
            let m = self.get(idx);
            cur = m.next;
            Some((idx, m))
        })
        .take(N)
    }

    pub fn len(&self, q: Queue) -> usize {
        self.iter(q).count()
    }

    /// Checks the ordering and exclusivity of the queues.
    pub fn check(&self) -> Result<(), Fatal> {
        let mut seen = [false; N];
        for q in [Queue::Free, Queue::Inactive, Queue::Active, Queue::Running]
        {
            let mut prev: Option<Timestamp> = None;
            for (idx, m) in self.iter(q) {
                let idx = usize::from(idx);
                if seen[idx] {
                    return Err(Fatal::Sanity("message on two queues"));
                }
                seen[idx] = true;
                if m.queue != q {
                    return Err(Fatal::Sanity("message tagged for another queue"));
                }

                let key = match q {
                    Queue::Inactive => m.baseline,
                    Queue::Active => m.deadline,
                    _ => continue,
                };
                if let Some(p) = prev {
                    if !p.is_at_or_before(key) {
                        return Err(Fatal::Sanity("queue out of order"));
                    }
                }
                prev = Some(key);
            }
        }

        for (m, seen) in self.slots.iter().zip(seen) {
            if !seen && m.queue != Queue::Running {
                return Err(Fatal::Sanity("message lost from its queue"));
            }
        }
        Ok(())
    }

    fn push_front(&mut self, q: Queue, idx: u8) {
        let (slots, head) = self.parts(q);
        let m = &mut slots[usize::from(idx)];
        m.next = *head;
        m.queue = q;
        *head = Some(idx);
    }

    fn pop(&mut self, q: Queue) -> Option<u8> {
        let (slots, head) = self.parts(q);
        let idx = (*head)?;
        *head = slots[usize::from(idx)].next.take();
        Some(idx)
    }

    fn insert_sorted(
        &mut self,
        q: Queue,
        idx: u8,
        key: fn(&Message<M>) -> Timestamp,
    ) {
        let (slots, head) = self.parts(q);
        let k = key(&slots[usize::from(idx)]);

        let mut prev: Option<u8> = None;
        let mut cur = *head;
        while let Some(c) = cur {
            let m = &slots[usize::from(c)];
            if !key(m).is_at_or_before(k) {
                break;
            }
            prev = cur;
            cur = m.next;
        }

        let m = &mut slots[usize::from(idx)];
        m.next = cur;
        m.queue = q;
        match prev {
            Some(p) => slots[usize::from(p)].next = Some(idx),
            None => *head = Some(idx),
        }
    }
}
