// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The dynamic kernel: preemptive earliest-deadline-first scheduling over a
//! pool of worker contexts.
//!
//! # Contexts
//!
//! Each worker context runs one message at a time, in a loop. Contexts that
//! are doing something (running, preempted, or blocked) sit on the *active
//! stack*, most recently started on top; the rest sit on the *inactive
//! stack*. A message preempts the top of the active stack by taking a fresh
//! context from the inactive stack, so the number of contexts bounds the
//! preemption depth, and running out of them is fatal.
//!
//! The idle context is whatever context called `run`. It never holds a
//! message, and is current whenever the active stack is empty.
//!
//! After finishing a message, a context keeps going with the head of
//! `active` unless the context it preempted has an earlier or equal
//! deadline, in which case it gives way: it goes back on the inactive stack
//! and control passes to the new top of the active stack.
//!
//! # Mutual exclusion
//!
//! Each object has a lock, taken for the duration of every method call on it.
//! A context that finds the lock held does not spin or sleep. It records that
//! it is waiting and dispatches the owner instead, following the chain of
//! waiters to whoever can actually make progress, so that a low-priority
//! owner runs at the priority of the context it is holding up. Releasing a
//! lock dispatches the waiter directly. A chain that leads back to the caller
//! is a deadlock, which is fatal.
//!
//! Each object remembers a single waiter. A second context blocking on the
//! same object displaces the first, which is released when the second one
//! next runs and goes back to trying for the lock.

use abi::{ContextId, ObjectId, ResultCode, Ticks, Timestamp};

use crate::api::{Method, Reflex};
use crate::args::Args;
use crate::cell::StateCell;
use crate::env::{AlarmHandler, ContextEntry, Environment, EnvironmentContext};
use crate::fail::Fatal;
use crate::msg::{Job, MessagePool, Queue, Receipt};
use crate::profiling;
use crate::sanity;
use crate::startup::Start;
use crate::trace::{trace, Event, Trace};
use crate::{NUM_MESSAGES, NUM_OBJECTS, NUM_THREADS, STACK_SIZE, TRACE_DEPTH};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadState {
    /// On the inactive stack.
    Inactive,
    /// On the active stack, preempted.
    Ready,
    Running,
    /// Waiting for the lock on an object.
    Blocked(ObjectId),
}

#[derive(Copy, Clone, Debug)]
struct Thread {
    /// Message being run, if any.
    msg: Option<u8>,
    /// Next context down whichever stack this one is on.
    next: Option<u8>,
    state: ThreadState,
    /// Waiter this context displaced when it last blocked, to be released
    /// once this context runs again.
    displaced: Option<ContextId>,
}

impl Thread {
    fn waits_for(&self) -> Option<ObjectId> {
        match self.state {
            ThreadState::Blocked(obj) => Some(obj),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Default)]
struct ObjectLock {
    owned_by: Option<ContextId>,
    wanted_by: Option<ContextId>,
}

/// A context switch a state transition calls for, to be carried out once
/// the state is no longer borrowed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextContext {
    Same,
    Switch(ContextId),
}

/// One attempt at taking an object's lock.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum LockStep {
    Acquired,
    /// The lock is held. The caller has been marked blocked and must switch
    /// as directed, then try again once it is resumed.
    Wait(NextContext),
}

/// Scheduler state of the dynamic kernel.
pub struct DynamicState<M> {
    pub messages: MessagePool<M, NUM_MESSAGES>,
    /// Worker contexts, followed by a record for the idle context.
    threads: [Thread; NUM_THREADS + 1],
    /// Top of the active stack.
    active: Option<u8>,
    /// Top of the inactive stack.
    inactive: Option<u8>,
    current: ContextId,
    locks: [ObjectLock; NUM_OBJECTS],
    pub trace: Trace<TRACE_DEPTH>,
}

impl<M: Copy> Default for DynamicState<M> {
    fn default() -> Self {
        Self::new()
    }
}

fn slot(ctx: ContextId) -> usize {
    if ctx.is_idle() {
        NUM_THREADS
    } else {
        ctx.index()
    }
}

impl<M: Copy> DynamicState<M> {
    pub fn new() -> Self {
        let threads = core::array::from_fn(|i| Thread {
            msg: None,
            next: if i + 1 < NUM_THREADS {
                Some(i as u8 + 1)
            } else {
                None
            },
            state: if i < NUM_THREADS {
                ThreadState::Inactive
            } else {
                ThreadState::Running
            },
            displaced: None,
        });
        Self {
            messages: MessagePool::new(),
            threads,
            active: None,
            inactive: Some(0),
            current: ContextId::IDLE,
            locks: [ObjectLock::default(); NUM_OBJECTS],
            trace: Trace::new(),
        }
    }

    pub fn current(&self) -> ContextId {
        self.current
    }

    pub fn thread_state(&self, ctx: ContextId) -> ThreadState {
        self.threads[slot(ctx)].state
    }

    /// Current owner of `obj`'s lock.
    pub fn owner(&self, obj: ObjectId) -> Option<ContextId> {
        self.locks.get(obj.index()).and_then(|l| l.owned_by)
    }

    /// Contexts on the active stack, top first.
    pub fn active_contexts(&self) -> impl Iterator<Item = ContextId> + '_ {
        let mut cur = self.active;
        core::iter::from_fn(move || {
            let t = cur?;
            cur = self.threads[usize::from(t)].next;
            Some(ContextId(t))
        })
        .take(NUM_THREADS)
    }

    fn lock(&mut self, obj: ObjectId) -> Result<&mut ObjectLock, Fatal> {
        self.locks
            .get_mut(obj.index())
            .ok_or(Fatal::UnknownObject(obj))
    }

    /// Baseline of the message the current context is running, which is
    /// what relative times posted from it count from.
    pub fn current_baseline(&self) -> Option<Timestamp> {
        self.threads[slot(self.current)]
            .msg
            .map(|m| self.messages.get(m).baseline)
    }

    /// Deadline of the message a worker context is running.
    fn deadline_of(&self, t: u8) -> Result<Timestamp, Fatal> {
        self.threads[usize::from(t)]
            .msg
            .map(|m| self.messages.get(m).deadline)
            .ok_or(Fatal::Sanity("active context has no message"))
    }

    /// Checks whether the head of `active` should preempt the current
    /// context, and if so starts a context for it.
    pub fn schedule(&mut self) -> Result<NextContext, Fatal> {
        let Some(head) = self.messages.peek(Queue::Active) else {
            return Ok(NextContext::Same);
        };
        let head_deadline = head.deadline;

        if !self.current.is_idle() {
            let top = self.active.ok_or(Fatal::Sanity("no active context"))?;
            if !head_deadline.is_before(self.deadline_of(top)?) {
                return Ok(NextContext::Same);
            }
        }

        let t = self.inactive.ok_or(Fatal::OutOfThreads)?;
        let thread = &mut self.threads[usize::from(t)];
        self.inactive = thread.next;
        thread.next = self.active;
        thread.state = ThreadState::Ready;
        self.active = Some(t);
        Ok(self.switch(ContextId(t)))
    }

    /// Takes the head of `active` for the current context to run.
    pub fn begin(&mut self) -> Result<Job<M>, Fatal> {
        let ctx = self.current;
        sanity!(self.active == Some(ctx.0));
        let idx = self
            .messages
            .dequeue(Queue::Active)
            .ok_or(Fatal::Sanity("context started with nothing to run"))?;
        self.messages.mark_running(idx);
        self.threads[slot(ctx)].msg = Some(idx);

        let job = self.messages.job(idx)?;
        trace!(
            self.trace,
            Event::Dispatched {
                msg: idx,
                to: job.to
            }
        );
        Ok(job)
    }

    /// Retires the current context's message. Returns `None` if the context
    /// should go on to the head of `active`, or where to switch if it should
    /// give way.
    pub fn finish(&mut self) -> Result<Option<NextContext>, Fatal> {
        let ctx = self.current;
        sanity!(self.active == Some(ctx.0));
        let idx = self.threads[slot(ctx)]
            .msg
            .take()
            .ok_or(Fatal::Sanity("finished without a message"))?;
        self.messages.release(idx);
        trace!(self.trace, Event::Retired(idx));

        if let Some(head) = self.messages.peek(Queue::Active) {
            let head_deadline = head.deadline;
            match self.threads[slot(ctx)].next {
                None => return Ok(None),
                Some(below) => {
                    if head_deadline.is_before(self.deadline_of(below)?) {
                        return Ok(None);
                    }
                }
            }
        }

        let thread = &mut self.threads[slot(ctx)];
        self.active = thread.next;
        thread.next = self.inactive;
        thread.state = ThreadState::Inactive;
        self.inactive = Some(ctx.0);

        let target = match self.active {
            Some(top) => self.runnable_from(ContextId(top))?,
            None => ContextId::IDLE,
        };
        Ok(Some(self.switch(target)))
    }

    /// Follows the chain of waiters from `start` to the context that can
    /// make progress.
    fn runnable_from(&self, start: ContextId) -> Result<ContextId, Fatal> {
        let mut t = start;
        for _ in 0..=NUM_THREADS {
            let Some(obj) = self.threads[slot(t)].waits_for() else {
                return Ok(t);
            };
            match self.locks[obj.index()].owned_by {
                Some(owner) => t = owner,
                None => return Ok(t),
            }
        }
        Err(Fatal::Deadlock)
    }

    /// Makes one attempt at taking `obj`'s lock for the current context.
    pub fn try_lock(&mut self, obj: ObjectId) -> Result<LockStep, Fatal> {
        let cur = self.current;
        let lock = *self.lock(obj)?;

        if let Some(d) = self.threads[slot(cur)].displaced.take() {
            let waiter = &mut self.threads[slot(d)];
            if waiter.state == ThreadState::Blocked(obj) {
                waiter.state = ThreadState::Ready;
            }
        }

        let Some(owner) = lock.owned_by else {
            self.locks[obj.index()].owned_by = Some(cur);
            return Ok(LockStep::Acquired);
        };

        let runnable = self.runnable_from(owner)?;
        if runnable == cur {
            return Err(Fatal::Deadlock);
        }

        let previous = self.locks[obj.index()].wanted_by.replace(cur);
        if let Some(p) = previous.filter(|&p| p != cur) {
            self.threads[slot(cur)].displaced = Some(p);
            trace!(self.trace, Event::Displaced { context: p, on: obj });
        }
        self.threads[slot(cur)].state = ThreadState::Blocked(obj);
        trace!(self.trace, Event::Blocked { context: cur, on: obj });
        Ok(LockStep::Wait(self.switch(runnable)))
    }

    /// Releases `obj`'s lock, handing control to its waiter if it has one.
    pub fn unlock(&mut self, obj: ObjectId) -> Result<NextContext, Fatal> {
        let cur = self.current;
        let lock = self.lock(obj)?;
        if lock.owned_by != Some(cur) {
            return Err(Fatal::Sanity("unlocking an object held elsewhere"));
        }
        lock.owned_by = None;
        let Some(waiter) = lock.wanted_by.take() else {
            return Ok(NextContext::Same);
        };

        let w = &mut self.threads[slot(waiter)];
        if w.state == ThreadState::Blocked(obj) {
            w.state = ThreadState::Ready;
        }
        trace!(
            self.trace,
            Event::Unblocked {
                context: waiter,
                on: obj
            }
        );
        Ok(self.switch(waiter))
    }

    fn switch(&mut self, to: ContextId) -> NextContext {
        let from = self.current;
        if to == from {
            return NextContext::Same;
        }
        let old = &mut self.threads[slot(from)];
        if old.state == ThreadState::Running {
            old.state = ThreadState::Ready;
        }
        self.threads[slot(to)].state = ThreadState::Running;
        self.current = to;
        trace!(self.trace, Event::Switched { from, to });
        NextContext::Switch(to)
    }

    /// Checks the message queues and the context stacks.
    pub fn check(&self) -> Result<(), Fatal> {
        self.messages.check()?;
        let mut seen = [false; NUM_THREADS];
        for (head, on_active) in [(self.active, true), (self.inactive, false)] {
            let mut cur = head;
            while let Some(t) = cur {
                let t = usize::from(t);
                if seen[t] {
                    return Err(Fatal::Sanity("context on two stacks"));
                }
                seen[t] = true;
                let thread = &self.threads[t];
                if (thread.state != ThreadState::Inactive) != on_active {
                    return Err(Fatal::Sanity("context state disagrees with stack"));
                }
                cur = thread.next;
            }
        }
        if seen.iter().any(|s| !s) {
            return Err(Fatal::Sanity("context lost from its stack"));
        }
        Ok(())
    }
}

/// A dynamic kernel running in environment `E`.
pub struct Kernel<E: 'static> {
    env: E,
    state: StateCell<DynamicState<Method<Kernel<E>>>>,
}

impl<E> Kernel<E>
where
    E: Environment + EnvironmentContext + Sync + 'static,
{
    pub fn new(env: E) -> Self {
        Self {
            env,
            state: StateCell::new(DynamicState::new()),
        }
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    /// Runs `body` with the scheduler state, for inspection.
    pub fn with_state<R>(
        &self,
        body: impl FnOnce(&mut DynamicState<Method<Self>>) -> R,
    ) -> R {
        self.state.with(body)
    }

    fn check<T>(&self, r: Result<T, Fatal>) -> T {
        match r {
            Ok(v) => v,
            Err(fatal) => self.env.panic(fatal),
        }
    }

    fn switch_to(&self, next: NextContext) {
        if let NextContext::Switch(ctx) = next {
            profiling::event_context_switch(ctx.0);
            self.env.context_dispatch(ctx);
        }
    }

    /// Brings up the environment and prepares the worker contexts.
    pub fn init(&'static self) {
        self.env.init();
        for i in 0..NUM_THREADS {
            self.env.context_init(ContextId(i as u8), STACK_SIZE, self);
        }
    }

    /// Points the alarm at anything posted during initialization, starts the
    /// clock and idles.
    pub fn run(&'static self) {
        let due = self
            .state
            .with(|s| s.messages.peek(Queue::Active).map(|m| m.baseline));
        if let Some(t) = due {
            self.env.timer_set(t);
        }
        self.env.timer_start(self);
        self.env.idle();
    }

    /// Promotes every message due at `now`, and re-arms the alarm for the
    /// next one. Returns whether the head of `active` changed.
    pub fn expired(&self, now: Timestamp) -> bool {
        let (changed, next) = self.state.with(|s| {
            trace!(s.trace, Event::Expired(now));
            let changed = s.messages.expire(now);
            (changed, s.messages.peek(Queue::Inactive).map(|m| m.baseline))
        });
        if let Some(t) = next {
            self.env.timer_set(t);
        }
        changed
    }

    fn call(&'static self, to: ObjectId, method: Method<Self>, args: &Args) -> ResultCode {
        let was = self.env.is_protected();
        self.env.protect(true);
        loop {
            let step = self.state.with(|s| s.try_lock(to));
            match self.check(step) {
                LockStep::Acquired => break,
                LockStep::Wait(next) => self.switch_to(next),
            }
        }

        self.env.protect(was);
        let result = method(self, to, args);
        self.env.protect(true);

        let next = self.state.with(|s| s.unlock(to));
        self.switch_to(self.check(next));
        self.env.protect(was);
        result
    }
}

impl<E> Reflex for Kernel<E>
where
    E: Environment + EnvironmentContext + Sync + 'static,
{
    fn action_with_receipt(
        &'static self,
        bl: Ticks,
        dl: Ticks,
        to: ObjectId,
        method: Method<Self>,
        args: &[u8],
    ) -> Receipt {
        let args = self.check(Args::copy_from(args));
        let protected = self.env.is_protected();
        self.env.protect(true);
        let now = self.env.timer_get();
        let timestamp = self.env.timestamp();

        let posted = self.state.with(|s| {
            if to.index() >= NUM_OBJECTS {
                return Err(Fatal::UnknownObject(to));
            }
            let base = match s.current_baseline() {
                Some(b) if !protected => b,
                _ => timestamp,
            };
            let p = s.messages.post(base, now, bl, dl, to, method, args)?;
            let m = s.messages.get(p.index);
            trace!(
                s.trace,
                Event::Posted {
                    msg: p.index,
                    to,
                    baseline: m.baseline,
                    deadline: m.deadline,
                }
            );
            Ok((s.messages.id(p.index), p.alarm))
        });
        let (id, alarm) = self.check(posted);
        if let Some(t) = alarm {
            self.env.timer_set(t);
        }
        self.env.protect(protected);
        Receipt::linked(id)
    }

    fn request(
        &'static self,
        to: ObjectId,
        method: Method<Self>,
        args: &[u8],
    ) -> ResultCode {
        let args = self.check(Args::copy_from(args));
        self.call(to, method, &args)
    }

    fn cancel(&self, receipt: &mut Receipt) -> bool {
        let Some(id) = receipt.take() else {
            return false;
        };
        let was = self.env.is_protected();
        self.env.protect(true);
        let r = self.state.with(|s| {
            let outcome = s.messages.cancel(id)?;
            if outcome.is_some() {
                trace!(s.trace, Event::Cancelled(id.index()));
            }
            Ok((outcome, s.messages.peek(Queue::Inactive).map(|m| m.baseline)))
        });
        let (outcome, next) = self.check(r);
        if outcome == Some(true) {
            // With nothing left waiting, pull the alarm in so that it fires
            // harmlessly instead of for the cancelled message.
            self.env.timer_set(next.unwrap_or_else(|| self.env.timer_get()));
        }
        self.env.protect(was);
        outcome.is_some()
    }

    fn schedule(&'static self) {
        let was = self.env.is_protected();
        self.env.protect(true);
        let next = self.state.with(|s| s.schedule());
        self.switch_to(self.check(next));
        self.env.protect(was);
    }
}

impl<E> AlarmHandler for Kernel<E>
where
    E: Environment + EnvironmentContext + Sync + 'static,
{
    fn alarm(&'static self, now: Timestamp) {
        profiling::event_alarm_enter();
        self.expired(now);
        profiling::event_alarm_exit();
        self.schedule();
    }
}

impl<E> ContextEntry for Kernel<E>
where
    E: Environment + EnvironmentContext + Sync + 'static,
{
    fn enter(&'static self, ctx: ContextId) -> ! {
        loop {
            self.env.protect(true);
            let job = self.state.with(|s| {
                sanity!(s.current == ctx);
                s.begin()
            });
            let job = self.check(job);
            profiling::event_dispatch(job.msg);

            self.env.protect(false);
            self.call(job.to, job.method, &job.args);
            self.env.protect(true);

            let next = self.state.with(|s| s.finish());
            if let Some(next) = self.check(next) {
                self.switch_to(next);
            }
        }
    }
}

impl<E> Start for Kernel<E>
where
    E: Environment + EnvironmentContext + Sync + 'static,
{
    fn init(&'static self) {
        Kernel::init(self)
    }

    fn run(&'static self) {
        Kernel::run(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type State = DynamicState<()>;

    fn post(s: &mut State, to: u8, deadline: u32) -> u8 {
        let p = s
            .messages
            .post(
                Timestamp(0),
                Timestamp(0),
                Ticks(0),
                Ticks(deadline),
                ObjectId(to),
                (),
                Args::NONE,
            )
            .unwrap();
        p.index
    }

    /// Starts a context for the head of `active` and has it take its message.
    fn start(s: &mut State) -> ContextId {
        match s.schedule().unwrap() {
            NextContext::Switch(ctx) => {
                s.begin().unwrap();
                ctx
            }
            NextContext::Same => panic!("expected a switch"),
        }
    }

    #[test]
    fn idle_always_switches_to_new_work() {
        let mut s = State::new();
        assert_eq!(s.schedule(), Ok(NextContext::Same));
        post(&mut s, 0, 100);
        let ctx = start(&mut s);
        assert_eq!(ctx, ContextId(0));
        assert_eq!(s.current(), ctx);
        assert_eq!(s.thread_state(ctx), ThreadState::Running);
        assert_eq!(s.thread_state(ContextId::IDLE), ThreadState::Ready);
        s.check().unwrap();
    }

    #[test]
    fn only_strictly_earlier_deadline_preempts() {
        let mut s = State::new();
        post(&mut s, 0, 10);
        let first = start(&mut s);

        post(&mut s, 1, 10);
        assert_eq!(s.schedule(), Ok(NextContext::Same));

        post(&mut s, 2, 9);
        let second = start(&mut s);
        assert_ne!(first, second);
        assert_eq!(s.active_contexts().collect::<Vec<_>>(), [second, first]);
        assert_eq!(s.thread_state(first), ThreadState::Ready);
        s.check().unwrap();
    }

    #[test]
    fn running_out_of_contexts_is_fatal() {
        let mut s = State::new();
        for i in 0..NUM_THREADS {
            post(&mut s, 0, (NUM_THREADS - i) as u32 * 10);
            start(&mut s);
        }
        post(&mut s, 0, 1);
        assert_eq!(s.schedule(), Err(Fatal::OutOfThreads));
    }

    #[test]
    fn finishing_gives_way_to_preempted_context() {
        let mut s = State::new();
        post(&mut s, 0, 10);
        let low = start(&mut s);
        post(&mut s, 1, 5);
        let high = start(&mut s);

        // Equal to the preempted deadline: yield rather than continue.
        post(&mut s, 2, 10);
        assert_eq!(s.finish(), Ok(Some(NextContext::Switch(low))));
        assert_eq!(s.thread_state(high), ThreadState::Inactive);
        s.check().unwrap();
    }

    #[test]
    fn finishing_continues_with_more_urgent_work() {
        let mut s = State::new();
        post(&mut s, 0, 10);
        start(&mut s);
        post(&mut s, 1, 5);
        let high = start(&mut s);
        post(&mut s, 2, 7);
        assert_eq!(s.finish(), Ok(None));
        assert_eq!(s.current(), high);
        s.begin().unwrap();
        s.check().unwrap();
    }

    #[test]
    fn last_context_returns_to_idle() {
        let mut s = State::new();
        post(&mut s, 0, 10);
        start(&mut s);
        assert_eq!(s.finish(), Ok(Some(NextContext::Switch(ContextId::IDLE))));
        assert_eq!(s.active_contexts().count(), 0);
        assert_eq!(s.messages.len(Queue::Free), NUM_MESSAGES);
        s.check().unwrap();
    }

    #[test]
    fn blocked_context_hands_over_to_owner() {
        let obj = ObjectId(3);
        let mut s = State::new();
        post(&mut s, 0, 10);
        let low = start(&mut s);
        assert_eq!(s.try_lock(obj), Ok(LockStep::Acquired));

        post(&mut s, 1, 5);
        let high = start(&mut s);
        assert_eq!(
            s.try_lock(obj),
            Ok(LockStep::Wait(NextContext::Switch(low)))
        );
        assert_eq!(s.thread_state(high), ThreadState::Blocked(obj));

        assert_eq!(s.unlock(obj), Ok(NextContext::Switch(high)));
        assert_eq!(s.try_lock(obj), Ok(LockStep::Acquired));
        assert_eq!(s.owner(obj), Some(high));
    }

    #[test]
    fn waiting_on_yourself_is_deadlock() {
        let (a, b) = (ObjectId(0), ObjectId(1));
        let mut s = State::new();
        post(&mut s, 0, 10);
        let low = start(&mut s);
        assert_eq!(s.try_lock(a), Ok(LockStep::Acquired));

        post(&mut s, 1, 5);
        start(&mut s);
        assert_eq!(s.try_lock(b), Ok(LockStep::Acquired));
        assert_eq!(
            s.try_lock(a),
            Ok(LockStep::Wait(NextContext::Switch(low)))
        );
        assert_eq!(s.try_lock(b), Err(Fatal::Deadlock));
    }

    #[test]
    fn helping_follows_chain_to_innermost_owner() {
        let (a, b) = (ObjectId(0), ObjectId(1));
        let mut s = State::new();
        post(&mut s, 0, 30);
        let low = start(&mut s);
        assert_eq!(s.try_lock(a), Ok(LockStep::Acquired));

        post(&mut s, 1, 20);
        let mid = start(&mut s);
        assert_eq!(s.try_lock(b), Ok(LockStep::Acquired));
        assert_eq!(
            s.try_lock(a),
            Ok(LockStep::Wait(NextContext::Switch(low)))
        );

        // Arrives while `low` runs on behalf of `mid`, and wants what `mid`
        // holds. `mid` can't make progress, so `low` runs again.
        post(&mut s, 2, 10);
        let high = start(&mut s);
        assert_eq!(
            s.try_lock(b),
            Ok(LockStep::Wait(NextContext::Switch(low)))
        );
        assert_eq!(s.thread_state(high), ThreadState::Blocked(b));
        assert_eq!(s.thread_state(mid), ThreadState::Blocked(a));

        assert_eq!(s.unlock(a), Ok(NextContext::Switch(mid)));
        assert_eq!(s.try_lock(a), Ok(LockStep::Acquired));
        assert_eq!(s.unlock(a), Ok(NextContext::Same));
        assert_eq!(s.unlock(b), Ok(NextContext::Switch(high)));
        assert_eq!(s.try_lock(b), Ok(LockStep::Acquired));

        let unblocked: Vec<_> = s
            .trace
            .events()
            .filter(|e| matches!(e, Event::Unblocked { .. }))
            .collect();
        assert_eq!(
            unblocked,
            [
                Event::Unblocked { context: mid, on: a },
                Event::Unblocked {
                    context: high,
                    on: b
                },
            ]
        );
        s.check().unwrap();
    }

    #[test]
    fn second_waiter_displaces_first() {
        let obj = ObjectId(0);
        let mut s = State::new();
        post(&mut s, 0, 30);
        let owner = start(&mut s);
        assert_eq!(s.try_lock(obj), Ok(LockStep::Acquired));

        post(&mut s, 1, 20);
        let first = start(&mut s);
        assert_eq!(
            s.try_lock(obj),
            Ok(LockStep::Wait(NextContext::Switch(owner)))
        );

        post(&mut s, 2, 10);
        let second = start(&mut s);
        assert_eq!(
            s.try_lock(obj),
            Ok(LockStep::Wait(NextContext::Switch(owner)))
        );
        assert!(s
            .trace
            .events()
            .any(|e| e == Event::Displaced { context: first, on: obj }));

        // The owner releases to the newest waiter only. When it retries it
        // takes the lock, and the displaced waiter is free to try again.
        assert_eq!(s.unlock(obj), Ok(NextContext::Switch(second)));
        assert_eq!(s.thread_state(first), ThreadState::Blocked(obj));
        assert_eq!(s.try_lock(obj), Ok(LockStep::Acquired));
        assert_eq!(s.thread_state(first), ThreadState::Ready);
    }
}
